//! Recovery of an interrupted phase-2 session.
//!
//! Changed entries are committed in scan order, but unchanged entries are
//! copied the moment the comparator sees them, so the unchanged manifest can
//! run ahead of the changed one. The resume point is therefore the last
//! complete entry of the changed manifest; the unchanged manifest is cut
//! back to the same point and the scan restarts right after it.

use std::cmp::Ordering;
use std::fs::{self, OpenOptions};
use std::io::Cursor;
use std::path::Path;

use tracing::{debug, info, warn};

use stowage_types::error::{Result, StowageError};
use stowage_types::path_cmp;

use crate::config::SessionDirs;
use crate::manifest::list_segments;
use crate::manifest::record::{read_record, ReadOutcome, Record, RecordTag};

/// Where the kept part of a manifest ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestTail {
    pub last_path: Option<String>,
    /// Complete entries kept.
    pub entries: u64,
    /// Sig records in the last kept segment.
    pub sigs_in_last_segment: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryPoint {
    pub changed: ManifestTail,
    pub unchanged: ManifestTail,
}

impl RecoveryPoint {
    /// Scan entries at or before this path are already committed.
    pub fn resume_after(&self) -> Option<String> {
        self.changed.last_path.clone()
    }

    pub fn is_fresh(&self) -> bool {
        self.changed.entries == 0 && self.unchanged.entries == 0
    }
}

/// Cut both output manifests back to a consistent point.
pub fn recover(dirs: &SessionDirs) -> Result<RecoveryPoint> {
    let changed = truncate_manifest(&dirs.changed(), |_| true)?;
    let unchanged = match changed.last_path.as_deref() {
        Some(limit) => truncate_manifest(&dirs.unchanged(), |path| {
            path_cmp(path, limit) != Ordering::Greater
        })?,
        None => truncate_manifest(&dirs.unchanged(), |_| false)?,
    };
    let point = RecoveryPoint { changed, unchanged };
    if !point.is_fresh() {
        info!(
            resume_after = ?point.resume_after(),
            changed_entries = point.changed.entries,
            unchanged_entries = point.unchanged.entries,
            "resuming interrupted session"
        );
    }
    Ok(point)
}

/// A record boundary after a complete entry.
#[derive(Debug, Clone, Copy)]
struct Boundary {
    /// Position in the segment list.
    segment: usize,
    offset: u64,
    sigs: u64,
}

/// Keep the longest prefix of complete entries whose paths satisfy `keep`,
/// and delete everything after it.
pub fn truncate_manifest(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<ManifestTail> {
    let segments = list_segments(dir)?;
    let mut tail = ManifestTail::default();
    let mut boundary: Option<Boundary> = None;
    // Header of the entry being read and whether its data records are still due.
    let mut open_entry: Option<(String, bool)> = None;

    'segments: for (pos, (_, path)) in segments.iter().enumerate() {
        let bytes = fs::read(path).map_err(|e| StowageError::io_at(path, e))?;
        let mut src = Cursor::new(bytes.as_slice());
        let mut sigs = 0u64;
        loop {
            let raw = match read_record(&mut src).map_err(|e| StowageError::io_at(path, e))? {
                ReadOutcome::Record(raw) => raw,
                ReadOutcome::Eof => break,
                ReadOutcome::Truncated => {
                    warn!(segment = %path.display(), "dropping partial record");
                    break 'segments;
                }
                ReadOutcome::Malformed(reason) => {
                    warn!(segment = %path.display(), %reason, "dropping unreadable tail");
                    break 'segments;
                }
            };

            let completes = match raw.tag {
                RecordTag::Header => {
                    let Record::Header(header) = Record::decode(&raw)? else {
                        break 'segments;
                    };
                    if !keep(&header.path) {
                        break 'segments;
                    }
                    let has_data = header.carries_data();
                    open_entry = Some((header.path, has_data));
                    !has_data
                }
                RecordTag::Sig => {
                    sigs += 1;
                    false
                }
                RecordTag::EndFile => open_entry.as_ref().is_some_and(|(_, data)| *data),
            };
            if completes {
                if let Some((path, _)) = open_entry.take() {
                    tail.last_path = Some(path);
                    tail.entries += 1;
                    boundary = Some(Boundary {
                        segment: pos,
                        offset: src.position(),
                        sigs,
                    });
                }
            }
        }
    }

    cut(&segments, boundary)?;
    if let Some(b) = boundary {
        tail.sigs_in_last_segment = b.sigs;
    }
    debug!(dir = %dir.display(), ?tail, "manifest recovered");
    Ok(tail)
}

fn cut(segments: &[(u64, std::path::PathBuf)], boundary: Option<Boundary>) -> Result<()> {
    let first_removed = match boundary {
        Some(b) => {
            let (_, path) = &segments[b.segment];
            let len = fs::metadata(path)
                .map_err(|e| StowageError::io_at(path, e))?
                .len();
            if len > b.offset {
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| StowageError::io_at(path, e))?;
                file.set_len(b.offset)
                    .map_err(|e| StowageError::io_at(path, e))?;
                file.sync_all().map_err(|e| StowageError::io_at(path, e))?;
                debug!(segment = %path.display(), from = len, to = b.offset, "truncated segment");
            }
            b.segment + 1
        }
        None => 0,
    };
    for (_, path) in segments.iter().skip(first_removed) {
        fs::remove_file(path).map_err(|e| StowageError::io_at(path, e))?;
        debug!(segment = %path.display(), "removed uncommitted segment");
    }
    Ok(())
}

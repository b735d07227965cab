//! Segmented manifests.
//!
//! A manifest is a directory of numbered segment files (`00000000`,
//! `00000001`, ...). Read in order, the segments form one stream of records:
//! a header per entry, then for entries with data one sig record per block
//! and an end-of-file record. A segment holds a bounded number of sig
//! records, which lets the champ chooser start deduplicating against a
//! finished segment while the session is still writing the next one.

pub mod reader;
pub mod record;
pub mod writer;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use stowage_types::error::{Result, StowageError};
use stowage_types::{Attribs, EntryKind};

pub use reader::SegmentReader;
pub use record::{RawRecord, Record, RecordTag};
pub use writer::SegmentWriter;

/// Per-entry header record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub path: String,
    pub kind: EntryKind,
    pub attribs: Attribs,
}

impl FileHeader {
    /// Whether the entry's content is stored as blocks.
    pub fn carries_data(&self) -> bool {
        self.kind.carries_data()
    }
}

pub fn segment_name(number: u64) -> String {
    format!("{number:08}")
}

fn parse_segment_name(name: &str) -> Option<u64> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Segment files of the manifest at `dir`, in read order. A missing
/// directory is an empty manifest.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StowageError::io_at(dir, e)),
    };
    let mut segments = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| StowageError::io_at(dir, e))?;
        let name = entry.file_name();
        if let Some(number) = name.to_str().and_then(parse_segment_name) {
            segments.push((number, entry.path()));
        }
    }
    segments.sort_by_key(|(number, _)| *number);
    Ok(segments)
}

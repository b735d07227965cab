//! Fan-out block store.
//!
//! Blocks that the dedup index has never seen are appended to data files laid
//! out as `<root>/PPPP/SSSS/TTTT`. Each data file holds up to
//! `blocks_per_data_file` blocks addressed by a 16-bit slot, so a block's
//! [`SavePath`] is the data file plus the slot.
//!
//! A data file is *outstanding* from the moment its first slot is allocated
//! until it is full and every allocated slot has been written. While it is
//! outstanding a `TTTT.lock` marker sits next to it. A failed session
//! releases its markers on the way out; markers found on [`BlockStore::open`]
//! mean the process died mid-write.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use stowage_types::error::{Result, StowageError};
use stowage_types::SavePath;

use crate::config::Phase2Config;

const LOCK_SUFFIX: &str = "lock";
/// `[slot u16 BE][len u32 BE]` before each stored payload.
const RECORD_HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DataFileId {
    prim: u16,
    seco: u16,
    tert: u16,
}

impl DataFileId {
    const FIRST: DataFileId = DataFileId {
        prim: 0,
        seco: 0,
        tert: 0,
    };

    /// Next data file in fan-out order, or `None` once every level is full.
    fn successor(self, max: u32) -> Option<Self> {
        let bump = |v: u16| -> Option<u16> {
            let next = v as u32 + 1;
            (next < max).then_some(next as u16)
        };
        if let Some(tert) = bump(self.tert) {
            return Some(Self { tert, ..self });
        }
        if let Some(seco) = bump(self.seco) {
            return Some(Self { seco, tert: 0, ..self });
        }
        bump(self.prim).map(|prim| Self {
            prim,
            seco: 0,
            tert: 0,
        })
    }

    fn slot(self, sig: u16) -> SavePath {
        SavePath::new(self.prim, self.seco, self.tert, sig)
    }

    fn of(path: &SavePath) -> Self {
        Self {
            prim: path.prim,
            seco: path.seco,
            tert: path.tert,
        }
    }

    fn relative(self) -> PathBuf {
        self.slot(0).data_file()
    }
}

/// A data file that still has unallocated or unwritten slots.
struct OutstandingFile {
    id: DataFileId,
    data_path: PathBuf,
    lock_path: PathBuf,
    file: File,
    allocated: u32,
    unwritten: BTreeSet<u16>,
}

pub struct BlockStore {
    root: PathBuf,
    max_subdirs: u32,
    blocks_per_file: u32,
    /// Next data file to open; `None` when the fan-out is exhausted.
    next_file: Option<DataFileId>,
    outstanding: Vec<OutstandingFile>,
}

fn hex_component(name: &str) -> Option<u16> {
    if name.len() != 4 {
        return None;
    }
    u16::from_str_radix(name, 16).ok()
}

impl BlockStore {
    /// Open the store rooted at `root`, resuming after whatever a previous
    /// session left behind.
    ///
    /// Allocation never appends to an existing data file: it continues with
    /// the data file after the highest one on disk. Every stale lock marker
    /// left by a crash is removed, since nothing will write to its data file
    /// again.
    pub fn open(root: &Path, config: &Phase2Config) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| StowageError::io_at(root, e))?;

        let mut highest: Option<DataFileId> = None;
        let mut stale_locks = Vec::new();
        for entry in WalkDir::new(root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                StowageError::io_at(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == LOCK_SUFFIX) {
                stale_locks.push(path.to_path_buf());
                continue;
            }
            let Some(id) = Self::parse_data_file(root, path) else {
                continue;
            };
            highest = Some(highest.map_or(id, |h| h.max(id)));
        }

        for lock in &stale_locks {
            warn!(
                lock = %lock.display(),
                stale = stale_locks.len(),
                "releasing stale data file lock from interrupted session"
            );
            fs::remove_file(lock).map_err(|e| StowageError::io_at(lock, e))?;
        }

        let next_file = match highest {
            Some(id) => id.successor(config.max_storage_subdirs),
            None => Some(DataFileId::FIRST),
        };
        debug!(root = %root.display(), ?highest, ?next_file, "block store opened");

        Ok(Self {
            root: root.to_path_buf(),
            max_subdirs: config.max_storage_subdirs,
            blocks_per_file: config.blocks_per_data_file,
            next_file,
            outstanding: Vec::new(),
        })
    }

    fn parse_data_file(root: &Path, path: &Path) -> Option<DataFileId> {
        let rel = path.strip_prefix(root).ok()?;
        let mut parts = rel.iter().map(|c| c.to_str().and_then(hex_component));
        let prim = parts.next()??;
        let seco = parts.next()??;
        let tert = parts.next()??;
        Some(DataFileId { prim, seco, tert })
    }

    /// Reserve the next save path for a block that must be fetched from the client.
    pub fn allocate(&mut self) -> Result<SavePath> {
        let needs_file = self
            .outstanding
            .last()
            .map_or(true, |f| f.allocated >= self.blocks_per_file);
        if needs_file {
            self.open_next_file()?;
        }
        let current = self
            .outstanding
            .last_mut()
            .ok_or_else(|| StowageError::Invariant("no data file open after allocation".into()))?;
        let sig = current.allocated as u16;
        current.allocated += 1;
        current.unwritten.insert(sig);
        Ok(current.id.slot(sig))
    }

    fn open_next_file(&mut self) -> Result<()> {
        let id = self.next_file.ok_or_else(|| {
            StowageError::FanOutExhausted(format!(
                "all {0}x{0}x{0} data files under {1} are in use",
                self.max_subdirs,
                self.root.display()
            ))
        })?;
        let data_path = self.root.join(id.relative());
        let lock_path = data_path.with_extension(LOCK_SUFFIX);
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StowageError::io_at(parent, e))?;
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| StowageError::io_at(&lock_path, e))?;
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&data_path)
            .map_err(|e| StowageError::io_at(&data_path, e))?;
        debug!(data_file = %data_path.display(), "opened data file");

        self.next_file = id.successor(self.max_subdirs);
        self.outstanding.push(OutstandingFile {
            id,
            data_path,
            lock_path,
            file,
            allocated: 0,
            unwritten: BTreeSet::new(),
        });
        Ok(())
    }

    /// Append a fetched payload to the slot reserved for it.
    pub fn write_block(&mut self, path: &SavePath, payload: &[u8]) -> Result<()> {
        let id = DataFileId::of(path);
        let pos = self
            .outstanding
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| {
                StowageError::Invariant(format!("write to {path} without an outstanding allocation"))
            })?;
        let file = &mut self.outstanding[pos];
        if !file.unwritten.remove(&path.sig) {
            return Err(StowageError::Invariant(format!(
                "block {path} written twice or never allocated"
            )));
        }
        let len = u32::try_from(payload.len()).map_err(|_| {
            StowageError::Protocol(format!("block payload of {} bytes is too large", payload.len()))
        })?;
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.extend_from_slice(&path.sig.to_be_bytes());
        record.extend_from_slice(&len.to_be_bytes());
        record.extend_from_slice(payload);
        file.file
            .write_all(&record)
            .map_err(|e| StowageError::io_at(&file.data_path, e))?;

        if file.allocated >= self.blocks_per_file && file.unwritten.is_empty() {
            let done = self.outstanding.remove(pos);
            Self::release(done)?;
        }
        Ok(())
    }

    fn release(file: OutstandingFile) -> Result<()> {
        file.file
            .sync_all()
            .map_err(|e| StowageError::io_at(&file.data_path, e))?;
        fs::remove_file(&file.lock_path).map_err(|e| StowageError::io_at(&file.lock_path, e))?;
        debug!(
            data_file = %file.data_path.display(),
            blocks = file.allocated,
            "released data file"
        );
        Ok(())
    }

    /// Number of data files allocated from but not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Release every outstanding data file at the end of a session.
    ///
    /// Only the data file being filled when the session ended may still be
    /// outstanding. A second one means allocated blocks were never written.
    pub fn release_all(&mut self) -> Result<()> {
        if self.outstanding.len() > 1 {
            let files: Vec<String> = self
                .outstanding
                .iter()
                .map(|f| f.data_path.display().to_string())
                .collect();
            return Err(StowageError::Invariant(format!(
                "{} data files still outstanding at shutdown: {}",
                files.len(),
                files.join(", ")
            )));
        }
        for file in self.outstanding.drain(..) {
            if !file.unwritten.is_empty() {
                warn!(
                    data_file = %file.data_path.display(),
                    slots = file.unwritten.len(),
                    "reclaiming allocated slots that were never written"
                );
            }
            Self::release(file)?;
        }
        Ok(())
    }

    /// Release every outstanding data file of a session that is failing.
    ///
    /// Unwritten slots are given up; their data files are never appended to
    /// again. Errors are logged rather than returned so the original failure
    /// propagates.
    pub fn abandon(&mut self) {
        for file in self.outstanding.drain(..) {
            warn!(
                data_file = %file.data_path.display(),
                unwritten = file.unwritten.len(),
                "releasing data file of failed session"
            );
            let lock_path = file.lock_path.clone();
            if let Err(e) = Self::release(file) {
                warn!(lock = %lock_path.display(), error = %e, "could not release data file lock");
            }
        }
    }

    /// Read a stored payload back.
    pub fn read_block(&self, path: &SavePath) -> Result<Option<Vec<u8>>> {
        let data_path = self.root.join(path.data_file());
        let mut buf = Vec::new();
        match File::open(&data_path) {
            Ok(mut f) => f
                .read_to_end(&mut buf)
                .map_err(|e| StowageError::io_at(&data_path, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StowageError::io_at(&data_path, e)),
        };
        let mut pos = 0;
        while pos + RECORD_HEADER_LEN <= buf.len() {
            let sig = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let len =
                u32::from_be_bytes([buf[pos + 2], buf[pos + 3], buf[pos + 4], buf[pos + 5]]) as usize;
            let start = pos + RECORD_HEADER_LEN;
            let end = start + len;
            if end > buf.len() {
                return Err(StowageError::CorruptData {
                    path: data_path,
                    reason: format!("truncated block record at offset {pos}"),
                });
            }
            if sig == path.sig {
                return Ok(Some(buf[start..end].to_vec()));
            }
            pos = end;
        }
        Ok(None)
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        // Only reached with outstanding files when a session was torn down
        // without `release_all` or `abandon`; `open` clears the markers.
        for file in &self.outstanding {
            debug!(data_file = %file.data_path.display(), "leaving data file locked");
        }
    }
}

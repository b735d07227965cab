use std::cmp::Ordering;
use std::path::Path;

use tracing::debug;

use stowage_types::error::Result;
use stowage_types::path_cmp;

use crate::manifest::{FileHeader, SegmentReader};

/// The phase-1 scan manifest, read one header at a time.
pub struct ScanSource {
    reader: Option<SegmentReader>,
    /// Entries at or before this path were committed by an interrupted session.
    resume_after: Option<String>,
    read: u64,
}

impl ScanSource {
    pub fn open(dir: &Path, resume_after: Option<String>) -> Result<Self> {
        Ok(Self {
            reader: Some(SegmentReader::open(dir)?),
            resume_after,
            read: 0,
        })
    }

    pub fn is_exhausted(&self) -> bool {
        self.reader.is_none()
    }

    /// Entries handed out so far.
    pub fn entries_read(&self) -> u64 {
        self.read
    }

    pub fn next_header(&mut self) -> Result<Option<FileHeader>> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            let Some(header) = reader.next_entry()? else {
                debug!(entries = self.read, "scan manifest exhausted");
                self.reader = None;
                return Ok(None);
            };
            if let Some(last) = self.resume_after.as_deref() {
                if path_cmp(&header.path, last) != Ordering::Greater {
                    continue;
                }
                debug!(path = %header.path, "resuming after previously committed entries");
                self.resume_after = None;
            }
            self.read += 1;
            return Ok(Some(header));
        }
    }
}

use std::cmp::Ordering;

use tracing::{debug, trace};

use stowage_types::error::Result;
use stowage_types::path_cmp;

use crate::config::MetadataChangePolicy;
use crate::manifest::{FileHeader, SegmentReader, SegmentWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Same entry as last time; already copied to the unchanged manifest.
    Unchanged,
    /// Present last time but modified.
    Changed,
    /// Not in the previous manifest at all.
    New,
}

/// Merges the phase-1 scan with the previous backup's manifest, in path order.
pub struct ManifestScanComparator {
    previous: Option<SegmentReader>,
    /// Previous-manifest entry the reader is positioned inside.
    cursor: Option<FileHeader>,
    policy: MetadataChangePolicy,
}

impl ManifestScanComparator {
    /// `previous` is `None` on a client's first backup.
    pub fn new(previous: Option<SegmentReader>, policy: MetadataChangePolicy) -> Self {
        Self {
            previous,
            cursor: None,
            policy,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.previous.is_none()
    }

    /// Classify one scan entry. Unchanged entries are written to `unchanged`
    /// together with their previous block records before this returns.
    pub fn classify(
        &mut self,
        scan: &FileHeader,
        unchanged: &mut SegmentWriter,
    ) -> Result<Classification> {
        loop {
            let Some(previous) = self.previous.as_mut() else {
                return Ok(Classification::New);
            };
            let current = match self.cursor.take() {
                Some(header) => header,
                None => match previous.next_entry()? {
                    Some(header) => header,
                    None => {
                        debug!("previous manifest exhausted");
                        self.previous = None;
                        return Ok(Classification::New);
                    }
                },
            };

            match path_cmp(&scan.path, &current.path) {
                Ordering::Less => {
                    self.cursor = Some(current);
                    return Ok(Classification::New);
                }
                Ordering::Greater => {
                    let skipped = previous.skip_entry_records()?;
                    trace!(path = %current.path, skipped, "entry removed since previous backup");
                }
                Ordering::Equal => {
                    if Self::data_unchanged(self.policy, scan, &current) {
                        unchanged.write_header(scan)?;
                        while let Some(raw) = previous.next_entry_record()? {
                            unchanged.write_raw(&raw)?;
                        }
                        return Ok(Classification::Unchanged);
                    }
                    previous.skip_entry_records()?;
                    return Ok(Classification::Changed);
                }
            }
        }
    }

    fn data_unchanged(
        policy: MetadataChangePolicy,
        scan: &FileHeader,
        previous: &FileHeader,
    ) -> bool {
        if scan.kind != previous.kind || scan.attribs.mtime != previous.attribs.mtime {
            return false;
        }
        if scan.attribs.ctime == previous.attribs.ctime {
            return true;
        }
        match policy {
            MetadataChangePolicy::ReuseData => {
                trace!(path = %scan.path, "ctime changed, reusing previous data");
                true
            }
            MetadataChangePolicy::Refetch => false,
        }
    }
}

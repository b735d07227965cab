use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use stowage_types::error::{Result, StowageError};

use super::list_segments;
use super::record::{read_record, RawRecord, ReadOutcome, Record, RecordTag};
use super::FileHeader;

/// Sequential reader over every segment of a manifest, with one record of
/// lookahead.
pub struct SegmentReader {
    dir: PathBuf,
    pending: VecDeque<PathBuf>,
    current: Option<(PathBuf, BufReader<File>)>,
    peeked: Option<RawRecord>,
    exhausted: bool,
}

impl SegmentReader {
    /// Open the manifest at `dir`. A missing directory reads as empty.
    pub fn open(dir: &Path) -> Result<Self> {
        let pending = list_segments(dir)?.into_iter().map(|(_, p)| p).collect();
        Ok(Self {
            dir: dir.to_path_buf(),
            pending,
            current: None,
            peeked: None,
            exhausted: false,
        })
    }

    fn pull(&mut self) -> Result<Option<RawRecord>> {
        loop {
            if self.current.is_none() {
                let Some(path) = self.pending.pop_front() else {
                    self.exhausted = true;
                    return Ok(None);
                };
                let file = File::open(&path).map_err(|e| StowageError::io_at(&path, e))?;
                self.current = Some((path, BufReader::new(file)));
            }
            let Some((path, src)) = self.current.as_mut() else {
                continue;
            };
            match read_record(src).map_err(|e| StowageError::io_at(path.as_path(), e))? {
                ReadOutcome::Record(record) => return Ok(Some(record)),
                ReadOutcome::Eof => self.current = None,
                ReadOutcome::Truncated => {
                    return Err(StowageError::InvalidManifest {
                        path: path.clone(),
                        reason: "segment ends inside a record".into(),
                    })
                }
                ReadOutcome::Malformed(reason) => {
                    return Err(StowageError::InvalidManifest {
                        path: path.clone(),
                        reason,
                    })
                }
            }
        }
    }

    pub fn peek(&mut self) -> Result<Option<&RawRecord>> {
        if self.peeked.is_none() && !self.exhausted {
            self.peeked = self.pull()?;
        }
        Ok(self.peeked.as_ref())
    }

    pub fn next_raw(&mut self) -> Result<Option<RawRecord>> {
        if let Some(record) = self.peeked.take() {
            return Ok(Some(record));
        }
        if self.exhausted {
            return Ok(None);
        }
        self.pull()
    }

    /// Advance to the next entry header, discarding any block records
    /// left over from the previous entry.
    pub fn next_entry(&mut self) -> Result<Option<FileHeader>> {
        while let Some(raw) = self.next_raw()? {
            if raw.tag == RecordTag::Header {
                return match Record::decode(&raw)? {
                    Record::Header(header) => Ok(Some(header)),
                    _ => Err(self.malformed("header tag without a header")),
                };
            }
        }
        Ok(None)
    }

    /// Next sig or end-of-file record of the current entry, or `None` at
    /// the next header or the end of the manifest.
    pub fn next_entry_record(&mut self) -> Result<Option<RawRecord>> {
        match self.peek()? {
            Some(raw) if raw.tag != RecordTag::Header => self.next_raw(),
            _ => Ok(None),
        }
    }

    /// Discard the current entry's remaining block records.
    pub fn skip_entry_records(&mut self) -> Result<u64> {
        let mut skipped = 0;
        while self.next_entry_record()?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }

    /// True once every segment is consumed.
    pub fn is_exhausted(&mut self) -> Result<bool> {
        Ok(self.peek()?.is_none())
    }

    fn malformed(&self, reason: &str) -> StowageError {
        let path = self
            .current
            .as_ref()
            .map_or_else(|| self.dir.clone(), |(p, _)| p.clone());
        StowageError::InvalidManifest {
            path,
            reason: reason.to_string(),
        }
    }
}

impl Iterator for SegmentReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_raw() {
            Ok(Some(raw)) => Some(Record::decode(&raw)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

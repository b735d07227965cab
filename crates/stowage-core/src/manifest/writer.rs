use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use stowage_types::error::{Result, StowageError};
use stowage_types::{SavePath, Signature};

use super::record::{RawRecord, Record, RecordTag};
use super::{list_segments, segment_name};

/// Append-only writer for one manifest directory.
pub struct SegmentWriter {
    dir: PathBuf,
    sigs_per_segment: u64,
    segment: u64,
    /// Open lazily so a rollover never leaves an empty trailing segment.
    out: Option<BufWriter<File>>,
    sig_count: u64,
    records: u64,
}

impl SegmentWriter {
    /// Start a fresh manifest in `dir`.
    pub fn create(dir: &Path, sigs_per_segment: u64) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| StowageError::io_at(dir, e))?;
        if !list_segments(dir)?.is_empty() {
            return Err(StowageError::InvalidManifest {
                path: dir.to_path_buf(),
                reason: "manifest directory already has segments".into(),
            });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            sigs_per_segment,
            segment: 0,
            out: None,
            sig_count: 0,
            records: 0,
        })
    }

    /// Continue a manifest left by an interrupted session. The caller has
    /// already cut it back to a record boundary.
    pub fn append(dir: &Path, sigs_per_segment: u64, sigs_in_last_segment: u64) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| StowageError::io_at(dir, e))?;
        let segments = list_segments(dir)?;
        let Some((last, _)) = segments.last() else {
            return Self::create(dir, sigs_per_segment);
        };
        let mut writer = Self {
            dir: dir.to_path_buf(),
            sigs_per_segment,
            segment: *last,
            out: None,
            sig_count: sigs_in_last_segment,
            records: 0,
        };
        if sigs_in_last_segment >= sigs_per_segment {
            writer.segment += 1;
            writer.sig_count = 0;
        }
        debug!(dir = %dir.display(), segment = writer.segment, "appending to manifest");
        Ok(writer)
    }

    /// Sig records in the segment currently being written.
    pub fn sig_count(&self) -> u64 {
        self.sig_count
    }

    /// Records written through this writer.
    pub fn records_written(&self) -> u64 {
        self.records
    }

    fn segment_path(&self) -> PathBuf {
        self.dir.join(segment_name(self.segment))
    }

    fn out(&mut self) -> Result<&mut BufWriter<File>> {
        if self.out.is_none() {
            let path = self.segment_path();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StowageError::io_at(&path, e))?;
            self.out = Some(BufWriter::new(file));
        }
        self.out
            .as_mut()
            .ok_or_else(|| StowageError::Invariant("manifest segment not open".into()))
    }

    /// Write one record. Returns the path of the segment it completed, if any.
    pub fn write_raw(&mut self, record: &RawRecord) -> Result<Option<PathBuf>> {
        let path = self.segment_path();
        record
            .write_to(self.out()?)
            .map_err(|e| StowageError::io_at(&path, e))?;
        self.records += 1;
        if record.tag != RecordTag::Sig {
            return Ok(None);
        }
        self.sig_count += 1;
        if self.sig_count < self.sigs_per_segment {
            return Ok(None);
        }
        self.finish_segment()?;
        debug!(segment = %path.display(), "manifest segment complete");
        self.segment += 1;
        self.sig_count = 0;
        Ok(Some(path))
    }

    pub fn write(&mut self, record: &Record) -> Result<Option<PathBuf>> {
        self.write_raw(&record.encode()?)
    }

    pub fn write_header(&mut self, header: &super::FileHeader) -> Result<()> {
        self.write(&Record::Header(header.clone())).map(|_| ())
    }

    pub fn write_sig(&mut self, signature: Signature, save_path: SavePath) -> Result<Option<PathBuf>> {
        self.write(&Record::Sig {
            signature,
            save_path,
        })
    }

    pub fn write_end_file(&mut self) -> Result<()> {
        self.write(&Record::EndFile).map(|_| ())
    }

    fn finish_segment(&mut self) -> Result<()> {
        let path = self.segment_path();
        if let Some(mut out) = self.out.take() {
            out.flush().map_err(|e| StowageError::io_at(&path, e))?;
            out.get_ref()
                .sync_all()
                .map_err(|e| StowageError::io_at(&path, e))?;
        }
        Ok(())
    }

    /// Flush and sync the segment being written.
    pub fn close(mut self) -> Result<()> {
        self.finish_segment()
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        // Best effort for an aborted session; resume truncates partial records.
        if let Some(out) = self.out.as_mut() {
            let _ = out.flush();
        }
    }
}

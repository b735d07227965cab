//! Bounded queue of changed entries awaiting their blocks.
//!
//! Entries are numbered with a queue sequence as they are appended. Cursors
//! into the queue are sequence numbers; a cursor equal to the next unassigned
//! sequence has fallen off the end and picks up the next appended entry.

use std::collections::VecDeque;

use stowage_types::error::{Result, StowageError};
use stowage_types::{Attribs, EntryKind};

use crate::manifest::FileHeader;

/// Contiguous run of block indices owned by one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// Oldest block not yet committed.
    pub start: u64,
    /// One past the last block; `None` while the client may still send signatures.
    pub end: Option<u64>,
}

impl BlockRange {
    pub fn is_closed(&self) -> bool {
        self.end.is_some()
    }

    pub fn is_drained(&self) -> bool {
        self.end == Some(self.start)
    }
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub seq: u64,
    pub path: String,
    pub kind: EntryKind,
    pub attribs: Attribs,
    pub need_data: bool,
    pub sent_path: bool,
    pub header_written: bool,
    /// Run-local file number, assigned when the path is announced.
    pub file_no: Option<u64>,
    /// Set once the client's fresh attributes arrive.
    pub range: Option<BlockRange>,
    /// Next block of this entry to consider for a data request.
    pub next_request: u64,
    /// The client skipped this entry; it is retired without being written.
    pub abandoned: bool,
}

impl FileEntry {
    pub fn new(header: FileHeader, need_data: bool) -> Self {
        Self {
            seq: 0,
            path: header.path,
            kind: header.kind,
            attribs: header.attribs,
            need_data,
            sent_path: false,
            header_written: false,
            file_no: None,
            range: None,
            next_request: 0,
            abandoned: false,
        }
    }

    pub fn header(&self) -> FileHeader {
        FileHeader {
            path: self.path.clone(),
            kind: self.kind,
            attribs: self.attribs.clone(),
        }
    }

    /// Waiting on signatures the client has not sent (yet).
    pub fn awaiting_sigs(&self) -> bool {
        self.need_data && !self.abandoned && self.range.is_none()
    }

    /// The client can send no further signatures for this entry.
    fn sigs_settled(&self) -> bool {
        !self.need_data || self.abandoned || self.range.is_some_and(|r| r.is_closed())
    }
}

#[derive(Debug, Default)]
pub struct FileEntryQueue {
    entries: VecDeque<FileEntry>,
    next_seq: u64,
    /// Next entry to consider for a path announcement.
    path_cursor: u64,
    /// Entry the client's signatures are currently being appended to.
    sig_cursor: u64,
    /// Next entry to walk for block data requests.
    request_cursor: u64,
}

impl FileEntryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence of the oldest queued entry, or the next sequence when empty.
    pub fn head_seq(&self) -> u64 {
        self.entries.front().map_or(self.next_seq, |e| e.seq)
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Sequence distance from the oldest queued entry to the end of the queue.
    pub fn span(&self) -> u64 {
        self.next_seq - self.head_seq()
    }

    /// No queued file follows the oldest one still taking signatures.
    ///
    /// That file's range only closes when the attributes of a later file
    /// arrive, so the scan has to queue one even past the window.
    pub fn needs_successor(&self) -> bool {
        let mut unsettled = self
            .entries
            .iter()
            .filter(|e| e.need_data)
            .skip_while(|e| e.sigs_settled());
        unsettled.next().is_some() && unsettled.next().is_none()
    }

    pub fn push(&mut self, mut entry: FileEntry) -> u64 {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        let seq = entry.seq;
        self.entries.push_back(entry);
        seq
    }

    pub fn get(&self, seq: u64) -> Option<&FileEntry> {
        let head = self.head_seq();
        if seq < head {
            return None;
        }
        self.entries.get((seq - head) as usize)
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut FileEntry> {
        let head = self.head_seq();
        if seq < head {
            return None;
        }
        self.entries.get_mut((seq - head) as usize)
    }

    pub fn front(&self) -> Option<&FileEntry> {
        self.entries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut FileEntry> {
        self.entries.front_mut()
    }

    /// Retire the head entry and move every cursor that pointed at it.
    pub fn pop_front(&mut self) -> Result<FileEntry> {
        let entry = self
            .entries
            .pop_front()
            .ok_or_else(|| StowageError::Invariant("retiring from an empty entry queue".into()))?;
        let head = self.head_seq();
        for cursor in [
            &mut self.path_cursor,
            &mut self.sig_cursor,
            &mut self.request_cursor,
        ] {
            if *cursor < head {
                *cursor = head;
            }
        }
        Ok(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter()
    }

    // ── Cursors ────────────────────────────────────────────────────────

    pub fn path_cursor(&self) -> u64 {
        self.path_cursor
    }

    pub fn set_path_cursor(&mut self, seq: u64) {
        self.path_cursor = seq;
    }

    pub fn sig_cursor(&self) -> u64 {
        self.sig_cursor
    }

    pub fn set_sig_cursor(&mut self, seq: u64) {
        self.sig_cursor = seq;
    }

    pub fn request_cursor(&self) -> u64 {
        self.request_cursor
    }

    pub fn set_request_cursor(&mut self, seq: u64) {
        self.request_cursor = seq;
    }

    /// Locate the announced entry carrying `file_no`, at or after the
    /// signature cursor.
    pub fn find_file_no(&self, file_no: u64) -> Option<u64> {
        let from = self.sig_cursor.max(self.head_seq());
        (from..self.next_seq).find(|&seq| {
            self.get(seq)
                .is_some_and(|e| e.file_no == Some(file_no))
        })
    }
}

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use tempfile::TempDir;

use stowage_protocol::{
    AppendResult, ChampRequest, ChampVerdict, ClientMessage, Frame, GenCommand, ServerMessage,
};
use stowage_types::error::{Result, StowageError};
use stowage_types::{Attribs, EntryKind, SavePath, Signature};

use crate::blocks::SavePathAllocator;
use crate::config::SessionDirs;
use crate::manifest::{FileHeader, Record, SegmentReader, SegmentWriter};

/// Idle `read_write` calls in a row before a session counts as stalled.
const STALL_LIMIT: usize = 64;

// ── Fixtures ───────────────────────────────────────────────────────────────

pub fn file(path: &str, mtime: i64) -> FileHeader {
    FileHeader {
        path: path.to_string(),
        kind: EntryKind::RegularFile,
        attribs: Attribs {
            mode: 0o100644,
            mtime,
            ctime: mtime,
            ..Attribs::default()
        },
    }
}

pub fn directory(path: &str, mtime: i64) -> FileHeader {
    FileHeader {
        path: path.to_string(),
        kind: EntryKind::Directory,
        attribs: Attribs {
            mode: 0o040755,
            mtime,
            ctime: mtime,
            ..Attribs::default()
        },
    }
}

/// Deterministic stand-in for the client's block fingerprinting.
pub fn sig_of(data: &[u8]) -> Signature {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    let mut checksum = [0u8; 16];
    checksum[..8].copy_from_slice(&hash.rotate_left(17).to_be_bytes());
    checksum[8..].copy_from_slice(&(data.len() as u64).to_be_bytes());
    Signature::new(hash | 1, checksum)
}

pub fn write_manifest(dir: &Path, sigs_per_segment: u64, records: &[Record]) {
    let mut writer = SegmentWriter::create(dir, sigs_per_segment).unwrap();
    for record in records {
        writer.write(record).unwrap();
    }
    writer.close().unwrap();
}

pub fn read_manifest(dir: &Path) -> Vec<Record> {
    SegmentReader::open(dir)
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap()
}

/// A session directory layout under a temp dir.
pub struct SessionFixture {
    _tmp: TempDir,
    pub dirs: SessionDirs,
}

impl SessionFixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = SessionDirs::new(tmp.path().join("session"), tmp.path().join("data"));
        Self { _tmp: tmp, dirs }
    }

    pub fn write_phase1(&self, headers: &[FileHeader]) {
        let records: Vec<Record> = headers.iter().cloned().map(Record::Header).collect();
        write_manifest(&self.dirs.phase1(), 4096, &records);
    }

    pub fn write_current(&self, records: &[Record]) {
        write_manifest(&self.dirs.current(), 4096, records);
    }
}

/// Save paths handed out in sequence, without touching disk.
#[derive(Default)]
pub struct CountingAllocator {
    pub next: u16,
}

impl SavePathAllocator for CountingAllocator {
    fn allocate(&mut self) -> Result<SavePath> {
        let path = SavePath::new(0, 0, 0, self.next);
        self.next += 1;
        Ok(path)
    }
}

// ── Fake client ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientFile {
    pub attribs: Attribs,
    pub blocks: Vec<Vec<u8>>,
    /// The file disappeared between scan and backup: announce nothing.
    pub vanished: bool,
}

/// Behaves like a well-mannered backup client: answers each path with
/// attributes and signatures, each data request with the payload, and walks
/// the end-of-session handshake.
#[derive(Default)]
pub struct FakeClient {
    pub files: BTreeMap<String, ClientFile>,
    outbox: VecDeque<ClientMessage>,
    next_file_no: u64,
    /// Payloads by client-side block index.
    sent_blocks: Vec<Vec<u8>>,
    pub received: Vec<ServerMessage>,
    pub data_requests: Vec<u64>,
    pub wrap_ups: Vec<u64>,
    /// Declare the backup complete right after `sigs_end`.
    pub end_early: bool,
    /// Send the attributes of skipped files after the next file's signatures.
    pub resend_skipped: bool,
    skipped: Vec<(u64, Attribs)>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            next_file_no: 1,
            ..Self::default()
        }
    }

    pub fn add_file(&mut self, path: &str, mtime: i64, blocks: &[&[u8]]) {
        let size = blocks.iter().map(|b| b.len() as u64).sum();
        self.files.insert(
            path.to_string(),
            ClientFile {
                attribs: Attribs {
                    mode: 0o100644,
                    size,
                    mtime,
                    ctime: mtime,
                    ..Attribs::default()
                },
                blocks: blocks.iter().map(|b| b.to_vec()).collect(),
                vanished: false,
            },
        );
    }

    pub fn vanish(&mut self, path: &str) {
        if let Some(f) = self.files.get_mut(path) {
            f.vanished = true;
        }
    }

    fn receive(&mut self, message: ServerMessage) -> Result<()> {
        self.received.push(message.clone());
        match message {
            ServerMessage::Path(path) => {
                let file_no = self.next_file_no;
                self.next_file_no += 1;
                let file = self.files.get(&path).cloned().ok_or_else(|| {
                    StowageError::Protocol(format!("fake client asked for unknown path {path}"))
                })?;
                if file.vanished {
                    self.outbox
                        .push_back(ClientMessage::Warning(format!("{path}: vanished")));
                    self.skipped.push((file_no, file.attribs.clone()));
                    return Ok(());
                }
                self.outbox.push_back(ClientMessage::AttribsSigs {
                    file_no,
                    attribs: file.attribs.clone(),
                });
                for block in &file.blocks {
                    self.outbox.push_back(ClientMessage::Sig(sig_of(block)));
                    self.sent_blocks.push(block.clone());
                }
                if self.resend_skipped {
                    for (file_no, attribs) in self.skipped.drain(..) {
                        self.outbox
                            .push_back(ClientMessage::AttribsSigs { file_no, attribs });
                    }
                }
            }
            ServerMessage::DataReq(index) => {
                self.data_requests.push(index);
                let payload = self.sent_blocks.get(index as usize).cloned().ok_or_else(|| {
                    StowageError::Protocol(format!("fake client asked for unknown block {index}"))
                })?;
                self.outbox.push_back(ClientMessage::Data(payload));
            }
            ServerMessage::WrapUp(index) => self.wrap_ups.push(index),
            ServerMessage::Gen(GenCommand::RequestsEnd) => {
                self.outbox.push_back(ClientMessage::Gen(GenCommand::SigsEnd));
                if self.end_early {
                    self.outbox.push_back(ClientMessage::Gen(GenCommand::BackupEnd));
                }
            }
            ServerMessage::Gen(GenCommand::BlkRequestsEnd) => {
                self.outbox.push_back(ClientMessage::Gen(GenCommand::BackupEnd));
            }
            ServerMessage::Gen(other) => {
                return Err(StowageError::Protocol(format!(
                    "fake client got '{}'",
                    other.as_str()
                )))
            }
        }
        Ok(())
    }
}

// ── Fake champ chooser ─────────────────────────────────────────────────────

/// Answers signatures from a fixed table of stored blocks. In lazy mode a
/// run of misses is reported only when the champ chooser goes idle or sees
/// `sigs_end`, which exercises the catch-up path.
#[derive(Default)]
pub struct FakeChamp {
    pub known: HashMap<Signature, SavePath>,
    pub lazy_misses: bool,
    next_index: u64,
    pending_miss: Option<u64>,
    outbox: VecDeque<ChampVerdict>,
    pub sigs: Vec<Signature>,
    pub manifests: Vec<String>,
    pub sigs_end: bool,
}

impl FakeChamp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn knows(&mut self, data: &[u8], save_path: SavePath) {
        self.known.insert(sig_of(data), save_path);
    }

    fn receive(&mut self, request: ChampRequest) -> Result<()> {
        match request {
            ChampRequest::Sig(signature) => {
                if self.sigs_end {
                    return Err(StowageError::Protocol("signature after sigs_end".into()));
                }
                let index = self.next_index;
                self.next_index += 1;
                self.sigs.push(signature);
                match self.known.get(&signature) {
                    Some(save_path) => {
                        // Earlier misses are implied by this verdict.
                        self.pending_miss = None;
                        self.outbox.push_back(ChampVerdict::Found {
                            index,
                            save_path: *save_path,
                        });
                    }
                    None if self.lazy_misses => self.pending_miss = Some(index),
                    None => self.outbox.push_back(ChampVerdict::NotFound { index }),
                }
            }
            ChampRequest::SigsEnd => {
                self.sigs_end = true;
                self.flush_misses();
            }
            ChampRequest::Manifest(path) => self.manifests.push(path),
        }
        Ok(())
    }

    fn flush_misses(&mut self) -> bool {
        match self.pending_miss.take() {
            Some(index) => {
                self.outbox.push_back(ChampVerdict::NotFound { index });
                true
            }
            None => false,
        }
    }
}

// ── Scripted multiplexer ───────────────────────────────────────────────────

/// In-memory [`Multiplexer`](crate::transport::Multiplexer) wiring the
/// session to a [`FakeClient`] and a [`FakeChamp`]. Frames pass through
/// the wire codec in both directions.
pub struct ScriptedPeers {
    pub client: FakeClient,
    pub champ: FakeChamp,
    to_client: Vec<Frame>,
    to_champ: Vec<Frame>,
    from_client: VecDeque<Frame>,
    from_champ: VecDeque<Frame>,
    /// Frames the client channel takes per `read_write` before BLOCKED.
    pub client_capacity: Option<usize>,
    /// Frames the champ channel takes per `read_write` before BLOCKED.
    pub champ_capacity: Option<usize>,
    pub blocked_appends: usize,
    /// Drop the connection once the client has seen this many data requests.
    pub reset_after_data_requests: Option<usize>,
    idle: usize,
}

fn through_wire(frame: &Frame) -> Result<Frame> {
    let bytes = frame.encode();
    let (decoded, used) = Frame::decode(&bytes)?
        .ok_or_else(|| StowageError::Protocol("frame did not survive encoding".into()))?;
    assert_eq!(used, bytes.len());
    Ok(decoded)
}

impl ScriptedPeers {
    pub fn new(client: FakeClient, champ: FakeChamp) -> Self {
        Self {
            client,
            champ,
            to_client: Vec::new(),
            to_champ: Vec::new(),
            from_client: VecDeque::new(),
            from_champ: VecDeque::new(),
            client_capacity: None,
            champ_capacity: None,
            blocked_appends: 0,
            reset_after_data_requests: None,
            idle: 0,
        }
    }

    fn append(
        buffer: &mut Vec<Frame>,
        capacity: Option<usize>,
        blocked: &mut usize,
        frame: &Frame,
    ) -> AppendResult {
        if capacity.is_some_and(|cap| buffer.len() >= cap) {
            *blocked += 1;
            return AppendResult::Blocked;
        }
        match through_wire(frame) {
            Ok(frame) => {
                buffer.push(frame);
                AppendResult::Ok
            }
            Err(_) => AppendResult::Error,
        }
    }
}

impl crate::transport::Multiplexer for ScriptedPeers {
    fn append_to_client(&mut self, frame: &Frame) -> AppendResult {
        Self::append(
            &mut self.to_client,
            self.client_capacity,
            &mut self.blocked_appends,
            frame,
        )
    }

    fn append_to_champ(&mut self, frame: &Frame) -> AppendResult {
        Self::append(
            &mut self.to_champ,
            self.champ_capacity,
            &mut self.blocked_appends,
            frame,
        )
    }

    fn read_write(&mut self) -> Result<()> {
        let mut progress = !self.to_client.is_empty() || !self.to_champ.is_empty();

        for frame in std::mem::take(&mut self.to_client) {
            self.client.receive(ServerMessage::from_frame(&frame)?)?;
        }
        for frame in std::mem::take(&mut self.to_champ) {
            self.champ.receive(ChampRequest::from_frame(&frame)?)?;
        }
        if self
            .reset_after_data_requests
            .is_some_and(|n| self.client.data_requests.len() >= n)
        {
            return Err(StowageError::Channel("connection reset".into()));
        }
        if !progress && self.champ.flush_misses() {
            progress = true;
        }

        while let Some(message) = self.client.outbox.pop_front() {
            self.from_client.push_back(through_wire(&message.to_frame()?)?);
            progress = true;
        }
        while let Some(verdict) = self.champ.outbox.pop_front() {
            self.from_champ.push_back(through_wire(&verdict.to_frame())?);
            progress = true;
        }

        if progress {
            self.idle = 0;
        } else {
            self.idle += 1;
            if self.idle > STALL_LIMIT {
                return Err(StowageError::Channel(format!(
                    "session stalled: {STALL_LIMIT} idle iterations"
                )));
            }
        }
        Ok(())
    }

    fn read_client(&mut self) -> Result<Option<Frame>> {
        Ok(self.from_client.pop_front())
    }

    fn read_champ(&mut self) -> Result<Option<Frame>> {
        Ok(self.from_champ.pop_front())
    }
}

//! Wire-format types for server ↔ client and server ↔ champ chooser traffic.
//!
//! This crate is intentionally minimal: frame tags, the frame codec, and the
//! typed messages each peer may send. No I/O, no session state.

mod messages;

pub use messages::{ChampRequest, ChampVerdict, ClientMessage, GenCommand, ServerMessage};

use stowage_types::error::{Result, StowageError};

// ── Frame format constants ─────────────────────────────────────────────────

/// Size of a frame header: one tag byte plus a big-endian u32 payload length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest payload accepted from a peer. Block payloads are bounded by the
/// client's chunker well below this.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Length of a block or file index on the wire.
pub const INDEX_LEN: usize = 8;

// ── Append result ──────────────────────────────────────────────────────────

/// Outcome of a non-blocking append to a peer's write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Frame accepted into the write buffer.
    Ok,
    /// Buffer full; retry the same frame later.
    Blocked,
    /// Channel is broken.
    Error,
}

// ── Frame tags ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cmd {
    /// Block payload.
    Data = b'a',
    /// Per-file attributes preceding that file's signatures.
    AttribsSigs = b'x',
    /// One block signature, or a "found" verdict from the champ chooser.
    Sig = b'y',
    /// Server asks the client for one block's payload.
    DataReq = b'q',
    /// Control sentinel (`sigs_end`, `backup_end`, ...).
    Gen = b'c',
    /// Release hint to the client, or a "not found" verdict from the champ chooser.
    WrapUp = b'W',
    /// Path announcement for a file whose data is needed.
    File = b'f',
    /// A finished manifest segment, offered to the champ chooser as a dedup source.
    Manifest = b'M',
    Message = b'm',
    Warning = b'w',
}

impl Cmd {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            b'a' => Ok(Self::Data),
            b'x' => Ok(Self::AttribsSigs),
            b'y' => Ok(Self::Sig),
            b'q' => Ok(Self::DataReq),
            b'c' => Ok(Self::Gen),
            b'W' => Ok(Self::WrapUp),
            b'f' => Ok(Self::File),
            b'M' => Ok(Self::Manifest),
            b'm' => Ok(Self::Message),
            b'w' => Ok(Self::Warning),
            _ => Err(StowageError::Protocol(format!("unknown frame tag 0x{v:02x}"))),
        }
    }

    pub fn as_char(self) -> char {
        self as u8 as char
    }
}

// ── Frame ──────────────────────────────────────────────────────────────────

/// One discrete message on a peer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Cmd,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(cmd: Cmd, payload: Vec<u8>) -> Self {
        Self { cmd, payload }
    }

    pub fn text(cmd: Cmd, text: &str) -> Self {
        Self::new(cmd, text.as_bytes().to_vec())
    }

    pub fn index(cmd: Cmd, index: u64) -> Self {
        Self::new(cmd, index.to_be_bytes().to_vec())
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// Wire format: `[1-byte tag][u32 BE payload length][payload]`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.push(self.cmd as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame, and
    /// the number of consumed bytes otherwise.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let cmd = Cmd::from_u8(buf[0])?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(StowageError::Protocol(format!(
                "frame payload of {len} bytes exceeds limit of {MAX_FRAME_PAYLOAD}"
            )));
        }
        let end = FRAME_HEADER_LEN + len;
        if buf.len() < end {
            return Ok(None);
        }
        let payload = buf[FRAME_HEADER_LEN..end].to_vec();
        Ok(Some((Frame { cmd, payload }, end)))
    }

    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| {
            StowageError::Protocol(format!(
                "{:?} frame payload is not valid UTF-8",
                self.cmd
            ))
        })
    }

    /// Decode a fixed-width big-endian index payload.
    pub fn payload_index(&self, what: &'static str) -> Result<u64> {
        decode_index(&self.payload, what)
    }
}

pub(crate) fn decode_index(buf: &[u8], what: &'static str) -> Result<u64> {
    if buf.len() != INDEX_LEN {
        return Err(StowageError::RecordLength {
            what,
            got: buf.len(),
            expected: INDEX_LEN,
        });
    }
    let mut raw = [0u8; INDEX_LEN];
    raw.copy_from_slice(buf);
    Ok(u64::from_be_bytes(raw))
}

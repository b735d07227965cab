use std::io::{self, Read, Write};

use stowage_types::error::{Result, StowageError};
use stowage_types::{SavePath, Signature, SAVE_PATH_LEN, SIGNATURE_LEN};

use super::FileHeader;

/// `[tag u8][len u32 BE]` in front of every manifest record.
pub const RECORD_HEADER_LEN: usize = 5;

/// Fixed payload of a sig record: signature then save path.
pub const SIG_RECORD_LEN: usize = SIGNATURE_LEN + SAVE_PATH_LEN;

/// Largest record payload a reader accepts.
const MAX_RECORD_PAYLOAD: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    Header = b'h',
    Sig = b's',
    EndFile = b'e',
}

impl RecordTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            b'h' => Some(Self::Header),
            b's' => Some(Self::Sig),
            b'e' => Some(Self::EndFile),
            _ => None,
        }
    }
}

/// A record exactly as stored, so it can be copied between manifests
/// without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub tag: RecordTag,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.payload.len()
    }

    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        let mut head = [0u8; RECORD_HEADER_LEN];
        head[0] = self.tag as u8;
        head[1..].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.write_all(&head)?;
        out.write_all(&self.payload)
    }
}

/// Outcome of pulling one record off a byte stream.
#[derive(Debug)]
pub enum ReadOutcome {
    Record(RawRecord),
    /// Clean end of stream on a record boundary.
    Eof,
    /// The stream ends inside a record (interrupted write).
    Truncated,
    /// Unknown tag or absurd length.
    Malformed(String),
}

fn read_full(src: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub fn read_record(src: &mut impl Read) -> io::Result<ReadOutcome> {
    let mut head = [0u8; RECORD_HEADER_LEN];
    match read_full(src, &mut head)? {
        0 => return Ok(ReadOutcome::Eof),
        n if n < RECORD_HEADER_LEN => return Ok(ReadOutcome::Truncated),
        _ => {}
    }
    let Some(tag) = RecordTag::from_u8(head[0]) else {
        return Ok(ReadOutcome::Malformed(format!("unknown record tag 0x{:02x}", head[0])));
    };
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > MAX_RECORD_PAYLOAD {
        return Ok(ReadOutcome::Malformed(format!("record length {len} exceeds limit")));
    }
    let mut payload = vec![0u8; len];
    if read_full(src, &mut payload)? < len {
        return Ok(ReadOutcome::Truncated);
    }
    Ok(ReadOutcome::Record(RawRecord { tag, payload }))
}

/// Decoded manifest record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Header(FileHeader),
    Sig {
        signature: Signature,
        save_path: SavePath,
    },
    EndFile,
}

impl Record {
    pub fn encode(&self) -> Result<RawRecord> {
        Ok(match self {
            Record::Header(header) => RawRecord {
                tag: RecordTag::Header,
                payload: rmp_serde::to_vec(header)?,
            },
            Record::Sig {
                signature,
                save_path,
            } => {
                let mut payload = Vec::with_capacity(SIG_RECORD_LEN);
                payload.extend_from_slice(&signature.to_bytes());
                payload.extend_from_slice(&save_path.to_bytes());
                RawRecord {
                    tag: RecordTag::Sig,
                    payload,
                }
            }
            Record::EndFile => RawRecord {
                tag: RecordTag::EndFile,
                payload: Vec::new(),
            },
        })
    }

    pub fn decode(raw: &RawRecord) -> Result<Self> {
        match raw.tag {
            RecordTag::Header => Ok(Record::Header(rmp_serde::from_slice(&raw.payload)?)),
            RecordTag::Sig => {
                if raw.payload.len() != SIG_RECORD_LEN {
                    return Err(StowageError::RecordLength {
                        what: "manifest sig record",
                        got: raw.payload.len(),
                        expected: SIG_RECORD_LEN,
                    });
                }
                Ok(Record::Sig {
                    signature: Signature::from_bytes(&raw.payload[..SIGNATURE_LEN])?,
                    save_path: SavePath::from_bytes(&raw.payload[SIGNATURE_LEN..])?,
                })
            }
            RecordTag::EndFile => Ok(Record::EndFile),
        }
    }
}

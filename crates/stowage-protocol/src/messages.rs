use stowage_types::error::{Result, StowageError};
use stowage_types::{Attribs, SavePath, Signature, SAVE_PATH_LEN};

use crate::{decode_index, Cmd, Frame, INDEX_LEN};

/// One-shot control sentinels carried in `GEN` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenCommand {
    /// Client: every signature has been sent.
    SigsEnd,
    /// Client: the backup is complete.
    BackupEnd,
    /// Server: every path has been announced.
    RequestsEnd,
    /// Server: every block request has been sent.
    BlkRequestsEnd,
}

impl GenCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            GenCommand::SigsEnd => "sigs_end",
            GenCommand::BackupEnd => "backup_end",
            GenCommand::RequestsEnd => "requests_end",
            GenCommand::BlkRequestsEnd => "blk_requests_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sigs_end" => Some(GenCommand::SigsEnd),
            "backup_end" => Some(GenCommand::BackupEnd),
            "requests_end" => Some(GenCommand::RequestsEnd),
            "blk_requests_end" => Some(GenCommand::BlkRequestsEnd),
            _ => None,
        }
    }
}

fn unexpected(peer: &'static str, frame: &Frame) -> StowageError {
    StowageError::UnexpectedMessage {
        peer,
        cmd: frame.cmd.as_char(),
    }
}

fn parse_gen(peer: &'static str, frame: &Frame) -> Result<GenCommand> {
    let text = frame.payload_str()?;
    GenCommand::parse(text)
        .ok_or_else(|| StowageError::Protocol(format!("unknown control sentinel '{text}' from {peer}")))
}

// ── Client → server ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Payload for the next requested block.
    Data(Vec<u8>),
    /// Fresh attributes for an announced file; its signatures follow.
    AttribsSigs { file_no: u64, attribs: Attribs },
    Sig(Signature),
    Gen(GenCommand),
    Message(String),
    Warning(String),
}

impl ClientMessage {
    const PEER: &'static str = "client";

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        match frame.cmd {
            Cmd::Data => Ok(Self::Data(frame.payload.clone())),
            Cmd::AttribsSigs => {
                if frame.payload.len() < INDEX_LEN {
                    return Err(StowageError::RecordLength {
                        what: "attribs file index",
                        got: frame.payload.len(),
                        expected: INDEX_LEN,
                    });
                }
                let file_no = decode_index(&frame.payload[..INDEX_LEN], "attribs file index")?;
                let attribs = rmp_serde::from_slice(&frame.payload[INDEX_LEN..])?;
                Ok(Self::AttribsSigs { file_no, attribs })
            }
            Cmd::Sig => Ok(Self::Sig(Signature::from_bytes(&frame.payload)?)),
            Cmd::Gen => match parse_gen(Self::PEER, frame)? {
                cmd @ (GenCommand::SigsEnd | GenCommand::BackupEnd) => Ok(Self::Gen(cmd)),
                other => Err(StowageError::Protocol(format!(
                    "client may not send '{}'",
                    other.as_str()
                ))),
            },
            Cmd::Message => Ok(Self::Message(frame.payload_str()?.to_string())),
            Cmd::Warning => Ok(Self::Warning(frame.payload_str()?.to_string())),
            _ => Err(unexpected(Self::PEER, frame)),
        }
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(match self {
            Self::Data(payload) => Frame::new(Cmd::Data, payload.clone()),
            Self::AttribsSigs { file_no, attribs } => {
                let mut payload = file_no.to_be_bytes().to_vec();
                rmp_serde::encode::write(&mut payload, attribs)?;
                Frame::new(Cmd::AttribsSigs, payload)
            }
            Self::Sig(sig) => Frame::new(Cmd::Sig, sig.to_bytes().to_vec()),
            Self::Gen(cmd) => Frame::text(Cmd::Gen, cmd.as_str()),
            Self::Message(text) => Frame::text(Cmd::Message, text),
            Self::Warning(text) => Frame::text(Cmd::Warning, text),
        })
    }
}

// ── Server → client ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Announce a file whose data is needed.
    Path(String),
    /// Request the payload of one block.
    DataReq(u64),
    Gen(GenCommand),
    /// The client may drop buffered blocks up to this index.
    WrapUp(u64),
}

impl ServerMessage {
    const PEER: &'static str = "server";

    pub fn to_frame(&self) -> Frame {
        match self {
            Self::Path(path) => Frame::text(Cmd::File, path),
            Self::DataReq(index) => Frame::index(Cmd::DataReq, *index),
            Self::Gen(cmd) => Frame::text(Cmd::Gen, cmd.as_str()),
            Self::WrapUp(index) => Frame::index(Cmd::WrapUp, *index),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        match frame.cmd {
            Cmd::File => Ok(Self::Path(frame.payload_str()?.to_string())),
            Cmd::DataReq => Ok(Self::DataReq(frame.payload_index("data request")?)),
            Cmd::Gen => Ok(Self::Gen(parse_gen(Self::PEER, frame)?)),
            Cmd::WrapUp => Ok(Self::WrapUp(frame.payload_index("wrap-up")?)),
            _ => Err(unexpected(Self::PEER, frame)),
        }
    }
}

// ── Server → champ chooser ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChampRequest {
    /// Look up one block. The champ chooser numbers these in arrival order.
    Sig(Signature),
    SigsEnd,
    /// A finished manifest segment the champ chooser may now dedup against.
    Manifest(String),
}

impl ChampRequest {
    const PEER: &'static str = "server";

    pub fn to_frame(&self) -> Frame {
        match self {
            Self::Sig(sig) => Frame::new(Cmd::Sig, sig.to_bytes().to_vec()),
            Self::SigsEnd => Frame::text(Cmd::Gen, GenCommand::SigsEnd.as_str()),
            Self::Manifest(path) => Frame::text(Cmd::Manifest, path),
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        match frame.cmd {
            Cmd::Sig => Ok(Self::Sig(Signature::from_bytes(&frame.payload)?)),
            Cmd::Gen => match parse_gen(Self::PEER, frame)? {
                GenCommand::SigsEnd => Ok(Self::SigsEnd),
                _ => Err(unexpected(Self::PEER, frame)),
            },
            Cmd::Manifest => Ok(Self::Manifest(frame.payload_str()?.to_string())),
            _ => Err(unexpected(Self::PEER, frame)),
        }
    }
}

// ── Champ chooser → server ─────────────────────────────────────────────────

/// Dedup verdicts, delivered in non-decreasing block index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChampVerdict {
    /// An identical block is already stored at `save_path`.
    Found { index: u64, save_path: SavePath },
    /// Nothing up to and including `index` was found.
    NotFound { index: u64 },
}

impl ChampVerdict {
    const PEER: &'static str = "champ chooser";
    const FOUND_LEN: usize = INDEX_LEN + SAVE_PATH_LEN;

    pub fn index(&self) -> u64 {
        match self {
            Self::Found { index, .. } | Self::NotFound { index } => *index,
        }
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        match frame.cmd {
            Cmd::Sig => {
                if frame.payload.len() != Self::FOUND_LEN {
                    return Err(StowageError::RecordLength {
                        what: "found verdict",
                        got: frame.payload.len(),
                        expected: Self::FOUND_LEN,
                    });
                }
                let index = decode_index(&frame.payload[..INDEX_LEN], "found verdict")?;
                let save_path = SavePath::from_bytes(&frame.payload[INDEX_LEN..])?;
                Ok(Self::Found { index, save_path })
            }
            Cmd::WrapUp => Ok(Self::NotFound {
                index: frame.payload_index("not-found verdict")?,
            }),
            _ => Err(unexpected(Self::PEER, frame)),
        }
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            Self::Found { index, save_path } => {
                let mut payload = Vec::with_capacity(Self::FOUND_LEN);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&save_path.to_bytes());
                Frame::new(Cmd::Sig, payload)
            }
            Self::NotFound { index } => Frame::index(Cmd::WrapUp, *index),
        }
    }
}

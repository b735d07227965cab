use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
    HardLink,
    Special,
}

impl EntryKind {
    /// Only regular file content travels as blocks.
    pub fn carries_data(self) -> bool {
        matches!(self, EntryKind::RegularFile)
    }
}

/// Stat metadata as captured by the client scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Modification time in nanoseconds since Unix epoch. Tracks file data.
    pub mtime: i64,
    /// Status change time in nanoseconds since Unix epoch. Tracks metadata.
    pub ctime: i64,
    #[serde(default)]
    pub link_target: Option<String>,
}

/// Manifest path ordering: byte-wise, except that `/` sorts before every
/// other byte so that a directory's children follow it directly.
pub fn path_cmp(a: &str, b: &str) -> Ordering {
    let rank = |c: u8| if c == b'/' { 0u16 } else { c as u16 + 1 };
    let mut ia = a.bytes();
    let mut ib = b.bytes();
    loop {
        match (ia.next(), ib.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match rank(x).cmp(&rank(y)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

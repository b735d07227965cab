use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StowageError};

/// Length of an encoded save path.
pub const SAVE_PATH_LEN: usize = 8;

/// Location of one stored block: three fan-out levels naming the data file
/// plus the block's slot within that file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SavePath {
    pub prim: u16,
    pub seco: u16,
    pub tert: u16,
    pub sig: u16,
}

impl SavePath {
    pub fn new(prim: u16, seco: u16, tert: u16, sig: u16) -> Self {
        Self {
            prim,
            seco,
            tert,
            sig,
        }
    }

    pub fn to_bytes(&self) -> [u8; SAVE_PATH_LEN] {
        let mut out = [0u8; SAVE_PATH_LEN];
        out[0..2].copy_from_slice(&self.prim.to_be_bytes());
        out[2..4].copy_from_slice(&self.seco.to_be_bytes());
        out[4..6].copy_from_slice(&self.tert.to_be_bytes());
        out[6..8].copy_from_slice(&self.sig.to_be_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != SAVE_PATH_LEN {
            return Err(StowageError::RecordLength {
                what: "save path",
                got: buf.len(),
                expected: SAVE_PATH_LEN,
            });
        }
        let word = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        Ok(Self::new(word(0), word(2), word(4), word(6)))
    }

    /// Relative path of the data file holding this block (`PPPP/SSSS/TTTT`).
    pub fn data_file(&self) -> PathBuf {
        PathBuf::from(format!("{:04X}", self.prim))
            .join(format!("{:04X}", self.seco))
            .join(format!("{:04X}", self.tert))
    }
}

impl fmt::Display for SavePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}/{:04X}/{:04X}/{:04X}",
            self.prim, self.seco, self.tert, self.sig
        )
    }
}

impl fmt::Debug for SavePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SavePath({self})")
    }
}

impl std::str::FromStr for SavePath {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 4 {
            return Err(StowageError::Protocol(format!("malformed save path '{s}'")));
        }
        let mut words = [0u16; 4];
        for (word, part) in words.iter_mut().zip(&parts) {
            *word = u16::from_str_radix(part, 16)
                .map_err(|_| StowageError::Protocol(format!("malformed save path '{s}'")))?;
        }
        Ok(Self::new(words[0], words[1], words[2], words[3]))
    }
}

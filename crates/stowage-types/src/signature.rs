use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StowageError};

/// Length of the rolling fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 8;
/// Length of the strong checksum in bytes.
pub const CHECKSUM_LEN: usize = 16;
/// Length of an encoded signature: fingerprint ∥ checksum.
pub const SIGNATURE_LEN: usize = FINGERPRINT_LEN + CHECKSUM_LEN;

/// MD5 of the empty string. A block carrying this checksum together with a
/// zero fingerprint holds no data.
const EMPTY_CHECKSUM: [u8; CHECKSUM_LEN] = [
    0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8, 0x42, 0x7e,
];

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(pub [u8; CHECKSUM_LEN]);

/// Block identity as computed by the client. Never recomputed server-side.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub fingerprint: Fingerprint,
    pub checksum: Checksum,
}

impl Signature {
    pub fn new(fingerprint: u64, checksum: [u8; CHECKSUM_LEN]) -> Self {
        Self {
            fingerprint: Fingerprint(fingerprint),
            checksum: Checksum(checksum),
        }
    }

    /// Signature of an empty block.
    pub fn zero_length() -> Self {
        Self::new(0, EMPTY_CHECKSUM)
    }

    pub fn is_zero_length(&self) -> bool {
        self.fingerprint.0 == 0 && self.checksum.0 == EMPTY_CHECKSUM
    }

    /// Fixed-width encoding: big-endian fingerprint followed by the checksum.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        let mut out = [0u8; SIGNATURE_LEN];
        out[..FINGERPRINT_LEN].copy_from_slice(&self.fingerprint.0.to_be_bytes());
        out[FINGERPRINT_LEN..].copy_from_slice(&self.checksum.0);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != SIGNATURE_LEN {
            return Err(StowageError::RecordLength {
                what: "signature",
                got: buf.len(),
                expected: SIGNATURE_LEN,
            });
        }
        let mut fp = [0u8; FINGERPRINT_LEN];
        fp.copy_from_slice(&buf[..FINGERPRINT_LEN]);
        let mut checksum = [0u8; CHECKSUM_LEN];
        checksum.copy_from_slice(&buf[FINGERPRINT_LEN..]);
        Ok(Self::new(u64::from_be_bytes(fp), checksum))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signature({:016x}:{})",
            self.fingerprint.0,
            &hex::encode(self.checksum.0)[..8]
        )
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:016x})", self.0)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", hex::encode(self.0))
    }
}

//! Value types shared by the stowage protocol and server crates.

pub mod attribs;
pub mod error;
pub mod save_path;
pub mod signature;

pub use attribs::{path_cmp, Attribs, EntryKind};
pub use error::{ErrorClass, Result, StowageError};
pub use save_path::{SavePath, SAVE_PATH_LEN};
pub use signature::{Checksum, Fingerprint, Signature, SIGNATURE_LEN};

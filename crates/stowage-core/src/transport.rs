//! Peer channels as seen by the session loop.
//!
//! The loop talks to exactly two peers, the client and the champ chooser,
//! through one [`Multiplexer`]. Appends never block; `read_write` is the
//! only call that may wait.

use stowage_protocol::{AppendResult, Frame};
use stowage_types::error::Result;

pub trait Multiplexer {
    /// Queue a frame for the client.
    fn append_to_client(&mut self, frame: &Frame) -> AppendResult;

    /// Queue a frame for the champ chooser.
    fn append_to_champ(&mut self, frame: &Frame) -> AppendResult;

    /// Flush what can be flushed and wait until either peer is readable or
    /// writable again.
    fn read_write(&mut self) -> Result<()>;

    /// Next complete frame already received from the client.
    fn read_client(&mut self) -> Result<Option<Frame>>;

    /// Next complete frame already received from the champ chooser.
    fn read_champ(&mut self) -> Result<Option<Frame>>;
}

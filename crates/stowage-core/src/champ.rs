//! Traffic with the champ chooser, the dedup index peer.
//!
//! Signatures go out in block index order, at most `lookahead` blocks ahead
//! of the oldest uncommitted block. Verdicts come back in non-decreasing
//! index order and resolve blocks in the [`BlockList`].

use std::collections::VecDeque;

use tracing::{debug, trace};

use stowage_protocol::{AppendResult, ChampRequest, ChampVerdict, Frame};
use stowage_types::error::{Result, StowageError};

use crate::blocks::{BlockList, SavePathAllocator};
use crate::transport::Multiplexer;

pub struct ChampChooserBridge {
    lookahead: u64,
    /// Finished manifest segments not yet announced.
    notices: VecDeque<ChampRequest>,
    sigs_end_sent: bool,
    sigs_sent: u64,
}

fn channel_error(what: &str) -> StowageError {
    StowageError::Channel(format!("champ chooser channel failed while sending {what}"))
}

impl ChampChooserBridge {
    pub fn new(lookahead: u64) -> Self {
        Self {
            lookahead,
            notices: VecDeque::new(),
            sigs_end_sent: false,
            sigs_sent: 0,
        }
    }

    pub fn sigs_sent(&self) -> u64 {
        self.sigs_sent
    }

    /// Queue a finished manifest segment as a new dedup source.
    pub fn announce_segment(&mut self, segment: String) {
        self.notices.push_back(ChampRequest::Manifest(segment));
    }

    /// Send whatever the channel accepts: segment notices, then signatures
    /// within the lookahead, then the one-time `sigs_end` once the client
    /// has finished and every block has been offered.
    pub fn forward(
        &mut self,
        mux: &mut dyn Multiplexer,
        blocks: &mut BlockList,
        client_sigs_done: bool,
    ) -> Result<()> {
        while let Some(notice) = self.notices.front() {
            match mux.append_to_champ(&notice.to_frame()) {
                AppendResult::Ok => {
                    trace!(?notice, "announced manifest segment");
                    self.notices.pop_front();
                }
                AppendResult::Blocked => return Ok(()),
                AppendResult::Error => return Err(channel_error("a manifest notice")),
            }
        }

        while let Some((index, signature)) = blocks.next_to_send(self.lookahead) {
            match mux.append_to_champ(&ChampRequest::Sig(signature).to_frame()) {
                AppendResult::Ok => {
                    blocks.mark_sent(index)?;
                    self.sigs_sent += 1;
                }
                AppendResult::Blocked => return Ok(()),
                AppendResult::Error => return Err(channel_error("a signature")),
            }
        }

        if client_sigs_done && blocks.all_sent() && !self.sigs_end_sent {
            match mux.append_to_champ(&ChampRequest::SigsEnd.to_frame()) {
                AppendResult::Ok => {
                    debug!(sigs = self.sigs_sent, "all signatures sent to champ chooser");
                    self.sigs_end_sent = true;
                }
                AppendResult::Blocked => {}
                AppendResult::Error => return Err(channel_error("sigs_end")),
            }
        }
        Ok(())
    }

    /// Apply one inbound verdict frame.
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        blocks: &mut BlockList,
        alloc: &mut dyn SavePathAllocator,
    ) -> Result<ChampVerdict> {
        let verdict = ChampVerdict::from_frame(frame)?;
        blocks.apply_verdict(&verdict, alloc)?;
        trace!(?verdict, "applied dedup verdict");
        Ok(verdict)
    }
}

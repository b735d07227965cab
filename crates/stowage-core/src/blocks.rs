//! In-flight blocks of one session.
//!
//! Every block announced by a client signature lives in a single arena keyed
//! by its run-local index. Entries own contiguous index ranges, and the champ
//! send cursor, verdict cursor and data cursor are plain indices checked
//! against the arena on every use.

use std::collections::VecDeque;

use stowage_protocol::ChampVerdict;
use stowage_types::error::{Result, StowageError};
use stowage_types::{SavePath, Signature};

use crate::store::BlockStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Dedup verdict pending.
    Incoming,
    /// No stored copy exists; the payload must be fetched from the client.
    NotGot,
    /// A stored copy exists, either found by the champ chooser or freshly written.
    Got,
}

impl BlockStatus {
    pub fn name(self) -> &'static str {
        match self {
            BlockStatus::Incoming => "INCOMING",
            BlockStatus::NotGot => "NOT_GOT",
            BlockStatus::Got => "GOT",
        }
    }

    fn may_become(self, to: BlockStatus) -> bool {
        matches!(
            (self, to),
            (BlockStatus::Incoming, BlockStatus::NotGot)
                | (BlockStatus::Incoming, BlockStatus::Got)
                | (BlockStatus::NotGot, BlockStatus::Got)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub index: u64,
    pub signature: Signature,
    pub save_path: Option<SavePath>,
    pub status: BlockStatus,
    pub requested: bool,
    /// Payload length, once the client has sent it.
    pub received_len: Option<usize>,
}

impl Block {
    fn new(index: u64, signature: Signature) -> Self {
        Self {
            index,
            signature,
            save_path: None,
            status: BlockStatus::Incoming,
            requested: false,
            received_len: None,
        }
    }

    fn transition(&mut self, to: BlockStatus) -> Result<()> {
        if !self.status.may_become(to) {
            return Err(StowageError::IllegalTransition {
                index: self.index,
                from: self.status.name(),
                to: to.name(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Source of fresh save paths for blocks that must be fetched.
pub trait SavePathAllocator {
    fn allocate(&mut self) -> Result<SavePath>;
}

impl SavePathAllocator for BlockStore {
    fn allocate(&mut self) -> Result<SavePath> {
        BlockStore::allocate(self)
    }
}

#[derive(Debug, Default)]
pub struct BlockList {
    blocks: VecDeque<Block>,
    /// Index of `blocks[0]`, or `next_index` when empty.
    head: u64,
    next_index: u64,
    /// Next block to send to the champ chooser.
    champ_cursor: u64,
    /// Every block below this index has had its verdict applied.
    verdict_cursor: u64,
    /// Where to start looking for the block the next client payload belongs to.
    data_cursor: u64,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Oldest block still held.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Index the next appended block will receive.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn champ_cursor(&self) -> u64 {
        self.champ_cursor
    }

    pub fn verdict_cursor(&self) -> u64 {
        self.verdict_cursor
    }

    /// Append a block for a signature received from the client.
    pub fn push(&mut self, signature: Signature) -> u64 {
        let index = self.next_index;
        self.blocks.push_back(Block::new(index, signature));
        self.next_index += 1;
        index
    }

    fn slot(&self, index: u64) -> Option<usize> {
        if index < self.head || index >= self.next_index {
            return None;
        }
        Some((index - self.head) as usize)
    }

    pub fn get(&self, index: u64) -> Option<&Block> {
        self.slot(index).and_then(|s| self.blocks.get(s))
    }

    fn get_mut(&mut self, index: u64) -> Result<&mut Block> {
        let head = self.head;
        let next = self.next_index;
        self.slot(index)
            .and_then(|s| self.blocks.get_mut(s))
            .ok_or_else(|| {
                StowageError::Invariant(format!(
                    "block {index} is not held (window {head}..{next})"
                ))
            })
    }

    pub fn mark_requested(&mut self, index: u64) -> Result<()> {
        let block = self.get_mut(index)?;
        if block.status != BlockStatus::NotGot || block.requested {
            return Err(StowageError::Invariant(format!(
                "block {index} requested while {} (requested={})",
                block.status.name(),
                block.requested
            )));
        }
        block.requested = true;
        Ok(())
    }

    /// Retire the oldest block once it is committed to the manifest.
    pub fn pop_front(&mut self) -> Result<Block> {
        let block = self
            .blocks
            .front()
            .ok_or_else(|| StowageError::Invariant("retiring from an empty block list".into()))?;
        if block.status != BlockStatus::Got {
            return Err(StowageError::Invariant(format!(
                "retiring block {} while {}",
                block.index,
                block.status.name()
            )));
        }
        let block = self
            .blocks
            .pop_front()
            .ok_or_else(|| StowageError::Invariant("retiring from an empty block list".into()))?;
        self.head = block.index + 1;
        // A GOT block is past the verdict cursor, and so past the send cursor.
        self.champ_cursor = self.champ_cursor.max(self.head);
        self.verdict_cursor = self.verdict_cursor.max(self.head);
        self.data_cursor = self.data_cursor.max(self.head);
        Ok(block)
    }

    // ── Champ chooser side ─────────────────────────────────────────────

    /// Next signature to send, unless the send cursor is `lookahead` blocks
    /// ahead of the oldest held block.
    pub fn next_to_send(&self, lookahead: u64) -> Option<(u64, Signature)> {
        if self.champ_cursor - self.head >= lookahead {
            return None;
        }
        self.get(self.champ_cursor)
            .map(|block| (block.index, block.signature))
    }

    pub fn mark_sent(&mut self, index: u64) -> Result<()> {
        if index != self.champ_cursor {
            return Err(StowageError::Invariant(format!(
                "sent block {index} but the send cursor is at {}",
                self.champ_cursor
            )));
        }
        self.champ_cursor += 1;
        Ok(())
    }

    /// True once every held block has been offered to the champ chooser.
    pub fn all_sent(&self) -> bool {
        self.champ_cursor >= self.next_index
    }

    /// Apply one dedup verdict.
    ///
    /// Verdicts arrive in non-decreasing index order, so every block still
    /// INCOMING between the verdict cursor and the target was a miss. Those
    /// become NOT_GOT with a fresh save path before the target itself is
    /// resolved.
    pub fn apply_verdict(
        &mut self,
        verdict: &ChampVerdict,
        alloc: &mut dyn SavePathAllocator,
    ) -> Result<()> {
        let target = verdict.index();
        if target < self.verdict_cursor {
            return Err(StowageError::VerdictDesync {
                index: target,
                reason: format!("behind the verdict cursor at {}", self.verdict_cursor),
            });
        }
        if target < self.head {
            return Err(StowageError::VerdictDesync {
                index: target,
                reason: format!("already retired, oldest held block is {}", self.head),
            });
        }
        if target >= self.champ_cursor {
            return Err(StowageError::VerdictDesync {
                index: target,
                reason: format!("never sent, {} blocks sent so far", self.champ_cursor),
            });
        }

        self.mark_not_got_until(target, alloc)?;
        let block = self.get_mut(target)?;
        match verdict {
            ChampVerdict::Found { save_path, .. } => {
                block.transition(BlockStatus::Got)?;
                block.save_path = Some(*save_path);
            }
            ChampVerdict::NotFound { .. } => {
                block.transition(BlockStatus::NotGot)?;
                block.save_path = Some(alloc.allocate()?);
            }
        }
        self.verdict_cursor = target + 1;
        Ok(())
    }

    /// Catch-up: mark INCOMING blocks in `[verdict cursor, target)` NOT_GOT.
    fn mark_not_got_until(&mut self, target: u64, alloc: &mut dyn SavePathAllocator) -> Result<()> {
        let from = self.verdict_cursor.max(self.head);
        for index in from..target {
            let block = self.get_mut(index)?;
            if block.status == BlockStatus::Incoming {
                block.transition(BlockStatus::NotGot)?;
                block.save_path = Some(alloc.allocate()?);
            }
        }
        Ok(())
    }

    // ── Client data side ───────────────────────────────────────────────

    /// The block the next client payload belongs to: the oldest requested
    /// block that is still NOT_GOT.
    pub fn awaiting_data(&mut self) -> Option<u64> {
        let from = self.data_cursor.max(self.head);
        let found = (from..self.next_index).find(|&index| {
            self.get(index)
                .is_some_and(|b| b.requested && b.status == BlockStatus::NotGot)
        });
        if let Some(index) = found {
            self.data_cursor = index;
        }
        found
    }

    /// Record that a requested block's payload is stored.
    pub fn mark_received(&mut self, index: u64, len: usize) -> Result<()> {
        let block = self.get_mut(index)?;
        if !block.requested {
            return Err(StowageError::Invariant(format!(
                "payload stored for unrequested block {index}"
            )));
        }
        block.transition(BlockStatus::Got)?;
        block.received_len = Some(len);
        self.data_cursor = index + 1;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}

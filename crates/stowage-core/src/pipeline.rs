//! Produces the next outbound client message.

use tracing::{debug, trace};

use stowage_protocol::{GenCommand, ServerMessage};
use stowage_types::error::Result;

use crate::blocks::{BlockList, BlockStatus};
use crate::queue::FileEntryQueue;
use crate::termination::{EndStep, Termination};

/// What the block-request walk found at the request cursor.
enum Step {
    Request(u64),
    Advance,
    NextEntry,
    Wait,
}

#[derive(Debug)]
pub struct RequestPipeline {
    /// File number the next announced path receives.
    next_file_no: u64,
}

impl Default for RequestPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestPipeline {
    pub fn new() -> Self {
        Self { next_file_no: 1 }
    }

    /// Files announced so far.
    pub fn files_announced(&self) -> u64 {
        self.next_file_no - 1
    }

    /// At most one message per call. Block requests win over path
    /// announcements, which win over the end-of-requests sentinels.
    pub fn next_message(
        &mut self,
        queue: &mut FileEntryQueue,
        blocks: &mut BlockList,
        scan_exhausted: bool,
        termination: &mut Termination,
    ) -> Result<Option<ServerMessage>> {
        if let Some(index) = Self::next_block_request(queue, blocks)? {
            return Ok(Some(ServerMessage::DataReq(index)));
        }
        if let Some(path) = self.next_path(queue) {
            return Ok(Some(ServerMessage::Path(path)));
        }
        if scan_exhausted
            && queue.path_cursor() >= queue.next_seq()
            && !termination.is_set(EndStep::RequestsEnd)
        {
            termination.set(EndStep::RequestsEnd)?;
            debug!(files = self.files_announced(), "all paths announced");
            return Ok(Some(ServerMessage::Gen(GenCommand::RequestsEnd)));
        }
        if termination.is_set(EndStep::SigsEnd)
            && queue.request_cursor() >= queue.next_seq()
            && !termination.is_set(EndStep::BlkRequestsEnd)
        {
            termination.set(EndStep::BlkRequestsEnd)?;
            debug!("all block requests sent");
            return Ok(Some(ServerMessage::Gen(GenCommand::BlkRequestsEnd)));
        }
        Ok(None)
    }

    fn next_block_request(queue: &mut FileEntryQueue, blocks: &mut BlockList) -> Result<Option<u64>> {
        loop {
            let seq = queue.request_cursor();
            let Some(entry) = queue.get_mut(seq) else {
                return Ok(None);
            };
            let step = if !entry.need_data || entry.abandoned {
                Step::NextEntry
            } else if let Some(range) = entry.range {
                entry.next_request = entry.next_request.max(range.start);
                let index = entry.next_request;
                match range.end {
                    Some(end) if index >= end => Step::NextEntry,
                    _ => match blocks.get(index) {
                        None => Step::Wait,
                        Some(block) => match block.status {
                            BlockStatus::Incoming => Step::Wait,
                            BlockStatus::NotGot if !block.requested => Step::Request(index),
                            _ => Step::Advance,
                        },
                    },
                }
            } else {
                Step::Wait
            };

            match step {
                Step::Request(index) => {
                    blocks.mark_requested(index)?;
                    entry.next_request = index + 1;
                    trace!(index, "requesting block data");
                    return Ok(Some(index));
                }
                Step::Advance => entry.next_request += 1,
                Step::NextEntry => queue.set_request_cursor(seq + 1),
                Step::Wait => return Ok(None),
            }
        }
    }

    fn next_path(&mut self, queue: &mut FileEntryQueue) -> Option<String> {
        loop {
            let seq = queue.path_cursor();
            let entry = queue.get_mut(seq)?;
            if entry.need_data && !entry.sent_path {
                entry.sent_path = true;
                entry.file_no = Some(self.next_file_no);
                self.next_file_no += 1;
                let path = entry.path.clone();
                queue.set_path_cursor(seq + 1);
                return Some(path);
            }
            queue.set_path_cursor(seq + 1);
        }
    }
}

use std::collections::VecDeque;

use tracing::{trace, warn};

use stowage_protocol::ServerMessage;
use stowage_types::error::{Result, StowageError};

use crate::blocks::{BlockList, BlockStatus};
use crate::champ::ChampChooserBridge;
use crate::manifest::SegmentWriter;
use crate::queue::FileEntryQueue;
use crate::stats::SessionStats;

/// Commits resolved entries from the head of the queue to the changed manifest.
pub struct ManifestWriter {
    changed: SegmentWriter,
}

impl ManifestWriter {
    pub fn new(changed: SegmentWriter) -> Self {
        Self { changed }
    }

    /// Write out as much of the queue head as is resolved.
    ///
    /// A completed manifest segment is queued as a dedup source for the
    /// champ chooser, and when the block that completed it was never
    /// requested the client is told it may drop everything up to that block.
    pub fn flush(
        &mut self,
        queue: &mut FileEntryQueue,
        blocks: &mut BlockList,
        champ: &mut ChampChooserBridge,
        client_outbox: &mut VecDeque<ServerMessage>,
        stats: &mut SessionStats,
    ) -> Result<()> {
        loop {
            let Some(entry) = queue.front_mut() else {
                return Ok(());
            };

            if !entry.need_data {
                self.changed.write_header(&entry.header())?;
                trace!(path = %entry.path, "committed entry without data");
                queue.pop_front()?;
                continue;
            }
            if entry.abandoned {
                warn!(path = %entry.path, "client skipped entry, leaving it out of the backup");
                stats.entries_abandoned += 1;
                queue.pop_front()?;
                continue;
            }
            let Some(mut range) = entry.range else {
                return Ok(());
            };
            if !entry.header_written {
                self.changed.write_header(&entry.header())?;
                entry.header_written = true;
            }

            while range.end.map_or(true, |end| range.start < end) {
                let Some(block) = blocks.get(range.start) else {
                    break;
                };
                if block.status != BlockStatus::Got {
                    break;
                }
                if block.index != blocks.head() {
                    return Err(StowageError::Invariant(format!(
                        "entry {} commits block {} but the oldest held block is {}",
                        entry.path,
                        block.index,
                        blocks.head()
                    )));
                }
                let save_path = block.save_path.ok_or_else(|| {
                    StowageError::Invariant(format!("block {} is GOT without a save path", block.index))
                })?;
                if !block.signature.is_zero_length() {
                    if let Some(segment) = self.changed.write_sig(block.signature, save_path)? {
                        champ.announce_segment(segment.display().to_string());
                        if !block.requested {
                            client_outbox.push_back(ServerMessage::WrapUp(block.index));
                        }
                    }
                }
                blocks.pop_front()?;
                range.start += 1;
            }
            entry.range = Some(range);

            if !range.is_drained() {
                return Ok(());
            }
            self.changed.write_end_file()?;
            trace!(path = %entry.path, "committed entry");
            queue.pop_front()?;
        }
    }

    pub fn records_written(&self) -> u64 {
        self.changed.records_written()
    }

    pub fn close(self) -> Result<()> {
        self.changed.close()
    }
}

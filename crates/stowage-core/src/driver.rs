//! The phase-2 session loop.
//!
//! One [`Phase2Session`] serves one client. Each iteration pulls scan
//! entries into the queue, emits at most one new client message, forwards
//! signatures to the champ chooser, waits once on the [`Multiplexer`],
//! dispatches whatever arrived and commits resolved entries. The loop ends
//! when the client declares the backup complete.

use std::collections::VecDeque;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use stowage_protocol::{AppendResult, ChampVerdict, ClientMessage, Frame, GenCommand, ServerMessage};
use stowage_types::error::{Result, StowageError};
use stowage_types::{Attribs, Signature};

use crate::blocks::BlockList;
use crate::champ::ChampChooserBridge;
use crate::commit::ManifestWriter;
use crate::compare::{Classification, ManifestScanComparator};
use crate::config::{Phase2Config, SessionDirs};
use crate::manifest::{list_segments, SegmentReader, SegmentWriter};
use crate::pipeline::RequestPipeline;
use crate::queue::{BlockRange, FileEntry, FileEntryQueue};
use crate::resume;
use crate::scan::ScanSource;
use crate::stats::{SessionReport, SessionStats};
use crate::store::BlockStore;
use crate::termination::{EndStep, Termination};
use crate::transport::Multiplexer;

pub struct Phase2Session {
    config: Phase2Config,
    scan: ScanSource,
    comparator: ManifestScanComparator,
    unchanged: SegmentWriter,
    writer: ManifestWriter,
    store: BlockStore,
    queue: FileEntryQueue,
    blocks: BlockList,
    pipeline: RequestPipeline,
    champ: ChampChooserBridge,
    termination: Termination,
    client_outbox: VecDeque<ServerMessage>,
    stats: SessionStats,
}

impl Phase2Session {
    /// Open every manifest and the block store for the session rooted at
    /// `dirs`, recovering from an interrupted earlier attempt if needed.
    pub fn open(dirs: &SessionDirs, config: Phase2Config) -> Result<Self> {
        config.validate()?;
        let recovery = resume::recover(dirs)?;

        let previous = if list_segments(&dirs.current())?.is_empty() {
            info!("no previous backup, every entry is new");
            None
        } else {
            Some(SegmentReader::open(&dirs.current())?)
        };
        let unchanged = SegmentWriter::append(
            &dirs.unchanged(),
            config.sigs_per_manifest_segment,
            recovery.unchanged.sigs_in_last_segment,
        )?;
        let changed = SegmentWriter::append(
            &dirs.changed(),
            config.sigs_per_manifest_segment,
            recovery.changed.sigs_in_last_segment,
        )?;

        Ok(Self {
            scan: ScanSource::open(&dirs.phase1(), recovery.resume_after())?,
            comparator: ManifestScanComparator::new(previous, config.metadata_change_policy),
            unchanged,
            writer: ManifestWriter::new(changed),
            store: BlockStore::open(&dirs.data, &config)?,
            queue: FileEntryQueue::new(),
            blocks: BlockList::new(),
            pipeline: RequestPipeline::new(),
            champ: ChampChooserBridge::new(config.champ_lookahead),
            termination: Termination::new(),
            client_outbox: VecDeque::new(),
            stats: SessionStats::default(),
            config,
        })
    }

    /// Drive the session to completion.
    ///
    /// On failure every data file the session holds is released before the
    /// error propagates. The manifests keep what was committed, which is
    /// where the next attempt resumes.
    pub fn run(mut self, mux: &mut dyn Multiplexer) -> Result<SessionReport> {
        let started = Utc::now();
        info!("backup phase 2 begin");
        let outcome = match self.run_loop(mux).and_then(|()| self.finish()) {
            Ok(stats) => self.close().map(|()| stats),
            Err(e) => {
                self.store.abandon();
                Err(e)
            }
        };
        match outcome {
            Ok(stats) => {
                let report = SessionReport {
                    started,
                    finished: Utc::now(),
                    stats,
                };
                report.log();
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, class = ?e.class(), "backup phase 2 failed");
                Err(e)
            }
        }
    }

    fn run_loop(&mut self, mux: &mut dyn Multiplexer) -> Result<()> {
        while !self.termination.finished() {
            self.fill_queue()?;
            self.exchange(mux)?;
        }
        Ok(())
    }

    /// The rest of one iteration: one client message, champ forwarding, the
    /// wait, dispatch and commit.
    fn exchange(&mut self, mux: &mut dyn Multiplexer) -> Result<()> {
        if self.client_outbox.is_empty() {
            if let Some(message) = self.pipeline.next_message(
                &mut self.queue,
                &mut self.blocks,
                self.scan.is_exhausted(),
                &mut self.termination,
            )? {
                if let ServerMessage::DataReq(_) = message {
                    self.stats.data_requests += 1;
                }
                self.client_outbox.push_back(message);
            }
        }
        self.flush_client(mux)?;

        self.champ.forward(
            mux,
            &mut self.blocks,
            self.termination.is_set(EndStep::SigsEnd),
        )?;

        mux.read_write()?;

        while !self.termination.finished() {
            let Some(frame) = mux.read_client()? else {
                break;
            };
            self.handle_client_frame(&frame)?;
        }
        while let Some(frame) = mux.read_champ()? {
            self.handle_champ_frame(&frame)?;
        }

        self.commit()?;
        Ok(())
    }

    /// Pull scan entries while the queue span is below the window, and past
    /// it until a file follows the one the client is streaming.
    fn fill_queue(&mut self) -> Result<()> {
        while self.queue.span() < self.config.queue_window || self.queue.needs_successor() {
            let Some(header) = self.scan.next_header()? else {
                break;
            };
            match self.comparator.classify(&header, &mut self.unchanged)? {
                Classification::Unchanged => {
                    self.stats.entries_unchanged += 1;
                    continue;
                }
                Classification::Changed => self.stats.entries_changed += 1,
                Classification::New => self.stats.entries_new += 1,
            }
            let need_data = header.carries_data();
            self.queue.push(FileEntry::new(header, need_data));
        }
        Ok(())
    }

    fn flush_client(&mut self, mux: &mut dyn Multiplexer) -> Result<()> {
        while let Some(message) = self.client_outbox.front() {
            match mux.append_to_client(&message.to_frame()) {
                AppendResult::Ok => {
                    self.client_outbox.pop_front();
                }
                AppendResult::Blocked => break,
                AppendResult::Error => {
                    return Err(StowageError::Channel(format!(
                        "client channel failed while sending {message:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.writer.flush(
            &mut self.queue,
            &mut self.blocks,
            &mut self.champ,
            &mut self.client_outbox,
            &mut self.stats,
        )
    }

    // ── Client input ───────────────────────────────────────────────────

    fn handle_client_frame(&mut self, frame: &Frame) -> Result<()> {
        match ClientMessage::from_frame(frame)? {
            ClientMessage::Data(payload) => self.receive_data(&payload),
            ClientMessage::AttribsSigs { file_no, attribs } => self.open_file(file_no, attribs),
            ClientMessage::Sig(signature) => self.receive_sig(signature),
            ClientMessage::Gen(GenCommand::SigsEnd) => {
                self.termination.set(EndStep::SigsEnd)?;
                self.close_open_range();
                let abandoned = self.abandon_waiting(self.queue.next_seq());
                debug!(abandoned, blocks = self.blocks.next_index(), "client finished sending signatures");
                Ok(())
            }
            ClientMessage::Gen(GenCommand::BackupEnd) => {
                self.termination.set(EndStep::BackupEnd)?;
                debug!("client declared backup complete");
                Ok(())
            }
            ClientMessage::Gen(other) => Err(StowageError::Protocol(format!(
                "client sent server sentinel '{}'",
                other.as_str()
            ))),
            ClientMessage::Message(text) => {
                info!(client = %text, "client message");
                Ok(())
            }
            ClientMessage::Warning(text) => {
                warn!(client = %text, "client warning");
                Ok(())
            }
        }
    }

    /// Store a payload in the slot reserved for the oldest outstanding request.
    fn receive_data(&mut self, payload: &[u8]) -> Result<()> {
        let index = self.blocks.awaiting_data().ok_or_else(|| {
            StowageError::Protocol("block data received without an outstanding request".into())
        })?;
        let save_path = self
            .blocks
            .get(index)
            .and_then(|b| b.save_path)
            .ok_or_else(|| StowageError::Invariant(format!("requested block {index} has no save path")))?;
        self.store.write_block(&save_path, payload)?;
        self.blocks.mark_received(index, payload.len())?;
        self.stats.blocks_fetched += 1;
        self.stats.bytes_received += payload.len() as u64;
        Ok(())
    }

    /// Fresh attributes for an announced file; its signatures follow.
    fn open_file(&mut self, file_no: u64, attribs: Attribs) -> Result<()> {
        if self.termination.is_set(EndStep::SigsEnd) {
            return Err(StowageError::Protocol(format!(
                "attributes for file {file_no} after sigs_end"
            )));
        }
        let seq = self.queue.find_file_no(file_no).ok_or_else(|| {
            StowageError::Protocol(format!("attributes for unknown file number {file_no}"))
        })?;
        let entry = self
            .queue
            .get(seq)
            .ok_or_else(|| StowageError::Invariant(format!("queued entry {seq} vanished")))?;
        if entry.abandoned {
            return Err(StowageError::Protocol(format!(
                "attributes for file {file_no} ({}) after a later file",
                entry.path
            )));
        }
        if entry.range.is_some() {
            return Err(StowageError::Protocol(format!(
                "attributes for file {file_no} ({}) sent twice",
                entry.path
            )));
        }
        self.close_open_range();
        self.abandon_waiting(seq);

        let start = self.blocks.next_index();
        let entry = self
            .queue
            .get_mut(seq)
            .ok_or_else(|| StowageError::Invariant(format!("queued entry {seq} vanished")))?;
        entry.attribs = attribs;
        entry.range = Some(BlockRange { start, end: None });
        entry.next_request = start;
        self.queue.set_sig_cursor(seq);
        Ok(())
    }

    fn receive_sig(&mut self, signature: Signature) -> Result<()> {
        let open = self
            .queue
            .get(self.queue.sig_cursor())
            .and_then(|e| e.range)
            .is_some_and(|r| !r.is_closed());
        if !open {
            return Err(StowageError::Protocol(
                "signature received outside of a file".into(),
            ));
        }
        self.blocks.push(signature);
        self.stats.blocks_total += 1;
        Ok(())
    }

    /// Close the range of the entry signatures were last appended to.
    fn close_open_range(&mut self) {
        let end = self.blocks.next_index();
        if let Some(entry) = self.queue.get_mut(self.queue.sig_cursor()) {
            if let Some(range) = entry.range.as_mut() {
                if range.end.is_none() {
                    range.end = Some(end);
                }
            }
        }
    }

    /// Mark every entry before `until` that is still waiting for signatures
    /// as skipped by the client.
    fn abandon_waiting(&mut self, until: u64) -> u64 {
        let mut abandoned = 0;
        for seq in self.queue.sig_cursor()..until {
            if let Some(entry) = self.queue.get_mut(seq) {
                if entry.awaiting_sigs() && entry.sent_path {
                    entry.abandoned = true;
                    abandoned += 1;
                }
            }
        }
        abandoned
    }

    // ── Champ chooser input ────────────────────────────────────────────

    fn handle_champ_frame(&mut self, frame: &Frame) -> Result<()> {
        let verdict = self
            .champ
            .handle_frame(frame, &mut self.blocks, &mut self.store)?;
        if let ChampVerdict::Found { .. } = verdict {
            self.stats.blocks_deduplicated += 1;
        }
        Ok(())
    }

    // ── Shutdown ───────────────────────────────────────────────────────

    /// Close any range the client left open, commit once more and verify
    /// that nothing is left behind.
    fn finish(&mut self) -> Result<SessionStats> {
        self.close_open_range();
        self.abandon_waiting(self.queue.next_seq());
        self.commit()?;

        if !self.queue.is_empty() || !self.blocks.is_empty() {
            let head = self.queue.front().map(|e| e.path.clone());
            return Err(StowageError::Invariant(format!(
                "{} entries and {} blocks left at end of backup (oldest entry {head:?})",
                self.queue.len(),
                self.blocks.len()
            )));
        }
        if !self.client_outbox.is_empty() {
            debug!(
                pending = self.client_outbox.len(),
                "dropping client notices queued after backup end"
            );
        }

        debug!(
            scanned = self.scan.entries_read(),
            changed_records = self.writer.records_written(),
            unchanged_records = self.unchanged.records_written(),
            "manifests complete"
        );
        self.stats.files_announced = self.pipeline.files_announced();
        self.stats.sigs_sent = self.champ.sigs_sent();
        Ok(self.stats.clone())
    }

    /// Close manifests and release the block store. Consumes the session.
    fn close(self) -> Result<()> {
        self.writer.close()?;
        self.unchanged.close()?;
        let mut store = self.store;
        store.release_all()
    }
}

#[cfg(test)]
impl Phase2Session {
    /// [`run`](Self::run), handing the session to `observe` after every
    /// queue fill.
    pub(crate) fn run_observed(
        mut self,
        mux: &mut dyn Multiplexer,
        mut observe: impl FnMut(&Self),
    ) -> Result<SessionStats> {
        while !self.termination.finished() {
            self.fill_queue()?;
            observe(&self);
            self.exchange(mux)?;
        }
        let stats = self.finish()?;
        self.close()?;
        Ok(stats)
    }

    pub(crate) fn queue_span(&self) -> u64 {
        self.queue.span()
    }

    pub(crate) fn entries_scanned(&self) -> u64 {
        self.scan.entries_read()
    }
}

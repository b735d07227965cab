use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Counters for one phase-2 session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub entries_new: u64,
    pub entries_changed: u64,
    pub entries_unchanged: u64,
    pub files_announced: u64,
    /// Blocks announced by client signatures.
    pub blocks_total: u64,
    /// Blocks the champ chooser found an existing copy of.
    pub blocks_deduplicated: u64,
    /// Blocks fetched from the client and stored.
    pub blocks_fetched: u64,
    pub bytes_received: u64,
    pub data_requests: u64,
    /// Entries the client never sent signatures for.
    pub entries_abandoned: u64,
    /// Signatures forwarded to the champ chooser.
    pub sigs_sent: u64,
}

/// Stats of a finished session together with its wall-clock span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub stats: SessionStats,
}

impl SessionReport {
    pub fn log(&self) {
        let s = &self.stats;
        info!(
            duration_ms = (self.finished - self.started).num_milliseconds(),
            new = s.entries_new,
            changed = s.entries_changed,
            unchanged = s.entries_unchanged,
            abandoned = s.entries_abandoned,
            files = s.files_announced,
            blocks = s.blocks_total,
            deduplicated = s.blocks_deduplicated,
            fetched = s.blocks_fetched,
            bytes = s.bytes_received,
            "backup phase 2 complete"
        );
    }
}

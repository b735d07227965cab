//! Four-step end-of-session handshake.
//!
//! Each step is set at most once, in order: the server has announced every
//! path, the client has sent every signature, the server has sent every block
//! request, and finally the client declares the backup complete.

use stowage_types::error::{Result, StowageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndStep {
    RequestsEnd,
    SigsEnd,
    BlkRequestsEnd,
    BackupEnd,
}

impl EndStep {
    const ORDER: [EndStep; 4] = [
        EndStep::RequestsEnd,
        EndStep::SigsEnd,
        EndStep::BlkRequestsEnd,
        EndStep::BackupEnd,
    ];

    fn position(self) -> usize {
        match self {
            EndStep::RequestsEnd => 0,
            EndStep::SigsEnd => 1,
            EndStep::BlkRequestsEnd => 2,
            EndStep::BackupEnd => 3,
        }
    }

    fn prerequisite(self) -> Option<EndStep> {
        self.position().checked_sub(1).map(|p| Self::ORDER[p])
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndStep::RequestsEnd => "requests_end",
            EndStep::SigsEnd => "sigs_end",
            EndStep::BlkRequestsEnd => "blk_requests_end",
            EndStep::BackupEnd => "backup_end",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Termination {
    reached: [bool; 4],
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self, step: EndStep) -> bool {
        self.reached[step.position()]
    }

    /// Record `step`. Setting a step twice, or before its prerequisite, is a
    /// protocol violation.
    pub fn set(&mut self, step: EndStep) -> Result<()> {
        if self.is_set(step) {
            return Err(StowageError::Protocol(format!(
                "'{}' received twice",
                step.as_str()
            )));
        }
        if let Some(pre) = step.prerequisite() {
            if !self.is_set(pre) {
                return Err(StowageError::Protocol(format!(
                    "'{}' before '{}'",
                    step.as_str(),
                    pre.as_str()
                )));
            }
        }
        self.reached[step.position()] = true;
        Ok(())
    }

    /// The session loop runs until the client declares the backup complete.
    pub fn finished(&self) -> bool {
        self.is_set(EndStep::BackupEnd)
    }
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use stowage_types::error::{Result, StowageError};

/// How to treat an entry whose mtime is unchanged but whose ctime moved
/// (permissions, ownership or xattrs changed, data did not).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataChangePolicy {
    /// Keep the previous blocks and record the fresh attributes.
    #[default]
    ReuseData,
    /// Fetch the file's data again.
    Refetch,
}

/// Tunables for one phase-2 session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase2Config {
    /// Fan-out bound for each level of the block store directory tree.
    #[serde(default = "default_max_storage_subdirs")]
    pub max_storage_subdirs: u32,
    /// Blocks stored in one data file before a new one is opened.
    #[serde(default = "default_blocks_per_data_file")]
    pub blocks_per_data_file: u32,
    /// Sig records per manifest segment file.
    #[serde(default = "default_sigs_per_manifest_segment")]
    pub sigs_per_manifest_segment: u64,
    /// How far ahead of the oldest uncommitted block the champ chooser may be fed.
    #[serde(default = "default_champ_lookahead")]
    pub champ_lookahead: u64,
    /// Max span of queued file entries before scanning pauses.
    #[serde(default = "default_queue_window")]
    pub queue_window: u64,
    #[serde(default)]
    pub metadata_change_policy: MetadataChangePolicy,
}

fn default_max_storage_subdirs() -> u32 {
    30_000
}

fn default_blocks_per_data_file() -> u32 {
    0xFFFF
}

fn default_sigs_per_manifest_segment() -> u64 {
    4096
}

fn default_champ_lookahead() -> u64 {
    4096
}

fn default_queue_window() -> u64 {
    4096
}

impl Default for Phase2Config {
    fn default() -> Self {
        Self {
            max_storage_subdirs: default_max_storage_subdirs(),
            blocks_per_data_file: default_blocks_per_data_file(),
            sigs_per_manifest_segment: default_sigs_per_manifest_segment(),
            champ_lookahead: default_champ_lookahead(),
            queue_window: default_queue_window(),
            metadata_change_policy: MetadataChangePolicy::default(),
        }
    }
}

impl Phase2Config {
    pub fn validate(&self) -> Result<()> {
        // Fan-out components and slots are 16-bit on disk.
        if !(1..=0xFFFF).contains(&self.max_storage_subdirs) {
            return Err(StowageError::Config(format!(
                "max_storage_subdirs must be in [1, 65535], got {}",
                self.max_storage_subdirs
            )));
        }
        if !(1..=0xFFFF).contains(&self.blocks_per_data_file) {
            return Err(StowageError::Config(format!(
                "blocks_per_data_file must be in [1, 65535], got {}",
                self.blocks_per_data_file
            )));
        }
        if self.sigs_per_manifest_segment == 0 {
            return Err(StowageError::Config(
                "sigs_per_manifest_segment must be at least 1".into(),
            ));
        }
        if self.champ_lookahead == 0 {
            return Err(StowageError::Config(
                "champ_lookahead must be at least 1".into(),
            ));
        }
        if self.queue_window == 0 {
            return Err(StowageError::Config("queue_window must be at least 1".into()));
        }
        Ok(())
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Phase2Config = serde_yaml::from_str(text)
            .map_err(|e| StowageError::Config(format!("invalid phase2 config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StowageError::io_at(path, e))?;
        Self::from_yaml_str(&text)
    }
}

/// On-disk layout of one backup session.
///
/// ```text
/// <root>/phase1/      scan manifest from phase 1
/// <root>/current/     manifest of the previous backup (absent on the first run)
/// <root>/unchanged/   entries copied from the previous backup
/// <root>/changed/     new and modified entries
/// <data>/             block store shared by all backups of this client
/// ```
#[derive(Debug, Clone)]
pub struct SessionDirs {
    pub root: PathBuf,
    pub data: PathBuf,
}

impl SessionDirs {
    pub fn new(root: impl Into<PathBuf>, data: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            data: data.into(),
        }
    }

    pub fn phase1(&self) -> PathBuf {
        self.root.join("phase1")
    }

    pub fn current(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn unchanged(&self) -> PathBuf {
        self.root.join("unchanged")
    }

    pub fn changed(&self) -> PathBuf {
        self.root.join("changed")
    }
}

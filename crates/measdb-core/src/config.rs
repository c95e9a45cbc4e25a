//! Store and writer configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// How NaN and infinite numbers are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonFinitePolicy {
    /// Keep NaN / +inf / -inf exactly as written.
    #[default]
    Preserve,
    /// Store non-finite numbers as null. Quote it in YAML (`"null"`).
    Null,
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Readers never block on the writer.
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    pub fn pragma_value(self) -> &'static str {
        match self {
            JournalMode::Wal => "wal",
            JournalMode::Delete => "delete",
        }
    }
}

/// Configuration for opening a [`RunStore`](crate::store::RunStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the database file (created if missing).
    pub path: PathBuf,
    /// Migrate files with an older schema on open. When false, opening an
    /// old file fails with `UpgradeRequired`.
    #[serde(default = "default_true")]
    pub auto_upgrade: bool,
    #[serde(default)]
    pub non_finite: NonFinitePolicy,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub journal_mode: JournalMode,
}

fn default_true() -> bool {
    true
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            auto_upgrade: true,
            non_finite: NonFinitePolicy::default(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: JournalMode::default(),
        }
    }

    pub fn with_auto_upgrade(mut self, auto_upgrade: bool) -> Self {
        self.auto_upgrade = auto_upgrade;
        self
    }

    pub fn with_non_finite(mut self, policy: NonFinitePolicy) -> Self {
        self.non_finite = policy;
        self
    }

    /// Load a config from a YAML file. A relative `path` inside the file is
    /// resolved against the YAML file's directory.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: StoreConfig = serde_yaml::from_str(&content)?;
        if config.path.is_relative() {
            if let Some(parent) = path.parent() {
                config.path = parent.join(&config.path);
            }
        }
        Ok(config)
    }
}

/// Configuration for the buffered [`ResultWriter`](crate::engine::ResultWriter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Commit buffered rows every N rows (default: 50)
    pub flush_interval_rows: usize,
    /// Commit buffered rows every N milliseconds (default: 500)
    pub flush_interval_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval_rows: 50,
            flush_interval_ms: 500,
        }
    }
}

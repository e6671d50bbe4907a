use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// What happens to `validFrom` when an active row is updated.
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    /// The new version starts at the update instant; intervals stay contiguous.
    #[default]
    Refresh,
    /// The active row keeps the validFrom of its first version.
    Preserve,
}

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    /// Close the interval and keep the row in history.
    #[default]
    Archive,
    /// Erase the active row and its whole history.
    Purge,
}

/// Treatment of caller-supplied `validFrom` / `validTo`.
#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FieldPolicy {
    #[default]
    Strip,
    Reject,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub update_policy: UpdatePolicy,
    pub delete_policy: DeletePolicy,
    /// Bounded wait for one attempt at the per-book lock.
    pub lock_timeout: Duration,
    /// Attempts before surfacing ConcurrentModification.
    pub max_attempts: u32,
    pub strict_durability: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            update_policy: UpdatePolicy::default(),
            delete_policy: DeletePolicy::default(),
            lock_timeout: Duration::from_millis(250),
            max_attempts: 3,
            strict_durability: true,
        }
    }
}

/// Server settings as read from an optional JSON file. Absent keys keep their defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    pub addr: String,
    pub data_dir: PathBuf,
    pub in_memory: bool,
    pub update_policy: UpdatePolicy,
    pub delete_policy: DeletePolicy,
    pub field_policy: FieldPolicy,
    pub lock_timeout_ms: u64,
    pub max_attempts: u32,
    /// 0 disables the background checkpoint.
    pub checkpoint_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:4004".to_string(),
            data_dir: PathBuf::from("data"),
            in_memory: false,
            update_policy: UpdatePolicy::default(),
            delete_policy: DeletePolicy::default(),
            field_policy: FieldPolicy::default(),
            lock_timeout_ms: 250,
            max_attempts: 3,
            checkpoint_secs: 600,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn store_config(&self, strict_durability: bool) -> StoreConfig {
        StoreConfig {
            update_policy: self.update_policy,
            delete_policy: self.delete_policy,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            max_attempts: self.max_attempts.max(1),
            strict_durability,
        }
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("books.journal")
    }
}

//! Broker configuration.
//!
//! Every struct deserializes with `#[serde(default)]` so a JSON file only needs
//! to name the settings it changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Journal storage options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Directory holding the journal files.
    pub directory: PathBuf,

    /// Size of every journal file in bytes.
    /// Default: 10 MB
    pub file_size: usize,

    /// Files created up front and kept in the free pool.
    /// Default: 2
    pub min_files: usize,

    /// File extension for journal files.
    /// Default: "jrn"
    pub file_extension: String,

    /// Wait for durability before completing transactional records.
    /// Default: true
    pub sync_transactional: bool,

    /// Wait for durability before completing non-transactional records.
    /// Default: false
    pub sync_non_transactional: bool,

    /// Upper bound on a blocking append waiting for the flusher.
    /// Default: 30 s
    pub sync_timeout_ms: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/journal"),
            file_size: 10 * 1024 * 1024,
            min_files: 2,
            file_extension: "jrn".to_string(),
            sync_transactional: true,
            sync_non_transactional: false,
            sync_timeout_ms: 30_000,
        }
    }
}

impl JournalConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }
}

/// How a queue spreads references over its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionPolicy {
    /// Rotate the first consumer tried between deliveries.
    #[default]
    RoundRobin,
    /// Always start from the first consumer.
    FirstAvailable,
}

/// Per-address settings. Unset fields inherit from less specific matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressSettings {
    pub max_size_messages: Option<usize>,
    /// In-memory message count at which the address starts paging.
    pub page_max_messages: Option<usize>,
    pub page_size_bytes: Option<usize>,
    pub dead_letter_address: Option<String>,
    pub expiry_address: Option<String>,
    pub max_delivery_attempts: Option<u32>,
    pub redelivery_delay_ms: Option<u64>,
    pub distribution: Option<DistributionPolicy>,
}

impl AddressSettings {
    /// Fills every unset field from `fallback`.
    pub fn merge(&mut self, fallback: &AddressSettings) {
        fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(from);
            }
        }
        fill(&mut self.max_size_messages, &fallback.max_size_messages);
        fill(&mut self.page_max_messages, &fallback.page_max_messages);
        fill(&mut self.page_size_bytes, &fallback.page_size_bytes);
        fill(&mut self.dead_letter_address, &fallback.dead_letter_address);
        fill(&mut self.expiry_address, &fallback.expiry_address);
        fill(&mut self.max_delivery_attempts, &fallback.max_delivery_attempts);
        fill(&mut self.redelivery_delay_ms, &fallback.redelivery_delay_ms);
        fill(&mut self.distribution, &fallback.distribution);
    }

    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts.unwrap_or(10)
    }

    pub fn redelivery_delay_ms(&self) -> u64 {
        self.redelivery_delay_ms.unwrap_or(0)
    }

    pub fn page_size_bytes(&self) -> usize {
        self.page_size_bytes.unwrap_or(10 * 1024 * 1024)
    }

    pub fn distribution(&self) -> DistributionPolicy {
        self.distribution.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub user: String,
    pub password: String,
}

/// Top-level broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub journal: JournalConfig,

    /// When false, nothing is journaled and durable messages behave as
    /// non-durable.
    /// Default: true
    pub persistence_enabled: bool,

    /// Root directory of per-address page stores.
    pub paging_directory: PathBuf,

    /// Fail sends that match no binding.
    /// Default: false
    pub require_destinations: bool,

    /// Reject messages with a cached duplicate id instead of dropping them.
    /// Default: false
    pub reject_duplicates: bool,

    /// Duplicate ids remembered per address.
    /// Default: 2000
    pub id_cache_size: usize,

    /// Ids reserved per journal write of the id ceiling.
    /// Default: 1000
    pub id_batch_size: u64,

    /// Period of the ticker that promotes scheduled references.
    /// Default: 100 ms
    pub scheduler_tick_ms: u64,

    /// Default timeout for transactions, 0 disables.
    /// Default: 300 s
    pub transaction_timeout_ms: u64,

    /// Timeout for blocking client calls.
    /// Default: 30 s
    pub call_timeout_ms: u64,

    /// Largest packet frame accepted from a TCP peer.
    /// Default: 100 MiB
    pub max_frame_size: usize,

    pub security_enabled: bool,
    pub users: Vec<UserConfig>,

    /// Address settings keyed by address pattern (`*` and `#` wildcards).
    pub address_settings: BTreeMap<String, AddressSettings>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            journal: JournalConfig::default(),
            persistence_enabled: true,
            paging_directory: PathBuf::from("data/paging"),
            require_destinations: false,
            reject_duplicates: false,
            id_cache_size: 2000,
            id_batch_size: 1000,
            scheduler_tick_ms: 100,
            transaction_timeout_ms: 300_000,
            call_timeout_ms: 30_000,
            max_frame_size: crate::remoting::DEFAULT_MAX_FRAME_SIZE,
            security_enabled: false,
            users: Vec::new(),
            address_settings: BTreeMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Configuration with journal and paging under one data directory.
    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            journal: JournalConfig::new(dir.join("journal")),
            paging_directory: dir.join("paging"),
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

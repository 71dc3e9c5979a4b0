//! Runtime configuration
//!
//! Every tunable has a serde default so an empty TOML file (or none at all)
//! yields a working configuration. Paths derive from one data directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::eventstore::FsyncPolicy;
use crate::scoring::{DecayConfig, ScoringWeights};

/// Configuration error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AtlasConfig {
    pub storage: StorageConfig,
    pub scoring: ScoringConfig,
    pub retrieval: RetrievalConfig,
    pub extraction: ExtractionConfig,
    pub consumers: ConsumersConfig,
    pub consolidation: ConsolidationConfig,
    pub server: ServerConfig,
}

impl AtlasConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn event_store_path(&self) -> PathBuf {
        self.storage.data_dir.join("events.db")
    }

    pub fn graph_store_path(&self) -> PathBuf {
        self.storage.data_dir.join("graph.db")
    }

    pub fn payload_store_path(&self) -> PathBuf {
        self.storage.data_dir.join("payloads.db")
    }

    pub fn payload_key_dir(&self) -> PathBuf {
        self.storage.data_dir.join("keys")
    }
}

/// Backing-store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub fsync: FsyncPolicy,
    /// Dedup set TTL in hours
    pub dedup_ttl_hours: u64,
    /// Hot tier: stream entries + documents
    pub hot_days: i64,
    /// Retention ceiling: documents beyond this are deleted
    pub ceiling_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlas-data"),
            fsync: FsyncPolicy::EverySecond,
            dedup_ttl_hours: 24,
            hot_days: 7,
            ceiling_days: 90,
        }
    }
}

/// Decay scoring configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    pub decay: DecayConfig,
}

/// Retrieval bounds and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RetrievalConfig {
    pub max_nodes: usize,
    pub max_depth: usize,
    /// Hard cap on caller-supplied max_depth
    pub max_depth_cap: usize,
    pub timeout_ms: u64,
    /// Effective edge weight below which traversal does not follow
    pub weight_threshold: f64,
    /// Cosine similarity above which SIMILAR_TO edges are created
    pub similarity_threshold: f64,
    /// Upper bound on proactive additions per response
    pub proactive_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_nodes: 50,
            max_depth: 3,
            max_depth_cap: 10,
            timeout_ms: 500,
            weight_threshold: 0.5,
            similarity_threshold: 0.85,
            proactive_limit: 3,
        }
    }
}

/// Extraction consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ExtractionConfig {
    /// Per-session turn count that triggers extraction before session end
    pub turn_threshold: u64,
    /// LLM endpoint; when absent the rule-based extractor runs
    pub llm_endpoint: Option<String>,
    pub llm_model: Option<String>,
    /// Environment variable holding the provider API key
    pub api_key_env: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            turn_threshold: 10,
            llm_endpoint: None,
            llm_model: None,
            api_key_env: "ATLAS_LLM_API_KEY".to_string(),
        }
    }
}

/// Consumer-loop configuration shared by the four consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ConsumersConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// Pending entries idle past this are reclaimed by another worker
    pub claim_idle_ms: u64,
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            batch_size: 32,
            claim_idle_ms: 30_000,
        }
    }
}

/// Consolidation scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ConsolidationConfig {
    pub interval_hours: u64,
    /// Accumulated importance that fires an immediate reflection pass
    pub reflection_threshold: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            reflection_threshold: 150.0,
        }
    }
}

/// HTTP server binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7430,
        }
    }
}

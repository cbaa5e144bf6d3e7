//! Configuration for filter chains
//!
//! A chain is described by one [`ChainConfig`] file holding:
//! - engine tuning shared by every stage ([`EngineConfig`])
//! - logging setup ([`LoggingConfig`])
//! - the ordered stage list ([`StageConfig`])
//! - the platform block pools stages allocate from ([`BlockPoolConfig`])
//!
//! # Formats
//!
//! Files ending in `.toml` are read and written as TOML, files ending in
//! `.json` as JSON. Every section is `#[serde(default)]`, so a partial file
//! only overrides what it names.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! control_timeout_ms = 500
//! propagation = "BestEffort"
//!
//! [[stages]]
//! name = "gdc"
//! kind = "Gdc"
//! allocator_store_id = 2
//! options = { enabled = true, m2m = false }
//! ```

use crate::chain::{PoolKind, StageKind};
use crate::error::{FilterError, Result};
use crate::logging::LogLevel;
use crate::types::{BufferUsage, ParamBag, ParamValue};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "dev.filterchain.filterchain-rs";

/// Default config filename
pub const CONFIG_FILE: &str = "chain.toml";

/// Default control-plane rendezvous budget in milliseconds
pub const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 2000;

/// Default owner mailbox depth
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Path of the per-user chain config, if the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

// ==================== Engine ====================

/// What a chain-wide control call does when one stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PropagationPolicy {
    /// Halt at the failing stage; downstream stages keep their state.
    #[default]
    StopOnFailure,
    /// Keep going downstream and report the first failure.
    BestEffort,
}

/// Tuning shared by every stage engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Budget for each stage hook during start/stop/flush/reset/release
    pub control_timeout_ms: u64,

    /// Worker threads per stage
    pub workers_per_stage: usize,

    /// Partition worker queues into sessions across control calls
    pub session_mode: bool,

    /// Sleep between allocation retries; 0 yields instead
    pub alloc_backoff_us: u64,

    /// Depth of the owner's completion mailbox
    pub mailbox_capacity: usize,

    pub propagation: PropagationPolicy,

    /// Most verbose level stage loggers emit
    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: DEFAULT_CONTROL_TIMEOUT_MS,
            workers_per_stage: 1,
            session_mode: false,
            alloc_backoff_us: 0,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            propagation: PropagationPolicy::StopOnFailure,
            log_level: LogLevel::Info,
        }
    }
}

// ==================== Logging ====================

/// Subscriber setup used by [`crate::logging::init_tracing`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub directive: String,

    /// Also write plain-text logs to this file
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directive: "info".to_string(),
            log_file: None,
        }
    }
}

// ==================== Stages ====================

/// One stage of the chain, in chain order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Unique within the chain
    pub name: String,

    pub kind: StageKind,

    /// Block pool this stage allocates from
    pub allocator_store_id: Option<u64>,

    pub usage: BufferUsage,

    /// Kind-specific options
    pub options: ParamBag,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: StageKind::Passthrough,
            allocator_store_id: None,
            usage: BufferUsage::CPU_READ,
            options: ParamBag::new(),
        }
    }
}

impl StageConfig {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Default::default()
        }
    }

    pub fn with_store(mut self, store_id: u64) -> Self {
        self.allocator_store_id = Some(store_id);
        self
    }

    pub fn with_usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(ParamValue::as_bool)
    }

    pub fn option_int(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(ParamValue::as_int)
    }
}

// ==================== Block pools ====================

/// A platform pool stages can be bound to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: u64,
    pub kind: PoolKind,
    /// Buffers outstanding at once; further requests answer TryAgain
    pub max_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockPoolConfig {
    pub pools: Vec<PoolSpec>,

    /// Pool used by stages that name none
    pub default_pool_id: Option<u64>,
}

impl Default for BlockPoolConfig {
    fn default() -> Self {
        Self {
            pools: vec![
                PoolSpec {
                    id: 1,
                    kind: PoolKind::Linear,
                    max_count: 16,
                },
                PoolSpec {
                    id: 2,
                    kind: PoolKind::BufferQueue,
                    max_count: 8,
                },
            ],
            default_pool_id: Some(1),
        }
    }
}

impl BlockPoolConfig {
    pub fn find(&self, id: u64) -> Option<&PoolSpec> {
        self.pools.iter().find(|p| p.id == id)
    }
}

// ==================== Chain ====================

/// Complete description of a chain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub stages: Vec<StageConfig>,
    pub block_pool: BlockPoolConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

fn format_of(path: &Path) -> Result<ConfigFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(ConfigFormat::Toml),
        Some("json") => Ok(ConfigFormat::Json),
        _ => Err(FilterError::Config(format!(
            "Unsupported config format {:?} (expected .toml or .json)",
            path
        ))),
    }
}

impl ChainConfig {
    /// A three-stage chain exercising every stage kind.
    pub fn sample() -> Self {
        Self {
            stages: vec![
                StageConfig::new("input", StageKind::Passthrough),
                StageConfig::new("gdc", StageKind::Gdc)
                    .with_store(2)
                    .with_usage(BufferUsage::HW_GDC)
                    .with_option("enabled", ParamValue::Bool(true))
                    .with_option("m2m", ParamValue::Bool(false)),
                StageConfig::new("scaler", StageKind::Splitter)
                    .with_store(1)
                    .with_option("outputs", ParamValue::Int(2)),
            ],
            ..Default::default()
        }
    }

    /// Load from a `.toml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            FilterError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        let config: Self = match format {
            ConfigFormat::Toml => toml::from_str(&content).map_err(|e| {
                FilterError::Config(format!("Failed to parse config {:?}: {}", path, e))
            })?,
            ConfigFormat::Json => serde_json::from_str(&content).map_err(|e| {
                FilterError::Config(format!("Failed to parse config {:?}: {}", path, e))
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a config, returning the sample chain on any error
    pub fn load_or_sample(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load chain config, using sample: {}", e);
            Self::sample()
        })
    }

    /// Save as `.toml` or `.json`, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let format = format_of(path)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                FilterError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = match format {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| FilterError::Config(format!("Failed to serialize config: {}", e)))?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| FilterError::Config(format!("Failed to serialize config: {}", e)))?,
        };

        std::fs::write(path, content)
            .map_err(|e| FilterError::Config(format!("Failed to write config {:?}: {}", path, e)))
    }

    /// Reject configs no chain could be built from
    pub fn validate(&self) -> Result<()> {
        if self.engine.control_timeout_ms == 0 {
            return Err(FilterError::Config(
                "control_timeout_ms must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.is_empty() {
                return Err(FilterError::Config("Stage with empty name".to_string()));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(FilterError::Config(format!(
                    "Duplicate stage name '{}'",
                    stage.name
                )));
            }
            if let Some(store) = stage.allocator_store_id {
                if self.block_pool.find(store).is_none() {
                    return Err(FilterError::Config(format!(
                        "Stage '{}' names unknown pool {}",
                        stage.name, store
                    )));
                }
            }
        }
        Ok(())
    }
}

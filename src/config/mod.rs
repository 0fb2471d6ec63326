/// Configuration system for the incremental bundle cache
///
/// Supports loading from multiple sources with priority:
/// Environment variables > Config file > Defaults
use crate::error::{CacheError, ConfigError};
use crate::manifest::MANIFEST_SCHEMA_VERSION;
use crate::policy::HeavyFilePolicy;
use crate::types::BundleFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Incremental cache configuration
    #[serde(default)]
    pub incremental: IncrementalConfig,

    /// Heavy-file thresholds (raw overrides; see [`HeavyFilePolicy::resolve`])
    #[serde(default)]
    pub heavy_file: HeavyFileConfig,

    /// Bundle codec limits and offload settings
    #[serde(default)]
    pub codec: CodecConfig,

    /// Cross-file writeback settings
    #[serde(default)]
    pub writeback: WritebackConfig,
}

/// Incremental cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    /// Disable to always rebuild from scratch
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Wire format for newly written bundles
    #[serde(default)]
    pub bundle_format: BundleFormat,

    /// Root directory holding per-repository caches
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// How long to wait for another build holding the mode lock
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Log the reason whenever whole-index reuse is rejected
    #[serde(default)]
    pub explain_reuse: bool,
}

/// Raw heavy-file overrides; unset or zero values fall back to built-in defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeavyFileConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_enabled")]
    pub skip_tokenization: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_min_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_min_lines: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_min_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_only_min_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_only_min_lines: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_tokenization_max_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_tokenization_max_lines: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_tokenization_max_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_tokenization_chunk_only_min_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_tokenization_chunk_only_min_lines: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_tokenization_coalesce_max_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot_path_target_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot_path_min_chunks: Option<u64>,
}

/// Bundle codec limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Bundles at or above this size never get fully read into memory
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,

    /// Binary checksums are only verified below this payload size
    #[serde(default = "default_checksum_verify_max_bytes")]
    pub checksum_verify_max_bytes: usize,

    /// Payloads at or above this size use sha256 instead of blake3
    #[serde(default = "default_crypto_checksum_min_bytes")]
    pub crypto_checksum_min_bytes: usize,

    /// Payload size range in which normalize+checksum is offloaded
    #[serde(default = "default_offload_min_bytes")]
    pub offload_min_bytes: usize,
    #[serde(default = "default_offload_max_bytes")]
    pub offload_max_bytes: usize,

    /// Offload timeout before falling back to the synchronous path
    #[serde(default = "default_offload_timeout_ms")]
    pub offload_timeout_ms: u64,

    /// Concurrent offload jobs (0 = derive from CPU count)
    #[serde(default)]
    pub offload_workers: usize,

    /// Preferred serialized size of one bundle shard
    #[serde(default = "default_shard_target_bytes")]
    pub shard_target_bytes: usize,

    /// Hard cap on one serialized shard
    #[serde(default = "default_shard_max_bytes")]
    pub shard_max_bytes: usize,

    #[serde(default = "default_patch_max_entry_bytes")]
    pub patch_max_entry_bytes: usize,
    #[serde(default = "default_patch_max_total_bytes")]
    pub patch_max_total_bytes: u64,
    #[serde(default = "default_patch_max_entries")]
    pub patch_max_entries: usize,
}

/// Cross-file writeback configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritebackConfig {
    /// Files modified within this window are updated first
    #[serde(default = "default_hot_window_secs")]
    pub hot_window_secs: u64,

    /// Log progress every N completed updates
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,

    /// Fixed worker count; derived from CPU count and load when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Length of the CPU idle sample taken before dispatch
    #[serde(default = "default_cpu_sample_ms")]
    pub cpu_sample_ms: u64,
}

// Default value functions
fn default_enabled() -> bool {
    true
}

fn default_cache_root() -> PathBuf {
    crate::paths::PlatformPaths::default_cache_root()
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_max_read_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_checksum_verify_max_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_crypto_checksum_min_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_offload_min_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_offload_max_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_offload_timeout_ms() -> u64 {
    15_000
}

fn default_shard_target_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_shard_max_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_patch_max_entry_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_patch_max_total_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_patch_max_entries() -> usize {
    64
}

fn default_hot_window_secs() -> u64 {
    10 * 60
}

fn default_progress_interval() -> usize {
    500
}

fn default_cpu_sample_ms() -> u64 {
    40
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            bundle_format: BundleFormat::default(),
            cache_root: default_cache_root(),
            lock_timeout_secs: default_lock_timeout_secs(),
            explain_reuse: false,
        }
    }
}

impl Default for HeavyFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            skip_tokenization: default_enabled(),
            max_bytes: None,
            max_lines: None,
            max_chunks: None,
            path_min_bytes: None,
            path_min_lines: None,
            path_min_chunks: None,
            chunk_only_min_bytes: None,
            chunk_only_min_lines: None,
            skip_tokenization_max_bytes: None,
            skip_tokenization_max_lines: None,
            skip_tokenization_max_chunks: None,
            skip_tokenization_chunk_only_min_bytes: None,
            skip_tokenization_chunk_only_min_lines: None,
            skip_tokenization_coalesce_max_chunks: None,
            hot_path_target_chunks: None,
            hot_path_min_chunks: None,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_read_bytes: default_max_read_bytes(),
            checksum_verify_max_bytes: default_checksum_verify_max_bytes(),
            crypto_checksum_min_bytes: default_crypto_checksum_min_bytes(),
            offload_min_bytes: default_offload_min_bytes(),
            offload_max_bytes: default_offload_max_bytes(),
            offload_timeout_ms: default_offload_timeout_ms(),
            offload_workers: 0,
            shard_target_bytes: default_shard_target_bytes(),
            shard_max_bytes: default_shard_max_bytes(),
            patch_max_entry_bytes: default_patch_max_entry_bytes(),
            patch_max_total_bytes: default_patch_max_total_bytes(),
            patch_max_entries: default_patch_max_entries(),
        }
    }
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            hot_window_secs: default_hot_window_secs(),
            progress_interval: default_progress_interval(),
            max_concurrency: None,
            cpu_sample_ms: default_cpu_sample_ms(),
        }
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> CacheError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
    .into()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self, CacheError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseFailed(format!("Invalid TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location or create default
    pub fn load_or_default() -> Result<Self, CacheError> {
        let config_path = crate::paths::PlatformPaths::default_config_path();

        if config_path.exists() {
            tracing::info!("Loading config from: {}", config_path.display());
            Self::from_file(&config_path)
        } else {
            tracing::info!("No config file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ConfigError::SaveFailed(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved config to: {}", path.display());
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), CacheError> {
        let codec = &self.codec;

        if codec.max_read_bytes == 0 {
            return Err(invalid("codec.max_read_bytes", "must be greater than 0"));
        }

        if codec.shard_target_bytes == 0 || codec.shard_target_bytes > codec.shard_max_bytes {
            return Err(invalid(
                "codec.shard_target_bytes",
                format!(
                    "must be between 1 and shard_max_bytes ({}), got {}",
                    codec.shard_max_bytes, codec.shard_target_bytes
                ),
            ));
        }

        if codec.offload_min_bytes > codec.offload_max_bytes {
            return Err(invalid(
                "codec.offload_min_bytes",
                "must not exceed codec.offload_max_bytes",
            ));
        }

        if codec.offload_timeout_ms == 0 {
            return Err(invalid("codec.offload_timeout_ms", "must be greater than 0"));
        }

        if codec.patch_max_entries == 0 {
            return Err(invalid("codec.patch_max_entries", "must be greater than 0"));
        }

        if codec.patch_max_entry_bytes as u64 > codec.patch_max_total_bytes {
            return Err(invalid(
                "codec.patch_max_entry_bytes",
                "must not exceed codec.patch_max_total_bytes",
            ));
        }

        if self.writeback.progress_interval == 0 {
            return Err(invalid("writeback.progress_interval", "must be greater than 0"));
        }

        if self.writeback.max_concurrency == Some(0) {
            return Err(invalid("writeback.max_concurrency", "must be greater than 0"));
        }

        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("PROJECT_RAG_INCREMENTAL") {
            self.incremental.enabled = !matches!(
                enabled.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            );
        }

        if let Ok(format) = std::env::var("PROJECT_RAG_BUNDLE_FORMAT") {
            match BundleFormat::from_name(&format) {
                Some(parsed) => self.incremental.bundle_format = parsed,
                None => tracing::warn!("Ignoring unknown PROJECT_RAG_BUNDLE_FORMAT '{}'", format),
            }
        }

        if let Ok(root) = std::env::var("PROJECT_RAG_CACHE_ROOT") {
            self.incremental.cache_root = PathBuf::from(root);
        }

        if let Ok(concurrency) = std::env::var("PROJECT_RAG_WRITEBACK_CONCURRENCY")
            && let Ok(value) = concurrency.parse()
        {
            self.writeback.max_concurrency = Some(value);
        }

        if let Ok(timeout) = std::env::var("PROJECT_RAG_OFFLOAD_TIMEOUT_MS")
            && let Ok(value) = timeout.parse()
        {
            self.codec.offload_timeout_ms = value;
        }
    }

    /// Create a new Config with defaults and environment overrides
    pub fn new() -> Result<Self, CacheError> {
        let mut config = Self::load_or_default()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Resolved heavy-file policy for this build
    pub fn heavy_file_policy(&self) -> HeavyFilePolicy {
        HeavyFilePolicy::resolve(&self.heavy_file)
    }

    /// Field-level view of every setting that changes bundle contents
    pub fn signature_summary(&self) -> BTreeMap<String, Value> {
        let mut summary = BTreeMap::new();
        summary.insert(
            "manifestSchemaVersion".to_string(),
            Value::from(MANIFEST_SCHEMA_VERSION),
        );
        if let Ok(Value::Object(fields)) = serde_json::to_value(self.heavy_file_policy()) {
            for (key, value) in fields {
                summary.insert(format!("heavyFile.{}", key), value);
            }
        }
        summary
    }

    /// Fingerprint of [`Config::signature_summary`]
    pub fn cache_signature(&self) -> String {
        signature_of(&self.signature_summary())
    }
}

/// sha256 over the canonical JSON of a signature summary
pub fn signature_of(summary: &BTreeMap<String, Value>) -> String {
    let canonical = serde_json::to_string(summary).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

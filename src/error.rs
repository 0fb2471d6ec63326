/// Centralized error types for the incremental bundle cache using thiserror
///
/// Cache-miss-equivalent failures (missing bundle, checksum mismatch, corrupt sidecar)
/// are modelled separately by [`BundleReadFailure`] so callers can recompute instead of
/// aborting. Everything in [`CacheError`] is a real failure.
use thiserror::Error;

/// Main error type for the incremental cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Bundle error: {0}")]
    Bundle(#[from] BundleError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Errors raised while writing bundles
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Failed to serialize bundle for '{file}': {reason}")]
    SerializeFailed { file: String, reason: String },

    #[error("Bundle for '{file}' exceeds hard cap: {size} > {max} bytes")]
    TooLarge { file: String, size: usize, max: usize },

    #[error("Failed to write bundle '{path}': {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Bundle has no shards: {0}")]
    NoShards(String),
}

/// Errors related to manifest handling
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Unsafe bundle name '{name}' for '{file}': bundle names must be bare filenames")]
    UnsafeBundleName { file: String, name: String },

    #[error("Failed to save manifest to '{path}': {reason}")]
    SaveFailed { path: String, reason: String },

    #[error("Failed to create incremental directory '{path}': {reason}")]
    DirectoryCreationFailed { path: String, reason: String },
}

/// Errors related to bundle patches
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Patch splice out of range: start {start} + delete {delete_count} > {len} chunks")]
    OutOfRange {
        start: usize,
        delete_count: usize,
        len: usize,
    },

    #[error("Invalid patch field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Unsupported patch envelope: {0}")]
    UnsupportedEnvelope(String),
}

/// Errors related to configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    LoadFailed(String),

    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    #[error("Invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

/// Errors related to the cross-process build lock
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Another build holds the lock for '{0}'")]
    Busy(String),

    #[error("Failed to acquire build lock '{path}': {reason}")]
    AcquireFailed { path: String, reason: String },
}

/// Reason a cached bundle could not be used.
///
/// Every variant means "treat as not cached": recompute and rewrite.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BundleReadFailure {
    #[error("bundle missing")]
    Missing,

    #[error("bundle exceeds read cap: {size} > {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("invalid bundle envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unsupported bundle version {found}")]
    UnsupportedVersion { found: u32 },

    #[error("bundle checksum mismatch ({algo})")]
    ChecksumMismatch { algo: String },

    #[error("bundle has no chunks array")]
    MissingChunks,

    #[error("failed to parse bundle: {0}")]
    Parse(String),

    #[error("patch sidecar invalid: {0}")]
    PatchInvalid(String),

    #[error("patch sidecar too large: {size} > {max} bytes")]
    PatchTooLarge { size: u64, max: u64 },

    #[error("patch sidecar has too many entries: {count} > {max}")]
    PatchTooManyEntries { count: usize, max: usize },

    #[error("patch entry {line} is {size} bytes (max {max})")]
    PatchEntryTooLarge { line: usize, size: usize, max: usize },

    #[error("patch splice out of range: start {start} + delete {delete_count} > {len}")]
    PatchOutOfRange {
        start: usize,
        delete_count: usize,
        len: usize,
    },

    #[error("bundle shards disagree on file identity")]
    ShardMismatch,

    #[error("io error: {0}")]
    Io(String),
}

impl BundleReadFailure {
    /// Stable machine-readable reason code
    pub fn reason_code(&self) -> &'static str {
        match self {
            BundleReadFailure::Missing => "missing",
            BundleReadFailure::TooLarge { .. } => "too-large",
            BundleReadFailure::InvalidEnvelope(_) => "invalid-envelope",
            BundleReadFailure::UnsupportedVersion { .. } => "unsupported-version",
            BundleReadFailure::ChecksumMismatch { .. } => "checksum-mismatch",
            BundleReadFailure::MissingChunks => "missing-chunks",
            BundleReadFailure::Parse(_) => "parse-failed",
            BundleReadFailure::PatchInvalid(_) => "patch-invalid",
            BundleReadFailure::PatchTooLarge { .. } => "patch-too-large",
            BundleReadFailure::PatchTooManyEntries { .. } => "patch-too-many-entries",
            BundleReadFailure::PatchEntryTooLarge { .. } => "patch-entry-too-large",
            BundleReadFailure::PatchOutOfRange { .. } => "patch-out-of-range",
            BundleReadFailure::ShardMismatch => "shard-mismatch",
            BundleReadFailure::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for BundleReadFailure {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            BundleReadFailure::Missing
        } else {
            BundleReadFailure::Io(err.to_string())
        }
    }
}

impl From<PatchError> for BundleReadFailure {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::OutOfRange {
                start,
                delete_count,
                len,
            } => BundleReadFailure::PatchOutOfRange {
                start,
                delete_count,
                len,
            },
            other => BundleReadFailure::PatchInvalid(other.to_string()),
        }
    }
}

// Conversion from anyhow::Error to CacheError
impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Other(format!("{:#}", err))
    }
}

/// Result alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Create a new error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        CacheError::Other(msg.into())
    }

    /// Errors that indicate corruption or filesystem-escape risk
    pub fn is_hard_failure(&self) -> bool {
        matches!(
            self,
            CacheError::Patch(PatchError::OutOfRange { .. })
                | CacheError::Manifest(ManifestError::UnsafeBundleName { .. })
        )
    }

    /// Errors that only mean "nothing usable was cached"
    pub fn is_cache_miss(&self) -> bool {
        match self {
            CacheError::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            CacheError::Bundle(BundleError::NoShards(_)) => true,
            _ => false,
        }
    }

    /// Check if this is a user error (bad configuration) vs system error
    pub fn is_user_error(&self) -> bool {
        matches!(self, CacheError::Config(_))
    }
}

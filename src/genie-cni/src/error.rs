//! Genie error types
//!
//! Every failure carries the phase it happened in and, where it applies, the
//! backend involved. Errors leave the plugin in the CNI error format, so each
//! kind maps onto a CNI error code.

use thiserror::Error;

/// CNI error codes as defined in the specification
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CniErrorCode {
    /// 1: Incompatible CNI version
    IncompatibleVersion = 1,

    /// 4: Invalid necessary environment variables
    InvalidEnvironmentVariables = 4,

    /// 5: I/O failure
    IoFailure = 5,

    /// 6: Failed to decode content
    DecodingFailure = 6,

    /// 7: Invalid network config
    InvalidNetworkConfig = 7,

    // Plugin-specific errors (100+)

    /// 100: No config and no binary for a requested backend
    BackendNotFound = 100,

    /// 101: Backend selection failed
    SelectionFailure = 101,

    /// 102: Backend ADD/DEL failed
    InvocationFailure = 102,

    /// 103: Backend result could not be reconciled
    InconsistentResult = 103,

    /// 104: Cluster state read or update failed
    ClusterFailure = 104,
}

/// Error raised anywhere in the attachment pipeline
#[derive(Debug, Error)]
pub enum GenieError {
    /// No config file matched and no binary exists for the backend
    #[error("no configuration found for backend {backend}")]
    ConfigNotFound { backend: String },

    /// A binary may exist but genie cannot synthesize a config for it
    #[error(
        "unsupported backend {backend}; supported backends are ({})",
        SUPPORTED_BACKENDS.join(", ")
    )]
    UnsupportedBackend { backend: String },

    /// A config file exists but cannot be used
    #[error("malformed config {path}: {reason}")]
    MalformedConfig { path: String, reason: String },

    /// No selection rule produced a usable backend list
    #[error("backend selection failed: {0}")]
    SelectionFailure(String),

    /// A backend's ADD or DEL reported an error
    #[error("backend {backend} {command} failed: {reason}")]
    InvocationFailure {
        backend: String,
        command: &'static str,
        reason: String,
    },

    /// A backend result that cannot be repaired
    #[error("inconsistent result from backend {backend}: {reason}")]
    InconsistentResult { backend: String, reason: String },

    /// Cluster state rejected a metadata patch
    #[error("failed to patch {namespace}/{name}: {reason}")]
    MetadataPatchFailure {
        namespace: String,
        name: String,
        reason: String,
    },

    /// Cluster state could not be read
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Ranking service query failed
    #[error("ranking service error: {0}")]
    Ranking(String),

    /// CNI environment or CNI_ARGS are missing or malformed
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The configuration asks for a CNI version genie does not speak
    #[error("incompatible CNI version {0}")]
    IncompatibleVersion(String),

    /// Genie's own network configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem or process I/O failed
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON decoding failed
    #[error("{context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Backends genie knows how to name in its errors
pub const SUPPORTED_BACKENDS: &[&str] = &[
    "romana", "weave", "canal", "calico", "flannel", "bridge", "macvlan", "sriov",
];

impl GenieError {
    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a decoding error with context
    pub fn decode(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            context: context.into(),
            source,
        }
    }

    /// Create an invocation error for a backend
    pub fn invocation(backend: &str, command: &'static str, reason: impl Into<String>) -> Self {
        Self::InvocationFailure {
            backend: backend.to_string(),
            command,
            reason: reason.into(),
        }
    }

    /// Create an inconsistent-result error for a backend
    pub fn inconsistent(backend: &str, reason: impl Into<String>) -> Self {
        Self::InconsistentResult {
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }

    /// Get the CNI error code for this error
    pub fn code(&self) -> CniErrorCode {
        match self {
            Self::ConfigNotFound { .. } | Self::UnsupportedBackend { .. } => {
                CniErrorCode::BackendNotFound
            }
            Self::MalformedConfig { .. } | Self::InvalidConfig(_) => {
                CniErrorCode::InvalidNetworkConfig
            }
            Self::SelectionFailure(_) | Self::Ranking(_) => CniErrorCode::SelectionFailure,
            Self::InvocationFailure { .. } => CniErrorCode::InvocationFailure,
            Self::InconsistentResult { .. } => CniErrorCode::InconsistentResult,
            Self::MetadataPatchFailure { .. } | Self::Cluster(_) => CniErrorCode::ClusterFailure,
            Self::IncompatibleVersion(_) => CniErrorCode::IncompatibleVersion,
            Self::InvalidArgs(_) => CniErrorCode::InvalidEnvironmentVariables,
            Self::Io { .. } => CniErrorCode::IoFailure,
            Self::Decode { .. } => CniErrorCode::DecodingFailure,
        }
    }

    /// Get the underlying cause, if any, for the CNI `details` field
    pub fn details(&self) -> Option<String> {
        match self {
            Self::Io { source, .. } => Some(source.to_string()),
            Self::Decode { source, .. } => Some(source.to_string()),
            _ => None,
        }
    }
}

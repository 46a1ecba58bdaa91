use thiserror::Error;

/// mkctr error types
#[derive(Error, Debug)]
pub enum MkctrError {
    /// Missing, conflicting or unparseable caller input
    #[error("Configuration error: {0}")]
    Config(String),

    /// Platform rejected by policy (non-Linux OS, unsupported architecture)
    #[error("Unsupported platform {platform}: {reason}")]
    PlatformRejected { platform: String, reason: String },

    /// Platform variant could not be decoded into a compiler sub-flag
    #[error("Decode error: unexpected variant {variant:?} for {platform}")]
    VariantDecode { platform: String, variant: String },

    /// External compiler exited unsuccessfully; `output` is its combined stdout and stderr
    #[error("Compile failed: {target} for {platform} ({status}){}", compiler_output(.output))]
    CompileFailed {
        target: String,
        platform: String,
        status: String,
        output: String,
    },

    /// Reading layer source content failed
    #[error("Layer I/O error: {path}: {source}")]
    LayerIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Two sources map onto the same destination in one layer
    #[error("Layer conflict: {0} is written by more than one source")]
    LayerConflict(String),

    /// Base manifest media type outside the accepted families
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Delivering an image or index failed
    #[error("Publish to {destination} failed: {message}")]
    Publish {
        destination: String,
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The run was cancelled before completing
    #[error("Cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MkctrError {
    fn from(err: serde_json::Error) -> Self {
        MkctrError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MkctrError {
    fn from(err: serde_yaml::Error) -> Self {
        MkctrError::Serialization(err.to_string())
    }
}

/// Trimmed compiler output appended to a compile failure, if there is any.
fn compiler_output(output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        String::new()
    } else {
        format!(":\n{}", output)
    }
}

/// Result type alias for mkctr operations
pub type Result<T> = std::result::Result<T, MkctrError>;

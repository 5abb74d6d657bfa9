use thiserror::Error;

/// A3S delta error types
#[derive(Error, Debug)]
pub enum DeltaError {
    /// Unknown image, layer or reference
    #[error("Not found: {0}")]
    NotFound(String),

    /// Source and target images live in different platform layer stores
    #[error("Unsupported platform: cannot diff {base} against {target}")]
    UnsupportedPlatform { base: String, target: String },

    /// A layer the artifact expects to be present locally is missing
    #[error("Missing base layer: {0}")]
    MissingBaseLayer(String),

    /// Supplied source bytes do not hash to the patch's source digest
    #[error("Source mismatch: expected {expected}, got {actual}")]
    SourceMismatch { expected: String, actual: String },

    /// Patch could not be decoded or did not reproduce the target digest
    #[error("Corrupt patch: {0}")]
    CorruptPatch(String),

    /// Patch header carries a codec version this build does not know
    #[error("Codec version mismatch: found {found}, supported {supported}")]
    CodecVersionMismatch { found: u16, supported: u16 },

    /// Artifact stream is truncated, tampered with or internally inconsistent
    #[error("Corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// Malformed content digest
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Store collaborator failure
    #[error("Store error: {0}")]
    StoreError(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl DeltaError {
    /// Whether this error belongs to the I/O failure class (read, write or store errors).
    pub fn is_io_failure(&self) -> bool {
        matches!(self, DeltaError::IoError(_) | DeltaError::StoreError(_))
    }

    /// Whether this error signals content that failed an integrity check.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            DeltaError::SourceMismatch { .. }
                | DeltaError::CorruptPatch(_)
                | DeltaError::CorruptArtifact(_)
        )
    }
}

impl From<serde_json::Error> for DeltaError {
    fn from(err: serde_json::Error) -> Self {
        DeltaError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for DeltaError {
    fn from(err: serde_yaml::Error) -> Self {
        DeltaError::SerializationError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DeltaError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            DeltaError::Cancelled
        } else {
            DeltaError::IoError(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
        }
    }
}

/// Result type alias for A3S delta operations
pub type Result<T> = std::result::Result<T, DeltaError>;

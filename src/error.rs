use thiserror::Error;

#[derive(Error, Debug)]
pub enum IvfSqError {
    // Validation errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // Lifecycle errors
    #[error("index is not trained")]
    NotTrained,

    #[error("insufficient training data: need at least {required} vectors, got {actual}")]
    InsufficientTrainingData { required: usize, actual: usize },

    // Storage errors
    #[error("out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    // Transfer errors
    #[error("format error: {0}")]
    Format(String),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // Internal
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

pub type Result<T> = std::result::Result<T, IvfSqError>;

/// Coarse classification of an [`IvfSqError`], stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotTrained,
    InsufficientTrainingData,
    DimensionMismatch,
    OutOfMemory,
    FormatError,
    InternalInvariantViolation,
}

impl IvfSqError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IvfSqError::InvalidArgument(_) | IvfSqError::Config(_) => ErrorKind::InvalidArgument,
            IvfSqError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            IvfSqError::NotTrained => ErrorKind::NotTrained,
            IvfSqError::InsufficientTrainingData { .. } => ErrorKind::InsufficientTrainingData,
            IvfSqError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            IvfSqError::Format(_) | IvfSqError::Io(_) => ErrorKind::FormatError,
            IvfSqError::InternalInvariant(_) => ErrorKind::InternalInvariantViolation,
        }
    }

    /// True for errors caused by caller input rather than by the index itself.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::InternalInvariantViolation | ErrorKind::OutOfMemory
        )
    }
}

use thiserror::Error;

/// Everything the file layer can fail with. Short I/O is retried inside
/// the byte driver; all other conditions surface here unchanged.
#[derive(Debug, Error)]
pub enum GsdError {
    #[error("I/O failed: {0}")]
    IoFailed(#[from] std::io::Error),

    #[error("not a GSD file (magic mismatch)")]
    NotAGsdFile,

    #[error("unsupported GSD file version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("chunk not found: frame {frame}, name {name:?}")]
    NotFound { frame: u64, name: String },

    #[error("unsupported type code {0}")]
    UnsupportedType(u8),

    #[error("too many chunk names (limit 65535)")]
    TooManyNames,

    #[error("corrupt file: {0}")]
    Corrupt(String),

    #[error("file is opened read only")]
    ReadOnly,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, GsdError>;

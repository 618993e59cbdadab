use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `permafrost` crate.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}': {source}", .path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// The source root is missing or is not a directory.
    #[error("source root is not a readable directory: {}", .0.display())]
    InvalidSourceRoot(PathBuf),

    /// A gzip compression level outside the accepted 0-9 range.
    #[error("compression level must be 0-9, got {0}")]
    InvalidCompressionLevel(u32),

    /// A caller-supplied exclusion pattern that does not compile.
    #[error("invalid exclude pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A manifest or file-record field rejected during validation.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// The archive file a verifier or inspector was pointed at does not exist.
    #[error("archive not found: {}", .0.display())]
    ArchiveNotFound(PathBuf),

    /// The archive container itself could not be read back.
    #[error("malformed archive '{}': {reason}", .path.display())]
    MalformedArchive { path: PathBuf, reason: String },

    /// An error during serialization or deserialization of JSON metadata.
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error during serialization or deserialization of YAML metadata.
    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    /// An error while encoding or decoding the tabular file listing.
    #[error("file listing error: {0}")]
    Csv(#[from] csv::Error),
}

impl ArchiveError {
    /// Attach a path to an I/O error at the point it is observed.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ArchiveError::Io {
            source,
            path: path.into(),
        }
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io {
            source: err,
            path: PathBuf::new(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;

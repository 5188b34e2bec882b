//! Error types.
//!
//! Only file-level failures are fatal and surface as [`RegistryError`].
//! Record-level problems are described by [`RecordError`]; loaders log them
//! and skip the record.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias for fallible crate operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Fatal errors: an input could not be read or an output could not be written.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Input file missing or unreadable.
    #[error("cannot read '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Output file could not be created or written.
    #[error("cannot write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Delimited file could not be read or written as a whole.
    #[error("CSV error in '{}': {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// GeoJSON document is not valid JSON or not a FeatureCollection.
    #[error("invalid GeoJSON in '{}': {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file could not be parsed.
    #[error("invalid configuration in '{}': {message}", path.display())]
    Config { path: PathBuf, message: String },
}

/// Non-fatal problem with a single input record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("malformed geometry: {0}")]
    MalformedGeometry(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),
}

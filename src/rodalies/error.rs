use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure while downloading or installing the GTFS archive.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("GTFS download failed with status: {code}")]
    BadStatus { code: u16 },

    #[error("Network error while downloading GTFS: {0}")]
    Network(String),

    #[error("GTFS download timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("File error: {0}")]
    File(String),

    #[error("Failed to extract GTFS archive: {0}")]
    Archive(String),
}

impl FetchError {
    pub fn reason(&self) -> &'static str {
        match self {
            FetchError::BadStatus { .. } => "bad-status",
            FetchError::Network(_) => "network",
            FetchError::Timeout { .. } => "timeout",
            FetchError::File(_) => "file",
            FetchError::Archive(_) => "archive",
        }
    }
}

/// Failure while reading the GTFS tables from the working directory.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Required GTFS file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("Malformed {file}: {detail}")]
    Malformed { file: String, detail: String },
}

impl ParseError {
    pub fn reason(&self) -> &'static str {
        match self {
            ParseError::MissingFile { .. } => "missing-file",
            ParseError::Malformed { .. } => "malformed",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RodaliesError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    /// No index has ever been loaded and the attempt made for this query failed.
    #[error("Rodalies data is not ready: {cause}")]
    NotReady { cause: Box<RodaliesError> },

    #[error("Invalid reference time {0:?}, expected zero-padded HH:MM:SS")]
    InvalidTime(String),

    #[error("Ingestion task failed: {0}")]
    Ingestion(String),
}

impl RodaliesError {
    pub fn reason(&self) -> &'static str {
        match self {
            RodaliesError::Fetch(e) => e.reason(),
            RodaliesError::Parse(e) => e.reason(),
            RodaliesError::NotReady { .. } => "not-ready",
            RodaliesError::InvalidTime(_) => "invalid-time",
            RodaliesError::Ingestion(_) => "ingestion",
        }
    }
}

pub type Result<T> = std::result::Result<T, RodaliesError>;

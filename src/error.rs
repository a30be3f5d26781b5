//! Error types and failure classification for the harvest pipeline

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Classification of every way a record can fail to be harvested.
///
/// Each stage returns a typed error that maps onto exactly one kind, so the
/// orchestrator never has to inspect error messages to decide what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Page or network interaction failed before a download started
    Transient,
    /// Partial download stopped growing for too many consecutive checks
    DownloadStalled,
    /// No completed artifact appeared before the watch timeout
    DownloadTimedOut,
    /// Archive is missing, empty, malformed or has a corrupt member
    ArchiveCorrupt,
    /// No record matches the identifier being updated
    NoMatch,
    /// Unexpected failure that aborts the whole run
    Fatal,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::DownloadStalled => "download_stalled",
            Self::DownloadTimedOut => "download_timed_out",
            Self::ArchiveCorrupt => "archive_corrupt",
            Self::NoMatch => "no_match",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an archive is rejected before extraction
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive not found: {0}")]
    Missing(PathBuf),

    #[error("archive is empty: {0}")]
    Empty(PathBuf),

    #[error("archive is malformed: {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("archive {path} has a corrupt member: {member}")]
    CorruptMember { path: PathBuf, member: String },

    #[error("IO error reading archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    /// Short reason label used in log lines
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Missing(_) => "missing",
            Self::Empty(_) => "empty",
            Self::Malformed { .. } => "malformed",
            Self::CorruptMember { .. } => "corrupt-member",
            Self::Io { .. } => "io",
        }
    }

    pub const fn kind(&self) -> FailureKind {
        FailureKind::ArchiveCorrupt
    }
}

/// Errors raised while unpacking a validated archive
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("archive produced no files: {0}")]
    NoFiles(PathBuf),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("{path} is outside the storage root {root}")]
    OutsideStorage { path: PathBuf, root: PathBuf },
}

impl ExtractError {
    pub const fn kind(&self) -> FailureKind {
        FailureKind::ArchiveCorrupt
    }
}

/// Errors raised by a download driver while starting or cancelling downloads
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("record {0} has no download link")]
    NoLink(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download request returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DriverError {
    pub const fn kind(&self) -> FailureKind {
        FailureKind::Transient
    }
}

/// Errors raised while reading or writing persisted state and exports
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_labels() {
        assert_eq!(FailureKind::DownloadStalled.to_string(), "download_stalled");
        assert_eq!(FailureKind::NoMatch.as_str(), "no_match");
    }

    #[test]
    fn test_archive_error_reasons() {
        assert_eq!(ArchiveError::Empty(PathBuf::from("a.zip")).reason(), "empty");
        assert_eq!(ArchiveError::Missing(PathBuf::from("a.zip")).reason(), "missing");
        let corrupt = ArchiveError::CorruptMember {
            path: PathBuf::from("a.zip"),
            member: "doc.pdf".to_string(),
        };
        assert_eq!(corrupt.reason(), "corrupt-member");
        assert_eq!(corrupt.kind(), FailureKind::ArchiveCorrupt);
    }
}

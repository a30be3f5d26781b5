//! Record naming and the single mutation point for post-download state

use chrono::Utc;
use tracing::{info, warn};

use crate::error::FailureKind;
use crate::models::TenderRecord;

/// Stable on-disk name for a record's archive and extraction directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveKey {
    /// Derived from the tender reference: `25/2025` becomes `25_2025`
    Reference(String),
    /// Used when the record carries no usable reference
    Indexed { kind: String, index: usize },
}

impl ArchiveKey {
    /// Derives the key for the record at 1-based `index` in the listing
    pub fn for_record(record: &TenderRecord, index: usize, fallback_kind: &str) -> Self {
        let stem = sanitize(&record.reference);
        if stem.is_empty() {
            Self::Indexed {
                kind: fallback_kind.to_string(),
                index,
            }
        } else {
            Self::Reference(stem)
        }
    }

    pub fn stem(&self) -> String {
        match self {
            Self::Reference(stem) => stem.clone(),
            Self::Indexed { kind, index } => format!("{kind}_{index}"),
        }
    }

    pub fn archive_name(&self) -> String {
        format!("{}.zip", self.stem())
    }

    pub fn extraction_dir_name(&self) -> String {
        match self {
            Self::Reference(stem) => format!("{stem}_extrait"),
            Self::Indexed { .. } => self.stem(),
        }
    }
}

/// Maps a reference onto a file-system safe stem
fn sanitize(reference: &str) -> String {
    let mapped: String = reference
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    mapped.trim_start_matches('.').to_string()
}

/// What the download and extraction stages produced for one record
#[derive(Debug, Clone, Default)]
pub struct FileOutcome {
    /// Storage link of a validated archive
    pub archive_link: Option<String>,
    /// Web paths of extracted files; empty when extraction failed
    pub extracted_files: Vec<String>,
}

/// Merges `outcome` into the first record whose reference matches.
///
/// Returns `false`, after logging, when no record matches. A blank reference
/// matches nothing; such records are updated by position with [`apply_outcome`].
pub fn update_record(records: &mut [TenderRecord], reference: &str, outcome: FileOutcome) -> bool {
    let wanted = reference.trim();
    let found = if wanted.is_empty() {
        None
    } else {
        records.iter_mut().find(|r| r.reference.trim() == wanted)
    };

    let Some(record) = found else {
        warn!(
            "[{}] No record matches {:?}, update ignored",
            FailureKind::NoMatch,
            reference
        );
        return false;
    };

    apply_outcome(record, outcome);
    true
}

/// Writes archive and extraction results into `record` and stamps it
pub fn apply_outcome(record: &mut TenderRecord, outcome: FileOutcome) {
    let label = record.reference.trim().to_string();

    if let Some(link) = outcome.archive_link {
        info!("Record {} archive set to {}", label, link);
        record.chemin_zip = link;
    }

    if !outcome.extracted_files.is_empty() {
        info!(
            "Record {} updated with {} extracted files",
            label,
            outcome.extracted_files.len()
        );
        record.extracted_files = outcome.extracted_files;
    }

    record.files_updated_at = Some(Utc::now());
}

//! Data models for tender records, progress reports and run statistics

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tender listing row scraped from a procurement portal.
///
/// The scraper emits an open set of columns; only the ones the pipeline
/// reads or writes are typed, the rest ride along in `fields` and are written
/// back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenderRecord {
    #[serde(default)]
    pub reference: String,

    /// Direct link to the tender documents, when the portal exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    #[serde(default)]
    pub chemin_zip: String,

    #[serde(rename = "EXTRACTED_FILES", default)]
    pub extracted_files: Vec<String>,

    #[serde(default, with = "optional_timestamp")]
    pub files_updated_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl TenderRecord {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            ..Self::default()
        }
    }
}

/// Phase reported in the progress file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Initializing,
    Processing,
    Downloading,
    Extracting,
    Completed,
    Error,
}

/// Snapshot written to `scraping_progress.json` for external polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub status: ProgressStatus,
    pub current: usize,
    pub total: usize,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub percentage: f64,
    pub downloads_success: usize,
    pub downloads_failed: usize,
    pub extractions_success: usize,
    pub extractions_failed: usize,
}

/// Success and failure tallies accumulated over one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub records_total: usize,
    pub skipped_duplicates: usize,
    pub downloads_succeeded: usize,
    pub downloads_failed: usize,
    pub extractions_succeeded: usize,
    pub extractions_failed: usize,
    pub unmatched_updates: usize,
}

/// Final statistics written to `extraction_stats.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub stats: RunStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
}

/// The web application reads an empty string for "never updated".
mod optional_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => DateTime::parse_from_rfc3339(text)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_unknown_columns() {
        let raw = r#"{
            "reference": "25/2025",
            "objet": "Construction d'un lycée",
            "row_index": 3,
            "chemin_zip": "",
            "EXTRACTED_FILES": [],
            "files_updated_at": ""
        }"#;

        let record: TenderRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.reference, "25/2025");
        assert!(record.files_updated_at.is_none());
        assert_eq!(record.fields["objet"], "Construction d'un lycée");

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["row_index"], 3);
        assert_eq!(back["files_updated_at"], "");
        assert!(back.get("download_url").is_none());
    }

    #[test]
    fn test_progress_status_serializes_snake_case() {
        let json = serde_json::to_string(&ProgressStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }
}

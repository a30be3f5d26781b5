//! File-backed persistence: listings, known references and exports
//!
//! Everything the web application reads lives next to the archives in the
//! domain folder. JSON files are written to a temporary sibling and renamed
//! into place so a poller never sees a half-written file.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::models::TenderRecord;

/// Typed columns written after the scraped ones
const FILE_COLUMNS: [&str; 3] = ["chemin_zip", "EXTRACTED_FILES", "files_updated_at"];

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let body = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

/// Loads the scraped listing the harvest runs over
pub fn load_listing(path: &Path) -> Result<Vec<TenderRecord>, StoreError> {
    let records: Vec<TenderRecord> = read_json(path)?;
    info!("Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Persists the references a future run should skip, sorted for stable diffs
pub fn save_known_references<'a>(
    path: &Path,
    references: impl IntoIterator<Item = &'a str>,
) -> Result<usize, StoreError> {
    let sorted: BTreeSet<&str> = references
        .into_iter()
        .map(str::trim)
        .filter(|reference| !reference.is_empty())
        .collect();
    write_json(path, &sorted)?;
    info!("Saved {} known references to {}", sorted.len(), path.display());
    Ok(sorted.len())
}

/// Writes the full record collection as pretty JSON.
///
/// Returns `false` without touching the file when there is nothing to write.
pub fn export_json(path: &Path, records: &[TenderRecord]) -> Result<bool, StoreError> {
    if records.is_empty() {
        warn!("No records to export to {}", path.display());
        return Ok(false);
    }
    write_json(path, records)?;
    info!("JSON saved to {} ({} records)", path.display(), records.len());
    Ok(true)
}

/// Writes the record collection as CSV.
///
/// Columns are `reference`, every scraped column seen in any record in
/// sorted order, then the file columns. Lists are written as JSON arrays.
pub fn export_csv(path: &Path, records: &[TenderRecord]) -> Result<bool, StoreError> {
    if records.is_empty() {
        warn!("No records to export to {}", path.display());
        return Ok(false);
    }

    let scraped: BTreeSet<&str> = records
        .iter()
        .flat_map(|record| record.fields.keys().map(String::as_str))
        .collect();
    let with_url = records.iter().any(|record| record.download_url.is_some());

    let mut header: Vec<&str> = vec!["reference"];
    header.extend(scraped.iter().copied());
    if with_url {
        header.push("download_url");
    }
    header.extend(FILE_COLUMNS);

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&header)?;

    for record in records {
        let mut row: Vec<String> = Vec::with_capacity(header.len());
        row.push(record.reference.clone());
        for column in &scraped {
            row.push(record.fields.get(*column).map(cell).unwrap_or_default());
        }
        if with_url {
            row.push(record.download_url.clone().unwrap_or_default());
        }
        row.push(record.chemin_zip.clone());
        row.push(serde_json::to_string(&record.extracted_files).unwrap_or_default());
        row.push(
            record
                .files_updated_at
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_default(),
        );
        writer.write_record(&row)?;
    }

    writer.flush().map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("CSV saved to {} ({} records)", path.display(), records.len());
    Ok(true)
}

fn cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Vec<TenderRecord> {
        let mut first = TenderRecord::new("25/2025");
        first.fields.insert("objet".to_string(), json!("Travaux, lot 2"));
        first.fields.insert("row_index".to_string(), json!(1));
        first.chemin_zip = "storage/marche_public/25_2025.zip".to_string();
        first.extracted_files = vec!["/storage/marche_public/25_2025_extrait/rc.pdf".to_string()];

        let mut second = TenderRecord::new("26/2025");
        second.fields.insert("acheteur".to_string(), json!("Commune"));
        vec![first, second]
    }

    #[test]
    fn test_json_roundtrip_of_listing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listing.json");
        let records = sample();

        assert!(export_json(&path, &records).unwrap());
        let loaded = load_listing(&path).unwrap();

        assert_eq!(loaded, records);
        assert!(!dir.path().join("listing.json.tmp").exists());
    }

    #[test]
    fn test_empty_exports_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("out.json");
        let csv_path = dir.path().join("out.csv");

        assert!(!export_json(&json_path, &[]).unwrap());
        assert!(!export_csv(&csv_path, &[]).unwrap());
        assert!(!json_path.exists());
        assert!(!csv_path.exists());
    }

    #[test]
    fn test_csv_columns_cover_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        export_csv(&path, &sample()).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(
            header,
            vec![
                "reference",
                "acheteur",
                "objet",
                "row_index",
                "chemin_zip",
                "EXTRACTED_FILES",
                "files_updated_at"
            ]
        );

        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][2], "Travaux, lot 2");
        assert_eq!(&rows[0][3], "1");
        assert_eq!(&rows[0][5], r#"["/storage/marche_public/25_2025_extrait/rc.pdf"]"#);
        assert_eq!(&rows[1][1], "Commune");
        assert_eq!(&rows[1][5], "[]");
    }

    #[test]
    fn test_known_references_sorted_and_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_references.json");

        let count = save_known_references(&path, ["26/2025", " 25/2025 ", "", "26/2025"]).unwrap();

        assert_eq!(count, 2);
        let stored: Vec<String> = read_json(&path).unwrap();
        assert_eq!(stored, vec!["25/2025", "26/2025"]);
    }

    #[test]
    fn test_missing_listing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_listing(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}

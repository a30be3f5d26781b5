//! Duplicate filtering against references processed in earlier runs

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

/// Read-only set of references already handled by a previous run.
///
/// Loaded once when a run starts and never mutated afterwards; references
/// handled during the current run are tracked by the run context instead.
#[derive(Debug, Clone, Default)]
pub struct DuplicateFilter {
    known: HashSet<String>,
}

impl DuplicateFilter {
    /// Loads the persisted JSON array of references.
    ///
    /// A missing or unreadable file yields an empty filter so the run
    /// processes every record.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!("No known references at {}, starting fresh", path.display());
            return Self::default();
        }

        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).map_err(|e| e.to_string()));

        match parsed {
            Ok(references) => {
                let filter: Self = references.into_iter().collect();
                info!("Loaded {} known references from {}", filter.len(), path.display());
                filter
            }
            Err(e) => {
                warn!(
                    "Could not load known references from {}: {} - processing every record",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Whether `reference` was processed by an earlier run.
    ///
    /// Blank references are never duplicates.
    pub fn is_duplicate(&self, reference: &str) -> bool {
        let trimmed = reference.trim();
        !trimmed.is_empty() && self.known.contains(trimmed)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for DuplicateFilter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let known = iter
            .into_iter()
            .map(|reference| reference.as_ref().trim().to_string())
            .filter(|reference| !reference.is_empty())
            .collect();
        Self { known }
    }
}

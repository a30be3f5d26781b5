//! # Progress Reporting
//!
//! This module publishes the state of a harvest run to the files the web
//! application polls. Nothing here talks to the application directly: the
//! reporter rewrites two small JSON documents in the domain folder and the
//! application reads them whenever it wants to refresh its progress bar.
//!
//! ## Files
//!
//! - **`scraping_progress.json`**: rewritten at every step. Carries the
//!   current phase, a `current`/`total` counter pair, a human-readable
//!   message, a timestamp, the derived percentage and the success/failure
//!   tallies accumulated so far.
//! - **`extraction_stats.json`**: written once when a run finishes, with the
//!   final tallies and the run duration.
//!
//! ## Phases
//!
//! `initializing` → `processing` (existing archives) → `downloading` /
//! `extracting` (per record) → `completed`, or `error` when the run aborts.
//!
//! ## Error Handling
//!
//! Progress is advisory. A write failure is logged and swallowed so that a
//! read-only or full disk never stops the harvest itself.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::config::HarvestConfig;
use crate::models::{ProgressReport, ProgressStatus, RunStats, StatsReport};
use crate::store;

/// Writes progress and final statistics for one domain.
///
/// Cheap to clone; it only holds the two target paths.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    /// Target of every progress update
    progress_path: PathBuf,

    /// Target of the end-of-run statistics
    stats_path: PathBuf,
}

impl StatusReporter {
    pub fn new(config: &HarvestConfig) -> Self {
        Self {
            progress_path: config.progress_path(),
            stats_path: config.stats_path(),
        }
    }

    /// Publishes the current phase and counters.
    ///
    /// ## Parameters
    ///
    /// - `status`: phase of the run
    /// - `current` / `total`: position in the record list; the percentage
    ///   is 0 when `total` is 0
    /// - `message`: free-form text shown next to the progress bar
    /// - `stats`: tallies accumulated so far
    ///
    /// The returned report is what was (or would have been) written.
    pub fn report(
        &self,
        status: ProgressStatus,
        current: usize,
        total: usize,
        message: impl Into<String>,
        stats: &RunStats,
    ) -> ProgressReport {
        let percentage = if total > 0 {
            ((current as f64 / total as f64) * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        let report = ProgressReport {
            status,
            current,
            total,
            message: message.into(),
            timestamp: Utc::now(),
            percentage,
            downloads_success: stats.downloads_succeeded,
            downloads_failed: stats.downloads_failed,
            extractions_success: stats.extractions_succeeded,
            extractions_failed: stats.extractions_failed,
        };

        match store::write_json(&self.progress_path, &report) {
            Ok(()) => info!(
                "[PROGRESS] {:?}: {}/{} ({:.1}%) - {}",
                report.status, current, total, report.percentage, report.message
            ),
            Err(e) => error!("Could not write progress file: {}", e),
        }

        report
    }

    /// Writes the end-of-run statistics
    pub fn finish(&self, stats: &RunStats, started_at: DateTime<Utc>) -> StatsReport {
        let finished_at = Utc::now();
        let duration_secs =
            ((finished_at - started_at).num_milliseconds() as f64 / 1000.0 * 100.0).round() / 100.0;

        let report = StatsReport {
            stats: stats.clone(),
            started_at,
            finished_at,
            duration_secs,
        };

        match store::write_json(&self.stats_path, &report) {
            Ok(()) => info!(
                "Run finished in {:.2}s: {} downloads ok, {} failed, {} extractions ok, {} failed, {} skipped",
                duration_secs,
                stats.downloads_succeeded,
                stats.downloads_failed,
                stats.extractions_succeeded,
                stats.extractions_failed,
                stats.skipped_duplicates
            ),
            Err(e) => error!("Could not write stats file: {}", e),
        }

        report
    }
}

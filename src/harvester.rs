use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::archive::{Extractor, validate};
use crate::config::HarvestConfig;
use crate::dedup::DuplicateFilter;
use crate::error::FailureKind;
use crate::models::{ProgressStatus, RunStats, TenderRecord};
use crate::records::{self, ArchiveKey, FileOutcome};
use crate::status::StatusReporter;
use crate::store;
use crate::traits::DownloadDriver;
use crate::watcher::{DownloadWatcher, WatchOutcome};

/// Per-run state handed to every stage
#[derive(Debug, Default)]
pub struct RunContext {
    pub stats: RunStats,
    started_at: DateTime<Utc>,
    position: usize,
    known: DuplicateFilter,
    handled: HashSet<String>,
}

impl RunContext {
    pub fn new(known: DuplicateFilter) -> Self {
        Self {
            started_at: Utc::now(),
            known,
            ..Self::default()
        }
    }

    /// Whether the record was handled by an earlier run or earlier in this one
    pub fn should_skip(&self, reference: &str) -> bool {
        let trimmed = reference.trim();
        self.known.is_duplicate(trimmed) || self.handled.contains(trimmed)
    }

    /// Records a reference whose archive passed validation
    pub fn mark_handled(&mut self, reference: &str) {
        let trimmed = reference.trim();
        if !trimmed.is_empty() {
            self.handled.insert(trimmed.to_string());
        }
    }

    /// References to persist for the next run
    pub fn all_references(&self) -> impl Iterator<Item = &str> {
        self.known
            .references()
            .chain(self.handled.iter().map(String::as_str))
    }
}

/// Runs the download-and-extract pipeline over a listing
#[derive(Clone)]
pub struct Harvester {
    config: HarvestConfig,
    driver: Arc<dyn DownloadDriver>,
    watcher: DownloadWatcher,
    extractor: Extractor,
    status: StatusReporter,
    busy: Arc<Mutex<()>>,
}

impl Harvester {
    pub fn new(config: HarvestConfig, driver: Arc<dyn DownloadDriver>) -> Self {
        let watcher = DownloadWatcher::new(config.watch.clone());
        let extractor = Extractor::new(&config);
        let status = StatusReporter::new(&config);

        Self {
            config,
            driver,
            watcher,
            extractor,
            status,
            busy: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Loads `listing` and runs the pipeline over it, unless a run started
    /// from this harvester or one of its clones is still going.
    ///
    /// Returns `Ok(None)` when the run was skipped.
    pub async fn run_exclusive(&self, listing: &Path) -> Result<Option<RunStats>> {
        let Some(_running) = self.try_begin() else {
            info!("Previous harvest still running, skipping this one");
            return Ok(None);
        };

        let mut records = store::load_listing(listing)?;
        self.run_and_export(&mut records).await.map(Some)
    }

    fn try_begin(&self) -> Option<MutexGuard<'_, ()>> {
        self.busy.try_lock().ok()
    }

    /// Runs the pipeline, then exports the records whatever the outcome
    pub async fn run_and_export(&self, records: &mut [TenderRecord]) -> Result<RunStats> {
        let mut ctx = self.begin(records.len());
        let result = self.download_all(records, &mut ctx).await;
        self.finish(records, ctx, result)
    }

    /// Refreshes records from archives already on disk, then exports them
    pub fn refresh_and_export(&self, records: &mut [TenderRecord]) -> Result<RunStats> {
        let mut ctx = self.begin(records.len());
        let result = self.refresh_existing(records, &mut ctx);
        self.finish(records, ctx, result)
    }

    /// Full run: existing archives first, then a download for every record
    /// not seen before.
    pub async fn run(&self, records: &mut [TenderRecord]) -> Result<RunStats> {
        let mut ctx = self.begin(records.len());
        self.download_all(records, &mut ctx).await?;
        Ok(ctx.stats)
    }

    /// Existing-archive pass only
    pub fn refresh(&self, records: &mut [TenderRecord]) -> Result<RunStats> {
        let mut ctx = self.begin(records.len());
        self.refresh_existing(records, &mut ctx)?;
        Ok(ctx.stats)
    }

    async fn download_all(&self, records: &mut [TenderRecord], ctx: &mut RunContext) -> Result<()> {
        self.prepare_storage()?;
        self.process_existing_archives(records, ctx);

        let download_dir = self.config.download_dir();
        std::fs::create_dir_all(&download_dir)
            .with_context(|| format!("creating download directory {}", download_dir.display()))?;

        let total = records.len();
        info!("Downloading archives for {} records", total);

        for index in 0..total {
            ctx.position = index + 1;
            let reference = records[index].reference.trim().to_string();

            if ctx.should_skip(&reference) {
                info!("Skipping {} - already handled", reference);
                ctx.stats.skipped_duplicates += 1;
                continue;
            }

            self.status.report(
                ProgressStatus::Downloading,
                index + 1,
                total,
                format!("Downloading {}", display_reference(&reference)),
                &ctx.stats,
            );

            self.harvest_record(records, index, &download_dir, ctx).await;
        }

        self.complete(ctx);
        Ok(())
    }

    fn refresh_existing(&self, records: &mut [TenderRecord], ctx: &mut RunContext) -> Result<()> {
        self.prepare_storage()?;
        self.process_existing_archives(records, ctx);
        self.complete(ctx);
        Ok(())
    }

    fn begin(&self, total: usize) -> RunContext {
        self.status.report(
            ProgressStatus::Initializing,
            0,
            total,
            "Loading known references",
            &RunStats::default(),
        );

        let mut ctx = RunContext::new(DuplicateFilter::load(&self.config.known_references_path()));
        ctx.stats.records_total = total;
        ctx
    }

    fn prepare_storage(&self) -> Result<()> {
        let domain_dir = self.config.domain_dir();
        std::fs::create_dir_all(&domain_dir)
            .with_context(|| format!("creating storage directory {}", domain_dir.display()))
    }

    fn complete(&self, ctx: &RunContext) {
        if let Err(e) =
            store::save_known_references(&self.config.known_references_path(), ctx.all_references())
        {
            warn!("Could not persist known references: {}", e);
        }

        let total = ctx.stats.records_total;
        self.status.report(
            ProgressStatus::Completed,
            total,
            total,
            "Harvest complete",
            &ctx.stats,
        );
        self.status.finish(&ctx.stats, ctx.started_at);
    }

    fn finish(&self, records: &[TenderRecord], ctx: RunContext, result: Result<()>) -> Result<RunStats> {
        let exported = self.export(records);

        match result {
            Ok(()) => {
                exported?;
                Ok(ctx.stats)
            }
            Err(e) => {
                error!("[{}] Run aborted: {:#}", FailureKind::Fatal, e);
                self.status.report(
                    ProgressStatus::Error,
                    ctx.position,
                    records.len(),
                    format!("{e:#}"),
                    &ctx.stats,
                );
                if let Err(export_err) = exported {
                    error!("Export after failure also failed: {:#}", export_err);
                }
                Err(e)
            }
        }
    }

    /// Writes the CSV and JSON exports for the web application
    pub fn export(&self, records: &[TenderRecord]) -> Result<()> {
        store::export_csv(&self.config.csv_export_path(), records)?;
        store::export_json(&self.config.json_export_path(), records)?;
        Ok(())
    }

    /// Annotates records from archives already sitting in the domain folder.
    ///
    /// An archive whose extraction directory is already populated is only
    /// listed; otherwise it is extracted. A valid archive marks its record as
    /// handled for the rest of the run; a rejected one leaves the record to
    /// be downloaded again.
    pub fn process_existing_archives(&self, records: &mut [TenderRecord], ctx: &mut RunContext) {
        let archives = self.existing_archives();
        if archives.is_empty() {
            info!("No existing archives in {}", self.config.domain_dir().display());
            return;
        }

        info!("Checking {} existing archives", archives.len());
        let total = archives.len();

        for (position, archive) in archives.iter().enumerate() {
            let Some(stem) = archive.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };

            self.status.report(
                ProgressStatus::Processing,
                position + 1,
                total,
                format!("Checking existing archive {stem}"),
                &ctx.stats,
            );

            let Some(index) = records.iter().enumerate().position(|(i, record)| {
                ArchiveKey::for_record(record, i + 1, &self.config.fallback_kind).stem() == stem
            }) else {
                warn!(
                    "[{}] No record for existing archive {}",
                    FailureKind::NoMatch,
                    archive.display()
                );
                ctx.stats.unmatched_updates += 1;
                continue;
            };

            let key = ArchiveKey::for_record(&records[index], index + 1, &self.config.fallback_kind);
            let extraction_dir = self.extractor.extraction_dir(&key);

            let outcome = if has_entries(&extraction_dir) {
                info!("{} already extracted, refreshing file list", stem);
                self.list_existing(archive, &key, &extraction_dir, ctx)
            } else {
                self.validate_and_extract(archive, &key, ctx)
            };

            if let Some(outcome) = outcome {
                self.apply(records, index, outcome, ctx);
                ctx.mark_handled(&records[index].reference);
            }
        }
    }

    async fn harvest_record(
        &self,
        records: &mut [TenderRecord],
        index: usize,
        download_dir: &Path,
        ctx: &mut RunContext,
    ) {
        let key = ArchiveKey::for_record(&records[index], index + 1, &self.config.fallback_kind);
        let label = key.stem();

        info!("=== Processing {} ===", label);
        let started_at = SystemTime::now();

        if let Err(e) = self.driver.trigger(&records[index], &key, download_dir).await {
            warn!("[{}] Could not start download for {}: {}", e.kind(), label, e);
            ctx.stats.downloads_failed += 1;
            return;
        }

        let downloaded = match self
            .watcher
            .watch(download_dir, started_at, self.driver.as_ref())
            .await
        {
            WatchOutcome::Completed(path) => path,
            failed => {
                if let Some(kind) = failed.failure_kind() {
                    warn!("[{}] Download failed for {}", kind, label);
                }
                ctx.stats.downloads_failed += 1;
                return;
            }
        };

        ctx.stats.downloads_succeeded += 1;
        info!("Download succeeded for {}", label);

        let Some(archive) = self.store_archive(&downloaded, &key) else {
            ctx.stats.extractions_failed += 1;
            return;
        };

        self.status.report(
            ProgressStatus::Extracting,
            index + 1,
            records.len(),
            format!("Extracting {label}"),
            &ctx.stats,
        );

        if let Some(outcome) = self.validate_and_extract(&archive, &key, ctx) {
            self.apply(records, index, outcome, ctx);
            ctx.mark_handled(&records[index].reference);
        }
    }

    /// Moves a finished download to `<key>.zip` in the domain folder.
    ///
    /// When the move fails the original name is kept if the file already
    /// sits in the domain folder; otherwise there is no archive to link.
    fn store_archive(&self, downloaded: &Path, key: &ArchiveKey) -> Option<PathBuf> {
        let domain_dir = self.config.domain_dir();
        let target = domain_dir.join(key.archive_name());
        if downloaded == target {
            return Some(target);
        }

        let moved = (|| -> std::io::Result<()> {
            if target.exists() {
                std::fs::remove_file(&target)?;
            }
            if std::fs::rename(downloaded, &target).is_err() {
                std::fs::copy(downloaded, &target)?;
                std::fs::remove_file(downloaded)?;
            }
            Ok(())
        })();

        match moved {
            Ok(()) => {
                info!("Archive renamed to {}", target.display());
                Some(target)
            }
            Err(e) if downloaded.parent() == Some(domain_dir.as_path()) => {
                warn!("Could not rename {}: {} - keeping original name", downloaded.display(), e);
                Some(downloaded.to_path_buf())
            }
            Err(e) => {
                warn!(
                    "[{}] Could not move {} into {}: {}",
                    FailureKind::Transient,
                    downloaded.display(),
                    domain_dir.display(),
                    e
                );
                None
            }
        }
    }

    /// Validates then extracts; `None` when the archive itself is rejected
    fn validate_and_extract(
        &self,
        archive: &Path,
        key: &ArchiveKey,
        ctx: &mut RunContext,
    ) -> Option<FileOutcome> {
        if validate(archive).is_err() {
            ctx.stats.extractions_failed += 1;
            return None;
        }

        let archive_link = Some(self.config.archive_link(archive));
        match self.extractor.extract(archive, key) {
            Ok(extracted_files) => {
                ctx.stats.extractions_succeeded += 1;
                Some(FileOutcome {
                    archive_link,
                    extracted_files,
                })
            }
            Err(_) => {
                ctx.stats.extractions_failed += 1;
                Some(FileOutcome {
                    archive_link,
                    extracted_files: Vec::new(),
                })
            }
        }
    }

    fn list_existing(
        &self,
        archive: &Path,
        key: &ArchiveKey,
        extraction_dir: &Path,
        ctx: &mut RunContext,
    ) -> Option<FileOutcome> {
        if validate(archive).is_err() {
            ctx.stats.extractions_failed += 1;
            return None;
        }

        match self.extractor.list_files(extraction_dir) {
            Ok(extracted_files) if !extracted_files.is_empty() => Some(FileOutcome {
                archive_link: Some(self.config.archive_link(archive)),
                extracted_files,
            }),
            Ok(_) => self.validate_and_extract(archive, key, ctx),
            Err(e) => {
                warn!("Could not list {}: {} - extracting again", extraction_dir.display(), e);
                self.validate_and_extract(archive, key, ctx)
            }
        }
    }

    fn apply(&self, records: &mut [TenderRecord], index: usize, outcome: FileOutcome, ctx: &mut RunContext) {
        let reference = records[index].reference.trim().to_string();
        if reference.is_empty() {
            records::apply_outcome(&mut records[index], outcome);
        } else if !records::update_record(records, &reference, outcome) {
            ctx.stats.unmatched_updates += 1;
        }
    }

    fn existing_archives(&self) -> Vec<PathBuf> {
        let domain_dir = self.config.domain_dir();
        let finished = &self.config.watch.finished_extension;

        let Ok(entries) = std::fs::read_dir(&domain_dir) else {
            return Vec::new();
        };

        let mut archives: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(finished))
            })
            .collect();
        archives.sort();
        archives
    }
}

fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

fn display_reference(reference: &str) -> &str {
    if reference.is_empty() { "<no reference>" } else { reference }
}

//! Download completion detection
//!
//! Browsers write a download under a partial extension (`.crdownload` for
//! Chrome, `.part` for Firefox) and rename it once the last byte arrives.
//! The watcher polls the download directory until a finished archive shows
//! up, and gives up when the partial file stops growing or the overall
//! budget runs out.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::config::WatchConfig;
use crate::error::FailureKind;
use crate::traits::DownloadDriver;

/// How a watch cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A finished artifact appeared and no partial file remains
    Completed(PathBuf),
    /// The partial file stopped growing too many times in a row
    Stalled { partial: PathBuf, stalls: u32 },
    /// Nothing completed within the timeout
    TimedOut { elapsed: Duration },
}

impl WatchOutcome {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Completed(_) => None,
            Self::Stalled { .. } => Some(FailureKind::DownloadStalled),
            Self::TimedOut { .. } => Some(FailureKind::DownloadTimedOut),
        }
    }
}

/// Progress bookkeeping for the partial file of one watch cycle
#[derive(Debug)]
struct DownloadState {
    partial: Option<PathBuf>,
    last_size: u64,
    last_change: Instant,
    stalls: u32,
}

impl DownloadState {
    fn new(now: Instant) -> Self {
        Self {
            partial: None,
            last_size: 0,
            last_change: now,
            stalls: 0,
        }
    }

    /// Records one size observation; returns true once the stall limit is hit
    fn observe(&mut self, partial: &Path, size: u64, now: Instant, config: &WatchConfig) -> bool {
        self.partial = Some(partial.to_path_buf());

        if size != self.last_size {
            if size > 0 {
                info!("Download in progress... ({} bytes)", size);
            }
            self.last_size = size;
            self.last_change = now;
            self.stalls = 0;
            return false;
        }

        if now.duration_since(self.last_change) > config.stall_threshold {
            self.stalls += 1;
            warn!(
                "Download stalled at {} bytes ({}/{})",
                size, self.stalls, config.max_stalls
            );
            self.last_change = now;
            return self.stalls >= config.max_stalls;
        }

        false
    }
}

/// What one scan of the download directory found
#[derive(Debug, Default)]
struct Snapshot {
    finished: Option<PathBuf>,
    partial: Option<(PathBuf, u64)>,
}

/// Polls a directory until a download completes, stalls or times out
#[derive(Debug, Clone)]
pub struct DownloadWatcher {
    config: WatchConfig,
}

impl DownloadWatcher {
    pub fn new(config: WatchConfig) -> Self {
        Self { config }
    }

    /// Waits for a finished artifact in `dir` modified at or after `started_at`.
    ///
    /// On stall or timeout the driver is asked to cancel its downloads and
    /// any partial file is removed before returning, so the next attempt
    /// starts from a clean directory.
    pub async fn watch(
        &self,
        dir: &Path,
        started_at: SystemTime,
        driver: &dyn DownloadDriver,
    ) -> WatchOutcome {
        let start = Instant::now();
        let mut state = DownloadState::new(start);

        info!("Waiting for download in {}", dir.display());

        loop {
            let snapshot = self.scan(dir, started_at);

            match snapshot.partial {
                None => {
                    if let Some(finished) = snapshot.finished {
                        info!(
                            "Download completed after {:.1}s: {}",
                            start.elapsed().as_secs_f64(),
                            finished.display()
                        );
                        return WatchOutcome::Completed(finished);
                    }
                }
                Some((partial, size)) => {
                    if state.observe(&partial, size, Instant::now(), &self.config) {
                        error!(
                            "[{}] Download abandoned after {} stalls: {}",
                            FailureKind::DownloadStalled,
                            state.stalls,
                            partial.display()
                        );
                        self.abort(driver, Some(&partial)).await;
                        return WatchOutcome::Stalled {
                            partial,
                            stalls: state.stalls,
                        };
                    }
                }
            }

            if start.elapsed() >= self.config.timeout {
                break;
            }

            sleep(self.config.poll_interval).await;
        }

        let elapsed = start.elapsed();
        error!(
            "[{}] No completed download after {:.0}s in {}",
            FailureKind::DownloadTimedOut,
            elapsed.as_secs_f64(),
            dir.display()
        );

        let partial = self.scan(dir, started_at).partial.map(|(path, _)| path);
        self.abort(driver, partial.as_deref()).await;

        WatchOutcome::TimedOut { elapsed }
    }

    async fn abort(&self, driver: &dyn DownloadDriver, partial: Option<&Path>) {
        if let Err(e) = driver.cancel_downloads().await {
            warn!("Could not cancel downloads through {}: {}", driver.name(), e);
        }

        if let Some(partial) = partial
            && partial.exists()
        {
            match std::fs::remove_file(partial) {
                Ok(()) => info!("Removed partial download {}", partial.display()),
                Err(e) => warn!("Could not remove {}: {}", partial.display(), e),
            }
        }
    }

    fn scan(&self, dir: &Path, started_at: SystemTime) -> Snapshot {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read download directory {}: {}", dir.display(), e);
                return Snapshot::default();
            }
        };

        let mut snapshot = Snapshot::default();
        let mut newest: Option<SystemTime> = None;

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }

            if self.is_partial(&path) {
                let replace = snapshot
                    .partial
                    .as_ref()
                    .is_none_or(|(current, _)| path < *current);
                if replace {
                    snapshot.partial = Some((path, metadata.len()));
                }
            } else if self.is_finished(&path) {
                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                if modified >= started_at && newest.is_none_or(|n| modified > n) {
                    newest = Some(modified);
                    snapshot.finished = Some(path);
                }
            }
        }

        snapshot
    }

    fn is_partial(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| {
            self.config
                .partial_extensions
                .iter()
                .any(|partial| partial.eq_ignore_ascii_case(&ext))
        })
    }

    fn is_finished(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| ext.eq_ignore_ascii_case(&self.config.finished_extension))
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|ext| ext.to_string_lossy().into_owned())
}

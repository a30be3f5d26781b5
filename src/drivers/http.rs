//! Direct HTTP download driver
//!
//! Some portals expose the tender archive behind a plain link. This driver
//! fetches it with `reqwest` and writes it the way a browser would: bytes
//! go to `<name>.zip.crdownload` and the file is renamed to `<name>.zip` once
//! the body is complete. The download watcher therefore treats both
//! sources identically.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::DriverError;
use crate::models::TenderRecord;
use crate::records::ArchiveKey;
use crate::traits::DownloadDriver;

const PARTIAL_EXTENSION: &str = "crdownload";

/// Downloads `download_url` of each record in a background task
pub struct HttpDriver {
    client: Client,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpDriver {
    pub fn new() -> Result<Self, DriverError> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            in_flight: Mutex::new(Vec::new()),
        })
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DownloadDriver for HttpDriver {
    fn name(&self) -> &str {
        "http"
    }

    async fn trigger(
        &self,
        record: &TenderRecord,
        key: &ArchiveKey,
        dir: &Path,
    ) -> Result<(), DriverError> {
        let url = record
            .download_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| DriverError::NoLink(key.stem()))?;

        info!("Requesting archive for {} from {}", key.stem(), url);

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DriverError::Status(response.status()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        if !content_type.contains("zip") && !content_type.contains("octet-stream") {
            warn!("Unexpected content type for {}: {:?}", key.stem(), content_type);
        }

        let finished = dir.join(key.archive_name());
        let partial = dir.join(format!("{}.{}", key.archive_name(), PARTIAL_EXTENSION));
        let label = key.stem();

        let handle = tokio::spawn(async move {
            if let Err(e) = stream_to_disk(response, &partial, &finished).await {
                warn!("Download of {} failed: {}", label, e);
                discard_partial(&partial).await;
            }
        });

        let mut handles = self.handles();
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);

        Ok(())
    }

    async fn cancel_downloads(&self) -> Result<(), DriverError> {
        let handles: Vec<_> = self.handles().drain(..).collect();
        let mut cancelled = 0;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("Cancelled {} in-flight downloads", cancelled);
        }
        Ok(())
    }
}

async fn stream_to_disk(
    mut response: reqwest::Response,
    partial: &Path,
    finished: &Path,
) -> Result<(), DriverError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut written = 0usize;

    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len();
    }

    file.flush().await?;
    drop(file);

    if finished.exists() {
        tokio::fs::remove_file(finished).await?;
    }
    tokio::fs::rename(partial, finished).await?;

    info!("Saved {} bytes to {}", written, finished.display());
    Ok(())
}

async fn discard_partial(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => info!("Removed partial download {}", partial.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", partial.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::watcher::{DownloadWatcher, WatchOutcome};
    use mockito::Server;
    use std::time::SystemTime;

    fn fast_watcher() -> DownloadWatcher {
        DownloadWatcher::new(WatchConfig {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(10),
            ..WatchConfig::default()
        })
    }

    #[tokio::test]
    async fn test_download_lands_under_key_name() {
        let mut server = Server::new_async().await;
        let body = b"PK\x05\x06\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0".to_vec();
        let mock = server
            .mock("GET", "/dce/25")
            .with_status(200)
            .with_header("content-type", "application/zip")
            .with_body(body.clone())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut record = TenderRecord::new("25/2025");
        record.download_url = Some(format!("{}/dce/25", server.url()));
        let key = ArchiveKey::for_record(&record, 1, "resultat_offre");

        let driver = HttpDriver::new().unwrap();
        let started = SystemTime::now() - Duration::from_secs(5);
        driver.trigger(&record, &key, dir.path()).await.unwrap();
        let outcome = fast_watcher().watch(dir.path(), started, &driver).await;

        mock.assert_async().await;
        let expected = dir.path().join("25_2025.zip");
        assert_eq!(outcome, WatchOutcome::Completed(expected.clone()));
        assert_eq!(std::fs::read(&expected).unwrap(), body);
        assert!(!dir.path().join("25_2025.zip.crdownload").exists());
    }

    #[tokio::test]
    async fn test_missing_link_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let record = TenderRecord::new("25/2025");
        let key = ArchiveKey::for_record(&record, 1, "resultat_offre");

        let err = HttpDriver::new()
            .unwrap()
            .trigger(&record, &key, dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::NoLink(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_error_status_is_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/dce/404")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut record = TenderRecord::new("404/2025");
        record.download_url = Some(format!("{}/dce/404", server.url()));
        let key = ArchiveKey::for_record(&record, 1, "resultat_offre");

        let err = HttpDriver::new()
            .unwrap()
            .trigger(&record, &key, dir.path())
            .await
            .unwrap_err();

        match err {
            DriverError::Status(status) => assert_eq!(status.as_u16(), 404),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_discard_partial_removes_leftover() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("25_2025.zip.crdownload");
        std::fs::write(&partial, b"PK\x03\x04").unwrap();

        discard_partial(&partial).await;
        assert!(!partial.exists());

        // Already gone: nothing to do
        discard_partial(&partial).await;

        let blocked = dir.path().join("busy.zip.crdownload");
        std::fs::create_dir(&blocked).unwrap();
        discard_partial(&blocked).await;
        assert!(blocked.exists());
    }

    #[tokio::test]
    async fn test_cancel_without_downloads() {
        let driver = HttpDriver::new().unwrap();
        driver.cancel_downloads().await.unwrap();
    }
}

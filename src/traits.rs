//! Traits and interfaces for portal-agnostic downloading

use std::path::Path;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::models::TenderRecord;
use crate::records::ArchiveKey;

/// Something that can make a tender archive appear in a download directory.
///
/// Implementations only start the download: the bytes land in `dir` under a
/// partial extension and are renamed once complete, which is what the
/// download watcher looks for. A browser session and a plain HTTP client fit
/// the same shape.
#[async_trait]
pub trait DownloadDriver: Send + Sync {
    /// Display name used in logs
    fn name(&self) -> &str;

    /// Starts downloading the archive for `record` into `dir`.
    ///
    /// # Arguments
    /// * `record` - The tender whose documents are wanted
    /// * `key` - Stable name for the record's files
    /// * `dir` - Directory the finished artifact must appear in
    ///
    /// # Returns
    /// * `Result<(), DriverError>` - `Ok` once the download is under way
    async fn trigger(
        &self,
        record: &TenderRecord,
        key: &ArchiveKey,
        dir: &Path,
    ) -> Result<(), DriverError>;

    /// Cancels every download still in flight
    async fn cancel_downloads(&self) -> Result<(), DriverError>;
}

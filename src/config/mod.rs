//! Runtime configuration for the harvester
//!
//! Values come from the environment (a `.env` file is loaded in `main`) and
//! fall back to the layout the consuming web application expects:
//! `storage/app/public/<domain>/`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Timing parameters for the download watcher
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Delay between two scans of the download directory
    pub poll_interval: Duration,
    /// How long a partial file may keep the same size before it counts as a stall
    pub stall_threshold: Duration,
    /// Consecutive stalls tolerated before the download is abandoned
    pub max_stalls: u32,
    /// Overall budget for one download
    pub timeout: Duration,
    /// Extensions a browser gives to files still being written
    pub partial_extensions: Vec<String>,
    /// Extension of a finished archive
    pub finished_extension: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            stall_threshold: Duration::from_secs(30),
            max_stalls: 3,
            timeout: Duration::from_secs(120),
            partial_extensions: vec!["crdownload".to_string(), "part".to_string()],
            finished_extension: "zip".to_string(),
        }
    }
}

/// Configuration for one harvest domain
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Directory the web application serves under `public_prefix`
    pub storage_root: PathBuf,
    /// Sub-folder of the storage root holding this portal's files
    pub domain: String,
    /// URL prefix for extracted files
    pub public_prefix: String,
    /// File stem for the CSV and JSON exports
    pub export_stem: String,
    /// Directory the browser drops downloads into; the domain folder when unset
    pub download_dir: Option<PathBuf>,
    /// Name prefix for records without a usable reference, e.g. `resultat_offre_4`
    pub fallback_kind: String,
    pub watch: WatchConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage/app/public"),
            domain: "marche_public".to_string(),
            public_prefix: "/storage".to_string(),
            export_stem: "marches_publics_data".to_string(),
            download_dir: None,
            fallback_kind: "resultat_offre".to_string(),
            watch: WatchConfig::default(),
        }
    }
}

impl HarvestConfig {
    /// Builds a configuration from `HARVEST_*` environment variables.
    ///
    /// Unset variables keep their default; unparsable ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let watch_defaults = WatchConfig::default();

        let watch = WatchConfig {
            poll_interval: Duration::from_secs(env_or(
                "HARVEST_POLL_SECS",
                watch_defaults.poll_interval.as_secs(),
            )),
            stall_threshold: Duration::from_secs(env_or(
                "HARVEST_STALL_SECS",
                watch_defaults.stall_threshold.as_secs(),
            )),
            max_stalls: env_or("HARVEST_MAX_STALLS", watch_defaults.max_stalls),
            timeout: Duration::from_secs(env_or(
                "HARVEST_TIMEOUT_SECS",
                watch_defaults.timeout.as_secs(),
            )),
            ..watch_defaults
        };

        Self {
            storage_root: std::env::var("HARVEST_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            domain: std::env::var("HARVEST_DOMAIN").unwrap_or(defaults.domain),
            public_prefix: std::env::var("HARVEST_PUBLIC_PREFIX").unwrap_or(defaults.public_prefix),
            export_stem: std::env::var("HARVEST_EXPORT_STEM").unwrap_or(defaults.export_stem),
            download_dir: std::env::var("HARVEST_DOWNLOAD_DIR").ok().map(PathBuf::from),
            fallback_kind: std::env::var("HARVEST_FALLBACK_KIND").unwrap_or(defaults.fallback_kind),
            watch,
        }
    }

    /// Creates a configuration rooted at `storage_root` with default settings
    pub fn with_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    pub fn domain_dir(&self) -> PathBuf {
        self.storage_root.join(&self.domain)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.domain_dir())
    }

    pub fn known_references_path(&self) -> PathBuf {
        self.domain_dir().join("known_references.json")
    }

    pub fn progress_path(&self) -> PathBuf {
        self.domain_dir().join("scraping_progress.json")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.domain_dir().join("extraction_stats.json")
    }

    pub fn json_export_path(&self) -> PathBuf {
        self.domain_dir().join(format!("{}.json", self.export_stem))
    }

    pub fn csv_export_path(&self) -> PathBuf {
        self.domain_dir().join(format!("{}.csv", self.export_stem))
    }

    /// Storage-relative link recorded in `chemin_zip`, e.g. `storage/marche_public/25_2025.zip`
    pub fn archive_link(&self, archive: &Path) -> String {
        let file_name = archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!(
            "{}/{}/{}",
            self.public_prefix.trim_matches('/'),
            self.domain,
            file_name
        )
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid value for {}: {:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let config = HarvestConfig::with_root("/srv/storage");
        assert_eq!(config.domain_dir(), PathBuf::from("/srv/storage/marche_public"));
        assert_eq!(config.download_dir(), config.domain_dir());
        assert_eq!(
            config.json_export_path(),
            PathBuf::from("/srv/storage/marche_public/marches_publics_data.json")
        );
    }

    #[test]
    fn test_archive_link() {
        let config = HarvestConfig::with_root("/srv/storage");
        let link = config.archive_link(Path::new("/srv/storage/marche_public/25_2025.zip"));
        assert_eq!(link, "storage/marche_public/25_2025.zip");
    }

    #[test]
    fn test_watch_defaults() {
        let watch = WatchConfig::default();
        assert_eq!(watch.poll_interval, Duration::from_secs(3));
        assert_eq!(watch.stall_threshold, Duration::from_secs(30));
        assert_eq!(watch.max_stalls, 3);
        assert_eq!(watch.timeout, Duration::from_secs(120));
    }
}

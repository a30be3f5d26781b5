//! Unpacks validated archives into per-record directories

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::config::HarvestConfig;
use crate::error::ExtractError;
use crate::records::ArchiveKey;

/// How many extracted paths are echoed to the log after a success
const LOGGED_FILES: usize = 10;

/// Extracts archives under a domain folder and reports web paths
#[derive(Debug, Clone)]
pub struct Extractor {
    storage_root: PathBuf,
    domain_dir: PathBuf,
    public_prefix: String,
}

impl Extractor {
    pub fn new(config: &HarvestConfig) -> Self {
        Self {
            storage_root: config.storage_root.clone(),
            domain_dir: config.domain_dir(),
            public_prefix: config.public_prefix.clone(),
        }
    }

    pub fn extraction_dir(&self, key: &ArchiveKey) -> PathBuf {
        self.domain_dir.join(key.extraction_dir_name())
    }

    /// Extracts `archive` into the directory for `key`.
    ///
    /// Any earlier directory for the key is removed first. On failure, or
    /// when the archive yields no files, the output directory is removed
    /// again; the archive itself is never touched.
    pub fn extract(&self, archive: &Path, key: &ArchiveKey) -> Result<Vec<String>, ExtractError> {
        let target = self.extraction_dir(key);

        if target.exists() {
            std::fs::remove_dir_all(&target)?;
            info!("Removed previous extraction directory {}", target.display());
        }

        let result = self.unpack(archive, &target).and_then(|files| {
            if files.is_empty() {
                Err(ExtractError::NoFiles(archive.to_path_buf()))
            } else {
                Ok(files)
            }
        });

        match result {
            Ok(files) => {
                info!(
                    "Extracted {} files from {} into {}",
                    files.len(),
                    archive.display(),
                    target.display()
                );
                for file in files.iter().take(LOGGED_FILES) {
                    info!("  - {}", file);
                }
                if files.len() > LOGGED_FILES {
                    info!("  ... and {} more", files.len() - LOGGED_FILES);
                }
                Ok(files)
            }
            Err(e) => {
                warn!("[{}] Extraction of {} failed: {}", e.kind(), archive.display(), e);
                discard(&target);
                Err(e)
            }
        }
    }

    /// Lists every file under `dir` as a web path, in a stable order
    pub fn list_files(&self, dir: &Path) -> Result<Vec<String>, ExtractError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(web_path(&self.storage_root, entry.path(), &self.public_prefix)?);
            }
        }
        Ok(files)
    }

    fn unpack(&self, archive: &Path, target: &Path) -> Result<Vec<String>, ExtractError> {
        let file = File::open(archive)?;
        let mut zip = ZipArchive::new(BufReader::new(file))?;
        std::fs::create_dir_all(target)?;
        zip.extract(target)?;
        self.list_files(target)
    }
}

/// Converts a file under `storage_root` into `<prefix>/<relative/path>`
pub fn web_path(storage_root: &Path, file: &Path, public_prefix: &str) -> Result<String, ExtractError> {
    let relative = file
        .strip_prefix(storage_root)
        .map_err(|_| ExtractError::OutsideStorage {
            path: file.to_path_buf(),
            root: storage_root.to_path_buf(),
        })?;

    let joined = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    Ok(format!("{}/{}", public_prefix.trim_end_matches('/'), joined))
}

fn discard(dir: &Path) {
    if dir.exists()
        && let Err(e) = std::fs::remove_dir_all(dir)
    {
        warn!("Could not remove {}: {}", dir.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::{write_empty_zip, write_zip};

    fn setup() -> (tempfile::TempDir, HarvestConfig, Extractor) {
        let root = tempfile::tempdir().unwrap();
        let config = HarvestConfig::with_root(root.path());
        std::fs::create_dir_all(config.domain_dir()).unwrap();
        let extractor = Extractor::new(&config);
        (root, config, extractor)
    }

    fn key(stem: &str) -> ArchiveKey {
        ArchiveKey::Reference(stem.to_string())
    }

    fn files_on_disk(dir: &Path) -> usize {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_extract_reports_web_paths() {
        let (_root, config, extractor) = setup();
        let archive = config.domain_dir().join("25_2025.zip");
        write_zip(
            &archive,
            &[
                ("RC.pdf", b"rc"),
                ("CPS/cps.pdf", b"cps"),
                ("CPS/annexes/bpu.xlsx", b"bpu"),
            ],
        );

        let files = extractor.extract(&archive, &key("25_2025")).unwrap();

        assert_eq!(
            files,
            vec![
                "/storage/marche_public/25_2025_extrait/CPS/annexes/bpu.xlsx",
                "/storage/marche_public/25_2025_extrait/CPS/cps.pdf",
                "/storage/marche_public/25_2025_extrait/RC.pdf",
            ]
        );
        assert_eq!(files_on_disk(&extractor.extraction_dir(&key("25_2025"))), 3);
        assert!(archive.exists());
    }

    #[test]
    fn test_empty_archive_leaves_nothing_behind() {
        let (_root, config, extractor) = setup();
        let archive = config.domain_dir().join("empty.zip");
        write_empty_zip(&archive);
        let target = extractor.extraction_dir(&key("empty"));

        for _ in 0..2 {
            let err = extractor.extract(&archive, &key("empty")).unwrap_err();
            assert!(matches!(err, ExtractError::NoFiles(_)));
            assert!(!target.exists());
        }
    }

    #[test]
    fn test_reextraction_replaces_previous_output() {
        let (_root, config, extractor) = setup();
        let target = extractor.extraction_dir(&key("25_2025"));
        std::fs::create_dir_all(target.join("stale")).unwrap();
        std::fs::write(target.join("stale/old.pdf"), b"old").unwrap();

        let archive = config.domain_dir().join("25_2025.zip");
        write_zip(&archive, &[("new.pdf", b"new")]);

        let first = extractor.extract(&archive, &key("25_2025")).unwrap();
        let second = extractor.extract(&archive, &key("25_2025")).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, vec!["/storage/marche_public/25_2025_extrait/new.pdf"]);
        assert!(!target.join("stale").exists());
        assert_eq!(files_on_disk(&target), 1);
    }

    #[test]
    fn test_unreadable_archive_rolls_back() {
        let (_root, config, extractor) = setup();
        let archive = config.domain_dir().join("broken.zip");
        std::fs::write(&archive, b"not a zip at all").unwrap();

        let result = extractor.extract(&archive, &key("broken"));

        assert!(result.is_err());
        assert!(!extractor.extraction_dir(&key("broken")).exists());
        assert_eq!(std::fs::read(&archive).unwrap(), b"not a zip at all");
    }

    #[test]
    fn test_indexed_key_directory_name() {
        let (_root, config, extractor) = setup();
        let archive = config.domain_dir().join("resultat_offre_2.zip");
        write_zip(&archive, &[("pv.pdf", b"pv")]);
        let key = ArchiveKey::Indexed {
            kind: "resultat_offre".to_string(),
            index: 2,
        };

        let files = extractor.extract(&archive, &key).unwrap();
        assert_eq!(files, vec!["/storage/marche_public/resultat_offre_2/pv.pdf"]);
    }

    #[test]
    fn test_web_path_outside_root() {
        let err = web_path(Path::new("/srv/storage"), Path::new("/tmp/x.pdf"), "/storage").unwrap_err();
        assert!(matches!(err, ExtractError::OutsideStorage { .. }));
    }

    #[test]
    fn test_web_path_trims_prefix_slash() {
        let path = web_path(
            Path::new("/srv/storage"),
            Path::new("/srv/storage/marche_public/a/b.pdf"),
            "/storage/",
        )
        .unwrap();
        assert_eq!(path, "/storage/marche_public/a/b.pdf");
    }
}

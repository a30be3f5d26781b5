//! Pre-extraction checks for downloaded archives

use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::Path;

use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::ArchiveError;

/// Checks that `path` is a non-empty, readable ZIP whose members all pass
/// their checksum.
///
/// Checks run in order and stop at the first failure, which is logged with
/// its reason. The file is never modified.
pub fn validate(path: &Path) -> Result<(), ArchiveError> {
    match check(path) {
        Ok(members) => {
            info!("Archive {} is valid ({} members)", path.display(), members);
            Ok(())
        }
        Err(e) => {
            warn!(
                "[{}] Archive rejected ({}): {}",
                e.kind(),
                e.reason(),
                e
            );
            Err(e)
        }
    }
}

fn check(path: &Path) -> Result<usize, ArchiveError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(ArchiveError::Missing(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ArchiveError::Missing(path.to_path_buf()));
        }
        Err(source) => {
            return Err(ArchiveError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    if metadata.len() == 0 {
        return Err(ArchiveError::Empty(path.to_path_buf()));
    }

    let file = File::open(path).map_err(|source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut archive =
        ZipArchive::new(BufReader::new(file)).map_err(|source| ArchiveError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;

    if let Some(member) = first_bad_member(&mut archive) {
        return Err(ArchiveError::CorruptMember {
            path: path.to_path_buf(),
            member,
        });
    }

    Ok(archive.len())
}

/// Reads every member to the end so the CRC is verified; returns the first
/// member that fails.
fn first_bad_member<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Option<String> {
    for index in 0..archive.len() {
        match archive.by_index(index) {
            Ok(mut entry) => {
                let name = entry.name().to_string();
                if io::copy(&mut entry, &mut io::sink()).is_err() {
                    return Some(name);
                }
            }
            Err(e) => return Some(format!("entry #{index} ({e})")),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::{write_zip, write_zip_stored};

    #[test]
    fn test_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(&dir.path().join("absent.zip")).unwrap_err();
        assert_eq!(err.reason(), "missing");
    }

    #[test]
    fn test_directory_is_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate(dir.path()).unwrap_err();
        assert_eq!(err.reason(), "missing");
    }

    #[test]
    fn test_zero_byte_archive_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("25_2025.zip");
        std::fs::write(&path, b"").unwrap();

        let err = validate(&path).unwrap_err();
        assert!(matches!(err, ArchiveError::Empty(_)));
        assert_eq!(err.reason(), "empty");
    }

    #[test]
    fn test_garbage_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("25_2025.zip");
        std::fs::write(&path, b"<html>session expired</html>").unwrap();

        let err = validate(&path).unwrap_err();
        assert_eq!(err.reason(), "malformed");
    }

    #[test]
    fn test_corrupt_member_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("25_2025.zip");
        write_zip_stored(&path, &[("ok.txt", b"fine"), ("cps.txt", b"payload-payload-payload")]);

        let mut bytes = std::fs::read(&path).unwrap();
        let needle = b"payload-payload-payload";
        let at = bytes
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        bytes[at + 3] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = validate(&path).unwrap_err();
        match err {
            ArchiveError::CorruptMember { member, .. } => assert_eq!(member, "cps.txt"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_valid_archive_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("25_2025.zip");
        write_zip(&path, &[("rc.pdf", b"%PDF-1.4"), ("annexes/bpu.xlsx", b"sheet")]);
        let before = std::fs::read(&path).unwrap();

        validate(&path).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}

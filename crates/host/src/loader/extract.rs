//! Hardened extraction of gzip-compressed tar package archives.
//!
//! Archives come from a package store and are untrusted until proven
//! otherwise: extraction rejects absolute paths, parent-directory escapes,
//! link and device entries, and archives exceeding entry-count or total
//! uncompressed size ceilings.

use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::debug;

use crate::types::LoadError;

/// Ceiling on the number of entries one package archive may contain.
const MAX_ENTRY_COUNT: usize = 10_000;

/// Ceiling on the total uncompressed size of one package archive.
const MAX_EXTRACTED_SIZE: u64 = 500 * 1024 * 1024;

/// Unpacks a gzip-compressed tar archive into `dest`, creating it first.
pub fn extract_archive(data: &[u8], dest: &Path) -> Result<(), LoadError> {
    std::fs::create_dir_all(dest).map_err(|err| LoadError::extract(err.to_string()))?;
    let dest = dest
        .canonicalize()
        .map_err(|err| LoadError::extract(err.to_string()))?;

    let mut archive = Archive::new(GzDecoder::new(data));
    let mut entry_count = 0usize;
    let mut extracted_bytes = 0u64;

    for entry in archive
        .entries()
        .map_err(|err| LoadError::extract(err.to_string()))?
    {
        let mut entry = entry.map_err(|err| LoadError::extract(err.to_string()))?;

        entry_count += 1;
        if entry_count > MAX_ENTRY_COUNT {
            return Err(LoadError::extract(format!(
                "archive exceeds {MAX_ENTRY_COUNT} entries"
            )));
        }

        let raw_path = entry
            .path()
            .map_err(|err| LoadError::extract(err.to_string()))?
            .into_owned();

        let entry_type = entry.header().entry_type();
        if !is_safe_entry_type(entry_type) {
            return Err(LoadError::UnsafeEntry {
                entry_type: format!("{entry_type:?}"),
                path: raw_path.display().to_string(),
            });
        }

        validate_entry_path(&raw_path)?;

        extracted_bytes = extracted_bytes.saturating_add(entry.size());
        if extracted_bytes > MAX_EXTRACTED_SIZE {
            return Err(LoadError::extract(format!(
                "archive exceeds {MAX_EXTRACTED_SIZE} uncompressed bytes"
            )));
        }

        let target = dest.join(&raw_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|err| LoadError::extract(err.to_string()))?;
            // The lexical checks above do not cover ancestors replaced by
            // links on disk; the canonical parent must stay under dest.
            let canonical_parent = parent
                .canonicalize()
                .map_err(|err| LoadError::extract(err.to_string()))?;
            if !canonical_parent.starts_with(&dest) {
                return Err(LoadError::PathTraversal {
                    path: raw_path.display().to_string(),
                });
            }
        }

        entry
            .unpack(&target)
            .map_err(|err| LoadError::extract(err.to_string()))?;
    }

    debug!(
        entries = entry_count,
        bytes = extracted_bytes,
        dest = %dest.display(),
        "extracted package archive"
    );
    Ok(())
}

fn is_safe_entry_type(entry_type: EntryType) -> bool {
    matches!(
        entry_type,
        EntryType::Regular
            | EntryType::Directory
            | EntryType::GNULongName
            | EntryType::XHeader
            | EntryType::XGlobalHeader
    )
}

fn validate_entry_path(path: &Path) -> Result<(), LoadError> {
    if path.is_absolute() {
        return Err(LoadError::PathTraversal {
            path: path.display().to_string(),
        });
    }
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(LoadError::PathTraversal {
                    path: path.display().to_string(),
                });
            }
            Component::Normal(_) | Component::CurDir => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzipped_tar<F>(build: F) -> Vec<u8>
    where
        F: FnOnce(&mut tar::Builder<Vec<u8>>),
    {
        let mut builder = tar::Builder::new(Vec::new());
        build(&mut builder);
        gzip_bytes(&builder.into_inner().unwrap())
    }

    fn gzip_bytes(tarball: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(tarball).unwrap();
        encoder.finish().unwrap()
    }

    fn file_entry(builder: &mut tar::Builder<Vec<u8>>, path: &str, contents: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, contents).unwrap();
    }

    /// Builds a raw header the `tar` builder would refuse to write.
    fn raw_header(path: &str, size: u64) -> Vec<u8> {
        let mut header = tar::Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..path.len()].copy_from_slice(path.as_bytes());
        }
        header.set_size(size);
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_cksum();
        header.as_bytes().to_vec()
    }

    const TERMINATOR: [u8; 1024] = [0u8; 1024];

    #[test]
    fn extracts_files_and_nested_directories() {
        let data = gzipped_tar(|builder| {
            file_entry(builder, "module.txt", b"hello");
            file_entry(builder, "nested/inner.txt", b"world");
        });
        let dest = tempfile::tempdir().unwrap();

        extract_archive(&data, dest.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.path().join("module.txt")).unwrap(),
            "hello"
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("nested").join("inner.txt")).unwrap(),
            "world"
        );
    }

    #[test]
    fn rejects_parent_dir_escapes() {
        let mut tarball = raw_header("../escape.txt", 1);
        tarball.extend_from_slice(b"x");
        tarball.extend_from_slice(&[0u8; 511]);
        tarball.extend_from_slice(&TERMINATOR);

        let dest = tempfile::tempdir().unwrap();
        let err = extract_archive(&gzip_bytes(&tarball), dest.path()).unwrap_err();
        assert!(matches!(err, LoadError::PathTraversal { .. }));
        assert!(!dest.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn rejects_absolute_entry_paths() {
        let mut tarball = raw_header("/abs/escape.txt", 0);
        tarball.extend_from_slice(&TERMINATOR);

        let dest = tempfile::tempdir().unwrap();
        let err = extract_archive(&gzip_bytes(&tarball), dest.path()).unwrap_err();
        assert!(matches!(err, LoadError::PathTraversal { .. }));
    }

    #[test]
    fn rejects_symlink_entries() {
        let data = gzipped_tar(|builder| {
            let mut header = tar::Header::new_gnu();
            header.set_size(0);
            header.set_entry_type(EntryType::Symlink);
            builder
                .append_link(&mut header, "evil", "/etc/passwd")
                .unwrap();
        });

        let dest = tempfile::tempdir().unwrap();
        let err = extract_archive(&data, dest.path()).unwrap_err();
        assert!(matches!(err, LoadError::UnsafeEntry { .. }));
    }

    #[test]
    fn rejects_archives_with_too_many_entries() {
        let data = gzipped_tar(|builder| {
            for i in 0..=MAX_ENTRY_COUNT {
                file_entry(builder, &format!("f{i}"), b"");
            }
        });

        let dest = tempfile::tempdir().unwrap();
        let err = extract_archive(&data, dest.path()).unwrap_err();
        assert!(matches!(err, LoadError::Extract { .. }));
    }

    #[test]
    fn rejects_oversized_declared_content() {
        let mut tarball = raw_header("huge.bin", MAX_EXTRACTED_SIZE + 1);
        tarball.extend_from_slice(&TERMINATOR);

        let dest = tempfile::tempdir().unwrap();
        let err = extract_archive(&gzip_bytes(&tarball), dest.path()).unwrap_err();
        assert!(matches!(err, LoadError::Extract { .. }));
    }
}

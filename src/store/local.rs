//! Filesystem-backed store.
//!
//! Store paths map beneath a root directory, so `/00_inbox_raw/IN/a.xlsx`
//! lives at `<root>/00_inbox_raw/IN/a.xlsx`. Revisions are content
//! fingerprints, which gives the same reprocess-on-change behavior as a
//! remote revision token.
use super::path::normalize;
use super::{BlobStore, FileEntry, StoreError, StoreResult, WriteMode};
use crate::util::sha256_hex;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Hex digits of the content hash used as a local revision token.
const REVISION_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve a store path to its location on disk.
    pub fn resolve(&self, store_path: &str) -> PathBuf {
        let normalized = normalize(store_path);
        let rel = normalized.trim_start_matches('/');
        if rel.is_empty() {
            return self.root.clone();
        }
        self.root.join(rel)
    }

    fn io_error(operation: &'static str, path: &str, source: io::Error) -> StoreError {
        match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound {
                path: normalize(path),
            },
            io::ErrorKind::AlreadyExists => StoreError::Conflict {
                path: normalize(path),
            },
            _ => StoreError::Io {
                operation,
                path: normalize(path),
                source,
            },
        }
    }
}

fn revision_for(bytes: &[u8]) -> String {
    let mut digest = sha256_hex(bytes);
    digest.truncate(REVISION_LEN);
    digest
}

impl BlobStore for LocalStore {
    fn list(&self, dir: &str) -> StoreResult<Vec<FileEntry>> {
        let dir_path = self.resolve(dir);
        if !dir_path.is_dir() {
            return Ok(Vec::new());
        }
        let read_dir = fs::read_dir(&dir_path).map_err(|err| Self::io_error("list", dir, err))?;
        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|err| Self::io_error("list", dir, err))?;
            let file_type = entry
                .file_type()
                .map_err(|err| Self::io_error("list", dir, err))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let store_path = super::path::join(dir, &name);
            let bytes =
                fs::read(entry.path()).map_err(|err| Self::io_error("list", &store_path, err))?;
            entries.push(FileEntry {
                path: store_path,
                name,
                revision: Some(revision_for(&bytes)),
                size: bytes.len() as u64,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        let disk = self.resolve(path);
        if disk.is_dir() {
            return Err(StoreError::NotFound {
                path: normalize(path),
            });
        }
        fs::read(&disk).map_err(|err| Self::io_error("read", path, err))
    }

    fn write(&self, path: &str, bytes: &[u8], mode: WriteMode) -> StoreResult<()> {
        let disk = self.resolve(path);
        let parent = disk
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).map_err(|err| Self::io_error("write", path, err))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|err| Self::io_error("write", path, err))?;
        tmp.write_all(bytes)
            .map_err(|err| Self::io_error("write", path, err))?;
        let persisted = match mode {
            WriteMode::Overwrite => tmp.persist(&disk),
            WriteMode::Create => tmp.persist_noclobber(&disk),
        };
        persisted
            .map(|_| ())
            .map_err(|err| Self::io_error("write", path, err.error))
    }

    fn move_file(&self, src: &str, dst: &str) -> StoreResult<()> {
        let src_disk = self.resolve(src);
        let dst_disk = self.resolve(dst);
        if !src_disk.is_file() {
            return Err(StoreError::NotFound {
                path: normalize(src),
            });
        }
        if dst_disk.exists() {
            return Err(StoreError::Conflict {
                path: normalize(dst),
            });
        }
        if let Some(parent) = dst_disk.parent() {
            fs::create_dir_all(parent).map_err(|err| Self::io_error("move", dst, err))?;
        }
        fs::rename(&src_disk, &dst_disk).map_err(|err| Self::io_error("move", src, err))
    }

    fn ensure_dir(&self, dir: &str) -> StoreResult<()> {
        let disk = self.resolve(dir);
        fs::create_dir_all(&disk).map_err(|err| Self::io_error("ensure_dir", dir, err))
    }

    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }
}

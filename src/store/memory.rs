//! In-memory store for unit tests, with failure injection.
use super::path::{join, normalize, parent};
use super::{BlobStore, FileEntry, StoreError, StoreResult, WriteMode};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
struct Failure {
    operation: &'static str,
    path_prefix: String,
    fatal: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RefCell<BTreeMap<String, (Vec<u8>, u64)>>,
    dirs: RefCell<BTreeSet<String>>,
    next_rev: Cell<u64>,
    failures: RefCell<Vec<Failure>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file without going through failure injection.
    pub fn put(&self, path: &str, bytes: &[u8]) {
        let rev = self.bump();
        self.files
            .borrow_mut()
            .insert(normalize(path), (bytes.to_vec(), rev));
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .borrow()
            .get(&normalize(path))
            .map(|(bytes, _)| bytes.clone())
    }

    pub fn paths_under(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", normalize(dir));
        self.files
            .borrow()
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn has_dir(&self, dir: &str) -> bool {
        self.dirs.borrow().contains(&normalize(dir))
    }

    /// Make every `operation` on paths starting with `path_prefix` fail.
    pub fn fail_on(&self, operation: &'static str, path_prefix: &str, fatal: bool) {
        self.failures.borrow_mut().push(Failure {
            operation,
            path_prefix: normalize(path_prefix),
            fatal,
        });
    }

    pub fn clear_failures(&self) {
        self.failures.borrow_mut().clear();
    }

    fn bump(&self) -> u64 {
        let rev = self.next_rev.get() + 1;
        self.next_rev.set(rev);
        rev
    }

    fn check(&self, operation: &'static str, path: &str) -> StoreResult<()> {
        let path = normalize(path);
        let failures = self.failures.borrow();
        let hit = failures
            .iter()
            .find(|f| f.operation == operation && path.starts_with(&f.path_prefix));
        match hit {
            Some(f) if f.fatal => Err(StoreError::Fatal {
                operation,
                message: "injected fatal failure".to_string(),
            }),
            Some(_) => Err(StoreError::Transient {
                operation,
                message: "injected failure".to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl BlobStore for MemoryStore {
    fn list(&self, dir: &str) -> StoreResult<Vec<FileEntry>> {
        self.check("list", dir)?;
        let dir = normalize(dir);
        let files = self.files.borrow();
        Ok(files
            .iter()
            .filter(|(path, _)| parent(path) == dir)
            .map(|(path, (bytes, rev))| FileEntry {
                path: path.clone(),
                name: super::path::file_name(path),
                revision: Some(format!("rev{rev}")),
                size: bytes.len() as u64,
            })
            .collect())
    }

    fn read(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.check("read", path)?;
        self.get(path).ok_or_else(|| StoreError::NotFound {
            path: normalize(path),
        })
    }

    fn write(&self, path: &str, bytes: &[u8], mode: WriteMode) -> StoreResult<()> {
        self.check("write", path)?;
        let path = normalize(path);
        if mode == WriteMode::Create && self.files.borrow().contains_key(&path) {
            return Err(StoreError::Conflict { path });
        }
        self.dirs.borrow_mut().insert(parent(&path));
        self.put(&path, bytes);
        Ok(())
    }

    fn move_file(&self, src: &str, dst: &str) -> StoreResult<()> {
        self.check("move", src)?;
        let src = normalize(src);
        let dst = normalize(dst);
        let mut files = self.files.borrow_mut();
        if files.contains_key(&dst) {
            return Err(StoreError::Conflict { path: dst });
        }
        let entry = files
            .remove(&src)
            .ok_or_else(|| StoreError::NotFound { path: src.clone() })?;
        files.insert(dst, entry);
        Ok(())
    }

    fn ensure_dir(&self, dir: &str) -> StoreResult<()> {
        self.check("ensure_dir", dir)?;
        self.dirs.borrow_mut().insert(normalize(dir));
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[test]
fn memory_store_moves_and_lists_direct_children_only() {
    let store = MemoryStore::new();
    store.put("/00/IN/a.xlsx", b"a");
    store.put("/00/IN/sub/b.xlsx", b"b");
    assert_eq!(store.list("/00/IN").expect("list").len(), 1);
    store
        .move_file("/00/IN/a.xlsx", &join("/00/DONE", "a.xlsx"))
        .expect("move");
    assert_eq!(store.paths_under("/00/DONE"), vec!["/00/DONE/a.xlsx"]);
}

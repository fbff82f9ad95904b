//! In-memory artifact store for tests and dry runs

use crate::error::StorageError;
use crate::store::{check_relative, ArtifactStore};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub struct MemoryArtifactStore {
    root: PathBuf,
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            files: Mutex::new(BTreeMap::new()),
        }
    }

    /// Every stored artifact path, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.lock().keys().cloned().collect()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        check_relative(path)?;
        Ok(self.files.lock().get(path).cloned())
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        check_relative(path)?;
        self.files.lock().insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        check_relative(path)?;
        Ok(self.files.lock().keys().any(|key| key.starts_with(path)))
    }

    fn append_log(&self, path: &Path, line: &str) -> Result<(), StorageError> {
        check_relative(path)?;
        let mut files = self.files.lock();
        let log = files.entry(path.to_path_buf()).or_default();
        log.extend_from_slice(line.as_bytes());
        log.push(b'\n');
        Ok(())
    }

    fn list_children(&self, path: &Path) -> Result<Vec<String>, StorageError> {
        check_relative(path)?;
        let files = self.files.lock();
        let names: BTreeSet<String> = files
            .keys()
            .filter_map(|key| key.strip_prefix(path).ok())
            .filter_map(|rest| rest.components().next())
            .map(|first| first.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        check_relative(from)?;
        check_relative(to)?;
        let mut files = self.files.lock();
        let bytes = files.get(from).cloned().ok_or_else(|| {
            StorageError::io(
                from,
                std::io::Error::new(std::io::ErrorKind::NotFound, "artifact not found"),
            )
        })?;
        files.insert(to.to_path_buf(), bytes);
        Ok(())
    }

    fn remove_tree(&self, path: &Path) -> Result<(), StorageError> {
        check_relative(path)?;
        self.files.lock().retain(|key, _| !key.starts_with(path));
        Ok(())
    }
}

//! Filesystem artifact store rooted at a run directory

use crate::error::StorageError;
use crate::store::{check_relative, ArtifactStore};
use parking_lot::Mutex;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct FsArtifactStore {
    root: PathBuf,
    log_lock: Mutex<()>,
}

impl FsArtifactStore {
    /// Create the run directory (and parents) and root a store there.
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|e| StorageError::io(root, e))?;
        Self::open(root)
    }

    /// Root a store at an existing run directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(StorageError::InvalidPath(format!(
                "Run directory does not exist: {}",
                root.display()
            )));
        }
        let root = dunce::canonicalize(root).map_err(|e| StorageError::io(root, e))?;
        Ok(Self {
            root,
            log_lock: Mutex::new(()),
        })
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, StorageError> {
        check_relative(path)?;
        Ok(self.root.join(path))
    }

    fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        Ok(())
    }
}

impl ArtifactStore for FsArtifactStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(full, e)),
        }
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full)?;

        // Write to .tmp then rename so readers never see a torn artifact
        let mut tmp_name = full.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = full.with_file_name(tmp_name);
        fs::write(&tmp, bytes).map_err(|e| StorageError::io(&tmp, e))?;
        fs::rename(&tmp, &full).map_err(|e| StorageError::io(&full, e))
    }

    fn exists(&self, path: &Path) -> Result<bool, StorageError> {
        Ok(self.resolve(path)?.exists())
    }

    fn append_log(&self, path: &Path, line: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        let _guard = self.log_lock.lock();
        Self::ensure_parent(&full)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .map_err(|e| StorageError::io(&full, e))?;
        writeln!(file, "{}", line).map_err(|e| StorageError::io(&full, e))
    }

    fn list_children(&self, path: &Path) -> Result<Vec<String>, StorageError> {
        let full = self.resolve(path)?;
        if !full.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&full)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| full.clone());
                StorageError::io(path, e.into())
            })?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        Self::ensure_parent(&target)?;
        fs::copy(&source, &target)
            .map(|_| ())
            .map_err(|e| StorageError::io(source, e))
    }

    fn remove_tree(&self, path: &Path) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match fs::remove_dir_all(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(full, e)),
        }
    }
}

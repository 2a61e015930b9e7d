//! Auxiliary (non-zoned) filesystem used for directories, locks and logs.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ZenFsError, ZenFsResult};

/// A lock on an auxiliary file, returned by [`AuxFileSystem::lock_file`].
#[derive(Debug, PartialEq, Eq)]
pub struct AuxFileLock {
    path: String,
}

impl AuxFileLock {
    /// Path of the locked file.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Path operations that do not involve extents.
/// All paths are absolute paths on the auxiliary filesystem.
pub trait AuxFileSystem: Send + Sync {
    /// Whether a file or directory exists.
    fn file_exists(&self, path: &str) -> ZenFsResult<bool>;
    /// Names of the entries in a directory.
    fn get_children(&self, path: &str) -> ZenFsResult<Vec<String>>;
    /// Creates a directory; fails if it exists.
    fn create_dir(&self, path: &str) -> ZenFsResult<()>;
    /// Creates a directory and its parents if missing.
    fn create_dir_if_missing(&self, path: &str) -> ZenFsResult<()>;
    /// Removes an empty directory.
    fn delete_dir(&self, path: &str) -> ZenFsResult<()>;
    /// Removes a file.
    fn delete_file(&self, path: &str) -> ZenFsResult<()>;
    /// Whether the path is a directory.
    fn is_directory(&self, path: &str) -> ZenFsResult<bool>;
    /// Renames a file or directory.
    fn rename_file(&self, from: &str, to: &str) -> ZenFsResult<()>;
    /// Creates a hard link.
    fn link_file(&self, from: &str, to: &str) -> ZenFsResult<()>;
    /// Size of a file in bytes.
    fn get_file_size(&self, path: &str) -> ZenFsResult<u64>;
    /// Modification time in seconds since the epoch.
    fn get_file_modification_time(&self, path: &str) -> ZenFsResult<u64>;
    /// Absolute form of a path.
    fn get_absolute_path(&self, path: &str) -> ZenFsResult<String>;
    /// Takes an exclusive lock; fails with [`ZenFsError::Busy`] if held.
    fn lock_file(&self, path: &str) -> ZenFsResult<AuxFileLock>;
    /// Releases a lock.
    fn unlock_file(&self, lock: AuxFileLock) -> ZenFsResult<()>;
    /// Opens a log file for appending.
    fn new_logger(&self, path: &str) -> ZenFsResult<Box<dyn Write + Send>>;
}

fn map_io(path: &str, err: io::Error) -> ZenFsError {
    match err.kind() {
        io::ErrorKind::NotFound => ZenFsError::not_found(path),
        io::ErrorKind::AlreadyExists => ZenFsError::AlreadyExists {
            path: path.to_string(),
        },
        _ => ZenFsError::Io(err),
    }
}

/// [`AuxFileSystem`] over the local filesystem.
#[derive(Debug, Default)]
pub struct LocalAuxFs {
    locks: Mutex<HashSet<String>>,
}

impl LocalAuxFs {
    /// Creates the local auxiliary filesystem.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuxFileSystem for LocalAuxFs {
    fn file_exists(&self, path: &str) -> ZenFsResult<bool> {
        Ok(Path::new(path).exists())
    }

    fn get_children(&self, path: &str) -> ZenFsResult<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| map_io(path, e))? {
            let entry = entry?;
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
        out.sort();
        Ok(out)
    }

    fn create_dir(&self, path: &str) -> ZenFsResult<()> {
        fs::create_dir(path).map_err(|e| map_io(path, e))
    }

    fn create_dir_if_missing(&self, path: &str) -> ZenFsResult<()> {
        fs::create_dir_all(path).map_err(|e| map_io(path, e))
    }

    fn delete_dir(&self, path: &str) -> ZenFsResult<()> {
        fs::remove_dir(path).map_err(|e| map_io(path, e))
    }

    fn delete_file(&self, path: &str) -> ZenFsResult<()> {
        fs::remove_file(path).map_err(|e| map_io(path, e))
    }

    fn is_directory(&self, path: &str) -> ZenFsResult<bool> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) => Err(map_io(path, e)),
        }
    }

    fn rename_file(&self, from: &str, to: &str) -> ZenFsResult<()> {
        fs::rename(from, to).map_err(|e| map_io(from, e))
    }

    fn link_file(&self, from: &str, to: &str) -> ZenFsResult<()> {
        fs::hard_link(from, to).map_err(|e| map_io(from, e))
    }

    fn get_file_size(&self, path: &str) -> ZenFsResult<u64> {
        Ok(fs::metadata(path).map_err(|e| map_io(path, e))?.len())
    }

    fn get_file_modification_time(&self, path: &str) -> ZenFsResult<u64> {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(|e| map_io(path, e))?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0))
    }

    fn get_absolute_path(&self, path: &str) -> ZenFsResult<String> {
        Ok(std::path::absolute(path)?.to_string_lossy().into_owned())
    }

    fn lock_file(&self, path: &str) -> ZenFsResult<AuxFileLock> {
        let mut locks = self.locks.lock();
        if locks.contains(path) {
            return Err(ZenFsError::Busy {
                path: path.to_string(),
            });
        }
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| map_io(path, e))?;
        locks.insert(path.to_string());
        debug!(path, "locked aux file");
        Ok(AuxFileLock {
            path: path.to_string(),
        })
    }

    fn unlock_file(&self, lock: AuxFileLock) -> ZenFsResult<()> {
        if !self.locks.lock().remove(&lock.path) {
            return Err(ZenFsError::InvalidArgument(format!(
                "{} is not locked",
                lock.path
            )));
        }
        Ok(())
    }

    fn new_logger(&self, path: &str) -> ZenFsResult<Box<dyn Write + Send>> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| map_io(path, e))?;
        Ok(Box::new(io::LineWriter::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempfile::TempDir, LocalAuxFs, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().into_owned();
        (dir, LocalAuxFs::new(), path)
    }

    #[test]
    fn test_directories() {
        let (_tmp, aux, root) = root();
        let sub = format!("{}/db", root);
        aux.create_dir(&sub).unwrap();
        assert!(matches!(
            aux.create_dir(&sub),
            Err(ZenFsError::AlreadyExists { .. })
        ));
        aux.create_dir_if_missing(&format!("{}/x/y", root)).unwrap();
        assert!(aux.is_directory(&sub).unwrap());
        assert_eq!(aux.get_children(&root).unwrap(), vec!["db", "x"]);

        aux.delete_dir(&sub).unwrap();
        assert!(!aux.file_exists(&sub).unwrap());
        assert!(aux.is_directory(&sub).unwrap_err().is_not_found());
    }

    #[test]
    fn test_locks_are_exclusive() {
        let (_tmp, aux, root) = root();
        let lock_path = format!("{}/LOCK", root);
        let lock = aux.lock_file(&lock_path).unwrap();
        assert!(matches!(
            aux.lock_file(&lock_path),
            Err(ZenFsError::Busy { .. })
        ));
        aux.unlock_file(lock).unwrap();
        let lock = aux.lock_file(&lock_path).unwrap();
        assert_eq!(lock.path(), lock_path);
    }

    #[test]
    fn test_logger_appends() {
        let (_tmp, aux, root) = root();
        let log_path = format!("{}/LOG", root);
        {
            let mut logger = aux.new_logger(&log_path).unwrap();
            writeln!(logger, "hello").unwrap();
        }
        assert_eq!(aux.get_file_size(&log_path).unwrap(), 6);
        assert!(aux.get_file_modification_time(&log_path).unwrap() > 0);
        aux.delete_file(&log_path).unwrap();
        assert!(aux.delete_file(&log_path).unwrap_err().is_not_found());
    }
}

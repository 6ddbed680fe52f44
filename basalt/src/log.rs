//! The reserved log file. Replay and record formats belong to an
//! external log manager; the kernel only guarantees the file exists and
//! is durable at commit.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use crate::StorageResult;

/// Commit-time flush hook over the `LOG` file.
pub struct LogManager {
    file: Mutex<File>,
}

impl LogManager {
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Forces the log file to stable storage.
    pub fn flush(&self) -> StorageResult<()> {
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_and_flush_succeeds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LOG");
        let log = LogManager::open(&path).unwrap();
        log.flush().unwrap();
        assert!(path.exists());
    }
}

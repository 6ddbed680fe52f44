//! Page-granular file I/O. One database owns many files (one heap file
//! per table, one file per index); the disk manager keys every open file
//! by a small integer `Fd` and reads and writes whole pages.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{Fd, Page, PageNo, StorageError, StorageResult, PAGE_SIZE};

struct OpenFile {
    file: File,
    path: PathBuf,
}

/// Owns the database's open files and performs page I/O on them.
pub struct DiskManager {
    files: HashMap<Fd, OpenFile>,
    next_fd: Fd,
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            next_fd: 0,
        }
    }

    /// Creates an empty file. Errors if the path already exists.
    pub fn create_file<P: AsRef<Path>>(&self, path: P) -> StorageResult<()> {
        let path = path.as_ref();
        if path.exists() {
            return Err(StorageError::FileExists(path.display().to_string()));
        }
        File::create(path)?;
        Ok(())
    }

    /// Removes a file from disk. The caller must have closed it first.
    pub fn destroy_file<P: AsRef<Path>>(&self, path: P) -> StorageResult<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> StorageResult<Fd> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = self.next_fd;
        self.next_fd += 1;
        crate::basalt_debug_log!("[DiskManager::open_file] {} -> fd {fd}", path.display());
        self.files.insert(
            fd,
            OpenFile {
                file,
                path: path.to_path_buf(),
            },
        );
        Ok(fd)
    }

    pub fn close_file(&mut self, fd: Fd) -> StorageResult<()> {
        let entry = self
            .files
            .remove(&fd)
            .ok_or_else(|| StorageError::Internal(format!("fd {fd} is not open")))?;
        entry.file.sync_all()?;
        Ok(())
    }

    pub fn file_path(&self, fd: Fd) -> Option<&Path> {
        self.files.get(&fd).map(|f| f.path.as_path())
    }

    /// Reads one page. A page past the end of the file comes back zeroed,
    /// as does the zero-length tail of a short read.
    pub fn read_page(&mut self, fd: Fd, page_no: PageNo) -> StorageResult<Page> {
        let entry = self
            .files
            .get_mut(&fd)
            .ok_or_else(|| StorageError::Internal(format!("fd {fd} is not open")))?;
        let mut page = Page::new();

        let offset = page_no as u64 * PAGE_SIZE as u64;
        let file_len = entry.file.metadata()?.len();
        if offset >= file_len {
            return Ok(page);
        }

        entry.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = entry.file.read(&mut page.data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(page)
    }

    pub fn write_page(&mut self, fd: Fd, page_no: PageNo, page: &Page) -> StorageResult<()> {
        let entry = self
            .files
            .get_mut(&fd)
            .ok_or_else(|| StorageError::Internal(format!("fd {fd} is not open")))?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        entry.file.seek(SeekFrom::Start(offset))?;
        entry.file.write_all(&page.data)?;
        entry.file.sync_all()?;
        Ok(())
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_round_trip_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t");
        let mut dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();

        let mut page = Page::new();
        page.data[0] = 42;
        page.data[PAGE_SIZE - 1] = 7;
        dm.write_page(fd, 3, &page).unwrap();
        dm.close_file(fd).unwrap();

        let fd = dm.open_file(&path).unwrap();
        let back = dm.read_page(fd, 3).unwrap();
        assert_eq!(back.data[0], 42);
        assert_eq!(back.data[PAGE_SIZE - 1], 7);
    }

    #[test]
    fn read_past_eof_is_zeroed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t");
        let mut dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();
        let page = dm.read_page(fd, 99).unwrap();
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn create_existing_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t");
        let dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        assert!(matches!(
            dm.create_file(&path),
            Err(StorageError::FileExists(_))
        ));
    }

    #[test]
    fn destroy_missing_file_fails() {
        let dir = tempdir().unwrap();
        let dm = DiskManager::new();
        assert!(matches!(
            dm.destroy_file(dir.path().join("absent")),
            Err(StorageError::FileNotFound(_))
        ));
    }
}

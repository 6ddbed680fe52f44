//! Manages the buffer pool, a collection of in-memory frames that cache
//! disk pages across every open file.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::disk::DiskManager;
use crate::{Fd, Page, PageNo, StorageError, StorageResult};

const BUFFER_POOL_SIZE: usize = 256;

/// Identifies one page across the database's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub fd: Fd,
    pub page_no: PageNo,
}

/// A single frame in the buffer pool.
#[derive(Debug)]
struct Frame {
    page: RwLock<Page>,
    is_dirty: Mutex<bool>,
    pin_count: Mutex<u32>,
    recently_used: Mutex<bool>,
}

/// The buffer pool manager.
pub struct BufferPoolManager {
    pub disk: Mutex<DiskManager>,
    frames: Vec<Arc<Frame>>,
    page_table: RwLock<HashMap<PageKey, usize>>,
    free_list: Mutex<Vec<usize>>,
    clock_hand: Mutex<usize>,
}

/// An RAII guard for a pinned page. Dropping the guard unpins; `write`
/// marks the frame dirty.
pub struct PageGuard<'a> {
    bpm: &'a BufferPoolManager,
    key: PageKey,
    frame: Arc<Frame>,
}

impl<'a> PageGuard<'a> {
    pub fn read(&self) -> std::sync::RwLockReadGuard<'_, Page> {
        self.frame.page.read().unwrap()
    }

    pub fn write(&self) -> std::sync::RwLockWriteGuard<'_, Page> {
        *self.frame.is_dirty.lock().unwrap() = true;
        self.frame.page.write().unwrap()
    }
}

impl<'a> Drop for PageGuard<'a> {
    fn drop(&mut self) {
        self.bpm.unpin_page(self.key);
    }
}

impl BufferPoolManager {
    pub fn new(disk: DiskManager) -> Self {
        let mut frames = Vec::with_capacity(BUFFER_POOL_SIZE);
        let mut free_list = Vec::with_capacity(BUFFER_POOL_SIZE);
        for i in 0..BUFFER_POOL_SIZE {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::new()),
                is_dirty: Mutex::new(false),
                pin_count: Mutex::new(0),
                recently_used: Mutex::new(false),
            }));
            free_list.push(i);
        }
        Self {
            disk: Mutex::new(disk),
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            clock_hand: Mutex::new(0),
        }
    }

    /// Pins the page, reading it from disk on a cache miss.
    pub fn fetch_page(&self, fd: Fd, page_no: PageNo) -> StorageResult<PageGuard<'_>> {
        let key = PageKey { fd, page_no };

        // 1. Already resident?
        if let Some(&frame_index) = self.page_table.read().unwrap().get(&key) {
            let frame = self.frames[frame_index].clone();
            self.pin_frame(&frame);
            return Ok(PageGuard {
                bpm: self,
                key,
                frame,
            });
        }

        // 2. Claim a frame, spilling its old contents if dirty.
        let frame_index = self.find_victim_frame().ok_or(StorageError::BufferPoolFull)?;
        let frame = self.frames[frame_index].clone();
        self.evict_if_dirty(frame_index)?;

        // 3. Read the page from disk and install it.
        let new_page = self.disk.lock().unwrap().read_page(fd, page_no)?;
        {
            let mut page = frame.page.write().unwrap();
            *page = new_page;
            *frame.is_dirty.lock().unwrap() = false;
            self.pin_frame(&frame);
        }
        self.page_table.write().unwrap().insert(key, frame_index);
        Ok(PageGuard {
            bpm: self,
            key,
            frame,
        })
    }

    /// Installs a fresh zeroed page for a page number the caller just
    /// allocated out of its file header. The page starts dirty.
    pub fn create_page(&self, fd: Fd, page_no: PageNo) -> StorageResult<PageGuard<'_>> {
        let key = PageKey { fd, page_no };
        let frame_index = self.find_victim_frame().ok_or(StorageError::BufferPoolFull)?;
        let frame = self.frames[frame_index].clone();
        self.evict_if_dirty(frame_index)?;

        {
            let mut page = frame.page.write().unwrap();
            *page = Page::new();
            *frame.is_dirty.lock().unwrap() = true;
            self.pin_frame(&frame);
        }
        self.page_table.write().unwrap().insert(key, frame_index);
        Ok(PageGuard {
            bpm: self,
            key,
            frame,
        })
    }

    fn pin_frame(&self, frame: &Arc<Frame>) {
        let mut pin_count = frame.pin_count.lock().unwrap();
        *pin_count += 1;
        *frame.recently_used.lock().unwrap() = true;
    }

    fn unpin_page(&self, key: PageKey) {
        if let Some(&frame_index) = self.page_table.read().unwrap().get(&key) {
            let frame = &self.frames[frame_index];
            let mut pin_count = frame.pin_count.lock().unwrap();
            if *pin_count > 0 {
                *pin_count -= 1;
            }
        }
    }

    fn evict_if_dirty(&self, frame_index: usize) -> StorageResult<()> {
        let frame = &self.frames[frame_index];
        let mut page_table = self.page_table.write().unwrap();
        if let Some((&old_key, _)) = page_table.iter().find(|&(_, &idx)| idx == frame_index) {
            let mut is_dirty = frame.is_dirty.lock().unwrap();
            if *is_dirty {
                let page_to_write = frame.page.read().unwrap().clone();
                drop(page_table); // Drop lock before I/O
                self.disk
                    .lock()
                    .unwrap()
                    .write_page(old_key.fd, old_key.page_no, &page_to_write)?;
                *is_dirty = false;
                self.page_table.write().unwrap().remove(&old_key);
            } else {
                page_table.remove(&old_key);
            }
        }
        Ok(())
    }

    pub fn flush_page(&self, fd: Fd, page_no: PageNo) -> StorageResult<()> {
        let key = PageKey { fd, page_no };
        if let Some(&frame_index) = self.page_table.read().unwrap().get(&key) {
            let frame = &self.frames[frame_index];
            let mut is_dirty = frame.is_dirty.lock().unwrap();
            if *is_dirty {
                let page = frame.page.read().unwrap();
                self.disk.lock().unwrap().write_page(fd, page_no, &page)?;
                *is_dirty = false;
            }
        }
        Ok(())
    }

    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let keys: Vec<PageKey> = self.page_table.read().unwrap().keys().copied().collect();
        for key in keys {
            self.flush_page(key.fd, key.page_no)?;
        }
        Ok(())
    }

    /// Drops a cached page without writing it back. Used when a tree page
    /// is released or a file is destroyed.
    pub fn discard_page(&self, fd: Fd, page_no: PageNo) {
        let key = PageKey { fd, page_no };
        if let Some(frame_index) = self.page_table.write().unwrap().remove(&key) {
            let frame = &self.frames[frame_index];
            *frame.is_dirty.lock().unwrap() = false;
            *frame.pin_count.lock().unwrap() = 0;
            *frame.recently_used.lock().unwrap() = false;
            self.free_list.lock().unwrap().push(frame_index);
        }
    }

    /// Drops every cached page of one file.
    pub fn discard_file(&self, fd: Fd) {
        let keys: Vec<PageKey> = self
            .page_table
            .read()
            .unwrap()
            .keys()
            .copied()
            .filter(|k| k.fd == fd)
            .collect();
        for key in keys {
            self.discard_page(key.fd, key.page_no);
        }
    }

    /// Flushes every cached page of one file.
    pub fn flush_file(&self, fd: Fd) -> StorageResult<()> {
        let keys: Vec<PageKey> = self
            .page_table
            .read()
            .unwrap()
            .keys()
            .copied()
            .filter(|k| k.fd == fd)
            .collect();
        for key in keys {
            self.flush_page(key.fd, key.page_no)?;
        }
        Ok(())
    }

    fn find_victim_frame(&self) -> Option<usize> {
        if let Some(frame_index) = self.free_list.lock().unwrap().pop() {
            return Some(frame_index);
        }

        let frame_count = self.frames.len();
        let mut clock_hand = self.clock_hand.lock().unwrap();
        // Two full passes: the first can clear second-chance bits, the
        // second can pick a victim.
        for _ in 0..(frame_count * 2) {
            let frame_index = *clock_hand;
            *clock_hand = (*clock_hand + 1) % frame_count;

            let frame = &self.frames[frame_index];
            let pin_count = frame.pin_count.lock().unwrap();

            if *pin_count == 0 {
                let mut recently_used = frame.recently_used.lock().unwrap();
                if *recently_used {
                    *recently_used = false;
                } else {
                    return Some(frame_index);
                }
            }
        }

        // All frames are pinned.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool_with_file() -> (tempfile::TempDir, Arc<BufferPoolManager>, Fd) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t");
        let mut dm = DiskManager::new();
        dm.create_file(&path).unwrap();
        let fd = dm.open_file(&path).unwrap();
        (dir, Arc::new(BufferPoolManager::new(dm)), fd)
    }

    #[test]
    fn dirty_page_survives_flush_and_refetch() {
        let (_dir, bpm, fd) = pool_with_file();
        {
            let guard = bpm.create_page(fd, 0).unwrap();
            guard.write().data[100] = 9;
        }
        bpm.flush_all_pages().unwrap();
        let guard = bpm.fetch_page(fd, 0).unwrap();
        assert_eq!(guard.read().data[100], 9);
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let (_dir, bpm, fd) = pool_with_file();
        {
            let guard = bpm.create_page(fd, 1).unwrap();
            guard.write().data[0] = 0xAB;
        }
        // Touch enough pages to cycle page 1 out of the pool.
        for page_no in 2..(BUFFER_POOL_SIZE as PageNo + 4) {
            let _ = bpm.fetch_page(fd, page_no).unwrap();
        }
        let guard = bpm.fetch_page(fd, 1).unwrap();
        assert_eq!(guard.read().data[0], 0xAB);
    }

    #[test]
    fn guard_drop_unpins() {
        let (_dir, bpm, fd) = pool_with_file();
        for _ in 0..3 {
            let _guard = bpm.fetch_page(fd, 0).unwrap();
        }
        // If pins leaked, the pool would exhaust long before this.
        for page_no in 0..(2 * BUFFER_POOL_SIZE as PageNo) {
            bpm.fetch_page(fd, page_no).unwrap();
        }
    }

    #[test]
    fn discard_page_forgets_unflushed_writes() {
        let (_dir, bpm, fd) = pool_with_file();
        {
            let guard = bpm.create_page(fd, 5).unwrap();
            guard.write().data[0] = 1;
        }
        bpm.discard_page(fd, 5);
        let guard = bpm.fetch_page(fd, 5).unwrap();
        assert_eq!(guard.read().data[0], 0);
    }
}

//! The slotted-page record heap. Each table is one heap file: page 0
//! carries the file header, data pages hold a bitmap of slot occupancy
//! followed by a fixed-width slot array. Pages with free slots form an
//! intrusive singly linked free list headed by the file header.

use std::mem::size_of;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer_pool::BufferPoolManager;
use crate::{Fd, Page, PageNo, Rid, StorageError, StorageResult, INVALID_PAGE_NO, PAGE_SIZE};

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct RecordFileHeader {
    record_size: i32,
    records_per_page: i32,
    /// Count of data pages; data pages are numbered `1..=num_pages`.
    num_pages: i32,
    first_free_page: i32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct HeapPageHeader {
    next_free_page: i32,
    num_records: i32,
}

const HEAP_PAGE_HDR_SIZE: usize = size_of::<HeapPageHeader>();

/// A materialized tuple copied out of its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub data: Vec<u8>,
}

#[derive(Debug, Copy, Clone)]
struct HeapLayout {
    record_size: usize,
    records_per_page: usize,
    bitmap_len: usize,
}

impl HeapLayout {
    fn of(hdr: &RecordFileHeader) -> Self {
        let records_per_page = hdr.records_per_page as usize;
        Self {
            record_size: hdr.record_size as usize,
            records_per_page,
            bitmap_len: records_per_page.div_ceil(8),
        }
    }

    fn slot_offset(&self, slot_no: usize) -> usize {
        HEAP_PAGE_HDR_SIZE + self.bitmap_len + slot_no * self.record_size
    }
}

fn bit_is_set(bitmap: &[u8], pos: usize) -> bool {
    bitmap[pos / 8] & (1 << (pos % 8)) != 0
}

fn bit_set(bitmap: &mut [u8], pos: usize) {
    bitmap[pos / 8] |= 1 << (pos % 8);
}

fn bit_clear(bitmap: &mut [u8], pos: usize) {
    bitmap[pos / 8] &= !(1 << (pos % 8));
}

fn first_clear_bit(bitmap: &[u8], len: usize) -> Option<usize> {
    (0..len).find(|&pos| !bit_is_set(bitmap, pos))
}

impl Page {
    fn heap_hdr(&self) -> HeapPageHeader {
        self.read_at(0)
    }

    fn set_heap_hdr(&mut self, hdr: &HeapPageHeader) {
        self.write_at(0, *hdr);
    }

    fn heap_bitmap(&self, layout: &HeapLayout) -> &[u8] {
        self.bytes(HEAP_PAGE_HDR_SIZE, layout.bitmap_len)
    }

    fn heap_bitmap_mut(&mut self, layout: &HeapLayout) -> &mut [u8] {
        self.bytes_mut(HEAP_PAGE_HDR_SIZE, layout.bitmap_len)
    }

    fn heap_slot(&self, layout: &HeapLayout, slot_no: usize) -> &[u8] {
        self.bytes(layout.slot_offset(slot_no), layout.record_size)
    }

    fn heap_slot_mut(&mut self, layout: &HeapLayout, slot_no: usize) -> &mut [u8] {
        self.bytes_mut(layout.slot_offset(slot_no), layout.record_size)
    }
}

/// The record heap over one table's file.
pub struct RecordFile {
    bpm: Arc<BufferPoolManager>,
    fd: Fd,
    hdr: Mutex<RecordFileHeader>,
}

/// Largest `records_per_page` so header, bitmap and slots fit one page.
fn max_records_per_page(record_size: usize) -> usize {
    let mut n = (PAGE_SIZE - HEAP_PAGE_HDR_SIZE) / record_size;
    while n > 0 && HEAP_PAGE_HDR_SIZE + n.div_ceil(8) + n * record_size > PAGE_SIZE {
        n -= 1;
    }
    n
}

impl RecordFile {
    /// Creates a heap file, deriving the densest slot layout.
    pub fn create<P: AsRef<Path>>(
        bpm: &Arc<BufferPoolManager>,
        path: P,
        record_size: usize,
    ) -> StorageResult<()> {
        let records_per_page = max_records_per_page(record_size);
        Self::create_with_layout(bpm, path, record_size, records_per_page)
    }

    /// Creates a heap file with an explicit `records_per_page`.
    pub fn create_with_layout<P: AsRef<Path>>(
        bpm: &Arc<BufferPoolManager>,
        path: P,
        record_size: usize,
        records_per_page: usize,
    ) -> StorageResult<()> {
        if record_size == 0
            || records_per_page == 0
            || HEAP_PAGE_HDR_SIZE + records_per_page.div_ceil(8) + records_per_page * record_size
                > PAGE_SIZE
        {
            return Err(StorageError::InvalidRecordSize(record_size));
        }

        let mut disk = bpm.disk.lock().unwrap();
        disk.create_file(&path)?;
        let fd = disk.open_file(&path)?;
        let mut page = Page::new();
        page.write_at(
            0,
            RecordFileHeader {
                record_size: record_size as i32,
                records_per_page: records_per_page as i32,
                num_pages: 0,
                first_free_page: INVALID_PAGE_NO,
            },
        );
        disk.write_page(fd, 0, &page)?;
        disk.close_file(fd)?;
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(bpm: Arc<BufferPoolManager>, path: P) -> StorageResult<Self> {
        let (fd, hdr) = {
            let mut disk = bpm.disk.lock().unwrap();
            let fd = disk.open_file(&path)?;
            let page = disk.read_page(fd, 0)?;
            (fd, page.read_at::<RecordFileHeader>(0))
        };
        if hdr.record_size <= 0 || hdr.records_per_page <= 0 {
            return Err(StorageError::Internal(format!(
                "{} is not a heap file",
                path.as_ref().display()
            )));
        }
        Ok(Self {
            bpm,
            fd,
            hdr: Mutex::new(hdr),
        })
    }

    /// Flushes the file header and every cached data page.
    pub fn flush(&self) -> StorageResult<()> {
        let hdr = self.hdr.lock().unwrap();
        let mut page = Page::new();
        page.write_at(0, *hdr);
        self.bpm.disk.lock().unwrap().write_page(self.fd, 0, &page)?;
        drop(hdr);
        self.bpm.flush_file(self.fd)
    }

    /// Flushes and closes the underlying file.
    pub fn close(self) -> StorageResult<()> {
        self.flush()?;
        self.bpm.discard_file(self.fd);
        self.bpm.disk.lock().unwrap().close_file(self.fd)
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn record_size(&self) -> usize {
        self.hdr.lock().unwrap().record_size as usize
    }

    pub fn records_per_page(&self) -> usize {
        self.hdr.lock().unwrap().records_per_page as usize
    }

    pub fn num_pages(&self) -> i32 {
        self.hdr.lock().unwrap().num_pages
    }

    pub fn first_free_page(&self) -> PageNo {
        self.hdr.lock().unwrap().first_free_page
    }

    fn check_rid(
        &self,
        hdr: &RecordFileHeader,
        rid: Rid,
        require_slot_range: bool,
    ) -> StorageResult<()> {
        if rid.page_no < 1 || rid.page_no > hdr.num_pages {
            return Err(StorageError::PageNotExist {
                fd: self.fd,
                page_no: rid.page_no,
            });
        }
        if require_slot_range && (rid.slot_no < 0 || rid.slot_no >= hdr.records_per_page) {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        Ok(())
    }

    /// Copies the record at `rid` out of its slot.
    pub fn get(&self, rid: Rid) -> StorageResult<Record> {
        let hdr = self.hdr.lock().unwrap();
        self.check_rid(&hdr, rid, true)?;
        let layout = HeapLayout::of(&hdr);

        let guard = self.bpm.fetch_page(self.fd, rid.page_no)?;
        let page = guard.read();
        if !bit_is_set(page.heap_bitmap(&layout), rid.slot_no as usize) {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        Ok(Record {
            data: page.heap_slot(&layout, rid.slot_no as usize).to_vec(),
        })
    }

    pub fn is_occupied(&self, rid: Rid) -> StorageResult<bool> {
        let hdr = self.hdr.lock().unwrap();
        self.check_rid(&hdr, rid, true)?;
        let layout = HeapLayout::of(&hdr);
        let guard = self.bpm.fetch_page(self.fd, rid.page_no)?;
        let page = guard.read();
        Ok(bit_is_set(page.heap_bitmap(&layout), rid.slot_no as usize))
    }

    /// Inserts into the first free slot, extending the file when the free
    /// list is empty.
    pub fn insert(&self, buf: &[u8]) -> StorageResult<Rid> {
        let mut hdr = self.hdr.lock().unwrap();
        if buf.len() != hdr.record_size as usize {
            return Err(StorageError::InvalidRecordSize(buf.len()));
        }
        let layout = HeapLayout::of(&hdr);

        let page_no = if hdr.first_free_page == INVALID_PAGE_NO {
            let page_no = hdr.num_pages + 1;
            hdr.num_pages = page_no;
            let guard = self.bpm.create_page(self.fd, page_no)?;
            guard.write().set_heap_hdr(&HeapPageHeader {
                next_free_page: INVALID_PAGE_NO,
                num_records: 0,
            });
            hdr.first_free_page = page_no;
            page_no
        } else {
            hdr.first_free_page
        };

        let guard = self.bpm.fetch_page(self.fd, page_no)?;
        let mut page = guard.write();
        let slot_no = first_clear_bit(page.heap_bitmap(&layout), layout.records_per_page)
            .ok_or_else(|| {
                StorageError::Internal(format!("free list points at full page {page_no}"))
            })?;

        bit_set(page.heap_bitmap_mut(&layout), slot_no);
        page.heap_slot_mut(&layout, slot_no).copy_from_slice(buf);
        let mut page_hdr = page.heap_hdr();
        page_hdr.num_records += 1;
        if page_hdr.num_records == hdr.records_per_page {
            hdr.first_free_page = page_hdr.next_free_page;
            page_hdr.next_free_page = INVALID_PAGE_NO;
        }
        page.set_heap_hdr(&page_hdr);

        Ok(Rid::new(page_no, slot_no as i32))
    }

    /// Re-inserts a record into the exact slot it previously occupied.
    /// Used by transaction rollback of a delete; the slot must be free.
    pub fn insert_at(&self, rid: Rid, buf: &[u8]) -> StorageResult<()> {
        let mut hdr = self.hdr.lock().unwrap();
        if buf.len() != hdr.record_size as usize {
            return Err(StorageError::InvalidRecordSize(buf.len()));
        }
        self.check_rid(&hdr, rid, true)?;
        let layout = HeapLayout::of(&hdr);

        let guard = self.bpm.fetch_page(self.fd, rid.page_no)?;
        if bit_is_set(guard.read().heap_bitmap(&layout), rid.slot_no as usize) {
            return Err(StorageError::Internal(format!(
                "slot ({}, {}) is already occupied",
                rid.page_no, rid.slot_no
            )));
        }

        let mut page = guard.write();
        bit_set(page.heap_bitmap_mut(&layout), rid.slot_no as usize);
        page.heap_slot_mut(&layout, rid.slot_no as usize)
            .copy_from_slice(buf);
        let mut page_hdr = page.heap_hdr();
        page_hdr.num_records += 1;
        let became_full = page_hdr.num_records == hdr.records_per_page;
        if became_full {
            let next = page_hdr.next_free_page;
            page_hdr.next_free_page = INVALID_PAGE_NO;
            page.set_heap_hdr(&page_hdr);
            drop(page);
            drop(guard);
            self.detach_from_free_list(&mut hdr, rid.page_no, next)?;
        } else {
            page.set_heap_hdr(&page_hdr);
        }
        Ok(())
    }

    /// Unlinks a now-full page from the free list, wherever it sits.
    fn detach_from_free_list(
        &self,
        hdr: &mut MutexGuard<'_, RecordFileHeader>,
        page_no: PageNo,
        next: PageNo,
    ) -> StorageResult<()> {
        if hdr.first_free_page == page_no {
            hdr.first_free_page = next;
            return Ok(());
        }
        let mut cursor = hdr.first_free_page;
        while cursor != INVALID_PAGE_NO {
            let guard = self.bpm.fetch_page(self.fd, cursor)?;
            let mut page = guard.read().heap_hdr();
            if page.next_free_page == page_no {
                page.next_free_page = next;
                guard.write().set_heap_hdr(&page);
                return Ok(());
            }
            cursor = page.next_free_page;
        }
        Err(StorageError::Internal(format!(
            "page {page_no} filled up but was not on the free list"
        )))
    }

    /// Clears the slot. A page transitioning from full to not-full is
    /// pushed onto the free list head.
    pub fn delete(&self, rid: Rid) -> StorageResult<()> {
        let mut hdr = self.hdr.lock().unwrap();
        self.check_rid(&hdr, rid, true)?;
        let layout = HeapLayout::of(&hdr);

        let guard = self.bpm.fetch_page(self.fd, rid.page_no)?;
        if !bit_is_set(guard.read().heap_bitmap(&layout), rid.slot_no as usize) {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }

        let mut page = guard.write();
        bit_clear(page.heap_bitmap_mut(&layout), rid.slot_no as usize);
        let mut page_hdr = page.heap_hdr();
        page_hdr.num_records -= 1;
        if page_hdr.num_records == hdr.records_per_page - 1 {
            page_hdr.next_free_page = hdr.first_free_page;
            hdr.first_free_page = rid.page_no;
        }
        page.set_heap_hdr(&page_hdr);
        Ok(())
    }

    /// In-place overwrite; slot occupancy unchanged.
    pub fn update(&self, rid: Rid, buf: &[u8]) -> StorageResult<()> {
        let hdr = self.hdr.lock().unwrap();
        if buf.len() != hdr.record_size as usize {
            return Err(StorageError::InvalidRecordSize(buf.len()));
        }
        self.check_rid(&hdr, rid, true)?;
        let layout = HeapLayout::of(&hdr);

        let guard = self.bpm.fetch_page(self.fd, rid.page_no)?;
        if !bit_is_set(guard.read().heap_bitmap(&layout), rid.slot_no as usize) {
            return Err(StorageError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            });
        }
        guard
            .write()
            .heap_slot_mut(&layout, rid.slot_no as usize)
            .copy_from_slice(buf);
        Ok(())
    }

    /// Sequential cursor over occupied slots. Absent slots are skipped by
    /// consulting the bitmap.
    pub fn scan(&self) -> RecordScan<'_> {
        RecordScan {
            file: self,
            page_no: 1,
            slot_no: 0,
        }
    }
}

/// Iterator over `(Rid, Record)` in file order.
pub struct RecordScan<'a> {
    file: &'a RecordFile,
    page_no: PageNo,
    slot_no: i32,
}

impl<'a> Iterator for RecordScan<'a> {
    type Item = StorageResult<(Rid, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        let hdr = *self.file.hdr.lock().unwrap();
        let layout = HeapLayout::of(&hdr);
        loop {
            if self.page_no > hdr.num_pages {
                return None;
            }
            let guard = match self.file.bpm.fetch_page(self.file.fd, self.page_no) {
                Ok(g) => g,
                Err(e) => return Some(Err(e)),
            };
            let page = guard.read();
            let bitmap = page.heap_bitmap(&layout);
            for slot_no in self.slot_no..hdr.records_per_page {
                if bit_is_set(bitmap, slot_no as usize) {
                    let rid = Rid::new(self.page_no, slot_no);
                    let record = Record {
                        data: page.heap_slot(&layout, slot_no as usize).to_vec(),
                    };
                    self.slot_no = slot_no + 1;
                    return Some(Ok((rid, record)));
                }
            }
            self.page_no += 1;
            self.slot_no = 0;
        }
    }
}

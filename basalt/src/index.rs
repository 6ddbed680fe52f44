//! B+-tree index over composite fixed-width keys. All data Rids live in
//! the leaves; internal nodes hold left-anchored separators (key `i` is
//! the smallest key under child `i`, and key 0 is a usable separator).
//! Leaves form a doubly linked list in key order. Mutating descents run
//! under a coarse tree-level latch.

use std::cmp::Ordering;
use std::mem::size_of;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::buffer_pool::BufferPoolManager;
use crate::{Fd, Page, PageNo, Rid, StorageError, StorageResult, INVALID_PAGE_NO, PAGE_SIZE};

/// Column types a key segment can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColType {
    Int,
    Float,
    Str,
}

impl ColType {
    fn code(self) -> i32 {
        match self {
            ColType::Int => 0,
            ColType::Float => 1,
            ColType::Str => 2,
        }
    }

    fn from_code(code: i32) -> StorageResult<Self> {
        match code {
            0 => Ok(ColType::Int),
            1 => Ok(ColType::Float),
            2 => Ok(ColType::Str),
            other => Err(StorageError::Internal(format!(
                "unknown column type code {other}"
            ))),
        }
    }
}

/// Compares one fixed-width column segment, decoding INT/FLOAT and
/// byte-comparing STRING over the column width.
pub fn compare_col(a: &[u8], b: &[u8], ty: ColType, len: usize) -> Ordering {
    match ty {
        ColType::Int => {
            let lhs = i32::from_le_bytes(a[..4].try_into().unwrap());
            let rhs = i32::from_le_bytes(b[..4].try_into().unwrap());
            lhs.cmp(&rhs)
        }
        ColType::Float => {
            let lhs = f32::from_le_bytes(a[..4].try_into().unwrap());
            let rhs = f32::from_le_bytes(b[..4].try_into().unwrap());
            lhs.total_cmp(&rhs)
        }
        ColType::Str => a[..len].cmp(&b[..len]),
    }
}

/// Compares composite keys component-by-component in declared order.
pub fn compare_keys(a: &[u8], b: &[u8], schema: &IndexSchema) -> Ordering {
    let mut offset = 0;
    for (&ty, &len) in schema.col_types.iter().zip(&schema.col_lens) {
        let ord = compare_col(&a[offset..], &b[offset..], ty, len);
        if ord != Ordering::Equal {
            return ord;
        }
        offset += len;
    }
    Ordering::Equal
}

const IX_MAX_KEY_COLS: usize = 4;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct IndexFileHeader {
    root_page: i32,
    first_leaf: i32,
    last_leaf: i32,
    /// Allocation high-water mark of data pages (released pages are not
    /// reused).
    num_pages: i32,
    num_cols: i32,
    col_types: [i32; IX_MAX_KEY_COLS],
    col_lens: [i32; IX_MAX_KEY_COLS],
    key_len: i32,
    order: i32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct IndexPageHeader {
    is_leaf: i32,
    num_keys: i32,
    parent: i32,
    prev_leaf: i32,
    next_leaf: i32,
}

const INDEX_PAGE_HDR_SIZE: usize = size_of::<IndexPageHeader>();
const RID_SIZE: usize = size_of::<Rid>();

/// Key geometry shared by every node of one index.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub col_types: Vec<ColType>,
    pub col_lens: Vec<usize>,
    pub key_len: usize,
    pub order: usize,
}

impl IndexSchema {
    fn key_off(&self, i: usize) -> usize {
        INDEX_PAGE_HDR_SIZE + i * self.key_len
    }

    fn rid_off(&self, i: usize) -> usize {
        INDEX_PAGE_HDR_SIZE + self.order * self.key_len + i * RID_SIZE
    }
}

impl Page {
    fn node_hdr(&self) -> IndexPageHeader {
        self.read_at(0)
    }

    fn set_node_hdr(&mut self, hdr: &IndexPageHeader) {
        self.write_at(0, *hdr);
    }

    fn init_index_node(&mut self, is_leaf: bool) {
        self.set_node_hdr(&IndexPageHeader {
            is_leaf: is_leaf as i32,
            num_keys: 0,
            parent: INVALID_PAGE_NO,
            prev_leaf: INVALID_PAGE_NO,
            next_leaf: INVALID_PAGE_NO,
        });
    }

    fn node_key(&self, s: &IndexSchema, i: usize) -> &[u8] {
        self.bytes(s.key_off(i), s.key_len)
    }

    fn set_node_key(&mut self, s: &IndexSchema, i: usize, key: &[u8]) {
        self.bytes_mut(s.key_off(i), s.key_len).copy_from_slice(key);
    }

    fn node_rid(&self, s: &IndexSchema, i: usize) -> Rid {
        self.read_at(s.rid_off(i))
    }

    /// First index whose key is `>=` the target, in `[0, num_keys]`.
    fn node_lower_bound(&self, s: &IndexSchema, target: &[u8]) -> usize {
        let mut low = 0;
        let mut high = self.node_hdr().num_keys as usize;
        while low < high {
            let mid = low + (high - low) / 2;
            if compare_keys(target, self.node_key(s, mid), s) == Ordering::Greater {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// First index whose key is `>` the target, in `[0, num_keys]`.
    fn node_upper_bound(&self, s: &IndexSchema, target: &[u8]) -> usize {
        let mut low = 0;
        let mut high = self.node_hdr().num_keys as usize;
        while low < high {
            let mid = low + (high - low) / 2;
            if compare_keys(target, self.node_key(s, mid), s) == Ordering::Less {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        low
    }

    fn node_insert_at(&mut self, s: &IndexSchema, pos: usize, key: &[u8], rid: Rid) {
        let mut hdr = self.node_hdr();
        let n = hdr.num_keys as usize;
        debug_assert!(pos <= n && n < s.order);

        let key_start = s.key_off(pos);
        self.data
            .copy_within(key_start..s.key_off(n), key_start + s.key_len);
        let rid_start = s.rid_off(pos);
        self.data
            .copy_within(rid_start..s.rid_off(n), rid_start + RID_SIZE);

        self.set_node_key(s, pos, key);
        self.write_at(s.rid_off(pos), rid);
        hdr.num_keys += 1;
        self.set_node_hdr(&hdr);
    }

    fn node_erase_at(&mut self, s: &IndexSchema, pos: usize) {
        let mut hdr = self.node_hdr();
        let n = hdr.num_keys as usize;
        debug_assert!(pos < n);

        self.data
            .copy_within(s.key_off(pos + 1)..s.key_off(n), s.key_off(pos));
        self.data
            .copy_within(s.rid_off(pos + 1)..s.rid_off(n), s.rid_off(pos));
        hdr.num_keys -= 1;
        self.set_node_hdr(&hdr);
    }

    fn leaf_lookup(&self, s: &IndexSchema, key: &[u8]) -> Option<Rid> {
        let pos = self.node_lower_bound(s, key);
        if pos < self.node_hdr().num_keys as usize
            && compare_keys(key, self.node_key(s, pos), s) == Ordering::Equal
        {
            Some(self.node_rid(s, pos))
        } else {
            None
        }
    }

    /// The child covering `key`: the largest `i` with `key[i] <= key`,
    /// with everything below `key[0]` routed to child 0.
    fn internal_lookup(&self, s: &IndexSchema, key: &[u8]) -> PageNo {
        let pos = self.node_upper_bound(s, key);
        let idx = pos.saturating_sub(1);
        self.node_rid(s, idx).page_no
    }

    /// The slot whose value points at `child_page`.
    fn find_child(&self, s: &IndexSchema, child_page: PageNo) -> Option<usize> {
        (0..self.node_hdr().num_keys as usize).find(|&i| self.node_rid(s, i).page_no == child_page)
    }
}

/// A cursor position inside an index leaf: `(leaf page, key slot)`.
/// `slot_no == num_keys` of the last leaf is the one-past-end sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iid {
    pub page_no: PageNo,
    pub slot_no: i32,
}

/// An open B+-tree index file.
pub struct IxIndex {
    bpm: Arc<BufferPoolManager>,
    fd: Fd,
    hdr: Mutex<IndexFileHeader>,
    schema: IndexSchema,
    tree_latch: Mutex<()>,
}

impl IxIndex {
    /// Creates an index file, deriving the widest order that fits a page.
    pub fn create<P: AsRef<Path>>(
        bpm: &Arc<BufferPoolManager>,
        path: P,
        cols: &[(ColType, usize)],
    ) -> StorageResult<()> {
        let key_len: usize = cols.iter().map(|&(_, len)| len).sum();
        let order = (PAGE_SIZE - INDEX_PAGE_HDR_SIZE) / (key_len + RID_SIZE);
        Self::create_with_order(bpm, path, cols, order)
    }

    /// Creates an index file with an explicit branching order.
    pub fn create_with_order<P: AsRef<Path>>(
        bpm: &Arc<BufferPoolManager>,
        path: P,
        cols: &[(ColType, usize)],
        order: usize,
    ) -> StorageResult<()> {
        if cols.is_empty() || cols.len() > IX_MAX_KEY_COLS {
            return Err(StorageError::Internal(format!(
                "index key must have 1..={IX_MAX_KEY_COLS} columns"
            )));
        }
        for &(ty, len) in cols {
            let ok = match ty {
                ColType::Int | ColType::Float => len == 4,
                ColType::Str => len > 0,
            };
            if !ok {
                return Err(StorageError::Internal(format!(
                    "bad width {len} for key column type {ty:?}"
                )));
            }
        }
        let key_len: usize = cols.iter().map(|&(_, len)| len).sum();
        // Below order 4 the occupancy floor drops to one key, which
        // lets an internal node hold a single child with no sibling to
        // borrow from or merge with.
        if order < 4 || INDEX_PAGE_HDR_SIZE + order * (key_len + RID_SIZE) > PAGE_SIZE {
            return Err(StorageError::Internal(format!(
                "order {order} does not fit a page for key width {key_len}"
            )));
        }

        let mut hdr = IndexFileHeader {
            root_page: INVALID_PAGE_NO,
            first_leaf: INVALID_PAGE_NO,
            last_leaf: INVALID_PAGE_NO,
            num_pages: 0,
            num_cols: cols.len() as i32,
            col_types: [0; IX_MAX_KEY_COLS],
            col_lens: [0; IX_MAX_KEY_COLS],
            key_len: key_len as i32,
            order: order as i32,
        };
        for (i, &(ty, len)) in cols.iter().enumerate() {
            hdr.col_types[i] = ty.code();
            hdr.col_lens[i] = len as i32;
        }

        let mut disk = bpm.disk.lock().unwrap();
        disk.create_file(&path)?;
        let fd = disk.open_file(&path)?;
        let mut page = Page::new();
        page.write_at(0, hdr);
        disk.write_page(fd, 0, &page)?;
        disk.close_file(fd)?;
        Ok(())
    }

    pub fn open<P: AsRef<Path>>(bpm: Arc<BufferPoolManager>, path: P) -> StorageResult<Self> {
        let (fd, hdr) = {
            let mut disk = bpm.disk.lock().unwrap();
            let fd = disk.open_file(&path)?;
            let page = disk.read_page(fd, 0)?;
            (fd, page.read_at::<IndexFileHeader>(0))
        };
        if hdr.order < 4 || hdr.num_cols < 1 || hdr.num_cols as usize > IX_MAX_KEY_COLS {
            return Err(StorageError::Internal(format!(
                "{} is not an index file",
                path.as_ref().display()
            )));
        }
        let mut col_types = Vec::with_capacity(hdr.num_cols as usize);
        let mut col_lens = Vec::with_capacity(hdr.num_cols as usize);
        for i in 0..hdr.num_cols as usize {
            col_types.push(ColType::from_code(hdr.col_types[i])?);
            col_lens.push(hdr.col_lens[i] as usize);
        }
        let schema = IndexSchema {
            col_types,
            col_lens,
            key_len: hdr.key_len as usize,
            order: hdr.order as usize,
        };
        Ok(Self {
            bpm,
            fd,
            hdr: Mutex::new(hdr),
            schema,
            tree_latch: Mutex::new(()),
        })
    }

    pub fn flush(&self) -> StorageResult<()> {
        let hdr = self.hdr.lock().unwrap();
        let mut page = Page::new();
        page.write_at(0, *hdr);
        self.bpm.disk.lock().unwrap().write_page(self.fd, 0, &page)?;
        drop(hdr);
        self.bpm.flush_file(self.fd)
    }

    pub fn close(self) -> StorageResult<()> {
        self.flush()?;
        self.bpm.discard_file(self.fd);
        self.bpm.disk.lock().unwrap().close_file(self.fd)
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    /// Occupancy floor for non-root nodes. `order / 2` keeps merges
    /// under the `order - 1` steady-state ceiling for every order; the
    /// rounded-up variant deadlocks odd orders (two minimal siblings
    /// could neither lend a key nor fit in one node).
    fn min_size(&self) -> usize {
        self.schema.order / 2
    }

    fn check_key(&self, key: &[u8]) -> StorageResult<()> {
        if key.len() != self.schema.key_len {
            return Err(StorageError::Internal(format!(
                "key width {} does not match index width {}",
                key.len(),
                self.schema.key_len
            )));
        }
        Ok(())
    }

    fn alloc_page(&self, hdr: &mut MutexGuard<'_, IndexFileHeader>) -> StorageResult<PageNo> {
        let page_no = hdr.num_pages + 1;
        hdr.num_pages = page_no;
        self.bpm.create_page(self.fd, page_no)?;
        Ok(page_no)
    }

    fn release_page(&self, page_no: PageNo) {
        self.bpm.discard_page(self.fd, page_no);
    }

    fn reparent(&self, child_page: PageNo, new_parent: PageNo) -> StorageResult<()> {
        let guard = self.bpm.fetch_page(self.fd, child_page)?;
        let mut page = guard.write();
        let mut hdr = page.node_hdr();
        hdr.parent = new_parent;
        page.set_node_hdr(&hdr);
        Ok(())
    }

    /// Descends from the root to the leaf covering `key`.
    fn find_leaf(&self, root_page: PageNo, key: &[u8]) -> StorageResult<PageNo> {
        let mut page_no = root_page;
        loop {
            let guard = self.bpm.fetch_page(self.fd, page_no)?;
            let page = guard.read();
            if page.node_hdr().is_leaf != 0 {
                return Ok(page_no);
            }
            page_no = page.internal_lookup(&self.schema, key);
        }
    }

    /// Point lookup; unique-key semantics.
    pub fn get_value(&self, key: &[u8]) -> StorageResult<Option<Rid>> {
        self.check_key(key)?;
        let _latch = self.tree_latch.lock().unwrap();
        let hdr = self.hdr.lock().unwrap();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(None);
        }
        let leaf_no = self.find_leaf(hdr.root_page, key)?;
        let guard = self.bpm.fetch_page(self.fd, leaf_no)?;
        let page = guard.read();
        Ok(page.leaf_lookup(&self.schema, key))
    }

    /// Inserts a key/Rid pair. Returns false when the key already exists.
    pub fn insert_entry(&self, key: &[u8], rid: Rid) -> StorageResult<bool> {
        self.check_key(key)?;
        let _latch = self.tree_latch.lock().unwrap();
        let mut hdr = self.hdr.lock().unwrap();

        if hdr.root_page == INVALID_PAGE_NO {
            let root_no = self.alloc_page(&mut hdr)?;
            let guard = self.bpm.fetch_page(self.fd, root_no)?;
            let mut page = guard.write();
            page.init_index_node(true);
            page.node_insert_at(&self.schema, 0, key, rid);
            drop(page);
            hdr.root_page = root_no;
            hdr.first_leaf = root_no;
            hdr.last_leaf = root_no;
            return Ok(true);
        }

        let leaf_no = self.find_leaf(hdr.root_page, key)?;
        let (new_size, at_front) = {
            let guard = self.bpm.fetch_page(self.fd, leaf_no)?;
            let mut page = guard.write();
            let size = page.node_hdr().num_keys as usize;
            let pos = page.node_lower_bound(&self.schema, key);
            if pos < size && compare_keys(key, page.node_key(&self.schema, pos), &self.schema)
                == Ordering::Equal
            {
                return Ok(false);
            }
            page.node_insert_at(&self.schema, pos, key, rid);
            (size + 1, pos == 0)
        };

        if at_front {
            self.maintain_parent(leaf_no)?;
        }
        if new_size == self.schema.order {
            self.split_and_propagate(&mut hdr, leaf_no)?;
        }
        Ok(true)
    }

    /// Splits `node_no` and pushes the new separator upward, splitting
    /// ancestors that fill up in turn.
    fn split_and_propagate(
        &self,
        hdr: &mut MutexGuard<'_, IndexFileHeader>,
        mut node_no: PageNo,
    ) -> StorageResult<()> {
        loop {
            let sib_no = self.alloc_page(hdr)?;

            let (is_leaf, parent_no, node_first_key, sib_first_key, old_next_leaf, moved_children) = {
                let node_guard = self.bpm.fetch_page(self.fd, node_no)?;
                let mut node = node_guard.write();
                let sib_guard = self.bpm.fetch_page(self.fd, sib_no)?;
                let mut sib = sib_guard.write();

                let node_hdr = node.node_hdr();
                let is_leaf = node_hdr.is_leaf != 0;
                let n = node_hdr.num_keys as usize;
                let mid = n / 2;

                sib.init_index_node(is_leaf);
                for i in mid..n {
                    let key = node.node_key(&self.schema, i).to_vec();
                    let rid = node.node_rid(&self.schema, i);
                    sib.node_insert_at(&self.schema, i - mid, &key, rid);
                }

                let mut sib_hdr = sib.node_hdr();
                sib_hdr.parent = node_hdr.parent;
                if is_leaf {
                    sib_hdr.prev_leaf = node_no;
                    sib_hdr.next_leaf = node_hdr.next_leaf;
                }
                sib.set_node_hdr(&sib_hdr);

                let mut new_node_hdr = node_hdr;
                new_node_hdr.num_keys = mid as i32;
                if is_leaf {
                    new_node_hdr.next_leaf = sib_no;
                }
                node.set_node_hdr(&new_node_hdr);

                let moved_children: Vec<PageNo> = if is_leaf {
                    Vec::new()
                } else {
                    (0..(n - mid))
                        .map(|i| sib.node_rid(&self.schema, i).page_no)
                        .collect()
                };

                (
                    is_leaf,
                    node_hdr.parent,
                    node.node_key(&self.schema, 0).to_vec(),
                    sib.node_key(&self.schema, 0).to_vec(),
                    node_hdr.next_leaf,
                    moved_children,
                )
            };

            if is_leaf {
                if old_next_leaf != INVALID_PAGE_NO {
                    let guard = self.bpm.fetch_page(self.fd, old_next_leaf)?;
                    let mut page = guard.write();
                    let mut next_hdr = page.node_hdr();
                    next_hdr.prev_leaf = sib_no;
                    page.set_node_hdr(&next_hdr);
                }
                if hdr.last_leaf == node_no {
                    hdr.last_leaf = sib_no;
                }
            } else {
                for child in moved_children {
                    self.reparent(child, sib_no)?;
                }
            }

            if parent_no == INVALID_PAGE_NO {
                let root_no = self.alloc_page(hdr)?;
                {
                    let guard = self.bpm.fetch_page(self.fd, root_no)?;
                    let mut root = guard.write();
                    root.init_index_node(false);
                    root.node_insert_at(&self.schema, 0, &node_first_key, Rid::new(node_no, 0));
                    root.node_insert_at(&self.schema, 1, &sib_first_key, Rid::new(sib_no, 0));
                }
                self.reparent(node_no, root_no)?;
                self.reparent(sib_no, root_no)?;
                hdr.root_page = root_no;
                return Ok(());
            }

            let parent_full = {
                let guard = self.bpm.fetch_page(self.fd, parent_no)?;
                let mut parent = guard.write();
                let pos = parent.node_upper_bound(&self.schema, &sib_first_key);
                parent.node_insert_at(&self.schema, pos, &sib_first_key, Rid::new(sib_no, 0));
                parent.node_hdr().num_keys as usize == self.schema.order
            };
            if !parent_full {
                return Ok(());
            }
            node_no = parent_no;
        }
    }

    /// Pushes a node's changed first key up the ancestor chain until a
    /// separator stops changing.
    fn maintain_parent(&self, mut node_no: PageNo) -> StorageResult<()> {
        loop {
            let (parent_no, first_key) = {
                let guard = self.bpm.fetch_page(self.fd, node_no)?;
                let page = guard.read();
                (
                    page.node_hdr().parent,
                    page.node_key(&self.schema, 0).to_vec(),
                )
            };
            if parent_no == INVALID_PAGE_NO {
                return Ok(());
            }
            let changed = {
                let guard = self.bpm.fetch_page(self.fd, parent_no)?;
                let mut parent = guard.write();
                let rank = parent.find_child(&self.schema, node_no).ok_or_else(|| {
                    StorageError::Internal(format!(
                        "node {node_no} missing from its parent {parent_no}"
                    ))
                })?;
                if parent.node_key(&self.schema, rank) == first_key.as_slice() {
                    false
                } else {
                    parent.set_node_key(&self.schema, rank, &first_key);
                    true
                }
            };
            if !changed {
                return Ok(());
            }
            node_no = parent_no;
        }
    }

    /// Removes a key. Returns false when the key is absent.
    pub fn delete_entry(&self, key: &[u8]) -> StorageResult<bool> {
        self.check_key(key)?;
        let _latch = self.tree_latch.lock().unwrap();
        let mut hdr = self.hdr.lock().unwrap();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(false);
        }

        let leaf_no = self.find_leaf(hdr.root_page, key)?;
        let new_size = {
            let guard = self.bpm.fetch_page(self.fd, leaf_no)?;
            let mut page = guard.write();
            let size = page.node_hdr().num_keys as usize;
            let pos = page.node_lower_bound(&self.schema, key);
            if pos >= size
                || compare_keys(key, page.node_key(&self.schema, pos), &self.schema)
                    != Ordering::Equal
            {
                return Ok(false);
            }
            page.node_erase_at(&self.schema, pos);
            size - 1
        };

        if leaf_no == hdr.root_page {
            self.adjust_root(&mut hdr, leaf_no)?;
        } else if new_size >= self.min_size() {
            self.maintain_parent(leaf_no)?;
        } else {
            self.coalesce_or_redistribute(&mut hdr, leaf_no)?;
        }
        Ok(true)
    }

    /// Restores occupancy after an underflow, walking upward while merges
    /// keep shrinking ancestors.
    fn coalesce_or_redistribute(
        &self,
        hdr: &mut MutexGuard<'_, IndexFileHeader>,
        mut node_no: PageNo,
    ) -> StorageResult<()> {
        loop {
            if node_no == hdr.root_page {
                return self.adjust_root(hdr, node_no);
            }

            let (size, parent_no) = {
                let guard = self.bpm.fetch_page(self.fd, node_no)?;
                let page = guard.read();
                let node_hdr = page.node_hdr();
                (node_hdr.num_keys as usize, node_hdr.parent)
            };
            if size >= self.min_size() {
                return self.maintain_parent(node_no);
            }

            // Prefer the left sibling; the left-most child takes its
            // right sibling.
            let (left_no, right_no, sep_index) = {
                let guard = self.bpm.fetch_page(self.fd, parent_no)?;
                let parent = guard.read();
                let idx = parent.find_child(&self.schema, node_no).ok_or_else(|| {
                    StorageError::Internal(format!(
                        "node {node_no} missing from its parent {parent_no}"
                    ))
                })?;
                if idx > 0 {
                    (parent.node_rid(&self.schema, idx - 1).page_no, node_no, idx)
                } else {
                    (node_no, parent.node_rid(&self.schema, 1).page_no, 1)
                }
            };

            let (left_size, right_size) = {
                let left_guard = self.bpm.fetch_page(self.fd, left_no)?;
                let right_guard = self.bpm.fetch_page(self.fd, right_no)?;
                let left_num_keys = left_guard.read().node_hdr().num_keys as usize;
                let right_num_keys = right_guard.read().node_hdr().num_keys as usize;
                (left_num_keys, right_num_keys)
            };

            if left_size + right_size >= 2 * self.min_size() {
                self.redistribute(left_no, right_no, node_no == right_no)?;
                return Ok(());
            }

            self.coalesce(hdr, left_no, right_no, parent_no, sep_index)?;
            node_no = parent_no;
        }
    }

    /// Moves one key/value across the boundary between two siblings, from
    /// the donor's inner edge to the underflowed node's outer edge.
    fn redistribute(
        &self,
        left_no: PageNo,
        right_no: PageNo,
        node_is_right: bool,
    ) -> StorageResult<()> {
        let (key, rid, donor_is_internal) = {
            let donor_no = if node_is_right { left_no } else { right_no };
            let guard = self.bpm.fetch_page(self.fd, donor_no)?;
            let mut donor = guard.write();
            let donor_hdr = donor.node_hdr();
            let pos = if node_is_right {
                donor_hdr.num_keys as usize - 1
            } else {
                0
            };
            let key = donor.node_key(&self.schema, pos).to_vec();
            let rid = donor.node_rid(&self.schema, pos);
            donor.node_erase_at(&self.schema, pos);
            (key, rid, donor_hdr.is_leaf == 0)
        };

        let receiver_no = if node_is_right { right_no } else { left_no };
        {
            let guard = self.bpm.fetch_page(self.fd, receiver_no)?;
            let mut receiver = guard.write();
            let pos = if node_is_right {
                0
            } else {
                receiver.node_hdr().num_keys as usize
            };
            receiver.node_insert_at(&self.schema, pos, &key, rid);
        }
        if donor_is_internal {
            self.reparent(rid.page_no, receiver_no)?;
        }

        // The right participant's first key changed either way; the
        // left's may have changed from the erase that triggered this.
        self.maintain_parent(left_no)?;
        self.maintain_parent(right_no)
    }

    /// Merges the right participant into the left and erases its
    /// separator from the parent.
    fn coalesce(
        &self,
        hdr: &mut MutexGuard<'_, IndexFileHeader>,
        left_no: PageNo,
        right_no: PageNo,
        parent_no: PageNo,
        sep_index: usize,
    ) -> StorageResult<()> {
        let (pairs, right_is_leaf, right_next) = {
            let guard = self.bpm.fetch_page(self.fd, right_no)?;
            let right = guard.read();
            let right_hdr = right.node_hdr();
            let pairs: Vec<(Vec<u8>, Rid)> = (0..right_hdr.num_keys as usize)
                .map(|i| {
                    (
                        right.node_key(&self.schema, i).to_vec(),
                        right.node_rid(&self.schema, i),
                    )
                })
                .collect();
            (pairs, right_hdr.is_leaf != 0, right_hdr.next_leaf)
        };

        {
            let guard = self.bpm.fetch_page(self.fd, left_no)?;
            let mut left = guard.write();
            let base = left.node_hdr().num_keys as usize;
            for (i, (key, rid)) in pairs.iter().enumerate() {
                left.node_insert_at(&self.schema, base + i, key, *rid);
            }
            if right_is_leaf {
                let mut left_hdr = left.node_hdr();
                left_hdr.next_leaf = right_next;
                left.set_node_hdr(&left_hdr);
            }
        }

        if right_is_leaf {
            if right_next != INVALID_PAGE_NO {
                let guard = self.bpm.fetch_page(self.fd, right_next)?;
                let mut page = guard.write();
                let mut next_hdr = page.node_hdr();
                next_hdr.prev_leaf = left_no;
                page.set_node_hdr(&next_hdr);
            }
            if hdr.last_leaf == right_no {
                hdr.last_leaf = left_no;
            }
        } else {
            for (_, rid) in &pairs {
                self.reparent(rid.page_no, left_no)?;
            }
        }

        {
            let guard = self.bpm.fetch_page(self.fd, parent_no)?;
            guard.write().node_erase_at(&self.schema, sep_index);
        }
        self.release_page(right_no);

        // The erase that triggered this merge may have changed the left
        // participant's first key.
        self.maintain_parent(left_no)
    }

    /// Shrinks the root after a deletion: an internal root left with one
    /// child promotes it; an emptied leaf root empties the tree.
    fn adjust_root(
        &self,
        hdr: &mut MutexGuard<'_, IndexFileHeader>,
        root_no: PageNo,
    ) -> StorageResult<()> {
        let root_hdr = {
            let guard = self.bpm.fetch_page(self.fd, root_no)?;
            let hdr = guard.read().node_hdr();
            hdr
        };
        if root_hdr.is_leaf == 0 && root_hdr.num_keys == 1 {
            let child = {
                let guard = self.bpm.fetch_page(self.fd, root_no)?;
                let page_no = guard.read().node_rid(&self.schema, 0).page_no;
                page_no
            };
            self.reparent(child, INVALID_PAGE_NO)?;
            hdr.root_page = child;
            self.release_page(root_no);
        } else if root_hdr.is_leaf != 0 && root_hdr.num_keys == 0 {
            hdr.root_page = INVALID_PAGE_NO;
            hdr.first_leaf = INVALID_PAGE_NO;
            hdr.last_leaf = INVALID_PAGE_NO;
            self.release_page(root_no);
        }
        Ok(())
    }

    /// Cursor at the first entry of the first leaf.
    pub fn leaf_begin(&self) -> Iid {
        let hdr = self.hdr.lock().unwrap();
        Iid {
            page_no: hdr.first_leaf,
            slot_no: 0,
        }
    }

    /// One-past-end cursor: the slot after the last entry of the last
    /// leaf.
    pub fn leaf_end(&self) -> StorageResult<Iid> {
        let hdr = self.hdr.lock().unwrap();
        if hdr.last_leaf == INVALID_PAGE_NO {
            return Ok(Iid {
                page_no: INVALID_PAGE_NO,
                slot_no: 0,
            });
        }
        let guard = self.bpm.fetch_page(self.fd, hdr.last_leaf)?;
        let size = guard.read().node_hdr().num_keys;
        Ok(Iid {
            page_no: hdr.last_leaf,
            slot_no: size,
        })
    }

    fn bound_cursor(&self, key: &[u8], upper: bool) -> StorageResult<Iid> {
        self.check_key(key)?;
        let _latch = self.tree_latch.lock().unwrap();
        let hdr = self.hdr.lock().unwrap();
        if hdr.root_page == INVALID_PAGE_NO {
            return Ok(Iid {
                page_no: INVALID_PAGE_NO,
                slot_no: 0,
            });
        }
        let leaf_no = self.find_leaf(hdr.root_page, key)?;
        let guard = self.bpm.fetch_page(self.fd, leaf_no)?;
        let page = guard.read();
        let pos = if upper {
            page.node_upper_bound(&self.schema, key)
        } else {
            page.node_lower_bound(&self.schema, key)
        };
        let node_hdr = page.node_hdr();
        if pos == node_hdr.num_keys as usize && node_hdr.next_leaf != INVALID_PAGE_NO {
            return Ok(Iid {
                page_no: node_hdr.next_leaf,
                slot_no: 0,
            });
        }
        Ok(Iid {
            page_no: leaf_no,
            slot_no: pos as i32,
        })
    }

    /// Cursor at the first entry `>=` key.
    pub fn lower_bound(&self, key: &[u8]) -> StorageResult<Iid> {
        self.bound_cursor(key, false)
    }

    /// Cursor at the first entry `>` key.
    pub fn upper_bound(&self, key: &[u8]) -> StorageResult<Iid> {
        self.bound_cursor(key, true)
    }

    /// The data Rid a cursor points at.
    pub fn get_rid(&self, iid: Iid) -> StorageResult<Rid> {
        if iid.page_no == INVALID_PAGE_NO {
            return Err(StorageError::IndexEntryNotFound);
        }
        let guard = self.bpm.fetch_page(self.fd, iid.page_no)?;
        let page = guard.read();
        if iid.slot_no < 0 || iid.slot_no >= page.node_hdr().num_keys {
            return Err(StorageError::IndexEntryNotFound);
        }
        Ok(page.node_rid(&self.schema, iid.slot_no as usize))
    }

    /// Walks `[begin, end)` in key order.
    pub fn scan_range(&self, begin: Iid, end: Iid) -> IxScan<'_> {
        IxScan {
            index: self,
            iid: begin,
            end,
        }
    }

    /// Walks the whole index in key order.
    pub fn scan_all(&self) -> StorageResult<IxScan<'_>> {
        Ok(self.scan_range(self.leaf_begin(), self.leaf_end()?))
    }
}

/// Iterator over the data Rids of an index range.
pub struct IxScan<'a> {
    index: &'a IxIndex,
    iid: Iid,
    end: Iid,
}

impl<'a> Iterator for IxScan<'a> {
    type Item = StorageResult<Rid>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.iid.page_no == INVALID_PAGE_NO || self.iid == self.end {
                return None;
            }
            let guard = match self.index.bpm.fetch_page(self.index.fd, self.iid.page_no) {
                Ok(g) => g,
                Err(e) => return Some(Err(e)),
            };
            let page = guard.read();
            let node_hdr = page.node_hdr();
            if self.iid.slot_no >= node_hdr.num_keys {
                self.iid = Iid {
                    page_no: node_hdr.next_leaf,
                    slot_no: 0,
                };
                continue;
            }
            let rid = page.node_rid(&self.index.schema, self.iid.slot_no as usize);
            self.iid.slot_no += 1;
            return Some(Ok(rid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManager;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn int_key(v: i32) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    fn int_index(order: usize) -> (tempfile::TempDir, IxIndex) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ix");
        let bpm = Arc::new(BufferPoolManager::new(DiskManager::new()));
        IxIndex::create_with_order(&bpm, &path, &[(ColType::Int, 4)], order).unwrap();
        let index = IxIndex::open(bpm, &path).unwrap();
        (dir, index)
    }

    /// Collects `(key bytes, rid)` by walking the leaf list.
    fn leaf_entries(index: &IxIndex) -> Vec<(Vec<u8>, Rid)> {
        let mut out = Vec::new();
        let hdr = *index.hdr.lock().unwrap();
        let mut page_no = hdr.first_leaf;
        while page_no != INVALID_PAGE_NO {
            let guard = index.bpm.fetch_page(index.fd, page_no).unwrap();
            let page = guard.read();
            let node_hdr = page.node_hdr();
            for i in 0..node_hdr.num_keys as usize {
                out.push((
                    page.node_key(&index.schema, i).to_vec(),
                    page.node_rid(&index.schema, i),
                ));
            }
            page_no = node_hdr.next_leaf;
        }
        out
    }

    /// Checks ordering, occupancy, separator and leaf-chain invariants
    /// over the whole tree.
    fn check_tree(index: &IxIndex) {
        let hdr = *index.hdr.lock().unwrap();
        if hdr.root_page == INVALID_PAGE_NO {
            assert_eq!(hdr.first_leaf, INVALID_PAGE_NO);
            assert_eq!(hdr.last_leaf, INVALID_PAGE_NO);
            return;
        }
        check_subtree(index, &hdr, hdr.root_page, INVALID_PAGE_NO);

        let entries = leaf_entries(index);
        for pair in entries.windows(2) {
            assert_ne!(
                compare_keys(&pair[0].0, &pair[1].0, &index.schema),
                Ordering::Greater,
                "leaf walk out of order"
            );
        }

        // The leaf chain is symmetric and ends at last_leaf.
        let mut page_no = hdr.first_leaf;
        let mut prev = INVALID_PAGE_NO;
        while page_no != INVALID_PAGE_NO {
            let guard = index.bpm.fetch_page(index.fd, page_no).unwrap();
            let node_hdr = guard.read().node_hdr();
            assert_eq!(node_hdr.prev_leaf, prev);
            if node_hdr.next_leaf == INVALID_PAGE_NO {
                assert_eq!(page_no, hdr.last_leaf);
            }
            prev = page_no;
            page_no = node_hdr.next_leaf;
        }
    }

    /// Returns the smallest key in the subtree while validating it.
    fn check_subtree(
        index: &IxIndex,
        hdr: &IndexFileHeader,
        page_no: PageNo,
        expected_parent: PageNo,
    ) -> Vec<u8> {
        let guard = index.bpm.fetch_page(index.fd, page_no).unwrap();
        let page = guard.read();
        let node_hdr = page.node_hdr();
        let n = node_hdr.num_keys as usize;
        assert_eq!(node_hdr.parent, expected_parent, "bad parent link");
        if page_no != hdr.root_page {
            assert!(
                n >= index.min_size() && n < index.schema.order,
                "occupancy violated: {n} keys"
            );
        }
        for i in 1..n {
            assert_ne!(
                compare_keys(
                    page.node_key(&index.schema, i - 1),
                    page.node_key(&index.schema, i),
                    &index.schema,
                ),
                Ordering::Greater,
                "node keys out of order"
            );
        }
        if node_hdr.is_leaf != 0 {
            return page.node_key(&index.schema, 0).to_vec();
        }
        let mut smallest = None;
        for i in 0..n {
            let child = page.node_rid(&index.schema, i).page_no;
            let child_min = check_subtree(index, hdr, child, page_no);
            assert_eq!(
                page.node_key(&index.schema, i),
                child_min.as_slice(),
                "separator is not the child subtree minimum"
            );
            smallest.get_or_insert(child_min);
        }
        smallest.unwrap()
    }

    #[test]
    fn point_round_trip() {
        let (_dir, index) = int_index(4);
        assert!(index.insert_entry(&int_key(7), Rid::new(1, 0)).unwrap());
        assert_eq!(
            index.get_value(&int_key(7)).unwrap(),
            Some(Rid::new(1, 0))
        );
        assert_eq!(index.get_value(&int_key(8)).unwrap(), None);

        assert!(index.delete_entry(&int_key(7)).unwrap());
        assert_eq!(index.get_value(&int_key(7)).unwrap(), None);
        assert!(!index.delete_entry(&int_key(7)).unwrap());
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let (_dir, index) = int_index(4);
        assert!(index.insert_entry(&int_key(1), Rid::new(1, 0)).unwrap());
        assert!(!index.insert_entry(&int_key(1), Rid::new(9, 9)).unwrap());
        assert_eq!(
            index.get_value(&int_key(1)).unwrap(),
            Some(Rid::new(1, 0))
        );
    }

    #[test]
    fn fourth_insert_splits_the_leaf() {
        let (_dir, index) = int_index(4);
        for (slot, v) in [10, 20, 30, 40].into_iter().enumerate() {
            index.insert_entry(&int_key(v), Rid::new(1, slot as i32)).unwrap();
        }

        let hdr = *index.hdr.lock().unwrap();
        let root_guard = index.bpm.fetch_page(index.fd, hdr.root_page).unwrap();
        let root = root_guard.read();
        let root_hdr = root.node_hdr();
        assert_eq!(root_hdr.is_leaf, 0);
        assert_eq!(root_hdr.num_keys, 2);
        assert_eq!(root.node_key(&index.schema, 0), int_key(10).as_slice());
        assert_eq!(root.node_key(&index.schema, 1), int_key(30).as_slice());

        let left = root.node_rid(&index.schema, 0).page_no;
        let right = root.node_rid(&index.schema, 1).page_no;
        drop(root);
        drop(root_guard);

        let left_guard = index.bpm.fetch_page(index.fd, left).unwrap();
        assert_eq!(left_guard.read().node_hdr().num_keys, 2);
        drop(left_guard);
        let right_guard = index.bpm.fetch_page(index.fd, right).unwrap();
        assert_eq!(right_guard.read().node_hdr().num_keys, 2);
        drop(right_guard);

        assert_eq!(hdr.first_leaf, left);
        assert_eq!(hdr.last_leaf, right);
        check_tree(&index);
    }

    #[test]
    fn deletions_coalesce_back_to_a_single_leaf() {
        let (_dir, index) = int_index(4);
        for (slot, v) in [10, 20, 30, 40].into_iter().enumerate() {
            index.insert_entry(&int_key(v), Rid::new(1, slot as i32)).unwrap();
        }
        index.insert_entry(&int_key(5), Rid::new(1, 4)).unwrap();

        for v in [5, 10, 20] {
            assert!(index.delete_entry(&int_key(v)).unwrap());
        }

        let hdr = *index.hdr.lock().unwrap();
        let root_guard = index.bpm.fetch_page(index.fd, hdr.root_page).unwrap();
        let root = root_guard.read();
        let root_hdr = root.node_hdr();
        assert_eq!(root_hdr.is_leaf, 1);
        assert_eq!(root_hdr.num_keys, 2);
        assert_eq!(root.node_key(&index.schema, 0), int_key(30).as_slice());
        assert_eq!(root.node_key(&index.schema, 1), int_key(40).as_slice());
        drop(root);
        drop(root_guard);
        check_tree(&index);
    }

    #[test]
    fn emptied_tree_accepts_new_inserts() {
        let (_dir, index) = int_index(4);
        for v in 0..3 {
            index.insert_entry(&int_key(v), Rid::new(1, v)).unwrap();
        }
        for v in 0..3 {
            assert!(index.delete_entry(&int_key(v)).unwrap());
        }
        assert_eq!(index.hdr.lock().unwrap().root_page, INVALID_PAGE_NO);
        assert_eq!(index.get_value(&int_key(0)).unwrap(), None);

        index.insert_entry(&int_key(42), Rid::new(2, 0)).unwrap();
        assert_eq!(
            index.get_value(&int_key(42)).unwrap(),
            Some(Rid::new(2, 0))
        );
        check_tree(&index);
    }

    #[test]
    fn range_cursors_cover_half_open_intervals() {
        let (_dir, index) = int_index(4);
        for v in [1, 3, 5, 7, 9, 11, 13] {
            index.insert_entry(&int_key(v), Rid::new(1, v)).unwrap();
        }

        let begin = index.lower_bound(&int_key(4)).unwrap();
        let end = index.upper_bound(&int_key(11)).unwrap();
        let slots: Vec<i32> = index
            .scan_range(begin, end)
            .map(|r| r.unwrap().slot_no)
            .collect();
        assert_eq!(slots, vec![5, 7, 9, 11]);

        let all: Vec<i32> = index
            .scan_all()
            .unwrap()
            .map(|r| r.unwrap().slot_no)
            .collect();
        assert_eq!(all, vec![1, 3, 5, 7, 9, 11, 13]);
    }

    #[test]
    fn cursor_past_node_size_is_entry_not_found() {
        let (_dir, index) = int_index(4);
        index.insert_entry(&int_key(1), Rid::new(1, 0)).unwrap();
        let end = index.leaf_end().unwrap();
        assert!(matches!(
            index.get_rid(end),
            Err(StorageError::IndexEntryNotFound)
        ));
    }

    #[test]
    fn composite_key_orders_by_declared_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ix");
        let bpm = Arc::new(BufferPoolManager::new(DiskManager::new()));
        IxIndex::create_with_order(
            &bpm,
            &path,
            &[(ColType::Str, 4), (ColType::Int, 4)],
            4,
        )
        .unwrap();
        let index = IxIndex::open(bpm, &path).unwrap();

        let key = |s: &[u8; 4], v: i32| {
            let mut k = s.to_vec();
            k.extend_from_slice(&v.to_le_bytes());
            k
        };
        index.insert_entry(&key(b"bb\0\0", 1), Rid::new(1, 0)).unwrap();
        index.insert_entry(&key(b"aa\0\0", 9), Rid::new(1, 1)).unwrap();
        index.insert_entry(&key(b"aa\0\0", 2), Rid::new(1, 2)).unwrap();

        let slots: Vec<i32> = index
            .scan_all()
            .unwrap()
            .map(|r| r.unwrap().slot_no)
            .collect();
        assert_eq!(slots, vec![2, 1, 0]);
    }

    #[test]
    fn negative_ints_and_floats_order_by_value() {
        let (_dir, index) = int_index(4);
        index.insert_entry(&int_key(-5), Rid::new(1, 0)).unwrap();
        index.insert_entry(&int_key(3), Rid::new(1, 1)).unwrap();
        index.insert_entry(&int_key(-40), Rid::new(1, 2)).unwrap();
        let slots: Vec<i32> = index
            .scan_all()
            .unwrap()
            .map(|r| r.unwrap().slot_no)
            .collect();
        assert_eq!(slots, vec![2, 0, 1]);

        assert_eq!(
            compare_col(
                &(-2.5f32).to_le_bytes(),
                &1.5f32.to_le_bytes(),
                ColType::Float,
                4
            ),
            Ordering::Less
        );
    }

    #[test]
    fn shuffled_soak_preserves_invariants() {
        let (_dir, index) = int_index(5);
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);

        let mut keys: Vec<i32> = (0..400).collect();
        keys.shuffle(&mut rng);
        for &v in &keys {
            assert!(index.insert_entry(&int_key(v), Rid::new(1, v)).unwrap());
        }
        check_tree(&index);
        assert_eq!(leaf_entries(&index).len(), 400);

        keys.shuffle(&mut rng);
        for &v in keys.iter().take(250) {
            assert!(index.delete_entry(&int_key(v)).unwrap(), "delete {v}");
            assert_eq!(index.get_value(&int_key(v)).unwrap(), None);
        }
        check_tree(&index);
        assert_eq!(leaf_entries(&index).len(), 150);

        for &v in keys.iter().skip(250) {
            assert_eq!(
                index.get_value(&int_key(v)).unwrap(),
                Some(Rid::new(1, v)),
                "lookup {v}"
            );
        }
    }

    #[test]
    fn header_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ix");
        let bpm = Arc::new(BufferPoolManager::new(DiskManager::new()));
        IxIndex::create_with_order(&bpm, &path, &[(ColType::Int, 4)], 4).unwrap();

        let index = IxIndex::open(bpm.clone(), &path).unwrap();
        for v in 0..10 {
            index.insert_entry(&int_key(v), Rid::new(1, v)).unwrap();
        }
        index.close().unwrap();

        let index = IxIndex::open(bpm, &path).unwrap();
        for v in 0..10 {
            assert_eq!(
                index.get_value(&int_key(v)).unwrap(),
                Some(Rid::new(1, v))
            );
        }
        check_tree(&index);
    }
}

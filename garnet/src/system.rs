//! The system manager: database directory lifecycle, table and index
//! lifecycle, the open file handles, and the rollback operations the
//! transaction manager drives during abort.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use basalt::buffer_pool::BufferPoolManager;
use basalt::disk::DiskManager;
use basalt::index::IxIndex;
use basalt::log::LogManager;
use basalt::record::{Record, RecordFile};
use basalt::transaction::UndoTarget;
use basalt::{Rid, StorageError, StorageResult};

use crate::catalog::{build_table_meta, ColDef, DbMeta, TabMeta, DB_META_NAME, LOG_FILE_NAME};
use crate::context::Context;
use crate::errors::{DbError, DbResult};
use crate::printer::RecordPrinter;

/// The file name of one composite index: table name, underscore-joined
/// column list, `.idx`.
pub fn index_file_name(table: &str, col_names: &[String]) -> String {
    format!("{table}.{}.idx", col_names.join("_"))
}

/// Owns the catalog, the buffer pool, and the open heap and index
/// handles of the currently open database.
pub struct SystemManager {
    base: PathBuf,
    bpm: Arc<BufferPoolManager>,
    db: Option<DbMeta>,
    db_path: PathBuf,
    fhs: HashMap<String, RecordFile>,
    ihs: HashMap<String, IxIndex>,
    log: Option<LogManager>,
}

impl SystemManager {
    /// `base` is the directory databases live under, one subdirectory
    /// per database.
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            bpm: Arc::new(BufferPoolManager::new(DiskManager::new())),
            db: None,
            db_path: PathBuf::new(),
            fhs: HashMap::new(),
            ihs: HashMap::new(),
            log: None,
        }
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.bpm
    }

    fn is_dir(&self, db_name: &str) -> bool {
        self.base.join(db_name).is_dir()
    }

    /// Creates the database directory with an empty catalog and the
    /// reserved log file.
    pub fn create_db(&self, db_name: &str) -> DbResult<()> {
        if self.is_dir(db_name) {
            return Err(DbError::DatabaseExists(db_name.to_string()));
        }
        let dir = self.base.join(db_name);
        std::fs::create_dir_all(&dir)?;
        DbMeta::new(db_name).save(dir.join(DB_META_NAME))?;
        self.bpm
            .disk
            .lock()
            .unwrap()
            .create_file(dir.join(LOG_FILE_NAME))?;
        Ok(())
    }

    /// Removes the database directory and everything in it.
    pub fn drop_db(&self, db_name: &str) -> DbResult<()> {
        if !self.is_dir(db_name) {
            return Err(DbError::DatabaseNotFound(db_name.to_string()));
        }
        if self.db.as_ref().is_some_and(|db| db.name == db_name) {
            return Err(DbError::Internal(format!(
                "database {db_name} is open; close it before dropping"
            )));
        }
        std::fs::remove_dir_all(self.base.join(db_name))?;
        Ok(())
    }

    /// Loads the catalog and opens every table and index of the
    /// database.
    pub fn open_db(&mut self, db_name: &str) -> DbResult<()> {
        if self.db.is_some() {
            return Err(DbError::Internal(
                "another database is already open".to_string(),
            ));
        }
        if !self.is_dir(db_name) {
            return Err(DbError::DatabaseNotFound(db_name.to_string()));
        }
        let dir = self.base.join(db_name);
        let meta_path = dir.join(DB_META_NAME);
        if !meta_path.exists() {
            return Err(DbError::Internal(format!(
                "{DB_META_NAME} missing under {}",
                dir.display()
            )));
        }
        let db = DbMeta::load(meta_path)?;

        for tab in db.tabs.values() {
            let fh = RecordFile::open(self.bpm.clone(), dir.join(&tab.name))?;
            self.fhs.insert(tab.name.clone(), fh);
            for index in &tab.indexes {
                let file_name = index_file_name(&tab.name, &index.col_names);
                let ih = IxIndex::open(self.bpm.clone(), dir.join(&file_name))?;
                self.ihs.insert(file_name, ih);
            }
        }

        self.log = Some(LogManager::open(dir.join(LOG_FILE_NAME))?);
        self.db = Some(db);
        self.db_path = dir;
        Ok(())
    }

    /// Flushes metadata, headers and pages, then drops every handle.
    pub fn close_db(&mut self) -> DbResult<()> {
        if self.db.is_none() {
            return Ok(());
        }
        self.flush_meta()?;
        for (_, fh) in self.fhs.drain() {
            fh.close()?;
        }
        for (_, ih) in self.ihs.drain() {
            ih.close()?;
        }
        self.bpm.flush_all_pages()?;
        self.db = None;
        self.log = None;
        self.db_path = PathBuf::new();
        Ok(())
    }

    pub fn flush_meta(&self) -> DbResult<()> {
        if let Some(db) = &self.db {
            db.save(self.db_path.join(DB_META_NAME))?;
        }
        Ok(())
    }

    pub fn db(&self) -> DbResult<&DbMeta> {
        self.db
            .as_ref()
            .ok_or_else(|| DbError::Internal("no database is open".to_string()))
    }

    fn db_mut(&mut self) -> DbResult<&mut DbMeta> {
        self.db
            .as_mut()
            .ok_or_else(|| DbError::Internal("no database is open".to_string()))
    }

    pub fn log(&self) -> DbResult<&LogManager> {
        self.log
            .as_ref()
            .ok_or_else(|| DbError::Internal("no database is open".to_string()))
    }

    pub fn table(&self, name: &str) -> DbResult<&TabMeta> {
        self.db()?.get_table(name)
    }

    pub fn record_file(&self, table: &str) -> DbResult<&RecordFile> {
        self.fhs
            .get(table)
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))
    }

    pub fn index_handle(&self, table: &str, col_names: &[String]) -> DbResult<&IxIndex> {
        let file_name = index_file_name(table, col_names);
        self.ihs.get(&file_name).ok_or_else(|| DbError::IndexNotFound {
            table: table.to_string(),
            cols: col_names.to_vec(),
        })
    }

    pub fn create_table(&mut self, name: &str, col_defs: &[ColDef]) -> DbResult<()> {
        if self.db()?.is_table(name) {
            return Err(DbError::TableExists(name.to_string()));
        }
        let tab = build_table_meta(name, col_defs)?;
        let path = self.db_path.join(name);
        RecordFile::create(&self.bpm, &path, tab.record_size())?;
        let fh = RecordFile::open(self.bpm.clone(), &path)?;

        self.fhs.insert(name.to_string(), fh);
        self.db_mut()?.tabs.insert(name.to_string(), tab);
        self.flush_meta()
    }

    pub fn drop_table(&mut self, name: &str) -> DbResult<()> {
        if !self.db()?.is_table(name) {
            return Err(DbError::TableNotFound(name.to_string()));
        }
        // Indexes go first; each owns its own file.
        let index_cols: Vec<Vec<String>> = self
            .table(name)?
            .indexes
            .iter()
            .map(|ix| ix.col_names.clone())
            .collect();
        for cols in index_cols {
            self.drop_index(name, &cols)?;
        }

        let fh = self
            .fhs
            .remove(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
        fh.close()?;
        self.bpm
            .disk
            .lock()
            .unwrap()
            .destroy_file(self.db_path.join(name))?;
        self.db_mut()?.tabs.remove(name);
        self.flush_meta()
    }

    /// Creates a composite index and bulk-loads every existing row.
    pub fn create_index(&mut self, table: &str, col_names: &[String]) -> DbResult<()> {
        let tab = self.table(table)?;
        if tab.get_index_meta(col_names).is_some() {
            return Err(DbError::IndexExists {
                table: table.to_string(),
                cols: col_names.to_vec(),
            });
        }
        let mut key_cols = Vec::with_capacity(col_names.len());
        let mut key_len = 0;
        for name in col_names {
            let col = tab.get_col(name)?;
            key_cols.push((col.ty, col.len));
            key_len += col.len;
        }

        let file_name = index_file_name(table, col_names);
        let path = self.db_path.join(&file_name);
        IxIndex::create(&self.bpm, &path, &key_cols)?;
        let ih = IxIndex::open(self.bpm.clone(), &path)?;

        let index_meta = crate::catalog::IndexMeta {
            tab_name: table.to_string(),
            col_names: col_names.to_vec(),
            key_len,
        };
        {
            let tab = self.table(table)?;
            let fh = self.record_file(table)?;
            for item in fh.scan() {
                let (rid, record) = item?;
                let key = tab.index_key(&index_meta, &record.data)?;
                if !ih.insert_entry(&key, rid)? {
                    return Err(DbError::DuplicateKey(file_name.clone()));
                }
            }
        }
        self.ihs.insert(file_name, ih);

        let tab = self.db_mut()?.get_table_mut(table)?;
        for col in tab.cols.iter_mut() {
            if col_names.contains(&col.name) {
                col.indexed = true;
            }
        }
        tab.indexes.push(index_meta);
        self.flush_meta()
    }

    pub fn drop_index(&mut self, table: &str, col_names: &[String]) -> DbResult<()> {
        if self.table(table)?.get_index_meta(col_names).is_none() {
            return Err(DbError::IndexNotFound {
                table: table.to_string(),
                cols: col_names.to_vec(),
            });
        }
        let file_name = index_file_name(table, col_names);
        if let Some(ih) = self.ihs.remove(&file_name) {
            ih.close()?;
        }
        self.bpm
            .disk
            .lock()
            .unwrap()
            .destroy_file(self.db_path.join(&file_name))?;

        let tab = self.db_mut()?.get_table_mut(table)?;
        tab.indexes.retain(|ix| ix.col_names != col_names);
        let still_indexed: Vec<String> = tab
            .indexes
            .iter()
            .flat_map(|ix| ix.col_names.iter().cloned())
            .collect();
        for col in tab.cols.iter_mut() {
            col.indexed = still_indexed.contains(&col.name);
        }
        self.flush_meta()
    }

    /// Renders the table list into the context (and `output.txt` when
    /// mirroring).
    pub fn show_tables(&self, ctx: &mut Context<'_>) -> DbResult<()> {
        let printer = RecordPrinter::new(1);
        printer.print_separator(ctx)?;
        printer.print_record(&["Tables".to_string()], ctx)?;
        printer.print_separator(ctx)?;
        let mut names: Vec<&String> = self.db()?.tabs.keys().collect();
        names.sort();
        for name in names {
            printer.print_record(&[name.clone()], ctx)?;
        }
        printer.print_separator(ctx)
    }

    /// Renders one table's columns, types and index flags.
    pub fn desc_table(&self, ctx: &mut Context<'_>, name: &str) -> DbResult<()> {
        let tab = self.table(name)?;
        let printer = RecordPrinter::new(3);
        printer.print_separator(ctx)?;
        printer.print_record(
            &["Field".to_string(), "Type".to_string(), "Index".to_string()],
            ctx,
        )?;
        printer.print_separator(ctx)?;
        for col in &tab.cols {
            let ty = match col.ty {
                basalt::index::ColType::Int => "INT".to_string(),
                basalt::index::ColType::Float => "FLOAT".to_string(),
                basalt::index::ColType::Str => format!("CHAR({})", col.len),
            };
            let indexed = if col.indexed { "YES" } else { "NO" };
            printer.print_record(&[col.name.clone(), ty, indexed.to_string()], ctx)?;
        }
        printer.print_separator(ctx)
    }

    fn undo_ctx(&self, table: &str) -> StorageResult<(&TabMeta, &RecordFile)> {
        let tab = self
            .table(table)
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let fh = self
            .record_file(table)
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok((tab, fh))
    }
}

impl UndoTarget for SystemManager {
    fn undo_insert(&self, table: &str, rid: Rid) -> StorageResult<()> {
        let (tab, fh) = self.undo_ctx(table)?;
        let record = fh.get(rid)?;
        for index in &tab.indexes {
            let key = tab
                .index_key(index, &record.data)
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            let ih = self
                .index_handle(table, &index.col_names)
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            ih.delete_entry(&key)?;
        }
        fh.delete(rid)
    }

    fn undo_delete(&self, table: &str, rid: Rid, before: &Record) -> StorageResult<()> {
        let (tab, fh) = self.undo_ctx(table)?;
        fh.insert_at(rid, &before.data)?;
        for index in &tab.indexes {
            let key = tab
                .index_key(index, &before.data)
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            let ih = self
                .index_handle(table, &index.col_names)
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            ih.insert_entry(&key, rid)?;
        }
        Ok(())
    }

    fn undo_update(&self, table: &str, rid: Rid, before: &Record) -> StorageResult<()> {
        let (tab, fh) = self.undo_ctx(table)?;
        let current = fh.get(rid)?;
        for index in &tab.indexes {
            let ih = self
                .index_handle(table, &index.col_names)
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            let old_key = tab
                .index_key(index, &current.data)
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            let new_key = tab
                .index_key(index, &before.data)
                .map_err(|e| StorageError::Internal(e.to_string()))?;
            if old_key != new_key {
                ih.delete_entry(&old_key)?;
                ih.insert_entry(&new_key, rid)?;
            }
        }
        fh.update(rid, &before.data)
    }
}

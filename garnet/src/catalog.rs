//! Catalog metadata: columns, tables, indexes, and the per-database
//! `DB_META` file they persist to.

use std::collections::HashMap;
use std::path::Path;

use basalt::index::ColType;
use serde::{Deserialize, Serialize};

use crate::errors::{DbError, DbResult};

/// The catalog file inside every database directory.
pub const DB_META_NAME: &str = "DB_META";
/// The reserved log file inside every database directory.
pub const LOG_FILE_NAME: &str = "LOG";

/// A column as declared in CREATE TABLE.
#[derive(Debug, Clone)]
pub struct ColDef {
    pub name: String,
    pub ty: ColType,
    pub len: usize,
}

/// A column with its resolved position inside the packed tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColMeta {
    pub tab_name: String,
    pub name: String,
    pub ty: ColType,
    pub len: usize,
    pub offset: usize,
    pub indexed: bool,
}

/// One composite index: the ordered column names and total key width.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub tab_name: String,
    pub col_names: Vec<String>,
    pub key_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabMeta {
    pub name: String,
    pub cols: Vec<ColMeta>,
    pub indexes: Vec<IndexMeta>,
}

impl TabMeta {
    pub fn get_col(&self, name: &str) -> DbResult<&ColMeta> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DbError::ColumnNotFound(name.to_string()))
    }

    /// Total packed width of one tuple.
    pub fn record_size(&self) -> usize {
        self.cols.iter().map(|c| c.len).sum()
    }

    pub fn get_index_meta(&self, col_names: &[String]) -> Option<&IndexMeta> {
        self.indexes.iter().find(|ix| ix.col_names == col_names)
    }

    /// The column metas of one index, in key order.
    pub fn index_cols(&self, index: &IndexMeta) -> DbResult<Vec<&ColMeta>> {
        index
            .col_names
            .iter()
            .map(|name| self.get_col(name))
            .collect()
    }

    /// Extracts an index's composite key out of a packed tuple.
    pub fn index_key(&self, index: &IndexMeta, data: &[u8]) -> DbResult<Vec<u8>> {
        let mut key = Vec::with_capacity(index.key_len);
        for col in self.index_cols(index)? {
            key.extend_from_slice(&data[col.offset..col.offset + col.len]);
        }
        Ok(key)
    }
}

/// The whole catalog of one database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbMeta {
    pub name: String,
    pub tabs: HashMap<String, TabMeta>,
}

impl DbMeta {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tabs: HashMap::new(),
        }
    }

    pub fn is_table(&self, name: &str) -> bool {
        self.tabs.contains_key(name)
    }

    pub fn get_table(&self, name: &str) -> DbResult<&TabMeta> {
        self.tabs
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn get_table_mut(&mut self, name: &str) -> DbResult<&mut TabMeta> {
        self.tabs
            .get_mut(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)
            .map_err(|e| DbError::Internal(format!("catalog is corrupt: {e}")))?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> DbResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DbError::Internal(format!("catalog serialization failed: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Builds table metadata out of column declarations, assigning offsets
/// in declaration order.
pub fn build_table_meta(name: &str, col_defs: &[ColDef]) -> DbResult<TabMeta> {
    let mut cols = Vec::with_capacity(col_defs.len());
    let mut offset = 0;
    for def in col_defs {
        let len = match def.ty {
            ColType::Int | ColType::Float => 4,
            ColType::Str => def.len,
        };
        if len == 0 {
            return Err(DbError::Internal(format!(
                "column {} declared with zero width",
                def.name
            )));
        }
        cols.push(ColMeta {
            tab_name: name.to_string(),
            name: def.name.clone(),
            ty: def.ty,
            len,
            offset,
            indexed: false,
        });
        offset += len;
    }
    Ok(TabMeta {
        name: name.to_string(),
        cols,
        indexes: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> TabMeta {
        build_table_meta(
            "t",
            &[
                ColDef {
                    name: "id".into(),
                    ty: ColType::Int,
                    len: 4,
                },
                ColDef {
                    name: "name".into(),
                    ty: ColType::Str,
                    len: 8,
                },
                ColDef {
                    name: "score".into(),
                    ty: ColType::Float,
                    len: 4,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn offsets_follow_declaration_order() {
        let tab = sample();
        assert_eq!(tab.get_col("id").unwrap().offset, 0);
        assert_eq!(tab.get_col("name").unwrap().offset, 4);
        assert_eq!(tab.get_col("score").unwrap().offset, 12);
        assert_eq!(tab.record_size(), 16);
        assert!(matches!(
            tab.get_col("absent"),
            Err(DbError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn index_key_concatenates_column_segments() {
        let mut tab = sample();
        tab.indexes.push(IndexMeta {
            tab_name: "t".into(),
            col_names: vec!["name".into(), "id".into()],
            key_len: 12,
        });
        let mut row = vec![0u8; 16];
        row[0..4].copy_from_slice(&7i32.to_le_bytes());
        row[4..8].copy_from_slice(b"ab\0\0");

        let key = tab.index_key(&tab.indexes[0], &row).unwrap();
        assert_eq!(&key[0..8], &row[4..12]);
        assert_eq!(&key[8..12], &7i32.to_le_bytes());
    }

    #[test]
    fn meta_round_trips_through_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DB_META_NAME);
        let mut meta = DbMeta::new("demo");
        meta.tabs.insert("t".into(), sample());
        meta.save(&path).unwrap();

        let back = DbMeta::load(&path).unwrap();
        assert_eq!(back.name, "demo");
        assert!(back.is_table("t"));
        assert_eq!(back.get_table("t").unwrap().record_size(), 16);
    }
}

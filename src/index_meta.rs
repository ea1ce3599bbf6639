use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable, TableDefinition};

use crate::error::{Error, Result};

const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// On-disk layout version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Keys of the settings table.
pub mod keys {
    pub const DIMENSION: &str = "dimension";
    pub const EMBEDDER: &str = "embedder";
    pub const CROSS_ENCODER: &str = "cross_encoder";
    pub const FORMAT_VERSION: &str = "format_version";
}

/// How often a locked settings file is retried before giving up.
const OPEN_ATTEMPTS: u32 = 100;
const OPEN_BACKOFF: Duration = Duration::from_millis(20);

/// Persistent per-index settings stored next to the lexical index.
///
/// The redb file lock is held only for the length of one transaction, so
/// any number of handles, in this process or others, can share an index.
#[derive(Debug)]
pub struct IndexMeta {
    path: PathBuf,
}

impl IndexMeta {
    pub fn open(path: &Path) -> Result<Self> {
        let meta = Self {
            path: path.to_path_buf(),
        };
        if meta.format_version()?.is_none() {
            meta.set(keys::FORMAT_VERSION, &FORMAT_VERSION.to_string())?;
        }
        Ok(meta)
    }

    /// Open the settings database, waiting while another handle holds it.
    fn database(&self) -> Result<Database> {
        let mut attempt = 1;
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if attempt < OPEN_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(OPEN_BACKOFF);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.database()?;
        let txn = db.begin_read()?;
        let table = match txn.open_table(SETTINGS) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = table.get(key)?.map(|v| v.value().to_string());
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let db = self.database()?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let db = self.database()?;
        let txn = db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }

    /// Vector dimension of the index, once established.
    pub fn dimension(&self) -> Result<Option<usize>> {
        self.get_parsed(keys::DIMENSION)
    }

    pub fn set_dimension(&self, dimension: usize) -> Result<()> {
        self.set(keys::DIMENSION, &dimension.to_string())
    }

    pub fn format_version(&self) -> Result<Option<u32>> {
        self.get_parsed(keys::FORMAT_VERSION)
    }

    pub fn embedder(&self) -> Result<Option<String>> {
        self.get(keys::EMBEDDER)
    }

    pub fn set_embedder(&self, name: &str) -> Result<()> {
        self.set(keys::EMBEDDER, name)
    }

    pub fn cross_encoder(&self) -> Result<Option<String>> {
        self.get(keys::CROSS_ENCODER)
    }

    pub fn set_cross_encoder(&self, name: &str) -> Result<()> {
        self.set(keys::CROSS_ENCODER, name)
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                Error::Config(format!("corrupt index setting {key}={raw}"))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta() -> (tempfile::TempDir, IndexMeta) {
        let tmp = tempfile::tempdir().unwrap();
        let meta = IndexMeta::open(&tmp.path().join("index_meta.redb")).unwrap();
        (tmp, meta)
    }

    #[test]
    fn new_meta_records_format_version() {
        let (_tmp, meta) = test_meta();
        assert_eq!(meta.format_version().unwrap(), Some(FORMAT_VERSION));
        assert_eq!(meta.dimension().unwrap(), None);
    }

    #[test]
    fn dimension_roundtrip() {
        let (_tmp, meta) = test_meta();
        meta.set_dimension(384).unwrap();
        assert_eq!(meta.dimension().unwrap(), Some(384));
    }

    #[test]
    fn model_names_roundtrip() {
        let (_tmp, meta) = test_meta();
        meta.set_embedder("hash:64").unwrap();
        meta.set_cross_encoder("overlap").unwrap();
        assert_eq!(meta.embedder().unwrap().as_deref(), Some("hash:64"));
        assert_eq!(meta.cross_encoder().unwrap().as_deref(), Some("overlap"));
    }

    #[test]
    fn corrupt_dimension_is_config_error() {
        let (_tmp, meta) = test_meta();
        meta.set(keys::DIMENSION, "lots").unwrap();
        assert!(matches!(meta.dimension(), Err(Error::Config(_))));
    }

    #[test]
    fn settings_persist_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index_meta.redb");
        {
            let meta = IndexMeta::open(&path).unwrap();
            meta.set_dimension(8).unwrap();
        }
        let meta = IndexMeta::open(&path).unwrap();
        assert_eq!(meta.dimension().unwrap(), Some(8));
        assert_eq!(meta.list().unwrap().len(), 2);
    }

    #[test]
    fn handles_share_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index_meta.redb");
        let first = IndexMeta::open(&path).unwrap();
        let second = IndexMeta::open(&path).unwrap();

        first.set_dimension(16).unwrap();
        assert_eq!(second.dimension().unwrap(), Some(16));
        second.set_embedder("hash:16").unwrap();
        assert_eq!(first.embedder().unwrap().as_deref(), Some("hash:16"));
    }
}

//! Transient storage for the records of one batch.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::error::HarvestError;
use crate::record::{AttachedParameters, Record};
use crate::response::attach_parameters;

pub const TRANSIENT_STORE_FILENAME: &str = "transient_storage.db";

/// Holds the records of one batch between search and hand-off.
pub trait MetadataStore: Send {
    fn set_records(&mut self, records: Vec<Record>) -> Result<(), HarvestError>;
    fn add_records(&mut self, records: Vec<Record>) -> Result<(), HarvestError>;
    fn count(&self) -> Result<usize, HarvestError>;
    fn records(&self) -> Result<Vec<Record>, HarvestError>;
    /// Visits the records in insertion order without collecting them.
    fn for_each_record(
        &self,
        visit: &mut dyn FnMut(&Record) -> Result<(), HarvestError>,
    ) -> Result<(), HarvestError>;
    /// Attaches `params` to every stored record, once.
    fn attach_parameters(&mut self, params: &AttachedParameters) -> Result<(), HarvestError>;
    /// Releases whatever backs the store.
    fn close(self: Box<Self>) -> Result<(), HarvestError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite,
}

impl StoreKind {
    pub fn from_lowmem(lowmem: bool) -> Self {
        if lowmem {
            StoreKind::Sqlite
        } else {
            StoreKind::Memory
        }
    }
}

pub fn transient_store_path(data_dir: &Utf8Path) -> Utf8PathBuf {
    data_dir.join(TRANSIENT_STORE_FILENAME)
}

/// Picks the backing once; callers only see the trait afterwards.
pub fn open_store(kind: StoreKind, data_dir: &Utf8Path) -> Result<Box<dyn MetadataStore>, HarvestError> {
    match kind {
        StoreKind::Memory => Ok(Box::new(MemoryStore::new())),
        StoreKind::Sqlite => Ok(Box::new(SqliteStore::open(&transient_store_path(data_dir))?)),
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<Record>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn set_records(&mut self, records: Vec<Record>) -> Result<(), HarvestError> {
        self.records = records;
        Ok(())
    }

    fn add_records(&mut self, records: Vec<Record>) -> Result<(), HarvestError> {
        self.records.extend(records);
        Ok(())
    }

    fn count(&self) -> Result<usize, HarvestError> {
        Ok(self.records.len())
    }

    fn records(&self) -> Result<Vec<Record>, HarvestError> {
        Ok(self.records.clone())
    }

    fn for_each_record(
        &self,
        visit: &mut dyn FnMut(&Record) -> Result<(), HarvestError>,
    ) -> Result<(), HarvestError> {
        self.records.iter().try_for_each(visit)
    }

    fn attach_parameters(&mut self, params: &AttachedParameters) -> Result<(), HarvestError> {
        attach_parameters(&mut self.records, params)
    }
}

/// Rows decoded at a time while attaching parameters.
pub const ATTACH_BATCH: i64 = 1000;

const CREATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS records (
    key INTEGER PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Disk-backed store: records are JSON values keyed by insertion index in a
/// single SQLite file.
pub struct SqliteStore {
    path: Utf8PathBuf,
    conn: Connection,
}

impl SqliteStore {
    /// Opens a fresh store at `path`, wiping whatever a previous run left.
    pub fn open(path: &Utf8Path) -> Result<Self, HarvestError> {
        cleanup(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path.as_std_path()).map_err(storage)?;
        conn.execute_batch(CREATE_TABLE).map_err(storage)?;
        debug!(path = %path, "opened transient store");
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn get(&self, key: i64) -> Result<Option<Record>, HarvestError> {
        let value: Option<String> = self
            .conn
            .query_row("SELECT value FROM records WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(storage)?;
        value.map(|text| decode(&text)).transpose()
    }

    pub fn set(&self, key: i64, record: &Record) -> Result<(), HarvestError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO records (key, value) VALUES (?1, ?2)",
                params![key, encode(record)?],
            )
            .map_err(storage)?;
        Ok(())
    }

    pub fn delete(&self, key: i64) -> Result<bool, HarvestError> {
        let changed = self
            .conn
            .execute("DELETE FROM records WHERE key = ?1", [key])
            .map_err(storage)?;
        Ok(changed > 0)
    }

    /// Closes the connection and removes the file.
    pub fn destroy(self) -> Result<(), HarvestError> {
        let Self { path, conn } = self;
        conn.close().map_err(|(_, err)| storage(err))?;
        cleanup(&path)
    }

    fn next_key(&self) -> Result<i64, HarvestError> {
        self.conn
            .query_row("SELECT COALESCE(MAX(key) + 1, 0) FROM records", [], |row| {
                row.get(0)
            })
            .map_err(storage)
    }
}

impl MetadataStore for SqliteStore {
    fn set_records(&mut self, records: Vec<Record>) -> Result<(), HarvestError> {
        self.conn
            .execute("DELETE FROM records", [])
            .map_err(storage)?;
        self.add_records(records)
    }

    fn add_records(&mut self, records: Vec<Record>) -> Result<(), HarvestError> {
        let first = self.next_key()?;
        let tx = self.conn.transaction().map_err(storage)?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO records (key, value) VALUES (?1, ?2)")
                .map_err(storage)?;
            for (offset, record) in records.iter().enumerate() {
                stmt.execute(params![first + offset as i64, encode(record)?])
                    .map_err(storage)?;
            }
        }
        tx.commit().map_err(storage)
    }

    fn count(&self) -> Result<usize, HarvestError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .map_err(storage)?;
        Ok(count as usize)
    }

    fn records(&self) -> Result<Vec<Record>, HarvestError> {
        let mut records = Vec::new();
        self.for_each_record(&mut |record| {
            records.push(record.clone());
            Ok(())
        })?;
        Ok(records)
    }

    fn for_each_record(
        &self,
        visit: &mut dyn FnMut(&Record) -> Result<(), HarvestError>,
    ) -> Result<(), HarvestError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM records ORDER BY key")
            .map_err(storage)?;
        let mut rows = stmt.query([]).map_err(storage)?;
        while let Some(row) = rows.next().map_err(storage)? {
            let text: String = row.get(0).map_err(storage)?;
            visit(&decode(&text)?)?;
        }
        Ok(())
    }

    // One transaction, walked in key batches; an already attached record
    // rolls the whole pass back.
    fn attach_parameters(&mut self, params: &AttachedParameters) -> Result<(), HarvestError> {
        let tx = self.conn.transaction().map_err(storage)?;
        {
            let mut select = tx
                .prepare("SELECT key, value FROM records WHERE key > ?1 ORDER BY key LIMIT ?2")
                .map_err(storage)?;
            let mut update = tx
                .prepare("UPDATE records SET value = ?2 WHERE key = ?1")
                .map_err(storage)?;
            let mut after = -1i64;
            loop {
                let batch = select
                    .query_map(params![after, ATTACH_BATCH], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(storage)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(storage)?;
                let Some(&(last, _)) = batch.last() else {
                    break;
                };
                for (key, text) in batch {
                    let mut record = decode(&text)?;
                    record.attach(params)?;
                    update
                        .execute(params![key, encode(&record)?])
                        .map_err(storage)?;
                }
                after = last;
            }
        }
        tx.commit().map_err(storage)
    }

    fn close(self: Box<Self>) -> Result<(), HarvestError> {
        (*self).destroy()
    }
}

fn cleanup(path: &Utf8Path) -> Result<(), HarvestError> {
    if path.as_std_path().is_file() {
        fs::remove_file(path.as_std_path()).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

fn encode(record: &Record) -> Result<String, HarvestError> {
    serde_json::to_string(record).map_err(|err| HarvestError::Storage(err.to_string()))
}

fn decode(text: &str) -> Result<Record, HarvestError> {
    serde_json::from_str(text).map_err(|err| HarvestError::Storage(err.to_string()))
}

fn storage(err: rusqlite::Error) -> HarvestError {
    HarvestError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_lowmem_flag() {
        assert_eq!(StoreKind::from_lowmem(false), StoreKind::Memory);
        assert_eq!(StoreKind::from_lowmem(true), StoreKind::Sqlite);
    }

    #[test]
    fn sqlite_key_value_access() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("kv.db")).unwrap();
        let store = SqliteStore::open(&path).unwrap();

        store.set(7, &Record::new("a")).unwrap();
        assert_eq!(store.get(7).unwrap().unwrap().id, "a");
        assert!(store.get(8).unwrap().is_none());
        assert!(store.delete(7).unwrap());
        assert!(!store.delete(7).unwrap());

        store.destroy().unwrap();
        assert!(!path.as_std_path().exists());
    }

    #[test]
    fn reopening_wipes_previous_contents() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("kv.db")).unwrap();
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.add_records(vec![Record::new("stale")]).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }
}

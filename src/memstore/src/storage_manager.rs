use common::{DbError, Record};

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Position of a row within its table. Slots are never reused.
pub type SlotId = u64;

/// A stored row and the number of times it has been modified.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoredRow {
    pub record: Record,
    pub version: u64,
}

/// The rows of one table.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct TableData {
    rows: BTreeMap<SlotId, StoredRow>,
    next_slot: SlotId,
}

type TableMap = Arc<RwLock<TableData>>;

/// Counters for observing how the engine drives the store.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub cursors_opened: AtomicUsize,
    pub cursors_closed: AtomicUsize,
    pub blocks_served: AtomicUsize,
    /// Rows for which fase-2 columns were fetched.
    pub fase2_rows: AtomicUsize,
    pub locks: AtomicUsize,
    /// Total number of `in` list values seen by opened cursors.
    pub in_values: AtomicUsize,
}

impl StoreStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub(crate) fn bump(counter: &AtomicUsize, by: usize) {
        counter.fetch_add(by, Ordering::SeqCst);
    }
}

/// The MemStore StorageManager. A map of named tables, shared between every
/// driver opened on it, and where to persist on shutdown/startup.
#[derive(Clone)]
pub struct StorageManager {
    tables: Arc<RwLock<HashMap<String, TableMap>>>,
    persist_path: PathBuf,
    stats: Arc<StoreStats>,
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        if Arc::strong_count(&self.tables) == 1 {
            info!("Dropping Storage Manager");
        }
    }
}

fn poisoned() -> DbError {
    DbError::InternalError(String::from("memstore lock poisoned"))
}

impl StorageManager {
    /// Create a new SM from scratch or load tables from files.
    ///
    /// # Arguments
    ///
    /// * `storage_path` - Directory holding persisted tables; empty for none.
    pub fn new(storage_path: &str) -> Result<Self, DbError> {
        if !storage_path.is_empty() && Path::exists(Path::new(storage_path)) {
            info!(
                "Initializing memstore::storage_manager from path: {:?}",
                storage_path
            );
            StorageManager::load(storage_path)
        } else {
            info!(
                "Creating new memstore::storage_manager with path: {:?}",
                storage_path
            );
            Ok(StorageManager {
                tables: Arc::new(RwLock::new(HashMap::new())),
                persist_path: PathBuf::from(storage_path),
                stats: Arc::new(StoreStats::default()),
            })
        }
    }

    /// Create a new SM that will not be persisted
    pub fn new_test_sm() -> Self {
        StorageManager {
            tables: Arc::new(RwLock::new(HashMap::new())),
            persist_path: PathBuf::new(),
            stats: Arc::new(StoreStats::default()),
        }
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    fn table(&self, name: &str) -> Result<TableMap, DbError> {
        self.tables
            .read()
            .map_err(|_| poisoned())?
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::DatabaseException(format!("table {} does not exist", name)))
    }

    /// Add a new table. Creating an existing table is a no-op.
    pub fn create_table(&self, name: &str) -> Result<(), DbError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if tables.contains_key(name) {
            debug!("memstore::create_table {} already exists", name);
            return Ok(());
        }
        debug!("memstore::create_table {}", name);
        tables.insert(name.to_string(), Arc::new(RwLock::new(TableData::default())));
        Ok(())
    }

    /// Remove the table and all stored rows in it.
    pub fn remove_table(&self, name: &str) -> Result<(), DbError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if tables.remove(name).is_none() {
            debug!("memstore::remove_table {} does not exist", name);
        }
        Ok(())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables
            .read()
            .map(|t| t.contains_key(name))
            .unwrap_or(false)
    }

    /// Names of all tables, sorted.
    pub fn table_names(&self) -> Result<Vec<String>, DbError> {
        let mut names: Vec<String> = self
            .tables
            .read()
            .map_err(|_| poisoned())?
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    /// Insert a row into a table and return its slot.
    pub fn insert(&self, name: &str, record: Record) -> Result<SlotId, DbError> {
        let table = self.table(name)?;
        let mut data = table.write().map_err(|_| poisoned())?;
        let slot = data.next_slot;
        data.next_slot += 1;
        trace!("memstore insert {}[{}]: {}", name, slot, record);
        data.rows.insert(slot, StoredRow { record, version: 0 });
        Ok(slot)
    }

    /// Get a row and its version, if it still exists.
    pub fn get(&self, name: &str, slot: SlotId) -> Result<Option<StoredRow>, DbError> {
        let table = self.table(name)?;
        let data = table.read().map_err(|_| poisoned())?;
        Ok(data.rows.get(&slot).cloned())
    }

    /// Overwrite cells of a row, bumping its version.
    ///
    /// # Arguments
    ///
    /// * `name` - Table of the row.
    /// * `slot` - Slot of the row.
    /// * `fields` - Cells to write.
    /// * `cleared` - Columns to reset to NULL.
    pub fn update(
        &self,
        name: &str,
        slot: SlotId,
        fields: &Record,
        cleared: &[common::ColumnId],
    ) -> Result<(), DbError> {
        let table = self.table(name)?;
        let mut data = table.write().map_err(|_| poisoned())?;
        match data.rows.get_mut(&slot) {
            Some(row) => {
                row.record.merge_from(fields);
                for id in cleared {
                    row.record.remove(*id);
                }
                row.version += 1;
                Ok(())
            }
            None => Err(DbError::DatabaseException(format!(
                "row {} of table {} does not exist",
                slot, name
            ))),
        }
    }

    /// Remove a row. Returns whether it existed.
    pub fn delete(&self, name: &str, slot: SlotId) -> Result<bool, DbError> {
        let table = self.table(name)?;
        let mut data = table.write().map_err(|_| poisoned())?;
        Ok(data.rows.remove(&slot).is_some())
    }

    /// Snapshot of a table's rows in slot order.
    pub fn scan(&self, name: &str) -> Result<Vec<(SlotId, StoredRow)>, DbError> {
        let table = self.table(name)?;
        let data = table.read().map_err(|_| poisoned())?;
        Ok(data.rows.iter().map(|(s, r)| (*s, r.clone())).collect())
    }

    /// Rows of a table, without slots.
    pub fn records(&self, name: &str) -> Result<Vec<Record>, DbError> {
        Ok(self.scan(name)?.into_iter().map(|(_, r)| r.record).collect())
    }

    pub fn row_count(&self, name: &str) -> Result<usize, DbError> {
        let table = self.table(name)?;
        let data = table.read().map_err(|_| poisoned())?;
        Ok(data.rows.len())
    }

    /// Persist every table under the persist path, one `.ms` file per table.
    pub fn shutdown(&self) -> Result<(), DbError> {
        info!("Shutting down and persisting tables");
        if self.persist_path.as_os_str().is_empty() {
            info!("Test SM or no path, not persisting");
            return Ok(());
        }
        fs::create_dir_all(&self.persist_path)?;
        let tables = self.tables.read().map_err(|_| poisoned())?;
        for (name, data_lock) in tables.iter() {
            let data = data_lock.read().map_err(|_| poisoned())?;
            let mut file_path = self.persist_path.clone();
            file_path.push(name);
            file_path.set_extension("ms");
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(file_path)?;
            serde_cbor::to_writer(file, &*data)?;
        }
        Ok(())
    }

    /// Create a Memstore SM from a file path and populate from the files
    fn load(path: &str) -> Result<Self, DbError> {
        let mut table_map = HashMap::new();
        // Find the files that end with .ms
        let entries: Vec<fs::DirEntry> = fs::read_dir(path)?
            .filter_map(Result::ok)
            .filter(|x| x.path().extension().map(|e| e == "ms").unwrap_or(false))
            .collect();
        for entry in entries {
            let file = OpenOptions::new().read(true).open(entry.path())?;
            let data: TableData = serde_cbor::from_reader(file)?;
            // The file name is the table name
            let name = entry
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .ok_or_else(|| {
                    DbError::IOError(format!("bad table file {:?}", entry.path()))
                })?;
            debug!("memstore::load table {} with {} rows", name, data.rows.len());
            table_map.insert(name, Arc::new(RwLock::new(data)));
        }
        Ok(StorageManager {
            tables: Arc::new(RwLock::new(table_map)),
            persist_path: PathBuf::from(path),
            stats: Arc::new(StoreStats::default()),
        })
    }
}

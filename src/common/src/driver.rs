use crate::ids::CursorId;
use crate::query::{CursorType, DatabaseQuery};
use crate::{ColumnId, DbError, Record};
use std::sync::{Arc, Mutex, MutexGuard};

/// Static capabilities of a storage driver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DriverDescription {
    /// Rows may be fetched a block at a time and fase-2 retrieval batched per block.
    pub supports_block_cursors: bool,
    /// Single-table fast path.
    pub supports_single: bool,
    pub supports_data_modify: bool,
    /// Missing cells come back for NULL-translated columns.
    pub supports_nulls: bool,
    pub supports_limit: bool,
    /// Rows of mutating cursors must be locked and rechecked before use.
    pub needs_locking_and_recheck: bool,
    pub needs_uppercase_names: bool,
    /// Inserts must carry every scalar column.
    pub add_missing_default_columns: bool,
    /// Maximum number of tables in one cursor; 0 for unlimited.
    pub max_joined_tables: usize,
    /// Maximum number of rows per multi-row insert; 0 for unlimited.
    pub max_multiinsertrows: usize,
}

/// Outcome of an optimistic row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    Unchanged,
    /// The row was modified since it was read; its contents have been refreshed.
    Changed,
    /// The row no longer exists.
    Removed,
}

/// The capability every storage backend implements.
///
/// Blocks are flat: row `r` of a cursor over `n` tables occupies records
/// `r * n .. r * n + n`, one record per table in query order.
pub trait TransactionDriver: Send {
    /// Static capability record.
    fn description(&self) -> &DriverDescription;

    /// Insert one row into the single table of `query`.
    fn execute_insert(&mut self, query: &DatabaseQuery, record: &Record) -> Result<(), DbError>;

    /// Insert many rows. Drivers may override this to batch.
    fn execute_inserts(&mut self, query: &DatabaseQuery, records: &[Record]) -> Result<(), DbError> {
        for record in records {
            self.execute_insert(query, record)?;
        }
        Ok(())
    }

    /// Open a cursor. Conditions the driver enforces get `handled` set; a
    /// driver that leaves any condition unhandled must ignore `query.limit`.
    ///
    /// Returns `NO_CURSOR` when the open failed silently; callers treat that as
    /// an empty result set.
    fn open_cursor(&mut self, query: &mut DatabaseQuery, cursortype: CursorType) -> Result<CursorId, DbError>;

    /// Replace `recarr` with the fase-1 columns of the next block and return
    /// its row count. Zero signals the end of the cursor.
    fn retrieve_next_block(&mut self, id: CursorId, recarr: &mut Vec<Record>) -> Result<usize, DbError>;

    /// Fill in the fase-2 columns of the given rows of the last block.
    /// `is_last_fase2_req_for_block` is a hint a driver may ignore.
    fn retrieve_fase2_records(
        &mut self,
        id: CursorId,
        recarr: &mut [Record],
        rows: &[usize],
        is_last_fase2_req_for_block: bool,
    ) -> Result<(), DbError>;

    /// Lock a row of the last block before mutating it. The row's records may
    /// be refreshed.
    fn lock_row(&mut self, id: CursorId, recarr: &mut [Record], row: usize) -> Result<LockResult, DbError>;

    fn unlock_row(&mut self, id: CursorId, row: usize) -> Result<(), DbError>;

    fn delete_record(&mut self, id: CursorId, row: usize) -> Result<(), DbError>;

    /// Write `newfields` into a row of the last block. Columns in `updated`
    /// that are missing from `newfields` become NULL.
    fn update_record(
        &mut self,
        id: CursorId,
        row: usize,
        newfields: &Record,
        updated: &[ColumnId],
    ) -> Result<(), DbError>;

    fn close_cursor(&mut self, id: CursorId) -> Result<(), DbError>;

    /// Liveness probe used by the keep-alive sweep.
    fn keep_alive(&mut self) -> bool {
        true
    }
}

/// Shared slot holding a driver. Rebinding swaps the boxed driver in place,
/// so every holder of the slot sees the new driver.
pub type DriverRef = Arc<Mutex<Box<dyn TransactionDriver>>>;

/// Wrap a driver in a fresh slot.
pub fn new_driver_ref(driver: Box<dyn TransactionDriver>) -> DriverRef {
    Arc::new(Mutex::new(driver))
}

/// Lock a driver slot.
pub fn lock_driver(driver: &DriverRef) -> Result<MutexGuard<'_, Box<dyn TransactionDriver>>, DbError> {
    driver.lock().map_err(|_| {
        error!("driver lock poisoned");
        DbError::InternalError(String::from("driver lock poisoned"))
    })
}

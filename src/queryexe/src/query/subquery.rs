use super::nulls;
use common::driver::{lock_driver, DriverDescription, DriverRef, LockResult};
use common::ids::{CursorId, TransactionId, NO_CURSOR};
use common::query::{CursorType, DatabaseQuery, Fase, RelOp, TableSource};
use common::vars::Var;
use common::{DbError, Field, Record};
use std::sync::Arc;
use txn_manager::TransactionRegistry;

/// Where a subquery's rows come from.
enum Binding {
    /// A driver cursor, resolved through the registry on every call so that
    /// invalidation and rebinding take effect immediately.
    Transaction {
        registry: Arc<TransactionRegistry>,
        tid: TransactionId,
    },
    /// A plain record array owned by the subquery.
    Records,
}

/// Splits of an oversized integer `in` list, opened one after another.
struct InPartition {
    /// Index of the condition within the subquery's singles.
    cond: usize,
    values: Vec<Field>,
    part: usize,
    part_size: usize,
}

impl InPartition {
    fn parts(&self) -> usize {
        (self.values.len() + self.part_size - 1) / self.part_size
    }

    fn slice(&self, part: usize) -> Vec<Field> {
        let start = part * self.part_size;
        let end = (start + self.part_size).min(self.values.len());
        self.values[start..end].to_vec()
    }
}

/// One cursor over a fragment of a join partition.
///
/// Rows of the current block are stored flat, `tablecount` records per row.
/// Record array sources present their whole array as a single block.
pub struct SubQuery {
    binding: Binding,
    desc: DriverDescription,
    cursortype: CursorType,
    /// Tables and conditions, renumbered to local indices.
    pub(crate) query: DatabaseQuery,
    /// Join partition this subquery serves.
    pub(crate) partition: usize,
    cursor: CursorId,
    opened: bool,
    closed: bool,
    exhausted: bool,
    /// Whether the array block has been handed out.
    served: bool,
    /// Rows are fully materialized; the driver is no longer consulted.
    cached: bool,
    block: Vec<Record>,
    block_pos: usize,
    block_len: usize,
    fase2_done: Vec<bool>,
    deleted: Option<Vec<bool>>,
    in_part: Option<InPartition>,
}

impl SubQuery {
    fn with_binding(binding: Binding, desc: DriverDescription, cursortype: CursorType, partition: usize) -> Self {
        SubQuery {
            binding,
            desc,
            cursortype,
            query: DatabaseQuery::new(),
            partition,
            cursor: NO_CURSOR,
            opened: false,
            closed: false,
            exhausted: false,
            served: false,
            cached: false,
            block: Vec::new(),
            block_pos: 0,
            block_len: 0,
            fase2_done: Vec::new(),
            deleted: None,
            in_part: None,
        }
    }

    /// Create a subquery reading through the driver of a transaction.
    ///
    /// # Arguments
    ///
    /// * `registry` - Registry resolving `tid`.
    /// * `tid` - Transaction whose driver serves the cursor.
    /// * `desc` - Capabilities of that driver.
    /// * `cursortype` - Kind of cursor to open.
    /// * `partition` - Join partition of the tables this subquery will hold.
    pub fn new_driver(
        registry: Arc<TransactionRegistry>,
        tid: TransactionId,
        desc: DriverDescription,
        cursortype: CursorType,
        partition: usize,
    ) -> Self {
        Self::with_binding(Binding::Transaction { registry, tid }, desc, cursortype, partition)
    }

    /// Create a subquery over an in-memory record array.
    pub fn new_records(records: Vec<Record>, cursortype: CursorType, partition: usize) -> Self {
        let mut sq = Self::with_binding(Binding::Records, DriverDescription::default(), cursortype, partition);
        sq.block_len = records.len();
        sq.block = records;
        sq
    }

    /// Transaction of a driver-bound subquery.
    pub fn tid(&self) -> Option<TransactionId> {
        match &self.binding {
            Binding::Transaction { tid, .. } => Some(*tid),
            Binding::Records => None,
        }
    }

    pub fn description(&self) -> &DriverDescription {
        &self.desc
    }

    pub fn table_count(&self) -> usize {
        self.query.tables.len()
    }

    pub fn is_driver_bound(&self) -> bool {
        matches!(self.binding, Binding::Transaction { .. })
    }

    fn uses_driver(&self) -> bool {
        self.is_driver_bound() && !self.cached
    }

    /// Append a table and return its local index.
    pub fn add_table(&mut self, table: TableSource) -> usize {
        self.query.tables.push(table);
        self.query.tables.len() - 1
    }

    fn driver_slot(&self) -> Result<DriverRef, DbError> {
        match &self.binding {
            Binding::Transaction { registry, tid } => registry.get(*tid),
            Binding::Records => Err(DbError::InternalError(String::from(
                "record array source has no driver",
            ))),
        }
    }

    /// Split the first oversized integer `in` list into partitions of at most
    /// `part_size` values. The values are sorted and deduplicated first.
    pub fn partition_in_conditions(&mut self, part_size: usize) -> Result<(), DbError> {
        if !self.is_driver_bound() || part_size == 0 {
            return Ok(());
        }
        for (i, cond) in self.query.singles.iter().enumerate() {
            if cond.op != RelOp::In {
                continue;
            }
            let list = self.query.values.get(cond.value)?.list()?;
            if list.len() <= part_size || !list.iter().all(|f| f.as_int().is_some()) {
                continue;
            }
            let mut ints: Vec<i64> = list.iter().filter_map(Field::as_int).collect();
            ints.sort_unstable();
            ints.dedup();
            let part = InPartition {
                cond: i,
                values: ints.into_iter().map(Field::IntField).collect(),
                part: 0,
                part_size,
            };
            debug!(
                "partitioning in list of {} values into {} parts",
                part.values.len(),
                part.parts()
            );
            self.in_part = Some(part);
            break;
        }
        Ok(())
    }

    /// Number of `in` partitions the cursor will be opened for.
    pub fn in_parts(&self) -> usize {
        self.in_part.as_ref().map(|p| p.parts()).unwrap_or(1)
    }

    fn set_in_part(&mut self, part: usize) -> Result<(), DbError> {
        if let Some(p) = self.in_part.as_mut() {
            p.part = part;
            let values = p.slice(part);
            let id = self.query.singles[p.cond].value;
            self.query.values.replace(id, Var::List(values))?;
        }
        Ok(())
    }

    fn open_driver_cursor(&mut self) -> Result<(), DbError> {
        let slot = self.driver_slot()?;
        let mut driver = lock_driver(&slot)?;
        self.cursor = driver.open_cursor(&mut self.query, self.cursortype)?;
        if self.cursor == NO_CURSOR {
            debug!("driver declined cursor, treating it as empty");
        }
        Ok(())
    }

    fn close_driver_cursor(&mut self) -> Result<(), DbError> {
        if self.cursor == NO_CURSOR {
            return Ok(());
        }
        let id = self.cursor;
        self.cursor = NO_CURSOR;
        let slot = self.driver_slot()?;
        let mut driver = lock_driver(&slot)?;
        driver.close_cursor(id)
    }

    /// Open the cursor. Record array sources only reset their position.
    pub fn open(&mut self) -> Result<(), DbError> {
        if self.opened {
            return Ok(());
        }
        self.opened = true;
        if !self.is_driver_bound() {
            return Ok(());
        }
        if self.desc.needs_uppercase_names {
            for table in self.query.tables.iter_mut() {
                table.uppercase_names();
            }
        }
        if self.cursortype != CursorType::Select && !self.desc.supports_data_modify {
            return Err(DbError::TransReadOnly(format!(
                "cannot open a {:?} cursor on a read-only transaction",
                self.cursortype
            )));
        }
        for table in self.query.tables.iter_mut() {
            nulls::init_null_handling(table, &mut self.query.values)?;
        }
        self.set_in_part(0)?;
        self.open_driver_cursor()
    }

    /// Fetch the next block and position on its first valid row.
    ///
    /// Exhausted `in` partitions roll over to the next one. Returns 0 only
    /// when no rows are left at all.
    pub fn retrieve_next_block(&mut self) -> Result<usize, DbError> {
        loop {
            if self.exhausted {
                self.block_len = 0;
                self.block_pos = 0;
                return Ok(0);
            }
            if !self.uses_driver() {
                if self.served {
                    self.exhausted = true;
                    continue;
                }
                self.served = true;
                self.block_pos = 0;
                self.block_len = self.block.len() / self.table_count().max(1);
                self.fase2_done = vec![true; self.block_len];
            } else {
                let n = if self.cursor == NO_CURSOR {
                    0
                } else {
                    let slot = self.driver_slot()?;
                    let n = lock_driver(&slot)?.retrieve_next_block(self.cursor, &mut self.block)?;
                    n
                };
                if n == 0 {
                    self.close_driver_cursor()?;
                    let next = self.in_part.as_ref().and_then(|p| {
                        if p.part + 1 < p.parts() {
                            Some(p.part + 1)
                        } else {
                            None
                        }
                    });
                    match next {
                        Some(part) => {
                            debug!("moving on to in partition {}", part);
                            self.set_in_part(part)?;
                            self.open_driver_cursor()?;
                        }
                        None => self.exhausted = true,
                    }
                    continue;
                }
                self.block_pos = 0;
                self.block_len = n;
                self.fase2_done = vec![false; n];
                if self.desc.supports_nulls {
                    self.fill_defaults(0..n, Fase::FASE1)?;
                }
            }
            if self.advance_while_invalid(false)? {
                return Ok(self.block_len);
            }
        }
    }

    fn fill_defaults(&mut self, rows: impl IntoIterator<Item = usize>, fases: Fase) -> Result<(), DbError> {
        let tc = self.table_count();
        for row in rows {
            for (t, table) in self.query.tables.iter().enumerate() {
                if let Some(record) = self.block.get_mut(row * tc + t) {
                    nulls::fill_with_null_defaults(table, &self.query.values, record, fases)?;
                }
            }
        }
        Ok(())
    }

    /// Whether the current row fails a condition the driver left to us.
    ///
    /// With `recheck`, handled conditions on columns marked for recheck are
    /// evaluated as well.
    pub fn is_current_row_invalid(&self, recheck: bool) -> Result<bool, DbError> {
        let tc = self.table_count();
        let base = self.block_pos * tc;
        let row = self.block.get(base..base + tc).ok_or_else(|| {
            DbError::InternalError(String::from("no current row in subquery"))
        })?;
        if self.is_deleted(self.block_pos) {
            return Ok(true);
        }
        for cond in self.query.singles.iter() {
            let must = !cond.handled
                || (recheck && self.query.tables[cond.table].fase(cond.column).contains(Fase::RECHECK));
            if must
                && !nulls::satisfies_single_with_nulls(
                    cond,
                    &self.query.tables[cond.table],
                    &self.query.values,
                    &row[cond.table],
                )?
            {
                return Ok(true);
            }
        }
        for cond in self.query.joins.iter() {
            let must = !cond.handled
                || (recheck
                    && (self.query.tables[cond.table1].fase(cond.column1).contains(Fase::RECHECK)
                        || self.query.tables[cond.table2].fase(cond.column2).contains(Fase::RECHECK)));
            if must
                && !nulls::satisfies_join_with_nulls(
                    cond,
                    &self.query.tables[cond.table1],
                    &self.query.values,
                    &row[cond.table1],
                    &self.query.tables[cond.table2],
                    &self.query.values,
                    &row[cond.table2],
                )?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Skip rows failing local conditions. Returns false when the block has
    /// no valid row left; never crosses a block boundary.
    pub fn advance_while_invalid(&mut self, recheck: bool) -> Result<bool, DbError> {
        while self.block_pos < self.block_len {
            if !self.is_current_row_invalid(recheck)? {
                return Ok(true);
            }
            self.block_pos += 1;
        }
        Ok(false)
    }

    /// Move to the next valid row of the current block.
    pub fn advance_cursor_within_block(&mut self) -> Result<bool, DbError> {
        if self.block_pos >= self.block_len {
            return Ok(false);
        }
        self.block_pos += 1;
        self.advance_while_invalid(false)
    }

    /// Move to the next valid row, fetching further blocks as needed.
    pub fn advance(&mut self) -> Result<bool, DbError> {
        if self.advance_cursor_within_block()? {
            return Ok(true);
        }
        Ok(self.retrieve_next_block()? > 0)
    }

    /// Return to the first valid row of a materialized subquery.
    pub fn rewind(&mut self) -> Result<bool, DbError> {
        if self.uses_driver() {
            return Err(DbError::InternalError(String::from(
                "cannot rewind a streaming subquery",
            )));
        }
        self.exhausted = false;
        self.served = false;
        Ok(self.retrieve_next_block()? > 0)
    }

    pub fn has_row(&self) -> bool {
        self.block_pos < self.block_len
    }

    /// Position of the current row within the block.
    pub fn current_row(&self) -> usize {
        self.block_pos
    }

    /// Record of a local table at a row of the current block.
    pub fn record_at(&self, row: usize, table: usize) -> Result<&Record, DbError> {
        if row >= self.block_len || table >= self.table_count() {
            return Err(DbError::InternalError(format!(
                "row {} table {} outside the current block",
                row, table
            )));
        }
        self.block.get(row * self.table_count() + table).ok_or_else(|| {
            DbError::InternalError(String::from("block shorter than its row count"))
        })
    }

    /// Record of a local table at the current row.
    pub fn current_record(&self, table: usize) -> Result<&Record, DbError> {
        self.record_at(self.block_pos, table)
    }

    /// Fetch the fase-2 columns of the given rows. Rows already promoted are
    /// skipped.
    ///
    /// # Arguments
    ///
    /// * `rows` - Rows of the current block.
    /// * `allow_direct_close` - Hint that no more fase-2 requests follow for this block.
    pub fn retrieve_fase2_records(&mut self, rows: &[usize], allow_direct_close: bool) -> Result<(), DbError> {
        let pending: Vec<usize> = rows
            .iter()
            .copied()
            .filter(|r| !self.fase2_done.get(*r).copied().unwrap_or(true))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        let slot = self.driver_slot()?;
        lock_driver(&slot)?.retrieve_fase2_records(
            self.cursor,
            &mut self.block,
            &pending,
            allow_direct_close,
        )?;
        if self.desc.supports_nulls {
            self.fill_defaults(pending.iter().copied(), Fase::FASE2)?;
        }
        for r in pending {
            self.fase2_done[r] = true;
        }
        Ok(())
    }

    /// Lock the current row with the driver. Refreshed rows get their null
    /// defaults again.
    pub fn lock_row(&mut self) -> Result<LockResult, DbError> {
        if !self.uses_driver() {
            return Ok(LockResult::Unchanged);
        }
        let row = self.block_pos;
        let slot = self.driver_slot()?;
        let result = lock_driver(&slot)?.lock_row(self.cursor, &mut self.block, row)?;
        debug!("lock of row {} returned {:?}", row, result);
        if result == LockResult::Changed && self.desc.supports_nulls {
            self.fill_defaults(std::iter::once(row), Fase::FASE1 | Fase::FASE2)?;
        }
        Ok(result)
    }

    pub fn unlock_row(&mut self) -> Result<(), DbError> {
        if !self.uses_driver() {
            return Ok(());
        }
        let slot = self.driver_slot()?;
        let mut driver = lock_driver(&slot)?;
        driver.unlock_row(self.cursor, self.block_pos)
    }

    fn is_deleted(&self, row: usize) -> bool {
        self.deleted
            .as_ref()
            .and_then(|d| d.get(row).copied())
            .unwrap_or(false)
    }

    /// Delete a row of the current block. Array rows are only marked and
    /// disappear when the array is handed back.
    pub fn delete_row(&mut self, row: usize) -> Result<(), DbError> {
        if self.uses_driver() {
            let slot = self.driver_slot()?;
            let mut driver = lock_driver(&slot)?;
            return driver.delete_record(self.cursor, row);
        }
        if row >= self.block_len {
            return Err(DbError::InternalError(format!("cannot delete row {}", row)));
        }
        let len = self.block_len;
        let deleted = self.deleted.get_or_insert_with(|| vec![false; len]);
        deleted[row] = true;
        Ok(())
    }

    /// Update a row of the current block.
    ///
    /// Drivers receive the fields with null defaults stripped, together with
    /// every column the update writes, so stripped cells are stored as NULL.
    /// The block copy is updated in place, each field cast to the type of the
    /// cell it replaces, or to its column's type for new cells.
    pub fn update_row(&mut self, row: usize, fields: &Record) -> Result<(), DbError> {
        if self.uses_driver() {
            let table = &self.query.tables[0];
            let mut updated = table.column_ids_with(Fase::UPDATED);
            for (id, _) in fields.cells() {
                if !updated.contains(&id) {
                    updated.push(id);
                }
            }
            let mut stripped = fields.clone();
            if self.desc.supports_nulls {
                nulls::delete_null_defaults(table, &self.query.values, &mut stripped)?;
            }
            let slot = self.driver_slot()?;
            lock_driver(&slot)?.update_record(self.cursor, row, &stripped, &updated)?;
        }
        let tc = self.table_count();
        let typeinfo = Arc::clone(&self.query.tables[0].typeinfo);
        let record = self
            .block
            .get_mut(row * tc)
            .ok_or_else(|| DbError::InternalError(format!("cannot update row {}", row)))?;
        for (id, field) in fields.cells() {
            let dtype = match record.get(id) {
                Some(existing) => existing.dtype(),
                None => match typeinfo.position_of(id).and_then(|p| typeinfo.column(p)) {
                    Some(col) => col.dtype,
                    None => {
                        return Err(DbError::UnknownColumn(format!(
                            "column id {} in table {}",
                            id, self.query.tables[0].name
                        )))
                    }
                },
            };
            record.set(id, field.cast_to(dtype)?);
        }
        Ok(())
    }

    /// Materialize every remaining row, fase-2 columns included, and close
    /// the driver cursor.
    pub fn read_and_cache(&mut self) -> Result<(), DbError> {
        if !self.uses_driver() {
            return Ok(());
        }
        let tc = self.table_count();
        let mut rows: Vec<Record> = Vec::new();
        while self.retrieve_next_block()? > 0 {
            let mut valid = Vec::new();
            loop {
                valid.push(self.block_pos);
                if !self.advance_cursor_within_block()? {
                    break;
                }
            }
            self.retrieve_fase2_records(&valid, true)?;
            for r in valid {
                rows.extend_from_slice(&self.block[r * tc..r * tc + tc]);
            }
        }
        debug!("cached {} rows of {} tables", rows.len() / tc.max(1), tc);
        self.close_driver_cursor()?;
        // Cached rows are rechecked against the whole list, not the last part.
        if let Some(p) = self.in_part.take() {
            let id = self.query.singles[p.cond].value;
            self.query.values.replace(id, Var::List(p.values))?;
        }
        self.cached = true;
        self.block = rows;
        self.block_len = self.block.len() / tc.max(1);
        self.block_pos = 0;
        self.exhausted = false;
        self.served = false;
        Ok(())
    }

    /// Hand back the record array with deleted rows removed, in their
    /// original order.
    pub fn get_result_array_source(&mut self) -> Result<Vec<Record>, DbError> {
        if self.uses_driver() {
            return Err(DbError::InternalError(String::from(
                "subquery is not backed by a record array",
            )));
        }
        let tc = self.table_count().max(1);
        let deleted = self.deleted.take();
        let block = std::mem::take(&mut self.block);
        self.block_len = 0;
        self.block_pos = 0;
        let rows: Vec<Record> = match deleted {
            None => block,
            Some(deleted) => block
                .chunks(tc)
                .enumerate()
                .filter(|(i, _)| !deleted.get(*i).copied().unwrap_or(false))
                .flat_map(|(_, chunk)| chunk.iter().cloned())
                .collect(),
        };
        Ok(rows)
    }

    /// Close the cursor and release null defaults. Safe to call twice.
    pub fn close(&mut self) -> Result<(), DbError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let closed = if self.uses_driver() {
            self.close_driver_cursor()
        } else {
            Ok(())
        };
        for table in self.query.tables.iter_mut() {
            nulls::free_null_defaults(table, &mut self.query.values)?;
        }
        self.query.values.clear();
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::driver::TransactionDriver;
    use common::query::SingleCondition;
    use common::testutil::*;
    use common::ColumnId;
    use memstore::storage_manager::StoreStats;
    use memstore::{MemDriver, StorageManager};

    fn memdriver_sq(sm: &StorageManager, desc: DriverDescription, handle: bool) -> (SubQuery, Arc<TransactionRegistry>) {
        let registry = TransactionRegistry::new_shared();
        let driver = MemDriver::new(sm.clone(), desc.clone()).with_condition_handling(handle);
        let tid = registry.register(Box::new(driver)).unwrap();
        let sq = SubQuery::new_driver(registry.clone(), tid, desc, CursorType::Select, 0);
        (sq, registry)
    }

    fn int_condition(sq: &mut SubQuery, column: usize, op: RelOp, value: Var) {
        let value = sq.query.values.alloc(value);
        sq.query.singles.push(SingleCondition {
            table: 0,
            column,
            columnid: column as ColumnId,
            op,
            value,
            case_sensitive: true,
            match_null: false,
            handled: false,
        });
    }

    fn collect(sq: &mut SubQuery) -> Vec<Record> {
        let mut out = Vec::new();
        if sq.retrieve_next_block().unwrap() == 0 {
            return out;
        }
        loop {
            out.push(sq.current_record(0).unwrap().clone());
            if !sq.advance().unwrap() {
                break;
            }
        }
        out
    }

    fn collect_from_current(sq: &mut SubQuery) -> Vec<Record> {
        let mut out = Vec::new();
        while sq.has_row() {
            out.push(sq.current_record(0).unwrap().clone());
            if !sq.advance().unwrap() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_unhandled_conditions_filter_blocks() {
        init();
        let sm = StorageManager::new_test_sm();
        sm.create_table("t").unwrap();
        for i in 0..10 {
            sm.insert("t", int_vec_to_record(vec![i, i % 3])).unwrap();
        }
        let mut desc = MemDriver::full_description();
        desc.supports_nulls = false;
        let (mut sq, _registry) = memdriver_sq(&sm, desc, false);
        sq.add_table(TableSource::new("t", get_int_table_schema(2)));
        sq.query.max_block_size = 3;
        int_condition(&mut sq, 1, RelOp::Equal, Var::Scalar(Field::IntField(0)));
        sq.open().unwrap();
        let rows = collect(&mut sq);
        let ids: Vec<i64> = rows.iter().filter_map(|r| r.get(0).and_then(Field::as_int)).collect();
        assert_eq!(ids, vec![0, 3, 6, 9]);
        sq.close().unwrap();
    }

    #[test]
    fn test_in_partition_rollover() {
        init();
        let sm = StorageManager::new_test_sm();
        sm.create_table("t").unwrap();
        for i in 0..30 {
            sm.insert("t", int_vec_to_record(vec![i])).unwrap();
        }
        let (mut sq, _registry) = memdriver_sq(&sm, MemDriver::full_description(), true);
        sq.add_table(TableSource::new("t", get_int_table_schema(1)));
        let list: Vec<Field> = (0..25).rev().map(|i| Field::IntField(i * 2)).collect();
        int_condition(&mut sq, 0, RelOp::In, Var::List(list));
        sq.partition_in_conditions(10).unwrap();
        assert_eq!(sq.in_parts(), 3);
        sq.open().unwrap();
        let rows = collect(&mut sq);
        let expected: Vec<Record> = (0..15).map(|i| int_vec_to_record(vec![i * 2])).collect();
        assert_eq!(rows, expected);
        assert_eq!(StoreStats::get(&sm.stats().cursors_opened), 3);
        assert_eq!(StoreStats::get(&sm.stats().in_values), 25);
    }

    /// Declines the first cursor it is asked to open.
    struct DeclineFirstOpen {
        inner: MemDriver,
        declined: bool,
    }

    impl TransactionDriver for DeclineFirstOpen {
        fn description(&self) -> &DriverDescription {
            self.inner.description()
        }

        fn execute_insert(&mut self, query: &DatabaseQuery, record: &Record) -> Result<(), DbError> {
            self.inner.execute_insert(query, record)
        }

        fn open_cursor(&mut self, query: &mut DatabaseQuery, cursortype: CursorType) -> Result<CursorId, DbError> {
            if !self.declined {
                self.declined = true;
                return Ok(NO_CURSOR);
            }
            self.inner.open_cursor(query, cursortype)
        }

        fn retrieve_next_block(&mut self, id: CursorId, recarr: &mut Vec<Record>) -> Result<usize, DbError> {
            self.inner.retrieve_next_block(id, recarr)
        }

        fn retrieve_fase2_records(
            &mut self,
            id: CursorId,
            recarr: &mut [Record],
            rows: &[usize],
            last: bool,
        ) -> Result<(), DbError> {
            self.inner.retrieve_fase2_records(id, recarr, rows, last)
        }

        fn lock_row(&mut self, id: CursorId, recarr: &mut [Record], row: usize) -> Result<LockResult, DbError> {
            self.inner.lock_row(id, recarr, row)
        }

        fn unlock_row(&mut self, id: CursorId, row: usize) -> Result<(), DbError> {
            self.inner.unlock_row(id, row)
        }

        fn delete_record(&mut self, id: CursorId, row: usize) -> Result<(), DbError> {
            self.inner.delete_record(id, row)
        }

        fn update_record(
            &mut self,
            id: CursorId,
            row: usize,
            newfields: &Record,
            updated: &[ColumnId],
        ) -> Result<(), DbError> {
            self.inner.update_record(id, row, newfields, updated)
        }

        fn close_cursor(&mut self, id: CursorId) -> Result<(), DbError> {
            self.inner.close_cursor(id)
        }
    }

    #[test]
    fn test_declined_in_partition_moves_on() {
        init();
        let sm = StorageManager::new_test_sm();
        sm.create_table("t").unwrap();
        for i in 0..30 {
            sm.insert("t", int_vec_to_record(vec![i])).unwrap();
        }
        let desc = MemDriver::full_description();
        let registry = TransactionRegistry::new_shared();
        let driver = DeclineFirstOpen {
            inner: MemDriver::new(sm.clone(), desc.clone()),
            declined: false,
        };
        let tid = registry.register(Box::new(driver)).unwrap();
        let mut sq = SubQuery::new_driver(registry, tid, desc, CursorType::Select, 0);
        sq.add_table(TableSource::new("t", get_int_table_schema(1)));
        let list: Vec<Field> = (0..25).map(|i| Field::IntField(i * 2)).collect();
        int_condition(&mut sq, 0, RelOp::In, Var::List(list));
        sq.partition_in_conditions(10).unwrap();
        sq.open().unwrap();
        // Values 0..=18 went to the declined cursor.
        let rows = collect(&mut sq);
        assert_eq!(rows, create_record_list(vec![vec![20], vec![22], vec![24], vec![26], vec![28]]));
        assert_eq!(StoreStats::get(&sm.stats().cursors_opened), 2);
        sq.close().unwrap();
    }

    #[test]
    fn test_read_and_cache_keeps_whole_in_list() {
        init();
        let sm = StorageManager::new_test_sm();
        sm.create_table("t").unwrap();
        for i in 0..30 {
            sm.insert("t", int_vec_to_record(vec![i])).unwrap();
        }
        let (mut sq, _registry) = memdriver_sq(&sm, MemDriver::full_description(), false);
        sq.add_table(TableSource::new("t", get_int_table_schema(1)));
        let list: Vec<Field> = (0..25).map(|i| Field::IntField(i * 2)).collect();
        int_condition(&mut sq, 0, RelOp::In, Var::List(list));
        sq.partition_in_conditions(10).unwrap();
        sq.open().unwrap();
        sq.read_and_cache().unwrap();
        let expected: Vec<Record> = (0..15).map(|i| int_vec_to_record(vec![i * 2])).collect();
        assert_eq!(collect(&mut sq), expected);
        assert!(sq.rewind().unwrap());
        assert_eq!(collect_from_current(&mut sq), expected);
        sq.close().unwrap();
    }

    #[test]
    fn test_empty_table() {
        let sm = StorageManager::new_test_sm();
        sm.create_table("t").unwrap();
        let (mut sq, _registry) = memdriver_sq(&sm, MemDriver::full_description(), true);
        sq.add_table(TableSource::new("t", get_int_table_schema(1)));
        sq.open().unwrap();
        assert_eq!(sq.retrieve_next_block().unwrap(), 0);
        assert!(!sq.has_row());
    }

    #[test]
    fn test_read_only_driver_refuses_update_cursor() {
        let sm = StorageManager::new_test_sm();
        sm.create_table("t").unwrap();
        let registry = TransactionRegistry::new_shared();
        let desc = DriverDescription::default();
        let tid = registry
            .register(Box::new(MemDriver::new(sm, desc.clone())))
            .unwrap();
        let mut sq = SubQuery::new_driver(registry, tid, desc, CursorType::Update, 0);
        sq.add_table(TableSource::new("t", get_int_table_schema(1)));
        assert!(matches!(sq.open(), Err(DbError::TransReadOnly(_))));
    }

    #[test]
    fn test_fase2_promotion_is_idempotent() {
        let sm = StorageManager::new_test_sm();
        sm.create_table("t").unwrap();
        for i in 0..4 {
            sm.insert("t", int_vec_to_record(vec![i])).unwrap();
        }
        let (mut sq, _registry) = memdriver_sq(&sm, MemDriver::full_description(), true);
        sq.add_table(TableSource::new("t", get_int_table_schema(1)));
        sq.open().unwrap();
        assert_eq!(sq.retrieve_next_block().unwrap(), 4);
        sq.retrieve_fase2_records(&[0, 1], false).unwrap();
        sq.retrieve_fase2_records(&[1, 2], false).unwrap();
        sq.retrieve_fase2_records(&[0, 1, 2], true).unwrap();
        assert_eq!(StoreStats::get(&sm.stats().fase2_rows), 3);
    }

    #[test]
    fn test_read_and_cache_then_rewind() {
        let sm = StorageManager::new_test_sm();
        sm.create_table("t").unwrap();
        for i in 0..7 {
            sm.insert("t", int_vec_to_record(vec![i])).unwrap();
        }
        let (mut sq, _registry) = memdriver_sq(&sm, MemDriver::full_description(), true);
        sq.add_table(TableSource::new("t", get_int_table_schema(1)));
        sq.query.max_block_size = 2;
        sq.open().unwrap();
        sq.read_and_cache().unwrap();
        assert_eq!(collect(&mut sq).len(), 7);
        assert!(sq.rewind().unwrap());
        assert_eq!(sq.current_record(0).unwrap(), &int_vec_to_record(vec![0]));
        sq.close().unwrap();
    }

    #[test]
    fn test_array_delete_compaction_keeps_order() {
        let records = create_record_list((0..6).map(|i| vec![i]).collect());
        let mut sq = SubQuery::new_records(records, CursorType::Delete, 0);
        sq.add_table(TableSource::new("arr", get_int_table_schema(1)));
        sq.open().unwrap();
        assert_eq!(sq.retrieve_next_block().unwrap(), 6);
        sq.delete_row(1).unwrap();
        sq.delete_row(4).unwrap();
        let left = sq.get_result_array_source().unwrap();
        assert_eq!(left, create_record_list(vec![vec![0], vec![2], vec![3], vec![5]]));
    }

    #[test]
    fn test_array_update_preserves_cell_type() {
        let records = vec![Record::from_cells(vec![(0, Field::IntField(1))])];
        let mut sq = SubQuery::new_records(records, CursorType::Update, 0);
        sq.add_table(TableSource::new("arr", get_int_table_schema(2)));
        sq.open().unwrap();
        sq.retrieve_next_block().unwrap();
        let fields = Record::from_cells(vec![
            (0, Field::StringField(String::from("42"))),
            (1, Field::FloatField(2.9)),
        ]);
        sq.update_row(0, &fields).unwrap();
        let row = sq.current_record(0).unwrap();
        assert_eq!(row.get(0), Some(&Field::IntField(42)));
        assert_eq!(row.get(1), Some(&Field::IntField(2)));
        let bad = Record::from_cells(vec![(9, Field::IntField(1))]);
        assert!(matches!(sq.update_row(0, &bad), Err(DbError::UnknownColumn(_))));
    }

    #[test]
    fn test_invalidated_transaction_fails() {
        let sm = StorageManager::new_test_sm();
        sm.create_table("t").unwrap();
        sm.insert("t", int_vec_to_record(vec![1])).unwrap();
        let (mut sq, registry) = memdriver_sq(&sm, MemDriver::full_description(), true);
        sq.add_table(TableSource::new("t", get_int_table_schema(1)));
        sq.open().unwrap();
        registry.invalidate(sq.tid().unwrap()).unwrap();
        assert!(matches!(
            sq.retrieve_next_block(),
            Err(DbError::InvalidTransaction(_))
        ));
    }
}

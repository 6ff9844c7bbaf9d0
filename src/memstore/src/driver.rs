use crate::storage_manager::{SlotId, StorageManager, StoreStats, StoredRow};
use common::conditions::{satisfies_join, satisfies_single};
use common::driver::{DriverDescription, LockResult, TransactionDriver};
use common::ids::{CursorId, NO_CURSOR};
use common::query::{CursorType, DatabaseQuery, Fase, JoinCondition, RelOp, SingleCondition};
use common::{ColumnId, DbError, Record};
use std::collections::{HashMap, HashSet};

/// Block size used when the query does not ask for one.
const DEFAULT_BLOCK_SIZE: usize = 64;

/// One matched row: slot and version for every table of the cursor.
type RowRef = Vec<(SlotId, u64)>;

struct MemCursor {
    query: DatabaseQuery,
    cursortype: CursorType,
    matches: Vec<RowRef>,
    pos: usize,
    /// Row references of the block last handed out.
    block: Vec<RowRef>,
    locked: HashSet<usize>,
}

impl MemCursor {
    fn row(&self, row: usize) -> Result<&RowRef, DbError> {
        self.block.get(row).ok_or_else(|| {
            DbError::DatabaseException(format!("row {} is not part of the current block", row))
        })
    }
}

/// A driver serving one transaction over a `StorageManager`.
///
/// Conditions are evaluated while the cursor is opened, so a cursor sees the
/// rows that matched at open time. Rows deleted later are skipped when their
/// block is read.
pub struct MemDriver {
    sm: StorageManager,
    desc: DriverDescription,
    handle_conditions: bool,
    cursors: HashMap<CursorId, MemCursor>,
    next_cursor: CursorId,
}

impl MemDriver {
    /// Create a driver that enforces every condition it can.
    ///
    /// # Arguments
    ///
    /// * `sm` - Store to serve rows from.
    /// * `desc` - Capabilities to announce.
    pub fn new(sm: StorageManager, desc: DriverDescription) -> Self {
        MemDriver {
            sm,
            desc,
            handle_conditions: true,
            cursors: HashMap::new(),
            next_cursor: NO_CURSOR + 1,
        }
    }

    /// Description of a capable driver: blocks, nulls, modification and limit.
    pub fn full_description() -> DriverDescription {
        DriverDescription {
            supports_block_cursors: true,
            supports_single: true,
            supports_data_modify: true,
            supports_nulls: true,
            supports_limit: true,
            needs_locking_and_recheck: false,
            needs_uppercase_names: false,
            add_missing_default_columns: false,
            max_joined_tables: 0,
            max_multiinsertrows: 0,
        }
    }

    /// Leave every condition to the engine.
    pub fn with_condition_handling(mut self, handle: bool) -> Self {
        self.handle_conditions = handle;
        self
    }

    fn cursor_mut(&mut self, id: CursorId) -> Result<&mut MemCursor, DbError> {
        self.cursors
            .get_mut(&id)
            .ok_or_else(|| DbError::DatabaseException(format!("cursor {} is not open", id)))
    }

    fn check_single(query: &DatabaseQuery, cond: &SingleCondition, record: &Record) -> Result<bool, DbError> {
        if !record.contains(cond.columnid) {
            return Ok(cond.match_null);
        }
        satisfies_single(&query.values, cond, record)
    }

    fn check_join(cond: &JoinCondition, left: &Record, right: &Record) -> Result<bool, DbError> {
        match (left.contains(cond.columnid1), right.contains(cond.columnid2)) {
            (true, true) => satisfies_join(cond, left, right),
            (false, false) => Ok(cond.match_double_null),
            _ => Ok(false),
        }
    }

    /// Enumerate matching combinations depth first, pruning at the deepest
    /// table each condition mentions.
    fn collect_matches(
        query: &DatabaseQuery,
        rows: &[Vec<(SlotId, StoredRow)>],
        current: &mut Vec<usize>,
        out: &mut Vec<RowRef>,
        stop_at: Option<usize>,
    ) -> Result<(), DbError> {
        if stop_at.map(|n| out.len() >= n).unwrap_or(false) {
            return Ok(());
        }
        let depth = current.len();
        if depth == rows.len() {
            out.push(
                current
                    .iter()
                    .enumerate()
                    .map(|(t, i)| (rows[t][*i].0, rows[t][*i].1.version))
                    .collect(),
            );
            return Ok(());
        }
        'rows: for (i, (_, stored)) in rows[depth].iter().enumerate() {
            for cond in query.singles.iter().filter(|c| c.handled && c.table == depth) {
                if !Self::check_single(query, cond, &stored.record)? {
                    continue 'rows;
                }
            }
            for cond in query
                .joins
                .iter()
                .filter(|c| c.handled && c.table1.max(c.table2) == depth)
            {
                let other = other_table(cond, depth);
                let other_row = &rows[other][current[other]].1.record;
                let ok = if cond.table1 == depth {
                    Self::check_join(cond, &stored.record, other_row)?
                } else {
                    Self::check_join(cond, other_row, &stored.record)?
                };
                if !ok {
                    continue 'rows;
                }
            }
            current.push(i);
            Self::collect_matches(query, rows, current, out, stop_at)?;
            current.pop();
        }
        Ok(())
    }

    fn project(query: &DatabaseQuery, table: usize, record: &Record, fase: Fase) -> Record {
        let ids = query.tables[table].column_ids_with(fase);
        Record::from_cells(
            ids.into_iter()
                .filter_map(|id| record.get(id).map(|f| (id, f.clone()))),
        )
    }
}

fn other_table(cond: &JoinCondition, depth: usize) -> usize {
    if cond.table1 == depth {
        cond.table2
    } else {
        cond.table1
    }
}

impl TransactionDriver for MemDriver {
    fn description(&self) -> &DriverDescription {
        &self.desc
    }

    fn execute_insert(&mut self, query: &DatabaseQuery, record: &Record) -> Result<(), DbError> {
        if !self.desc.supports_data_modify {
            return Err(DbError::TransReadOnly(String::from(
                "memstore driver is read only",
            )));
        }
        let table = query
            .tables
            .first()
            .ok_or(DbError::MustBeOneTable)?;
        self.sm.insert(&table.name, record.clone())?;
        Ok(())
    }

    fn open_cursor(&mut self, query: &mut DatabaseQuery, cursortype: CursorType) -> Result<CursorId, DbError> {
        StoreStats::bump(&self.sm.stats().cursors_opened, 1);
        if self.handle_conditions {
            for cond in query.singles.iter_mut() {
                if cond.op == RelOp::In {
                    let n = query.values.get(cond.value)?.list()?.len();
                    StoreStats::bump(&self.sm.stats().in_values, n);
                }
                cond.handled = true;
            }
            for cond in query.joins.iter_mut() {
                cond.handled = cond.op == RelOp::Equal;
            }
        }
        let mut rows = Vec::with_capacity(query.tables.len());
        for table in query.tables.iter() {
            rows.push(self.sm.scan(&table.name)?);
        }
        let all_handled = query.singles.iter().all(|c| c.handled) && query.joins.iter().all(|c| c.handled);
        let stop_at = if all_handled && self.desc.supports_limit {
            query.limit
        } else {
            None
        };
        let mut matches = Vec::new();
        Self::collect_matches(query, &rows, &mut Vec::new(), &mut matches, stop_at)?;
        let id = self.next_cursor;
        self.next_cursor += 1;
        debug!(
            "memstore opened cursor {} over {} tables with {} matches",
            id,
            query.tables.len(),
            matches.len()
        );
        self.cursors.insert(
            id,
            MemCursor {
                query: query.clone(),
                cursortype,
                matches,
                pos: 0,
                block: Vec::new(),
                locked: HashSet::new(),
            },
        );
        Ok(id)
    }

    fn retrieve_next_block(&mut self, id: CursorId, recarr: &mut Vec<Record>) -> Result<usize, DbError> {
        let sm = self.sm.clone();
        let blocks = self.desc.supports_block_cursors;
        let cursor = self.cursor_mut(id)?;
        let max = match cursor.query.max_block_size {
            0 => DEFAULT_BLOCK_SIZE,
            n => n,
        };
        let max = if blocks { max } else { 1 };
        recarr.clear();
        cursor.block.clear();
        cursor.locked.clear();
        while cursor.block.len() < max && cursor.pos < cursor.matches.len() {
            let rowref = cursor.matches[cursor.pos].clone();
            cursor.pos += 1;
            let mut records = Vec::with_capacity(rowref.len());
            for (t, (slot, _)) in rowref.iter().enumerate() {
                match sm.get(&cursor.query.tables[t].name, *slot)? {
                    Some(stored) => {
                        records.push(Self::project(&cursor.query, t, &stored.record, Fase::FASE1))
                    }
                    None => break,
                }
            }
            if records.len() == rowref.len() {
                recarr.extend(records);
                cursor.block.push(rowref);
            }
        }
        if !cursor.block.is_empty() {
            StoreStats::bump(&sm.stats().blocks_served, 1);
        }
        Ok(cursor.block.len())
    }

    fn retrieve_fase2_records(
        &mut self,
        id: CursorId,
        recarr: &mut [Record],
        rows: &[usize],
        _is_last_fase2_req_for_block: bool,
    ) -> Result<(), DbError> {
        let sm = self.sm.clone();
        let cursor = self.cursor_mut(id)?;
        let n = cursor.query.tables.len();
        for row in rows {
            let rowref = cursor.row(*row)?;
            for (t, (slot, _)) in rowref.iter().enumerate() {
                if let Some(stored) = sm.get(&cursor.query.tables[t].name, *slot)? {
                    let extra = Self::project(&cursor.query, t, &stored.record, Fase::FASE2);
                    if let Some(target) = recarr.get_mut(row * n + t) {
                        target.merge_from(&extra);
                    }
                }
            }
        }
        StoreStats::bump(&sm.stats().fase2_rows, rows.len());
        Ok(())
    }

    fn lock_row(&mut self, id: CursorId, recarr: &mut [Record], row: usize) -> Result<LockResult, DbError> {
        let sm = self.sm.clone();
        StoreStats::bump(&sm.stats().locks, 1);
        let cursor = self.cursor_mut(id)?;
        let n = cursor.query.tables.len();
        let rowref = cursor.row(row)?.clone();
        let mut result = LockResult::Unchanged;
        let mut refreshed = rowref.clone();
        for (t, (slot, version)) in rowref.iter().enumerate() {
            match sm.get(&cursor.query.tables[t].name, *slot)? {
                None => return Ok(LockResult::Removed),
                Some(stored) if stored.version != *version => {
                    let record = Self::project(
                        &cursor.query,
                        t,
                        &stored.record,
                        Fase::FASE1 | Fase::FASE2,
                    );
                    if let Some(target) = recarr.get_mut(row * n + t) {
                        *target = record;
                    }
                    refreshed[t].1 = stored.version;
                    result = LockResult::Changed;
                }
                Some(_) => {}
            }
        }
        cursor.block[row] = refreshed;
        cursor.locked.insert(row);
        Ok(result)
    }

    fn unlock_row(&mut self, id: CursorId, row: usize) -> Result<(), DbError> {
        self.cursor_mut(id)?.locked.remove(&row);
        Ok(())
    }

    fn delete_record(&mut self, id: CursorId, row: usize) -> Result<(), DbError> {
        let sm = self.sm.clone();
        let cursor = self.cursor_mut(id)?;
        if cursor.cursortype == CursorType::Select {
            return Err(DbError::DatabaseException(String::from(
                "cannot delete through a select cursor",
            )));
        }
        let (slot, _) = cursor.row(row)?[0];
        if !sm.delete(&cursor.query.tables[0].name, slot)? {
            warn!("memstore delete of vanished row {}", slot);
        }
        Ok(())
    }

    fn update_record(
        &mut self,
        id: CursorId,
        row: usize,
        newfields: &Record,
        updated: &[ColumnId],
    ) -> Result<(), DbError> {
        let sm = self.sm.clone();
        let cursor = self.cursor_mut(id)?;
        if cursor.cursortype == CursorType::Select {
            return Err(DbError::DatabaseException(String::from(
                "cannot update through a select cursor",
            )));
        }
        let (slot, _) = cursor.row(row)?[0];
        let table = &cursor.query.tables[0];
        // Written columns the engine stripped because they hold the null default.
        let cleared: Vec<ColumnId> = updated
            .iter()
            .copied()
            .filter(|id| !newfields.contains(*id))
            .collect();
        sm.update(&table.name, slot, newfields, &cleared)?;
        let version = sm
            .get(&table.name, slot)?
            .map(|r| r.version)
            .unwrap_or_default();
        cursor.block[row][0].1 = version;
        Ok(())
    }

    fn close_cursor(&mut self, id: CursorId) -> Result<(), DbError> {
        match self.cursors.remove(&id) {
            Some(_) => {
                StoreStats::bump(&self.sm.stats().cursors_closed, 1);
                debug!("memstore closed cursor {}", id);
                Ok(())
            }
            None => Err(DbError::DatabaseException(format!("cursor {} is not open", id))),
        }
    }
}

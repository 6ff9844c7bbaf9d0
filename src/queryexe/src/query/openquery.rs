use super::nulls;
use super::subquery::SubQuery;
use super::translate_and_validate::{QueryDefinition, SourceBinding, TranslateAndValidate};
use crate::config::EngineConfig;
use common::driver::{lock_driver, DriverDescription, LockResult};
use common::ids::TransactionId;
use common::query::{CursorType, Fase, JoinCondition, SingleCondition, TableSource};
use common::{DbError, Record};
use std::sync::Arc;
use txn_manager::TransactionRegistry;

/// What the caller has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Evaluate the caller's own predicate on the current row and report it.
    Fase1,
    /// A matching row with all its columns is ready.
    Fase2,
    /// No rows are left.
    Terminate,
}

impl Action {
    /// Numeric code handed to host bindings.
    pub fn code(&self) -> u8 {
        match self {
            Action::Fase1 => 0,
            Action::Fase2 => 1,
            Action::Terminate => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    /// Positioned on a candidate row.
    Evaluating,
    /// Fase1 handed out, waiting for the caller's verdict.
    AwaitingFase1,
    /// The verdict on the current row is known.
    Judged,
    /// Queued rows need their fase-2 columns.
    Promoting,
    /// Fase2 handed out for `matchingrows[fase2_pos]`.
    AwaitingFase2Consumption,
    Advancing,
    Done,
}

enum Step {
    Next(State),
    Yield(State, Action),
}

/// A join between tables of two different subqueries, checked by the engine.
struct RemainingJoin {
    cond: JoinCondition,
    sq1: usize,
    t1: usize,
    sq2: usize,
    t2: usize,
    /// The higher of the two subquery indices.
    level: usize,
}

/// Assign every source the lowest index of the sources it is transitively
/// joined to.
///
/// # Arguments
///
/// * `count` - Number of sources.
/// * `edges` - Pairs of joined source indices.
pub fn partition_sources(count: usize, edges: &[(usize, usize)]) -> Vec<usize> {
    let mut partition: Vec<usize> = (0..count).collect();
    loop {
        let mut changed = false;
        for (a, b) in edges.iter() {
            if *a >= count || *b >= count {
                continue;
            }
            let low = partition[*a].min(partition[*b]);
            if partition[*a] != low || partition[*b] != low {
                partition[*a] = low;
                partition[*b] = low;
                changed = true;
            }
        }
        // With two sources a single pass reaches the fixed point.
        if !changed || count <= 2 {
            break;
        }
    }
    partition
}

/// Executes one query over any number of subqueries.
///
/// The first subquery streams; every other one is read into memory when the
/// query is opened and enumerated as the inner loops of a nested join.
pub struct OpenQuery {
    registry: Arc<TransactionRegistry>,
    cursortype: CursorType,
    config: EngineConfig,
    subqueries: Vec<SubQuery>,
    remaining: Vec<RemainingJoin>,
    /// Subquery and local table index of every source.
    table_map: Vec<(usize, usize)>,
    state: State,
    limit: Option<usize>,
    limitcounter: usize,
    use_fase1: bool,
    use_blocks: bool,
    fase2needslock: bool,
    locked: bool,
    evaluated_where_ok: bool,
    /// Accepted rows of the current block of the first subquery.
    matchingrows: Vec<usize>,
    fase2_pos: usize,
    closed: bool,
}

impl OpenQuery {
    /// Create a query that is opened later with `open`.
    ///
    /// # Arguments
    ///
    /// * `registry` - Registry resolving the transactions of driver sources.
    /// * `cursortype` - Kind of cursor.
    /// * `config` - Engine settings.
    pub fn new(registry: Arc<TransactionRegistry>, cursortype: CursorType, config: EngineConfig) -> Self {
        OpenQuery {
            registry,
            cursortype,
            config,
            subqueries: Vec::new(),
            remaining: Vec::new(),
            table_map: Vec::new(),
            state: State::Uninitialized,
            limit: None,
            limitcounter: 0,
            use_fase1: false,
            use_blocks: false,
            fase2needslock: false,
            locked: false,
            evaluated_where_ok: false,
            matchingrows: Vec::new(),
            fase2_pos: 0,
            closed: false,
        }
    }

    /// Validate the definition, distribute it over subqueries and open them.
    pub fn open(&mut self, def: QueryDefinition) -> Result<(), DbError> {
        if self.state != State::Uninitialized {
            return Err(DbError::InternalError(String::from("query opened twice")));
        }
        TranslateAndValidate::validate(&def, self.cursortype, &self.registry)?;
        let edges: Vec<(usize, usize)> = def.joins.iter().map(|j| (j.table1, j.table2)).collect();
        let partitions = partition_sources(def.sources.len(), &edges);
        debug!("join partitions of {} sources: {:?}", def.sources.len(), partitions);

        let limit = def.limit;
        let limit_blocksize = def.limit_blocksize;
        self.use_fase1 = def.has_fase1_hscode;
        let locking = self.distribute(def, &partitions)?;
        self.distribution_finished()?;

        let single_driver = self.subqueries.len() == 1 && self.subqueries[0].is_driver_bound();
        let desc = self.subqueries[0].description().clone();
        self.fase2needslock = locking;
        self.use_blocks = single_driver && desc.supports_block_cursors && !limit_blocksize && !locking;
        self.limit = limit;
        let push_limit = single_driver
            && desc.supports_limit
            && self.config.limit_in_driver
            && !self.use_fase1
            && !locking;
        let max_block_size = self.config.max_block_size;
        for (i, sq) in self.subqueries.iter_mut().enumerate() {
            sq.query.max_block_size = if i == 0 && (limit_blocksize || locking) {
                1
            } else {
                max_block_size
            };
        }
        if push_limit {
            self.subqueries[0].query.limit = limit;
        }
        info!(
            "opening {:?} query: {} subqueries, {} remaining joins, blocks {}, locking {}",
            self.cursortype,
            self.subqueries.len(),
            self.remaining.len(),
            self.use_blocks,
            locking
        );
        self.state = self.initialize_query()?;
        Ok(())
    }

    fn description_of(&self, tid: TransactionId) -> Result<DriverDescription, DbError> {
        let slot = self.registry.get(tid)?;
        let driver = lock_driver(&slot)?;
        Ok(driver.description().clone())
    }

    /// Place sources and conditions into subqueries. Returns whether rows
    /// must be locked and rechecked.
    fn distribute(&mut self, def: QueryDefinition, partitions: &[usize]) -> Result<bool, DbError> {
        let QueryDefinition {
            sources,
            singles,
            joins,
            values,
            ..
        } = def;

        for (i, source) in sources.into_iter().enumerate() {
            let partition = partitions[i];
            let mut table = TableSource::new(&source.name, Arc::clone(&source.typeinfo));
            for (column, fase) in source.fases.iter() {
                table.set_fase(*column, *fase);
            }
            let sq = match source.binding {
                SourceBinding::Records(records) => {
                    self.subqueries
                        .push(SubQuery::new_records(records, self.cursortype, partition));
                    self.subqueries.len() - 1
                }
                SourceBinding::Transaction(tid) => {
                    let existing = self.subqueries.iter().position(|sq| {
                        let max = sq.description().max_joined_tables;
                        sq.tid() == Some(tid)
                            && sq.partition == partition
                            && (max == 0 || sq.table_count() < max)
                    });
                    match existing {
                        Some(sq) => sq,
                        None => {
                            let desc = self.description_of(tid)?;
                            self.subqueries.push(SubQuery::new_driver(
                                Arc::clone(&self.registry),
                                tid,
                                desc,
                                self.cursortype,
                                partition,
                            ));
                            self.subqueries.len() - 1
                        }
                    }
                }
            };
            let local = self.subqueries[sq].add_table(table);
            self.table_map.push((sq, local));
        }
        debug!("distributed sources over subqueries: {:?}", self.table_map);

        let locking = self.cursortype != CursorType::Select
            && self.subqueries.len() == 1
            && self.subqueries[0].is_driver_bound()
            && self.subqueries[0].description().needs_locking_and_recheck;
        let condition_fase = if locking {
            Fase::FASE1 | Fase::RECHECK
        } else {
            Fase::FASE1
        };

        for cond in singles.into_iter() {
            let (sq, local) = self.table_map[cond.table];
            let query = &mut self.subqueries[sq].query;
            let value = query.values.alloc(values.get(cond.value)?.clone());
            query.tables[local].add_fase(cond.column, condition_fase);
            query.singles.push(SingleCondition {
                table: local,
                value,
                ..cond
            });
        }

        for cond in joins.into_iter() {
            let (sq1, t1) = self.table_map[cond.table1];
            let (sq2, t2) = self.table_map[cond.table2];
            if sq1 == sq2 {
                let query = &mut self.subqueries[sq1].query;
                query.tables[t1].add_fase(cond.column1, condition_fase);
                query.tables[t2].add_fase(cond.column2, condition_fase);
                query.joins.push(JoinCondition {
                    table1: t1,
                    table2: t2,
                    ..cond
                });
            } else {
                self.subqueries[sq1].query.tables[t1].add_fase(cond.column1, Fase::FASE1);
                self.subqueries[sq2].query.tables[t2].add_fase(cond.column2, Fase::FASE1);
                self.remaining.push(RemainingJoin {
                    cond,
                    sq1,
                    t1,
                    sq2,
                    t2,
                    level: sq1.max(sq2),
                });
            }
        }
        self.remaining.sort_by_key(|j| j.level);
        Ok(locking)
    }

    fn distribution_finished(&mut self) -> Result<(), DbError> {
        let part_size = self.config.in_part_size;
        for sq in self.subqueries.iter_mut() {
            sq.partition_in_conditions(part_size)?;
        }
        Ok(())
    }

    /// Open every subquery, cache the inner ones and position on the first
    /// joined row.
    fn initialize_query(&mut self) -> Result<State, DbError> {
        for sq in self.subqueries.iter_mut() {
            sq.open()?;
        }
        for sq in self.subqueries.iter_mut().skip(1) {
            sq.read_and_cache()?;
        }
        if self.subqueries[0].retrieve_next_block()? == 0 {
            debug!("first subquery is empty");
            return Ok(State::Done);
        }
        for sq in self.subqueries.iter_mut().skip(1) {
            if !sq.rewind()? {
                debug!("subquery of partition {} is empty", sq.partition);
                return Ok(State::Done);
            }
        }
        if let Some(level) = self.first_failing_join()? {
            if !self.advance_cursor(level)? {
                return Ok(State::Done);
            }
        }
        Ok(State::Evaluating)
    }

    /// Lowest level whose remaining join fails on the current combination.
    fn first_failing_join(&self) -> Result<Option<usize>, DbError> {
        for join in self.remaining.iter() {
            let a = &self.subqueries[join.sq1];
            let b = &self.subqueries[join.sq2];
            let ok = nulls::satisfies_join_with_nulls(
                &join.cond,
                &a.query.tables[join.t1],
                &a.query.values,
                a.current_record(join.t1)?,
                &b.query.tables[join.t2],
                &b.query.values,
                b.current_record(join.t2)?,
            )?;
            if !ok {
                return Ok(Some(join.level));
            }
        }
        Ok(None)
    }

    /// Move to the next combination satisfying every remaining join,
    /// starting at subquery `level`. Subqueries above the one that moved
    /// are rewound. Returns false once the first subquery is exhausted.
    fn advance_cursor(&mut self, mut level: usize) -> Result<bool, DbError> {
        loop {
            loop {
                let moved = if level == 0 {
                    self.subqueries[0].advance()?
                } else {
                    self.subqueries[level].advance_cursor_within_block()?
                };
                if moved {
                    break;
                }
                if level == 0 {
                    return Ok(false);
                }
                level -= 1;
            }
            for sq in self.subqueries.iter_mut().skip(level + 1) {
                if !sq.rewind()? {
                    return Ok(false);
                }
            }
            match self.first_failing_join()? {
                None => return Ok(true),
                Some(failing) => level = failing,
            }
        }
    }

    fn limit_reached(&self) -> bool {
        self.limit.map(|l| self.limitcounter >= l).unwrap_or(false)
    }

    fn release_lock(&mut self) -> Result<(), DbError> {
        if self.locked {
            self.locked = false;
            self.subqueries[0].unlock_row()?;
        }
        Ok(())
    }

    /// Advance the query to the next point where the caller has to act.
    pub fn get_next_action(&mut self) -> Result<Action, DbError> {
        loop {
            let step = match self.state {
                State::Uninitialized => {
                    return Err(DbError::InternalError(String::from("query is not open")))
                }
                State::Evaluating => self.evaluate(),
                // Fase1 without a reported verdict rejects the row.
                State::AwaitingFase1 => Step::Next(State::Judged),
                State::Judged => self.judge()?,
                State::Promoting => self.promote()?,
                State::AwaitingFase2Consumption => self.consumed()?,
                State::Advancing => self.advance()?,
                State::Done => {
                    self.release_lock()?;
                    Step::Yield(State::Done, Action::Terminate)
                }
            };
            match step {
                Step::Next(state) => self.state = state,
                Step::Yield(state, action) => {
                    self.state = state;
                    trace!("query yields {:?}", action);
                    return Ok(action);
                }
            }
        }
    }

    fn evaluate(&mut self) -> Step {
        if self.limit_reached() {
            return Step::Next(State::Done);
        }
        if self.use_fase1 {
            self.evaluated_where_ok = false;
            Step::Yield(State::AwaitingFase1, Action::Fase1)
        } else {
            self.evaluated_where_ok = true;
            Step::Next(State::Judged)
        }
    }

    fn judge(&mut self) -> Result<Step, DbError> {
        if !self.evaluated_where_ok {
            self.release_lock()?;
            return Ok(Step::Next(State::Advancing));
        }
        if self.fase2needslock && !self.locked {
            match self.subqueries[0].lock_row()? {
                LockResult::Unchanged => self.locked = true,
                LockResult::Changed => {
                    self.locked = true;
                    if self.subqueries[0].is_current_row_invalid(true)? {
                        debug!("row changed under lock and no longer matches");
                        self.release_lock()?;
                        return Ok(Step::Next(State::Advancing));
                    }
                    if self.use_fase1 {
                        self.evaluated_where_ok = false;
                        return Ok(Step::Yield(State::AwaitingFase1, Action::Fase1));
                    }
                }
                LockResult::Removed => {
                    debug!("row removed before it could be locked");
                    return Ok(Step::Next(State::Advancing));
                }
            }
        }
        self.matchingrows.push(self.subqueries[0].current_row());
        self.limitcounter += 1;
        if !self.use_blocks || self.limit_reached() {
            Ok(Step::Next(State::Promoting))
        } else {
            Ok(Step::Next(State::Advancing))
        }
    }

    fn promote(&mut self) -> Result<Step, DbError> {
        if self.matchingrows.is_empty() {
            return Ok(Step::Next(State::Advancing));
        }
        self.subqueries[0].retrieve_fase2_records(&self.matchingrows, true)?;
        self.fase2_pos = 0;
        Ok(Step::Yield(State::AwaitingFase2Consumption, Action::Fase2))
    }

    fn consumed(&mut self) -> Result<Step, DbError> {
        self.release_lock()?;
        self.fase2_pos += 1;
        if self.fase2_pos < self.matchingrows.len() {
            return Ok(Step::Yield(State::AwaitingFase2Consumption, Action::Fase2));
        }
        self.matchingrows.clear();
        self.fase2_pos = 0;
        if self.limit_reached() {
            Ok(Step::Next(State::Done))
        } else {
            Ok(Step::Next(State::Advancing))
        }
    }

    fn advance(&mut self) -> Result<Step, DbError> {
        if self.use_blocks && !self.matchingrows.is_empty() {
            return if self.subqueries[0].advance_cursor_within_block()? {
                Ok(Step::Next(State::Evaluating))
            } else {
                Ok(Step::Next(State::Promoting))
            };
        }
        let last = self.subqueries.len() - 1;
        if self.advance_cursor(last)? {
            Ok(Step::Next(State::Evaluating))
        } else {
            Ok(Step::Next(State::Done))
        }
    }

    /// Report the caller's fase-1 verdict on the current row.
    pub fn report_where_result(&mut self, ok: bool) -> Result<(), DbError> {
        if self.state != State::AwaitingFase1 {
            return Err(DbError::InternalError(String::from(
                "where result reported outside of fase 1",
            )));
        }
        self.evaluated_where_ok = ok;
        Ok(())
    }

    fn locate(&self, table: usize) -> Result<(usize, usize), DbError> {
        self.table_map.get(table).copied().ok_or_else(|| {
            DbError::InternalError(format!("query has no table #{}", table))
        })
    }

    /// The record of a table at the row the caller is acting on.
    pub fn get_record(&self, table: usize) -> Result<&Record, DbError> {
        let (sq, local) = self.locate(table)?;
        match self.state {
            State::AwaitingFase1 => self.subqueries[sq].current_record(local),
            State::AwaitingFase2Consumption if sq == 0 => {
                self.subqueries[0].record_at(self.matchingrows[self.fase2_pos], local)
            }
            State::AwaitingFase2Consumption => self.subqueries[sq].current_record(local),
            _ => Err(DbError::InternalError(String::from(
                "no current record outside of fase 1 or fase 2",
            ))),
        }
    }

    fn mutation_row(&self) -> Result<usize, DbError> {
        if self.cursortype == CursorType::Select {
            return Err(DbError::InternalError(String::from(
                "cannot modify rows through a select cursor",
            )));
        }
        if self.state != State::AwaitingFase2Consumption {
            return Err(DbError::InternalError(String::from(
                "rows can only be modified during fase 2",
            )));
        }
        Ok(self.matchingrows[self.fase2_pos])
    }

    /// Delete the row handed out with the last Fase2.
    pub fn delete_row(&mut self) -> Result<(), DbError> {
        let row = self.mutation_row()?;
        self.subqueries[0].delete_row(row)?;
        self.locked = false;
        Ok(())
    }

    /// Update the row handed out with the last Fase2.
    pub fn update_row(&mut self, fields: &Record) -> Result<(), DbError> {
        let row = self.mutation_row()?;
        self.subqueries[0].update_row(row, fields)?;
        self.locked = false;
        Ok(())
    }

    /// Take back the record array behind a source, with deleted rows removed.
    pub fn get_result_array_source(&mut self, table: usize) -> Result<Vec<Record>, DbError> {
        let (sq, _) = self.locate(table)?;
        self.subqueries[sq].get_result_array_source()
    }

    pub fn subquery_count(&self) -> usize {
        self.subqueries.len()
    }

    pub fn uses_blocks(&self) -> bool {
        self.use_blocks
    }

    /// Release the lock, close every subquery and free their scratch values.
    /// Returns the first error met; all subqueries are closed regardless.
    pub fn close(&mut self) -> Result<(), DbError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut result = if self.subqueries.is_empty() {
            Ok(())
        } else {
            self.release_lock()
        };
        for sq in self.subqueries.iter_mut() {
            let closed = sq.close();
            if result.is_ok() {
                result = closed;
            }
        }
        self.state = State::Done;
        result
    }
}

impl Drop for OpenQuery {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing abandoned query: {}", e);
        }
    }
}

use super::nulls;
use super::openquery::{Action, OpenQuery};
use super::translate_and_validate::QueryDefinition;
use crate::config::EngineConfig;
use common::driver::lock_driver;
use common::ids::{QueryHandle, TransactionId};
use common::query::{CursorType, DatabaseQuery, TableSource};
use common::schema::DbTypeInfo;
use common::{DbError, Record};
use std::collections::HashMap;
use std::sync::Arc;
use txn_manager::TransactionRegistry;

/// The cursor protocol a host binding drives: open a query, ask for the next
/// action, read records, report verdicts and mutate rows, all by handle.
pub struct Executor {
    registry: Arc<TransactionRegistry>,
    config: EngineConfig,
    queries: HashMap<QueryHandle, OpenQuery>,
    next_handle: QueryHandle,
}

impl Executor {
    /// Initializes an executor.
    ///
    /// # Arguments
    ///
    /// * `registry` - Transactions the queries of this executor may use.
    /// * `config` - Engine settings handed to every query.
    pub fn new(registry: Arc<TransactionRegistry>, config: EngineConfig) -> Self {
        Executor {
            registry,
            config,
            queries: HashMap::new(),
            next_handle: 1,
        }
    }

    fn query(&mut self, handle: QueryHandle) -> Result<&mut OpenQuery, DbError> {
        self.queries
            .get_mut(&handle)
            .ok_or_else(|| DbError::InvalidTransaction(format!("query {} does not exist", handle)))
    }

    /// Open a query and return its handle.
    ///
    /// # Arguments
    ///
    /// * `def` - Sources, conditions and options of the query.
    /// * `cursortype` - Kind of cursor.
    pub fn open_cursor2(&mut self, def: QueryDefinition, cursortype: CursorType) -> Result<QueryHandle, DbError> {
        let mut query = OpenQuery::new(Arc::clone(&self.registry), cursortype, self.config.clone());
        query.open(def)?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.queries.insert(handle, query);
        debug!("opened query {}", handle);
        Ok(handle)
    }

    pub fn get_action(&mut self, handle: QueryHandle) -> Result<Action, DbError> {
        self.query(handle)?.get_next_action()
    }

    /// Copy of the record of a table at the current row.
    pub fn get_record(&mut self, handle: QueryHandle, table: usize) -> Result<Record, DbError> {
        Ok(self.query(handle)?.get_record(table)?.clone())
    }

    pub fn report_where_result(&mut self, handle: QueryHandle, ok: bool) -> Result<(), DbError> {
        self.query(handle)?.report_where_result(ok)
    }

    pub fn delete_record(&mut self, handle: QueryHandle) -> Result<(), DbError> {
        self.query(handle)?.delete_row()
    }

    pub fn update_record(&mut self, handle: QueryHandle, fields: &Record) -> Result<(), DbError> {
        self.query(handle)?.update_row(fields)
    }

    /// Close a query and forget its handle.
    pub fn close_query(&mut self, handle: QueryHandle) -> Result<(), DbError> {
        let mut query = self
            .queries
            .remove(&handle)
            .ok_or_else(|| DbError::InvalidTransaction(format!("query {} does not exist", handle)))?;
        debug!("closing query {}", handle);
        query.close()
    }

    /// The record array behind the first source, with deletions applied.
    pub fn get_array_results(&mut self, handle: QueryHandle) -> Result<Vec<Record>, DbError> {
        self.query(handle)?.get_result_array_source(0)
    }

    /// Number of queries still open.
    pub fn open_queries(&self) -> usize {
        self.queries.len()
    }

    /// Insert records into a table of a transaction.
    ///
    /// Cells holding their column's null default are stripped for drivers
    /// that store NULLs, omitted scalar columns are zero-filled for drivers
    /// that need every column, and batches are cut to the driver's
    /// multi-row insert size.
    ///
    /// # Arguments
    ///
    /// * `tid` - Transaction to insert through.
    /// * `table` - Name of the table.
    /// * `typeinfo` - Schema of the table.
    /// * `records` - Rows to insert.
    pub fn insert_records(
        &self,
        tid: TransactionId,
        table: &str,
        typeinfo: Arc<DbTypeInfo>,
        records: &[Record],
    ) -> Result<usize, DbError> {
        let slot = self.registry.get(tid)?;
        let mut driver = lock_driver(&slot)?;
        let desc = driver.description().clone();
        if !desc.supports_data_modify {
            return Err(DbError::TransReadOnly(format!(
                "cannot insert into {} through a read-only transaction",
                table
            )));
        }
        let mut query = DatabaseQuery::new();
        let mut source = TableSource::new(table, typeinfo);
        if desc.needs_uppercase_names {
            source.uppercase_names();
        }
        nulls::init_null_handling(&mut source, &mut query.values)?;
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let mut record = record.clone();
            if desc.supports_nulls {
                nulls::delete_null_defaults(&source, &query.values, &mut record)?;
            }
            if desc.add_missing_default_columns {
                nulls::add_missing_default_columns(&source, &mut record, desc.supports_nulls);
            }
            prepared.push(record);
        }
        query.tables.push(source);

        let chunk = match desc.max_multiinsertrows {
            0 => prepared.len().max(1),
            n => n,
        };
        let mut result = Ok(());
        for batch in prepared.chunks(chunk) {
            result = driver.execute_inserts(&query, batch);
            if result.is_err() {
                break;
            }
        }
        nulls::free_null_defaults(&mut query.tables[0], &mut query.values)?;
        result?;
        debug!("inserted {} records into {}", prepared.len(), table);
        Ok(prepared.len())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if !self.queries.is_empty() {
            info!("closing {} queries left open", self.queries.len());
        }
        for (handle, mut query) in self.queries.drain() {
            if let Err(e) = query.close() {
                warn!("error closing query {}: {}", handle, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::translate_and_validate::QuerySource;
    use common::driver::DriverDescription;
    use common::query::RelOp;
    use common::schema::{Column, ColumnFlags};
    use common::testutil::*;
    use common::vars::Var;
    use common::{DataType, Field};
    use memstore::storage_manager::StoreStats;
    use memstore::{MemDriver, StorageManager};

    fn people() -> Arc<DbTypeInfo> {
        Arc::new(DbTypeInfo::new(vec![
            Column::new(0, "id", DataType::Int).with_flags(ColumnFlags::KEY),
            Column::new(1, "name", DataType::String)
                .with_null_default(&Field::StringField(String::from("n/a")))
                .unwrap(),
            Column::new(2, "score", DataType::Int),
        ]))
    }

    fn setup(desc: DriverDescription) -> (Executor, StorageManager, TransactionId) {
        init();
        let sm = StorageManager::new_test_sm();
        sm.create_table("people").unwrap();
        let registry = TransactionRegistry::new_shared();
        let tid = registry
            .register(Box::new(MemDriver::new(sm.clone(), desc)))
            .unwrap();
        (Executor::new(registry, EngineConfig::default()), sm, tid)
    }

    fn person(id: i64, name: &str) -> Record {
        Record::from_cells(vec![
            (0, Field::IntField(id)),
            (1, Field::StringField(name.to_string())),
        ])
    }

    #[test]
    fn test_null_round_trip() {
        let (mut exec, sm, tid) = setup(MemDriver::full_description());
        let n = exec
            .insert_records(tid, "people", people(), &[person(1, "n/a"), person(2, "bo")])
            .unwrap();
        assert_eq!(n, 2);
        let stored = sm.records("people").unwrap();
        assert!(!stored[0].contains(1));
        assert!(stored[1].contains(1));

        let mut def = QueryDefinition::new();
        def.add_source(QuerySource::transaction("people", people(), tid));
        let h = exec.open_cursor2(def, CursorType::Select).unwrap();
        let mut names = Vec::new();
        while exec.get_action(h).unwrap() == Action::Fase2 {
            let record = exec.get_record(h, 0).unwrap();
            names.push(record.get(1).and_then(Field::as_str).unwrap().to_string());
        }
        assert_eq!(names, vec!["n/a", "bo"]);
        exec.close_query(h).unwrap();
        assert_eq!(exec.open_queries(), 0);
    }

    #[test]
    fn test_missing_columns_are_zero_filled() {
        let mut desc = MemDriver::full_description();
        desc.add_missing_default_columns = true;
        desc.max_multiinsertrows = 2;
        let (exec, sm, tid) = setup(desc);
        let records: Vec<Record> = (0..5).map(|i| person(i, "n/a")).collect();
        exec.insert_records(tid, "people", people(), &records).unwrap();
        let stored = sm.records("people").unwrap();
        assert_eq!(stored.len(), 5);
        for record in stored {
            assert_eq!(record.get(2), Some(&Field::IntField(0)));
            // Translated columns stay NULL for drivers that support it.
            assert!(!record.contains(1));
        }
    }

    #[test]
    fn test_insert_into_read_only() {
        let (exec, _sm, tid) = setup(DriverDescription::default());
        assert!(matches!(
            exec.insert_records(tid, "people", people(), &[person(1, "x")]),
            Err(DbError::TransReadOnly(_))
        ));
    }

    #[test]
    fn test_unknown_handle() {
        let (mut exec, _sm, _tid) = setup(MemDriver::full_description());
        assert!(matches!(exec.get_action(7), Err(DbError::InvalidTransaction(_))));
        assert!(matches!(exec.close_query(7), Err(DbError::InvalidTransaction(_))));
    }

    #[test]
    fn test_action_codes() {
        assert_eq!(Action::Fase1.code(), 0);
        assert_eq!(Action::Fase2.code(), 1);
        assert_eq!(Action::Terminate.code(), 2);
    }

    #[test]
    fn test_delete_from_array() {
        let (mut exec, _sm, _tid) = setup(MemDriver::full_description());
        let rows = create_record_list((0..6).map(|i| vec![i]).collect());
        let mut def = QueryDefinition::new();
        def.add_source(QuerySource::records("arr", get_int_table_schema(1), rows));
        def.add_single(0, "c0", RelOp::In, Var::List(vec![Field::IntField(1), Field::IntField(4)]))
            .unwrap();
        let h = exec.open_cursor2(def, CursorType::Delete).unwrap();
        while exec.get_action(h).unwrap() != Action::Terminate {
            exec.delete_record(h).unwrap();
        }
        let left = exec.get_array_results(h).unwrap();
        assert_eq!(left, create_record_list(vec![vec![0], vec![2], vec![3], vec![5]]));
        exec.close_query(h).unwrap();
    }

    #[test]
    fn test_delete_cursor_needs_one_table() {
        let (mut exec, _sm, _tid) = setup(MemDriver::full_description());
        let mut def = QueryDefinition::new();
        def.add_source(QuerySource::records("a", get_int_table_schema(1), Vec::new()));
        def.add_source(QuerySource::records("b", get_int_table_schema(1), Vec::new()));
        assert!(matches!(
            exec.open_cursor2(def, CursorType::Delete),
            Err(DbError::MustBeOneTable)
        ));
        assert_eq!(exec.open_queries(), 0);
    }

    #[test]
    fn test_update_through_driver() {
        let (mut exec, sm, tid) = setup(MemDriver::full_description());
        let records: Vec<Record> = (0..3).map(|i| person(i, "x")).collect();
        exec.insert_records(tid, "people", people(), &records).unwrap();
        let mut def = QueryDefinition::new();
        def.add_source(QuerySource::transaction("people", people(), tid));
        def.add_single(0, "ID", RelOp::UnEqual, Var::Scalar(Field::IntField(1)))
            .unwrap();
        let h = exec.open_cursor2(def, CursorType::Update).unwrap();
        while exec.get_action(h).unwrap() == Action::Fase2 {
            let id = exec.get_record(h, 0).unwrap().get(0).and_then(Field::as_int).unwrap();
            exec.update_record(h, &Record::from_cells(vec![(2, Field::IntField(id * 100))]))
                .unwrap();
        }
        exec.close_query(h).unwrap();
        let scores: Vec<Option<i64>> = sm
            .records("people")
            .unwrap()
            .iter()
            .map(|r| r.get(2).and_then(Field::as_int))
            .collect();
        assert_eq!(scores, vec![Some(0), None, Some(200)]);
    }

    #[test]
    fn test_update_to_null_default_stores_null() {
        let (mut exec, sm, tid) = setup(MemDriver::full_description());
        exec.insert_records(tid, "people", people(), &[person(1, "bo"), person(2, "cy")])
            .unwrap();
        let mut def = QueryDefinition::new();
        def.add_source(QuerySource::transaction("people", people(), tid));
        let h = exec.open_cursor2(def, CursorType::Update).unwrap();
        while exec.get_action(h).unwrap() == Action::Fase2 {
            let id = exec.get_record(h, 0).unwrap().get(0).and_then(Field::as_int).unwrap();
            let fields = if id == 1 {
                Record::from_cells(vec![(1, Field::StringField(String::from("n/a")))])
            } else {
                Record::from_cells(vec![(2, Field::IntField(5))])
            };
            exec.update_record(h, &fields).unwrap();
        }
        exec.close_query(h).unwrap();
        let stored = sm.records("people").unwrap();
        assert!(!stored[0].contains(1));
        // Columns the update did not write keep their value.
        assert_eq!(stored[1].get(1), Some(&Field::StringField(String::from("cy"))));

        let mut def = QueryDefinition::new();
        def.add_source(QuerySource::transaction("people", people(), tid));
        let h = exec.open_cursor2(def, CursorType::Select).unwrap();
        assert_eq!(exec.get_action(h).unwrap(), Action::Fase2);
        let record = exec.get_record(h, 0).unwrap();
        assert_eq!(record.get(1), Some(&Field::StringField(String::from("n/a"))));
    }

    #[test]
    fn test_drop_closes_open_queries() {
        let (mut exec, sm, tid) = setup(MemDriver::full_description());
        exec.insert_records(tid, "people", people(), &[person(1, "bo")]).unwrap();
        let mut def = QueryDefinition::new();
        def.add_source(QuerySource::transaction("people", people(), tid));
        let h = exec.open_cursor2(def, CursorType::Select).unwrap();
        assert_eq!(exec.get_action(h).unwrap(), Action::Fase2);
        drop(exec);
        assert_eq!(StoreStats::get(&sm.stats().cursors_closed), 1);
    }
}

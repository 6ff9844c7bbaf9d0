use common::ids::TransactionId;
use common::query::{CursorType, Fase, JoinCondition, RelOp, SingleCondition};
use common::schema::DbTypeInfo;
use common::vars::{Var, VarArena};
use common::{DbError, Record};
use std::sync::Arc;
use txn_manager::TransactionRegistry;

/// What a query source reads from.
#[derive(Debug, Clone)]
pub enum SourceBinding {
    /// A table served by the driver of a registered transaction.
    Transaction(TransactionId),
    /// An in-memory record array.
    Records(Vec<Record>),
}

/// A table as named by the caller.
#[derive(Debug, Clone)]
pub struct QuerySource {
    pub name: String,
    pub typeinfo: Arc<DbTypeInfo>,
    pub binding: SourceBinding,
    /// Fase overrides by column position.
    pub fases: Vec<(usize, Fase)>,
}

impl QuerySource {
    /// A table read through a transaction's driver.
    pub fn transaction(name: &str, typeinfo: Arc<DbTypeInfo>, tid: TransactionId) -> Self {
        QuerySource {
            name: name.to_string(),
            typeinfo,
            binding: SourceBinding::Transaction(tid),
            fases: Vec::new(),
        }
    }

    /// A record array.
    pub fn records(name: &str, typeinfo: Arc<DbTypeInfo>, records: Vec<Record>) -> Self {
        QuerySource {
            name: name.to_string(),
            typeinfo,
            binding: SourceBinding::Records(records),
            fases: Vec::new(),
        }
    }

    /// Override the fase of a column.
    pub fn with_fase(mut self, column: usize, fase: Fase) -> Self {
        self.fases.push((column, fase));
        self
    }
}

/// The whole query as handed to `OpenQuery::open`.
#[derive(Debug, Clone, Default)]
pub struct QueryDefinition {
    pub sources: Vec<QuerySource>,
    /// Conditions refer to sources by their index in `sources`.
    pub singles: Vec<SingleCondition>,
    pub joins: Vec<JoinCondition>,
    pub values: VarArena,
    /// Maximum number of rows; None for unlimited.
    pub limit: Option<usize>,
    /// Fetch rows one at a time instead of in blocks.
    pub limit_blocksize: bool,
    /// The caller evaluates a fase-1 predicate of its own for every row.
    pub has_fase1_hscode: bool,
}

impl QueryDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source and return its table index.
    pub fn add_source(&mut self, source: QuerySource) -> usize {
        self.sources.push(source);
        self.sources.len() - 1
    }

    /// Add a condition comparing a named column with a value.
    ///
    /// # Arguments
    ///
    /// * `table` - Index of the source.
    /// * `column` - Name of the column.
    /// * `op` - Relational operator.
    /// * `value` - Operand; a list for `In`.
    pub fn add_single(
        &mut self,
        table: usize,
        column: &str,
        op: RelOp,
        value: Var,
    ) -> Result<&mut SingleCondition, DbError> {
        let (column, columnid) = TranslateAndValidate::resolve_column(self, table, column)?;
        let value = self.values.alloc(value);
        self.singles.push(SingleCondition {
            table,
            column,
            columnid,
            op,
            value,
            case_sensitive: true,
            match_null: false,
            handled: false,
        });
        let last = self.singles.len() - 1;
        Ok(&mut self.singles[last])
    }

    /// Add a join condition between named columns of two sources.
    pub fn add_join(
        &mut self,
        table1: usize,
        column1: &str,
        op: RelOp,
        table2: usize,
        column2: &str,
    ) -> Result<&mut JoinCondition, DbError> {
        let (column1, columnid1) = TranslateAndValidate::resolve_column(self, table1, column1)?;
        let (column2, columnid2) = TranslateAndValidate::resolve_column(self, table2, column2)?;
        self.joins.push(JoinCondition {
            table1,
            column1,
            columnid1,
            table2,
            column2,
            columnid2,
            op,
            case_sensitive: true,
            match_double_null: false,
            handled: false,
        });
        let last = self.joins.len() - 1;
        Ok(&mut self.joins[last])
    }
}

/// Resolves column names of a query definition and validates it before it
/// is opened.
pub struct TranslateAndValidate;

impl TranslateAndValidate {
    /// Find the position and id of a named column of a source. Names match
    /// case-insensitively.
    ///
    /// # Arguments
    ///
    /// * `def` - Definition holding the source.
    /// * `table` - Index of the source.
    /// * `column` - Display name of the column.
    pub fn resolve_column(def: &QueryDefinition, table: usize, column: &str) -> Result<(usize, u32), DbError> {
        let source = def.sources.get(table).ok_or_else(|| {
            DbError::ValidationError(format!("query has no table #{}", table))
        })?;
        source
            .typeinfo
            .columns()
            .enumerate()
            .find(|(_, c)| c.name.eq_ignore_ascii_case(column))
            .map(|(pos, c)| (pos, c.id))
            .ok_or_else(|| {
                DbError::UnknownColumn(format!(
                    "the field {} is not present in table {}",
                    column, source.name
                ))
            })
    }

    /// Validate a definition for the given cursor type.
    ///
    /// # Arguments
    ///
    /// * `def` - Definition to check.
    /// * `cursortype` - Kind of cursor that will be opened.
    /// * `registry` - Registry the transaction sources must be live in.
    pub fn validate(
        def: &QueryDefinition,
        cursortype: CursorType,
        registry: &TransactionRegistry,
    ) -> Result<(), DbError> {
        if def.sources.is_empty() {
            return Err(DbError::ValidationError(String::from("query has no tables")));
        }
        if cursortype != CursorType::Select && def.sources.len() != 1 {
            return Err(DbError::MustBeOneTable);
        }
        for source in def.sources.iter() {
            if let SourceBinding::Transaction(tid) = &source.binding {
                if !registry.contains(*tid) {
                    return Err(DbError::InvalidTransaction(format!(
                        "table {} is bound to transaction {} which does not exist",
                        source.name, tid
                    )));
                }
            }
            for (column, _) in source.fases.iter() {
                if source.typeinfo.column(*column).is_none() {
                    return Err(DbError::UnknownColumn(format!(
                        "column #{} of table {}",
                        column, source.name
                    )));
                }
            }
        }
        for cond in def.singles.iter() {
            Self::check_column(def, cond.table, cond.column, cond.columnid)?;
            let value = def.values.get(cond.value)?;
            match (cond.op, value) {
                (RelOp::In, Var::Scalar(_)) => {
                    return Err(DbError::ValidationError(String::from(
                        "'in' condition needs a list operand",
                    )))
                }
                (RelOp::In, Var::List(_)) => {}
                (_, Var::List(_)) => {
                    return Err(DbError::ValidationError(format!(
                        "'{}' condition needs a scalar operand",
                        cond.op
                    )))
                }
                _ => {}
            }
        }
        for cond in def.joins.iter() {
            Self::check_column(def, cond.table1, cond.column1, cond.columnid1)?;
            Self::check_column(def, cond.table2, cond.column2, cond.columnid2)?;
            if cond.table1 == cond.table2 {
                return Err(DbError::ValidationError(format!(
                    "join condition relates table #{} to itself",
                    cond.table1
                )));
            }
        }
        Ok(())
    }

    fn check_column(def: &QueryDefinition, table: usize, column: usize, id: u32) -> Result<(), DbError> {
        let source = def.sources.get(table).ok_or_else(|| {
            DbError::ValidationError(format!("condition refers to unknown table #{}", table))
        })?;
        match source.typeinfo.column(column) {
            Some(col) if col.id == id => Ok(()),
            Some(col) => Err(DbError::UnknownColumn(format!(
                "column {} of table {} has id {}, not {}",
                col.name, source.name, col.id, id
            ))),
            None => Err(DbError::UnknownColumn(format!(
                "column #{} of table {}",
                column, source.name
            ))),
        }
    }
}

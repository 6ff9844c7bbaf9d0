use crate::ids::ColumnId;
use crate::schema::{ColumnFlags, DbTypeInfo};
use crate::vars::{VarArena, VarId};
use crate::DbError;
use bitflags::bitflags;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Retrieval phase(s) of a column within one query.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Fase: u8 {
        /// Fetched with the row during the initial scan.
        const FASE1 = 1;
        /// Fetched only for rows that passed fase 1.
        const FASE2 = 2;
        /// Written by the current mutation.
        const UPDATED = 4;
        /// Conditions on this column are re-evaluated after a row lock.
        const RECHECK = 8;
    }
}

impl Fase {
    /// Derives the default fase of a column from its static flags.
    pub fn from_flags(flags: ColumnFlags) -> Self {
        let mut fase = Fase::empty();
        if flags.contains(ColumnFlags::INTERNAL_FASE1) {
            fase |= Fase::FASE1;
        }
        if flags.contains(ColumnFlags::INTERNAL_FASE2) {
            fase |= Fase::FASE2;
        }
        if !fase.intersects(Fase::FASE1 | Fase::FASE2) {
            fase |= Fase::FASE1;
        }
        if flags.contains(ColumnFlags::INTERNAL_UPDATES) {
            fase |= Fase::UPDATED;
        }
        fase
    }
}

/// Kind of cursor being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    Select,
    Delete,
    Update,
}

/// Per-query mutable bookkeeping for one schema column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub fase: Fase,
    /// Storage name as the driver should see it.
    pub dbase_name: String,
    /// Materialized null default; set between null-handling init and release.
    pub nulldefault: Option<VarId>,
}

/// A table as it appears once in a query.
#[derive(Debug, Clone)]
pub struct TableSource {
    pub name: String,
    pub typeinfo: Arc<DbTypeInfo>,
    /// One entry per schema column, in schema order.
    pub columns: Vec<ColumnInfo>,
}

impl TableSource {
    /// Create a new table source with fases derived from the column flags.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the table.
    /// * `typeinfo` - Shared schema of the table.
    pub fn new(name: &str, typeinfo: Arc<DbTypeInfo>) -> Self {
        let columns = typeinfo
            .columns()
            .map(|c| ColumnInfo {
                fase: Fase::from_flags(c.flags),
                dbase_name: c.dbase_name.clone(),
                nulldefault: None,
            })
            .collect();
        Self {
            name: name.to_string(),
            typeinfo,
            columns,
        }
    }

    /// Get the fase of the column at a position.
    pub fn fase(&self, column: usize) -> Fase {
        self.columns
            .get(column)
            .map(|c| c.fase)
            .unwrap_or_else(Fase::empty)
    }

    /// Add fase flags to a column.
    pub fn add_fase(&mut self, column: usize, fase: Fase) {
        if let Some(info) = self.columns.get_mut(column) {
            info.fase |= fase;
        }
    }

    /// Replace the fase of a column.
    pub fn set_fase(&mut self, column: usize, fase: Fase) {
        if let Some(info) = self.columns.get_mut(column) {
            info.fase = fase;
        }
    }

    /// Column ids of every column carrying one of the given fases.
    pub fn column_ids_with(&self, fase: Fase) -> Vec<ColumnId> {
        self.typeinfo
            .columns()
            .zip(self.columns.iter())
            .filter(|(_, info)| info.fase.intersects(fase))
            .map(|(c, _)| c.id)
            .collect()
    }

    /// Uppercase table and storage column names.
    pub fn uppercase_names(&mut self) {
        self.name = self.name.to_uppercase();
        for info in self.columns.iter_mut() {
            info.dbase_name = info.dbase_name.to_uppercase();
        }
    }
}

/// Relational operators usable in conditions.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    Less,
    LessEqual,
    Equal,
    Bigger,
    BiggerEqual,
    UnEqual,
    Like,
    In,
}

impl RelOp {
    /// Maps a three-way comparison result through the operator.
    ///
    /// `Like` and `In` are not ordering predicates and yield an internal error.
    pub fn matches(&self, ord: Ordering) -> Result<bool, DbError> {
        match self {
            RelOp::Less => Ok(ord == Ordering::Less),
            RelOp::LessEqual => Ok(ord != Ordering::Greater),
            RelOp::Equal => Ok(ord == Ordering::Equal),
            RelOp::Bigger => Ok(ord == Ordering::Greater),
            RelOp::BiggerEqual => Ok(ord != Ordering::Less),
            RelOp::UnEqual => Ok(ord != Ordering::Equal),
            RelOp::Like | RelOp::In => Err(DbError::InternalError(format!(
                "operator {} is not an ordering",
                self
            ))),
        }
    }

    /// Flip the operator, for swapping the sides of a join.
    pub fn flip(&self) -> Self {
        match self {
            RelOp::Bigger => RelOp::Less,
            RelOp::Less => RelOp::Bigger,
            RelOp::LessEqual => RelOp::BiggerEqual,
            RelOp::BiggerEqual => RelOp::LessEqual,
            op => *op,
        }
    }
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op_str = match self {
            RelOp::Less => "<",
            RelOp::LessEqual => "<=",
            RelOp::Equal => "=",
            RelOp::Bigger => ">",
            RelOp::BiggerEqual => ">=",
            RelOp::UnEqual => "!=",
            RelOp::Like => "like",
            RelOp::In => "in",
        };
        write!(f, "{}", op_str)
    }
}

/// Condition comparing one column against a value.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleCondition {
    /// Index of the table within the query.
    pub table: usize,
    /// Position of the column within the table's schema.
    pub column: usize,
    pub columnid: ColumnId,
    pub op: RelOp,
    /// Comparison operand; a list for `In`.
    pub value: VarId,
    pub case_sensitive: bool,
    /// A missing (NULL) cell satisfies the condition.
    pub match_null: bool,
    /// Set by a driver that enforces the condition itself.
    pub handled: bool,
}

/// Condition comparing columns of two tables.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinCondition {
    pub table1: usize,
    pub column1: usize,
    pub columnid1: ColumnId,
    pub table2: usize,
    pub column2: usize,
    pub columnid2: ColumnId,
    pub op: RelOp,
    pub case_sensitive: bool,
    /// Two NULL-translated cells compare equal.
    pub match_double_null: bool,
    /// Set by a driver that enforces the condition itself.
    pub handled: bool,
}

/// The query handed to a driver: tables, conditions renumbered to local
/// table indices, and the operand values they refer to.
#[derive(Debug, Clone, Default)]
pub struct DatabaseQuery {
    pub tables: Vec<TableSource>,
    pub singles: Vec<SingleCondition>,
    pub joins: Vec<JoinCondition>,
    pub values: VarArena,
    /// Maximum number of rows to return; None for unlimited.
    pub limit: Option<usize>,
    /// Maximum number of rows per block.
    pub max_block_size: usize,
}

impl DatabaseQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that every condition refers to existing tables and columns.
    pub fn validate(&self) -> Result<(), DbError> {
        for cond in self.singles.iter() {
            self.check_column(cond.table, cond.column, cond.columnid)?;
            self.values.get(cond.value)?;
        }
        for cond in self.joins.iter() {
            self.check_column(cond.table1, cond.column1, cond.columnid1)?;
            self.check_column(cond.table2, cond.column2, cond.columnid2)?;
        }
        Ok(())
    }

    fn check_column(&self, table: usize, column: usize, id: ColumnId) -> Result<(), DbError> {
        let source = self.tables.get(table).ok_or_else(|| {
            DbError::ValidationError(format!("condition refers to unknown table #{}", table))
        })?;
        match source.typeinfo.column(column) {
            Some(col) if col.id == id => Ok(()),
            _ => Err(DbError::UnknownColumn(format!(
                "column #{} (id {}) in table {}",
                column, id, source.name
            ))),
        }
    }
}

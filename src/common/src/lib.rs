#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::io;

pub mod conditions;
pub mod driver;
pub mod ids;
pub mod query;
pub mod schema;
pub mod testutil;
pub mod vars;

pub use ids::ColumnId;
pub use query::{CursorType, DatabaseQuery, Fase, JoinCondition, RelOp, SingleCondition};
pub use schema::{Column, ColumnFlags, DbTypeInfo};

/// Error kinds raised by the query engine and its drivers.
#[derive(Debug, Clone, PartialEq)]
pub enum DbError {
    /// A condition or record access refers to a column absent from the row or schema.
    UnknownColumn(String),
    /// A value could not be used as (or converted to) the type an operation needs.
    CannotConvertType(String),
    /// Mutation attempted through a driver without data modification support.
    TransReadOnly(String),
    /// DELETE/UPDATE cursors must range over exactly one table.
    MustBeOneTable,
    /// The query or transaction id does not exist (anymore).
    InvalidTransaction(String),
    /// Opaque failure reported by a storage driver.
    DatabaseException(String),
    /// Invariant violation inside the engine.
    InternalError(String),
    /// IO Errors.
    IOError(String),
    /// Malformed query definitions.
    ValidationError(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DbError::UnknownColumn(s) => format!("Unknown column: {}", s),
                DbError::CannotConvertType(s) => format!("Cannot convert type: {}", s),
                DbError::TransReadOnly(s) => {
                    format!("Transaction does not allow data modification: {}", s)
                }
                DbError::MustBeOneTable => {
                    String::from("Delete and update cursors must range over one table")
                }
                DbError::InvalidTransaction(s) => format!("Invalid transaction: {}", s),
                DbError::DatabaseException(s) => format!("Database error: {}", s),
                DbError::InternalError(s) => format!("Internal error: {}", s),
                DbError::IOError(s) => s.to_string(),
                DbError::ValidationError(s) => format!("Validation Error: {}", s),
            }
        )
    }
}

impl From<io::Error> for DbError {
    fn from(error: io::Error) -> Self {
        DbError::IOError(error.to_string())
    }
}

impl From<serde_cbor::Error> for DbError {
    fn from(error: serde_cbor::Error) -> Self {
        DbError::IOError(format!("cbor: {}", error))
    }
}

impl Error for DbError {}

/// Enumerate the supported scalar types.
#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Debug, Hash)]
pub enum DataType {
    Int,
    Float,
    String,
    Blob,
}

impl DataType {
    /// The value a cell of this type holds when nothing was assigned to it.
    pub fn zero_value(self) -> Field {
        match self {
            DataType::Int => Field::IntField(0),
            DataType::Float => Field::FloatField(0.0),
            DataType::String => Field::StringField(String::new()),
            DataType::Blob => Field::BlobField(Vec::new()),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int => "integer",
            DataType::Float => "float",
            DataType::String => "string",
            DataType::Blob => "blob",
        };
        write!(f, "{}", name)
    }
}

/// For each of the dtypes, make sure that there is a corresponding field type.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum Field {
    IntField(i64),
    FloatField(f64),
    StringField(String),
    BlobField(Vec<u8>),
}

impl Field {
    /// Returns the dtype of the field.
    pub fn dtype(&self) -> DataType {
        match self {
            Field::IntField(_) => DataType::Int,
            Field::FloatField(_) => DataType::Float,
            Field::StringField(_) => DataType::String,
            Field::BlobField(_) => DataType::Blob,
        }
    }

    /// Three-way compare against another field.
    ///
    /// Integers and floats compare numerically with each other, strings compare
    /// case-insensitively unless `case_sensitive` is set, blobs compare bytewise.
    /// Any other combination cannot be ordered.
    ///
    /// # Arguments
    ///
    /// * `other` - Field to compare with.
    /// * `case_sensitive` - Whether string comparison respects case.
    pub fn compare(&self, other: &Field, case_sensitive: bool) -> Result<Ordering, DbError> {
        match (self, other) {
            (Field::IntField(a), Field::IntField(b)) => Ok(a.cmp(b)),
            (Field::IntField(a), Field::FloatField(b)) => Ok((*a as f64).total_cmp(b)),
            (Field::FloatField(a), Field::IntField(b)) => Ok(a.total_cmp(&(*b as f64))),
            (Field::FloatField(a), Field::FloatField(b)) => Ok(a.total_cmp(b)),
            (Field::StringField(a), Field::StringField(b)) => {
                if case_sensitive {
                    Ok(a.cmp(b))
                } else {
                    Ok(a.to_uppercase().cmp(&b.to_uppercase()))
                }
            }
            (Field::BlobField(a), Field::BlobField(b)) => Ok(a.cmp(b)),
            _ => Err(DbError::CannotConvertType(format!(
                "cannot compare {} with {}",
                self.dtype(),
                other.dtype()
            ))),
        }
    }

    /// Converts the field to another dtype.
    ///
    /// # Arguments
    ///
    /// * `dtype` - Type to convert to.
    pub fn cast_to(&self, dtype: DataType) -> Result<Field, DbError> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let err = || {
            DbError::CannotConvertType(format!(
                "cannot convert {} value '{}' to {}",
                self.dtype(),
                self,
                dtype
            ))
        };
        match (self, dtype) {
            (Field::IntField(i), DataType::Float) => Ok(Field::FloatField(*i as f64)),
            (Field::IntField(i), DataType::String) => Ok(Field::StringField(i.to_string())),
            (Field::FloatField(x), DataType::Int) => Ok(Field::IntField(x.trunc() as i64)),
            (Field::FloatField(x), DataType::String) => Ok(Field::StringField(x.to_string())),
            (Field::StringField(s), DataType::Int) => {
                s.trim().parse::<i64>().map(Field::IntField).map_err(|_| err())
            }
            (Field::StringField(s), DataType::Float) => {
                s.trim().parse::<f64>().map(Field::FloatField).map_err(|_| err())
            }
            (Field::StringField(s), DataType::Blob) => Ok(Field::BlobField(s.as_bytes().to_vec())),
            (Field::BlobField(b), DataType::String) => String::from_utf8(b.clone())
                .map(Field::StringField)
                .map_err(|_| err()),
            _ => Err(err()),
        }
    }

    /// Returns true for zero-length blobs.
    pub fn is_empty_blob(&self) -> bool {
        matches!(self, Field::BlobField(b) if b.is_empty())
    }

    /// Unwraps integer fields.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Field::IntField(i) => Some(*i),
            _ => None,
        }
    }

    /// Unwraps string fields.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::StringField(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::IntField(x) => write!(f, "{}", x),
            Field::FloatField(x) => write!(f, "{}", x),
            Field::StringField(x) => write!(f, "{}", x),
            Field::BlobField(x) => write!(f, "<blob {} bytes>", x.len()),
        }
    }
}

/// A record: cells keyed by column id. A missing cell is the driver-side
/// representation of NULL.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct Record {
    cells: BTreeMap<ColumnId, Field>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self {
            cells: BTreeMap::new(),
        }
    }

    /// Create a record from (column id, value) pairs.
    pub fn from_cells<I: IntoIterator<Item = (ColumnId, Field)>>(cells: I) -> Self {
        Self {
            cells: cells.into_iter().collect(),
        }
    }

    /// Get the cell for a column, without creating it.
    pub fn get(&self, id: ColumnId) -> Option<&Field> {
        self.cells.get(&id)
    }

    /// Get a mutable cell for a column, without creating it.
    pub fn get_mut(&mut self, id: ColumnId) -> Option<&mut Field> {
        self.cells.get_mut(&id)
    }

    /// Set the cell for a column, returning the previous value.
    pub fn set(&mut self, id: ColumnId, f: Field) -> Option<Field> {
        self.cells.insert(id, f)
    }

    /// Delete the cell for a column.
    pub fn remove(&mut self, id: ColumnId) -> Option<Field> {
        self.cells.remove(&id)
    }

    pub fn contains(&self, id: ColumnId) -> bool {
        self.cells.contains_key(&id)
    }

    /// Return the number of cells.
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Returns an iterator over the cells ordered by column id.
    pub fn cells(&self) -> impl Iterator<Item = (ColumnId, &Field)> {
        self.cells.iter().map(|(id, f)| (*id, f))
    }

    /// Get the cell at a position in column id order.
    pub fn cell_at(&self, pos: usize) -> Option<(ColumnId, &Field)> {
        self.cells().nth(pos)
    }

    /// Overwrite cells of self with every cell of `other`.
    pub fn merge_from(&mut self, other: &Record) {
        for (id, f) in other.cells() {
            self.cells.insert(id, f.clone());
        }
    }

    pub fn get_bytes(&self) -> Result<Vec<u8>, DbError> {
        Ok(serde_cbor::to_vec(&self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DbError> {
        Ok(serde_cbor::from_slice(bytes)?)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = String::new();
        for (id, field) in self.cells() {
            res.push_str(&format!("{}={}", id, field));
            res.push('\t');
        }
        write!(f, "{}", res)
    }
}

#[cfg(test)]
mod libtests {
    use super::*;
    use crate::testutil::*;

    #[test]
    fn test_record_bytes() {
        let record = int_vec_to_record(vec![0, 1, 0]);
        let record_bytes = record.get_bytes().unwrap();
        let check_record = Record::from_bytes(&record_bytes).unwrap();
        assert_eq!(record, check_record);
    }

    #[test]
    fn test_compare_mixed_numbers() {
        let a = Field::IntField(3);
        let b = Field::FloatField(3.5);
        assert_eq!(a.compare(&b, true).unwrap(), Ordering::Less);
        assert_eq!(b.compare(&a, true).unwrap(), Ordering::Greater);
        assert_eq!(
            Field::FloatField(2.0).compare(&Field::IntField(2), true).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_compare_case() {
        let a = Field::StringField(String::from("abc"));
        let b = Field::StringField(String::from("ABC"));
        assert_eq!(a.compare(&b, false).unwrap(), Ordering::Equal);
        assert_ne!(a.compare(&b, true).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_compare_incompatible() {
        let a = Field::StringField(String::from("1"));
        let b = Field::IntField(1);
        assert!(matches!(
            a.compare(&b, true),
            Err(DbError::CannotConvertType(_))
        ));
    }

    #[test]
    fn test_cast() {
        assert_eq!(
            Field::StringField(String::from(" 42")).cast_to(DataType::Int),
            Ok(Field::IntField(42))
        );
        assert_eq!(
            Field::IntField(7).cast_to(DataType::String),
            Ok(Field::StringField(String::from("7")))
        );
        assert_eq!(
            Field::FloatField(2.9).cast_to(DataType::Int),
            Ok(Field::IntField(2))
        );
        assert!(Field::StringField(String::from("x"))
            .cast_to(DataType::Int)
            .is_err());
    }

    #[test]
    fn test_record_cells() {
        let mut record = Record::new();
        record.set(5, Field::IntField(1));
        record.set(2, Field::StringField(String::from("b")));
        assert_eq!(record.size(), 2);
        assert_eq!(record.cell_at(0).map(|(id, _)| id), Some(2));
        assert_eq!(record.remove(5), Some(Field::IntField(1)));
        assert!(record.get(5).is_none());
        assert!(record.contains(2));
    }
}

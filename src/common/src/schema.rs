use crate::ids::ColumnId;
use crate::{DataType, DbError, Field};
use bitflags::bitflags;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use std::collections::HashMap;

bitflags! {
    /// Static per-column flags of a record shape.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ColumnFlags: u32 {
        const KEY = 1;
        const READ_ONLY = 2;
        const BINARY = 4;
        /// The column's null default stands in for a missing (NULL) cell.
        const TRANSLATE_NULLS = 8;
        /// Retrieved during the initial scan.
        const INTERNAL_FASE1 = 16;
        /// Retrieved on demand for matching rows only.
        const INTERNAL_FASE2 = 32;
        /// Written by update cursors.
        const INTERNAL_UPDATES = 64;
    }
}

/// One column of a record shape.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Column {
    /// Id under which the column's cell is stored in records.
    pub id: ColumnId,
    /// Display name.
    pub name: String,
    /// Name of the column in storage.
    pub dbase_name: String,
    pub dtype: DataType,
    pub flags: ColumnFlags,
    /// CBOR-serialized null default. Blob columns never carry one.
    #[serde(default)]
    pub null_default: Option<Vec<u8>>,
}

impl Column {
    /// Create a new column whose storage name equals its display name.
    ///
    /// # Arguments
    ///
    /// * `id` - Column id.
    /// * `name` - Name of the column.
    /// * `dtype` - Dtype of the column.
    pub fn new(id: ColumnId, name: &str, dtype: DataType) -> Self {
        Self {
            id,
            name: name.to_string(),
            dbase_name: name.to_string(),
            dtype,
            flags: ColumnFlags::empty(),
            null_default: None,
        }
    }

    /// Builder-style flag setter.
    pub fn with_flags(mut self, flags: ColumnFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Marks the column as NULL-translated with the given default.
    pub fn with_null_default(mut self, default: &Field) -> Result<Self, DbError> {
        self.flags |= ColumnFlags::TRANSLATE_NULLS;
        if self.dtype != DataType::Blob {
            self.null_default = Some(serde_cbor::to_vec(default)?);
        }
        Ok(self)
    }

    /// Decodes the stored null default, falling back to the dtype's zero value.
    pub fn decode_null_default(&self) -> Result<Field, DbError> {
        match &self.null_default {
            Some(bytes) => {
                let field: Field = serde_cbor::from_slice(bytes)?;
                field.cast_to(self.dtype)
            }
            None => Ok(self.dtype.zero_value()),
        }
    }

    pub fn is_blob(&self) -> bool {
        self.dtype == DataType::Blob
    }
}

/// Schema description of a table or record shape. Shared, never mutated
/// once handed to a query.
#[derive(PartialEq, Clone, Debug)]
pub struct DbTypeInfo {
    /// Columns in order.
    columns: Vec<Column>,
    /// Mapping from column id to position.
    id_map: HashMap<ColumnId, usize>,
}

impl Serialize for DbTypeInfo {
    /// Custom serialize to avoid serializing id_map.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.columns.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DbTypeInfo {
    /// Custom deserialize to rebuild id_map.
    fn deserialize<D>(deserializer: D) -> Result<DbTypeInfo, D::Error>
    where
        D: Deserializer<'de>,
    {
        let columns = Vec::deserialize(deserializer)?;
        Ok(DbTypeInfo::new(columns))
    }
}

impl DbTypeInfo {
    /// Create a new schema.
    ///
    /// # Arguments
    ///
    /// * `columns` - Columns of the schema in order.
    pub fn new(columns: Vec<Column>) -> Self {
        let mut id_map = HashMap::new();
        for (i, col) in columns.iter().enumerate() {
            id_map.insert(col.id, i);
        }
        Self { columns, id_map }
    }

    /// Get the column at a position.
    pub fn column(&self, i: usize) -> Option<&Column> {
        self.columns.get(i)
    }

    /// Get the position of the column with the given id.
    pub fn position_of(&self, id: ColumnId) -> Option<usize> {
        self.id_map.get(&id).copied()
    }

    /// Get a column by display name, ignoring case.
    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    /// Returns the number of columns.
    pub fn size(&self) -> usize {
        self.columns.len()
    }

    /// Serializes the schema as json.
    pub fn to_json(&self) -> Result<String, DbError> {
        serde_json::to_string(self).map_err(|e| DbError::IOError(e.to_string()))
    }

    /// De-serializes a schema written by to_json.
    pub fn from_json(json: &str) -> Result<Self, DbError> {
        serde_json::from_str(json)
            .map_err(|e| DbError::ValidationError(format!("Malformatted schema json: {}", e)))
    }
}

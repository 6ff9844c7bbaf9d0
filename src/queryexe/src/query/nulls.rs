//! Translation between missing cells and per-column null defaults.
//!
//! Drivers represent NULL by leaving a cell out of a record. Columns flagged
//! `TRANSLATE_NULLS` instead show callers a typed default value, stripped on
//! the way into a driver and filled back in on the way out.

use common::conditions::{satisfies_join, satisfies_single};
use common::query::{Fase, JoinCondition, SingleCondition, TableSource};
use common::schema::{Column, ColumnFlags};
use common::vars::{Var, VarArena};
use common::{DataType, DbError, Field, Record};
use std::cmp::Ordering;
use std::sync::Arc;

fn translated(col: &Column) -> bool {
    col.flags.contains(ColumnFlags::TRANSLATE_NULLS)
}

/// Materialize the null default of every translated column into `values`.
///
/// Blob columns never carry a stored default and get no handle.
pub fn init_null_handling(table: &mut TableSource, values: &mut VarArena) -> Result<(), DbError> {
    let typeinfo = Arc::clone(&table.typeinfo);
    for (pos, col) in typeinfo.columns().enumerate() {
        if !translated(col) || col.is_blob() {
            continue;
        }
        if table.columns[pos].nulldefault.is_some() {
            return Err(DbError::InternalError(format!(
                "null default of {}.{} initialized twice",
                table.name, col.name
            )));
        }
        let default = col.decode_null_default()?;
        table.columns[pos].nulldefault = Some(values.alloc(Var::Scalar(default)));
    }
    Ok(())
}

/// Release the null defaults materialized by `init_null_handling`.
pub fn free_null_defaults(table: &mut TableSource, values: &mut VarArena) -> Result<(), DbError> {
    for info in table.columns.iter_mut() {
        if let Some(id) = info.nulldefault.take() {
            values.free(id)?;
        }
    }
    Ok(())
}

/// The null default of the column at `pos`.
pub fn null_default(table: &TableSource, values: &VarArena, pos: usize) -> Result<Field, DbError> {
    let col = table.typeinfo.column(pos).ok_or_else(|| {
        DbError::UnknownColumn(format!("column #{} of table {}", pos, table.name))
    })?;
    if col.is_blob() {
        return Ok(DataType::Blob.zero_value());
    }
    match table.columns.get(pos).and_then(|c| c.nulldefault) {
        Some(id) => Ok(values.get(id)?.scalar()?.clone()),
        None => col.decode_null_default(),
    }
}

/// Whether `field` holds the null default of the column at `pos`.
///
/// Blobs count as null when empty. Other values compare case sensitively.
pub fn equals_to_null_default(
    table: &TableSource,
    values: &VarArena,
    pos: usize,
    field: &Field,
) -> Result<bool, DbError> {
    let default = null_default(table, values, pos)?;
    if default.dtype() == DataType::Blob {
        return Ok(field.is_empty_blob());
    }
    let numeric = |f: &Field| matches!(f.dtype(), DataType::Int | DataType::Float);
    if field.dtype() != default.dtype() && !(numeric(field) && numeric(&default)) {
        return Ok(false);
    }
    Ok(field.compare(&default, true)? == Ordering::Equal)
}

/// Write the null default of the column at `pos` into `record`.
pub fn fill_with_null_default(
    table: &TableSource,
    values: &VarArena,
    pos: usize,
    record: &mut Record,
) -> Result<(), DbError> {
    let default = null_default(table, values, pos)?;
    if let Some(col) = table.typeinfo.column(pos) {
        record.set(col.id, default);
    }
    Ok(())
}

/// Strip cells holding their column's null default, so the driver stores NULL.
pub fn delete_null_defaults(
    table: &TableSource,
    values: &VarArena,
    record: &mut Record,
) -> Result<(), DbError> {
    for (pos, col) in table.typeinfo.columns().enumerate() {
        if !translated(col) {
            continue;
        }
        let is_default = match record.get(col.id) {
            Some(field) => equals_to_null_default(table, values, pos, field)?,
            None => false,
        };
        if is_default {
            record.remove(col.id);
        }
    }
    Ok(())
}

/// Fill missing cells of translated columns in the given fases.
pub fn fill_with_null_defaults(
    table: &TableSource,
    values: &VarArena,
    record: &mut Record,
    fases: Fase,
) -> Result<(), DbError> {
    for (pos, col) in table.typeinfo.columns().enumerate() {
        if translated(col) && table.fase(pos).intersects(fases) && !record.contains(col.id) {
            fill_with_null_default(table, values, pos, record)?;
        }
    }
    Ok(())
}

/// Give every omitted scalar column its zero value.
///
/// Blob, key and read-only columns are left alone, as are translated columns
/// when `skip_translated` is set.
pub fn add_missing_default_columns(table: &TableSource, record: &mut Record, skip_translated: bool) {
    let skipped = ColumnFlags::KEY | ColumnFlags::READ_ONLY;
    for col in table.typeinfo.columns() {
        if col.is_blob() || col.flags.intersects(skipped) || record.contains(col.id) {
            continue;
        }
        if skip_translated && translated(col) {
            continue;
        }
        record.set(col.id, col.dtype.zero_value());
    }
}

fn is_null_cell(table: &TableSource, values: &VarArena, column: usize, record: &Record) -> Result<bool, DbError> {
    let col = match table.typeinfo.column(column) {
        Some(col) => col,
        None => return Ok(false),
    };
    match record.get(col.id) {
        None => Ok(true),
        Some(field) if translated(col) => equals_to_null_default(table, values, column, field),
        Some(_) => Ok(false),
    }
}

/// Single-column test aware of NULLs: a missing cell of a schema column
/// matches only under `match_null`.
pub fn satisfies_single_with_nulls(
    cond: &SingleCondition,
    table: &TableSource,
    values: &VarArena,
    record: &Record,
) -> Result<bool, DbError> {
    if !record.contains(cond.columnid) && table.typeinfo.column(cond.column).is_some() {
        return Ok(cond.match_null);
    }
    satisfies_single(values, cond, record)
}

/// Join test aware of NULLs: two NULL sides match only under
/// `match_double_null`, a single missing side never matches.
pub fn satisfies_join_with_nulls(
    cond: &JoinCondition,
    ltable: &TableSource,
    lvalues: &VarArena,
    left: &Record,
    rtable: &TableSource,
    rvalues: &VarArena,
    right: &Record,
) -> Result<bool, DbError> {
    let lnull = is_null_cell(ltable, lvalues, cond.column1, left)?;
    let rnull = is_null_cell(rtable, rvalues, cond.column2, right)?;
    if lnull && rnull {
        return Ok(cond.match_double_null);
    }
    if !left.contains(cond.columnid1) || !right.contains(cond.columnid2) {
        return Ok(false);
    }
    satisfies_join(cond, left, right)
}

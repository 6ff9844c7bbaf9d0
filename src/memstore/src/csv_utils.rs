use crate::storage_manager::StorageManager;
use common::schema::DbTypeInfo;
use common::{DataType, DbError, Field, Record};
use std::fs::File;

fn parse_field(raw: &str, dtype: DataType) -> Result<Field, DbError> {
    let bad = |e: &dyn std::fmt::Display| {
        DbError::CannotConvertType(format!("cannot read {:?} as {}: {}", raw, dtype, e))
    };
    match dtype {
        DataType::Int => raw.trim().parse::<i64>().map(Field::IntField).map_err(|e| bad(&e)),
        DataType::Float => raw.trim().parse::<f64>().map(Field::FloatField).map_err(|e| bad(&e)),
        DataType::String => Ok(Field::StringField(raw.to_string())),
        DataType::Blob => Ok(Field::BlobField(raw.as_bytes().to_vec())),
    }
}

/// Function to import csv data into an existing table of a store.
///
/// Empty cells are left out of the record, so they read back as NULL.
///
/// # Arguments
///
/// * `sm` - Store holding the table.
/// * `table` - Name of the table; created if missing.
/// * `typeinfo` - Schema giving the column of each csv field.
/// * `path` - Path to the csv file.
pub fn import_csv(
    sm: &StorageManager,
    table: &str,
    typeinfo: &DbTypeInfo,
    path: &str,
) -> Result<usize, DbError> {
    debug!("memstore::csv_utils trying to open file, path: {:?}", path);
    let file = File::open(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(file);
    sm.create_table(table)?;
    let mut inserted_records = 0;
    for result in rdr.records() {
        let rec = result.map_err(|e| DbError::IOError(e.to_string()))?;
        let mut record = Record::new();
        for (raw, column) in rec.iter().zip(typeinfo.columns()) {
            if raw.is_empty() {
                continue;
            }
            record.set(column.id, parse_field(raw, column.dtype)?);
        }
        sm.insert(table, record)?;
        inserted_records += 1;
    }
    info!("Num records imported: {:?}", inserted_records);
    Ok(inserted_records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::schema::Column;
    use common::testutil::init;
    use std::io::Write;
    use temp_testdir::TempDir;

    #[test]
    fn test_import() {
        init();
        let dir = TempDir::default();
        let mut path = dir.to_path_buf();
        path.push("people.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "1,ann,1.5").unwrap();
        writeln!(f, "2,,2.5").unwrap();
        drop(f);
        let typeinfo = DbTypeInfo::new(vec![
            Column::new(1, "id", DataType::Int),
            Column::new(2, "name", DataType::String),
            Column::new(3, "score", DataType::Float),
        ]);
        let sm = StorageManager::new_test_sm();
        let n = import_csv(&sm, "people", &typeinfo, path.to_str().unwrap()).unwrap();
        assert_eq!(n, 2);
        let rows = sm.records("people").unwrap();
        assert_eq!(rows[0].get(2), Some(&Field::StringField(String::from("ann"))));
        assert!(!rows[1].contains(2));
        assert_eq!(rows[1].get(3), Some(&Field::FloatField(2.5)));
    }

    #[test]
    fn test_import_bad_int() {
        let dir = TempDir::default();
        let mut path = dir.to_path_buf();
        path.push("bad.csv");
        std::fs::write(&path, "x\n").unwrap();
        let typeinfo = DbTypeInfo::new(vec![Column::new(1, "id", DataType::Int)]);
        let sm = StorageManager::new_test_sm();
        assert!(matches!(
            import_csv(&sm, "t", &typeinfo, path.to_str().unwrap()),
            Err(DbError::CannotConvertType(_))
        ));
    }
}

use crate::schema::{Column, DbTypeInfo};
use crate::{DataType, Field, Record};
use rand::{thread_rng, Rng};
use std::sync::Arc;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Converts an int vector to a Record, cell i under column id i.
///
/// # Argument
///
/// * `data` - Data to put into the record.
pub fn int_vec_to_record(data: Vec<i64>) -> Record {
    Record::from_cells(
        data.into_iter()
            .enumerate()
            .map(|(i, v)| (i as u32, Field::IntField(v))),
    )
}

/// Creates a Vec of records containing IntFields given a 2D Vec of i64 's
pub fn create_record_list(record_data: Vec<Vec<i64>>) -> Vec<Record> {
    record_data.into_iter().map(int_vec_to_record).collect()
}

/// Creates a new schema for a table with width number of int columns named
/// c0, c1, ...
pub fn get_int_table_schema(width: usize) -> Arc<DbTypeInfo> {
    let columns = (0..width)
        .map(|i| Column::new(i as u32, &format!("c{}", i), DataType::Int))
        .collect();
    Arc::new(DbTypeInfo::new(columns))
}

pub fn gen_random_records(n: usize, width: usize, max: i64) -> Vec<Record> {
    let mut rng = thread_rng();
    (0..n)
        .map(|_| int_vec_to_record((0..width).map(|_| rng.gen_range(0..max)).collect()))
        .collect()
}

/// Checks that two record lists hold the same records, in any order.
pub fn compare_unordered_records(a: &[Record], mut b: Vec<Record>) -> bool {
    // Quick check
    if a.len() != b.len() {
        return false;
    }
    for x in a {
        match b.iter().position(|y| y == x) {
            None => return false,
            Some(idx) => {
                b.swap_remove(idx);
            }
        }
    }
    b.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn test_compare() {
        let mut rng = thread_rng();
        let a = gen_random_records(100, 3, 1000);
        let b = a.clone();
        assert!(compare_unordered_records(&a, b));
        let mut b = a.clone();
        b.shuffle(&mut rng);
        assert!(compare_unordered_records(&a, b));
        let mut b = a.clone();
        b.pop();
        assert!(!compare_unordered_records(&a, b));
        let mut b = a.clone();
        b[rng.gen_range(0..a.len())] = int_vec_to_record(vec![-1, -1, -1]);
        assert!(!compare_unordered_records(&a, b));
    }

    #[test]
    fn test_schema_helper() {
        let schema = get_int_table_schema(3);
        assert_eq!(schema.size(), 3);
        assert_eq!(schema.column(2).unwrap().name, "c2");
    }
}

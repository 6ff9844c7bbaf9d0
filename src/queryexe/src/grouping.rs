//! Sorting, grouping and searching of record arrays.
//!
//! Missing cells are NULL. NULLs sort before every value and form a group of
//! their own; aggregates skip them.

use common::{ColumnId, DbError, Field, Record};
use std::cmp::Ordering;
use std::ops::Range;

/// Aggregate functions available to `group_records`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggOp {
    /// Number of non-NULL cells.
    Count,
    Sum,
    Min,
    Max,
    /// Always a float.
    Avg,
}

/// One aggregate of a grouping: fold `column` with `op` into `target`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    pub op: AggOp,
    pub column: ColumnId,
    pub target: ColumnId,
}

impl Aggregate {
    pub fn new(op: AggOp, column: ColumnId, target: ColumnId) -> Self {
        Aggregate { op, column, target }
    }
}

/// Running state of one aggregate over one group.
enum Accumulator {
    Count(i64),
    Sum(Option<Field>),
    Min(Option<Field>),
    Max(Option<Field>),
    Avg { sum: f64, count: usize },
}

impl Accumulator {
    fn new(op: AggOp) -> Self {
        match op {
            AggOp::Count => Accumulator::Count(0),
            AggOp::Sum => Accumulator::Sum(None),
            AggOp::Min => Accumulator::Min(None),
            AggOp::Max => Accumulator::Max(None),
            AggOp::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
        }
    }

    fn numeric(field: &Field) -> Result<f64, DbError> {
        match field {
            Field::IntField(i) => Ok(*i as f64),
            Field::FloatField(f) => Ok(*f),
            other => Err(DbError::CannotConvertType(format!(
                "cannot aggregate {} value numerically",
                other.dtype()
            ))),
        }
    }

    fn update(&mut self, field: &Field) -> Result<(), DbError> {
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(acc) => {
                let next = match (acc.take(), field) {
                    (None, Field::IntField(_)) | (None, Field::FloatField(_)) => field.clone(),
                    (Some(Field::IntField(a)), Field::IntField(b)) => Field::IntField(a + b),
                    (Some(a), b) => Field::FloatField(Self::numeric(&a)? + Self::numeric(b)?),
                    (None, other) => {
                        return Err(DbError::CannotConvertType(format!(
                            "cannot sum {} values",
                            other.dtype()
                        )))
                    }
                };
                *acc = Some(next);
            }
            Accumulator::Min(acc) => {
                let replace = match acc {
                    None => true,
                    Some(cur) => field.compare(cur, true)? == Ordering::Less,
                };
                if replace {
                    *acc = Some(field.clone());
                }
            }
            Accumulator::Max(acc) => {
                let replace = match acc {
                    None => true,
                    Some(cur) => field.compare(cur, true)? == Ordering::Greater,
                };
                if replace {
                    *acc = Some(field.clone());
                }
            }
            Accumulator::Avg { sum, count } => {
                *sum += Self::numeric(field)?;
                *count += 1;
            }
        }
        Ok(())
    }

    /// The aggregate value; None for NULL.
    fn finish(self) -> Option<Field> {
        match self {
            Accumulator::Count(n) => Some(Field::IntField(n)),
            Accumulator::Sum(acc) | Accumulator::Min(acc) | Accumulator::Max(acc) => acc,
            Accumulator::Avg { count: 0, .. } => None,
            Accumulator::Avg { sum, count } => Some(Field::FloatField(sum / count as f64)),
        }
    }
}

/// Compare two records on the given key columns.
pub fn compare_keys(a: &Record, b: &Record, key: &[ColumnId]) -> Result<Ordering, DbError> {
    for id in key {
        let ord = match (a.get(*id), b.get(*id)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.compare(y, true)?,
        };
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}

/// Stable sort of records by key columns.
///
/// # Arguments
///
/// * `records` - Records to sort.
/// * `key` - Column ids to sort by, most significant first.
/// * `distinct` - Keep only the first record of every run of equal keys.
pub fn reorder_by_key(mut records: Vec<Record>, key: &[ColumnId], distinct: bool) -> Result<Vec<Record>, DbError> {
    let mut failed = None;
    records.sort_by(|a, b| match compare_keys(a, b, key) {
        Ok(ord) => ord,
        Err(e) => {
            failed.get_or_insert(e);
            Ordering::Equal
        }
    });
    if let Some(e) = failed {
        return Err(e);
    }
    if distinct {
        records.dedup_by(|a, b| matches!(compare_keys(a, b, key), Ok(Ordering::Equal)));
    }
    Ok(records)
}

/// Group records on `group_by` and fold every group through `aggs`.
///
/// Each output record holds the group's key cells and the aggregate
/// targets, in key order. NULL aggregates leave their target out.
pub fn group_records(records: Vec<Record>, group_by: &[ColumnId], aggs: &[Aggregate]) -> Result<Vec<Record>, DbError> {
    let sorted = reorder_by_key(records, group_by, false)?;
    let mut out = Vec::new();
    let mut start = 0;
    while start < sorted.len() {
        let mut end = start + 1;
        while end < sorted.len() && compare_keys(&sorted[start], &sorted[end], group_by)? == Ordering::Equal {
            end += 1;
        }
        let mut accs: Vec<Accumulator> = aggs.iter().map(|a| Accumulator::new(a.op)).collect();
        for record in sorted[start..end].iter() {
            for (acc, agg) in accs.iter_mut().zip(aggs.iter()) {
                if let Some(field) = record.get(agg.column) {
                    acc.update(field)?;
                }
            }
        }
        let mut result = Record::new();
        for id in group_by {
            if let Some(field) = sorted[start].get(*id) {
                result.set(*id, field.clone());
            }
        }
        for (acc, agg) in accs.into_iter().zip(aggs.iter()) {
            if let Some(field) = acc.finish() {
                result.set(agg.target, field);
            }
        }
        out.push(result);
        start = end;
    }
    debug!("grouped into {} groups", out.len());
    Ok(out)
}

/// Binary search a key-sorted array. `Ok` holds the index of a match,
/// `Err` the insertion point, as with `slice::binary_search`.
pub fn binary_search_records(
    records: &[Record],
    key: &[ColumnId],
    probe: &Record,
) -> Result<Result<usize, usize>, DbError> {
    let (mut lo, mut hi) = (0, records.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match compare_keys(&records[mid], probe, key)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}

fn partition_point(records: &[Record], key: &[ColumnId], probe: &Record, upper: bool) -> Result<usize, DbError> {
    let (mut lo, mut hi) = (0, records.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let ord = compare_keys(&records[mid], probe, key)?;
        if ord == Ordering::Less || (upper && ord == Ordering::Equal) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Range of the records of a key-sorted array whose key equals the probe's.
pub fn equal_range(records: &[Record], key: &[ColumnId], probe: &Record) -> Result<Range<usize>, DbError> {
    let start = partition_point(records, key, probe, false)?;
    let end = partition_point(records, key, probe, true)?;
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::testutil::*;

    fn sales() -> Vec<Record> {
        vec![
            Record::from_cells(vec![(0, Field::StringField(String::from("b"))), (1, Field::IntField(5))]),
            Record::from_cells(vec![(0, Field::StringField(String::from("a"))), (1, Field::IntField(2))]),
            Record::from_cells(vec![(0, Field::StringField(String::from("b"))), (1, Field::FloatField(1.5))]),
            Record::from_cells(vec![(0, Field::StringField(String::from("a")))]),
            Record::from_cells(vec![(1, Field::IntField(9))]),
        ]
    }

    #[test]
    fn test_group_records() {
        init();
        let aggs = vec![
            Aggregate::new(AggOp::Count, 1, 10),
            Aggregate::new(AggOp::Sum, 1, 11),
            Aggregate::new(AggOp::Min, 1, 12),
            Aggregate::new(AggOp::Max, 1, 13),
            Aggregate::new(AggOp::Avg, 1, 14),
        ];
        let groups = group_records(sales(), &[0], &aggs).unwrap();
        assert_eq!(groups.len(), 3);
        // NULL key first.
        assert!(!groups[0].contains(0));
        assert_eq!(groups[0].get(11), Some(&Field::IntField(9)));

        let a = &groups[1];
        assert_eq!(a.get(0), Some(&Field::StringField(String::from("a"))));
        assert_eq!(a.get(10), Some(&Field::IntField(1)));
        assert_eq!(a.get(11), Some(&Field::IntField(2)));
        assert_eq!(a.get(14), Some(&Field::FloatField(2.0)));

        let b = &groups[2];
        assert_eq!(b.get(10), Some(&Field::IntField(2)));
        assert_eq!(b.get(11), Some(&Field::FloatField(6.5)));
        assert_eq!(b.get(12), Some(&Field::FloatField(1.5)));
        assert_eq!(b.get(13), Some(&Field::IntField(5)));
        assert_eq!(b.get(14), Some(&Field::FloatField(3.25)));
    }

    #[test]
    fn test_group_all_null_avg() {
        let records = create_record_list(vec![vec![1], vec![1]]);
        let groups = group_records(records, &[0], &[Aggregate::new(AggOp::Avg, 5, 6)]).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(!groups[0].contains(6));
    }

    #[test]
    fn test_reorder_is_stable() {
        let records = create_record_list(vec![vec![2, 0], vec![1, 1], vec![2, 2], vec![1, 3]]);
        let sorted = reorder_by_key(records.clone(), &[0], false).unwrap();
        assert_eq!(
            sorted,
            create_record_list(vec![vec![1, 1], vec![1, 3], vec![2, 0], vec![2, 2]])
        );
        let distinct = reorder_by_key(records, &[0], true).unwrap();
        assert_eq!(distinct, create_record_list(vec![vec![1, 1], vec![2, 0]]));
    }

    #[test]
    fn test_reorder_mixed_types_fails() {
        let records = vec![
            Record::from_cells(vec![(0, Field::IntField(1))]),
            Record::from_cells(vec![(0, Field::StringField(String::from("x")))]),
        ];
        assert!(matches!(
            reorder_by_key(records, &[0], false),
            Err(DbError::CannotConvertType(_))
        ));
    }

    #[test]
    fn test_binary_search_and_equal_range() {
        let records = create_record_list(vec![vec![1], vec![3], vec![3], vec![3], vec![7]]);
        let probe = int_vec_to_record(vec![3]);
        let found = binary_search_records(&records, &[0], &probe).unwrap();
        assert!(matches!(found, Ok(i) if (1..4).contains(&i)));
        assert_eq!(
            binary_search_records(&records, &[0], &int_vec_to_record(vec![5])).unwrap(),
            Err(4)
        );
        assert_eq!(equal_range(&records, &[0], &probe).unwrap(), 1..4);
        assert_eq!(equal_range(&records, &[0], &int_vec_to_record(vec![0])).unwrap(), 0..0);
        assert_eq!(equal_range(&records, &[0], &int_vec_to_record(vec![9])).unwrap(), 5..5);
    }
}

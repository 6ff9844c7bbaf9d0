//! Predicate evaluation against in-flight rows.

use crate::query::{JoinCondition, RelOp, SingleCondition};
use crate::vars::VarArena;
use crate::{ColumnId, DbError, Field, Record};

fn cell<'a>(record: &'a Record, id: ColumnId, table: usize) -> Result<&'a Field, DbError> {
    record.get(id).ok_or_else(|| {
        DbError::UnknownColumn(format!(
            "column id {} not present in row of table #{}",
            id, table
        ))
    })
}

/// Checks whether a row satisfies a single-column condition.
///
/// # Arguments
///
/// * `values` - Arena holding the condition's operand.
/// * `cond` - Condition to test.
/// * `record` - Row of the condition's table.
pub fn satisfies_single(
    values: &VarArena,
    cond: &SingleCondition,
    record: &Record,
) -> Result<bool, DbError> {
    let field = cell(record, cond.columnid, cond.table)?;
    let operand = values.get(cond.value)?;
    match cond.op {
        RelOp::Like => {
            let pattern = operand.scalar()?;
            match (field, pattern) {
                (Field::StringField(s), Field::StringField(p)) => {
                    Ok(like_match(s, p, cond.case_sensitive))
                }
                _ => Err(DbError::CannotConvertType(format!(
                    "like requires strings, got {} and {}",
                    field.dtype(),
                    pattern.dtype()
                ))),
            }
        }
        RelOp::In => {
            for item in operand.list()? {
                if item.dtype() == field.dtype()
                    && field.compare(item, cond.case_sensitive)? == std::cmp::Ordering::Equal
                {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        op => {
            let ord = field.compare(operand.scalar()?, cond.case_sensitive)?;
            op.matches(ord)
        }
    }
}

/// Checks whether two rows satisfy a join condition.
///
/// # Arguments
///
/// * `cond` - Condition to test.
/// * `left` - Row of `cond.table1`.
/// * `right` - Row of `cond.table2`.
pub fn satisfies_join(cond: &JoinCondition, left: &Record, right: &Record) -> Result<bool, DbError> {
    let lhs = cell(left, cond.columnid1, cond.table1)?;
    let rhs = cell(right, cond.columnid2, cond.table2)?;
    match cond.op {
        RelOp::Like => {
            let s = lhs.as_str().ok_or_else(|| {
                DbError::CannotConvertType(format!(
                    "left side of like join is {}, expected string",
                    lhs.dtype()
                ))
            })?;
            let p = rhs.as_str().ok_or_else(|| {
                DbError::CannotConvertType(format!(
                    "right side of like join is {}, expected string",
                    rhs.dtype()
                ))
            })?;
            Ok(like_match(s, p, cond.case_sensitive))
        }
        RelOp::In => Err(DbError::InternalError(String::from(
            "'in' cannot be used in a join condition",
        ))),
        op => op.matches(lhs.compare(rhs, cond.case_sensitive)?),
    }
}

/// LIKE matching: `%` matches any run of characters, `_` exactly one.
///
/// # Arguments
///
/// * `s` - String to test.
/// * `pattern` - Pattern to match against.
/// * `case_sensitive` - Whether character comparison respects case.
pub fn like_match(s: &str, pattern: &str, case_sensitive: bool) -> bool {
    let (s_chars, p_chars): (Vec<char>, Vec<char>) = if case_sensitive {
        (s.chars().collect(), pattern.chars().collect())
    } else {
        (
            s.to_uppercase().chars().collect(),
            pattern.to_uppercase().chars().collect(),
        )
    };
    like_match_from(&s_chars, &p_chars)
}

// Iterative matcher with single-star backtracking.
fn like_match_from(s: &[char], p: &[char]) -> bool {
    let (mut si, mut pi) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() && (p[pi] == '_' || (p[pi] != '%' && p[pi] == s[si])) {
            si += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '%' {
            backtrack = Some((pi, si));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            si = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vars::Var;

    fn single(op: RelOp, value: Var, values: &mut VarArena) -> SingleCondition {
        SingleCondition {
            table: 0,
            column: 0,
            columnid: 1,
            op,
            value: values.alloc(value),
            case_sensitive: false,
            match_null: false,
            handled: false,
        }
    }

    fn join(op: RelOp) -> JoinCondition {
        JoinCondition {
            table1: 0,
            column1: 0,
            columnid1: 1,
            table2: 1,
            column2: 0,
            columnid2: 2,
            op,
            case_sensitive: true,
            match_double_null: false,
            handled: false,
        }
    }

    fn row(id: ColumnId, f: Field) -> Record {
        Record::from_cells(vec![(id, f)])
    }

    #[test]
    fn test_like() {
        assert!(like_match("hello world", "hello%", true));
        assert!(like_match("hello", "h_llo", true));
        assert!(like_match("hello", "%", true));
        assert!(like_match("", "%", true));
        assert!(!like_match("hello", "h_lo", true));
        assert!(like_match("HeLLo", "hello", false));
        assert!(!like_match("HeLLo", "hello", true));
        assert!(like_match("abcabd", "%ab_", true));
        assert!(like_match("mississippi", "%iss%ppi", true));
    }

    #[test]
    fn test_single_ops() {
        let mut values = VarArena::new();
        let r = row(1, Field::IntField(5));
        let less = single(RelOp::Less, Var::Scalar(Field::IntField(6)), &mut values);
        assert!(satisfies_single(&values, &less, &r).unwrap());
        let eq = single(RelOp::Equal, Var::Scalar(Field::IntField(6)), &mut values);
        assert!(!satisfies_single(&values, &eq, &r).unwrap());
        let ge = single(RelOp::BiggerEqual, Var::Scalar(Field::IntField(5)), &mut values);
        assert!(satisfies_single(&values, &ge, &r).unwrap());
    }

    #[test]
    fn test_single_in_without_coercion() {
        let mut values = VarArena::new();
        let list = Var::List(vec![Field::FloatField(5.0), Field::IntField(7)]);
        let cond = single(RelOp::In, list, &mut values);
        assert!(!satisfies_single(&values, &cond, &row(1, Field::IntField(5))).unwrap());
        assert!(satisfies_single(&values, &cond, &row(1, Field::IntField(7))).unwrap());
    }

    #[test]
    fn test_single_like_requires_strings() {
        let mut values = VarArena::new();
        let cond = single(
            RelOp::Like,
            Var::Scalar(Field::StringField(String::from("a%"))),
            &mut values,
        );
        assert!(satisfies_single(
            &values,
            &cond,
            &row(1, Field::StringField(String::from("ABC")))
        )
        .unwrap());
        assert!(matches!(
            satisfies_single(&values, &cond, &row(1, Field::IntField(1))),
            Err(DbError::CannotConvertType(_))
        ));
    }

    #[test]
    fn test_single_missing_column() {
        let mut values = VarArena::new();
        let cond = single(RelOp::Equal, Var::Scalar(Field::IntField(1)), &mut values);
        assert!(matches!(
            satisfies_single(&values, &cond, &row(9, Field::IntField(1))),
            Err(DbError::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_join() {
        let left = row(1, Field::IntField(3));
        let right = row(2, Field::IntField(3));
        assert!(satisfies_join(&join(RelOp::Equal), &left, &right).unwrap());
        assert!(!satisfies_join(&join(RelOp::Less), &left, &right).unwrap());
        assert!(matches!(
            satisfies_join(&join(RelOp::In), &left, &right),
            Err(DbError::InternalError(_))
        ));
        match satisfies_join(&join(RelOp::Like), &left, &right) {
            Err(DbError::CannotConvertType(msg)) => assert!(msg.starts_with("left")),
            other => panic!("unexpected {:?}", other),
        }
        let sleft = row(1, Field::StringField(String::from("abc")));
        match satisfies_join(&join(RelOp::Like), &sleft, &right) {
            Err(DbError::CannotConvertType(msg)) => assert!(msg.starts_with("right")),
            other => panic!("unexpected {:?}", other),
        }
    }
}

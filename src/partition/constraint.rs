use crate::catalog::ops::{Comparator, TypeOps};
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Collation, ColumnType, Row, Value};
use crate::error::AutopartError;
use crate::partition::bound::Bound;
use crate::partition::hash::{HASH_REDUCTION_VERSION, hash_bucket, hash_value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Partition membership predicate over the key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    Gte(String, Value),
    Lt(String, Value),
    And(Box<Predicate>, Box<Predicate>),
    HashBucketEq {
        column: String,
        bucket_count: u32,
        bucket_index: u32,
        version: u32,
    },
}

impl Predicate {
    pub fn and(self, rhs: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(rhs))
    }

    /// Recovers `[lower, upper)` from a range constraint.
    pub fn range_bounds(&self) -> Option<(Bound, Bound)> {
        match self {
            Predicate::Gte(_, v) => Some((Bound::Finite(v.clone()), Bound::PositiveInfinity)),
            Predicate::Lt(_, v) => Some((Bound::NegativeInfinity, Bound::Finite(v.clone()))),
            Predicate::And(l, r) => match (l.as_ref(), r.as_ref()) {
                (Predicate::Gte(_, lo), Predicate::Lt(_, hi))
                | (Predicate::Lt(_, hi), Predicate::Gte(_, lo)) => {
                    Some((Bound::Finite(lo.clone()), Bound::Finite(hi.clone())))
                }
                _ => None,
            },
            Predicate::HashBucketEq { .. } => None,
        }
    }

    /// Recovers `(bucket_count, bucket_index)` from a hash constraint.
    pub fn hash_bucket(&self) -> Option<(u32, u32)> {
        match self {
            Predicate::HashBucketEq {
                bucket_count,
                bucket_index,
                ..
            } => Some((*bucket_count, *bucket_index)),
            _ => None,
        }
    }

    /// Evaluates the predicate against a row of `schema`. A NULL key never
    /// satisfies a partition constraint.
    pub fn eval(
        &self,
        schema: &TableSchema,
        row: &Row,
        ops: &dyn TypeOps,
        collation: Collation,
    ) -> Result<bool, AutopartError> {
        match self {
            Predicate::Gte(column, bound) => {
                Ok(compare_column(schema, row, column, bound, ops, collation)?
                    .is_some_and(|ord| ord != Ordering::Less))
            }
            Predicate::Lt(column, bound) => {
                Ok(compare_column(schema, row, column, bound, ops, collation)?
                    .is_some_and(|ord| ord == Ordering::Less))
            }
            Predicate::And(l, r) => {
                Ok(l.eval(schema, row, ops, collation)? && r.eval(schema, row, ops, collation)?)
            }
            Predicate::HashBucketEq {
                column,
                bucket_count,
                bucket_index,
                version,
            } => {
                if *version != HASH_REDUCTION_VERSION {
                    return Err(AutopartError::UnsupportedOperation(format!(
                        "hash reduction version {version}"
                    )));
                }
                let value = column_value(schema, row, column)?;
                if value.is_null() {
                    return Ok(false);
                }
                Ok(hash_bucket(hash_value(value)?, *bucket_count)? == *bucket_index)
            }
        }
    }
}

fn column_value<'a>(
    schema: &TableSchema,
    row: &'a Row,
    column: &str,
) -> Result<&'a Value, AutopartError> {
    let idx = schema.column_index(column).ok_or_else(|| {
        AutopartError::Validation(format!(
            "column \"{column}\" does not exist in \"{}\"",
            schema.table_name
        ))
    })?;
    row.values.get(idx).ok_or_else(|| {
        AutopartError::Validation(format!(
            "row has {} values, expected at least {}",
            row.values.len(),
            idx + 1
        ))
    })
}

fn compare_column(
    schema: &TableSchema,
    row: &Row,
    column: &str,
    bound: &Value,
    ops: &dyn TypeOps,
    collation: Collation,
) -> Result<Option<Ordering>, AutopartError> {
    let value = column_value(schema, row, column)?;
    let (Some(value_type), Some(bound_type)) = (value.value_type(), bound.value_type()) else {
        return Ok(None);
    };
    let cmp = ops.comparator(&value_type, &bound_type, collation)?;
    Ok(Some(cmp.compare(value, bound)?))
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Gte(c, v) => write!(f, "({c} >= {})", Literal(v)),
            Predicate::Lt(c, v) => write!(f, "({c} < {})", Literal(v)),
            Predicate::And(l, r) => write!(f, "{l} AND {r}"),
            Predicate::HashBucketEq {
                column,
                bucket_count,
                bucket_index,
                ..
            } => write!(f, "hash_bucket(hash({column}), {bucket_count}) = {bucket_index}"),
        }
    }
}

struct Literal<'a>(&'a Value);

impl fmt::Display for Literal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::Null => {
                write!(f, "{}", self.0)
            }
            other => write!(f, "'{}'", other.to_string().replace('\'', "''")),
        }
    }
}

/// `(expr >= lower) AND (expr < upper)`, omitting infinite sides.
pub fn build_range_constraint(
    expr: &str,
    lower: &Bound,
    upper: &Bound,
    key_type: &ColumnType,
) -> Result<Predicate, AutopartError> {
    if matches!(lower, Bound::PositiveInfinity) || matches!(upper, Bound::NegativeInfinity) {
        return Err(AutopartError::Validation(format!(
            "invalid range bounds [{lower}, {upper})"
        )));
    }
    for value in [lower.finite(), upper.finite()].into_iter().flatten() {
        let Some(value_type) = value.value_type() else {
            return Err(AutopartError::Validation(
                "range bound must not be NULL".into(),
            ));
        };
        Comparator::for_types(key_type, &value_type, Collation::Binary)?;
    }
    match (lower, upper) {
        (Bound::Finite(lo), Bound::Finite(hi)) => {
            let lo_type = lo.value_type().unwrap_or(ColumnType::Json);
            let hi_type = hi.value_type().unwrap_or(ColumnType::Json);
            let cmp = Comparator::for_types(&lo_type, &hi_type, Collation::Binary)?;
            if cmp.compare(lo, hi)? != Ordering::Less {
                return Err(AutopartError::Validation(format!(
                    "lower bound {lo} must be less than upper bound {hi}"
                )));
            }
            Ok(Predicate::Gte(expr.to_string(), lo.clone())
                .and(Predicate::Lt(expr.to_string(), hi.clone())))
        }
        (Bound::Finite(lo), _) => Ok(Predicate::Gte(expr.to_string(), lo.clone())),
        (_, Bound::Finite(hi)) => Ok(Predicate::Lt(expr.to_string(), hi.clone())),
        _ => Err(AutopartError::Validation(
            "cannot create partition with range (-inf, +inf)".into(),
        )),
    }
}

/// `hash_bucket(hash(expr), count) = idx`.
pub fn build_hash_constraint(
    expr: &str,
    bucket_index: u32,
    bucket_count: u32,
    key_type: &ColumnType,
) -> Result<Predicate, AutopartError> {
    if bucket_count == 0 {
        return Err(AutopartError::Validation(
            "hash partitioning needs at least one bucket".into(),
        ));
    }
    if bucket_index >= bucket_count {
        return Err(AutopartError::Validation(format!(
            "bucket index {bucket_index} out of range for {bucket_count} buckets"
        )));
    }
    if matches!(key_type.base_type(), ColumnType::Json) {
        return Err(AutopartError::UnsupportedOperation(format!(
            "cannot hash-partition by {key_type}"
        )));
    }
    Ok(Predicate::HashBucketEq {
        column: expr.to_string(),
        bucket_count,
        bucket_index,
        version: HASH_REDUCTION_VERSION,
    })
}

pub fn constraint_name(partition_name: &str) -> String {
    format!("{partition_name}_partition_check")
}

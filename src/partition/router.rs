use crate::catalog::ops::{Comparator, TypeOps};
use crate::catalog::types::{ColumnType, TableId, Value};
use crate::error::AutopartError;
use crate::partition::hash::{hash_bucket, hash_value};
use crate::partition::map::{PartitionLayout, PartitionMap, RangeEntry};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    None,
    One(TableId),
    /// Overlapping metadata. Never retriable.
    Many(Vec<TableId>),
}

/// Resolves the comparator for routing `value_type` values through `map`.
pub fn value_comparator(
    map: &PartitionMap,
    value_type: &ColumnType,
    ops: &dyn TypeOps,
) -> Result<Comparator, AutopartError> {
    ops.comparator(&map.key_type, value_type, map.collation)
}

/// Finds the partitions that must hold `value`. `cmp` has to be resolved for
/// the key type and `value_type`; no implicit coercion happens here.
pub fn locate(
    map: &PartitionMap,
    value: &Value,
    value_type: &ColumnType,
    cmp: &Comparator,
) -> Result<Located, AutopartError> {
    if value.is_null() {
        return Err(AutopartError::NullPartitionKey);
    }
    match &map.layout {
        PartitionLayout::Hash(buckets) => {
            if buckets.is_empty() {
                return Err(AutopartError::Validation(format!(
                    "hash-partitioned table {} has zero buckets",
                    map.parent
                )));
            }
            if !value_type.same_base(&map.key_type) {
                return Err(AutopartError::TypeMismatch {
                    expected: map.key_type.to_string(),
                    actual: value_type.to_string(),
                });
            }
            let bucket = hash_bucket(hash_value(value)?, buckets.len() as u32)?;
            Ok(match buckets.get(bucket as usize).copied().flatten() {
                Some(id) => Located::One(id),
                None => Located::None,
            })
        }
        PartitionLayout::Range(entries) => {
            reject_nan(value)?;
            if map.has_overlaps() {
                return locate_scan(entries, value, cmp);
            }
            let idx = upper_partition_point(entries, value, cmp)?;
            let Some(candidate) = idx.checked_sub(1).and_then(|i| entries.get(i)) else {
                return Ok(Located::None);
            };
            if candidate.upper.compare_value(value, cmp)? == Ordering::Greater {
                Ok(Located::One(candidate.partition_id))
            } else {
                Ok(Located::None)
            }
        }
    }
}

/// `locate`, with overlap surfaced as `AmbiguousRouting`.
pub fn locate_one(
    map: &PartitionMap,
    value: &Value,
    value_type: &ColumnType,
    cmp: &Comparator,
) -> Result<Option<TableId>, AutopartError> {
    match locate(map, value, value_type, cmp)? {
        Located::None => Ok(None),
        Located::One(id) => Ok(Some(id)),
        Located::Many(partitions) => Err(AutopartError::AmbiguousRouting {
            key: value.to_string(),
            partitions,
        }),
    }
}

/// NaN sorts above every finite bound, so no range can ever cover it.
pub(crate) fn reject_nan(value: &Value) -> Result<(), AutopartError> {
    if let Value::Float(f) = value
        && f.is_nan()
    {
        return Err(AutopartError::Validation(
            "range partitioning key must not be NaN".into(),
        ));
    }
    Ok(())
}

/// Index of the first entry whose `lower` is greater than `value`.
fn upper_partition_point(
    entries: &[RangeEntry],
    value: &Value,
    cmp: &Comparator,
) -> Result<usize, AutopartError> {
    let (mut lo, mut hi) = (0usize, entries.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if entries[mid].lower.compare_value(value, cmp)? == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

fn locate_scan(
    entries: &[RangeEntry],
    value: &Value,
    cmp: &Comparator,
) -> Result<Located, AutopartError> {
    let mut hits = Vec::new();
    for entry in entries {
        if entry.lower.compare_value(value, cmp)? != Ordering::Greater
            && entry.upper.compare_value(value, cmp)? == Ordering::Greater
        {
            hits.push(entry.partition_id);
        }
    }
    Ok(match hits.len() {
        0 => Located::None,
        1 => Located::One(hits[0]),
        _ => Located::Many(hits),
    })
}

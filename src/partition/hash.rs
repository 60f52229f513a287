//! Stable hashing for hash partitioning.
//!
//! Bucket assignment is persisted implicitly in every hash partition's check
//! constraint, so both the byte encoding and the reduction are versioned and
//! must never change for an existing version number.

use crate::catalog::types::Value;
use crate::error::AutopartError;

pub const HASH_REDUCTION_VERSION: u32 = 1;

/// crc32c over a one-byte type tag followed by the canonical value bytes.
pub fn hash_value(value: &Value) -> Result<u32, AutopartError> {
    let mut buf = Vec::with_capacity(16);
    match value {
        Value::Integer(v) => {
            buf.push(1);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Float(v) => {
            let canonical = if *v == 0.0 {
                0.0f64
            } else if v.is_nan() {
                f64::NAN
            } else {
                *v
            };
            buf.push(2);
            buf.extend_from_slice(&canonical.to_bits().to_le_bytes());
        }
        Value::Text(v) => {
            buf.push(3);
            buf.extend_from_slice(v.as_bytes());
        }
        Value::Boolean(v) => {
            buf.push(4);
            buf.push(u8::from(*v));
        }
        Value::Date(v) => {
            buf.push(5);
            buf.extend_from_slice(&chrono::Datelike::num_days_from_ce(v).to_le_bytes());
        }
        Value::Timestamp(v) => {
            buf.push(6);
            buf.extend_from_slice(&v.and_utc().timestamp_micros().to_le_bytes());
        }
        Value::Interval(v) => {
            buf.push(7);
            buf.extend_from_slice(&v.months.to_le_bytes());
            buf.extend_from_slice(&v.days.to_le_bytes());
            buf.extend_from_slice(&v.micros.to_le_bytes());
        }
        Value::Json(v) => {
            buf.push(8);
            buf.extend_from_slice(v.as_bytes());
        }
        Value::Null => return Err(AutopartError::NullPartitionKey),
    }
    Ok(crc32c::crc32c(&buf))
}

/// Version 1 reduction: plain modulo.
pub fn hash_bucket(hash: u32, bucket_count: u32) -> Result<u32, AutopartError> {
    if bucket_count == 0 {
        return Err(AutopartError::Validation(
            "hash partitioning needs at least one bucket".into(),
        ));
    }
    Ok(hash % bucket_count)
}

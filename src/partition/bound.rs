use crate::catalog::ops::Comparator;
use crate::catalog::types::Value;
use crate::error::AutopartError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Range boundary: a finite key value or one of the two open ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Bound {
    NegativeInfinity,
    Finite(Value),
    PositiveInfinity,
}

impl Bound {
    pub fn is_infinite(&self) -> bool {
        !matches!(self, Bound::Finite(_))
    }

    pub fn finite(&self) -> Option<&Value> {
        match self {
            Bound::Finite(v) => Some(v),
            _ => None,
        }
    }

    /// Orders two bounds. Finite values go through `cmp`, which must be
    /// resolved for their types.
    pub fn compare(&self, other: &Bound, cmp: &Comparator) -> Result<Ordering, AutopartError> {
        Ok(match (self, other) {
            (Bound::NegativeInfinity, Bound::NegativeInfinity)
            | (Bound::PositiveInfinity, Bound::PositiveInfinity) => Ordering::Equal,
            (Bound::NegativeInfinity, _) | (_, Bound::PositiveInfinity) => Ordering::Less,
            (_, Bound::NegativeInfinity) | (Bound::PositiveInfinity, _) => Ordering::Greater,
            (Bound::Finite(a), Bound::Finite(b)) => cmp.compare(a, b)?,
        })
    }

    /// Orders this bound against a finite value.
    pub fn compare_value(&self, value: &Value, cmp: &Comparator) -> Result<Ordering, AutopartError> {
        match self {
            Bound::NegativeInfinity => Ok(Ordering::Less),
            Bound::PositiveInfinity => Ok(Ordering::Greater),
            Bound::Finite(b) => cmp.compare(b, value),
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::NegativeInfinity => write!(f, "-inf"),
            Bound::PositiveInfinity => write!(f, "+inf"),
            Bound::Finite(v) => write!(f, "{v}"),
        }
    }
}

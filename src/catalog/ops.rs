use crate::catalog::types::{Collation, ColumnType, Interval, Value};
use crate::error::AutopartError;
use chrono::{Days, Months, NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArithOp::Add => write!(f, "+"),
            ArithOp::Sub => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareFamily {
    Numeric,
    Temporal,
    Text,
    Boolean,
    Interval,
}

impl CompareFamily {
    fn name(self) -> &'static str {
        match self {
            CompareFamily::Numeric => "numeric",
            CompareFamily::Temporal => "date/time",
            CompareFamily::Text => "text",
            CompareFamily::Boolean => "boolean",
            CompareFamily::Interval => "interval",
        }
    }
}

fn family_of(ty: &ColumnType) -> Option<CompareFamily> {
    match ty.base_type() {
        ColumnType::Integer | ColumnType::Float => Some(CompareFamily::Numeric),
        ColumnType::Date | ColumnType::Timestamp => Some(CompareFamily::Temporal),
        ColumnType::Text => Some(CompareFamily::Text),
        ColumnType::Boolean => Some(CompareFamily::Boolean),
        ColumnType::Interval => Some(CompareFamily::Interval),
        ColumnType::Json | ColumnType::Domain { .. } => None,
    }
}

/// Typed three-way comparison resolved for a (left, right) type pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comparator {
    family: CompareFamily,
    collation: Collation,
}

impl Comparator {
    pub fn for_types(
        left: &ColumnType,
        right: &ColumnType,
        collation: Collation,
    ) -> Result<Self, AutopartError> {
        let (Some(lf), Some(rf)) = (family_of(left), family_of(right)) else {
            return Err(AutopartError::UnsupportedOperation(format!(
                "no ordering operator for {left} and {right}"
            )));
        };
        if lf != rf {
            return Err(AutopartError::TypeMismatch {
                expected: left.to_string(),
                actual: right.to_string(),
            });
        }
        Ok(Self {
            family: lf,
            collation,
        })
    }

    pub fn collation(&self) -> Collation {
        self.collation
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Result<Ordering, AutopartError> {
        let ord = match (self.family, a, b) {
            (CompareFamily::Numeric, Value::Integer(x), Value::Integer(y)) => x.cmp(y),
            (CompareFamily::Numeric, Value::Integer(x), Value::Float(y)) => (*x as f64).total_cmp(y),
            (CompareFamily::Numeric, Value::Float(x), Value::Integer(y)) => x.total_cmp(&(*y as f64)),
            (CompareFamily::Numeric, Value::Float(x), Value::Float(y)) => x.total_cmp(y),
            (CompareFamily::Temporal, Value::Date(x), Value::Date(y)) => x.cmp(y),
            (CompareFamily::Temporal, Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
            (CompareFamily::Temporal, Value::Date(x), Value::Timestamp(y)) => midnight(*x)?.cmp(y),
            (CompareFamily::Temporal, Value::Timestamp(x), Value::Date(y)) => x.cmp(&midnight(*y)?),
            (CompareFamily::Text, Value::Text(x), Value::Text(y)) => match self.collation {
                Collation::Binary => x.cmp(y),
                Collation::CaseInsensitive => x.to_lowercase().cmp(&y.to_lowercase()),
            },
            (CompareFamily::Boolean, Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
            (CompareFamily::Interval, Value::Interval(x), Value::Interval(y)) => x.cmp(y),
            _ => {
                let offending = if family_mismatch(self.family, a) { a } else { b };
                return Err(AutopartError::TypeMismatch {
                    expected: self.family.name().to_string(),
                    actual: describe(offending),
                });
            }
        };
        Ok(ord)
    }
}

fn family_mismatch(family: CompareFamily, v: &Value) -> bool {
    v.value_type()
        .and_then(|t| family_of(&t))
        .is_none_or(|f| f != family)
}

fn describe(v: &Value) -> String {
    v.value_type()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "null".to_string())
}

/// Resolved `bound (+|-) interval` operator.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOperator {
    pub bound_type: ColumnType,
    pub result_type: ColumnType,
    pub op: ArithOp,
    pub interval: Value,
}

impl StepOperator {
    pub fn widens(&self) -> bool {
        !self.result_type.same_base(&self.bound_type)
    }
}

/// Type-system collaborator: comparison, interval arithmetic and casts.
pub trait TypeOps: Send + Sync {
    fn comparator(
        &self,
        left: &ColumnType,
        right: &ColumnType,
        collation: Collation,
    ) -> Result<Comparator, AutopartError> {
        Comparator::for_types(left, right, collation)
    }

    fn step_operator(
        &self,
        bound_type: &ColumnType,
        interval: &Value,
        op: ArithOp,
    ) -> Result<StepOperator, AutopartError>;

    fn apply_step(&self, step: &StepOperator, value: &Value) -> Result<Value, AutopartError>;

    fn cast(&self, value: &Value, target: &ColumnType) -> Result<Value, AutopartError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTypeOps;

impl TypeOps for BuiltinTypeOps {
    fn step_operator(
        &self,
        bound_type: &ColumnType,
        interval: &Value,
        op: ArithOp,
    ) -> Result<StepOperator, AutopartError> {
        let Some(interval_type) = interval.value_type() else {
            return Err(AutopartError::Validation(
                "partitioning interval must not be NULL".into(),
            ));
        };
        let result_base = match (bound_type.base_type(), &interval_type) {
            (ColumnType::Integer, ColumnType::Integer) => ColumnType::Integer,
            (ColumnType::Integer | ColumnType::Float, ColumnType::Integer | ColumnType::Float) => {
                ColumnType::Float
            }
            (ColumnType::Date, ColumnType::Integer) => ColumnType::Date,
            (ColumnType::Date | ColumnType::Timestamp, ColumnType::Interval) => {
                ColumnType::Timestamp
            }
            (bound, iv) => {
                return Err(AutopartError::UnsupportedOperation(format!(
                    "operator does not exist: {bound} {op} {iv}"
                )));
            }
        };
        let result_type = if bound_type.base_type() == &result_base {
            bound_type.clone()
        } else {
            result_base
        };
        Ok(StepOperator {
            bound_type: bound_type.clone(),
            result_type,
            op,
            interval: interval.clone(),
        })
    }

    fn apply_step(&self, step: &StepOperator, value: &Value) -> Result<Value, AutopartError> {
        let overflow = || AutopartError::Overflow(format!("{value} {} {}", step.op, step.interval));
        let out = match (value, &step.interval) {
            (Value::Integer(a), Value::Integer(b)) => Value::Integer(
                match step.op {
                    ArithOp::Add => a.checked_add(*b),
                    ArithOp::Sub => a.checked_sub(*b),
                }
                .ok_or_else(overflow)?,
            ),
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                let a = as_f64(value);
                let b = as_f64(&step.interval);
                let r = match step.op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                };
                if !r.is_finite() {
                    return Err(overflow());
                }
                Value::Float(r)
            }
            (Value::Date(d), Value::Integer(n)) => {
                let days = Days::new(n.unsigned_abs());
                let forward = (*n >= 0) == (step.op == ArithOp::Add);
                Value::Date(
                    if forward {
                        d.checked_add_days(days)
                    } else {
                        d.checked_sub_days(days)
                    }
                    .ok_or_else(overflow)?,
                )
            }
            (Value::Date(d), Value::Interval(iv)) => {
                Value::Timestamp(shift_timestamp(midnight(*d)?, iv, step.op).ok_or_else(overflow)?)
            }
            (Value::Timestamp(ts), Value::Interval(iv)) => {
                Value::Timestamp(shift_timestamp(*ts, iv, step.op).ok_or_else(overflow)?)
            }
            _ => {
                return Err(AutopartError::TypeMismatch {
                    expected: step.bound_type.to_string(),
                    actual: describe(value),
                });
            }
        };
        Ok(out)
    }

    fn cast(&self, value: &Value, target: &ColumnType) -> Result<Value, AutopartError> {
        let Some(source) = value.value_type() else {
            return Ok(Value::Null);
        };
        if source.same_base(target) {
            return Ok(value.clone());
        }
        let mismatch = || AutopartError::TypeMismatch {
            expected: target.to_string(),
            actual: source.to_string(),
        };
        match (value, target.base_type()) {
            (Value::Integer(v), ColumnType::Float) => Ok(Value::Float(*v as f64)),
            (Value::Float(v), ColumnType::Integer) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 {
                    Ok(Value::Integer(*v as i64))
                } else {
                    Err(mismatch())
                }
            }
            (Value::Date(d), ColumnType::Timestamp) => Ok(Value::Timestamp(midnight(*d)?)),
            (Value::Timestamp(ts), ColumnType::Date) => {
                if ts.num_seconds_from_midnight() == 0 && ts.nanosecond() == 0 {
                    Ok(Value::Date(ts.date()))
                } else {
                    Err(mismatch())
                }
            }
            _ => Err(mismatch()),
        }
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

pub(crate) fn midnight(d: NaiveDate) -> Result<NaiveDateTime, AutopartError> {
    d.and_hms_opt(0, 0, 0)
        .ok_or_else(|| AutopartError::Overflow(format!("{d} at midnight")))
}

fn shift_timestamp(ts: NaiveDateTime, iv: &Interval, op: ArithOp) -> Option<NaiveDateTime> {
    let sign: i64 = match op {
        ArithOp::Add => 1,
        ArithOp::Sub => -1,
    };
    let months = i64::from(iv.months) * sign;
    let shifted = if months >= 0 {
        ts.checked_add_months(Months::new(u32::try_from(months).ok()?))?
    } else {
        ts.checked_sub_months(Months::new(u32::try_from(-months).ok()?))?
    };
    let days = TimeDelta::try_days(i64::from(iv.days) * sign)?;
    let micros = TimeDelta::microseconds(iv.micros.checked_mul(sign)?);
    shifted.checked_add_signed(days)?.checked_add_signed(micros)
}

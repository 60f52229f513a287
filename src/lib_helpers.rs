use super::*;

pub(crate) fn key_column<'s>(
    schema: &'s TableSchema,
    key: &str,
) -> Result<&'s ColumnDef, AutopartError> {
    schema
        .columns
        .iter()
        .find(|c| c.name == key)
        .ok_or_else(|| {
            AutopartError::Validation(format!(
                "column \"{key}\" does not exist in \"{}\"",
                schema.table_name
            ))
        })
}

/// The interval must have a forward step operator for the key type and move
/// the bound strictly forward.
pub(crate) fn validate_interval(
    key_type: &ColumnType,
    interval: &Value,
    ops: &dyn TypeOps,
) -> Result<(), AutopartError> {
    let positive = match interval {
        Value::Integer(n) => *n > 0,
        Value::Float(f) => f.is_finite() && *f > 0.0,
        Value::Interval(iv) => !iv.is_zero() && iv.months >= 0 && iv.days >= 0 && iv.micros >= 0,
        Value::Null => {
            return Err(AutopartError::InvalidConfig {
                message: "interval must not be NULL".into(),
            });
        }
        other => {
            return Err(AutopartError::InvalidConfig {
                message: format!("interval {other} is not a numeric or interval value"),
            });
        }
    };
    if !positive {
        return Err(AutopartError::InvalidConfig {
            message: format!("interval {interval} must be greater than zero"),
        });
    }
    ops.step_operator(key_type, interval, ArithOp::Add)?;
    Ok(())
}

/// `count` adjacent ranges starting at `start`, each `interval` wide.
pub(crate) fn consecutive_bounds(
    start: &Value,
    interval: &Value,
    count: usize,
    key_type: &ColumnType,
    ops: &dyn TypeOps,
) -> Result<Vec<(Bound, Bound)>, AutopartError> {
    let start = if start
        .value_type()
        .is_some_and(|t| t.same_base(key_type))
    {
        start.clone()
    } else {
        ops.cast(start, key_type)?
    };
    let Some(start_type) = start.value_type() else {
        return Err(AutopartError::NullPartitionKey);
    };
    let mut step = ops.step_operator(&start_type, interval, ArithOp::Add)?;
    let mut edge = start;
    if step.widens() {
        edge = ops.cast(&edge, &step.result_type)?;
        step = ops.step_operator(&step.result_type, interval, ArithOp::Add)?;
    }
    let mut bounds = Vec::with_capacity(count);
    for _ in 0..count {
        let next = ops.apply_step(&step, &edge)?;
        bounds.push((Bound::Finite(edge), Bound::Finite(next.clone())));
        edge = next;
    }
    Ok(bounds)
}

/// Re-derives the constraint `partition` should carry from its own bounds.
pub(crate) fn rederive_constraint(
    config: &PartitioningConfig,
    predicate: &Predicate,
) -> Result<Predicate, AutopartError> {
    if let Some((lower, upper)) = predicate.range_bounds() {
        return build_range_constraint(&config.key, &lower, &upper, &config.key_type);
    }
    if let Some((count, index)) = predicate.hash_bucket() {
        return build_hash_constraint(&config.key, index, count, &config.key_type);
    }
    Err(AutopartError::Validation(format!(
        "unrecognised partition constraint {predicate}"
    )))
}

use crate::catalog::ops::{ArithOp, Comparator, StepOperator, TypeOps};
use crate::catalog::types::{ColumnType, TableId, Value};
use crate::error::AutopartError;
use crate::partition::bound::Bound;
use crate::partition::create::PartitionFactory;
use crate::partition::map::{PartitionLayout, PartitionMap};
use crate::partition::router::reject_nan;
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Append,
    Prepend,
}

impl Direction {
    fn op(self) -> ArithOp {
        match self {
            Direction::Append => ArithOp::Add,
            Direction::Prepend => ArithOp::Sub,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Direction::Append => "append",
            Direction::Prepend => "prepend",
        }
    }
}

/// Type of the moving edge. Only one `Declared -> Widened` transition exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundTypeState {
    Declared(ColumnType),
    Widened(ColumnType),
}

impl BoundTypeState {
    pub fn current(&self) -> &ColumnType {
        match self {
            BoundTypeState::Declared(t) | BoundTypeState::Widened(t) => t,
        }
    }

    fn widen(&self, to: ColumnType) -> Result<Self, AutopartError> {
        match self {
            BoundTypeState::Declared(_) => Ok(BoundTypeState::Widened(to)),
            BoundTypeState::Widened(from) => Err(AutopartError::ArithmeticOverflowOnCast {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

/// Steps needed to extend range coverage up to a target value.
#[derive(Debug, Clone)]
pub struct SpawnPlan {
    pub parent: TableId,
    pub direction: Direction,
    pub target: Value,
    state: BoundTypeState,
    step: StepOperator,
    cmp: Comparator,
    leading: Value,
    steps_taken: usize,
    max_steps: usize,
}

impl SpawnPlan {
    pub fn new(
        map: &PartitionMap,
        target: &Value,
        target_type: &ColumnType,
        interval: &Value,
        ops: &dyn TypeOps,
        max_steps: usize,
    ) -> Result<Self, AutopartError> {
        if let PartitionLayout::Hash(_) = map.layout {
            return Err(AutopartError::UnsupportedOperation(
                "hash partitions are never spawned".into(),
            ));
        }
        if target.is_null() {
            return Err(AutopartError::NullPartitionKey);
        }
        reject_nan(target)?;
        let Some((min, max)) = map.absolute_bounds() else {
            return Err(AutopartError::UnboundedExtension {
                reason: "table has no range partitions to extend".into(),
            });
        };
        if min.is_infinite() && max.is_infinite() {
            return Err(AutopartError::UnboundedExtension {
                reason: "both bounds are infinite".into(),
            });
        }
        let cmp = ops.comparator(&map.key_type, target_type, map.collation)?;
        let (direction, edge) = choose_direction(map, target, min, max, &cmp)?;

        let declared = if edge.value_type().is_some_and(|t| t.same_base(&map.key_type)) {
            map.key_type.clone()
        } else {
            edge.value_type().unwrap_or_else(|| map.key_type.clone())
        };
        let mut state = BoundTypeState::Declared(declared);
        let mut step = ops.step_operator(state.current(), interval, direction.op())?;
        let mut leading = edge.clone();
        let mut cmp = cmp;
        if step.widens() {
            leading = ops.cast(&leading, &step.result_type)?;
            state = state.widen(step.result_type.clone())?;
            cmp = ops.comparator(target_type, state.current(), map.collation)?;
            step = ops.step_operator(state.current(), interval, direction.op())?;
            if step.widens() {
                state.widen(step.result_type.clone())?;
            }
        }
        Ok(Self {
            parent: map.parent,
            direction,
            target: target.clone(),
            state,
            step,
            cmp,
            leading,
            steps_taken: 0,
            max_steps,
        })
    }

    pub fn bound_type(&self) -> &BoundTypeState {
        &self.state
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// Every remaining `[lower, upper)` up to the target. Fails with
    /// `SpawnLimitExceeded` before returning anything when the cap is hit.
    pub fn remaining_steps(
        &mut self,
        ops: &dyn TypeOps,
    ) -> Result<Vec<(Bound, Bound)>, AutopartError> {
        let mut steps = Vec::new();
        while let Some(step) = self.next_step(ops)? {
            steps.push(step);
        }
        Ok(steps)
    }

    /// Next `[lower, upper)` to create, or `None` once the target is covered.
    pub fn next_step(&mut self, ops: &dyn TypeOps) -> Result<Option<(Bound, Bound)>, AutopartError> {
        let ord = self.cmp.compare(&self.target, &self.leading)?;
        let uncovered = match self.direction {
            Direction::Append => ord != Ordering::Less,
            Direction::Prepend => ord == Ordering::Less,
        };
        if !uncovered {
            return Ok(None);
        }
        if self.steps_taken >= self.max_steps {
            return Err(AutopartError::SpawnLimitExceeded {
                limit: self.max_steps,
            });
        }
        let following = self.leading.clone();
        let leading = ops.apply_step(&self.step, &following)?;
        let moved = self.cmp.compare(&leading, &following)?;
        let progresses = match self.direction {
            Direction::Append => moved == Ordering::Greater,
            Direction::Prepend => moved == Ordering::Less,
        };
        if !progresses {
            return Err(AutopartError::Validation(format!(
                "interval {} does not move bound {following}",
                self.step.interval
            )));
        }
        self.leading = leading.clone();
        self.steps_taken += 1;
        Ok(Some(match self.direction {
            Direction::Append => (Bound::Finite(following), Bound::Finite(leading)),
            Direction::Prepend => (Bound::Finite(leading), Bound::Finite(following)),
        }))
    }
}

fn choose_direction<'m>(
    map: &'m PartitionMap,
    target: &Value,
    min: &'m Bound,
    max: &'m Bound,
    cmp: &Comparator,
) -> Result<(Direction, &'m Value), AutopartError> {
    if let Some(edge) = max.finite()
        && cmp.compare(edge, target)? != Ordering::Greater
    {
        return Ok((Direction::Append, edge));
    }
    if let Some(edge) = min.finite()
        && cmp.compare(edge, target)? == Ordering::Greater
    {
        return Ok((Direction::Prepend, edge));
    }
    let entries = map.range_entries();
    let beyond_last = entries
        .last()
        .map(|e| e.lower.compare_value(target, cmp))
        .transpose()?
        .is_some_and(|o| o != Ordering::Greater);
    if max.is_infinite() && beyond_last {
        return Err(AutopartError::UnboundedExtension {
            reason: format!("value {target} lies past an upper bound of +inf"),
        });
    }
    let before_first = entries
        .first()
        .map(|e| e.upper.compare_value(target, cmp))
        .transpose()?
        .is_some_and(|o| o == Ordering::Greater);
    if min.is_infinite() && before_first {
        return Err(AutopartError::UnboundedExtension {
            reason: format!("value {target} lies past a lower bound of -inf"),
        });
    }
    Err(AutopartError::CoverageGap {
        key: target.to_string(),
    })
}

/// Executes a `SpawnPlan` one partition at a time.
pub struct RangeSpawner<'a> {
    factory: &'a PartitionFactory<'a>,
    ops: &'a dyn TypeOps,
}

impl<'a> RangeSpawner<'a> {
    pub fn new(factory: &'a PartitionFactory<'a>, ops: &'a dyn TypeOps) -> Self {
        Self { factory, ops }
    }

    /// Runs until the target is covered and returns the last partition created.
    /// The whole plan is computed first, so an over-cap plan creates nothing.
    /// A failing step aborts; partitions created so far stay.
    pub fn run(&self, plan: &mut SpawnPlan) -> Result<TableId, AutopartError> {
        let steps = plan.remaining_steps(self.ops)?;
        let mut last = None;
        for (lower, upper) in &steps {
            last = Some(self.execute_step(plan, lower, upper)?);
        }
        last.ok_or_else(|| AutopartError::NoSuitablePartition {
            key: plan.target.to_string(),
        })
    }

    pub fn execute_step(
        &self,
        plan: &SpawnPlan,
        lower: &Bound,
        upper: &Bound,
    ) -> Result<TableId, AutopartError> {
        let id = self
            .factory
            .create_range_partition(plan.parent, lower, upper, None, None)?;
        debug!(
            parent = %plan.parent,
            partition = %id,
            direction = plan.direction.as_str(),
            lower = %lower,
            upper = %upper,
            "spawned partition"
        );
        Ok(id)
    }
}

use crate::catalog::ops::TypeOps;
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Row, TableId, Value};
use crate::error::AutopartError;
use crate::partition::arbiter::CreationArbiter;
use crate::partition::cache::ResultPartitionCache;
use crate::partition::map::PartitionMap;
use crate::partition::router::{locate_one, value_comparator};
use crate::session::SessionContext;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertResult {
    pub rows_inserted: usize,
    /// Leaf partitions written, ascending.
    pub partitions: Vec<TableId>,
}

/// Routes the rows of one write statement into leaf partitions.
pub struct PartitionFilter<'a> {
    arbiter: &'a CreationArbiter,
    session: SessionContext,
    parent: TableId,
    cache: ResultPartitionCache<'a>,
}

impl<'a> PartitionFilter<'a> {
    pub fn begin(
        arbiter: &'a CreationArbiter,
        session: SessionContext,
        parent: TableId,
    ) -> Result<Self, AutopartError> {
        let cache = ResultPartitionCache::new(arbiter.core());
        Self::with_cache(arbiter, session, parent, cache)
    }

    pub fn with_cache(
        arbiter: &'a CreationArbiter,
        session: SessionContext,
        parent: TableId,
        cache: ResultPartitionCache<'a>,
    ) -> Result<Self, AutopartError> {
        arbiter.core().partitioning(parent)?;
        Ok(Self {
            arbiter,
            session,
            parent,
            cache,
        })
    }

    /// Routes one row, creating partitions on demand, and buffers it for the
    /// leaf it lands in.
    pub fn route(&mut self, row: Row) -> Result<TableId, AutopartError> {
        let core = self.arbiter.core();
        let root = core.store.current().catalog.table(self.parent)?.clone();
        let row = coerce_row(&root, row, core.ops.as_ref())?;
        let map = core.map(self.parent)?;
        self.descend(row, map)
    }

    /// Routes `row`, already shaped for `map.parent`, down to a leaf.
    fn descend(
        &mut self,
        mut row: Row,
        mut map: Arc<PartitionMap>,
    ) -> Result<TableId, AutopartError> {
        let arbiter = self.arbiter;
        let core = arbiter.core();
        let ops = core.ops.as_ref();
        loop {
            let level = core.store.current().catalog.table(map.parent)?.clone();
            let key_idx = level.column_index(&map.key).ok_or_else(|| {
                AutopartError::Validation(format!(
                    "partitioning key \"{}\" is missing from \"{}\"",
                    map.key, level.table_name
                ))
            })?;
            let key = row.values.get(key_idx).cloned().unwrap_or(Value::Null);
            let Some(value_type) = key.value_type() else {
                return Err(AutopartError::NullPartitionKey);
            };
            let cmp = value_comparator(&map, &value_type, ops)?;
            let partition = match locate_one(&map, &key, &value_type, &cmp)? {
                Some(id) => id,
                None => arbiter.obtain_partition(&self.session, map.parent, &key, &value_type)?,
            };
            self.refresh_handle(partition)?;
            let handle = self.cache.get(partition)?;
            row = handle.convert(row);
            if handle.is_partitioned() {
                map = handle.child_map(core)?;
                continue;
            }
            self.cache.buffer(partition, row);
            return Ok(partition);
        }
    }

    /// Reopens the handle for `partition` when its partitioning changed since
    /// it was opened. Rows already buffered for a partition that has become
    /// partitioned are routed on into its new children.
    fn refresh_handle(&mut self, partition: TableId) -> Result<(), AutopartError> {
        let arbiter = self.arbiter;
        let core = arbiter.core();
        let partitioned = core.store.current().catalog.partitioning(partition).is_some();
        if !self.cache.is_open(partition)
            || self.cache.get(partition)?.is_partitioned() == partitioned
        {
            return Ok(());
        }
        self.cache.invalidate(partition);
        debug!(partition = %partition, partitioned, "partition handle reopened");
        let handle = self.cache.get(partition)?;
        if !handle.is_partitioned() {
            return Ok(());
        }
        let children = handle.child_map(core)?;
        for row in self.cache.take_pending(partition) {
            self.descend(row, Arc::clone(&children))?;
        }
        Ok(())
    }

    /// Writes all buffered rows and closes the cache.
    pub fn finish(mut self) -> Result<InsertResult, AutopartError> {
        let partitions = self.cache.pending_partitions();
        let rows_inserted = self.cache.flush()?;
        self.cache.close();
        debug!(
            parent = %self.parent,
            session = %self.session.id,
            rows = rows_inserted,
            partitions = partitions.len(),
            "statement finished"
        );
        Ok(InsertResult {
            rows_inserted,
            partitions,
        })
    }

    /// Drops buffered rows. Partitions created by this statement stay.
    pub fn abort(mut self) {
        self.cache.close();
    }
}

/// Checks arity and NOT NULL, then casts every value to its column's type.
pub fn coerce_row(
    schema: &TableSchema,
    row: Row,
    ops: &dyn TypeOps,
) -> Result<Row, AutopartError> {
    if row.values.len() != schema.columns.len() {
        return Err(AutopartError::Validation(format!(
            "row has {} values but \"{}\" has {} columns",
            row.values.len(),
            schema.table_name,
            schema.columns.len()
        )));
    }
    let mut values = Vec::with_capacity(row.values.len());
    for (value, column) in row.values.into_iter().zip(&schema.columns) {
        if value.is_null() {
            if !column.nullable {
                return Err(AutopartError::Validation(format!(
                    "null value in column \"{}\" violates not-null constraint",
                    column.name
                )));
            }
            values.push(value);
            continue;
        }
        if value
            .value_type()
            .is_some_and(|t| t.same_base(&column.col_type))
        {
            values.push(value);
        } else {
            values.push(ops.cast(&value, column.col_type.base_type())?);
        }
    }
    Ok(Row::from_values(values))
}

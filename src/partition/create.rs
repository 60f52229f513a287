use crate::catalog::schema::{CheckConstraint, PartitionKind, PartitioningConfig};
use crate::catalog::types::TableId;
use crate::catalog::{PartitionCatalog, TableCreator};
use crate::error::AutopartError;
use crate::partition::bound::Bound;
use crate::partition::callback::{CallbackRegistry, init_payload};
use crate::partition::constraint::{
    Predicate, build_hash_constraint, build_range_constraint, constraint_name,
};
use crate::partition::map::PartitionMap;
use std::cmp::Ordering;
use tracing::debug;

/// Creates single partitions: name, table, constraint, then init callback.
pub struct PartitionFactory<'a> {
    pub catalog: &'a dyn PartitionCatalog,
    pub creator: &'a dyn TableCreator,
    pub callbacks: &'a CallbackRegistry,
}

impl<'a> PartitionFactory<'a> {
    pub fn new(
        catalog: &'a dyn PartitionCatalog,
        creator: &'a dyn TableCreator,
        callbacks: &'a CallbackRegistry,
    ) -> Self {
        Self {
            catalog,
            creator,
            callbacks,
        }
    }

    fn config(&self, parent: TableId) -> Result<PartitioningConfig, AutopartError> {
        self.catalog
            .read_partitioning_config(parent)
            .ok_or_else(|| AutopartError::NotPartitioned {
                table: self.catalog.snapshot().catalog.table_name(parent),
            })
    }

    /// Creates `[lower, upper)`. The bounds are not checked against existing
    /// partitions; see `check_range_available`.
    pub fn create_range_partition(
        &self,
        parent: TableId,
        lower: &Bound,
        upper: &Bound,
        name: Option<&str>,
        tablespace: Option<&str>,
    ) -> Result<TableId, AutopartError> {
        let config = self.config(parent)?;
        if config.mode.kind() != PartitionKind::Range {
            return Err(AutopartError::UnsupportedOperation(format!(
                "table {parent} is not range-partitioned"
            )));
        }
        let predicate = build_range_constraint(&config.key, lower, upper, &config.key_type)?;
        let name = match name {
            Some(n) => n.to_string(),
            None => self.creator.next_partition_name(parent)?,
        };
        let id = self.materialize(&config, &name, tablespace, predicate)?;
        debug!(
            parent = %parent,
            partition = %id,
            name = %name,
            lower = %lower,
            upper = %upper,
            "range partition created"
        );
        self.run_init_callback(&config, id, Some((lower, upper)))?;
        Ok(id)
    }

    /// Creates bucket `bucket_index` of `bucket_count`, named `<parent>_<idx>`.
    pub fn create_hash_partition(
        &self,
        parent: TableId,
        bucket_index: u32,
        bucket_count: u32,
        tablespace: Option<&str>,
    ) -> Result<TableId, AutopartError> {
        let config = self.config(parent)?;
        let predicate = build_hash_constraint(&config.key, bucket_index, bucket_count, &config.key_type)?;
        let parent_name = self.catalog.snapshot().catalog.table(parent)?.table_name.clone();
        let name = format!("{parent_name}_{bucket_index}");
        let id = self.materialize(&config, &name, tablespace, predicate)?;
        debug!(parent = %parent, partition = %id, bucket = bucket_index, "hash partition created");
        self.run_init_callback(&config, id, None)?;
        Ok(id)
    }

    fn materialize(
        &self,
        config: &PartitioningConfig,
        name: &str,
        tablespace: Option<&str>,
        predicate: Predicate,
    ) -> Result<TableId, AutopartError> {
        // Fail on a bad callback before anything becomes visible.
        self.callbacks
            .resolve_for_parent(config.parent, config.params.init_callback.as_deref())?;
        let id = self.creator.create_child_table(config.parent, name, tablespace)?;
        self.creator.attach_constraint(
            id,
            CheckConstraint {
                name: constraint_name(name),
                predicate,
            },
        )?;
        Ok(id)
    }

    fn run_init_callback(
        &self,
        config: &PartitioningConfig,
        partition: TableId,
        bounds: Option<(&Bound, &Bound)>,
    ) -> Result<(), AutopartError> {
        let spec = self
            .callbacks
            .resolve_for_parent(config.parent, config.params.init_callback.as_deref())?;
        if !spec.is_configured() {
            return Ok(());
        }
        let snapshot = self.catalog.snapshot();
        let parent_schema = snapshot.catalog.table(config.parent)?;
        let partition_schema = snapshot.catalog.table(partition)?;
        let payload = init_payload(parent_schema, partition_schema, config.mode.kind(), bounds);
        spec.invoke(&payload)
    }
}

/// Fails with `RangeOverlap` if `[lower, upper)` intersects any partition in `map`.
pub fn check_range_available(
    map: &PartitionMap,
    lower: &Bound,
    upper: &Bound,
) -> Result<(), AutopartError> {
    let cmp = map.comparator();
    for entry in map.range_entries() {
        let starts_before_end = lower.compare(&entry.upper, cmp)? == Ordering::Less;
        let ends_after_start = entry.lower.compare(upper, cmp)? == Ordering::Less;
        if starts_before_end && ends_after_start {
            return Err(AutopartError::RangeOverlap {
                start: lower.to_string(),
                end: upper.to_string(),
            });
        }
    }
    Ok(())
}

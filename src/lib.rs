pub mod async_bridge;
pub mod catalog;
pub mod config;
pub mod error;
mod lib_helpers;
pub mod partition;
pub mod session;

use crate::catalog::ops::{ArithOp, BuiltinTypeOps, TypeOps};
use crate::catalog::schema::{
    ColumnDef, Establishment, PartitionMode, PartitionParams, PartitionParamsUpdate,
    PartitioningConfig, TableAlteration, TableSchema,
};
use crate::catalog::types::{Collation, ColumnType, Row, TableId, Value};
use crate::catalog::{Catalog, CatalogSnapshot, CatalogStore};
use crate::config::AutopartConfig;
use crate::error::{AutopartError, ResourceType, not_found};
use crate::lib_helpers::*;
use crate::partition::arbiter::{ArbiterCore, ArbiterMetricsSnapshot, CreationArbiter};
use crate::partition::bound::Bound;
use crate::partition::callback::{CallbackRegistry, CallbackSignature};
use crate::partition::constraint::{Predicate, build_hash_constraint, build_range_constraint};
use crate::partition::create::{PartitionFactory, check_range_available};
use crate::partition::filter::{InsertResult, PartitionFilter};
use crate::partition::lock::{LockAcquireResult, ParentLockManager};
use crate::partition::map::{PartitionMap, PartitionMapCache};
use crate::partition::router::{Located, locate, value_comparator};
use crate::partition::worker::{CreationHandler, CreationWorkerPool, WorkerChannel};
use crate::session::{SessionContext, SessionKind, SessionRegistry};
use std::sync::Arc;
use tracing::{debug, info};

pub use crate::async_bridge::AutopartAsync;

/// Initial partitions laid down by `create_range_partitioning`.
#[derive(Debug, Clone, Default)]
pub enum InitialRanges {
    #[default]
    None,
    Bounds(Vec<(Bound, Bound)>),
    /// `count` adjacent partitions of the configured interval from `start`.
    Count { start: Value, count: usize },
}

#[derive(Debug, Clone)]
pub struct RangePartitioning {
    pub key: String,
    /// Width of partitions created on demand. `None` disables spawning.
    pub interval: Option<Value>,
    pub initial: InitialRanges,
    pub collation: Option<Collation>,
    pub params: Option<PartitionParams>,
}

impl RangePartitioning {
    pub fn new(key: impl Into<String>, interval: Option<Value>) -> Self {
        Self {
            key: key.into(),
            interval,
            initial: InitialRanges::None,
            collation: None,
            params: None,
        }
    }

    pub fn with_bounds(mut self, bounds: Vec<(Bound, Bound)>) -> Self {
        self.initial = InitialRanges::Bounds(bounds);
        self
    }

    pub fn with_count(mut self, start: Value, count: usize) -> Self {
        self.initial = InitialRanges::Count { start, count };
        self
    }

    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn with_params(mut self, params: PartitionParams) -> Self {
        self.params = Some(params);
        self
    }
}

/// Partition routing and on-demand creation over an in-memory catalog.
pub struct PartitionEngine {
    config: AutopartConfig,
    sessions: SessionRegistry,
    core: Arc<ArbiterCore>,
    arbiter: CreationArbiter,
    workers: Arc<CreationWorkerPool>,
}

impl PartitionEngine {
    pub fn new(config: AutopartConfig) -> Result<Self, AutopartError> {
        Self::with_type_ops(config, Arc::new(BuiltinTypeOps))
    }

    pub fn with_type_ops(
        config: AutopartConfig,
        ops: Arc<dyn TypeOps>,
    ) -> Result<Self, AutopartError> {
        config.validate()?;
        let core = Arc::new(ArbiterCore {
            store: Arc::new(CatalogStore::new(config.max_name_attempts)),
            maps: Arc::new(PartitionMapCache::default()),
            locks: Arc::new(ParentLockManager::default()),
            ops,
            callbacks: Arc::new(CallbackRegistry::default()),
            config: config.clone(),
            metrics: Default::default(),
        });
        let sessions = SessionRegistry::default();
        let worker_core = Arc::clone(&core);
        let handler: CreationHandler = Arc::new(move |session, parent, value, value_type| {
            worker_core.create_partitions_internal(session, parent, value, value_type)
        });
        let workers = Arc::new(CreationWorkerPool::new(
            config.worker_threads,
            config.worker_timeout(),
            &sessions,
            handler,
        )?);
        let channel: Arc<dyn WorkerChannel> = Arc::clone(&workers) as Arc<dyn WorkerChannel>;
        let arbiter = CreationArbiter::new(Arc::clone(&core), Some(channel));
        info!(
            worker_threads = workers.worker_count(),
            auto_partition = config.auto_partition_enabled,
            "partition engine started"
        );
        Ok(Self {
            config,
            sessions,
            core,
            arbiter,
            workers,
        })
    }

    pub fn config(&self) -> &AutopartConfig {
        &self.config
    }

    pub fn arbiter(&self) -> &CreationArbiter {
        &self.arbiter
    }

    pub fn session(&self) -> SessionContext {
        self.sessions.open(SessionKind::Client)
    }

    /// Publishes every partitioning declared by `session` to other sessions.
    pub fn commit_session(&self, session: &SessionContext) -> Result<usize, AutopartError> {
        let committed = self
            .core
            .store
            .mutate(|catalog| Ok(catalog.commit_session(session.id)))?;
        debug!(session = %session.id, committed, "session committed");
        Ok(committed)
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        self.core.store.current()
    }

    pub fn metrics(&self) -> ArbiterMetricsSnapshot {
        self.core.metrics.snapshot()
    }

    pub fn queued_worker_tasks(&self) -> usize {
        self.workers.queued_tasks()
    }

    pub fn create_table(
        &self,
        schema_name: &str,
        table_name: &str,
        columns: Vec<ColumnDef>,
        tablespace: Option<&str>,
    ) -> Result<TableId, AutopartError> {
        self.core.store.mutate(|catalog| {
            catalog.create_table(
                schema_name,
                table_name,
                columns,
                tablespace.map(str::to_string),
            )
        })
    }

    pub fn table_id(&self, schema_name: &str, table_name: &str) -> Result<TableId, AutopartError> {
        self.snapshot()
            .catalog
            .table_by_name(schema_name, table_name)
            .map(|t| t.id)
            .ok_or_else(|| not_found(ResourceType::Table, format!("{schema_name}.{table_name}")))
    }

    pub fn table(&self, id: TableId) -> Result<TableSchema, AutopartError> {
        self.snapshot().catalog.table(id).cloned()
    }

    /// Alters `table` and, when it is partitioned, every partition below it.
    pub fn alter_table(
        &self,
        table: TableId,
        alteration: &TableAlteration,
    ) -> Result<Vec<TableId>, AutopartError> {
        self.core.store.alter_table(table, alteration)
    }

    /// Declares range partitioning on `parent` and creates the initial
    /// partitions. The declaration stays private to `session` until
    /// `commit_session`.
    pub fn create_range_partitioning(
        &self,
        session: &SessionContext,
        parent: TableId,
        setup: RangePartitioning,
    ) -> Result<Vec<TableId>, AutopartError> {
        let snapshot = self.snapshot();
        let schema = snapshot.catalog.table(parent)?;
        ensure_not_partitioned(&snapshot.catalog, parent)?;
        let key_type = key_column(schema, &setup.key)?.col_type.clone();
        let ops = self.core.ops.as_ref();
        if let Some(interval) = &setup.interval {
            validate_interval(&key_type, interval, ops)?;
        }
        let params = self.checked_params(setup.params)?;
        let bounds = match setup.initial {
            InitialRanges::None => Vec::new(),
            InitialRanges::Bounds(bounds) => bounds,
            InitialRanges::Count { start, count } => {
                let Some(interval) = &setup.interval else {
                    return Err(AutopartError::InvalidConfig {
                        message: "a partition count needs an interval".into(),
                    });
                };
                consecutive_bounds(&start, interval, count, &key_type, ops)?
            }
        };
        let config = PartitioningConfig {
            parent,
            key: setup.key,
            key_type,
            collation: setup.collation.unwrap_or(self.config.default_collation),
            mode: PartitionMode::Range {
                interval: setup.interval,
            },
            params,
            established: Establishment::Pending {
                session: session.id,
            },
        };
        self.core.store.mutate(|catalog| {
            ensure_not_partitioned(catalog, parent)?;
            catalog.set_partitioning(config)
        })?;
        info!(parent = %parent, session = %session.id, partitions = bounds.len(), "range partitioning declared");
        bounds
            .iter()
            .map(|(lower, upper)| self.add_range_partition(session, parent, lower, upper, None, None))
            .collect()
    }

    /// Declares hash partitioning with `bucket_count` partitions named
    /// `<parent>_<idx>`.
    pub fn create_hash_partitioning(
        &self,
        session: &SessionContext,
        parent: TableId,
        key: &str,
        bucket_count: u32,
        params: Option<PartitionParams>,
    ) -> Result<Vec<TableId>, AutopartError> {
        if bucket_count == 0 {
            return Err(AutopartError::Validation(
                "hash partitioning needs at least one bucket".into(),
            ));
        }
        let snapshot = self.snapshot();
        let schema = snapshot.catalog.table(parent)?;
        ensure_not_partitioned(&snapshot.catalog, parent)?;
        let key_type = key_column(schema, key)?.col_type.clone();
        build_hash_constraint(key, 0, bucket_count, &key_type)?;
        let params = self.checked_params(params)?;
        let config = PartitioningConfig {
            parent,
            key: key.to_string(),
            key_type,
            collation: self.config.default_collation,
            mode: PartitionMode::Hash { bucket_count },
            params,
            established: Establishment::Pending {
                session: session.id,
            },
        };
        self.core.store.mutate(|catalog| {
            ensure_not_partitioned(catalog, parent)?;
            catalog.set_partitioning(config)
        })?;
        info!(parent = %parent, session = %session.id, buckets = bucket_count, "hash partitioning declared");
        let factory = self.factory();
        (0..bucket_count)
            .map(|idx| factory.create_hash_partition(parent, idx, bucket_count, None))
            .collect()
    }

    /// Adds `[lower, upper)` by hand. Fails with `RangeOverlap` if any
    /// existing partition intersects it.
    pub fn add_range_partition(
        &self,
        session: &SessionContext,
        parent: TableId,
        lower: &Bound,
        upper: &Bound,
        name: Option<&str>,
        tablespace: Option<&str>,
    ) -> Result<TableId, AutopartError> {
        let _lock = self
            .core
            .locks
            .acquire(parent, session.id, self.config.lock_timeout())?;
        let map = self.core.map(parent)?;
        check_range_available(&map, lower, upper)?;
        self.factory()
            .create_range_partition(parent, lower, upper, name, tablespace)
    }

    pub fn set_partition_params(
        &self,
        parent: TableId,
        update: PartitionParamsUpdate,
    ) -> Result<PartitionParams, AutopartError> {
        if let Some(Some(name)) = &update.init_callback {
            self.core.callbacks.validate_init(name)?;
        }
        let params = self.core.store.mutate(|catalog| {
            let mut config = catalog.partitioning(parent).cloned().ok_or_else(|| {
                AutopartError::NotPartitioned {
                    table: catalog.table_name(parent),
                }
            })?;
            if let Some(auto_create) = update.auto_create {
                config.params.auto_create = auto_create;
            }
            if let Some(spawn_using_worker) = update.spawn_using_worker {
                config.params.spawn_using_worker = spawn_using_worker;
            }
            if let Some(init_callback) = update.init_callback.clone() {
                config.params.init_callback = init_callback;
            }
            let params = config.params.clone();
            catalog.set_partitioning(config)?;
            Ok(params)
        })?;
        self.core.callbacks.forget_parent(parent);
        debug!(parent = %parent, ?params, "partition params updated");
        Ok(params)
    }

    /// Removes the partitioning of `parent`. Former partitions stay as plain
    /// tables and are returned.
    pub fn drop_partitioning(&self, parent: TableId) -> Result<Vec<TableId>, AutopartError> {
        let detached = self.core.store.mutate(|catalog| {
            let children = catalog.children_of(parent);
            catalog.clear_partitioning(parent)?;
            Ok(children)
        })?;
        self.core.maps.invalidate(parent);
        self.core.callbacks.forget_parent(parent);
        info!(parent = %parent, detached = detached.len(), "partitioning dropped");
        Ok(detached)
    }

    /// Registers an init callback with the `(json) -> void` contract.
    pub fn register_callback<F>(&self, name: &str, func: F) -> Result<(), AutopartError>
    where
        F: Fn(&serde_json::Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register_procedure(name, CallbackSignature::init(), func)
    }

    pub fn register_procedure<F>(
        &self,
        name: &str,
        signature: CallbackSignature,
        func: F,
    ) -> Result<(), AutopartError>
    where
        F: Fn(&serde_json::Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.core
            .callbacks
            .register(name, signature, Arc::new(func))
    }

    pub fn partition_map(&self, parent: TableId) -> Result<Arc<PartitionMap>, AutopartError> {
        self.core.map(parent)
    }

    pub fn partitions(&self, parent: TableId) -> Vec<TableId> {
        self.snapshot().catalog.children_of(parent)
    }

    /// Routes `value` without creating anything.
    pub fn locate(&self, parent: TableId, value: &Value) -> Result<Located, AutopartError> {
        let Some(value_type) = value.value_type() else {
            return Err(AutopartError::NullPartitionKey);
        };
        let map = self.core.map(parent)?;
        let cmp = value_comparator(&map, &value_type, self.core.ops.as_ref())?;
        locate(&map, value, &value_type, &cmp)
    }

    pub fn obtain_partition(
        &self,
        session: &SessionContext,
        parent: TableId,
        value: &Value,
    ) -> Result<TableId, AutopartError> {
        let Some(value_type) = value.value_type() else {
            return Err(AutopartError::NullPartitionKey);
        };
        self.obtain_partition_as(session, parent, value, &value_type)
    }

    /// `obtain_partition` with an explicit value type, e.g. a domain.
    pub fn obtain_partition_as(
        &self,
        session: &SessionContext,
        parent: TableId,
        value: &Value,
        value_type: &ColumnType,
    ) -> Result<TableId, AutopartError> {
        self.arbiter
            .obtain_partition(session, parent, value, value_type)
    }

    /// Routes and writes `rows` as one statement. On error nothing is written;
    /// partitions created along the way remain.
    pub fn insert(
        &self,
        session: &SessionContext,
        parent: TableId,
        rows: Vec<Row>,
    ) -> Result<InsertResult, AutopartError> {
        let mut filter = PartitionFilter::begin(&self.arbiter, *session, parent)?;
        for row in rows {
            filter.route(row)?;
        }
        filter.finish()
    }

    pub fn rows(&self, table: TableId) -> Result<Vec<Row>, AutopartError> {
        Ok(self.core.store.table_handle(table)?.rows())
    }

    /// Re-derives the constraint of `partition` from its bounds and checks
    /// every stored row against it. Returns the number of rows checked.
    pub fn validate_partition(&self, partition: TableId) -> Result<usize, AutopartError> {
        let snapshot = self.snapshot();
        let schema = snapshot.catalog.table(partition)?;
        let Some(parent) = schema.parent else {
            return Err(AutopartError::Validation(format!(
                "table \"{}\" is not a partition",
                schema.table_name
            )));
        };
        let Some(constraint) = &schema.partition_constraint else {
            return Err(AutopartError::Validation(format!(
                "partition \"{}\" has no constraint",
                schema.table_name
            )));
        };
        let Some(config) = snapshot.catalog.partitioning(parent) else {
            return Err(AutopartError::NotPartitioned {
                table: snapshot.catalog.table_name(parent),
            });
        };
        let expected: Predicate = rederive_constraint(config, &constraint.predicate)?;
        if expected != constraint.predicate {
            return Err(AutopartError::Validation(format!(
                "constraint \"{}\" is {} but should be {expected}",
                constraint.name, constraint.predicate
            )));
        }
        let rows = self.rows(partition)?;
        for row in &rows {
            if !expected.eval(schema, row, self.core.ops.as_ref(), config.collation)? {
                return Err(AutopartError::CheckConstraintFailed {
                    table: schema.table_name.clone(),
                    constraint: constraint.name.clone(),
                });
            }
        }
        Ok(rows.len())
    }

    /// Takes the creation lock on `parent` for `session`. While held, this
    /// session creates partitions inline and other creators wait.
    pub fn lock_parent(
        &self,
        session: &SessionContext,
        parent: TableId,
    ) -> Result<LockAcquireResult<'_>, AutopartError> {
        self.core
            .locks
            .acquire(parent, session.id, self.config.lock_timeout())
    }

    fn factory(&self) -> PartitionFactory<'_> {
        let store = self.core.store.as_ref();
        PartitionFactory::new(store, store, self.core.callbacks.as_ref())
    }

    fn checked_params(
        &self,
        params: Option<PartitionParams>,
    ) -> Result<PartitionParams, AutopartError> {
        let params = params.unwrap_or_else(|| PartitionParams {
            spawn_using_worker: self.config.worker_delegation_enabled,
            ..PartitionParams::default()
        });
        if let Some(name) = &params.init_callback {
            self.core.callbacks.validate_init(name)?;
        }
        Ok(params)
    }
}

/// Fails when `parent` already has partitioning declared.
fn ensure_not_partitioned(catalog: &Catalog, parent: TableId) -> Result<(), AutopartError> {
    if catalog.partitioning(parent).is_some() {
        return Err(AutopartError::AlreadyExists {
            resource_type: ResourceType::Partition,
            resource_id: format!("partitioning of {}", catalog.table(parent)?.qualified_name()),
        });
    }
    Ok(())
}

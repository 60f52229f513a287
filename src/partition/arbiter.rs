use crate::catalog::CatalogStore;
use crate::catalog::ops::TypeOps;
use crate::catalog::schema::{PartitionKind, PartitioningConfig};
use crate::catalog::types::{ColumnType, TableId, Value};
use crate::config::AutopartConfig;
use crate::error::AutopartError;
use crate::partition::callback::CallbackRegistry;
use crate::partition::create::PartitionFactory;
use crate::partition::lock::{LockAcquireResult, ParentLockManager};
use crate::partition::map::{PartitionMap, PartitionMapCache};
use crate::partition::router::{locate_one, value_comparator};
use crate::partition::spawner::{RangeSpawner, SpawnPlan};
use crate::partition::worker::WorkerChannel;
use crate::session::SessionContext;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Default)]
pub struct ArbiterMetrics {
    inline_creations: AtomicU64,
    delegated_creations: AtomicU64,
    partitions_spawned: AtomicU64,
    found_under_lock: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterMetricsSnapshot {
    pub inline_creations: u64,
    pub delegated_creations: u64,
    pub partitions_spawned: u64,
    /// Creations that found a concurrent creator's partition after locking.
    pub found_under_lock: u64,
}

impl ArbiterMetrics {
    pub fn snapshot(&self) -> ArbiterMetricsSnapshot {
        ArbiterMetricsSnapshot {
            inline_creations: self.inline_creations.load(Ordering::Relaxed),
            delegated_creations: self.delegated_creations.load(Ordering::Relaxed),
            partitions_spawned: self.partitions_spawned.load(Ordering::Relaxed),
            found_under_lock: self.found_under_lock.load(Ordering::Relaxed),
        }
    }
}

/// State shared by client sessions and creation workers.
pub struct ArbiterCore {
    pub store: Arc<CatalogStore>,
    pub maps: Arc<PartitionMapCache>,
    pub locks: Arc<ParentLockManager>,
    pub ops: Arc<dyn TypeOps>,
    pub callbacks: Arc<CallbackRegistry>,
    pub config: AutopartConfig,
    pub metrics: ArbiterMetrics,
}

impl ArbiterCore {
    pub fn map(&self, parent: TableId) -> Result<Arc<PartitionMap>, AutopartError> {
        self.maps.get(&self.store.current(), parent, self.ops.as_ref())
    }

    pub fn partitioning(&self, parent: TableId) -> Result<PartitioningConfig, AutopartError> {
        let snapshot = self.store.current();
        snapshot
            .catalog
            .partitioning(parent)
            .cloned()
            .ok_or_else(|| AutopartError::NotPartitioned {
                table: snapshot.catalog.table_name(parent),
            })
    }

    /// Routes `value` against the current map.
    pub fn resolve(
        &self,
        parent: TableId,
        value: &Value,
        value_type: &ColumnType,
    ) -> Result<Option<TableId>, AutopartError> {
        let map = self.map(parent)?;
        let cmp = value_comparator(&map, value_type, self.ops.as_ref())?;
        locate_one(&map, value, value_type, &cmp)
    }

    /// Creates whatever partitions are needed for `value` while holding the
    /// parent's intent lock. Runs inline or inside a creation worker.
    pub fn create_partitions_internal(
        &self,
        session: &SessionContext,
        parent: TableId,
        value: &Value,
        value_type: &ColumnType,
    ) -> Result<TableId, AutopartError> {
        let guard = match self
            .locks
            .acquire(parent, session.id, self.config.lock_timeout())?
        {
            LockAcquireResult::Acquired(guard) => {
                if let Some(id) = self.resolve(parent, value, value_type)? {
                    guard.release();
                    self.metrics.found_under_lock.fetch_add(1, Ordering::Relaxed);
                    debug!(parent = %parent, partition = %id, session = %session.id, "partition appeared while waiting for lock");
                    return Ok(id);
                }
                Some(guard)
            }
            LockAcquireResult::AlreadyHeld => None,
        };

        let config = self.partitioning(parent)?;
        let Some(interval) = config.interval() else {
            return Err(AutopartError::InvalidConfig {
                message: format!(
                    "cannot spawn new partition for key '{value}': default range interval is NULL"
                ),
            });
        };
        let map = self.map(parent)?;
        let mut plan = SpawnPlan::new(
            &map,
            value,
            value_type,
            interval,
            self.ops.as_ref(),
            self.config.max_spawn_steps,
        )?;
        let store = self.store.as_ref();
        let factory = PartitionFactory::new(store, store, self.callbacks.as_ref());
        let last = RangeSpawner::new(&factory, self.ops.as_ref()).run(&mut plan)?;
        self.metrics
            .partitions_spawned
            .fetch_add(plan.steps_taken() as u64, Ordering::Relaxed);
        drop(guard);
        Ok(last)
    }
}

/// Decides who creates missing partitions for a routed value.
pub struct CreationArbiter {
    core: Arc<ArbiterCore>,
    channel: Option<Arc<dyn WorkerChannel>>,
}

impl CreationArbiter {
    pub fn new(core: Arc<ArbiterCore>, channel: Option<Arc<dyn WorkerChannel>>) -> Self {
        Self { core, channel }
    }

    pub fn core(&self) -> &Arc<ArbiterCore> {
        &self.core
    }

    /// Returns the partition for `value`, creating range partitions if needed.
    pub fn obtain_partition(
        &self,
        session: &SessionContext,
        parent: TableId,
        value: &Value,
        value_type: &ColumnType,
    ) -> Result<TableId, AutopartError> {
        if value.is_null() {
            return Err(AutopartError::NullPartitionKey);
        }
        if let Some(id) = self.core.resolve(parent, value, value_type)? {
            return Ok(id);
        }

        let config = self.core.partitioning(parent)?;
        let no_partition = || AutopartError::NoSuitablePartition {
            key: value.to_string(),
        };
        if config.mode.kind() != PartitionKind::Range
            || !self.core.config.auto_partition_enabled
            || !config.params.auto_create
        {
            return Err(no_partition());
        }

        let delegate = match &self.channel {
            Some(channel)
                if config.params.spawn_using_worker
                    && config.is_visible_to_others()
                    && !session.is_worker()
                    && !self.core.locks.holds(parent, session.id) =>
            {
                Some(channel)
            }
            _ => None,
        };
        debug!(
            parent = %parent,
            session = %session.id,
            executor = if delegate.is_some() { "worker" } else { "backend" },
            "create_partitions(): chose executor"
        );

        match delegate {
            Some(channel) => {
                channel
                    .delegate_create(parent, value, value_type)
                    .map_err(|_| AutopartError::PartitionCreationFailed {
                        table: self.core.store.current().catalog.table_name(parent),
                    })?;
                self.core
                    .metrics
                    .delegated_creations
                    .fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.core
                    .create_partitions_internal(session, parent, value, value_type)?;
                self.core
                    .metrics
                    .inline_creations
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        self.core
            .resolve(parent, value, value_type)?
            .ok_or_else(no_partition)
    }
}

#[cfg(test)]
mod tests {
    use super::{ArbiterCore, CreationArbiter};
    use crate::catalog::ops::BuiltinTypeOps;
    use crate::catalog::schema::{
        ColumnDef, Establishment, PartitionMode, PartitionParams, PartitioningConfig,
    };
    use crate::catalog::types::{Collation, ColumnType, TableId, Value};
    use crate::catalog::{CatalogStore, DEFAULT_SCHEMA, PartitionCatalog};
    use crate::config::AutopartConfig;
    use crate::error::{AutopartError, AutopartErrorCode};
    use crate::partition::bound::Bound;
    use crate::partition::callback::CallbackRegistry;
    use crate::partition::create::PartitionFactory;
    use crate::partition::lock::ParentLockManager;
    use crate::partition::map::PartitionMapCache;
    use crate::partition::worker::WorkerChannel;
    use crate::session::{SessionKind, SessionRegistry};
    use std::sync::Arc;

    fn core(params: PartitionParams) -> (Arc<ArbiterCore>, TableId) {
        let store = Arc::new(CatalogStore::new(100));
        let parent = store
            .mutate(|c| {
                let parent = c.create_table(
                    DEFAULT_SCHEMA,
                    "events",
                    vec![ColumnDef::new("k", ColumnType::Integer)],
                    None,
                )?;
                c.set_partitioning(PartitioningConfig {
                    parent,
                    key: "k".into(),
                    key_type: ColumnType::Integer,
                    collation: Collation::Binary,
                    mode: PartitionMode::Range {
                        interval: Some(Value::Integer(50)),
                    },
                    params: params.clone(),
                    established: Establishment::Committed,
                })?;
                Ok(parent)
            })
            .expect("setup");
        let callbacks = Arc::new(CallbackRegistry::default());
        PartitionFactory::new(store.as_ref(), store.as_ref(), callbacks.as_ref())
            .create_range_partition(
                parent,
                &Bound::Finite(Value::Integer(0)),
                &Bound::Finite(Value::Integer(100)),
                None,
                None,
            )
            .expect("seed");
        let core = Arc::new(ArbiterCore {
            store,
            maps: Arc::new(PartitionMapCache::default()),
            locks: Arc::new(ParentLockManager::default()),
            ops: Arc::new(BuiltinTypeOps),
            callbacks,
            config: AutopartConfig::development(),
            metrics: Default::default(),
        });
        (core, parent)
    }

    struct FailingChannel;

    impl WorkerChannel for FailingChannel {
        fn delegate_create(
            &self,
            _parent: TableId,
            _value: &Value,
            _value_type: &ColumnType,
        ) -> Result<TableId, AutopartError> {
            Err(AutopartError::Validation("worker detail".into()))
        }
    }

    #[test]
    fn existing_partition_is_returned_without_creation() {
        let (core, parent) = core(PartitionParams::default());
        let arbiter = CreationArbiter::new(Arc::clone(&core), None);
        let session = SessionRegistry::default().open(SessionKind::Client);
        arbiter
            .obtain_partition(&session, parent, &Value::Integer(42), &ColumnType::Integer)
            .expect("found");
        assert_eq!(core.metrics.snapshot().inline_creations, 0);
    }

    #[test]
    fn disabled_auto_create_means_no_suitable_partition() {
        let (core, parent) = core(PartitionParams {
            auto_create: false,
            ..PartitionParams::default()
        });
        let arbiter = CreationArbiter::new(core, None);
        let session = SessionRegistry::default().open(SessionKind::Client);
        let err = arbiter
            .obtain_partition(&session, parent, &Value::Integer(150), &ColumnType::Integer)
            .expect_err("disabled");
        assert_eq!(err.code(), AutopartErrorCode::NoSuitablePartition);
    }

    #[test]
    fn held_lock_skips_the_search_and_spawns_inline() {
        let (core, parent) = core(PartitionParams {
            spawn_using_worker: true,
            ..PartitionParams::default()
        });
        let arbiter = CreationArbiter::new(Arc::clone(&core), Some(Arc::new(FailingChannel)));
        let session = SessionRegistry::default().open(SessionKind::Client);
        let _guard = core
            .locks
            .acquire(parent, session.id, core.config.lock_timeout())
            .expect("lock");
        let id = arbiter
            .obtain_partition(&session, parent, &Value::Integer(120), &ColumnType::Integer)
            .expect("inline despite worker setting");
        let snapshot = core.store.snapshot();
        assert_eq!(snapshot.catalog.table(id).expect("child").parent, Some(parent));
        assert_eq!(core.metrics.snapshot().inline_creations, 1);
        assert_eq!(core.metrics.snapshot().delegated_creations, 0);
    }

    #[test]
    fn delegation_failure_is_generic() {
        let (core, parent) = core(PartitionParams {
            spawn_using_worker: true,
            ..PartitionParams::default()
        });
        let arbiter = CreationArbiter::new(core, Some(Arc::new(FailingChannel)));
        let session = SessionRegistry::default().open(SessionKind::Client);
        let err = arbiter
            .obtain_partition(&session, parent, &Value::Integer(150), &ColumnType::Integer)
            .expect_err("worker failed");
        assert_eq!(err.code(), AutopartErrorCode::PartitionCreationFailed);
        assert_eq!(
            err.to_string(),
            "could not create new partitions for relation \"events\""
        );
    }

    #[test]
    fn pending_partitioning_is_never_delegated() {
        let (core, parent) = core(PartitionParams {
            spawn_using_worker: true,
            ..PartitionParams::default()
        });
        let session = SessionRegistry::default().open(SessionKind::Client);
        core.store
            .mutate(|c| {
                let mut config = c.partitioning(parent).cloned().expect("config");
                config.established = Establishment::Pending {
                    session: session.id,
                };
                c.set_partitioning(config)
            })
            .expect("pending");
        let arbiter = CreationArbiter::new(Arc::clone(&core), Some(Arc::new(FailingChannel)));
        arbiter
            .obtain_partition(&session, parent, &Value::Integer(150), &ColumnType::Integer)
            .expect("inline");
        assert_eq!(core.metrics.snapshot().partitions_spawned, 2);
    }
}

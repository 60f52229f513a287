use crate::catalog::ops::{Comparator, TypeOps};
use crate::catalog::schema::{PartitionMode, PartitioningConfig};
use crate::catalog::types::{Collation, ColumnType, TableId};
use crate::catalog::{Catalog, CatalogSnapshot};
use crate::error::AutopartError;
use crate::partition::bound::Bound;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntry {
    pub lower: Bound,
    pub upper: Bound,
    pub partition_id: TableId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionLayout {
    /// Sorted by `lower`.
    Range(Vec<RangeEntry>),
    /// One slot per bucket; `None` while a bucket's partition is not attached yet.
    Hash(Vec<Option<TableId>>),
}

/// Immutable view of one parent's partitions at a catalog version.
#[derive(Debug, Clone)]
pub struct PartitionMap {
    pub parent: TableId,
    pub key: String,
    pub key_type: ColumnType,
    pub collation: Collation,
    pub layout: PartitionLayout,
    /// Partitioning version of the catalog this map was built from.
    pub version: u64,
    comparator: Comparator,
    overlapping: bool,
}

impl PartitionMap {
    pub fn build(
        catalog: &Catalog,
        parent: TableId,
        ops: &dyn TypeOps,
    ) -> Result<Self, AutopartError> {
        let Some(config) = catalog.partitioning(parent) else {
            return Err(AutopartError::NotPartitioned {
                table: catalog.table_name(parent),
            });
        };
        let comparator = ops.comparator(&config.key_type, &config.key_type, config.collation)?;
        let layout = match &config.mode {
            PartitionMode::Range { .. } => {
                PartitionLayout::Range(collect_ranges(catalog, parent, &comparator)?)
            }
            PartitionMode::Hash { bucket_count } => {
                PartitionLayout::Hash(collect_buckets(catalog, parent, *bucket_count)?)
            }
        };
        let mut map = Self::from_parts(
            config,
            layout,
            catalog.partitioning_version(parent),
            comparator,
        );
        map.overlapping = map.check_invariants().is_err();
        Ok(map)
    }

    fn from_parts(
        config: &PartitioningConfig,
        layout: PartitionLayout,
        version: u64,
        comparator: Comparator,
    ) -> Self {
        Self {
            parent: config.parent,
            key: config.key.clone(),
            key_type: config.key_type.clone(),
            collation: config.collation,
            layout,
            version,
            comparator,
            overlapping: false,
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.layout {
            PartitionLayout::Range(_) => "range",
            PartitionLayout::Hash(_) => "hash",
        }
    }

    /// True when some ranges overlap; routing then scans every entry.
    pub fn has_overlaps(&self) -> bool {
        self.overlapping
    }

    /// Bound comparator resolved for the key type and collation.
    pub fn comparator(&self) -> &Comparator {
        &self.comparator
    }

    pub fn range_entries(&self) -> &[RangeEntry] {
        match &self.layout {
            PartitionLayout::Range(entries) => entries,
            PartitionLayout::Hash(_) => &[],
        }
    }

    pub fn partition_count(&self) -> usize {
        match &self.layout {
            PartitionLayout::Range(entries) => entries.len(),
            PartitionLayout::Hash(buckets) => buckets.iter().flatten().count(),
        }
    }

    pub fn partition_ids(&self) -> Vec<TableId> {
        match &self.layout {
            PartitionLayout::Range(entries) => entries.iter().map(|e| e.partition_id).collect(),
            PartitionLayout::Hash(buckets) => buckets.iter().flatten().copied().collect(),
        }
    }

    /// First `lower` and last `upper`; `None` for an empty or hash map.
    pub fn absolute_bounds(&self) -> Option<(&Bound, &Bound)> {
        let entries = self.range_entries();
        Some((&entries.first()?.lower, &entries.last()?.upper))
    }

    /// Sorted and non-overlapping.
    pub fn check_invariants(&self) -> Result<(), AutopartError> {
        for pair in self.range_entries().windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.upper.compare(&b.lower, &self.comparator)? == Ordering::Greater {
                return Err(AutopartError::Validation(format!(
                    "partitions {} [{}, {}) and {} [{}, {}) overlap",
                    a.partition_id, a.lower, a.upper, b.partition_id, b.lower, b.upper
                )));
            }
        }
        Ok(())
    }

    /// No gaps between neighbouring ranges.
    pub fn is_contiguous(&self) -> Result<bool, AutopartError> {
        for pair in self.range_entries().windows(2) {
            if pair[0].upper.compare(&pair[1].lower, &self.comparator)? != Ordering::Equal {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn collect_ranges(
    catalog: &Catalog,
    parent: TableId,
    cmp: &Comparator,
) -> Result<Vec<RangeEntry>, AutopartError> {
    let mut entries = Vec::new();
    for child in catalog.children_of(parent) {
        let schema = catalog.table(child)?;
        // Created but not yet constrained partitions are not routable.
        let Some(constraint) = &schema.partition_constraint else {
            continue;
        };
        let Some((lower, upper)) = constraint.predicate.range_bounds() else {
            return Err(AutopartError::Validation(format!(
                "partition \"{}\" has no range constraint",
                schema.table_name
            )));
        };
        entries.push(RangeEntry {
            lower,
            upper,
            partition_id: child,
        });
    }
    let mut failure = None;
    entries.sort_by(|a, b| {
        a.lower.compare(&b.lower, cmp).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(entries),
    }
}

fn collect_buckets(
    catalog: &Catalog,
    parent: TableId,
    bucket_count: u32,
) -> Result<Vec<Option<TableId>>, AutopartError> {
    let mut buckets = vec![None; bucket_count as usize];
    for child in catalog.children_of(parent) {
        let schema = catalog.table(child)?;
        let Some(constraint) = &schema.partition_constraint else {
            continue;
        };
        let Some((count, idx)) = constraint.predicate.hash_bucket() else {
            return Err(AutopartError::Validation(format!(
                "partition \"{}\" has no hash constraint",
                schema.table_name
            )));
        };
        if count != bucket_count {
            return Err(AutopartError::Validation(format!(
                "partition \"{}\" was built for {count} buckets, table has {bucket_count}",
                schema.table_name
            )));
        }
        let slot = buckets.get_mut(idx as usize).ok_or_else(|| {
            AutopartError::Validation(format!("bucket index {idx} out of range"))
        })?;
        if let Some(existing) = slot {
            return Err(AutopartError::AmbiguousRouting {
                key: format!("bucket {idx}"),
                partitions: vec![*existing, child],
            });
        }
        *slot = Some(child);
    }
    Ok(buckets)
}

/// Shared per-parent maps, rebuilt when the parent's partitioning version moves.
#[derive(Debug, Default)]
pub struct PartitionMapCache {
    maps: RwLock<HashMap<TableId, Arc<PartitionMap>>>,
}

impl PartitionMapCache {
    pub fn get(
        &self,
        snapshot: &CatalogSnapshot,
        parent: TableId,
        ops: &dyn TypeOps,
    ) -> Result<Arc<PartitionMap>, AutopartError> {
        let version = snapshot.catalog.partitioning_version(parent);
        if snapshot.catalog.partitioning(parent).is_some()
            && let Some(map) = self.maps.read().get(&parent)
            && map.version == version
        {
            return Ok(Arc::clone(map));
        }
        let map = Arc::new(PartitionMap::build(&snapshot.catalog, parent, ops)?);
        debug!(
            parent = %parent,
            version,
            partitions = map.partition_count(),
            "partition map rebuilt"
        );
        let mut maps = self.maps.write();
        let keep_existing = maps.get(&parent).is_some_and(|m| m.version > version);
        if !keep_existing {
            maps.insert(parent, Arc::clone(&map));
        }
        Ok(map)
    }

    pub fn invalidate(&self, parent: TableId) {
        self.maps.write().remove(&parent);
    }
}

#[cfg(test)]
mod tests {
    use super::{PartitionLayout, PartitionMap, PartitionMapCache};
    use crate::catalog::ops::BuiltinTypeOps;
    use crate::catalog::schema::{
        CheckConstraint, ColumnDef, Establishment, PartitionMode, PartitionParams,
        PartitioningConfig,
    };
    use crate::catalog::types::{Collation, ColumnType, TableId, Value};
    use crate::catalog::{Catalog, CatalogStore, DEFAULT_SCHEMA, PartitionCatalog};
    use crate::partition::bound::Bound;
    use crate::partition::constraint::{build_range_constraint, constraint_name};

    fn range_parent(c: &mut Catalog) -> TableId {
        let parent = c
            .create_table(
                DEFAULT_SCHEMA,
                "events",
                vec![ColumnDef::new("id", ColumnType::Integer)],
                None,
            )
            .expect("parent");
        c.set_partitioning(PartitioningConfig {
            parent,
            key: "id".into(),
            key_type: ColumnType::Integer,
            collation: Collation::Binary,
            mode: PartitionMode::Range {
                interval: Some(Value::Integer(10)),
            },
            params: PartitionParams::default(),
            established: Establishment::Committed,
        })
        .expect("partitioning");
        parent
    }

    fn add_range(c: &mut Catalog, parent: TableId, name: &str, lo: Bound, hi: Bound) -> TableId {
        let child = c.create_child_table(parent, name, None).expect("child");
        let predicate =
            build_range_constraint("id", &lo, &hi, &ColumnType::Integer).expect("constraint");
        c.attach_constraint(
            child,
            CheckConstraint {
                name: constraint_name(name),
                predicate,
            },
        )
        .expect("attach");
        child
    }

    fn fin(v: i64) -> Bound {
        Bound::Finite(Value::Integer(v))
    }

    #[test]
    fn entries_are_sorted_by_lower_regardless_of_creation_order() {
        let mut c = Catalog::default();
        let parent = range_parent(&mut c);
        let b = add_range(&mut c, parent, "events_b", fin(10), fin(20));
        let a = add_range(&mut c, parent, "events_a", fin(0), fin(10));
        let open = add_range(&mut c, parent, "events_c", fin(20), Bound::PositiveInfinity);
        let map = PartitionMap::build(&c, parent, &BuiltinTypeOps).expect("map");
        assert_eq!(map.partition_ids(), vec![a, b, open]);
        map.check_invariants().expect("sorted");
        assert!(map.is_contiguous().expect("contiguous"));
        let (lo, hi) = map.absolute_bounds().expect("bounds");
        assert_eq!((lo, hi), (&fin(0), &Bound::PositiveInfinity));
    }

    #[test]
    fn unconstrained_children_are_skipped() {
        let mut c = Catalog::default();
        let parent = range_parent(&mut c);
        add_range(&mut c, parent, "events_1", fin(0), fin(10));
        c.create_child_table(parent, "events_2", None)
            .expect("half-created child");
        let map = PartitionMap::build(&c, parent, &BuiltinTypeOps).expect("map");
        assert_eq!(map.partition_count(), 1);
    }

    #[test]
    fn overlap_and_gaps_are_detected() {
        let mut c = Catalog::default();
        let parent = range_parent(&mut c);
        add_range(&mut c, parent, "events_1", fin(0), fin(10));
        add_range(&mut c, parent, "events_2", fin(20), fin(30));
        let map = PartitionMap::build(&c, parent, &BuiltinTypeOps).expect("map");
        map.check_invariants().expect("gap is not overlap");
        assert!(!map.is_contiguous().expect("contiguous check"));

        add_range(&mut c, parent, "events_3", fin(5), fin(15));
        let map = PartitionMap::build(&c, parent, &BuiltinTypeOps).expect("map");
        assert!(map.check_invariants().is_err());
    }

    #[test]
    fn non_partitioned_parent_is_rejected() {
        let mut c = Catalog::default();
        let plain = c
            .create_table(
                DEFAULT_SCHEMA,
                "plain",
                vec![ColumnDef::new("id", ColumnType::Integer)],
                None,
            )
            .expect("table");
        let err = PartitionMap::build(&c, plain, &BuiltinTypeOps).expect_err("not partitioned");
        assert_eq!(err.code_str(), "not_partitioned");
    }

    #[test]
    fn cache_rebuilds_only_when_version_moves() {
        let store = CatalogStore::new(10);
        let parent = store
            .mutate(|c| Ok(range_parent(c)))
            .expect("parent");
        store
            .mutate(|c| Ok(add_range(c, parent, "events_1", fin(0), fin(10))))
            .expect("range");
        let cache = PartitionMapCache::default();
        let first = cache
            .get(&store.snapshot(), parent, &BuiltinTypeOps)
            .expect("map");
        let again = cache
            .get(&store.snapshot(), parent, &BuiltinTypeOps)
            .expect("map");
        assert!(std::sync::Arc::ptr_eq(&first, &again));

        store
            .mutate(|c| Ok(add_range(c, parent, "events_2", fin(10), fin(20))))
            .expect("range");
        let rebuilt = cache
            .get(&store.snapshot(), parent, &BuiltinTypeOps)
            .expect("map");
        assert_eq!(rebuilt.partition_count(), 2);
        assert_eq!(first.partition_count(), 1, "old map is never mutated");
        assert!(matches!(rebuilt.layout, PartitionLayout::Range(_)));
    }
}

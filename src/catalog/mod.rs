pub mod ops;
pub mod schema;
pub mod types;

use crate::catalog::schema::{
    CheckConstraint, ColumnDef, Establishment, PartitioningConfig, TableAlteration, TableSchema,
};
use crate::catalog::types::{Row, TableId, Value};
use crate::error::{AutopartError, ResourceType, not_found};
use crate::session::SessionId;
use im::{HashMap, OrdSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap as StdHashMap;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_SCHEMA: &str = "public";
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Catalog {
    pub tables: HashMap<TableId, TableSchema>,
    pub table_names: HashMap<(String, String), TableId>,
    pub partitioning: HashMap<TableId, PartitioningConfig>,
    pub children: HashMap<TableId, OrdSet<TableId>>,
    /// Per-parent counter backing generated range partition names.
    pub name_sequences: HashMap<TableId, u64>,
    /// Bumped whenever a parent's partition set or partitioning config changes.
    pub partitioning_versions: HashMap<TableId, u64>,
    pub next_table_id: u64,
}

impl Catalog {
    pub fn encode(&self) -> Result<Vec<u8>, AutopartError> {
        rmp_serde::to_vec(self).map_err(|e| AutopartError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AutopartError> {
        rmp_serde::from_slice(bytes).map_err(|e| AutopartError::Decode(e.to_string()))
    }

    pub fn table(&self, id: TableId) -> Result<&TableSchema, AutopartError> {
        self.tables
            .get(&id)
            .ok_or_else(|| not_found(ResourceType::Table, id.to_string()))
    }

    pub fn table_by_name(&self, schema_name: &str, table_name: &str) -> Option<&TableSchema> {
        self.table_names
            .get(&(schema_name.to_string(), table_name.to_string()))
            .and_then(|id| self.tables.get(id))
    }

    pub fn table_name(&self, id: TableId) -> String {
        self.tables
            .get(&id)
            .map(|t| t.table_name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn partitioning(&self, parent: TableId) -> Option<&PartitioningConfig> {
        self.partitioning.get(&parent)
    }

    pub fn partitioning_version(&self, parent: TableId) -> u64 {
        self.partitioning_versions.get(&parent).copied().unwrap_or(0)
    }

    pub fn children_of(&self, parent: TableId) -> Vec<TableId> {
        self.children
            .get(&parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// `id` followed by all of its partitions, breadth first.
    pub fn descendants_inclusive(&self, id: TableId) -> Vec<TableId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            out.extend(self.children_of(out[i]));
            i += 1;
        }
        out
    }

    pub fn create_table(
        &mut self,
        schema_name: &str,
        table_name: &str,
        columns: Vec<ColumnDef>,
        tablespace: Option<String>,
    ) -> Result<TableId, AutopartError> {
        validate_identifier(schema_name, "schema_name")?;
        validate_identifier(table_name, "table_name")?;
        let key = (schema_name.to_string(), table_name.to_string());
        if self.table_names.contains_key(&key) {
            return Err(AutopartError::AlreadyExists {
                resource_type: ResourceType::Table,
                resource_id: format!("{schema_name}.{table_name}"),
            });
        }
        if columns.is_empty() {
            return Err(AutopartError::Validation(
                "table needs at least one column".into(),
            ));
        }
        for (i, col) in columns.iter().enumerate() {
            validate_identifier(&col.name, "column name")?;
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(AutopartError::Validation(format!(
                    "duplicate column: {}",
                    col.name
                )));
            }
        }
        self.next_table_id += 1;
        let id = TableId(self.next_table_id);
        self.tables.insert(
            id,
            TableSchema {
                id,
                schema_name: schema_name.to_string(),
                table_name: table_name.to_string(),
                tablespace,
                columns,
                parent: None,
                partition_constraint: None,
            },
        );
        self.table_names.insert(key, id);
        Ok(id)
    }

    pub fn alter_table(
        &mut self,
        id: TableId,
        alteration: &TableAlteration,
    ) -> Result<(), AutopartError> {
        let mut table = self.table(id)?.clone();
        let key_column = self.partitioning(id).map(|cfg| cfg.key.clone());
        match alteration {
            TableAlteration::AddColumn(col) => {
                validate_identifier(&col.name, "column name")?;
                if table.column_index(&col.name).is_some() {
                    return Err(AutopartError::Validation(format!(
                        "column already exists: {}",
                        col.name
                    )));
                }
                if !col.nullable {
                    return Err(AutopartError::Validation(
                        "added columns must be nullable".into(),
                    ));
                }
                table.columns.push(col.clone());
            }
            TableAlteration::DropColumn { name } => {
                if key_column.as_deref() == Some(name.as_str()) {
                    return Err(AutopartError::Validation(format!(
                        "cannot drop partitioning key column: {name}"
                    )));
                }
                let Some(idx) = table.column_index(name) else {
                    return Err(AutopartError::Validation("column does not exist".into()));
                };
                if table.columns.len() == 1 {
                    return Err(AutopartError::Validation(
                        "table needs at least one column".into(),
                    ));
                }
                table.columns.remove(idx);
            }
            TableAlteration::RenameColumn { from, to } => {
                if key_column.as_deref() == Some(from.as_str()) {
                    return Err(AutopartError::Validation(format!(
                        "cannot rename partitioning key column: {from}"
                    )));
                }
                validate_identifier(to, "column name")?;
                if table.column_index(to).is_some() {
                    return Err(AutopartError::Validation(format!(
                        "column already exists: {to}"
                    )));
                }
                let Some(idx) = table.column_index(from) else {
                    return Err(AutopartError::Validation("column does not exist".into()));
                };
                table.columns[idx].name = to.clone();
            }
        }
        self.tables.insert(id, table);
        Ok(())
    }

    pub fn set_partitioning(&mut self, config: PartitioningConfig) -> Result<(), AutopartError> {
        let parent = config.parent;
        self.table(parent)?;
        self.partitioning.insert(parent, config);
        self.bump_partitioning_version(parent);
        Ok(())
    }

    /// Removes the partitioning config and detaches every partition of `parent`.
    pub fn clear_partitioning(
        &mut self,
        parent: TableId,
    ) -> Result<PartitioningConfig, AutopartError> {
        let Some(config) = self.partitioning.remove(&parent) else {
            return Err(AutopartError::NotPartitioned {
                table: self.table_name(parent),
            });
        };
        for child in self.children_of(parent) {
            if let Some(mut schema) = self.tables.get(&child).cloned() {
                schema.parent = None;
                self.tables.insert(child, schema);
            }
        }
        self.children.remove(&parent);
        self.bump_partitioning_version(parent);
        Ok(config)
    }

    pub fn commit_session(&mut self, session: SessionId) -> usize {
        let pending: Vec<TableId> = self
            .partitioning
            .iter()
            .filter(|(_, cfg)| cfg.established == Establishment::Pending { session })
            .map(|(id, _)| *id)
            .collect();
        for id in &pending {
            if let Some(mut cfg) = self.partitioning.get(id).cloned() {
                cfg.established = Establishment::Committed;
                self.partitioning.insert(*id, cfg);
            }
        }
        pending.len()
    }

    pub fn next_partition_name(
        &mut self,
        parent: TableId,
        max_attempts: usize,
    ) -> Result<String, AutopartError> {
        let parent_schema = self.table(parent)?;
        let schema_name = parent_schema.schema_name.clone();
        let base = parent_schema.table_name.clone();
        let mut seq = self.name_sequences.get(&parent).copied().unwrap_or(0);
        let mut chosen = None;
        for _ in 0..max_attempts {
            seq += 1;
            let candidate = format!("{base}_{seq}");
            if !self
                .table_names
                .contains_key(&(schema_name.clone(), candidate.clone()))
            {
                chosen = Some(candidate);
                break;
            }
        }
        self.name_sequences.insert(parent, seq);
        chosen.ok_or(AutopartError::NameExhausted {
            table: base,
            attempts: max_attempts,
        })
    }

    pub fn create_child_table(
        &mut self,
        parent: TableId,
        name: &str,
        tablespace: Option<&str>,
    ) -> Result<TableId, AutopartError> {
        let parent_schema = self.table(parent)?.clone();
        if self.table_by_name(&parent_schema.schema_name, name).is_some() {
            return Err(AutopartError::AlreadyExists {
                resource_type: ResourceType::Partition,
                resource_id: format!("{}.{name}", parent_schema.schema_name),
            });
        }
        let tablespace = tablespace
            .map(str::to_string)
            .or_else(|| parent_schema.tablespace.clone());
        let id = self.create_table(
            &parent_schema.schema_name,
            name,
            parent_schema.columns.clone(),
            tablespace,
        )?;
        if let Some(mut child) = self.tables.get(&id).cloned() {
            child.parent = Some(parent);
            self.tables.insert(id, child);
        }
        let mut set = self.children.get(&parent).cloned().unwrap_or_default();
        set.insert(id);
        self.children.insert(parent, set);
        Ok(id)
    }

    pub fn attach_constraint(
        &mut self,
        child: TableId,
        constraint: CheckConstraint,
    ) -> Result<(), AutopartError> {
        let mut schema = self.table(child)?.clone();
        let Some(parent) = schema.parent else {
            return Err(AutopartError::Validation(format!(
                "table \"{}\" is not a partition",
                schema.table_name
            )));
        };
        schema.partition_constraint = Some(constraint);
        self.tables.insert(child, schema);
        self.bump_partitioning_version(parent);
        Ok(())
    }

    fn bump_partitioning_version(&mut self, parent: TableId) {
        let next = self.partitioning_version(parent) + 1;
        self.partitioning_versions.insert(parent, next);
    }
}

/// Immutable published catalog state.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub version: u64,
    pub catalog: Arc<Catalog>,
}

/// Catalog reader consumed by routing and creation.
pub trait PartitionCatalog: Send + Sync {
    fn snapshot(&self) -> CatalogSnapshot;

    fn read_partitioning_config(&self, parent: TableId) -> Option<PartitioningConfig> {
        self.snapshot().catalog.partitioning(parent).cloned()
    }
}

/// Physical table creator. Every call is atomic and immediately visible.
pub trait TableCreator: Send + Sync {
    fn next_partition_name(&self, parent: TableId) -> Result<String, AutopartError>;

    fn create_child_table(
        &self,
        parent: TableId,
        name: &str,
        tablespace: Option<&str>,
    ) -> Result<TableId, AutopartError>;

    fn attach_constraint(
        &self,
        child: TableId,
        constraint: CheckConstraint,
    ) -> Result<(), AutopartError>;
}

/// Row storage behind one table id.
#[derive(Debug)]
pub struct MemoryTable {
    id: TableId,
    rows: Mutex<Vec<Row>>,
}

impl MemoryTable {
    fn new(id: TableId) -> Self {
        Self {
            id,
            rows: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn append(&self, rows: Vec<Row>) {
        self.rows.lock().extend(rows);
    }

    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

/// Copy-on-write catalog head plus in-memory row storage.
#[derive(Debug)]
pub struct CatalogStore {
    head: RwLock<CatalogSnapshot>,
    write_lock: Mutex<()>,
    storage: RwLock<StdHashMap<TableId, Arc<MemoryTable>>>,
    max_name_attempts: usize,
}

impl CatalogStore {
    pub fn new(max_name_attempts: usize) -> Self {
        Self::from_catalog(Catalog::default(), max_name_attempts)
    }

    pub fn from_catalog(catalog: Catalog, max_name_attempts: usize) -> Self {
        Self {
            head: RwLock::new(CatalogSnapshot {
                version: 0,
                catalog: Arc::new(catalog),
            }),
            write_lock: Mutex::new(()),
            storage: RwLock::new(StdHashMap::new()),
            max_name_attempts,
        }
    }

    pub fn current(&self) -> CatalogSnapshot {
        self.head.read().clone()
    }

    /// Applies `f` to a private copy and publishes it only if `f` succeeds.
    pub fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Catalog) -> Result<R, AutopartError>,
    ) -> Result<R, AutopartError> {
        let _writer = self.write_lock.lock();
        let base = self.current();
        let mut next = (*base.catalog).clone();
        let out = f(&mut next)?;
        self.publish(base.version, next);
        Ok(out)
    }

    /// Caller holds `write_lock`.
    fn publish(&self, base_version: u64, catalog: Catalog) {
        let version = base_version + 1;
        *self.head.write() = CatalogSnapshot {
            version,
            catalog: Arc::new(catalog),
        };
        debug!(version, "catalog version published");
    }

    pub fn table_handle(&self, id: TableId) -> Result<Arc<MemoryTable>, AutopartError> {
        if let Some(handle) = self.storage.read().get(&id) {
            return Ok(Arc::clone(handle));
        }
        self.current().catalog.table(id)?;
        let mut storage = self.storage.write();
        Ok(Arc::clone(
            storage
                .entry(id)
                .or_insert_with(|| Arc::new(MemoryTable::new(id))),
        ))
    }

    /// Alters `id` and every partition below it in one catalog version. Stored
    /// rows are reshaped under the writer lock and the affected tables' row
    /// locks, before the new version becomes visible.
    pub fn alter_table(
        &self,
        id: TableId,
        alteration: &TableAlteration,
    ) -> Result<Vec<TableId>, AutopartError> {
        let _writer = self.write_lock.lock();
        let base = self.current();
        let affected = base.catalog.descendants_inclusive(id);
        let mut next = (*base.catalog).clone();
        for table in &affected {
            next.alter_table(*table, alteration)?;
        }
        let mut dropped = Vec::with_capacity(affected.len());
        let mut handles = Vec::with_capacity(affected.len());
        for table in &affected {
            dropped.push(match alteration {
                TableAlteration::DropColumn { name } => {
                    base.catalog.table(*table)?.column_index(name)
                }
                _ => None,
            });
            handles.push(self.table_handle(*table)?);
        }
        let mut guards: Vec<_> = handles.iter().map(|h| h.rows.lock()).collect();
        for (rows, idx) in guards.iter_mut().zip(&dropped) {
            for row in rows.iter_mut() {
                match alteration {
                    TableAlteration::AddColumn(_) => row.values.push(Value::Null),
                    TableAlteration::DropColumn { .. } => {
                        if let Some(idx) = *idx
                            && idx < row.values.len()
                        {
                            row.values.remove(idx);
                        }
                    }
                    TableAlteration::RenameColumn { .. } => {}
                }
            }
        }
        self.publish(base.version, next);
        drop(guards);
        Ok(affected)
    }
}

impl PartitionCatalog for CatalogStore {
    fn snapshot(&self) -> CatalogSnapshot {
        self.current()
    }
}

impl TableCreator for CatalogStore {
    fn next_partition_name(&self, parent: TableId) -> Result<String, AutopartError> {
        let attempts = self.max_name_attempts;
        self.mutate(|catalog| catalog.next_partition_name(parent, attempts))
    }

    fn create_child_table(
        &self,
        parent: TableId,
        name: &str,
        tablespace: Option<&str>,
    ) -> Result<TableId, AutopartError> {
        self.mutate(|catalog| catalog.create_child_table(parent, name, tablespace))
    }

    fn attach_constraint(
        &self,
        child: TableId,
        constraint: CheckConstraint,
    ) -> Result<(), AutopartError> {
        self.mutate(|catalog| catalog.attach_constraint(child, constraint))
    }
}

fn validate_identifier(value: &str, name: &str) -> Result<(), AutopartError> {
    if value.is_empty() {
        return Err(AutopartError::Validation(format!("{name} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(AutopartError::Validation(format!(
            "{name} must be <= {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AutopartError::Validation(format!(
            "{name} must contain only [A-Za-z0-9_]"
        )));
    }
    Ok(())
}

use crate::catalog::types::{Collation, ColumnType, TableId, Value};
use crate::partition::constraint::Predicate;
use crate::session::SessionId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub col_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub id: TableId,
    pub schema_name: String,
    pub table_name: String,
    #[serde(default)]
    pub tablespace: Option<String>,
    pub columns: Vec<ColumnDef>,
    /// Set on partitions: the partitioned table this one belongs to.
    #[serde(default)]
    pub parent: Option<TableId>,
    #[serde(default)]
    pub partition_constraint: Option<CheckConstraint>,
}

impl TableSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckConstraint {
    pub name: String,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PartitionMode {
    Range {
        /// Width of one spawned partition; `None` disables spawning.
        interval: Option<Value>,
    },
    Hash {
        bucket_count: u32,
    },
}

impl PartitionMode {
    pub fn kind(&self) -> PartitionKind {
        match self {
            PartitionMode::Range { .. } => PartitionKind::Range,
            PartitionMode::Hash { .. } => PartitionKind::Hash,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PartitionKind {
    Range,
    Hash,
}

impl std::fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionKind::Range => write!(f, "range"),
            PartitionKind::Hash => write!(f, "hash"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionParams {
    pub auto_create: bool,
    pub spawn_using_worker: bool,
    #[serde(default)]
    pub init_callback: Option<String>,
}

impl Default for PartitionParams {
    fn default() -> Self {
        Self {
            auto_create: true,
            spawn_using_worker: false,
            init_callback: None,
        }
    }
}

/// Whether the partitioning metadata is committed and visible outside the
/// session that declared it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Establishment {
    Committed,
    Pending { session: SessionId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitioningConfig {
    pub parent: TableId,
    /// Partitioning key column.
    pub key: String,
    pub key_type: ColumnType,
    pub collation: Collation,
    pub mode: PartitionMode,
    pub params: PartitionParams,
    pub established: Establishment,
}

impl PartitioningConfig {
    pub fn interval(&self) -> Option<&Value> {
        match &self.mode {
            PartitionMode::Range { interval } => interval.as_ref(),
            PartitionMode::Hash { .. } => None,
        }
    }

    pub fn bucket_count(&self) -> Option<u32> {
        match self.mode {
            PartitionMode::Hash { bucket_count } => Some(bucket_count),
            PartitionMode::Range { .. } => None,
        }
    }

    pub fn is_visible_to_others(&self) -> bool {
        matches!(self.established, Establishment::Committed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TableAlteration {
    AddColumn(ColumnDef),
    DropColumn { name: String },
    RenameColumn { from: String, to: String },
}

/// Optional settings for `set_partition_params`; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionParamsUpdate {
    pub auto_create: Option<bool>,
    pub spawn_using_worker: Option<bool>,
    pub init_callback: Option<Option<String>>,
}

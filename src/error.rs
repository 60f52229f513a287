use crate::catalog::types::TableId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Table,
    Partition,
    Callback,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Table => write!(f, "table"),
            ResourceType::Partition => write!(f, "partition"),
            ResourceType::Callback => write!(f, "callback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutopartErrorCode {
    NotPartitioned,
    NoSuitablePartition,
    AmbiguousRouting,
    CoverageGap,
    UnboundedExtension,
    ArithmeticOverflowOnCast,
    ConversionError,
    CallbackError,
    NullPartitionKey,
    TypeMismatch,
    UnsupportedOperation,
    RangeOverlap,
    CheckConstraintFailed,
    TableAlreadyExists,
    PartitionAlreadyExists,
    CallbackAlreadyExists,
    TableNotFound,
    PartitionNotFound,
    CallbackNotFound,
    InvalidConfig,
    Validation,
    LockTimeout,
    LockPoisoned,
    PartitionCreationFailed,
    WorkerUnavailable,
    WorkerTimeout,
    NameExhausted,
    SpawnLimitExceeded,
    Overflow,
    Encode,
    Decode,
}

impl AutopartErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AutopartErrorCode::NotPartitioned => "not_partitioned",
            AutopartErrorCode::NoSuitablePartition => "no_suitable_partition",
            AutopartErrorCode::AmbiguousRouting => "ambiguous_routing",
            AutopartErrorCode::CoverageGap => "coverage_gap",
            AutopartErrorCode::UnboundedExtension => "unbounded_extension",
            AutopartErrorCode::ArithmeticOverflowOnCast => "arithmetic_overflow_on_cast",
            AutopartErrorCode::ConversionError => "conversion_error",
            AutopartErrorCode::CallbackError => "callback_error",
            AutopartErrorCode::NullPartitionKey => "null_partition_key",
            AutopartErrorCode::TypeMismatch => "type_mismatch",
            AutopartErrorCode::UnsupportedOperation => "unsupported_operation",
            AutopartErrorCode::RangeOverlap => "range_overlap",
            AutopartErrorCode::CheckConstraintFailed => "check_constraint_failed",
            AutopartErrorCode::TableAlreadyExists => "table_already_exists",
            AutopartErrorCode::PartitionAlreadyExists => "partition_already_exists",
            AutopartErrorCode::CallbackAlreadyExists => "callback_already_exists",
            AutopartErrorCode::TableNotFound => "table_not_found",
            AutopartErrorCode::PartitionNotFound => "partition_not_found",
            AutopartErrorCode::CallbackNotFound => "callback_not_found",
            AutopartErrorCode::InvalidConfig => "invalid_config",
            AutopartErrorCode::Validation => "validation",
            AutopartErrorCode::LockTimeout => "lock_timeout",
            AutopartErrorCode::LockPoisoned => "lock_poisoned",
            AutopartErrorCode::PartitionCreationFailed => "partition_creation_failed",
            AutopartErrorCode::WorkerUnavailable => "worker_unavailable",
            AutopartErrorCode::WorkerTimeout => "worker_timeout",
            AutopartErrorCode::NameExhausted => "name_exhausted",
            AutopartErrorCode::SpawnLimitExceeded => "spawn_limit_exceeded",
            AutopartErrorCode::Overflow => "overflow",
            AutopartErrorCode::Encode => "encode",
            AutopartErrorCode::Decode => "decode",
        }
    }
}

#[derive(Debug, Error)]
pub enum AutopartError {
    #[error("table \"{table}\" is not partitioned")]
    NotPartitioned { table: String },
    #[error("no suitable partition for key '{key}'")]
    NoSuitablePartition { key: String },
    #[error("key '{key}' matches more than one partition: {partitions:?}")]
    AmbiguousRouting {
        key: String,
        partitions: Vec<TableId>,
    },
    #[error("cannot spawn a partition for key '{key}': there is a gap in partition coverage")]
    CoverageGap { key: String },
    #[error("cannot spawn a partition: {reason}")]
    UnboundedExtension { reason: String },
    #[error("interval stepping needs a second type widening ({from} -> {to})")]
    ArithmeticOverflowOnCast { from: String, to: String },
    #[error("could not convert row type for partition \"{partition}\": {reason}")]
    ConversionError { partition: String, reason: String },
    #[error("callback error: {0}")]
    CallbackError(String),
    #[error("partitioning expression's value should not be NULL")]
    NullPartitionKey,
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("specified range [{start}, {end}) overlaps with existing partitions")]
    RangeOverlap { start: String, end: String },
    #[error("check constraint '{constraint}' failed on table '{table}'")]
    CheckConstraintFailed { table: String, constraint: String },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("timed out waiting for the creation lock on \"{table}\"")]
    LockTimeout { table: String },
    #[error("creation lock manager poisoned")]
    LockPoisoned,
    #[error("could not create new partitions for relation \"{table}\"")]
    PartitionCreationFailed { table: String },
    #[error("creation worker unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("creation worker timed out")]
    WorkerTimeout,
    #[error("could not pick a unique partition name for \"{table}\" after {attempts} attempts")]
    NameExhausted { table: String, attempts: usize },
    #[error("spawn plan exceeded {limit} steps")]
    SpawnLimitExceeded { limit: usize },
    #[error("overflow: {0}")]
    Overflow(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl AutopartError {
    pub fn code(&self) -> AutopartErrorCode {
        match self {
            AutopartError::NotPartitioned { .. } => AutopartErrorCode::NotPartitioned,
            AutopartError::NoSuitablePartition { .. } => AutopartErrorCode::NoSuitablePartition,
            AutopartError::AmbiguousRouting { .. } => AutopartErrorCode::AmbiguousRouting,
            AutopartError::CoverageGap { .. } => AutopartErrorCode::CoverageGap,
            AutopartError::UnboundedExtension { .. } => AutopartErrorCode::UnboundedExtension,
            AutopartError::ArithmeticOverflowOnCast { .. } => {
                AutopartErrorCode::ArithmeticOverflowOnCast
            }
            AutopartError::ConversionError { .. } => AutopartErrorCode::ConversionError,
            AutopartError::CallbackError(_) => AutopartErrorCode::CallbackError,
            AutopartError::NullPartitionKey => AutopartErrorCode::NullPartitionKey,
            AutopartError::TypeMismatch { .. } => AutopartErrorCode::TypeMismatch,
            AutopartError::UnsupportedOperation(_) => AutopartErrorCode::UnsupportedOperation,
            AutopartError::RangeOverlap { .. } => AutopartErrorCode::RangeOverlap,
            AutopartError::CheckConstraintFailed { .. } => AutopartErrorCode::CheckConstraintFailed,
            AutopartError::AlreadyExists { resource_type, .. } => match resource_type {
                ResourceType::Table => AutopartErrorCode::TableAlreadyExists,
                ResourceType::Partition => AutopartErrorCode::PartitionAlreadyExists,
                ResourceType::Callback => AutopartErrorCode::CallbackAlreadyExists,
            },
            AutopartError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Table => AutopartErrorCode::TableNotFound,
                ResourceType::Partition => AutopartErrorCode::PartitionNotFound,
                ResourceType::Callback => AutopartErrorCode::CallbackNotFound,
            },
            AutopartError::InvalidConfig { .. } => AutopartErrorCode::InvalidConfig,
            AutopartError::Validation(_) => AutopartErrorCode::Validation,
            AutopartError::LockTimeout { .. } => AutopartErrorCode::LockTimeout,
            AutopartError::LockPoisoned => AutopartErrorCode::LockPoisoned,
            AutopartError::PartitionCreationFailed { .. } => {
                AutopartErrorCode::PartitionCreationFailed
            }
            AutopartError::WorkerUnavailable(_) => AutopartErrorCode::WorkerUnavailable,
            AutopartError::WorkerTimeout => AutopartErrorCode::WorkerTimeout,
            AutopartError::NameExhausted { .. } => AutopartErrorCode::NameExhausted,
            AutopartError::SpawnLimitExceeded { .. } => AutopartErrorCode::SpawnLimitExceeded,
            AutopartError::Overflow(_) => AutopartErrorCode::Overflow,
            AutopartError::Encode(_) => AutopartErrorCode::Encode,
            AutopartError::Decode(_) => AutopartErrorCode::Decode,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Corrupted partitioning metadata. Retrying the statement cannot succeed
    /// until the catalog is repaired.
    pub fn is_metadata_corruption(&self) -> bool {
        matches!(
            self,
            AutopartError::AmbiguousRouting { .. }
                | AutopartError::CoverageGap { .. }
                | AutopartError::UnboundedExtension { .. }
                | AutopartError::ArithmeticOverflowOnCast { .. }
        )
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AutopartError::LockTimeout { .. }
                | AutopartError::WorkerTimeout
                | AutopartError::PartitionCreationFailed { .. }
        )
    }
}

pub(crate) fn not_found(resource_type: ResourceType, resource_id: impl Into<String>) -> AutopartError {
    AutopartError::NotFound {
        resource_type,
        resource_id: resource_id.into(),
    }
}

use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Row, TableId, Value};
use crate::catalog::MemoryTable;
use crate::error::AutopartError;
use crate::partition::arbiter::ArbiterCore;
use crate::partition::map::PartitionMap;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Column reordering from a parent row shape to a partition row shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleConversionMap {
    /// For each target column, the source column it reads; `None` fills NULL.
    sources: Vec<Option<usize>>,
}

impl TupleConversionMap {
    /// `Ok(None)` when both shapes are identical and rows pass through as is.
    pub fn build(
        source: &TableSchema,
        target: &TableSchema,
    ) -> Result<Option<Self>, AutopartError> {
        let conversion_error = |reason: String| AutopartError::ConversionError {
            partition: target.table_name.clone(),
            reason,
        };
        let identical = source.columns.len() == target.columns.len()
            && source
                .columns
                .iter()
                .zip(&target.columns)
                .all(|(s, t)| s.name == t.name && s.col_type == t.col_type);
        if identical {
            return Ok(None);
        }
        for column in &source.columns {
            if target.column_index(&column.name).is_none() {
                return Err(conversion_error(format!(
                    "column \"{}\" has no counterpart",
                    column.name
                )));
            }
        }
        let mut sources = Vec::with_capacity(target.columns.len());
        for column in &target.columns {
            match source.column_index(&column.name) {
                Some(idx) => {
                    let source_type = &source.columns[idx].col_type;
                    if !source_type.same_base(&column.col_type) {
                        return Err(conversion_error(format!(
                            "column \"{}\" is {} in \"{}\" but {} in the partition",
                            column.name, source_type, source.table_name, column.col_type
                        )));
                    }
                    sources.push(Some(idx));
                }
                None if column.nullable => sources.push(None),
                None => {
                    return Err(conversion_error(format!(
                        "column \"{}\" is NOT NULL and has no source",
                        column.name
                    )));
                }
            }
        }
        Ok(Some(Self { sources }))
    }

    pub fn convert(&self, row: &Row) -> Row {
        Row::from_values(
            self.sources
                .iter()
                .map(|src| {
                    src.and_then(|idx| row.values.get(idx).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect(),
        )
    }
}

/// Write-side state for one partition within a statement.
#[derive(Debug)]
pub struct PartitionHandle {
    pub partition_id: TableId,
    pub name: String,
    pub parent: TableId,
    write_handle: Arc<MemoryTable>,
    tuple_map: Option<TupleConversionMap>,
    partitioned: bool,
    child_map: Option<Arc<PartitionMap>>,
}

impl PartitionHandle {
    pub fn write_handle(&self) -> &Arc<MemoryTable> {
        &self.write_handle
    }

    pub fn tuple_map(&self) -> Option<&TupleConversionMap> {
        self.tuple_map.as_ref()
    }

    /// True when the partition is itself partitioned.
    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn convert(&self, row: Row) -> Row {
        match &self.tuple_map {
            Some(map) => map.convert(&row),
            None => row,
        }
    }

    /// Map of this partition's own partitions, loaded on first use and
    /// refreshed once the cached copy goes stale.
    pub fn child_map(&mut self, core: &ArbiterCore) -> Result<Arc<PartitionMap>, AutopartError> {
        let current = core
            .store
            .current()
            .catalog
            .partitioning_version(self.partition_id);
        if let Some(map) = &self.child_map
            && map.version == current
        {
            return Ok(Arc::clone(map));
        }
        let map = core.map(self.partition_id)?;
        self.child_map = Some(Arc::clone(&map));
        Ok(map)
    }
}

pub type HandleHook<'a> = Box<dyn FnMut(&PartitionHandle) + 'a>;

/// Per-statement cache of partition handles plus the rows buffered for them.
pub struct ResultPartitionCache<'a> {
    core: &'a ArbiterCore,
    handles: HashMap<TableId, PartitionHandle>,
    pending: BTreeMap<TableId, Vec<Row>>,
    on_init: Option<HandleHook<'a>>,
    on_close: Option<HandleHook<'a>>,
    closed: bool,
}

impl<'a> ResultPartitionCache<'a> {
    pub fn new(core: &'a ArbiterCore) -> Self {
        Self {
            core,
            handles: HashMap::new(),
            pending: BTreeMap::new(),
            on_init: None,
            on_close: None,
            closed: false,
        }
    }

    /// Runs for every handle when it is first opened.
    pub fn with_init_hook(mut self, hook: impl FnMut(&PartitionHandle) + 'a) -> Self {
        self.on_init = Some(Box::new(hook));
        self
    }

    /// Runs for every handle still open at `close`.
    pub fn with_close_hook(mut self, hook: impl FnMut(&PartitionHandle) + 'a) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&mut self, partition: TableId) -> Result<&mut PartitionHandle, AutopartError> {
        match self.handles.entry(partition) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let handle = open_handle(self.core, partition)?;
                debug!(
                    partition = %partition,
                    converts = handle.tuple_map.is_some(),
                    partitioned = handle.partitioned,
                    "partition handle opened"
                );
                if let Some(hook) = self.on_init.as_mut() {
                    hook(&handle);
                }
                Ok(e.insert(handle))
            }
        }
    }

    /// Drops the cached handle; the next `get` opens it again. Buffered rows
    /// are kept.
    pub fn invalidate(&mut self, partition: TableId) -> bool {
        self.handles.remove(&partition).is_some()
    }

    pub fn is_open(&self, partition: TableId) -> bool {
        self.handles.contains_key(&partition)
    }

    /// Removes and returns the rows buffered for `partition`.
    pub fn take_pending(&mut self, partition: TableId) -> Vec<Row> {
        self.pending.remove(&partition).unwrap_or_default()
    }

    pub fn buffer(&mut self, partition: TableId, row: Row) {
        self.pending.entry(partition).or_default().push(row);
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn pending_partitions(&self) -> Vec<TableId> {
        self.pending.keys().copied().collect()
    }

    /// Writes every buffered row. All write handles are resolved before the
    /// first row is written.
    pub fn flush(&mut self) -> Result<usize, AutopartError> {
        let mut targets = Vec::with_capacity(self.pending.len());
        for partition in self.pending.keys() {
            let table = match self.handles.get(partition) {
                Some(handle) => Arc::clone(&handle.write_handle),
                None => self.core.store.table_handle(*partition)?,
            };
            targets.push(table);
        }
        let pending = std::mem::take(&mut self.pending);
        let mut written = 0;
        for (table, rows) in targets.into_iter().zip(pending.into_values()) {
            written += rows.len();
            table.append(rows);
        }
        Ok(written)
    }

    /// Releases every handle, running the close hook once per handle.
    /// Unflushed rows are discarded.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        let handles = std::mem::take(&mut self.handles);
        if let Some(hook) = self.on_close.as_mut() {
            for handle in handles.values() {
                hook(handle);
            }
        }
    }
}

impl Drop for ResultPartitionCache<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_handle(core: &ArbiterCore, partition: TableId) -> Result<PartitionHandle, AutopartError> {
    let snapshot = core.store.current();
    let schema = snapshot.catalog.table(partition)?;
    let Some(parent) = schema.parent else {
        return Err(AutopartError::Validation(format!(
            "table \"{}\" is not a partition",
            schema.table_name
        )));
    };
    let parent_schema = snapshot.catalog.table(parent)?;
    Ok(PartitionHandle {
        partition_id: partition,
        name: schema.table_name.clone(),
        parent,
        write_handle: core.store.table_handle(partition)?,
        tuple_map: TupleConversionMap::build(parent_schema, schema)?,
        partitioned: snapshot.catalog.partitioning(partition).is_some(),
        child_map: None,
    })
}

#[cfg(test)]
mod tests {
    use super::TupleConversionMap;
    use crate::catalog::schema::{ColumnDef, TableSchema};
    use crate::catalog::types::{ColumnType, Row, TableId, Value};
    use crate::error::AutopartErrorCode;

    fn schema(name: &str, columns: Vec<ColumnDef>) -> TableSchema {
        TableSchema {
            id: TableId(1),
            schema_name: "public".into(),
            table_name: name.into(),
            tablespace: None,
            columns,
            parent: None,
            partition_constraint: None,
        }
    }

    fn parent() -> TableSchema {
        schema(
            "events",
            vec![
                ColumnDef::new("id", ColumnType::Integer).not_null(),
                ColumnDef::new("a", ColumnType::Text),
                ColumnDef::new("b", ColumnType::Float),
            ],
        )
    }

    #[test]
    fn identical_shapes_need_no_conversion() {
        let p = parent();
        let mut child = parent();
        child.table_name = "events_1".into();
        assert!(TupleConversionMap::build(&p, &child).expect("build").is_none());
    }

    #[test]
    fn reordered_and_extra_nullable_columns_are_mapped() {
        let child = schema(
            "events_1",
            vec![
                ColumnDef::new("id", ColumnType::Integer).not_null(),
                ColumnDef::new("b", ColumnType::Float),
                ColumnDef::new("note", ColumnType::Text),
                ColumnDef::new("a", ColumnType::Text),
            ],
        );
        let map = TupleConversionMap::build(&parent(), &child)
            .expect("build")
            .expect("differs");
        let row = Row::from_values(vec![
            Value::Integer(7),
            Value::text("x"),
            Value::Float(1.5),
        ]);
        assert_eq!(
            map.convert(&row).values,
            vec![Value::Integer(7), Value::Float(1.5), Value::Null, Value::text("x")]
        );
    }

    #[test]
    fn unrepresentable_shapes_name_the_partition() {
        let missing = schema(
            "events_2",
            vec![
                ColumnDef::new("id", ColumnType::Integer),
                ColumnDef::new("a", ColumnType::Text),
            ],
        );
        let err = TupleConversionMap::build(&parent(), &missing).expect_err("missing b");
        assert_eq!(err.code(), AutopartErrorCode::ConversionError);
        assert!(err.to_string().contains("events_2"));

        let retyped = schema(
            "events_3",
            vec![
                ColumnDef::new("id", ColumnType::Integer),
                ColumnDef::new("a", ColumnType::Text),
                ColumnDef::new("b", ColumnType::Text),
            ],
        );
        let err = TupleConversionMap::build(&parent(), &retyped).expect_err("b retyped");
        assert_eq!(err.code(), AutopartErrorCode::ConversionError);

        let required = schema(
            "events_4",
            vec![
                ColumnDef::new("id", ColumnType::Integer),
                ColumnDef::new("a", ColumnType::Text),
                ColumnDef::new("b", ColumnType::Float),
                ColumnDef::new("c", ColumnType::Integer).not_null(),
            ],
        );
        let err = TupleConversionMap::build(&parent(), &required).expect_err("not null");
        assert_eq!(err.code(), AutopartErrorCode::ConversionError);
    }
}

use crate::catalog::schema::{PartitionKind, TableSchema};
use crate::catalog::types::{ColumnType, TableId};
use crate::error::{AutopartError, ResourceType};
use crate::partition::bound::Bound;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type CallbackFn = Arc<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackSignature {
    pub args: Vec<ColumnType>,
    /// `None` is `void`.
    pub returns: Option<ColumnType>,
}

impl CallbackSignature {
    /// `(json) -> void`, the only shape accepted for init callbacks.
    pub fn init() -> Self {
        Self {
            args: vec![ColumnType::Json],
            returns: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Init,
}

#[derive(Clone)]
pub enum CallbackSpec {
    NotConfigured,
    Resolved {
        procedure: String,
        kind: CallbackKind,
        func: CallbackFn,
    },
}

impl fmt::Debug for CallbackSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackSpec::NotConfigured => write!(f, "NotConfigured"),
            CallbackSpec::Resolved {
                procedure, kind, ..
            } => f
                .debug_struct("Resolved")
                .field("procedure", procedure)
                .field("kind", kind)
                .finish_non_exhaustive(),
        }
    }
}

impl CallbackSpec {
    pub fn is_configured(&self) -> bool {
        matches!(self, CallbackSpec::Resolved { .. })
    }

    pub fn invoke(&self, payload: &serde_json::Value) -> Result<(), AutopartError> {
        match self {
            CallbackSpec::NotConfigured => Ok(()),
            CallbackSpec::Resolved {
                procedure, func, ..
            } => func(payload).map_err(|e| {
                AutopartError::CallbackError(format!("callback \"{procedure}\" failed: {e}"))
            }),
        }
    }
}

struct Registered {
    signature: CallbackSignature,
    func: CallbackFn,
}

/// Named procedures plus a per-parent cache of resolved init callbacks.
#[derive(Default)]
pub struct CallbackRegistry {
    procedures: RwLock<HashMap<String, Registered>>,
    resolved: RwLock<HashMap<TableId, (String, CallbackSpec)>>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.procedures.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("CallbackRegistry")
            .field("procedures", &names)
            .finish_non_exhaustive()
    }
}

impl CallbackRegistry {
    pub fn register(
        &self,
        name: &str,
        signature: CallbackSignature,
        func: CallbackFn,
    ) -> Result<(), AutopartError> {
        let mut procedures = self.procedures.write();
        if procedures.contains_key(name) {
            return Err(AutopartError::AlreadyExists {
                resource_type: ResourceType::Callback,
                resource_id: name.to_string(),
            });
        }
        procedures.insert(name.to_string(), Registered { signature, func });
        Ok(())
    }

    /// Checks `name` against the init-callback contract.
    pub fn validate_init(&self, name: &str) -> Result<(), AutopartError> {
        let procedures = self.procedures.read();
        let Some(registered) = procedures.get(name) else {
            return Err(AutopartError::NotFound {
                resource_type: ResourceType::Callback,
                resource_id: name.to_string(),
            });
        };
        if registered.signature != CallbackSignature::init() {
            return Err(AutopartError::CallbackError(format!(
                "callback \"{name}\" must have the signature (json) -> void"
            )));
        }
        Ok(())
    }

    /// Resolves the init callback for `parent` once and reuses it until the
    /// configured procedure name changes.
    pub fn resolve_for_parent(
        &self,
        parent: TableId,
        procedure: Option<&str>,
    ) -> Result<CallbackSpec, AutopartError> {
        let Some(name) = procedure else {
            return Ok(CallbackSpec::NotConfigured);
        };
        if let Some((cached_name, spec)) = self.resolved.read().get(&parent)
            && cached_name == name
        {
            return Ok(spec.clone());
        }
        self.validate_init(name)?;
        let func = {
            let procedures = self.procedures.read();
            match procedures.get(name) {
                Some(r) => Arc::clone(&r.func),
                None => {
                    return Err(AutopartError::NotFound {
                        resource_type: ResourceType::Callback,
                        resource_id: name.to_string(),
                    });
                }
            }
        };
        let spec = CallbackSpec::Resolved {
            procedure: name.to_string(),
            kind: CallbackKind::Init,
            func,
        };
        self.resolved
            .write()
            .insert(parent, (name.to_string(), spec.clone()));
        Ok(spec)
    }

    pub fn forget_parent(&self, parent: TableId) {
        self.resolved.write().remove(&parent);
    }
}

fn bound_json(bound: &Bound) -> serde_json::Value {
    match bound {
        Bound::Finite(v) => serde_json::Value::String(v.to_string()),
        _ => serde_json::Value::Null,
    }
}

/// Payload handed to init callbacks for a freshly created partition.
pub fn init_payload(
    parent: &TableSchema,
    partition: &TableSchema,
    kind: PartitionKind,
    bounds: Option<(&Bound, &Bound)>,
) -> serde_json::Value {
    let mut payload = json!({
        "parent": parent.table_name,
        "parent_schema": parent.schema_name,
        "partition": partition.table_name,
        "partition_schema": partition.schema_name,
        "parttype": kind.to_string(),
    });
    if let (PartitionKind::Range, Some((lower, upper)), Some(obj)) =
        (kind, bounds, payload.as_object_mut())
    {
        obj.insert("range_min".into(), bound_json(lower));
        obj.insert("range_max".into(), bound_json(upper));
    }
    payload
}

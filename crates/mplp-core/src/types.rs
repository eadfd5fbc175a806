use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CoreError;

/// Generic envelope for one module invocation
///
/// The coordination core only ever sees this envelope: the parameters are an
/// opaque blob forwarded to the module invoker untouched.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModuleCall {
    /// Target module (e.g. "confirm", "plan")
    pub module: String,

    /// Operation name within the module
    pub operation: String,

    /// Opaque parameters
    #[serde(default)]
    pub parameters: Value,
}

/// A strongly-typed module operation
///
/// Implement this on an adjacently tagged enum so each variant is one
/// operation of the module:
///
/// ```
/// use mplp_core::types::{ModuleCall, ModuleOperation};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// #[serde(tag = "operation", content = "parameters", rename_all = "snake_case")]
/// enum ConfirmOperation {
///     Approve { confirm_id: String },
///     Reject { confirm_id: String, reason: String },
/// }
///
/// impl ModuleOperation for ConfirmOperation {
///     fn module(&self) -> &str {
///         "confirm"
///     }
/// }
///
/// let call = ModuleCall::from_typed(&ConfirmOperation::Approve { confirm_id: "c1".into() }).unwrap();
/// assert_eq!(call.operation, "approve");
/// assert_eq!(call.parameters["confirm_id"], "c1");
/// ```
pub trait ModuleOperation: Serialize {
    /// Module that handles this operation
    fn module(&self) -> &str;
}

impl ModuleCall {
    /// Create a new call envelope
    pub fn new(
        module: impl Into<String>,
        operation: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            module: module.into(),
            operation: operation.into(),
            parameters,
        }
    }

    /// Flatten a typed operation into the generic envelope
    pub fn from_typed<T: ModuleOperation>(op: &T) -> Result<Self, CoreError> {
        let module = op.module().to_string();
        let mut fields = match serde_json::to_value(op)? {
            Value::Object(map) => map,
            other => {
                return Err(CoreError::SerializationError(format!(
                    "Expected an adjacently tagged operation for module {}, got {}",
                    module, other
                )))
            }
        };

        let operation = match fields.remove("operation") {
            Some(Value::String(name)) => name,
            _ => {
                return Err(CoreError::SerializationError(format!(
                    "Operation for module {} has no `operation` tag",
                    module
                )))
            }
        };

        Ok(Self {
            module,
            operation,
            parameters: fields.remove("parameters").unwrap_or(Value::Null),
        })
    }
}

/// Shallow-merge two parameter blobs, `overlay` keys winning
///
/// Only objects are merged; any other combination yields `overlay` unchanged
/// (or `base` when `overlay` is null).
pub fn merge_parameters(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => base.clone(),
        _ => overlay.clone(),
    }
}

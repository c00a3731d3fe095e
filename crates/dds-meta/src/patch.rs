use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Patch {
    /// RFC 7386 JSON merge patch. `null` removes a field.
    Merge(Value),
    /// RFC 6902 JSON patch. Only `replace` is supported.
    Json(Vec<JsonPatchOp>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum JsonPatchOp {
    Replace { path: String, value: Value },
}

impl Patch {
    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Patch::Json(vec![JsonPatchOp::Replace {
            path: path.into(),
            value: value.into(),
        }])
    }

    pub fn apply(&self, target: &mut Value) -> Result<(), String> {
        match self {
            Patch::Merge(patch) => {
                merge(target, patch);
                Ok(())
            }
            Patch::Json(ops) => ops.iter().try_for_each(|op| apply_op(target, op)),
        }
    }
}

fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target) = target else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            merge(target.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

fn apply_op(target: &mut Value, op: &JsonPatchOp) -> Result<(), String> {
    match op {
        JsonPatchOp::Replace { path, value } => {
            let slot = target
                .pointer_mut(path)
                .ok_or_else(|| format!("path {path} does not exist"))?;
            *slot = value.clone();
            Ok(())
        }
    }
}

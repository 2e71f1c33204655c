use crate::config::schema::{Config, ServerSpec};
use crate::errors::{ProxyError, ProxyResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Fields that may never change once a server has been created.
const IMMUTABLE_FIELDS: &[&str] = &["name", "created"];

/// Object-valued fields that are flat string maps. Their patches deep-merge
/// key-by-key, and an explicit `null` value removes a key.
const STRING_MAP_FIELDS: &[&str] = &["env", "headers", "extraParams"];

#[derive(Debug, Clone, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Value,
    pub after: Value,
}

/// Audit trail of one merge: consumed by activity/audit logging.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigDiff {
    pub modified: Vec<FieldChange>,
    pub added: Vec<FieldChange>,
    pub removed: Vec<FieldChange>,
    pub timestamp: DateTime<Utc>,
}

impl ConfigDiff {
    fn new() -> Self {
        Self {
            modified: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Apply a JSON patch object to a server spec.
///
/// Rules: present scalars override; string-map fields merge key-by-key with
/// `null` as the removal marker; arrays replace entirely; nested objects
/// recurse. Changing `name` or `created` fails with `ImmutableField` and
/// leaves the base untouched.
///
/// "Unset means no change" is expressed by key absence, not by zero
/// values: an explicit `false`/`0`/`""` in the patch overrides, otherwise
/// those values could never be set through a patch at all.
pub fn merge_server_spec(base: &ServerSpec, patch: &Value) -> ProxyResult<(ServerSpec, ConfigDiff)> {
    let base_value = serde_json::to_value(base).map_err(anyhow::Error::from)?;
    let (merged, diff) = merge_objects(&base_value, patch)?;
    let mut spec: ServerSpec = serde_json::from_value(merged)
        .map_err(|e| ProxyError::Validation(format!("patch produced invalid server spec: {}", e)))?;
    spec.updated = Some(Utc::now());
    Ok((spec, diff))
}

/// Apply a JSON patch object to the whole config. Server entries are not
/// addressable through this path (slices replace entirely, per the merge
/// rules); per-server updates go through [`merge_server_spec`].
pub fn merge_config(base: &Config, patch: &Value) -> ProxyResult<(Config, ConfigDiff)> {
    let base_value = serde_json::to_value(base).map_err(anyhow::Error::from)?;
    let (merged, diff) = merge_objects(&base_value, patch)?;
    let config: Config = serde_json::from_value(merged)
        .map_err(|e| ProxyError::Validation(format!("patch produced invalid config: {}", e)))?;
    Ok((config, diff))
}

fn merge_objects(base: &Value, patch: &Value) -> ProxyResult<(Value, ConfigDiff)> {
    let patch_map = match patch {
        Value::Object(map) => map,
        _ => {
            return Err(ProxyError::Validation(
                "patch must be a JSON object".to_string(),
            ));
        }
    };

    // Immutable fields are checked before any merging so a bad patch leaves
    // the base completely untouched.
    if let Value::Object(base_map) = base {
        for field in IMMUTABLE_FIELDS {
            if let Some(patched) = patch_map.get(*field) {
                let current = base_map.get(*field).unwrap_or(&Value::Null);
                if !patched.is_null() && patched != current {
                    return Err(ProxyError::ImmutableField {
                        field: (*field).to_string(),
                    });
                }
            }
        }
    }

    let mut diff = ConfigDiff::new();
    let merged = merge_value(base, patch, "", &mut diff)?;
    Ok((merged, diff))
}

fn merge_value(base: &Value, patch: &Value, path: &str, diff: &mut ConfigDiff) -> ProxyResult<Value> {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut out = base_map.clone();
            for (key, patch_val) in patch_map {
                let child_path = join_path(path, key);
                let in_string_map = STRING_MAP_FIELDS.contains(&leaf_field(path));
                match (base_map.get(key), patch_val) {
                    // null removes entries of string maps; elsewhere it is a no-op
                    (Some(before), Value::Null) if in_string_map => {
                        diff.removed.push(FieldChange {
                            field: child_path,
                            before: before.clone(),
                            after: Value::Null,
                        });
                        out.remove(key);
                    }
                    (_, Value::Null) => {}
                    (Some(before @ Value::Object(_)), Value::Object(_)) => {
                        let merged = merge_value(before, patch_val, &child_path, diff)?;
                        out.insert(key.clone(), merged);
                    }
                    (Some(before), after) => {
                        if before != after {
                            diff.modified.push(FieldChange {
                                field: child_path,
                                before: before.clone(),
                                after: after.clone(),
                            });
                            out.insert(key.clone(), after.clone());
                        }
                    }
                    (None, after) => {
                        diff.added.push(FieldChange {
                            field: child_path,
                            before: Value::Null,
                            after: after.clone(),
                        });
                        out.insert(key.clone(), after.clone());
                    }
                }
            }
            Ok(Value::Object(out))
        }
        // Base is not an object (or key was a scalar): patch value wins.
        (before, after) => {
            if before != after && !after.is_null() {
                diff.modified.push(FieldChange {
                    field: path.to_string(),
                    before: before.clone(),
                    after: after.clone(),
                });
                Ok(after.clone())
            } else {
                Ok(before.clone())
            }
        }
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn leaf_field(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// Validate a raw patch for a new-or-updated server before merging:
/// `extraParams` must not shadow reserved OAuth parameters.
pub fn check_reserved_oauth_params(patch: &Value) -> ProxyResult<()> {
    if let Some(Value::Object(extra)) = patch.pointer("/oauth/extraParams") {
        for key in extra.keys() {
            if crate::config::schema::RESERVED_OAUTH_PARAMS.contains(&key.as_str()) {
                return Err(ProxyError::Validation(format!(
                    "oauth.extraParams may not override reserved parameter '{}'",
                    key
                )));
            }
        }
    }
    Ok(())
}

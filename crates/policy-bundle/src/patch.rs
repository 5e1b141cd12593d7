//! Delta patches: an ordered sequence of JSON-Patch-like operations applied
//! strictly sequentially against a data tree or store subtree.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::Data;
use crate::error::{BundleError, Result};

/// `op ∈ {upsert, replace, remove}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Upsert,
    Replace,
    Remove,
}

/// `{op, path, value}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// `{"data": [PatchOperation, ...]}` — the `patch.json` wire shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub data: Vec<PatchOperation>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Parse `path` into tokens, unescaping `~1` → `/` and `~0` → `~`.
/// Unescaping happens in that order (`~1` before `~0`'s
/// literal tilde would otherwise clash) exactly once per token.
pub fn tokenize(path: &str) -> Vec<String> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(unescape_token)
        .collect()
}

fn unescape_token(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('1') => out.push('/'),
                Some('0') => out.push('~'),
                Some(other) => {
                    out.push('~');
                    out.push(other);
                }
                None => out.push('~'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Every touched path must fall under one of the bundle's roots (I4); a
/// patch op targeting a path outside this bundle's roots fails with
/// `PatchScopeViolation`.
fn check_scope(tokens: &[String], roots: &[String]) -> Result<()> {
    let path = tokens.join("/");
    let under_root = roots.iter().any(|r| {
        if r.is_empty() {
            return true;
        }
        let rseg: Vec<&str> = r.split('/').collect();
        rseg.len() <= tokens.len() && rseg == tokens[..rseg.len()]
    });
    if !under_root {
        bail!(BundleError::manifest_invariant(format!(
            "patch targeting '/{path}' is outside roots {roots:?}"
        )));
    }
    Ok(())
}

/// Apply a single operation against a data tree, enforcing I4 root scoping.
/// Patch application is strictly sequential by construction: callers apply
/// ops from a `Patch` one at a time via [`apply_patch`].
pub fn apply_operation(data: &mut Data, op: &PatchOperation, roots: &[String]) -> Result<()> {
    let tokens = tokenize(&op.path);
    check_scope(&tokens, roots)?;

    match op.op {
        PatchOp::Upsert => {
            let value = op
                .value
                .clone()
                .ok_or_else(|| BundleError::format("patch", "upsert requires a value"))?;
            upsert(&mut data.0, &tokens, value)?;
        }
        PatchOp::Replace => {
            let value = op
                .value
                .clone()
                .ok_or_else(|| BundleError::format("patch", "replace requires a value"))?;
            replace(&mut data.0, &tokens, value)?;
        }
        PatchOp::Remove => {
            remove(&mut data.0, &tokens)?;
        }
    }
    Ok(())
}

/// Apply every operation of a patch in order (P4): applying
/// `[p1,...,pn]` is equivalent to applying `p1` then `[p2,...,pn]`, which
/// holds here because each op observes exactly the mutations of the ones
/// before it.
pub fn apply_patch(data: &mut Data, patch: &Patch, roots: &[String]) -> Result<()> {
    for op in &patch.data {
        apply_operation(data, op, roots)?;
    }
    Ok(())
}

fn upsert(root: &mut Value, tokens: &[String], value: Value) -> Result<()> {
    let Some((last, parents)) = tokens.split_last() else {
        *root = value;
        return Ok(());
    };
    let parent = ensure_object_parent(root, parents)?;

    if last == "-" {
        match parent {
            Value::Array(arr) => {
                arr.push(value);
                return Ok(());
            }
            Value::Object(map) => {
                // `-` as an object key names a literal dash entry.
                map.insert("-".to_string(), value);
                return Ok(());
            }
            _ => bail!(BundleError::format(
                "patch",
                "'-' is only valid as the final token of an array path"
            )),
        }
    }

    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
        }
        Value::Array(arr) => {
            let idx: usize = last.parse().map_err(|_| {
                BundleError::format("patch", format!("'{last}' is not a valid array index"))
            })?;
            if idx > arr.len() {
                bail!(BundleError::format(
                    "patch",
                    format!("array index {idx} out of bounds")
                ));
            }
            arr.insert(idx, value);
        }
        _ => bail!(BundleError::format(
            "patch",
            "upsert target's parent is neither object nor array"
        )),
    }
    Ok(())
}

fn replace(root: &mut Value, tokens: &[String], value: Value) -> Result<()> {
    let target = navigate_mut(root, tokens)
        .ok_or_else(|| BundleError::format("patch", "replace target does not exist"))?;
    *target = value;
    Ok(())
}

fn remove(root: &mut Value, tokens: &[String]) -> Result<()> {
    let Some((last, parents)) = tokens.split_last() else {
        bail!(BundleError::format("patch", "cannot remove the root"));
    };
    let parent = navigate_mut(root, parents)
        .ok_or_else(|| BundleError::format("patch", "remove target does not exist"))?;
    match parent {
        Value::Object(map) => {
            if map.remove(last).is_none() {
                bail!(BundleError::format("patch", "remove target does not exist"));
            }
        }
        Value::Array(arr) => {
            let idx: usize = last.parse().map_err(|_| {
                BundleError::format("patch", format!("'{last}' is not a valid array index"))
            })?;
            if idx >= arr.len() {
                bail!(BundleError::format("patch", "remove target does not exist"));
            }
            arr.remove(idx);
        }
        _ => bail!(BundleError::format(
            "patch",
            "remove target's parent is neither object nor array"
        )),
    }
    Ok(())
}

fn ensure_object_parent<'a>(root: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value> {
    let mut node = root;
    for token in tokens {
        if !node.is_object() && !node.is_array() {
            *node = Value::Object(serde_json::Map::new());
        }
        match node {
            Value::Object(map) => {
                node = map
                    .entry(token.clone())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
            }
            Value::Array(arr) => {
                let idx: usize = token.parse().map_err(|_| {
                    BundleError::format("patch", format!("'{token}' is not a valid array index"))
                })?;
                if idx >= arr.len() {
                    arr.resize(idx + 1, Value::Object(serde_json::Map::new()));
                }
                node = &mut arr[idx];
            }
            _ => unreachable!(),
        }
    }
    Ok(node)
}

fn navigate_mut<'a>(root: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    let mut node = root;
    for token in tokens {
        node = match node {
            Value::Object(map) => map.get_mut(token)?,
            Value::Array(arr) => {
                let idx: usize = token.parse().ok()?;
                arr.get_mut(idx)?
            }
            _ => return None,
        };
    }
    Some(node)
}

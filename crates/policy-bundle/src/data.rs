//! The data tree: a recursive mapping from string keys to JSON values,
//! merged in from `data.json`/`data.yaml`/`data.yml` files by directory
//! path, and validated against the manifest's roots (I3).

use anyhow::bail;
use serde_json::{Map, Value};

use crate::error::{BundleError, Result};

/// A recursive object tree. Internally this is just a `serde_json::Value`
/// that is always an `Object` at the root — kept as a newtype so merge and
/// scope-validation operations have a single, obvious home.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Data(pub Value);

impl Data {
    pub fn new() -> Self {
        Data(Value::Object(Map::new()))
    }

    pub fn is_empty(&self) -> bool {
        matches!(&self.0, Value::Object(m) if m.is_empty())
    }

    /// Merge a file's decoded value into the tree at the directory path
    /// given by `segments`. An object value is merged
    /// key-by-key at that path; any other value (string/number/bool/null/
    /// array) replaces the tree exactly at that path, treating it as a leaf.
    ///
    /// Conflicts — two files writing the same non-object leaf, or a file
    /// trying to make a non-object the parent of another file — fail with
    /// `DataConflict(path)`.
    pub fn merge_file(&mut self, segments: &[String], value: Value) -> Result<()> {
        match value {
            Value::Object(obj) => {
                let node = self.ensure_object_path(segments)?;
                for (k, v) in obj {
                    merge_into(node, &k, v, &join(segments, &k))?;
                }
            }
            leaf => {
                self.set_leaf(segments, leaf)?;
            }
        }
        Ok(())
    }

    fn ensure_object_path<'a>(&'a mut self, segments: &[String]) -> Result<&'a mut Map<String, Value>> {
        let mut node = self
            .0
            .as_object_mut()
            .expect("Data root is always an object");
        for (i, seg) in segments.iter().enumerate() {
            let entry = node.entry(seg.clone()).or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                bail!(BundleError::DataConflict {
                    path: join(&segments[..=i], "")
                });
            }
            node = entry.as_object_mut().unwrap();
        }
        Ok(node)
    }

    fn set_leaf(&mut self, segments: &[String], value: Value) -> Result<()> {
        if segments.is_empty() {
            if !self.is_empty() {
                bail!(BundleError::DataConflict {
                    path: "/".to_string()
                });
            }
            self.0 = value;
            return Ok(());
        }
        let (last, parent_segments) = segments.split_last().unwrap();
        let parent = self.ensure_object_path(parent_segments)?;
        if parent.contains_key(last) {
            bail!(BundleError::DataConflict {
                path: join(segments, "")
            });
        }
        parent.insert(last.clone(), value);
        Ok(())
    }

    /// The DFS that enforces I3: walks the tree depth-first.
    /// If the current path already lies inside a root, the whole subtree is
    /// accepted. If some root is a descendant of the current path, keep
    /// recursing. Otherwise the leaf reached at this path is a violation.
    ///
    /// Implemented iteratively with an explicit work-list of
    /// `(path_segments, value)` pairs so a
    /// maliciously deep document cannot exhaust the call stack.
    pub fn validate_scope(&self, roots: &[String]) -> Result<()> {
        let mut stack: Vec<(Vec<String>, &Value)> = vec![(Vec::new(), &self.0)];
        while let Some((path, value)) = stack.pop() {
            let path_str = join(&path, "");
            if under_some_root(&path_str, roots) {
                continue; // subtree accepted
            }
            match value {
                Value::Object(map) if !map.is_empty() => {
                    if root_is_descendant_of(&path_str, roots) {
                        for (k, v) in map {
                            let mut child = path.clone();
                            child.push(k.clone());
                            stack.push((child, v));
                        }
                    } else {
                        bail!(BundleError::manifest_invariant(format!(
                            "roots {roots:?} do not permit data at path '{}'",
                            display_path(&path_str)
                        )));
                    }
                }
                _ => {
                    // Leaf (or empty object) reached without being inside a root.
                    bail!(BundleError::manifest_invariant(format!(
                        "roots {roots:?} do not permit data at path '{}'",
                        display_path(&path_str)
                    )));
                }
            }
        }
        Ok(())
    }
}

fn display_path(path: &str) -> String {
    format!("/{path}")
}

fn join(segments: &[String], extra: &str) -> String {
    let mut all: Vec<&str> = segments.iter().map(String::as_str).collect();
    if !extra.is_empty() {
        all.push(extra);
    }
    all.join("/")
}

fn under_some_root(path: &str, roots: &[String]) -> bool {
    roots.iter().any(|r| is_prefix(r, path))
}

fn root_is_descendant_of(path: &str, roots: &[String]) -> bool {
    roots.iter().any(|r| is_prefix(path, r))
}

/// Segment-wise prefix test: `a` is a prefix of `a/b` but not of
/// `another_root`.
fn is_prefix(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if path.is_empty() {
        return false;
    }
    let p: Vec<&str> = prefix.split('/').collect();
    let q: Vec<&str> = path.split('/').collect();
    p.len() <= q.len() && p[..] == q[..p.len()]
}

fn merge_into(node: &mut Map<String, Value>, key: &str, value: Value, path: &str) -> Result<()> {
    match (node.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                let child_path = format!("{path}/{k}");
                merge_into(existing, &k, v, &child_path)?;
            }
            Ok(())
        }
        (Some(_existing), _incoming) => {
            bail!(BundleError::DataConflict {
                path: path.to_string()
            })
        }
        (None, incoming) => {
            node.insert(key.to_string(), incoming);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_object_under_directory_path() {
        let mut data = Data::new();
        data.merge_file(&["a".into(), "b".into()], json!({"c": 1}))
            .unwrap();
        assert_eq!(data.0, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn merge_leaf_at_empty_directory() {
        let mut data = Data::new();
        data.merge_file(&["a".into()], json!("leaf-value")).unwrap();
        assert_eq!(data.0, json!({"a": "leaf-value"}));
    }

    #[test]
    fn conflicting_leaf_writes_fail() {
        let mut data = Data::new();
        data.merge_file(&["a".into()], json!("one")).unwrap();
        let err = data.merge_file(&["a".into()], json!("two")).unwrap_err();
        assert!(err.to_string().contains("data conflict"));
    }

    #[test]
    fn scenario_3_data_outside_scope_rejected() {
        let roots = vec!["a".to_string(), "b".to_string(), "c/d".to_string()];
        let mut data = Data::new();
        data.merge_file(&[], json!({"a": 1})).unwrap();
        data.merge_file(&["c".into(), "e".into()], json!("bad"))
            .unwrap();
        let err = data.validate_scope(&roots).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("do not permit data at path '/c/e'"), "{msg}");
    }

    #[test]
    fn data_inside_root_is_accepted() {
        let roots = vec!["a".to_string()];
        let mut data = Data::new();
        data.merge_file(&["a".into(), "b".into()], json!({"c": 1}))
            .unwrap();
        data.validate_scope(&roots).unwrap();
    }
}

//! Manifest model: roots, metadata, wasm resolvers, and the overlap rule
//! shared by the single-bundle (I1) and cross-bundle (I5) invariants.

use std::collections::BTreeMap;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// An `{entrypoint, module}` pair resolving a wasm entrypoint to the module
/// that implements it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmResolver {
    pub entrypoint: String,
    pub module: String,
}

/// Revision, roots, free-form metadata, and wasm resolvers.
///
/// `roots` is `None` when the manifest omits the field entirely — that is
/// semantically distinct from `Some(vec![])`, which means "this bundle owns
/// nothing", so it is modeled as
/// `Option<Vec<String>>` rather than a sentinel empty vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub revision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "wasm")]
    pub wasm_resolvers: Vec<WasmResolver>,
}

impl Manifest {
    /// `Init`: installs the default root `[""]` if roots are absent.
    pub fn init(&mut self) {
        if self.roots.is_none() {
            self.roots = Some(vec![String::new()]);
        }
    }

    /// The effective root set: absent roots default to `[""]` ("this bundle
    /// owns everything").
    pub fn effective_roots(&self) -> Vec<String> {
        self.roots.clone().unwrap_or_else(|| vec![String::new()])
    }

    /// `AddRoot`: idempotent, re-validates afterwards.
    pub fn add_root(&mut self, root: impl Into<String>) -> Result<()> {
        let root = normalize_root(&root.into());
        let mut roots = self.roots.clone().unwrap_or_default();
        if !roots.contains(&root) {
            roots.push(root);
        }
        self.roots = Some(roots);
        self.validate_roots()?;
        Ok(())
    }

    /// `Validate`: enforces I1 (roots are normalized and pairwise
    /// non-prefix).
    pub fn validate_roots(&self) -> Result<()> {
        let roots = self.effective_roots();
        for root in &roots {
            if root != &normalize_root(root) {
                bail!(crate::error::BundleError::manifest_invariant(format!(
                    "root '{root}' is not normalized (no leading/trailing '/')"
                )));
            }
        }
        for i in 0..roots.len() {
            for j in (i + 1)..roots.len() {
                if overlap(&roots[i], &roots[j]) {
                    bail!(crate::error::BundleError::manifest_invariant(format!(
                        "overlapped roots: '{}' and '{}'",
                        roots[i], roots[j]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Two manifests are `Equal` iff revision, metadata, roots-as-set, and
    /// wasm resolvers (as an ordered sequence) all match.
    pub fn manifest_eq(&self, other: &Manifest) -> bool {
        if self.revision != other.revision {
            return false;
        }
        if self.metadata != other.metadata {
            return false;
        }
        if self.wasm_resolvers != other.wasm_resolvers {
            return false;
        }
        let mut a = self.effective_roots();
        let mut b = other.effective_roots();
        a.sort();
        b.sort();
        a == b
    }
}

/// Normalize a root: strip leading/trailing `/`.
pub fn normalize_root(root: &str) -> String {
    root.trim_matches('/').to_string()
}

/// Split a normalized root into `/`-separated segments. The empty root has
/// zero segments.
fn segments(root: &str) -> Vec<&str> {
    if root.is_empty() {
        Vec::new()
    } else {
        root.split('/').collect()
    }
}

/// The overlap test used by I1 and I5: two roots overlap iff
/// one is a prefix *segment* sequence of the other (including equality), or
/// either is empty. Partial segment overlap (`a` vs `another_root`) is not
/// overlap — comparison is segment-wise, not a raw string prefix test.
pub fn overlap(r1: &str, r2: &str) -> bool {
    let a = segments(r1);
    let b = segments(r2);
    if a.is_empty() || b.is_empty() {
        return true;
    }
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}

/// Run the I1/I5 segment-overlap check across an arbitrary set of roots,
/// returning the names of bundles implicated in any violation found. Used
/// directly by [`crate::manifest::Manifest::validate_roots`] for I1 (single
/// manifest) and by the activator for I5 (cross-bundle).
pub fn find_overlap(named_roots: &[(&str, &[String])]) -> Option<(String, String)> {
    for i in 0..named_roots.len() {
        for j in (i + 1)..named_roots.len() {
            for r1 in named_roots[i].1 {
                for r2 in named_roots[j].1 {
                    if overlap(r1, r2) {
                        return Some((named_roots[i].0.to_string(), named_roots[j].0.to_string()));
                    }
                }
            }
        }
    }
    None
}

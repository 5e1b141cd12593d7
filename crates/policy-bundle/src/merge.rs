//! Merge multiple bundles into one.

use anyhow::bail;

use crate::bundle::Bundle;
use crate::error::{BundleError, Result};
use crate::manifest::Manifest;

/// Combine a non-empty list of bundles, each with an initialized manifest,
/// into a single bundle:
/// - roots are the union of inputs' roots (must pass I1 after union)
/// - data trees are the disjoint union of inputs' data (same-path leaves → error)
/// - modules/wasm/plan lists are concatenated in input order
/// - the manifest revision is cleared (the merged bundle is unsigned)
///
/// Fails with `ManifestNotInitialized` if any input has no initialized
/// manifest.
pub fn merge(bundles: Vec<Bundle>) -> Result<Bundle> {
    if bundles.is_empty() {
        bail!(BundleError::format("merge", "no bundles to merge"));
    }

    for bundle in &bundles {
        if bundle.manifest.roots.is_none() {
            bail!(BundleError::manifest_invariant(
                "ManifestNotInitialized: merge input has no initialized manifest"
            ));
        }
    }

    let mut merged = Bundle::new();
    let mut roots: Vec<String> = Vec::new();
    let mut wasm_resolvers = Vec::new();
    let mut metadata = std::collections::BTreeMap::new();

    for bundle in bundles {
        for root in bundle.manifest.effective_roots() {
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        wasm_resolvers.extend(bundle.manifest.wasm_resolvers.clone());
        metadata.extend(bundle.manifest.metadata.clone());

        if !bundle.data.is_empty() {
            // Recursive disjoint union, reusing the same merge-by-path
            // logic `Data::merge_file` uses for directory-path merges:
            // descend into shared interior objects, only error when two
            // inputs write the same leaf path (spec.md §4.8), not merely
            // share a top-level ancestor like `a/b` vs `a/c`.
            merged.data.merge_file(&[], bundle.data.0)?;
        }

        merged.modules.extend(bundle.modules);
        merged.wasm.extend(bundle.wasm);
        merged.plan.extend(bundle.plan);
    }

    merged.manifest = Manifest {
        revision: String::new(), // cleared: the merged bundle is unsigned
        roots: Some(roots),
        metadata,
        wasm_resolvers,
    };
    merged.manifest.validate_roots()?;
    merged.signatures = None;

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle_with(roots: Vec<&str>, data: serde_json::Value) -> Bundle {
        let mut b = Bundle::new();
        b.manifest.roots = Some(roots.into_iter().map(String::from).collect());
        b.data = crate::data::Data(data);
        b
    }

    #[test]
    fn merges_disjoint_roots_and_data() {
        let a = bundle_with(vec!["a"], json!({"a": {"x": 1}}));
        let b = bundle_with(vec!["b"], json!({"b": {"y": 2}}));
        let merged = merge(vec![a, b]).unwrap();

        let mut roots = merged.manifest.effective_roots();
        roots.sort();
        assert_eq!(roots, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(merged.data.0, json!({"a": {"x": 1}, "b": {"y": 2}}));
        assert_eq!(merged.manifest.revision, "");
    }

    #[test]
    fn overlapping_roots_after_union_fail() {
        let a = bundle_with(vec!["a"], json!({}));
        let b = bundle_with(vec!["a/b"], json!({}));
        assert!(merge(vec![a, b]).is_err());
    }

    #[test]
    fn uninitialized_manifest_rejected() {
        let mut b = Bundle::new();
        b.manifest.roots = None;
        let err = merge(vec![b]).unwrap_err();
        assert!(err.to_string().contains("ManifestNotInitialized"));
    }

    #[test]
    fn same_path_leaf_conflict_rejected() {
        let a = bundle_with(vec!["a"], json!({"a": 1}));
        let b = bundle_with(vec!["b"], json!({"a": 2}));
        assert!(merge(vec![a, b]).is_err());
    }

    #[test]
    fn shared_interior_ancestor_with_disjoint_leaves_succeeds() {
        // "a/b" and "a/c" are non-overlapping roots (I1 passes), and both
        // inputs' data nests under the shared top-level key "a" — that
        // shared ancestor must not itself be treated as a conflicting leaf.
        let a = bundle_with(vec!["a/b"], json!({"a": {"b": 1}}));
        let b = bundle_with(vec!["a/c"], json!({"a": {"c": 2}}));
        let merged = merge(vec![a, b]).unwrap();
        assert_eq!(merged.data.0, json!({"a": {"b": 1, "c": 2}}));
    }
}

//! Store binding: activate/deactivate bundles against a transactional store.
//! Activation happens inside a single caller-provided transaction; the
//! activator itself performs no non-transactional side effect, so a failure
//! before the caller's commit leaves the store unmodified (P5).

use std::collections::BTreeMap;

use anyhow::bail;

use crate::bundle::Bundle;
use crate::data::Data;
use crate::error::{BundleError, Result};
use crate::manifest::{self, Manifest};
use crate::metrics::Metrics;
use crate::patch;
use crate::store::{Compiler, Store, Transaction, WriteOp};

/// Inputs to [`Activator::activate`].
pub struct ActivateOpts<'a> {
    pub bundles: BTreeMap<String, Bundle>,
    pub extra_modules: BTreeMap<String, Vec<u8>>,
    pub legacy: bool,
    pub default_rego_version: Option<String>,
    pub compiler: &'a dyn Compiler,
    pub metrics: &'a dyn Metrics,
}

/// Inputs to [`Activator::deactivate`].
pub struct DeactivateOpts<'a> {
    pub names: Vec<String>,
    pub legacy: bool,
    pub metrics: &'a dyn Metrics,
}

/// The existing `/system/bundles/<name>` index entry.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
struct IndexEntry {
    manifest: Manifest,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
}

pub struct Activator<'s> {
    store: &'s dyn Store,
}

impl<'s> Activator<'s> {
    pub fn new(store: &'s dyn Store) -> Self {
        Self { store }
    }

    fn index_path(&self, name: &str, legacy: bool) -> String {
        if legacy {
            "/system/bundle".to_string()
        } else {
            format!("/system/bundles/{name}")
        }
    }

    fn existing_index(&self, txn: &dyn Transaction, name: &str, legacy: bool) -> Option<IndexEntry> {
        let path = format!("{}/manifest", self.index_path(name, legacy));
        let value = self.store.read(txn, &path).ok()?;
        serde_json::from_value(value).ok()
    }

    fn existing_names(&self, txn: &dyn Transaction) -> Vec<String> {
        // Named bundles are discovered by listing the `/system/bundles`
        // namespace; the legacy bundle at `/system/bundle` is never
        // returned here (legacy and named entries never see each other).
        match self.store.read(txn, "/system/bundles") {
            Ok(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Overlap check, delta guard, erase, patch, write, compile, index —
    /// all inside the caller's transaction.
    pub fn activate(&self, txn: &mut dyn Transaction, opts: ActivateOpts<'_>) -> Result<()> {
        tracing::debug!(bundles = opts.bundles.len(), legacy = opts.legacy, "activating bundles");
        // 1. Overlap check: combine roots of already-activated bundles
        //    (excluding ones being replaced) with incoming roots.
        let incoming_names: Vec<&str> = opts.bundles.keys().map(String::as_str).collect();
        let mut named_roots: Vec<(String, Vec<String>)> = Vec::new();
        for existing_name in self.existing_names(txn) {
            if incoming_names.contains(&existing_name.as_str()) {
                continue;
            }
            if let Some(entry) = self.existing_index(txn, &existing_name, false) {
                named_roots.push((existing_name, entry.manifest.effective_roots()));
            }
        }
        for (name, bundle) in &opts.bundles {
            named_roots.push((name.clone(), bundle.manifest.effective_roots()));
        }
        let refs: Vec<(&str, &[String])> = named_roots
            .iter()
            .map(|(n, r)| (n.as_str(), r.as_slice()))
            .collect();
        if let Some((a, b)) = manifest::find_overlap(&refs) {
            tracing::warn!(bundle_a = %a, bundle_b = %b, "cross-bundle root overlap");
            bail!(BundleError::CrossBundleOverlap {
                names: vec![a, b]
            });
        }

        // 2. Delta guard.
        for (name, bundle) in &opts.bundles {
            if !bundle.is_delta() {
                continue;
            }
            let Some(existing) = self.existing_index(txn, name, opts.legacy) else {
                bail!(BundleError::DeltaMismatch { name: name.clone() });
            };
            if !existing.manifest.manifest_eq(&bundle.manifest) {
                bail!(BundleError::DeltaMismatch { name: name.clone() });
            }
        }

        // 3. Erase superseded data (skip delta bundles).
        for bundle in opts.bundles.values() {
            if bundle.is_delta() {
                continue;
            }
            for root in bundle.manifest.effective_roots() {
                let path = root_path(&root);
                self.store
                    .write(txn, WriteOp::Remove, &path, serde_json::Value::Null)
                    .ok(); // not-found is fine: nothing to erase yet
            }
        }

        // 4. Erase superseded policies; remaining modules are re-parsed
        //    under the default rego version unless overridden. Delta
        //    bundles carry no modules of their own, so their roots are
        //    excluded here (mirrors the step-3 delta skip) — erasing them
        //    would delete the targeted snapshot's modules with nothing to
        //    replace them.
        let snapshot_roots: Vec<String> = opts
            .bundles
            .values()
            .filter(|b| !b.is_delta())
            .flat_map(|b| b.manifest.effective_roots())
            .collect();
        let mut retained_modules: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for name in self.store.list_policies(txn).unwrap_or_default() {
            let under_incoming = snapshot_roots.iter().any(|r| path_under_root(&name, r));
            if under_incoming {
                self.store.delete_policy(txn, &name).ok();
            } else if let Ok(bytes) = self.store.get_policy(txn, &name) {
                retained_modules.insert(name, bytes);
            }
        }

        // 5. Apply patches for delta bundles. Patch paths are absolute
        //    from the store root, so each delta is applied once against
        //    the whole store tree (not per-root against a root subtree,
        //    which would double-nest the root segment and misalign
        //    `replace`/`remove` targets).
        for (name, bundle) in &opts.bundles {
            if !bundle.is_delta() {
                continue;
            }
            let roots = bundle.manifest.effective_roots();
            let current = self
                .store
                .read(txn, "/")
                .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
            let mut data = Data(current);
            patch::apply_patch(&mut data, &bundle.patch, &roots)?;
            self.store
                .write(txn, WriteOp::Replace, "/", data.0)
                .map_err(|e| BundleError::StoreError {
                    operation: format!("apply patch for '{name}'"),
                    source: e.into(),
                })?;
        }

        // 6. Write data for snapshot bundles.
        let mut data_bytes_written: u64 = 0;
        for bundle in opts.bundles.values() {
            if bundle.is_delta() {
                continue;
            }
            for root in bundle.manifest.effective_roots() {
                let Some(subtree) = data_at_root(&bundle.data.0, &root) else {
                    continue;
                };
                let path = root_path(&root);
                let serialized = serde_json::to_vec(&subtree).unwrap_or_default();
                data_bytes_written += serialized.len() as u64;
                self.store
                    .write(txn, WriteOp::Replace, &path, subtree)
                    .map_err(|e| BundleError::StoreError {
                        operation: format!("write data under root '{root}'"),
                        source: e.into(),
                    })?;
            }
        }
        opts.metrics.data_bytes_written(data_bytes_written);

        // 7. Write modules; compile everything together.
        let mut all_modules = retained_modules;
        for (name, bundle) in &opts.bundles {
            for module in &bundle.modules {
                let key = if opts.legacy {
                    module.path.clone()
                } else {
                    format!("{name}/{}", module.path)
                };
                self.store
                    .upsert_policy(txn, &key, module.raw.clone())
                    .map_err(|e| BundleError::StoreError {
                        operation: format!("write module '{key}'"),
                        source: e.into(),
                    })?;
                all_modules.insert(key, module.raw.clone());
            }
        }
        all_modules.extend(opts.extra_modules.clone());

        let compiled = opts.compiler.compile(&all_modules);
        if !compiled.errors.is_empty() {
            bail!(BundleError::CompileError {
                message: compiled.errors.join("; ")
            });
        }
        opts.metrics.modules_compiled(compiled.compiled_modules.len() as u64);

        // 8. Write the manifest index (and lazy-mode wasm bodies).
        for (name, bundle) in &opts.bundles {
            let index_path = format!("{}/manifest", self.index_path(name, opts.legacy));
            let entry = IndexEntry {
                manifest: bundle.manifest.clone(),
                etag: bundle.etag.clone(),
            };
            let value = serde_json::to_value(&entry).unwrap_or(serde_json::Value::Null);
            self.store
                .write(txn, WriteOp::Replace, &index_path, value)
                .map_err(|e| BundleError::StoreError {
                    operation: format!("write manifest index for '{name}'"),
                    source: e.into(),
                })?;

            if let crate::bundle::BundleSource::Lazy { .. } = &bundle.source {
                for wasm in &bundle.wasm {
                    let wasm_path = format!(
                        "{}/wasm/{}",
                        self.index_path(name, opts.legacy),
                        wasm.path
                    );
                    let encoded = base64::Engine::encode(
                        &base64::engine::general_purpose::STANDARD,
                        &wasm.bytes,
                    );
                    self.store
                        .write(
                            txn,
                            WriteOp::Replace,
                            &wasm_path,
                            serde_json::Value::String(encoded),
                        )
                        .ok();
                }
            }
        }
        opts.metrics.bundles_loaded(opts.bundles.len() as u64);
        tracing::debug!(bundles = opts.bundles.len(), "activation committed to transaction");

        Ok(())
    }

    /// For each bundle name: read its roots from the store, erase data at
    /// those roots, erase policies whose paths fall under those roots
    /// (re-parsing survivors), erase the index entry. A name that is not
    /// present is treated as already deactivated.
    pub fn deactivate(&self, txn: &mut dyn Transaction, opts: DeactivateOpts<'_>) -> Result<()> {
        tracing::debug!(names = ?opts.names, legacy = opts.legacy, "deactivating bundles");
        for name in &opts.names {
            let Some(entry) = self.existing_index(txn, name, opts.legacy) else {
                continue; // already deactivated
            };
            let roots = entry.manifest.effective_roots();

            for root in &roots {
                let path = root_path(root);
                self.store
                    .write(txn, WriteOp::Remove, &path, serde_json::Value::Null)
                    .ok();
            }

            for policy_name in self.store.list_policies(txn).unwrap_or_default() {
                if roots.iter().any(|r| path_under_root(&policy_name, r)) {
                    self.store.delete_policy(txn, &policy_name).ok();
                }
            }

            let index_path = format!("{}/manifest", self.index_path(name, opts.legacy));
            self.store
                .write(txn, WriteOp::Remove, &index_path, serde_json::Value::Null)
                .ok();
        }
        opts.metrics.bundles_loaded(0);
        Ok(())
    }
}

fn root_path(root: &str) -> String {
    if root.is_empty() {
        "/".to_string()
    } else {
        format!("/{root}")
    }
}

fn path_under_root(path: &str, root: &str) -> bool {
    if root.is_empty() {
        return true;
    }
    let p: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let r: Vec<&str> = root.split('/').filter(|s| !s.is_empty()).collect();
    r.len() <= p.len() && r[..] == p[..r.len()]
}

/// Walk `value` along `root`'s segments and return the subtree found
/// there, or `None` if the root path doesn't exist in `value` (so nothing
/// is written for it — data outside the roots is silently dropped at this
/// stage, already validated on read.
fn data_at_root(value: &serde_json::Value, root: &str) -> Option<serde_json::Value> {
    if root.is_empty() {
        return Some(value.clone());
    }
    let mut node = value;
    for segment in root.split('/') {
        node = node.get(segment)?;
    }
    Some(node.clone())
}

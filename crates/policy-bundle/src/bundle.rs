//! The `Bundle` aggregate: manifest, data tree, modules, wasm/plan files,
//! an optional patch, and an optional signature envelope.

use crate::data::Data;
use crate::manifest::Manifest;
use crate::patch::Patch;
use crate::signature::SignaturesConfig;

/// A policy module: where it was loaded from, its logical in-bundle path,
/// and its raw bytes. The parsed AST is opaque to this crate — it is
/// produced and owned by the external `Compiler` collaborator.
#[derive(Debug, Clone)]
pub struct ModuleFile {
    pub url: String,
    pub path: String,
    pub raw: Vec<u8>,
}

/// A wasm module: path, bytes, and the entrypoints it implements (populated
/// from the manifest's `wasm` resolvers that name this module).
#[derive(Debug, Clone)]
pub struct WasmModule {
    pub path: String,
    pub bytes: Vec<u8>,
    pub entrypoints: Vec<String>,
}

/// A compiled query plan module.
#[derive(Debug, Clone)]
pub struct PlanFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Whether a [`Bundle`] was read eagerly (data/modules decoded) or lazily
/// (raw archive bytes retained, decoding deferred to the activator's
/// streaming write).
#[derive(Debug, Clone)]
pub enum BundleSource {
    Eager,
    Lazy { raw: Vec<u8> },
}

/// The aggregate bundle value. Mutable only before activation; the core
/// treats an activated bundle's contents as immutable thereafter.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub manifest: Manifest,
    pub data: Data,
    pub modules: Vec<ModuleFile>,
    pub wasm: Vec<WasmModule>,
    pub plan: Vec<PlanFile>,
    pub patch: Patch,
    pub signatures: Option<SignaturesConfig>,
    pub etag: Option<String>,
    pub source: BundleSource,
    /// Set by the reader when `bundleName` is configured; used to namespace
    /// module paths during activation.
    pub name: Option<String>,
}

impl Bundle {
    pub fn new() -> Self {
        Self {
            manifest: Manifest::default(),
            data: Data::new(),
            modules: Vec::new(),
            wasm: Vec::new(),
            plan: Vec::new(),
            patch: Patch::default(),
            signatures: None,
            etag: None,
            source: BundleSource::Eager,
            name: None,
        }
    }

    /// A delta bundle carries a non-empty patch and, per I4, nothing else.
    pub fn is_delta(&self) -> bool {
        !self.patch.is_empty()
    }

    /// I4: in a delta bundle there must be no data files, module files,
    /// wasm files, or plan files — only the manifest and patch.
    pub fn validate_delta_shape(&self) -> crate::error::Result<()> {
        if !self.is_delta() {
            return Ok(());
        }
        if !self.data.is_empty() || !self.modules.is_empty() || !self.wasm.is_empty() || !self.plan.is_empty() {
            anyhow::bail!(crate::error::BundleError::manifest_invariant(
                "delta bundle expected to contain only patch file but data files found"
            ));
        }
        Ok(())
    }
}

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_4_delta_with_extra_file_rejected() {
        let mut bundle = Bundle::new();
        bundle.patch.data.push(crate::patch::PatchOperation {
            op: crate::patch::PatchOp::Upsert,
            path: "/a".into(),
            value: Some(serde_json::json!(1)),
        });
        bundle
            .data
            .merge_file(&["a".into(), "b".into(), "c".into()], serde_json::json!("bad"))
            .unwrap();

        let err = bundle.validate_delta_shape().unwrap_err();
        assert!(err.to_string().contains("delta bundle expected to contain only patch file but data files found"));
    }
}

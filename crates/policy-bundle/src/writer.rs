//! Writer: serializes a bundle deterministically.

use anyhow::Context;

use crate::archive::{self, Entry};
use crate::bundle::Bundle;
use crate::error::Result;
use crate::signature::{self, SigningConfig};

/// Whether module entry names use `ModuleFile::url` or `ModuleFile::path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleNaming {
    Url,
    Path,
}

#[derive(Default)]
pub struct Writer {
    use_module_path: bool,
    signing_config: Option<SigningConfig>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module_naming(mut self, naming: ModuleNaming) -> Self {
        self.use_module_path = naming == ModuleNaming::Path;
        self
    }

    pub fn with_signing_config(mut self, config: SigningConfig) -> Self {
        self.signing_config = Some(config);
        self
    }

    /// Serialize `bundle` deterministically: `data.json` only if non-empty,
    /// modules in declared order, wasm modules, plan modules, the patch
    /// file if present, the manifest (omitted when it's the zero value),
    /// and the signatures file if present — in that exact order, because
    /// the signature step depends on a stable digest ordering.
    pub fn write(&self, bundle: &Bundle) -> Result<Vec<u8>> {
        let mut entries = self.build_entries(bundle)?;

        if let Some(config) = &self.signing_config {
            let files: Vec<(String, Vec<u8>)> = entries
                .iter()
                .map(|e| (e.path.clone(), e.bytes.clone()))
                .collect();
            let envelope = signature::sign(&files, config)?;
            let bytes = serde_json::to_vec(&envelope).context("serializing .signatures.json")?;
            entries.push(Entry {
                path: ".signatures.json".to_string(),
                bytes,
            });
            tracing::debug!(keyid = ?config.keyid, "bundle signed");
        }

        let mut buf = Vec::new();
        archive::write_entries(&mut buf, &entries)?;
        tracing::debug!(
            revision = %bundle.manifest.revision,
            entries = entries.len(),
            bytes = buf.len(),
            "bundle written"
        );
        Ok(buf)
    }

    fn build_entries(&self, bundle: &Bundle) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();

        if !bundle.data.is_empty() {
            entries.push(Entry {
                path: "data.json".to_string(),
                bytes: serde_json::to_vec(&bundle.data.0).context("serializing data.json")?,
            });
        }

        for module in &bundle.modules {
            let name = if self.use_module_path {
                &module.path
            } else {
                &module.url
            };
            entries.push(Entry {
                path: name.clone(),
                bytes: module.raw.clone(),
            });
        }

        for wasm in &bundle.wasm {
            entries.push(Entry {
                path: wasm.path.clone(),
                bytes: wasm.bytes.clone(),
            });
        }

        for plan in &bundle.plan {
            entries.push(Entry {
                path: plan.path.clone(),
                bytes: plan.bytes.clone(),
            });
        }

        if !bundle.patch.is_empty() {
            entries.push(Entry {
                path: "patch.json".to_string(),
                bytes: serde_json::to_vec(&bundle.patch).context("serializing patch.json")?,
            });
        }

        if bundle.manifest != crate::manifest::Manifest::default() {
            entries.push(Entry {
                path: ".manifest".to_string(),
                bytes: serde_json::to_vec(&bundle.manifest).context("serializing .manifest")?,
            });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ModuleFile;
    use crate::reader::{Reader, ReaderOptions};

    #[test]
    fn p1_round_trip_preserves_manifest_and_data() {
        let mut bundle = Bundle::new();
        bundle.manifest.roots = Some(vec!["a".to_string()]);
        bundle
            .data
            .merge_file(&["a".to_string()], serde_json::json!({"x": 1}))
            .unwrap();
        bundle.modules.push(ModuleFile {
            url: "a/policy.rego".to_string(),
            path: "a/policy.rego".to_string(),
            raw: b"package a".to_vec(),
        });

        let bytes = Writer::new().write(&bundle).unwrap();
        let read_back = Reader::new(ReaderOptions::default()).read(&bytes).unwrap();

        assert_eq!(read_back.manifest.revision, bundle.manifest.revision);
        assert_eq!(read_back.manifest.effective_roots(), bundle.manifest.effective_roots());
        assert_eq!(read_back.data.0, bundle.data.0);
        assert_eq!(read_back.modules.len(), 1);
        assert_eq!(read_back.modules[0].raw, b"package a");
    }

    #[test]
    fn empty_data_tree_is_not_written() {
        let bundle = Bundle::new();
        let writer = Writer::new();
        let entries = writer.build_entries(&bundle).unwrap();
        assert!(entries.iter().all(|e| e.path != "data.json"));
    }

    #[test]
    fn zero_manifest_is_omitted() {
        let bundle = Bundle::new();
        let writer = Writer::new();
        let entries = writer.build_entries(&bundle).unwrap();
        assert!(entries.iter().all(|e| e.path != ".manifest"));
    }
}

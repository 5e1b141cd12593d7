//! Reader: orchestrates archive → entries → manifest/data/modules/
//! signatures, with an optional lazy mode.

use anyhow::{bail, Context};

use crate::archive::{self, Entry};
use crate::bundle::{Bundle, BundleSource, ModuleFile, PlanFile, WasmModule};
use crate::data::Data;
use crate::error::{BundleError, Result};
use crate::limits::DecodeLimits;
use crate::manifest::Manifest;
use crate::patch::Patch;
use crate::signature::{self, SignaturesConfig, VerificationConfig};

/// Recognized reader options.
#[derive(Default)]
pub struct ReaderOptions {
    /// Rewrite module URL/Path to be relative to this prefix.
    pub base_dir: Option<String>,
    /// Per-file size cap; exceeded → error with the file name.
    pub size_limit_bytes: Option<u64>,
    /// Required when the archive contains `.signatures.json`, unless
    /// `skip_bundle_verification` is set.
    pub bundle_verification_config: Option<VerificationConfig>,
    /// Accept an archive without checking signatures.
    pub skip_bundle_verification: bool,
    /// After load, copy the manifest under `/system/bundle/manifest` in Data.
    pub include_manifest_in_data: bool,
    /// Do not parse modules or decode data; retain raw archive bytes for
    /// store-side streaming; skips scope validation on read.
    pub lazy_loading_mode: bool,
    /// Attach this etag to the resulting Bundle.
    pub bundle_etag: Option<String>,
    /// If true, a delta bundle is rejected (persistence of delta is
    /// unsupported).
    pub bundle_persistence: bool,
    /// Logical name; used to namespace module paths.
    pub bundle_name: Option<String>,
    /// Decode resource limits; defaults are used when absent.
    pub decode_limits: Option<DecodeLimits>,
    /// Partial overrides applied on top of `decode_limits` (or the default
    /// limits, if `decode_limits` is absent) — the shape a host's config
    /// file hands the reader when it only wants to raise a couple of caps.
    pub decode_limit_overrides: Option<crate::limits::DecodeLimitsOverrides>,
}

pub struct Reader {
    options: ReaderOptions,
}

impl Reader {
    pub fn new(options: ReaderOptions) -> Self {
        Self { options }
    }

    /// Run the reader state machine against a raw archive.
    pub fn read(&self, archive_bytes: &[u8]) -> Result<Bundle> {
        if self.options.lazy_loading_mode {
            return Ok(Bundle {
                source: BundleSource::Lazy {
                    raw: archive_bytes.to_vec(),
                },
                etag: self.options.bundle_etag.clone(),
                name: self.options.bundle_name.clone(),
                ..Bundle::new()
            });
        }

        let mut limits = self.options.decode_limits.unwrap_or_default();
        if let Some(overrides) = self.options.decode_limit_overrides.clone() {
            limits = limits.apply(overrides);
        }
        if let Some(size_limit) = self.options.size_limit_bytes {
            limits.max_entry_bytes = size_limit;
        }

        let entries = archive::read_entries(archive_bytes, &limits)
            .with_context(|| "OpenArchive".to_string())?;

        let mut bundle = Bundle::new();
        let mut signatures_entry: Option<Entry> = None;
        let mut manifest_seen = false;

        for entry in entries {
            self.classify(&mut bundle, entry, &mut signatures_entry, &mut manifest_seen)?;
        }

        if !manifest_seen {
            bundle.manifest.init();
        }

        for wasm in &mut bundle.wasm {
            wasm.entrypoints = bundle
                .manifest
                .wasm_resolvers
                .iter()
                .filter(|r| r.module == wasm.path)
                .map(|r| r.entrypoint.clone())
                .collect();
        }

        bundle.etag = self.options.bundle_etag.clone();
        bundle.name = self.options.bundle_name.clone();

        bundle.validate_delta_shape()?;
        if self.options.bundle_persistence && bundle.is_delta() {
            bail!(BundleError::manifest_invariant(
                "persistence of delta bundles is unsupported"
            ));
        }

        if let Some(envelope) = signatures_entry {
            let config = self.options.bundle_verification_config.as_ref();
            if config.is_none() && !self.options.skip_bundle_verification {
                bail!(BundleError::signature(
                    "archive contains .signatures.json but no verification config was supplied"
                ));
            }
            let signatures: SignaturesConfig = serde_json::from_slice(&envelope.bytes)
                .map_err(|e| BundleError::format("signatures", e.to_string()))?;

            if let Some(config) = config {
                let decoded = signature::verify_envelope(&signatures, config)?;
                self.verify_files(&decoded, archive_bytes, &limits, config)?;
                tracing::debug!(files = decoded.files.len(), "bundle signature verified");
            }
            bundle.signatures = Some(signatures);
        } else if self.options.bundle_verification_config.is_some()
            && !self.options.skip_bundle_verification
        {
            bail!(BundleError::signature(
                "verification config supplied but archive has no .signatures.json"
            ));
        }

        bundle.manifest.validate_roots()?;
        let roots = bundle.manifest.effective_roots();
        if !bundle.is_delta() {
            bundle.data.validate_scope(&roots)?;
            for module in &bundle.modules {
                validate_module_scope(&module.path, &roots)?;
            }
        }
        tracing::debug!(
            revision = %bundle.manifest.revision,
            roots = roots.len(),
            modules = bundle.modules.len(),
            delta = bundle.is_delta(),
            "bundle read"
        );

        if self.options.include_manifest_in_data {
            let manifest_value = serde_json::to_value(&bundle.manifest)
                .context("failed to serialize manifest for includeManifestInData")?;
            bundle
                .data
                .merge_file(
                    &["system".to_string(), "bundle".to_string(), "manifest".to_string()],
                    manifest_value,
                )
                .ok();
        }

        Ok(bundle)
    }

    fn classify(
        &self,
        bundle: &mut Bundle,
        entry: Entry,
        signatures_entry: &mut Option<Entry>,
        manifest_seen: &mut bool,
    ) -> Result<()> {
        let name = entry.path.clone();
        let base = name.rsplit('/').next().unwrap_or(&name);

        if name == ".signatures.json" {
            *signatures_entry = Some(entry);
        } else if name == ".manifest" {
            bundle.manifest = serde_json::from_slice(&entry.bytes)
                .map_err(|e| BundleError::format("manifest", e.to_string()))?;
            bundle.manifest.init();
            *manifest_seen = true;
        } else if name.ends_with(".rego") {
            let path = self.rewrite_path(&name);
            bundle.modules.push(ModuleFile {
                url: name.clone(),
                path,
                raw: entry.bytes,
            });
        } else if base == "data.json" || base == "data.yaml" || base == "data.yml" {
            let dir = name.rsplitn(2, '/').nth(1).unwrap_or("");
            let segments: Vec<String> = dir.split('/').filter(|s| !s.is_empty()).map(String::from).collect();
            let value: serde_json::Value = if base == "data.json" {
                serde_json::from_slice(&entry.bytes)
                    .map_err(|e| BundleError::format(&name, e.to_string()))?
            } else {
                serde_yaml::from_slice(&entry.bytes)
                    .map_err(|e| BundleError::format(&name, e.to_string()))?
            };
            bundle.data.merge_file(&segments, value)?;
        } else if name.ends_with(".wasm") {
            bundle.wasm.push(WasmModule {
                path: self.rewrite_path(&name),
                bytes: entry.bytes,
                entrypoints: Vec::new(),
            });
        } else if base == "plan.json" {
            bundle.plan.push(PlanFile {
                path: self.rewrite_path(&name),
                bytes: entry.bytes,
            });
        } else if base == "patch.json" {
            let patch: Patch = serde_json::from_slice(&entry.bytes)
                .map_err(|e| BundleError::format("patch.json", e.to_string()))?;
            bundle.patch = patch;
        }
        // else: ignore

        Ok(())
    }

    fn rewrite_path(&self, path: &str) -> String {
        match &self.options.base_dir {
            Some(base) => path
                .strip_prefix(base.as_str())
                .unwrap_or(path)
                .trim_start_matches('/')
                .to_string(),
            None => path.to_string(),
        }
    }

    fn verify_files(
        &self,
        decoded: &signature::DecodedSignature,
        archive_bytes: &[u8],
        limits: &DecodeLimits,
        config: &VerificationConfig,
    ) -> Result<()> {
        let exclude = signature::build_exclude_set(&config.exclude)?;
        let entries = archive::read_entries(archive_bytes, limits)?;
        let mut remaining = decoded.files.clone();

        for entry in &entries {
            if entry.path == ".signatures.json" || exclude.is_match(&entry.path) {
                continue;
            }
            match remaining.remove(&entry.path) {
                Some(info) => {
                    let digest = crate::crypto::digest::digest_file(
                        &entry.path,
                        &entry.bytes,
                        &info.algorithm,
                    )?;
                    if digest != info.hash {
                        tracing::warn!(path = %entry.path, expected = %info.hash, computed = %digest, "file digest mismatch");
                        bail!(BundleError::signature(format!(
                            "digest mismatch for '{}': expected {}, computed {digest}",
                            entry.path, info.hash
                        )));
                    }
                }
                None => {
                    bail!(BundleError::signature(format!(
                        "file '{}' not included in bundle signature",
                        entry.path
                    )));
                }
            }
        }

        if !remaining.is_empty() {
            let names: Vec<_> = remaining.keys().cloned().collect();
            bail!(BundleError::signature(format!(
                "file(s) specified in signatures but not found: {}",
                names.join(", ")
            )));
        }

        Ok(())
    }
}

fn validate_module_scope(path: &str, roots: &[String]) -> Result<()> {
    let package_path: Vec<&str> = path.trim_end_matches(".rego").split('/').collect();
    let under_root = roots.iter().any(|r| {
        if r.is_empty() {
            return true;
        }
        let rseg: Vec<&str> = r.split('/').collect();
        rseg.len() <= package_path.len() && rseg == package_path[..rseg.len()]
    });
    if !under_root {
        bail!(BundleError::manifest_invariant(format!(
            "module '{path}' is not contained within any root {roots:?}"
        )));
    }
    Ok(())
}

//! Unified error taxonomy for the policy bundle core.
//!
//! One variant family per kind of failure the bundle lifecycle can produce.
//! Callers that want `?`-composable errors can use [`Result`] directly;
//! callers that want to match on kind can `downcast_ref::<BundleError>()`
//! out of an `anyhow::Error` the same way the rest of this crate's
//! orchestration functions surface errors.

use thiserror::Error;

/// Convenience alias used at orchestration boundaries (`Reader::read`,
/// `Activator::activate`, ...).
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// The bundle core's error taxonomy. Each variant carries the
/// context needed to produce an actionable, human-readable message: the
/// offending name or path, and for signature errors the algorithm involved.
#[derive(Debug, Error)]
pub enum BundleError {
    /// Corrupt gzip, corrupt tar, malformed JSON/YAML, malformed JWT, or an
    /// unknown patch op.
    #[error("format error in {context}: {message}")]
    FormatError { context: String, message: String },

    /// A single file exceeded the reader's per-file cap.
    #[error("size limit exceeded for '{name}': limit is {limit} bytes")]
    SizeLimitExceeded { name: String, limit: u64 },

    /// Overlapping roots in a single manifest, module/data outside roots, a
    /// delta bundle carrying extra files, or a patch targeting outside roots.
    #[error("manifest invariant violated: {message}")]
    ManifestInvariant { message: String },

    /// I5 violation: two bundles being activated together claim overlapping
    /// roots.
    #[error("overlapped roots across bundles: {}", names.join(", "))]
    CrossBundleOverlap { names: Vec<String> },

    /// A delta bundle's manifest disagrees with the snapshot it targets.
    #[error("delta bundle '{name}' manifest does not match activated snapshot")]
    DeltaMismatch { name: String },

    /// Envelope missing when config requires it, multiple JWTs, JWT
    /// verification failure, digest mismatch, missing/extra files vs the
    /// signature map, unknown plugin, unknown key id, or scope mismatch.
    #[error("signature error: {message}")]
    SignatureError { message: String },

    /// Two files would write the same leaf incompatibly.
    #[error("data conflict at '{path}'")]
    DataConflict { path: String },

    /// The compiler rejected the merged module set.
    #[error("compile error: {message}")]
    CompileError { message: String },

    /// The underlying store rejected a read/write; propagated with context.
    #[error("store error during {operation}: {source}")]
    StoreError {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BundleError {
    pub fn format(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FormatError {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn manifest_invariant(message: impl Into<String>) -> Self {
        Self::ManifestInvariant {
            message: message.into(),
        }
    }

    pub fn signature(message: impl Into<String>) -> Self {
        Self::SignatureError {
            message: message.into(),
        }
    }
}

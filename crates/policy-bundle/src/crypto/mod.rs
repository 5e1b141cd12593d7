//! Canonicalization and digest helpers used by the signature envelope.

pub mod digest;
pub mod jcs;

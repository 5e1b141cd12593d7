//! Signature envelope: compact-JWT sign/verify over a canonical file-digest
//! list, with a pluggable signer/verifier registry keyed by plugin id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context};
use globset::{Glob, GlobSetBuilder};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::crypto::digest;
use crate::error::{BundleError, Result};

/// `{name, hash, algorithm}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub hash: String,
    pub algorithm: String,
}

/// The JWT payload: `{files, iat, iss, scope?, keyid?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub files: Vec<FileInfo>,
    pub iat: i64,
    pub iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyid: Option<String>,
}

/// The `.signatures.json` wire shape: `{signatures: [<jwt>], plugin?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturesConfig {
    pub signatures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

/// A decoded, verified signature: the payload plus the path → FileInfo map
/// the reader uses to check every incoming file (I6).
#[derive(Debug, Clone)]
pub struct DecodedSignature {
    pub payload: SignaturePayload,
    pub files: HashMap<String, FileInfo>,
}

/// Inputs for signing.
pub struct SigningConfig {
    pub plugin: Option<String>,
    pub key: Vec<u8>,
    pub algorithm: Algorithm,
    pub keyid: Option<String>,
    pub iss: String,
    /// Claims loaded from an external source and merged into the payload;
    /// claims override the defaults except `files`, which is always
    /// computed by the signer.
    pub claims_override: Option<serde_json::Value>,
}

/// One named public-key configuration accepted during verification.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub key: Vec<u8>,
    pub algorithm: Algorithm,
    pub scope: Option<String>,
}

/// Inputs for verification.
pub struct VerificationConfig {
    pub public_keys: HashMap<String, KeyConfig>,
    pub key_id: Option<String>,
    pub scope: Option<String>,
    pub exclude: Vec<String>,
}

/// A pluggable signer implementation, looked up by plugin id.
pub trait Signer: Send + Sync {
    fn sign(&self, files: &[(String, Vec<u8>)], config: &SigningConfig) -> Result<String>;
}

/// A pluggable verifier implementation, looked up by plugin id.
pub trait Verifier: Send + Sync {
    fn verify(&self, jwt: &str, config: &VerificationConfig) -> Result<DecodedSignature>;
}

/// The reserved default plugin id; callers cannot overwrite it via
/// [`register_signer`]/[`register_verifier`].
pub const DEFAULT_PLUGIN: &str = "default";

struct DefaultSigner;
struct DefaultVerifier;

impl Signer for DefaultSigner {
    fn sign(&self, files: &[(String, Vec<u8>)], config: &SigningConfig) -> Result<String> {
        sign_jwt(files, config)
    }
}

impl Verifier for DefaultVerifier {
    fn verify(&self, jwt: &str, config: &VerificationConfig) -> Result<DecodedSignature> {
        verify_jwt(jwt, config)
    }
}

static SIGNER_REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn Signer>>>> = Lazy::new(|| {
    let mut m: HashMap<String, Arc<dyn Signer>> = HashMap::new();
    m.insert(DEFAULT_PLUGIN.to_string(), Arc::new(DefaultSigner));
    RwLock::new(m)
});

static VERIFIER_REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn Verifier>>>> = Lazy::new(|| {
    let mut m: HashMap<String, Arc<dyn Verifier>> = HashMap::new();
    m.insert(DEFAULT_PLUGIN.to_string(), Arc::new(DefaultVerifier));
    RwLock::new(m)
});

/// Register a signer under `id`. Refuses to overwrite the reserved
/// `"default"` id.
pub fn register_signer(id: impl Into<String>, signer: Arc<dyn Signer>) -> Result<()> {
    let id = id.into();
    if id == DEFAULT_PLUGIN {
        bail!(BundleError::signature(
            "cannot overwrite the reserved 'default' signer plugin id"
        ));
    }
    SIGNER_REGISTRY.write().unwrap().insert(id, signer);
    Ok(())
}

/// Register a verifier under `id`. Refuses to overwrite the reserved
/// `"default"` id.
pub fn register_verifier(id: impl Into<String>, verifier: Arc<dyn Verifier>) -> Result<()> {
    let id = id.into();
    if id == DEFAULT_PLUGIN {
        bail!(BundleError::signature(
            "cannot overwrite the reserved 'default' verifier plugin id"
        ));
    }
    VERIFIER_REGISTRY.write().unwrap().insert(id, verifier);
    Ok(())
}

fn lookup_signer(id: &str) -> Result<Arc<dyn Signer>> {
    SIGNER_REGISTRY
        .read()
        .unwrap()
        .get(id)
        .cloned()
        .ok_or_else(|| BundleError::signature(format!("unknown signer plugin '{id}'")).into())
}

fn lookup_verifier(id: &str) -> Result<Arc<dyn Verifier>> {
    VERIFIER_REGISTRY
        .read()
        .unwrap()
        .get(id)
        .cloned()
        .ok_or_else(|| BundleError::signature(format!("unknown verifier plugin '{id}'")).into())
}

/// Sign the given `(path, bytes)` pairs, producing a `SignaturesConfig`
/// ready to be written as `.signatures.json`.
pub fn sign(files: &[(String, Vec<u8>)], config: &SigningConfig) -> Result<SignaturesConfig> {
    let plugin = config.plugin.clone().unwrap_or_else(|| DEFAULT_PLUGIN.to_string());
    let signer = lookup_signer(&plugin)?;
    let jwt = signer.sign(files, config)?;
    Ok(SignaturesConfig {
        signatures: vec![jwt],
        plugin: config.plugin.clone(),
    })
}

fn sign_jwt(files: &[(String, Vec<u8>)], config: &SigningConfig) -> Result<String> {
    let mut file_infos = Vec::with_capacity(files.len());
    for (path, bytes) in files {
        let hash = digest::digest_file(path, bytes, digest::DEFAULT_ALGORITHM)?;
        file_infos.push(FileInfo {
            name: path.clone(),
            hash,
            algorithm: digest::DEFAULT_ALGORITHM.to_string(),
        });
    }

    let mut payload = SignaturePayload {
        files: file_infos,
        iat: now_unix(),
        iss: config.iss.clone(),
        scope: None,
        keyid: config.keyid.clone(),
    };

    if let Some(overrides) = &config.claims_override {
        merge_claims(&mut payload, overrides)?;
    }

    let header = jsonwebtoken::Header::new(config.algorithm);
    let key = encoding_key(config.algorithm, &config.key)?;
    let jwt = jsonwebtoken::encode(&header, &payload, &key)
        .context("failed to sign bundle JWT")?;
    Ok(jwt)
}

fn merge_claims(payload: &mut SignaturePayload, overrides: &serde_json::Value) -> Result<()> {
    let Some(obj) = overrides.as_object() else {
        return Ok(());
    };
    if let Some(iss) = obj.get("iss").and_then(|v| v.as_str()) {
        payload.iss = iss.to_string();
    }
    if let Some(iat) = obj.get("iat").and_then(|v| v.as_i64()) {
        payload.iat = iat;
    }
    if let Some(scope) = obj.get("scope").and_then(|v| v.as_str()) {
        payload.scope = Some(scope.to_string());
    }
    if let Some(keyid) = obj.get("keyid").and_then(|v| v.as_str()) {
        payload.keyid = Some(keyid.to_string());
    }
    Ok(())
}

fn encoding_key(algorithm: Algorithm, key: &[u8]) -> Result<EncodingKey> {
    Ok(match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => EncodingKey::from_secret(key),
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
            EncodingKey::from_rsa_pem(key).context("invalid RSA private key PEM")?
        }
        Algorithm::ES256 | Algorithm::ES384 => {
            EncodingKey::from_ec_pem(key).context("invalid EC private key PEM")?
        }
        Algorithm::PS256 | Algorithm::PS384 | Algorithm::PS512 => {
            EncodingKey::from_rsa_pem(key).context("invalid RSA private key PEM")?
        }
        other => bail!("unsupported signing algorithm {other:?}"),
    })
}

fn decoding_key(algorithm: Algorithm, key: &[u8]) -> Result<DecodingKey> {
    Ok(match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => DecodingKey::from_secret(key),
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
            DecodingKey::from_rsa_pem(key).context("invalid RSA public key PEM")?
        }
        Algorithm::ES256 | Algorithm::ES384 => {
            DecodingKey::from_ec_pem(key).context("invalid EC public key PEM")?
        }
        Algorithm::PS256 | Algorithm::PS384 | Algorithm::PS512 => {
            DecodingKey::from_rsa_pem(key).context("invalid RSA public key PEM")?
        }
        other => bail!("unsupported verification algorithm {other:?}"),
    })
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Verify a `SignaturesConfig` envelope. Exactly one JWT is required; zero
/// or multiple is a `SignatureError`.
pub fn verify_envelope(
    envelope: &SignaturesConfig,
    config: &VerificationConfig,
) -> Result<DecodedSignature> {
    if envelope.signatures.len() != 1 {
        bail!(BundleError::signature(format!(
            "expected exactly one JWT in signature envelope, found {}",
            envelope.signatures.len()
        )));
    }
    let plugin = envelope.plugin.clone().unwrap_or_else(|| DEFAULT_PLUGIN.to_string());
    let verifier = lookup_verifier(&plugin)?;
    verifier.verify(&envelope.signatures[0], config)
}

fn verify_jwt(jwt: &str, config: &VerificationConfig) -> Result<DecodedSignature> {
    let header = jsonwebtoken::decode_header(jwt).context("malformed JWT header")?;

    // Peek at the unverified payload only to read `keyid`, since the
    // effective key id may come from the payload itself.
    let unverified_payload = decode_payload_unverified(jwt)?;
    let effective_keyid = config
        .key_id
        .clone()
        .or_else(|| unverified_payload.keyid.clone())
        .ok_or_else(|| BundleError::signature("no key id in config or payload"))?;

    let key_config = config.public_keys.get(&effective_keyid).ok_or_else(|| {
        BundleError::signature(format!("unknown key id '{effective_keyid}'"))
    })?;

    if header.alg != key_config.algorithm {
        bail!(BundleError::signature(format!(
            "JWT header algorithm {:?} does not match configured algorithm {:?} for key '{effective_keyid}'",
            header.alg, key_config.algorithm
        )));
    }

    let dkey = decoding_key(key_config.algorithm, &key_config.key)?;
    let mut validation = jsonwebtoken::Validation::new(key_config.algorithm);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let decoded = jsonwebtoken::decode::<SignaturePayload>(jwt, &dkey, &validation)
        .map_err(|e| BundleError::signature(format!("JWT verification failed: {e}")))?;
    let payload = decoded.claims;

    let effective_scope = config.scope.clone().or_else(|| key_config.scope.clone());
    let payload_scope = payload.scope.clone();
    if effective_scope != payload_scope {
        tracing::warn!(
            key_id = %effective_keyid,
            expected = ?effective_scope,
            found = ?payload_scope,
            "signature scope mismatch"
        );
        bail!(BundleError::signature(format!(
            "scope mismatch: expected {effective_scope:?}, payload has {payload_scope:?}"
        )));
    }

    let files = payload
        .files
        .iter()
        .cloned()
        .map(|f| (f.name.clone(), f))
        .collect();

    tracing::debug!(key_id = %effective_keyid, iss = %payload.iss, "JWT envelope verified");
    Ok(DecodedSignature { payload, files })
}

fn decode_payload_unverified(jwt: &str) -> Result<SignaturePayload> {
    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        bail!(BundleError::format("signature", "JWT must have three parts"));
    }
    let payload_bytes = base64::Engine::decode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        parts[1],
    )
    .context("invalid base64 in JWT payload")?;
    serde_json::from_slice(&payload_bytes).context("invalid JSON in JWT payload")
}

/// A glob-set built from `config.exclude` for per-file verification
/// (I6).
pub fn build_exclude_set(patterns: &[String]) -> Result<globset::GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid exclude glob '{pattern}'"))?);
    }
    builder.build().context("failed to build exclude glob set")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hs256_config(iss: &str) -> SigningConfig {
        SigningConfig {
            plugin: None,
            key: b"secret".to_vec(),
            algorithm: Algorithm::HS256,
            keyid: Some("foo".to_string()),
            iss: iss.to_string(),
            claims_override: None,
        }
    }

    fn verify_config() -> VerificationConfig {
        let mut public_keys = HashMap::new();
        public_keys.insert(
            "foo".to_string(),
            KeyConfig {
                key: b"secret".to_vec(),
                algorithm: Algorithm::HS256,
                scope: None,
            },
        );
        VerificationConfig {
            public_keys,
            key_id: None,
            scope: None,
            exclude: vec![],
        }
    }

    #[test]
    fn scenario_5_sign_and_verify_round_trip() {
        let files = vec![
            ("data.json".to_string(), br#"{"a":1}"#.to_vec()),
            ("policy.rego".to_string(), b"package p".to_vec()),
        ];
        let envelope = sign(&files, &hs256_config("test-issuer")).unwrap();
        assert_eq!(envelope.signatures.len(), 1);

        let decoded = verify_envelope(&envelope, &verify_config()).unwrap();
        assert_eq!(decoded.files.len(), 2);
        assert!(decoded.files.contains_key("data.json"));
        assert!(decoded.files.contains_key("policy.rego"));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let files = vec![("data.json".to_string(), br#"{"a":1}"#.to_vec())];
        let envelope = sign(&files, &hs256_config("test-issuer")).unwrap();

        let mut config = verify_config();
        config.public_keys.get_mut("foo").unwrap().key = b"wrong-secret".to_vec();

        assert!(verify_envelope(&envelope, &config).is_err());
    }

    #[test]
    fn reserved_default_id_cannot_be_overwritten() {
        struct NoopSigner;
        impl Signer for NoopSigner {
            fn sign(&self, _files: &[(String, Vec<u8>)], _config: &SigningConfig) -> Result<String> {
                Ok(String::new())
            }
        }
        let err = register_signer(DEFAULT_PLUGIN, Arc::new(NoopSigner)).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn scope_mismatch_is_rejected() {
        let files = vec![("data.json".to_string(), br#"{"a":1}"#.to_vec())];
        let mut signing = hs256_config("test-issuer");
        signing.claims_override = Some(serde_json::json!({"scope": "prod"}));
        let envelope = sign(&files, &signing).unwrap();

        let result = verify_envelope(&envelope, &verify_config());
        assert!(result.is_err());
    }
}

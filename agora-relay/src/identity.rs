//! Identity and avatar derivation for the join handshake.
//!
//! `identity = <role>_<id>_<6 hex>`, where the suffix is three bytes from
//! the OS CSPRNG. The avatar is a gravatar "retro" image keyed by a hash of
//! the identity.

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;

use crate::error::RelayError;

const SUFFIX_BYTES: usize = 3;
const AVATAR_BASE: &str = "https://www.gravatar.com/avatar/";

/// Fresh random identity suffix: six lowercase hex characters.
pub fn random_suffix() -> Result<String, RelayError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; SUFFIX_BYTES];
    rng.fill(&mut bytes).map_err(|_| {
        log::error!("Failed to generate random identity suffix");
        RelayError::Identity("random source unavailable".into())
    })?;
    Ok(hex::encode(bytes))
}

/// Build `role_id_suffix`.
pub fn compose(role: &str, id: &str, suffix: &str) -> String {
    format!("{role}_{id}_{suffix}")
}

/// Build a new identity for `role` and `id`.
pub fn generate(role: &str, id: &str) -> Result<String, RelayError> {
    Ok(compose(role, id, &random_suffix()?))
}

pub fn avatar_url(identity: &str) -> String {
    let hash = digest::digest(&digest::SHA256, identity.as_bytes());
    format!("{AVATAR_BASE}{}?d=retro", hex::encode(hash.as_ref()))
}

/// `null`, `false`, `0` and `""` do not count as a supplied id.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Text form of a caller-supplied id as it appears inside an identity.
///
/// Strings are used verbatim, everything else as its JSON text.
pub fn id_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

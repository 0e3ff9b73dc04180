use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use api::error::{ApiError, ErrorCode};

type HmacSha256 = Hmac<sha2::Sha256>;

pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// streams the file in fixed chunks rather than reading it whole, so a large
/// video does not need to live in memory twice during fingerprinting
pub async fn sha1_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// seed material for `rand::rngs::StdRng::seed_from_u64`: the first 8 bytes
/// of a hex sha1 digest, read big-endian
pub fn prng_seed_from_sha1(digest_hex: &str) -> u64 {
    let bytes = hex::decode(digest_hex).unwrap_or_default();
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(buf)
}

/// serializes `value` to JSON with lexicographically sorted object keys and
/// no insignificant whitespace, matching python's
/// `json.dumps(payload, sort_keys=True, separators=(",", ":"))`
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ApiError> {
    let raw = serde_json::to_value(value)
        .map_err(|err| ApiError::new(ErrorCode::InvalidJson, format!("canonicalize failed: {err}")))?;
    let sorted = sort_keys(raw);
    serde_json::to_vec(&sorted)
        .map_err(|err| ApiError::new(ErrorCode::InvalidJson, format!("canonicalize failed: {err}")))
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            for key in keys {
                let v = map.get(&key).cloned().unwrap_or(Value::Null);
                sorted.insert(key, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// computes a base64url (no padding) HMAC-SHA256 confirm token over the
/// canonical JSON serialization of `payload`
pub fn confirm_token<T: Serialize>(secret: &[u8], payload: &T) -> Result<String, ApiError> {
    let canonical = canonical_json(payload)?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| ApiError::new(ErrorCode::FileopsFailed, format!("bad hmac key: {err}")))?;
    mac.update(&canonical);
    let tag = mac.finalize().into_bytes();
    Ok(URL_SAFE_NO_PAD.encode(tag))
}

/// recomputes the expected token for `payload` and compares it against
/// `token` in constant time
pub fn verify_confirm_token<T: Serialize>(
    secret: &[u8],
    payload: &T,
    token: &str,
) -> Result<bool, ApiError> {
    let expected = confirm_token(secret, payload)?;
    Ok(constant_time_eq(expected.as_bytes(), token.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Payload {
        b: i32,
        a: i32,
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let payload = Payload { b: 2, a: 1 };
        let bytes = canonical_json(&payload).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn confirm_token_round_trips() {
        let secret = b"test-secret";
        let payload = Payload { b: 2, a: 1 };
        let token = confirm_token(secret, &payload).unwrap();
        assert!(verify_confirm_token(secret, &payload, &token).unwrap());
        assert!(!verify_confirm_token(b"wrong-secret", &payload, &token).unwrap());
    }

    #[test]
    fn sha1_hex_matches_known_vector() {
        assert_eq!(
            sha1_hex(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[tokio::test]
    async fn sha1_file_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let got = sha1_file(&path).await.unwrap();
        assert_eq!(got, sha1_hex(b"hello world"));
    }
}

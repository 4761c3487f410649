//! KBZPay request signing.
//!
//! The gateway signs a flat parameter map: `sign` and `sign_type` are
//! excluded, empty values are dropped, the remaining pairs are sorted by key
//! (byte order) and joined as `k=v&k=v`, then `&key=<app key>` is appended and
//! the whole string is hashed with SHA-256 and rendered as uppercase hex.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

/// Parameter map in signing order (`BTreeMap<String, _>` sorts by bytes).
pub type SignParams = BTreeMap<String, String>;

pub const SIGN_FIELD: &str = "sign";
pub const SIGN_TYPE_FIELD: &str = "sign_type";
pub const SIGN_TYPE_SHA256: &str = "SHA256";

/// Build the canonical string that is hashed (without the key suffix).
pub fn canonicalize(params: &SignParams) -> String {
    params
        .iter()
        .filter(|(key, value)| {
            key.as_str() != SIGN_FIELD && key.as_str() != SIGN_TYPE_FIELD && !value.is_empty()
        })
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

/// Compute the uppercase SHA-256 signature of `params` under `secret`.
pub fn sign(params: &SignParams, secret: &str) -> String {
    let input = format!("{}&key={}", canonicalize(params), secret);
    hex::encode_upper(Sha256::digest(input.as_bytes()))
}

/// Check the `sign` field of `params` against a freshly computed signature.
///
/// Returns `false` when no `sign` field is present.
pub fn verify(params: &SignParams, secret: &str) -> bool {
    let Some(supplied) = params.get(SIGN_FIELD) else {
        return false;
    };

    let expected = sign(params, secret);
    let expected_bytes = expected.as_bytes();
    let supplied_bytes = supplied.as_bytes();

    if expected_bytes.len() != supplied_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(supplied_bytes).into()
}

/// Flatten a JSON object into signing parameters.
///
/// Nested objects (`biz_content`) are lifted into the top level. Numbers and
/// booleans use their JSON text, arrays their compact JSON, and `null` is
/// dropped.
pub fn flatten(value: &Value) -> SignParams {
    let mut params = SignParams::new();
    if let Value::Object(map) = value {
        flatten_into(map, &mut params);
    }
    params
}

fn flatten_into(map: &serde_json::Map<String, Value>, params: &mut SignParams) {
    for (key, value) in map {
        match value {
            Value::Null => {}
            Value::Object(nested) => flatten_into(nested, params),
            Value::String(s) => {
                params.insert(key.clone(), s.clone());
            }
            Value::Bool(_) | Value::Number(_) | Value::Array(_) => {
                params.insert(key.clone(), value.to_string());
            }
        }
    }
}

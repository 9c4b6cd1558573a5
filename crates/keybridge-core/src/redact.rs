//! Redaction of secret material from error envelopes.
//!
//! Engine failures are stringified into error envelopes that cross the
//! boundary and usually end up in host logs. Factor keys, identity tokens and
//! seeds must never travel with them, so both the message and the echoed
//! request payload are scrubbed here before the envelope is built.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use keybridge_error::{BridgeError, ErrorPayload};

/// Replacement text for anything removed.
pub const REDACTED: &str = "[REDACTED]";

/// Payload fields whose values are always removed, whatever they contain.
pub const SECRET_FIELDS: &[&str] = &["factorKey", "idToken", "jwt", "value"];

/// PEM-encoded private keys.
static PEM_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-----BEGIN[A-Z\s]+PRIVATE KEY-----[\s\S]*?-----END[A-Z\s]+PRIVATE KEY-----")
        .unwrap()
});

/// JWTs (three base64url segments separated by dots).
static JWT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").unwrap());

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(Bearer\s+\S+|\bkey\s*=\s*\S+|\btoken\s*=\s*\S+|secret\s*=\s*\S+)").unwrap()
});

/// Factor keys, seeds and private scalars are 64+ hex chars.
static HEX_SECRET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{64,}\b").unwrap());

/// Remove secret-looking substrings from a message.
pub fn redact_message(message: &str) -> String {
    let mut msg = PEM_KEY_RE.replace_all(message, REDACTED).into_owned();
    msg = JWT_RE.replace_all(&msg, REDACTED).into_owned();
    msg = CREDENTIAL_RE.replace_all(&msg, REDACTED).into_owned();
    HEX_SECRET_RE.replace_all(&msg, REDACTED).into_owned()
}

/// Scrub a JSON payload in place.
///
/// Values of [`SECRET_FIELDS`] are replaced outright; every other string is
/// passed through [`redact_message`].
pub fn redact_payload(payload: &mut Value) {
    match payload {
        Value::Object(map) => {
            for (field, value) in map.iter_mut() {
                if SECRET_FIELDS.contains(&field.as_str()) {
                    if !value.is_null() {
                        *value = Value::String(REDACTED.to_string());
                    }
                } else {
                    redact_payload(value);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_payload),
        Value::String(s) => {
            let scrubbed = redact_message(s);
            if scrubbed != *s {
                *s = scrubbed;
            }
        }
        _ => {}
    }
}

/// Build the wire form of `err` with secrets removed.
pub fn error_payload(err: &BridgeError, action: Option<&str>, payload: Option<&Value>) -> ErrorPayload {
    let payload = payload.map(|p| {
        let mut p = p.clone();
        redact_payload(&mut p);
        p
    });
    let mut wire = err.to_payload(action, payload);
    wire.message = redact_message(&wire.message);
    wire
}

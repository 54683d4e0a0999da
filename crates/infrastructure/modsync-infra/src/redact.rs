//! Secret hygiene for log output. Dynamic key/value fields go through
//! [`redact_field`] before they reach the subscriber; free-form transcripts
//! go through [`scrub_secret`] before they are written anywhere.

const SENSITIVE_KEY_PARTS: &[&str] = &[
    "password",
    "passphrase",
    "secret",
    "token",
    "api_key",
    "key",
];

pub const REDACTED_FIELD: &str = "***";
pub const REDACTED_SECRET: &str = "[REDACTED]";

/// Whether a field key names something that must never be logged.
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lowered.contains(part))
}

/// The value to log for `key`: the original, or `***` for sensitive keys.
pub fn redact_field<'a>(key: &str, value: &'a str) -> &'a str {
    if is_sensitive_key(key) {
        REDACTED_FIELD
    } else {
        value
    }
}

/// Replace every occurrence of a known secret in free-form text.
pub fn scrub_secret(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, REDACTED_SECRET)
}

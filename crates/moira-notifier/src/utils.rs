//! Helpers shared by the built-in senders.

use serde_json::Value;

/// Longest response or stderr excerpt kept in an error message.
pub const MAX_BODY_LENGTH: usize = 4000;

/// Cuts `s` to at most `max_len` bytes on a character boundary.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

/// Replaces the values of secret-looking keys with `***`, recursively.
pub fn redact_sensitive_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let key_lower = key.to_lowercase();
                    let sensitive = ["password", "passwd", "token", "secret", "api_key"]
                        .iter()
                        .any(|marker| key_lower.contains(marker));
                    let val = if sensitive {
                        Value::String("***".to_string())
                    } else {
                        redact_sensitive_json(val)
                    };
                    (key.clone(), val)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_json).collect()),
        _ => value.clone(),
    }
}

use serde_json::Value;
use tracing::info;

const SENSITIVE_KEYWORDS: &[&str] = &[
    "password",
    "secret",
    "token",
    "key",
    "auth",
    "credential",
    "pwd",
];

const MASK: &str = "******";

fn is_sensitive(name: &str) -> bool {
    let name = name.to_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|kw| name.contains(kw))
}

/// Recursively replace the values of sensitive-looking keys with a mask.
///
/// Key matching is case-insensitive substring matching against the usual
/// credential vocabulary. Applying the redactor twice yields the same
/// structure as applying it once.
pub fn redact_sensitive(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if is_sensitive(&key) {
                        (key, Value::String(MASK.to_string()))
                    } else {
                        (key, redact_sensitive(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_sensitive).collect()),
        other => other,
    }
}

/// Emit the effective configuration once at startup, redacted.
pub(crate) fn log_config_snapshot(config: &Value) {
    let masked = redact_sensitive(config.clone());
    match serde_json::to_string(&masked) {
        Ok(snapshot) => info!(config_snapshot = %snapshot, "Effective configuration"),
        Err(err) => tracing::warn!(error = %err, "Failed to serialize config snapshot"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_sensitive_keys_at_any_depth() {
        let masked = redact_sensitive(json!({
            "app": {"name": "demo", "db_password": "hunter2"},
            "api_keys": ["a", "b"],
            "auth": {"inner": "x"},
            "port": 8080,
        }));

        assert_eq!(masked["app"]["db_password"], "******");
        assert_eq!(masked["api_keys"], "******");
        assert_eq!(masked["auth"], "******");
        assert_eq!(masked["app"]["name"], "demo");
        assert_eq!(masked["port"], 8080);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let masked = redact_sensitive(json!({"JWT_SECRET": "x", "ApiToken": "y"}));
        assert_eq!(masked["JWT_SECRET"], "******");
        assert_eq!(masked["ApiToken"], "******");
    }

    #[test]
    fn redaction_is_idempotent() {
        let input = json!({
            "credentials": {"user": "u", "pass": "p"},
            "nested": [{"secret": "s"}, {"plain": 1}],
        });
        let once = redact_sensitive(input);
        let twice = redact_sensitive(once.clone());
        assert_eq!(once, twice);
    }
}

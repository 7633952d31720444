//! Scalar identifier rewriters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;

use super::adapter::ScalarFn;

/// Prefixes identifiers with `"{codespace}:"`.
///
/// Values already carrying the prefix are returned unchanged, so the rewrite
/// is idempotent. Empty values stay empty.
pub fn prefix_codespace(codespace: &str) -> Result<ScalarFn, ConfigError> {
    let codespace = codespace.trim();
    if codespace.is_empty() || codespace.contains(':') {
        return Err(ConfigError::InvalidValue {
            field: "codespace".to_string(),
            reason: format!("'{codespace}' must be non-empty and contain no ':'"),
        });
    }
    let prefix = format!("{codespace}:");
    Ok(Arc::new(move |value: &str| {
        if value.is_empty() || value.starts_with(&prefix) {
            value.to_string()
        } else {
            format!("{prefix}{value}")
        }
    }))
}

/// Substitutes whole identifiers through an alias table.
///
/// A table where some target is also a source would rewrite twice on a
/// second pass, so it is rejected.
pub fn alias(aliases: HashMap<String, String>) -> Result<ScalarFn, ConfigError> {
    if let Some(target) = aliases.values().find(|target| aliases.contains_key(*target)) {
        return Err(ConfigError::InvalidValue {
            field: "aliases".to_string(),
            reason: format!("alias target '{target}' is also an alias source"),
        });
    }
    Ok(Arc::new(move |value: &str| {
        aliases
            .get(value)
            .cloned()
            .unwrap_or_else(|| value.to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_idempotent() {
        let rewrite = prefix_codespace("RUT").unwrap();
        let once = rewrite("Quay:123");
        assert_eq!(once, "RUT:Quay:123");
        assert_eq!(rewrite(&once), once);
        assert_eq!(rewrite(""), "");
    }

    #[test]
    fn test_prefix_rejects_bad_codespace() {
        assert!(prefix_codespace("").is_err());
        assert!(prefix_codespace("A:B").is_err());
    }

    #[test]
    fn test_alias_substitution() {
        let rewrite = alias(HashMap::from([("NG".to_string(), "NSB".to_string())])).unwrap();
        assert_eq!(rewrite("NG"), "NSB");
        assert_eq!(rewrite("NSB"), "NSB");
        assert_eq!(rewrite("other"), "other");
    }

    #[test]
    fn test_alias_chain_rejected() {
        let table = HashMap::from([
            ("A".to_string(), "B".to_string()),
            ("B".to_string(), "C".to_string()),
        ]);
        assert!(alias(table).is_err());
    }
}

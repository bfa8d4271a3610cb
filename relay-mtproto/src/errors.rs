//! The RPC error representation and its recovery classification.

use std::fmt;

use crate::dc_id::DcId;

/// An error returned by the server in response to an RPC call, or synthesized
/// locally by the client stack.
///
/// Numeric suffixes are stripped from the name and placed in
/// [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.  `0` for locally synthesized errors.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
    /// Free-form description, mostly for log output.
    pub description: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        if !self.description.is_empty() {
            write!(f, ": {}", self.description)?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server error like `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_server(code: i32, message: &str) -> Self {
        // Try to find a numeric suffix after the last underscore.
        // e.g. "FLOOD_WAIT_30" → name = "FLOOD_WAIT", value = Some(30)
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    return Self {
                        code,
                        name: message[..idx].to_string(),
                        value: Some(v),
                        description: String::new(),
                    };
                }
            }
        }
        Self {
            code,
            name: message.to_string(),
            value: None,
            description: String::new(),
        }
    }

    /// A locally synthesized error (`CLEAR_CALLBACK`, `RESPONSE_PARSE_FAILED`, …).
    ///
    /// Local errors carry code `0`, match none of the recovery rules and are
    /// therefore surfaced to the caller unchanged.
    pub fn local(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: 0,
            name: name.into(),
            value: None,
            description: description.into(),
        }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")` — exact match
    /// - `err.is("PHONE_CODE_*")` — starts-with match
    /// - `err.is("*_INVALID")` — ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Whether this is a flood error, i.e. carries a wait-seconds suffix.
    pub fn is_flood(&self) -> bool {
        self.name == "FLOOD_WAIT"
    }

    /// Whether this error is transient: negative or 5xx codes and floods.
    pub fn is_temporary(&self) -> bool {
        self.code < 0 || self.code >= 500 || self.is_flood()
    }

    /// Transient errors get first refusal by the caller's fail handler before
    /// the recovery engine takes over.
    pub fn is_default_handled(&self) -> bool {
        self.is_temporary()
    }

    /// Returns the flood-wait duration in seconds, if this is a flood error.
    pub fn flood_wait_seconds(&self) -> Option<u32> {
        if self.is_flood() {
            self.value
        } else {
            None
        }
    }

    /// Returns the target DC if this is a migration redirect
    /// (`FILE_MIGRATE_X`, `PHONE_MIGRATE_X`, `NETWORK_MIGRATE_X`,
    /// `USER_MIGRATE_X`).
    pub fn migrate_dc(&self) -> Option<DcId> {
        const PREFIXES: [&str; 4] = ["FILE", "PHONE", "NETWORK", "USER"];
        let stem = self.name.strip_suffix("_MIGRATE")?;
        if PREFIXES.contains(&stem) {
            self.value.map(|v| v as DcId)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_suffix() {
        let err = RpcError::from_server(420, "FLOOD_WAIT_30");
        assert_eq!(err.name, "FLOOD_WAIT");
        assert_eq!(err.value, Some(30));
        assert_eq!(err.flood_wait_seconds(), Some(30));
        assert!(err.is_temporary());
    }

    #[test]
    fn keeps_plain_names() {
        let err = RpcError::from_server(401, "AUTH_KEY_UNREGISTERED");
        assert_eq!(err.name, "AUTH_KEY_UNREGISTERED");
        assert_eq!(err.value, None);
        assert!(!err.is_temporary());
    }

    #[test]
    fn wildcard_matching() {
        let err = RpcError::from_server(400, "PHONE_CODE_INVALID");
        assert!(err.is("PHONE_CODE_INVALID"));
        assert!(err.is("PHONE_CODE_*"));
        assert!(err.is("*_INVALID"));
        assert!(!err.is("PHONE_CODE"));
    }

    #[test]
    fn migration_recognition() {
        assert_eq!(RpcError::from_server(303, "USER_MIGRATE_5").migrate_dc(), Some(5));
        assert_eq!(RpcError::from_server(303, "FILE_MIGRATE_4").migrate_dc(), Some(4));
        assert_eq!(RpcError::from_server(303, "STATS_MIGRATE_3").migrate_dc(), None);
        assert_eq!(RpcError::from_server(420, "FLOOD_WAIT_3").migrate_dc(), None);
    }

    #[test]
    fn local_errors_are_not_retryable() {
        let err = RpcError::local("RESPONSE_PARSE_FAILED", "empty response");
        assert_eq!(err.code, 0);
        assert!(!err.is_temporary());
        assert!(!err.is_default_handled());
    }

    #[test]
    fn negative_and_server_codes_are_temporary() {
        assert!(RpcError::from_server(-1, "MSG_WAIT_TIMEOUT").is_temporary());
        assert!(RpcError::from_server(500, "INTERNAL").is_temporary());
        assert!(!RpcError::from_server(400, "FILE_ID_INVALID").is_temporary());
    }
}

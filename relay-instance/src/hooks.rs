//! Application-side collaborator contracts.

use crate::config::ServerConfig;

// ─── Persistence ─────────────────────────────────────────────────────────────

/// Writes orchestrator state to local storage.
pub trait Persister: Send + Sync {
    /// Persist the main DC selection and the `(dc, persistent key)` set.
    fn write_mtp_data(&self);
    /// Persist application settings after a config update.
    fn write_settings(&self);
    fn write_autoupdate_prefix(&self, prefix: &str);
}

/// Persists nothing.
pub struct NullPersister;

impl Persister for NullPersister {
    fn write_mtp_data(&self) {}
    fn write_settings(&self) {}
    fn write_autoupdate_prefix(&self, _prefix: &str) {}
}

// ─── Language ────────────────────────────────────────────────────────────────

/// The cloud language manager.
pub trait LanguageManager: Send + Sync {
    fn set_suggested_language(&self, code: &str);
    fn set_current_versions(&self, version: i32, base_version: i32);
    fn reset_to_default(&self);
}

pub struct NullLanguageManager;

impl LanguageManager for NullLanguageManager {
    fn set_suggested_language(&self, _code: &str) {}
    fn set_current_versions(&self, _version: i32, _base_version: i32) {}
    fn reset_to_default(&self) {}
}

// ─── Application ─────────────────────────────────────────────────────────────

/// Hooks into the wider application.  All methods default to no-ops so
/// embedders implement only what they consume.
pub trait AppHooks: Send + Sync {
    /// The server configuration could not be fetched in any way.
    fn bad_mtproto_configuration_error(&self) {}

    /// Proxy settings changed; connections should re-resolve them.
    fn refresh_global_proxy(&self) {}

    /// A fresh server config was applied.
    fn config_updated(&self) {}

    /// Receives every server-supplied application parameter.
    fn apply_config(&self, _config: &ServerConfig) {}

    /// Whether a user authorization currently exists.  Gates the guest-DC
    /// authorization import.
    fn has_authorization(&self) -> bool {
        false
    }

    /// A proxy hostname finished resolving.
    fn proxy_domain_resolved(&self, _host: &str, _ips: &[String]) {}
}

pub struct NullAppHooks;

impl AppHooks for NullAppHooks {}

//! Server configuration plumbing: the loader contracts and the applied
//! values.
//!
//! The actual fetching (help.getConfig over temporary DCs, the HTTP fallback,
//! proxy DNS) is collaborator territory; the orchestrator only drives *when*
//! a load happens and distributes the result.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use relay_mtproto::dc_id::DcId;
use relay_mtproto::errors::RpcError;

/// How stale a config may get before `request_config_if_old` reloads it.
pub const CONFIG_BECOMES_OLD: Duration = Duration::from_secs(2 * 60);
/// The much tighter staleness bound while the account is in blocked mode.
pub const CONFIG_BECOMES_OLD_FOR_BLOCKED: Duration = Duration::from_secs(8);
/// Upper bound on one expiry-refresh sleep.
pub const CONFIG_REFRESH_CAP: Duration = Duration::from_secs(3600);

// ─── DC options ──────────────────────────────────────────────────────────────

/// One server-advertised DC endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DcOption {
    pub id: DcId,
    pub address: String,
    pub cdn: bool,
    pub media_only: bool,
}

/// What a DC is used for, as known to the endpoint directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DcType {
    Main,
    Media,
    Cdn,
    Temporary,
}

/// The static+dynamic directory of DC endpoints.
pub trait DcOptions: Send + Sync {
    fn set_from_list(&self, options: &[DcOption]);
    /// Raw `cdnConfig` body from `help.getCdnConfig`.
    fn set_cdn_config(&self, data: &[u8]);
    fn dc_type(&self, dc_id: DcId) -> DcType;
}

// ─── Server config ───────────────────────────────────────────────────────────

/// The application-relevant subset of the server `config` object.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub dc_options: Vec<DcOption>,
    pub test_mode: bool,
    pub this_dc: DcId,
    pub date: i64,
    /// Unixtime after which this config must be refreshed.
    pub expires: i64,

    pub chat_size_max: i32,
    pub megagroup_size_max: i32,
    pub forwarded_count_max: i32,
    pub online_update_period_ms: i32,
    pub offline_blur_timeout_ms: i32,
    pub offline_idle_timeout_ms: i32,
    pub online_cloud_timeout_ms: i32,
    pub notify_cloud_delay_ms: i32,
    pub notify_default_delay_ms: i32,
    pub push_chat_period_ms: i32,
    pub push_chat_limit: i32,
    pub saved_gifs_limit: i32,
    pub edit_time_limit: i32,
    pub revoke_time_limit: i32,
    pub revoke_pm_time_limit: i32,
    pub revoke_pm_inbox: bool,
    pub stickers_recent_limit: i32,
    pub stickers_faved_limit: i32,
    pub pinned_dialogs_count_max: i32,
    pub pinned_in_folder_count_max: i32,
    pub me_url_prefix: String,
    pub channels_read_media_period: i32,
    pub webfile_dc_id: DcId,
    pub dc_txt_domain_name: String,
    pub call_receive_timeout_ms: i32,
    pub call_ring_timeout_ms: i32,
    pub call_connect_timeout_ms: i32,
    pub call_packet_timeout_ms: i32,
    pub phonecalls_enabled: bool,
    pub blocked_mode: bool,
    pub caption_length_max: i32,
    pub suggested_lang_code: Option<String>,
    pub lang_pack_version: i32,
    pub base_lang_pack_version: i32,
    pub autoupdate_url_prefix: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dc_options: Vec::new(),
            test_mode: false,
            this_dc: 2,
            date: 0,
            expires: 0,
            chat_size_max: 200,
            megagroup_size_max: 200_000,
            forwarded_count_max: 100,
            online_update_period_ms: 120_000,
            offline_blur_timeout_ms: 5_000,
            offline_idle_timeout_ms: 30_000,
            online_cloud_timeout_ms: 300_000,
            notify_cloud_delay_ms: 30_000,
            notify_default_delay_ms: 1_500,
            push_chat_period_ms: 60_000,
            push_chat_limit: 2,
            saved_gifs_limit: 200,
            edit_time_limit: 172_800,
            revoke_time_limit: 172_800,
            revoke_pm_time_limit: 172_800,
            revoke_pm_inbox: true,
            stickers_recent_limit: 30,
            stickers_faved_limit: 5,
            pinned_dialogs_count_max: 5,
            pinned_in_folder_count_max: 100,
            me_url_prefix: "https://t.me/".to_string(),
            channels_read_media_period: 604_800,
            webfile_dc_id: 4,
            dc_txt_domain_name: String::new(),
            call_receive_timeout_ms: 20_000,
            call_ring_timeout_ms: 90_000,
            call_connect_timeout_ms: 30_000,
            call_packet_timeout_ms: 10_000,
            phonecalls_enabled: true,
            blocked_mode: false,
            caption_length_max: 1_024,
            suggested_lang_code: None,
            lang_pack_version: 0,
            base_lang_pack_version: 0,
            autoupdate_url_prefix: None,
        }
    }
}

// ─── Loader contracts ────────────────────────────────────────────────────────

pub type ConfigDone = Box<dyn FnOnce(ServerConfig) + Send>;
pub type ConfigFail = Box<dyn FnOnce(RpcError) + Send>;

/// A background config fetch in progress.  Implementations retry internally
/// until one of the callbacks fires.
pub trait ConfigLoader: Send + Sync {
    fn load(&self);
    fn set_phone(&self, phone: &str);
}

/// Resolves proxy hostnames in the background; results come through the
/// callback the resolver was created with.
pub trait DomainResolver: Send + Sync {
    fn resolve(&self, host: &str);
}

/// Factory for the background fetchers the orchestrator starts.
pub trait ConfigSource: Send + Sync {
    fn make_loader(
        &self,
        phone: &str,
        on_done: ConfigDone,
        on_fail: ConfigFail,
    ) -> Arc<dyn ConfigLoader>;

    /// Fetch trusted unixtime over plain HTTP.  The returned guard keeps the
    /// fetch alive; the orchestrator drops it once `on_done` ran.
    fn sync_http_unixtime(&self, on_done: Box<dyn FnOnce() + Send>) -> Box<dyn Any + Send>;

    /// Create the proxy DNS resolver; `apply` receives `(host, ips)`.
    fn make_domain_resolver(
        &self,
        apply: Box<dyn Fn(String, Vec<String>) + Send + Sync>,
    ) -> Arc<dyn DomainResolver>;
}

// ─── Null implementations ────────────────────────────────────────────────────

/// A config source that never produces anything; handy for tests and for
/// embedders that drive configuration themselves.
pub struct NullConfigSource;

struct NullConfigLoader;

impl ConfigLoader for NullConfigLoader {
    fn load(&self) {}
    fn set_phone(&self, _phone: &str) {}
}

struct NullDomainResolver;

impl DomainResolver for NullDomainResolver {
    fn resolve(&self, _host: &str) {}
}

impl ConfigSource for NullConfigSource {
    fn make_loader(
        &self,
        _phone: &str,
        _on_done: ConfigDone,
        _on_fail: ConfigFail,
    ) -> Arc<dyn ConfigLoader> {
        Arc::new(NullConfigLoader)
    }

    fn sync_http_unixtime(&self, _on_done: Box<dyn FnOnce() + Send>) -> Box<dyn Any + Send> {
        Box::new(())
    }

    fn make_domain_resolver(
        &self,
        _apply: Box<dyn Fn(String, Vec<String>) + Send + Sync>,
    ) -> Arc<dyn DomainResolver> {
        Arc::new(NullDomainResolver)
    }
}

/// An endpoint directory over a fixed option list.
pub struct StaticDcOptions {
    options: std::sync::Mutex<Vec<DcOption>>,
}

impl StaticDcOptions {
    pub fn new(options: Vec<DcOption>) -> Self {
        Self {
            options: std::sync::Mutex::new(options),
        }
    }
}

impl Default for StaticDcOptions {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DcOptions for StaticDcOptions {
    fn set_from_list(&self, options: &[DcOption]) {
        *self.options.lock().unwrap() = options.to_vec();
    }

    fn set_cdn_config(&self, _data: &[u8]) {}

    fn dc_type(&self, dc_id: DcId) -> DcType {
        if relay_mtproto::dc_id::is_temporary_dc_id(dc_id) {
            return DcType::Temporary;
        }
        let options = self.options.lock().unwrap();
        let mut found = None;
        for option in options.iter().filter(|o| o.id == dc_id) {
            if option.cdn {
                return DcType::Cdn;
            }
            found = Some(option.media_only);
        }
        match found {
            Some(true) => DcType::Media,
            _ => DcType::Main,
        }
    }
}

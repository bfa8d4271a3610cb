//! The orchestrator: request routing, recovery policy, config refresh and
//! key destruction across the whole DC set.
//!
//! [`Instance`] is a thin facade over a reference-counted inner state holder.
//! Mutation is logically single-threaded (sessions post work back through the
//! dispatcher surface), with the request tables shared-memory-safe so session
//! threads can touch them directly.  Collaborator calls and request callbacks
//! are never made while an internal lock is held.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

use relay_mtproto::auth_key::AuthKeyPtr;
use relay_mtproto::dc_id::{
    bare_dc_id, dc_id_shift, destroy_key_next_dc_id, logout_dc_id, shift_dc_id, DcId, ShiftedDcId,
};
use relay_mtproto::errors::RpcError;
use relay_mtproto::request::{next_request_id, RequestId, SerializedRequest};
use relay_mtproto::wire;

use crate::config::{
    ConfigLoader, ConfigSource, DcOptions, DcType, DomainResolver, ServerConfig,
    CONFIG_BECOMES_OLD, CONFIG_BECOMES_OLD_FOR_BLOCKED, CONFIG_REFRESH_CAP,
};
use crate::dcenter::DcDirectory;
use crate::delays::{DelayedQueue, RequestDelays};
use crate::hooks::{AppHooks, LanguageManager, Persister};
use crate::registry::{RequestRegistry, ResponseHandler};
use crate::session::{Session, SessionFactory, SessionPool, DISCONNECTED_STATE, REQUEST_SENT_STATE};

/// Extra slack added to every computed resend delay.
const DELAY_SLACK: Duration = Duration::from_millis(10);

/// The main DC used until the server suggests one.
pub const DEFAULT_MAIN_DC: DcId = 2;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Operating mode, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// No main session; every stored key is logged out and destroyed.
    KeysDestroyer,
}

/// Everything an [`Instance`] is built from.
pub struct InstanceConfig {
    pub mode: Mode,
    /// Persisted main DC selection; `Some` pins it until the user changes it.
    pub main_dc_id: Option<DcId>,
    /// Persistent keys loaded from storage, one per DC.
    pub keys: Vec<AuthKeyPtr>,
    pub device_model: String,
    pub system_version: String,

    pub session_factory: Arc<dyn SessionFactory>,
    pub dc_options: Arc<dyn DcOptions>,
    pub config_source: Arc<dyn ConfigSource>,
    pub persister: Arc<dyn Persister>,
    pub language: Arc<dyn LanguageManager>,
    pub app: Arc<dyn AppHooks>,
}

impl InstanceConfig {
    /// A normal-mode configuration with no-op collaborators everywhere the
    /// embedder did not plug in yet.
    pub fn new(session_factory: Arc<dyn SessionFactory>, dc_options: Arc<dyn DcOptions>) -> Self {
        Self {
            mode: Mode::Normal,
            main_dc_id: None,
            keys: Vec::new(),
            device_model: String::new(),
            system_version: String::new(),
            session_factory,
            dc_options,
            config_source: Arc::new(crate::config::NullConfigSource),
            persister: Arc::new(crate::hooks::NullPersister),
            language: Arc::new(crate::hooks::NullLanguageManager),
            app: Arc::new(crate::hooks::NullAppHooks),
        }
    }
}

// ─── Handlers and events ─────────────────────────────────────────────────────

pub type UpdatesHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type GlobalFailHandler = Arc<dyn Fn(RequestId, &RpcError) + Send + Sync>;
pub type StateChangedHandler = Arc<dyn Fn(ShiftedDcId, i32) + Send + Sync>;
pub type SessionResetHandler = Arc<dyn Fn(ShiftedDcId) + Send + Sync>;

#[derive(Default)]
struct GlobalHandlers {
    updates: Option<UpdatesHandler>,
    global_fail: Option<GlobalFailHandler>,
    state_changed: Option<StateChangedHandler>,
    session_reset: Option<SessionResetHandler>,
}

#[derive(Default)]
struct EventStreams {
    temporary_key: Vec<UnboundedSender<DcId>>,
    all_keys_destroyed: Vec<UnboundedSender<()>>,
}

/// A callback-table entry scheduled for deferred clearing.
#[derive(Clone, Copy, Debug)]
pub struct CallbackClear {
    pub request_id: RequestId,
    /// `0` means "cleared deliberately, do not synthesize an error".
    pub error_code: i32,
}

// ─── State groups ────────────────────────────────────────────────────────────

struct Topology {
    main_dc_id: DcId,
    main_dc_id_forced: bool,
    directory: DcDirectory,
    pool: SessionPool,
    keys_for_write: std::collections::BTreeMap<ShiftedDcId, AuthKeyPtr>,
}

#[derive(Default)]
struct Recovery {
    /// export-authorization request → the shifted DC it unblocks.
    auth_export_requests: HashMap<RequestId, ShiftedDcId>,
    /// DC → requests parked until an authorization import lands there.
    auth_waiters: HashMap<DcId, Vec<RequestId>>,
    /// Requests that already went through one guest-DC import.
    bad_guest_dc_requests: HashSet<RequestId>,
    delayed: DelayedQueue,
    delays: RequestDelays,
    /// Guest log-out slot → its in-flight log-out request.
    logout_guest_requests: HashMap<ShiftedDcId, RequestId>,
}

#[derive(Default)]
struct ConfigState {
    loader: Option<Arc<dyn ConfigLoader>>,
    domain_resolver: Option<Arc<dyn DomainResolver>>,
    unixtime_guard: Option<Box<dyn Any + Send>>,
    user_phone: String,
    cdn_config_request_id: RequestId,
    last_loaded: Option<Instant>,
    expires_at: Option<Instant>,
    blocked_mode: bool,
}

// ─── Instance ────────────────────────────────────────────────────────────────

/// The MTProto client orchestrator.
///
/// Must be created inside a Tokio runtime; deferred work (the delayed-resend
/// timer, quarantine cleanup, config refresh) runs as tasks on it.
pub struct Instance {
    inner: Arc<InstanceInner>,
}

pub(crate) struct InstanceInner {
    mode: Mode,
    device_model: String,
    system_version: String,
    runtime: Handle,

    session_factory: Arc<dyn SessionFactory>,
    dc_options: Arc<dyn DcOptions>,
    config_source: Arc<dyn ConfigSource>,
    persister: Arc<dyn Persister>,
    language: Arc<dyn LanguageManager>,
    app: Arc<dyn AppHooks>,

    registry: RequestRegistry,
    topology: Mutex<Topology>,
    recovery: Mutex<Recovery>,
    config: Mutex<ConfigState>,
    handlers: Mutex<GlobalHandlers>,
    events: Mutex<EventStreams>,
    delayed_timer_gen: AtomicU64,
}

impl Instance {
    pub fn new(config: InstanceConfig) -> Self {
        let mode = config.mode;
        let main_dc_id = match mode {
            Mode::KeysDestroyer => 0,
            Mode::Normal => config.main_dc_id.unwrap_or(DEFAULT_MAIN_DC),
        };
        let inner = Arc::new(InstanceInner {
            mode,
            device_model: config.device_model,
            system_version: config.system_version,
            runtime: Handle::current(),
            session_factory: config.session_factory,
            dc_options: config.dc_options,
            config_source: config.config_source,
            persister: config.persister,
            language: config.language,
            app: config.app,
            registry: RequestRegistry::default(),
            topology: Mutex::new(Topology {
                main_dc_id,
                main_dc_id_forced: config.main_dc_id.is_some(),
                directory: DcDirectory::default(),
                pool: SessionPool::default(),
                keys_for_write: Default::default(),
            }),
            recovery: Mutex::new(Recovery::default()),
            config: Mutex::new(ConfigState::default()),
            handlers: Mutex::new(GlobalHandlers::default()),
            events: Mutex::new(EventStreams::default()),
            delayed_timer_gen: AtomicU64::new(0),
        });
        inner.start(config.keys);
        Self { inner }
    }

    // ── Submission ─────────────────────────────────────────────────────────

    /// Serialize-and-send entry point: allocates a request id, registers the
    /// payload and hands it to the owning session.  `shifted_dc_id == 0`
    /// means "follow the main DC".
    pub fn send(
        &self,
        body: Vec<u8>,
        handler: ResponseHandler,
        shifted_dc_id: ShiftedDcId,
        ms_can_wait: u64,
        needs_layer: bool,
        after_request_id: RequestId,
    ) -> RequestId {
        let request_id = next_request_id();
        self.inner.send_request(
            request_id,
            SerializedRequest::new(body),
            handler,
            shifted_dc_id,
            ms_can_wait,
            needs_layer,
            after_request_id,
        );
        request_id
    }

    /// Same as [`Instance::send`] for callers that allocated the id and
    /// serialized the payload themselves.
    pub fn send_request(
        &self,
        request_id: RequestId,
        request: SerializedRequest,
        handler: ResponseHandler,
        shifted_dc_id: ShiftedDcId,
        ms_can_wait: u64,
        needs_layer: bool,
        after_request_id: RequestId,
    ) {
        self.inner.send_request(
            request_id,
            request,
            handler,
            shifted_dc_id,
            ms_can_wait,
            needs_layer,
            after_request_id,
        );
    }

    pub fn cancel(&self, request_id: RequestId) {
        self.inner.cancel(request_id);
    }

    /// State of a request; a negative result means "waiting for that many
    /// milliseconds".  A negative `request_id` is a pseudo-id asking for the
    /// session state of DC `-request_id`.
    pub fn state(&self, request_id: RequestId) -> i32 {
        self.inner.state(request_id)
    }

    /// The signed DC binding of an in-flight request: positive = pinned to
    /// that shifted DC, negative = follows the main DC.
    pub fn request_dc(&self, request_id: RequestId) -> Option<ShiftedDcId> {
        self.inner.registry.query(request_id)
    }

    // ── Session lifecycle ──────────────────────────────────────────────────

    pub fn dcstate(&self, shifted_dc_id: ShiftedDcId) -> i32 {
        self.inner.dcstate(shifted_dc_id)
    }

    pub fn dctransport(&self, shifted_dc_id: ShiftedDcId) -> String {
        self.inner.dctransport(shifted_dc_id)
    }

    pub fn ping(&self) {
        self.inner.get_session(0).ping();
    }

    pub fn restart(&self) {
        self.inner.restart();
    }

    /// Restart every session bound to the same bare DC as `shifted_dc_id`.
    pub fn restart_dc(&self, shifted_dc_id: ShiftedDcId) {
        self.inner.restart_dc(shifted_dc_id);
    }

    pub fn kill_session(&self, shifted_dc_id: ShiftedDcId) {
        self.inner.kill_session(shifted_dc_id);
    }

    pub fn stop_session(&self, shifted_dc_id: ShiftedDcId) {
        self.inner.stop_session(shifted_dc_id);
    }

    pub fn re_init_connection(&self, dc_id: DcId) {
        self.inner.re_init_connection(dc_id);
    }

    pub fn unpaused(&self) {
        self.inner.unpaused();
    }

    // ── Main DC ────────────────────────────────────────────────────────────

    pub fn main_dc_id(&self) -> DcId {
        self.inner.main_dc_id()
    }

    /// Adopt the server-suggested main DC unless the user pinned one.
    pub fn suggest_main_dc_id(&self, dc_id: DcId) {
        self.inner.suggest_main_dc_id(dc_id);
    }

    /// Force the main DC: kills the old main session, starts a new one and
    /// persists the selection.
    pub fn set_main_dc_id(&self, dc_id: DcId) {
        self.inner.set_main_dc_id(dc_id);
    }

    // ── Keys ───────────────────────────────────────────────────────────────

    pub fn dc_persistent_key_changed(&self, dc_id: DcId, key: Option<AuthKeyPtr>) {
        self.inner.dc_persistent_key_changed(dc_id, key);
    }

    pub fn dc_temporary_key_changed(&self, dc_id: DcId) {
        self.inner.dc_temporary_key_changed(dc_id);
    }

    /// Subscribe to temporary-key-change notifications.
    pub fn dc_temporary_key_changed_events(&self) -> UnboundedReceiver<DcId> {
        let (tx, rx) = unbounded_channel();
        self.inner.events.lock().unwrap().temporary_key.push(tx);
        rx
    }

    /// Snapshot of the `(dc, persistent key)` set for persistence.
    pub fn keys_for_write(&self) -> Vec<AuthKeyPtr> {
        self.inner.keys_for_write()
    }

    /// Feed more keys into a keys-destroyer instance.
    pub fn add_keys_for_destroy(&self, keys: Vec<AuthKeyPtr>) {
        self.inner.add_keys_for_destroy(keys);
    }

    /// Fires once when the last key finished destruction.
    pub fn all_keys_destroyed_events(&self) -> UnboundedReceiver<()> {
        let (tx, rx) = unbounded_channel();
        self.inner.events.lock().unwrap().all_keys_destroyed.push(tx);
        rx
    }

    /// The server reported this exact key gone; confirm and restart.
    pub fn key_destroyed_on_server(&self, shifted_dc_id: ShiftedDcId, key_id: u64) {
        self.inner.key_destroyed_on_server(shifted_dc_id, key_id);
    }

    /// A destroy attempt reached a terminal outcome for this slot.
    pub fn key_was_possibly_destroyed(&self, shifted_dc_id: ShiftedDcId) {
        self.inner.key_was_possibly_destroyed(shifted_dc_id);
    }

    // ── Config ─────────────────────────────────────────────────────────────

    pub fn request_config(&self) {
        self.inner.request_config();
    }

    pub fn request_config_if_old(&self) {
        self.inner.request_config_if_old();
    }

    pub fn request_cdn_config(&self) {
        self.inner.request_cdn_config();
    }

    pub fn set_user_phone(&self, phone: &str) {
        self.inner.set_user_phone(phone);
    }

    pub fn bad_configuration_error(&self) {
        self.inner.bad_configuration_error();
    }

    pub fn sync_http_unixtime(&self) {
        self.inner.sync_http_unixtime();
    }

    pub fn resolve_proxy_domain(&self, host: &str) {
        self.inner.resolve_proxy_domain(host);
    }

    /// A proxy endpoint answered on this host/ip pair; let the application
    /// reorder its proxy list.
    pub fn set_good_proxy_domain(&self, _host: &str, _ip: &str) {
        self.inner.app.refresh_global_proxy();
    }

    // ── Global handlers ────────────────────────────────────────────────────

    pub fn set_updates_handler(&self, handler: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.inner.handlers.lock().unwrap().updates = Some(Arc::new(handler));
    }

    pub fn set_global_fail_handler(
        &self,
        handler: impl Fn(RequestId, &RpcError) + Send + Sync + 'static,
    ) {
        self.inner.handlers.lock().unwrap().global_fail = Some(Arc::new(handler));
    }

    pub fn set_state_changed_handler(
        &self,
        handler: impl Fn(ShiftedDcId, i32) + Send + Sync + 'static,
    ) {
        self.inner.handlers.lock().unwrap().state_changed = Some(Arc::new(handler));
    }

    pub fn set_session_reset_handler(
        &self,
        handler: impl Fn(ShiftedDcId) + Send + Sync + 'static,
    ) {
        self.inner.handlers.lock().unwrap().session_reset = Some(Arc::new(handler));
    }

    pub fn clear_global_handlers(&self) {
        *self.inner.handlers.lock().unwrap() = GlobalHandlers::default();
    }

    // ── Logout ─────────────────────────────────────────────────────────────

    /// Log out on the main DC and on every non-main, non-CDN DC a key is
    /// held for.  `done` runs once the main log-out settles either way.
    pub fn logout(&self, done: impl Fn() + Send + Sync + 'static) {
        self.inner.logout(Arc::new(done));
    }

    // ── Dispatcher surface (called by sessions) ────────────────────────────

    /// Route a raw response body to the request's callbacks.
    pub fn exec_callback(&self, request_id: RequestId, response: &[u8]) {
        self.inner.exec_callback(request_id, response);
    }

    /// Route an id-less server push (updates) to the global handler.
    pub fn global_callback(&self, response: &[u8]) {
        self.inner.global_callback(response);
    }

    pub fn has_callbacks(&self, request_id: RequestId) -> bool {
        self.inner.registry.has_callbacks(request_id)
    }

    /// Run the recovery policy for an error on `request_id`.  Returns `true`
    /// when the request's registration should be cleaned; `false` means the
    /// engine took it over and the handler should be kept.
    pub fn rpc_error_occurred(
        &self,
        request_id: RequestId,
        handler: &mut ResponseHandler,
        error: &RpcError,
    ) -> bool {
        self.inner.rpc_error_occurred(request_id, handler, error)
    }

    /// Clear callback entries on the next event-loop turn.
    pub fn clear_callbacks_delayed(&self, ids: Vec<CallbackClear>) {
        self.inner.clear_callbacks_delayed(ids);
    }

    pub fn on_state_change(&self, shifted_dc_id: ShiftedDcId, state: i32) {
        let handler = self.inner.handlers.lock().unwrap().state_changed.clone();
        if let Some(handler) = handler {
            handler(shifted_dc_id, state);
        }
    }

    pub fn on_session_reset(&self, shifted_dc_id: ShiftedDcId) {
        let handler = self.inner.handlers.lock().unwrap().session_reset.clone();
        if let Some(handler) = handler {
            handler(shifted_dc_id);
        }
    }

    // ── Identity ───────────────────────────────────────────────────────────

    pub fn is_keys_destroyer(&self) -> bool {
        self.inner.is_keys_destroyer()
    }

    pub fn device_model(&self) -> &str {
        &self.inner.device_model
    }

    pub fn system_version(&self) -> &str {
        &self.inner.system_version
    }

    /// Tear down: drops background loaders and kills every session.
    pub fn prepare_to_destroy(&self) {
        self.inner.prepare_to_destroy();
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.inner.prepare_to_destroy();
    }
}

// ─── Inner: construction and deferral primitives ─────────────────────────────

impl InstanceInner {
    fn start(self: &Arc<Self>, keys: Vec<AuthKeyPtr>) {
        {
            let mut topology = self.topology.lock().unwrap();
            for key in keys {
                let mut shifted_dc_id = key.dc_id();
                if self.is_keys_destroyer() {
                    // Several keys may exist for one DC while we destroy
                    // them; give each its own slot.
                    shifted_dc_id = destroy_key_next_dc_id(shifted_dc_id);
                    while topology.keys_for_write.contains_key(&shifted_dc_id) {
                        shifted_dc_id = destroy_key_next_dc_id(shifted_dc_id);
                    }
                }
                topology.keys_for_write.insert(shifted_dc_id, key.clone());
                topology.directory.add(shifted_dc_id, Some(key));
            }
        }

        if self.is_keys_destroyer() {
            let slots = self.topology.lock().unwrap().directory.shifted_ids();
            for shifted_dc_id in slots {
                self.start_session(shifted_dc_id);
            }
        } else {
            let main_dc_id = self.topology.lock().unwrap().main_dc_id;
            if main_dc_id != 0 {
                let session = self.start_session(main_dc_id);
                self.topology.lock().unwrap().pool.set_main(session);
            }
        }

        self.request_config();
    }

    fn is_keys_destroyer(&self) -> bool {
        self.mode == Mode::KeysDestroyer
    }

    /// Defer `f` past the current stack frame onto the runtime.
    fn invoke_queued(self: &Arc<Self>, f: impl FnOnce(&Arc<InstanceInner>) + Send + 'static) {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                f(&inner);
            }
        });
    }

    fn call_delayed(
        self: &Arc<Self>,
        delay: Duration,
        f: impl FnOnce(&Arc<InstanceInner>) + Send + 'static,
    ) {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                f(&inner);
            }
        });
    }

    // ── Routing ────────────────────────────────────────────────────────────

    /// Resolve a shifted DC id to its session, starting one on demand.
    /// `0` is the main session; a bare-less shift is rebased onto the main
    /// DC.
    fn get_session(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) -> Arc<dyn Session> {
        let mut shifted_dc_id = shifted_dc_id;
        if shifted_dc_id == 0 {
            return self
                .topology
                .lock()
                .unwrap()
                .pool
                .main()
                .expect("routing to the main session of an instance without one");
        }
        if bare_dc_id(shifted_dc_id) == 0 {
            let main = self
                .topology
                .lock()
                .unwrap()
                .pool
                .main()
                .expect("routing a main-relative shift without a main session");
            shifted_dc_id += bare_dc_id(main.dc_with_shift());
        }
        if let Some(session) = self.topology.lock().unwrap().pool.find(shifted_dc_id) {
            return session;
        }
        self.start_session(shifted_dc_id)
    }

    fn start_session(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) -> Arc<dyn Session> {
        debug_assert!(bare_dc_id(shifted_dc_id) != 0);

        let dc = {
            let mut topology = self.topology.lock().unwrap();
            if let Some(session) = topology.pool.find(shifted_dc_id) {
                return session;
            }
            topology.directory.get_or_create(shifted_dc_id)
        };
        let created = self.session_factory.create_session(shifted_dc_id, dc);
        let (session, fresh) = {
            let mut topology = self.topology.lock().unwrap();
            match topology.pool.find(shifted_dc_id) {
                Some(existing) => (existing, false),
                None => {
                    topology.pool.insert(shifted_dc_id, created.clone());
                    (created, true)
                }
            }
        };
        if fresh {
            session.start();
            if self.is_keys_destroyer() {
                self.schedule_key_destroy(shifted_dc_id);
            }
        }
        session
    }

    fn send_request(
        self: &Arc<Self>,
        request_id: RequestId,
        request: SerializedRequest,
        handler: ResponseHandler,
        shifted_dc_id: ShiftedDcId,
        ms_can_wait: u64,
        needs_layer: bool,
        after_request_id: RequestId,
    ) {
        let session = self.get_session(shifted_dc_id);

        request.set_request_id(request_id);
        self.registry.store_payload(request_id, request.clone());
        self.registry.store_callbacks(request_id, handler);

        let to_main_dc = shifted_dc_id == 0;
        let real_shifted_dc_id = session.dc_with_shift();
        let signed_dc_id = if to_main_dc {
            -real_shifted_dc_id
        } else {
            real_shifted_dc_id
        };
        self.registry.register(request_id, signed_dc_id);

        if after_request_id != 0 {
            // A missing predecessor payload is fine; the dependency simply
            // does not apply any more.
            request.set_after(self.registry.payload(after_request_id));
        }
        request.mark_sent();
        request.set_needs_layer(needs_layer);

        session.send_prepared(&request, ms_can_wait);
    }

    fn cancel(self: &Arc<Self>, request_id: RequestId) {
        if request_id == 0 {
            return;
        }
        log::debug!("[instance] cancel request {request_id}");
        let shifted_dc_id = self.registry.query(request_id);
        let msg_id = self
            .registry
            .take_payload(request_id)
            .map(|request| request.msg_id())
            .unwrap_or(0);
        self.unregister_request(request_id);
        if let Some(shifted_dc_id) = shifted_dc_id {
            self.get_session(shifted_dc_id.abs())
                .cancel(request_id, msg_id);
        }
        self.clear_callbacks(request_id, 0);
    }

    fn state(self: &Arc<Self>, request_id: RequestId) -> i32 {
        if request_id > 0 {
            if let Some(shifted_dc_id) = self.registry.query(request_id) {
                return self
                    .get_session(shifted_dc_id.abs())
                    .request_state(request_id);
            }
            return REQUEST_SENT_STATE;
        }
        self.get_session(-request_id).request_state(0)
    }

    fn unregister_request(&self, request_id: RequestId) {
        log::debug!("[instance] unregistering request {request_id}");
        self.recovery.lock().unwrap().delays.forget(request_id);
        self.registry.unregister(request_id);
    }

    // ── Session lifecycle ──────────────────────────────────────────────────

    fn dcstate(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) -> i32 {
        let mut shifted_dc_id = shifted_dc_id;
        if shifted_dc_id == 0 || bare_dc_id(shifted_dc_id) == 0 {
            let main = self
                .topology
                .lock()
                .unwrap()
                .pool
                .main()
                .expect("querying the main session of an instance without one");
            if shifted_dc_id == 0 {
                return main.state();
            }
            shifted_dc_id += bare_dc_id(main.dc_with_shift());
        }
        match self.topology.lock().unwrap().pool.find(shifted_dc_id) {
            Some(session) => session.state(),
            None => DISCONNECTED_STATE,
        }
    }

    fn dctransport(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) -> String {
        let mut shifted_dc_id = shifted_dc_id;
        if shifted_dc_id == 0 || bare_dc_id(shifted_dc_id) == 0 {
            let main = self
                .topology
                .lock()
                .unwrap()
                .pool
                .main()
                .expect("querying the main session of an instance without one");
            if shifted_dc_id == 0 {
                return main.transport();
            }
            shifted_dc_id += bare_dc_id(main.dc_with_shift());
        }
        match self.topology.lock().unwrap().pool.find(shifted_dc_id) {
            Some(session) => session.transport(),
            None => String::new(),
        }
    }

    fn restart(self: &Arc<Self>) {
        for session in self.topology.lock().unwrap().pool.all() {
            session.restart();
        }
    }

    fn restart_dc(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) {
        let dc_id = bare_dc_id(shifted_dc_id);
        for session in self.topology.lock().unwrap().pool.by_bare_dc(dc_id) {
            session.restart();
        }
    }

    fn kill_session(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) {
        let mut killed = Vec::new();
        let mut restart_main_on = None;
        {
            let mut topology = self.topology.lock().unwrap();
            if let Some((removed, was_main)) = topology.pool.remove(shifted_dc_id) {
                killed.push(removed);
                if was_main {
                    // Whatever already sits on the main DC id goes too; a
                    // fresh main session replaces it.
                    let main_dc_id = topology.main_dc_id;
                    if let Some((second, _)) = topology.pool.remove(main_dc_id) {
                        killed.push(second);
                    }
                    restart_main_on = Some(main_dc_id);
                }
            }
        }
        for session in &killed {
            session.kill();
        }
        if let Some(main_dc_id) = restart_main_on {
            let session = self.start_session(main_dc_id);
            self.topology.lock().unwrap().pool.set_main(session);
        }
        self.invoke_queued(|inner| {
            inner.topology.lock().unwrap().pool.drain_destroyed();
        });
    }

    fn stop_session(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) {
        let (session, is_main) = {
            let topology = self.topology.lock().unwrap();
            match topology.pool.find(shifted_dc_id) {
                Some(session) => {
                    let is_main = topology.pool.is_main(&session);
                    (Some(session), is_main)
                }
                None => (None, false),
            }
        };
        if let Some(session) = session {
            if !is_main {
                // Never stop the main session.
                session.stop();
            }
        }
    }

    fn re_init_connection(self: &Arc<Self>, dc_id: DcId) {
        for session in self.topology.lock().unwrap().pool.by_bare_dc(dc_id) {
            session.re_init_connection();
        }
    }

    fn unpaused(self: &Arc<Self>) {
        for session in self.topology.lock().unwrap().pool.all() {
            session.unpaused();
        }
    }

    // ── Main DC ────────────────────────────────────────────────────────────

    fn main_dc_id(&self) -> DcId {
        let main_dc_id = self.topology.lock().unwrap().main_dc_id;
        assert!(main_dc_id != 0, "instance has no main DC");
        main_dc_id
    }

    fn main_dc_id_or_none(&self) -> DcId {
        self.topology.lock().unwrap().main_dc_id
    }

    fn suggest_main_dc_id(self: &Arc<Self>, dc_id: DcId) {
        if self.topology.lock().unwrap().main_dc_id_forced {
            return;
        }
        self.set_main_dc_id(dc_id);
    }

    fn set_main_dc_id(self: &Arc<Self>, dc_id: DcId) {
        let main = self.topology.lock().unwrap().pool.main();
        let Some(main) = main else {
            log::error!("[instance] attempting to change the main DC without a main session");
            return;
        };
        let old_main_dc_id = main.dc_with_shift();
        {
            let mut topology = self.topology.lock().unwrap();
            topology.main_dc_id_forced = true;
            topology.main_dc_id = dc_id;
        }
        if old_main_dc_id != dc_id {
            self.kill_session(old_main_dc_id);
        }
        self.persister.write_mtp_data();
    }

    // ── Keys ───────────────────────────────────────────────────────────────

    fn dc_persistent_key_changed(self: &Arc<Self>, dc_id: DcId, key: Option<AuthKeyPtr>) {
        self.dc_temporary_key_changed(dc_id);

        if relay_mtproto::dc_id::is_temporary_dc_id(dc_id) {
            return;
        }

        let changed = {
            let mut topology = self.topology.lock().unwrap();
            let unchanged = match (topology.keys_for_write.get(&dc_id), key.as_ref()) {
                (Some(existing), Some(new)) => Arc::ptr_eq(existing, new),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                false
            } else {
                match key {
                    Some(new) => {
                        topology.keys_for_write.insert(dc_id, new);
                    }
                    None => {
                        topology.keys_for_write.remove(&dc_id);
                    }
                }
                true
            }
        };
        if !changed {
            return;
        }
        log::debug!("[instance] writing auth keys, changed by dc {dc_id}");
        self.persister.write_mtp_data();
    }

    fn dc_temporary_key_changed(&self, dc_id: DcId) {
        self.events
            .lock()
            .unwrap()
            .temporary_key
            .retain(|tx| tx.send(dc_id).is_ok());
    }

    fn keys_for_write(&self) -> Vec<AuthKeyPtr> {
        let topology = self.topology.lock().unwrap();
        topology.keys_for_write.values().cloned().collect()
    }

    fn add_keys_for_destroy(self: &Arc<Self>, keys: Vec<AuthKeyPtr>) {
        assert!(self.is_keys_destroyer());

        for key in keys {
            let shifted_dc_id = {
                let mut topology = self.topology.lock().unwrap();
                let mut shifted_dc_id = destroy_key_next_dc_id(key.dc_id());
                while topology.keys_for_write.contains_key(&shifted_dc_id) {
                    shifted_dc_id = destroy_key_next_dc_id(shifted_dc_id);
                }
                topology.keys_for_write.insert(shifted_dc_id, key.clone());
                topology.directory.add(shifted_dc_id, Some(key));
                shifted_dc_id
            };
            self.start_session(shifted_dc_id);
        }
    }

    fn key_destroyed_on_server(self: &Arc<Self>, shifted_dc_id: ShiftedDcId, key_id: u64) {
        log::info!("[instance] destroying key for dc {shifted_dc_id}");
        let dc = {
            let topology = self.topology.lock().unwrap();
            topology.directory.find(bare_dc_id(shifted_dc_id))
        };
        if let Some(dc) = dc {
            if dc.destroy_confirmed_forgotten_key(key_id) {
                log::info!("[instance] key for dc {shifted_dc_id} destroyed on server");
                self.dc_persistent_key_changed(bare_dc_id(shifted_dc_id), None);
            } else {
                log::info!("[instance] key for dc {shifted_dc_id} already rotated");
            }
        }
        self.restart_dc(shifted_dc_id);
    }

    // ── Keys destroyer mode ────────────────────────────────────────────────

    fn schedule_key_destroy(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) {
        debug_assert!(self.is_keys_destroyer());

        if self.dc_options.dc_type(bare_dc_id(shifted_dc_id)) == DcType::Cdn {
            // CDN DCs cannot log out; go straight to key destruction.
            self.perform_key_destroy(shifted_dc_id);
            return;
        }
        let done = Arc::downgrade(self);
        let fail = Arc::downgrade(self);
        let handler = ResponseHandler::new(
            Box::new(move |_, _| {
                if let Some(inner) = done.upgrade() {
                    inner.perform_key_destroy(shifted_dc_id);
                }
                true
            }),
            Box::new(move |_, error| {
                if error.is_default_handled() {
                    return false;
                }
                if let Some(inner) = fail.upgrade() {
                    inner.perform_key_destroy(shifted_dc_id);
                }
                true
            }),
        );
        let request_id = next_request_id();
        self.send_request(
            request_id,
            SerializedRequest::new(wire::log_out()),
            handler,
            shifted_dc_id,
            0,
            false,
            0,
        );
    }

    fn perform_key_destroy(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) {
        debug_assert!(self.is_keys_destroyer());

        let done = Arc::downgrade(self);
        let fail = Arc::downgrade(self);
        let handler = ResponseHandler::new(
            Box::new(move |_, body: &[u8]| {
                let Some(inner) = done.upgrade() else {
                    return true;
                };
                let Some(res) = wire::read_destroy_auth_key_res(body) else {
                    return false;
                };
                match res {
                    wire::DestroyAuthKeyRes::Ok => {
                        log::info!("[instance] key {shifted_dc_id} destroyed");
                    }
                    wire::DestroyAuthKeyRes::None => {
                        log::info!("[instance] key {shifted_dc_id} already destroyed");
                    }
                    wire::DestroyAuthKeyRes::Fail => {
                        log::error!(
                            "[instance] key {shifted_dc_id} destruction failed, leaving it for now"
                        );
                        inner.kill_session(shifted_dc_id);
                    }
                }
                inner.key_was_possibly_destroyed(shifted_dc_id);
                true
            }),
            Box::new(move |_, error| {
                log::error!(
                    "[instance] key {shifted_dc_id} destruction resulted in error: {}",
                    error.name
                );
                if let Some(inner) = fail.upgrade() {
                    inner.key_was_possibly_destroyed(shifted_dc_id);
                }
                true
            }),
        );
        let request_id = next_request_id();
        self.send_request(
            request_id,
            SerializedRequest::new(wire::destroy_auth_key()),
            handler,
            shifted_dc_id,
            0,
            false,
            0,
        );
    }

    fn key_was_possibly_destroyed(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) {
        assert!(self.is_keys_destroyer());

        self.invoke_queued(move |inner| {
            log::info!("[instance] assuming key {shifted_dc_id} is destroyed");
            inner.completed_key_destroy(shifted_dc_id);
        });
    }

    fn completed_key_destroy(self: &Arc<Self>, shifted_dc_id: ShiftedDcId) {
        {
            let mut topology = self.topology.lock().unwrap();
            topology.directory.remove(shifted_dc_id);
            topology.keys_for_write.remove(&shifted_dc_id);
        }
        self.kill_session(shifted_dc_id);
        let all_done = self.topology.lock().unwrap().directory.is_empty();
        if all_done {
            self.events
                .lock()
                .unwrap()
                .all_keys_destroyed
                .retain(|tx| tx.send(()).is_ok());
        }
        self.invoke_queued(|inner| {
            inner.topology.lock().unwrap().directory.drain_destroyed();
        });
    }

    // ── Logout ─────────────────────────────────────────────────────────────

    fn logout(self: &Arc<Self>, done: Arc<dyn Fn() + Send + Sync>) {
        let on_done = done.clone();
        let handler = ResponseHandler::new(
            Box::new(move |_, _| {
                on_done();
                true
            }),
            Box::new(move |_, _| {
                done();
                true
            }),
        );
        let request_id = next_request_id();
        self.send_request(
            request_id,
            SerializedRequest::new(wire::log_out()),
            handler,
            0,
            0,
            false,
            0,
        );
        self.logout_guest_dcs();
    }

    fn logout_guest_dcs(self: &Arc<Self>) {
        let dc_ids: Vec<ShiftedDcId> = {
            let topology = self.topology.lock().unwrap();
            topology.keys_for_write.keys().copied().collect()
        };
        let main_dc_id = self.main_dc_id_or_none();
        for dc_id in dc_ids {
            if dc_id == main_dc_id || self.dc_options.dc_type(dc_id) == DcType::Cdn {
                continue;
            }
            let shifted_dc_id = logout_dc_id(bare_dc_id(dc_id));
            let request_id = next_request_id();
            self.recovery
                .lock()
                .unwrap()
                .logout_guest_requests
                .insert(shifted_dc_id, request_id);

            let done = Arc::downgrade(self);
            let fail = Arc::downgrade(self);
            let handler = ResponseHandler::new(
                Box::new(move |request_id, _| {
                    if let Some(inner) = done.upgrade() {
                        inner.logout_guest_done(request_id);
                    }
                    true
                }),
                Box::new(move |request_id, _| match fail.upgrade() {
                    Some(inner) => inner.logout_guest_done(request_id),
                    None => true,
                }),
            );
            self.send_request(
                request_id,
                SerializedRequest::new(wire::log_out()),
                handler,
                shifted_dc_id,
                0,
                false,
                0,
            );
        }
    }

    fn logout_guest_done(self: &Arc<Self>, request_id: RequestId) -> bool {
        let shifted_dc_id = {
            let mut recovery = self.recovery.lock().unwrap();
            let found = recovery
                .logout_guest_requests
                .iter()
                .find(|(_, &id)| id == request_id)
                .map(|(&shifted, _)| shifted);
            if let Some(shifted) = found {
                recovery.logout_guest_requests.remove(&shifted);
            }
            found
        };
        match shifted_dc_id {
            Some(shifted) => {
                self.kill_session(shifted);
                true
            }
            None => false,
        }
    }

    // ── Dispatcher ─────────────────────────────────────────────────────────

    fn exec_callback(self: &Arc<Self>, request_id: RequestId, response: &[u8]) {
        let Some(mut handler) = self.registry.take_callbacks(request_id) else {
            log::debug!("[instance] no handler for request {request_id}");
            self.unregister_request(request_id);
            return;
        };
        log::debug!("[instance] dispatching response for request {request_id}");

        let error = if response.len() < 4 {
            RpcError::local("RESPONSE_PARSE_FAILED", "empty response")
        } else if wire::top_constructor(response) == Some(wire::ID_RPC_ERROR) {
            wire::read_rpc_error(response)
                .unwrap_or_else(|| RpcError::local("RESPONSE_PARSE_FAILED", "error parse failed"))
        } else {
            let parsed = match handler.on_done.as_mut() {
                Some(on_done) => on_done(request_id, response),
                None => true,
            };
            if parsed {
                self.unregister_request(request_id);
                return;
            }
            RpcError::local("RESPONSE_PARSE_FAILED", "response parse failed")
        };
        log::debug!(
            "[instance] error received for request {request_id}, code {}, type {}",
            error.code,
            error.name
        );
        if self.rpc_error_occurred(request_id, &mut handler, &error) {
            self.unregister_request(request_id);
        } else {
            // The recovery engine kept the request alive; its callbacks go
            // back for the eventual final answer.
            self.registry.put_back_callbacks(request_id, handler);
        }
    }

    fn global_callback(&self, response: &[u8]) {
        let handler = self.handlers.lock().unwrap().updates.clone();
        if let Some(handler) = handler {
            handler(response);
        }
    }

    fn clear_callbacks_delayed(self: &Arc<Self>, ids: Vec<CallbackClear>) {
        if ids.is_empty() {
            return;
        }
        log::debug!(
            "[instance] clear callbacks delayed, requests: {:?}",
            ids.iter().map(|clear| clear.request_id).collect::<Vec<_>>()
        );
        self.invoke_queued(move |inner| {
            for clear in &ids {
                inner.clear_callbacks(clear.request_id, clear.error_code);
                inner.unregister_request(clear.request_id);
            }
        });
    }

    fn clear_callbacks(self: &Arc<Self>, request_id: RequestId, error_code: i32) {
        let Some(mut handler) = self.registry.take_callbacks(request_id) else {
            return;
        };
        if error_code != 0 {
            log::error!(
                "[instance] callbacks cleared without handling, request {request_id}, error code {error_code}"
            );
            let error = RpcError::local(
                "CLEAR_CALLBACK",
                format!("did not handle request {request_id}, error code {error_code}"),
            );
            self.rpc_error_occurred(request_id, &mut handler, &error);
        }
    }

    /// Returns `true` when the request's registration should be cleaned.
    fn rpc_error_occurred(
        self: &Arc<Self>,
        request_id: RequestId,
        handler: &mut ResponseHandler,
        error: &RpcError,
    ) -> bool {
        if error.is_default_handled() {
            if let Some(on_fail) = handler.on_fail.as_mut() {
                if on_fail(request_id, error) {
                    return true;
                }
            }
        }
        if self.on_error_default(request_id, error) {
            return false;
        }
        log::error!(
            "[instance] request {request_id} failed with code {}, error {}{}",
            error.code,
            error.name,
            if error.description.is_empty() {
                String::new()
            } else {
                format!(": {}", error.description)
            }
        );
        match handler.on_fail.as_mut() {
            Some(on_fail) => {
                on_fail(request_id, error);
            }
            None if error.code != 401 => {
                // 401s already went through the global handler inside the
                // engine; everything else surfaces exactly once here.
                let global_fail = self.handlers.lock().unwrap().global_fail.clone();
                if let Some(global_fail) = global_fail {
                    global_fail(request_id, error);
                }
            }
            None => {}
        }
        true
    }

    // ── Error policy engine ────────────────────────────────────────────────

    /// Returns `true` when the engine took responsibility for the request
    /// (it stays registered); `false` hands it back to the caller.
    fn on_error_default(self: &Arc<Self>, request_id: RequestId, error: &RpcError) -> bool {
        if !error.is_flood() && error.name != "AUTH_KEY_UNREGISTERED" {
            // Diagnostic hook: everything outside the expected families.
            log::debug!(
                "[instance] unusual error for request {request_id}: code {}, type {}",
                error.code,
                error.name
            );
        }
        let bad_guest_dc = error.code == 400 && error.name == "FILE_ID_INVALID";

        if let Some(new_dc) = error.migrate_dc() {
            if self.handle_migration(request_id, new_dc) {
                return true;
            }
        } else if error.is_temporary() {
            if self.handle_transient(request_id, error) {
                return true;
            }
        } else if (error.code == 401 && error.name != "AUTH_KEY_PERM_EMPTY")
            || (bad_guest_dc && !self.is_bad_guest_dc_request(request_id))
        {
            return self.handle_unauthorized(request_id, error, bad_guest_dc);
        } else if error.name == "CONNECTION_NOT_INITED" || error.name == "CONNECTION_LAYER_INVALID"
        {
            if self.handle_connection_layer(request_id) {
                return true;
            }
        } else if error.name == "CONNECTION_LANG_CODE_INVALID" {
            self.language.reset_to_default();
        } else if error.name == "MSG_WAIT_FAILED" {
            if self.handle_wait_failed(request_id) {
                return true;
            }
        }

        if bad_guest_dc {
            self.recovery
                .lock()
                .unwrap()
                .bad_guest_dc_requests
                .remove(&request_id);
        }
        false
    }

    fn handle_migration(self: &Arc<Self>, request_id: RequestId, new_dc: DcId) -> bool {
        if request_id == 0 || new_dc == 0 {
            return false;
        }
        let Some(dc_with_shift) = self.registry.query(request_id) else {
            log::error!("[instance] could not find request {request_id} for migrating to {new_dc}");
            return false;
        };
        log::debug!(
            "[instance] changing request {request_id} from dc {dc_with_shift} to dc {new_dc}"
        );
        let new_signed = if dc_with_shift < 0 {
            // An alternate recovery would export/import the authorization
            // here instead of moving the main DC; it is deliberately not
            // wired up.
            self.set_main_dc_id(new_dc);
            -new_dc
        } else {
            shift_dc_id(new_dc, dc_id_shift(dc_with_shift))
        };
        let Some(request) = self.registry.payload(request_id) else {
            log::error!("[instance] could not find request {request_id}");
            return false;
        };
        let session = self.get_session(new_signed.abs());
        self.registry.register(request_id, new_signed);
        session.send_prepared(&request, 0);
        true
    }

    fn handle_transient(self: &Arc<Self>, request_id: RequestId, error: &RpcError) -> bool {
        if request_id == 0 {
            return false;
        }
        let secs = match error.flood_wait_seconds() {
            Some(secs) => secs,
            None => self.recovery.lock().unwrap().delays.next(request_id),
        };
        let send_at = Instant::now() + Duration::from_secs(u64::from(secs)) + DELAY_SLACK;
        let inserted = self
            .recovery
            .lock()
            .unwrap()
            .delayed
            .insert(request_id, send_at);
        if inserted {
            self.check_delayed_requests();
        }
        true
    }

    fn is_bad_guest_dc_request(&self, request_id: RequestId) -> bool {
        self.recovery
            .lock()
            .unwrap()
            .bad_guest_dc_requests
            .contains(&request_id)
    }

    fn handle_unauthorized(
        self: &Arc<Self>,
        request_id: RequestId,
        error: &RpcError,
        bad_guest_dc: bool,
    ) -> bool {
        let dc_with_shift = match self.registry.query(request_id) {
            Some(shifted) => shifted,
            None => {
                log::error!("[instance] unauthorized request {request_id} without dc info");
                0
            }
        };
        let new_dc = bare_dc_id(dc_with_shift.abs());
        if new_dc == 0 || new_dc == self.main_dc_id_or_none() || !self.app.has_authorization() {
            if !bad_guest_dc {
                // Authorization died on the main DC itself; that is the
                // application's problem now.
                let global_fail = self.handlers.lock().unwrap().global_fail.clone();
                if let Some(global_fail) = global_fail {
                    global_fail(request_id, error);
                }
            }
            return false;
        }

        log::debug!("[instance] importing auth to dc {dc_with_shift} for request {request_id}");
        let first_waiter = {
            let mut recovery = self.recovery.lock().unwrap();
            let waiters = recovery.auth_waiters.entry(new_dc).or_default();
            let first = waiters.is_empty();
            waiters.push(request_id);
            if bad_guest_dc {
                recovery.bad_guest_dc_requests.insert(request_id);
            }
            first
        };
        if first_waiter {
            self.send_export_authorization(new_dc, dc_with_shift.abs());
        }
        true
    }

    fn send_export_authorization(
        self: &Arc<Self>,
        new_dc: DcId,
        target_shifted_dc_id: ShiftedDcId,
    ) {
        let export_request_id = next_request_id();
        self.recovery
            .lock()
            .unwrap()
            .auth_export_requests
            .insert(export_request_id, target_shifted_dc_id);

        let done = Arc::downgrade(self);
        let fail = Arc::downgrade(self);
        let handler = ResponseHandler::new(
            Box::new(move |request_id, body: &[u8]| match done.upgrade() {
                Some(inner) => inner.export_done(request_id, body),
                None => true,
            }),
            Box::new(move |request_id, error: &RpcError| match fail.upgrade() {
                Some(inner) => inner.export_fail(request_id, error),
                None => true,
            }),
        );
        self.send_request(
            export_request_id,
            SerializedRequest::new(wire::export_authorization(new_dc)),
            handler,
            0,
            0,
            false,
            0,
        );
    }

    fn export_done(self: &Arc<Self>, request_id: RequestId, body: &[u8]) -> bool {
        let target = self
            .recovery
            .lock()
            .unwrap()
            .auth_export_requests
            .get(&request_id)
            .copied();
        let Some(target_shifted_dc_id) = target else {
            log::error!(
                "[instance] auth export request {request_id} has no recorded target dc"
            );
            return true;
        };
        let Some((id, bytes)) = wire::read_exported_authorization(body) else {
            return false;
        };

        let done = Arc::downgrade(self);
        let fail = Arc::downgrade(self);
        let handler = ResponseHandler::new(
            Box::new(move |import_request_id, _body: &[u8]| match done.upgrade() {
                Some(inner) => {
                    inner.import_done(import_request_id);
                    true
                }
                None => true,
            }),
            Box::new(move |import_request_id, error: &RpcError| match fail.upgrade() {
                Some(inner) => inner.import_fail(import_request_id, error),
                None => true,
            }),
        );
        let import_request_id = next_request_id();
        self.send_request(
            import_request_id,
            SerializedRequest::new(wire::import_authorization(id, &bytes)),
            handler,
            target_shifted_dc_id,
            0,
            false,
            0,
        );
        self.recovery
            .lock()
            .unwrap()
            .auth_export_requests
            .remove(&request_id);
        true
    }

    fn export_fail(self: &Arc<Self>, request_id: RequestId, error: &RpcError) -> bool {
        if error.is_default_handled() {
            return false;
        }
        // The waiters stay unsent; dropping them beats logging the user out
        // over what may be a server-side hiccup.
        let mut recovery = self.recovery.lock().unwrap();
        if let Some(target) = recovery.auth_export_requests.remove(&request_id) {
            recovery
                .auth_waiters
                .entry(bare_dc_id(target.abs()))
                .or_default()
                .clear();
        }
        true
    }

    fn import_done(self: &Arc<Self>, request_id: RequestId) {
        let Some(shifted_dc_id) = self.registry.query(request_id) else {
            log::error!(
                "[instance] auth import request {request_id} not found in the binding table"
            );
            return;
        };
        let new_dc = bare_dc_id(shifted_dc_id.abs());
        log::debug!("[instance] auth import to dc {new_dc} succeeded");

        let waiters = self
            .recovery
            .lock()
            .unwrap()
            .auth_waiters
            .remove(&new_dc)
            .unwrap_or_default();
        for waited_request_id in waiters {
            let Some(request) = self.registry.payload(waited_request_id) else {
                log::error!("[instance] could not find request {waited_request_id} for resending");
                continue;
            };
            let Some(new_signed) = self.registry.change_dc(waited_request_id, new_dc) else {
                log::error!(
                    "[instance] could not find request {waited_request_id} by dc for resending"
                );
                continue;
            };
            if new_signed < 0 {
                self.set_main_dc_id(new_dc);
            }
            log::debug!(
                "[instance] resending request {waited_request_id} to dc {new_signed} after auth import"
            );
            self.get_session(new_signed.abs()).send_prepared(&request, 0);
        }
    }

    fn import_fail(self: &Arc<Self>, _request_id: RequestId, error: &RpcError) -> bool {
        if error.is_default_handled() {
            return false;
        }
        // As with export: swallow rather than log the user out.
        true
    }

    fn handle_connection_layer(self: &Arc<Self>, request_id: RequestId) -> bool {
        let Some(request) = self.registry.payload(request_id) else {
            log::error!("[instance] could not find request {request_id}");
            return false;
        };
        let Some(dc_with_shift) = self.registry.query(request_id) else {
            log::error!(
                "[instance] could not find request {request_id} for resending with layer init"
            );
            return false;
        };
        request.set_needs_layer(true);
        self.get_session(dc_with_shift.abs()).send_prepared(&request, 0);
        true
    }

    fn handle_wait_failed(self: &Arc<Self>, request_id: RequestId) -> bool {
        let Some(request) = self.registry.payload(request_id) else {
            log::error!("[instance] could not find request {request_id}");
            return false;
        };
        let Some(after) = request.after() else {
            log::error!("[instance] wait failed for request {request_id} with no dependency");
            return false;
        };
        let after_request_id = after.request_id();

        let mut dc_with_shift = 0;
        if let Some(shifted_dc_id) = self.registry.query(request_id) {
            if let Some(after_dc_id) = self.registry.query(after_request_id) {
                dc_with_shift = shifted_dc_id;
                if shifted_dc_id != after_dc_id {
                    // The predecessor moved to another DC; the ordering
                    // dependency no longer applies.
                    request.clear_after();
                }
            } else {
                log::error!(
                    "[instance] could not find dependency {after_request_id} by dc"
                );
            }
        } else {
            log::error!("[instance] could not find request {request_id} by dc");
        }
        if dc_with_shift == 0 {
            return false;
        }

        if request.after().is_none() {
            request.set_needs_layer(true);
            self.get_session(dc_with_shift.abs()).send_prepared(&request, 0);
            return true;
        }

        let new_dc = bare_dc_id(dc_with_shift.abs());
        let parked_with_after = {
            let mut recovery = self.recovery.lock().unwrap();
            let after_parked = recovery
                .auth_waiters
                .get(&new_dc)
                .is_some_and(|waiters| waiters.contains(&after_request_id));
            if after_parked {
                let waiters = recovery.auth_waiters.entry(new_dc).or_default();
                if !waiters.contains(&request_id) {
                    waiters.push(request_id);
                }
                if recovery.bad_guest_dc_requests.contains(&after_request_id) {
                    recovery.bad_guest_dc_requests.insert(request_id);
                }
                true
            } else {
                recovery.delayed.insert_before(request_id, after_request_id);
                false
            }
        };
        if !parked_with_after {
            self.check_delayed_requests();
        }
        true
    }

    // ── Delayed queue ──────────────────────────────────────────────────────

    fn check_delayed_requests(self: &Arc<Self>) {
        let now = Instant::now();
        let mut due = Vec::new();
        let next_at = {
            let mut recovery = self.recovery.lock().unwrap();
            while let Some(request_id) = recovery.delayed.pop_due(now) {
                due.push(request_id);
            }
            recovery.delayed.head_at()
        };

        for request_id in due {
            let Some(dc_with_shift) = self.registry.query(request_id) else {
                log::error!(
                    "[instance] could not find request dc for delayed resend, request {request_id}"
                );
                continue;
            };
            let Some(request) = self.registry.payload(request_id) else {
                log::debug!("[instance] could not find request {request_id}");
                continue;
            };
            self.get_session(dc_with_shift.abs()).send_prepared(&request, 0);
        }

        if let Some(at) = next_at {
            self.rearm_delayed_timer(at);
        }
    }

    fn rearm_delayed_timer(self: &Arc<Self>, deadline: Instant) {
        let generation = self.delayed_timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.delayed_timer_gen.load(Ordering::SeqCst) == generation {
                inner.check_delayed_requests();
            }
        });
    }

    // ── Config loop ────────────────────────────────────────────────────────

    fn request_config(self: &Arc<Self>) {
        if self.is_keys_destroyer() || self.config.lock().unwrap().loader.is_some() {
            return;
        }
        let phone = self.config.lock().unwrap().user_phone.clone();
        let done = Arc::downgrade(self);
        let fail = Arc::downgrade(self);
        let loader = self.config_source.make_loader(
            &phone,
            Box::new(move |server_config| {
                if let Some(inner) = done.upgrade() {
                    inner.config_load_done(server_config);
                }
            }),
            Box::new(move |error| {
                if let Some(inner) = fail.upgrade() {
                    inner.config_load_fail(&error);
                }
            }),
        );
        self.config.lock().unwrap().loader = Some(loader.clone());
        loader.load();
    }

    fn config_load_done(self: &Arc<Self>, mut config: ServerConfig) {
        {
            let mut state = self.config.lock().unwrap();
            state.loader = None;
            state.last_loaded = Some(Instant::now());
            state.blocked_mode = config.blocked_mode;
        }
        log::debug!(
            "[instance] got config: this_dc {}, date {}, {} dc options, expires {}",
            config.this_dc,
            config.date,
            config.dc_options.len(),
            config.expires
        );

        if config.dc_options.is_empty() {
            log::error!("[instance] config with empty dc options received");
        } else {
            self.dc_options.set_from_list(&config.dc_options);
        }

        config.pinned_dialogs_count_max = config.pinned_dialogs_count_max.max(1);
        config.pinned_in_folder_count_max = config.pinned_in_folder_count_max.max(1);
        self.app.apply_config(&config);

        self.language
            .set_suggested_language(config.suggested_lang_code.as_deref().unwrap_or(""));
        self.language
            .set_current_versions(config.lang_pack_version, config.base_lang_pack_version);

        self.app.config_updated();

        if let Some(prefix) = &config.autoupdate_url_prefix {
            self.persister.write_autoupdate_prefix(prefix);
        }
        self.persister.write_settings();

        let fresh_for = (config.expires - chrono::Utc::now().timestamp()).max(0);
        self.config.lock().unwrap().expires_at =
            Some(Instant::now() + Duration::from_secs(fresh_for as u64));
        self.request_config_if_expired();
    }

    fn config_load_fail(self: &Arc<Self>, error: &RpcError) {
        if error.is_default_handled() {
            return;
        }
        log::error!("[instance] failed to get config: {error}");
    }

    fn request_config_if_expired(self: &Arc<Self>) {
        let request_in = self
            .config
            .lock()
            .unwrap()
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()));
        match request_in {
            Some(wait) if wait > Duration::ZERO => {
                self.call_delayed(wait.min(CONFIG_REFRESH_CAP), |inner| {
                    inner.request_config_if_expired();
                });
            }
            _ => self.request_config(),
        }
    }

    fn request_config_if_old(self: &Arc<Self>) {
        let (last_loaded, blocked) = {
            let state = self.config.lock().unwrap();
            (state.last_loaded, state.blocked_mode)
        };
        let timeout = if blocked {
            CONFIG_BECOMES_OLD_FOR_BLOCKED
        } else {
            CONFIG_BECOMES_OLD
        };
        let old = match last_loaded {
            Some(at) => at.elapsed() >= timeout,
            None => true,
        };
        if old {
            self.request_config();
        }
    }

    fn request_cdn_config(self: &Arc<Self>) {
        if self.config.lock().unwrap().cdn_config_request_id != 0 {
            return;
        }
        if self.main_dc_id_or_none() == 0 {
            return;
        }
        let request_id = next_request_id();
        self.config.lock().unwrap().cdn_config_request_id = request_id;

        let done = Arc::downgrade(self);
        let fail = Arc::downgrade(self);
        let handler = ResponseHandler::new(
            Box::new(move |_, body: &[u8]| {
                if let Some(inner) = done.upgrade() {
                    inner.config.lock().unwrap().cdn_config_request_id = 0;
                    inner.dc_options.set_cdn_config(body);
                    inner.persister.write_settings();
                }
                true
            }),
            Box::new(move |_, error: &RpcError| {
                if !error.is_temporary() {
                    if let Some(inner) = fail.upgrade() {
                        inner.config.lock().unwrap().cdn_config_request_id = 0;
                    }
                }
                false
            }),
        );
        self.send_request(
            request_id,
            SerializedRequest::new(wire::get_cdn_config()),
            handler,
            0,
            0,
            false,
            0,
        );
    }

    fn set_user_phone(self: &Arc<Self>, phone: &str) {
        let loader = {
            let mut state = self.config.lock().unwrap();
            if state.user_phone == phone {
                return;
            }
            state.user_phone = phone.to_string();
            state.loader.clone()
        };
        if let Some(loader) = loader {
            loader.set_phone(phone);
        }
    }

    fn bad_configuration_error(self: &Arc<Self>) {
        if self.mode == Mode::Normal {
            self.app.bad_mtproto_configuration_error();
        }
    }

    fn sync_http_unixtime(self: &Arc<Self>) {
        if self.config.lock().unwrap().unixtime_guard.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let guard = self.config_source.sync_http_unixtime(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.invoke_queued(|inner| {
                    inner.config.lock().unwrap().unixtime_guard = None;
                });
            }
        }));
        self.config.lock().unwrap().unixtime_guard = Some(guard);
    }

    fn resolve_proxy_domain(self: &Arc<Self>, host: &str) {
        let resolver = self.config.lock().unwrap().domain_resolver.clone();
        let resolver = match resolver {
            Some(resolver) => resolver,
            None => {
                let weak = Arc::downgrade(self);
                let resolver = self.config_source.make_domain_resolver(Box::new(
                    move |host: String, ips: Vec<String>| {
                        if let Some(inner) = weak.upgrade() {
                            inner.apply_domain_ips(&host, &ips);
                        }
                    },
                ));
                self.config.lock().unwrap().domain_resolver = Some(resolver.clone());
                resolver
            }
        };
        resolver.resolve(host);
    }

    fn apply_domain_ips(self: &Arc<Self>, host: &str, ips: &[String]) {
        for session in self.topology.lock().unwrap().pool.all() {
            session.refresh_options();
        }
        self.app.proxy_domain_resolved(host, ips);
    }

    // ── Teardown ───────────────────────────────────────────────────────────

    fn prepare_to_destroy(&self) {
        {
            let mut state = self.config.lock().unwrap();
            state.loader = None;
            state.domain_resolver = None;
            state.unixtime_guard = None;
        }
        let sessions = self.topology.lock().unwrap().pool.take_all();
        for session in sessions {
            session.kill();
        }
    }
}

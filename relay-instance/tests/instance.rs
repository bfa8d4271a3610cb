//! End-to-end orchestrator scenarios against a scripted session fabric.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_instance::config::{
    ConfigDone, ConfigFail, ConfigLoader, ConfigSource, DcOption, DcOptions, DcType, DomainResolver,
    ServerConfig,
};
use relay_instance::session::{CONNECTED_STATE, DISCONNECTED_STATE, REQUEST_SENT_STATE};
use relay_instance::{
    AppHooks, AuthKey, AuthKeyPtr, Dcenter, DcId, Instance, InstanceConfig, LanguageManager, Mode,
    MsgId, Persister, RequestId, ResponseHandler, RpcError, SerializedRequest, Session,
    SessionFactory, ShiftedDcId,
};
use relay_mtproto::dc_id::{logout_dc_id, shift_dc_id, DESTROY_KEY_DC_SHIFT, DOWNLOAD_DC_SHIFT};
use relay_mtproto::wire;

// ─── Session fabric ──────────────────────────────────────────────────────────

struct MockSession {
    shifted_dc_id: ShiftedDcId,
    sent: Mutex<Vec<SerializedRequest>>,
    cancelled: Mutex<Vec<(RequestId, MsgId)>>,
    started: AtomicBool,
    killed: AtomicBool,
    stopped: AtomicBool,
    restarts: AtomicUsize,
    next_msg_id: AtomicU64,
}

impl MockSession {
    fn new(shifted_dc_id: ShiftedDcId) -> Self {
        Self {
            shifted_dc_id,
            sent: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            restarts: AtomicUsize::new(0),
            next_msg_id: AtomicU64::new(0x1000),
        }
    }

    fn sent(&self) -> Vec<SerializedRequest> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// The first queued request whose body matches `body`.
    fn find_sent(&self, body: &[u8]) -> Option<SerializedRequest> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|request| request.body() == body)
            .cloned()
    }
}

impl Session for MockSession {
    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }
    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
    fn re_init_connection(&self) {}
    fn unpaused(&self) {}
    fn ping(&self) {}

    fn send_prepared(&self, request: &SerializedRequest, _ms_can_wait: u64) {
        request.set_msg_id(self.next_msg_id.fetch_add(1, Ordering::SeqCst));
        self.sent.lock().unwrap().push(request.clone());
    }

    fn cancel(&self, request_id: RequestId, msg_id: MsgId) {
        self.cancelled.lock().unwrap().push((request_id, msg_id));
    }

    fn request_state(&self, _request_id: RequestId) -> i32 {
        CONNECTED_STATE
    }
    fn state(&self) -> i32 {
        CONNECTED_STATE
    }
    fn transport(&self) -> String {
        "tcp".to_string()
    }
    fn dc_with_shift(&self) -> ShiftedDcId {
        self.shifted_dc_id
    }
    fn refresh_options(&self) {}
}

#[derive(Default)]
struct MockFactory {
    sessions: Mutex<HashMap<ShiftedDcId, Vec<Arc<MockSession>>>>,
}

impl MockFactory {
    /// The latest session created for this shifted id.
    fn session(&self, shifted_dc_id: ShiftedDcId) -> Arc<MockSession> {
        self.sessions
            .lock()
            .unwrap()
            .get(&shifted_dc_id)
            .and_then(|list| list.last().cloned())
            .unwrap_or_else(|| panic!("no session was started for dc {shifted_dc_id}"))
    }

    fn session_count(&self, shifted_dc_id: ShiftedDcId) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(&shifted_dc_id)
            .map_or(0, Vec::len)
    }

    fn has_session(&self, shifted_dc_id: ShiftedDcId) -> bool {
        self.session_count(shifted_dc_id) > 0
    }
}

impl SessionFactory for MockFactory {
    fn create_session(&self, shifted_dc_id: ShiftedDcId, _dc: Arc<Dcenter>) -> Arc<dyn Session> {
        let session = Arc::new(MockSession::new(shifted_dc_id));
        self.sessions
            .lock()
            .unwrap()
            .entry(shifted_dc_id)
            .or_default()
            .push(session.clone());
        session
    }
}

// ─── Collaborator doubles ────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingDcOptions {
    lists: Mutex<Vec<Vec<DcOption>>>,
    cdn_blobs: Mutex<Vec<Vec<u8>>>,
    cdn_dcs: Mutex<Vec<DcId>>,
}

impl RecordingDcOptions {
    fn mark_cdn(&self, dc_id: DcId) {
        self.cdn_dcs.lock().unwrap().push(dc_id);
    }
}

impl DcOptions for RecordingDcOptions {
    fn set_from_list(&self, options: &[DcOption]) {
        self.lists.lock().unwrap().push(options.to_vec());
    }
    fn set_cdn_config(&self, data: &[u8]) {
        self.cdn_blobs.lock().unwrap().push(data.to_vec());
    }
    fn dc_type(&self, dc_id: DcId) -> DcType {
        if self.cdn_dcs.lock().unwrap().contains(&dc_id) {
            DcType::Cdn
        } else {
            DcType::Main
        }
    }
}

#[derive(Default)]
struct TestApp {
    authorized: AtomicBool,
    applied: Mutex<Vec<ServerConfig>>,
    config_updates: AtomicUsize,
}

impl AppHooks for TestApp {
    fn apply_config(&self, config: &ServerConfig) {
        self.applied.lock().unwrap().push(config.clone());
    }
    fn config_updated(&self) {
        self.config_updates.fetch_add(1, Ordering::SeqCst);
    }
    fn has_authorization(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RecordingPersister {
    mtp_data_writes: AtomicUsize,
    settings_writes: AtomicUsize,
    autoupdate_prefixes: Mutex<Vec<String>>,
}

impl Persister for RecordingPersister {
    fn write_mtp_data(&self) {
        self.mtp_data_writes.fetch_add(1, Ordering::SeqCst);
    }
    fn write_settings(&self) {
        self.settings_writes.fetch_add(1, Ordering::SeqCst);
    }
    fn write_autoupdate_prefix(&self, prefix: &str) {
        self.autoupdate_prefixes
            .lock()
            .unwrap()
            .push(prefix.to_string());
    }
}

#[derive(Default)]
struct RecordingLanguage {
    suggested: Mutex<Vec<String>>,
    versions: Mutex<Vec<(i32, i32)>>,
    resets: AtomicUsize,
}

impl LanguageManager for RecordingLanguage {
    fn set_suggested_language(&self, code: &str) {
        self.suggested.lock().unwrap().push(code.to_string());
    }
    fn set_current_versions(&self, version: i32, base_version: i32) {
        self.versions.lock().unwrap().push((version, base_version));
    }
    fn reset_to_default(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

struct TestLoader {
    loads: AtomicUsize,
    phones: Mutex<Vec<String>>,
    on_done: Mutex<Option<ConfigDone>>,
}

impl ConfigLoader for TestLoader {
    fn load(&self) {
        self.loads.fetch_add(1, Ordering::SeqCst);
    }
    fn set_phone(&self, phone: &str) {
        self.phones.lock().unwrap().push(phone.to_string());
    }
}

impl TestLoader {
    fn finish(&self, config: ServerConfig) {
        if let Some(done) = self.on_done.lock().unwrap().take() {
            done(config);
        }
    }
}

#[derive(Default)]
struct TestConfigSource {
    loaders: Mutex<Vec<Arc<TestLoader>>>,
}

impl TestConfigSource {
    fn loader_count(&self) -> usize {
        self.loaders.lock().unwrap().len()
    }
    fn last_loader(&self) -> Arc<TestLoader> {
        self.loaders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no config loader was started")
    }
}

impl ConfigSource for TestConfigSource {
    fn make_loader(
        &self,
        phone: &str,
        on_done: ConfigDone,
        _on_fail: ConfigFail,
    ) -> Arc<dyn ConfigLoader> {
        let loader = Arc::new(TestLoader {
            loads: AtomicUsize::new(0),
            phones: Mutex::new(vec![phone.to_string()]),
            on_done: Mutex::new(Some(on_done)),
        });
        self.loaders.lock().unwrap().push(loader.clone());
        loader
    }

    fn sync_http_unixtime(
        &self,
        _on_done: Box<dyn FnOnce() + Send>,
    ) -> Box<dyn std::any::Any + Send> {
        Box::new(())
    }

    fn make_domain_resolver(
        &self,
        _apply: Box<dyn Fn(String, Vec<String>) + Send + Sync>,
    ) -> Arc<dyn DomainResolver> {
        struct Never;
        impl DomainResolver for Never {
            fn resolve(&self, _host: &str) {}
        }
        Arc::new(Never)
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    instance: Instance,
    factory: Arc<MockFactory>,
    dc_options: Arc<RecordingDcOptions>,
    app: Arc<TestApp>,
    persister: Arc<RecordingPersister>,
    language: Arc<RecordingLanguage>,
    config_source: Arc<TestConfigSource>,
}

struct HarnessBuilder {
    mode: Mode,
    main_dc_id: Option<DcId>,
    keys: Vec<AuthKeyPtr>,
    cdn_dcs: Vec<DcId>,
}

impl HarnessBuilder {
    fn new() -> Self {
        Self {
            mode: Mode::Normal,
            main_dc_id: None,
            keys: Vec::new(),
            cdn_dcs: Vec::new(),
        }
    }

    fn keys_destroyer(mut self) -> Self {
        self.mode = Mode::KeysDestroyer;
        self
    }

    fn forced_main(mut self, dc_id: DcId) -> Self {
        self.main_dc_id = Some(dc_id);
        self
    }

    fn key(mut self, dc_id: DcId, fill: u8) -> Self {
        self.keys.push(Arc::new(AuthKey::new(dc_id, [fill; 256])));
        self
    }

    fn cdn(mut self, dc_id: DcId) -> Self {
        self.cdn_dcs.push(dc_id);
        self
    }

    fn build(self) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let factory = Arc::new(MockFactory::default());
        let dc_options = Arc::new(RecordingDcOptions::default());
        for dc_id in &self.cdn_dcs {
            dc_options.mark_cdn(*dc_id);
        }
        let app = Arc::new(TestApp::default());
        let persister = Arc::new(RecordingPersister::default());
        let language = Arc::new(RecordingLanguage::default());
        let config_source = Arc::new(TestConfigSource::default());

        let mut config = InstanceConfig::new(factory.clone(), dc_options.clone());
        config.mode = self.mode;
        config.main_dc_id = self.main_dc_id;
        config.keys = self.keys;
        config.config_source = config_source.clone();
        config.persister = persister.clone();
        config.language = language.clone();
        config.app = app.clone();

        Harness {
            instance: Instance::new(config),
            factory,
            dc_options,
            app,
            persister,
            language,
            config_source,
        }
    }
}

impl Harness {
    fn main_session(&self) -> Arc<MockSession> {
        self.factory.session(self.instance.main_dc_id())
    }
}

/// A handler that records every surfaced error without consuming transient
/// ones, so the recovery engine stays in charge.
fn observing_handler(failures: &Arc<Mutex<Vec<RpcError>>>) -> ResponseHandler {
    let failures = failures.clone();
    ResponseHandler::fail(Box::new(move |_, error| {
        failures.lock().unwrap().push(error.clone());
        false
    }))
}

fn sink_handler() -> ResponseHandler {
    ResponseHandler::fail(Box::new(|_, _| false))
}

/// Let queued tasks run.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn bool_true_body() -> Vec<u8> {
    wire::ID_BOOL_TRUE.to_le_bytes().to_vec()
}

// ─── Routing ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn follow_main_requests_bind_negative() {
    let h = HarnessBuilder::new().build();

    let request_id = h
        .instance
        .send(vec![1, 2, 3, 4], sink_handler(), 0, 0, false, 0);

    assert_eq!(h.instance.main_dc_id(), 2);
    assert_eq!(h.instance.request_dc(request_id), Some(-2));
    assert_eq!(h.main_session().sent_count(), 1);
}

#[tokio::test]
async fn pinned_requests_keep_their_slot() {
    let h = HarnessBuilder::new().build();
    let media = shift_dc_id(4, DOWNLOAD_DC_SHIFT);

    let request_id = h.instance.send(vec![1, 2, 3, 4], sink_handler(), media, 0, false, 0);

    assert_eq!(h.instance.request_dc(request_id), Some(media));
    assert_eq!(h.factory.session(media).sent_count(), 1);
    // The main session saw nothing.
    assert_eq!(h.main_session().sent_count(), 0);
}

#[tokio::test]
async fn cancel_is_best_effort() {
    let h = HarnessBuilder::new().build();

    let request_id = h
        .instance
        .send(vec![1, 2, 3, 4], sink_handler(), 0, 0, false, 0);
    let session = h.main_session();
    let msg_id = session.sent()[0].msg_id();
    assert_ne!(msg_id, 0);

    h.instance.cancel(request_id);

    assert_eq!(session.cancelled.lock().unwrap().as_slice(), &[(request_id, msg_id)]);
    assert_eq!(h.instance.request_dc(request_id), None);
    assert_eq!(h.instance.state(request_id), REQUEST_SENT_STATE);
}

#[tokio::test]
async fn dcstate_queries_do_not_start_sessions() {
    let h = HarnessBuilder::new().build();

    assert_eq!(h.instance.dcstate(0), CONNECTED_STATE);
    assert_eq!(h.instance.dctransport(0), "tcp");
    assert_eq!(h.instance.dcstate(777), DISCONNECTED_STATE);
    assert_eq!(h.instance.dctransport(777), "");
    assert!(!h.factory.has_session(777));
}

// ─── Main DC management ──────────────────────────────────────────────────────

#[tokio::test]
async fn set_main_dc_swaps_sessions_and_persists() {
    let h = HarnessBuilder::new().build();
    let old_main = h.main_session();

    h.instance.set_main_dc_id(5);

    assert_eq!(h.instance.main_dc_id(), 5);
    assert!(old_main.killed.load(Ordering::SeqCst));
    assert!(h.factory.has_session(5));
    assert!(h.persister.mtp_data_writes.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn suggestions_lose_to_a_forced_main_dc() {
    let forced = HarnessBuilder::new().forced_main(2).build();
    forced.instance.suggest_main_dc_id(4);
    assert_eq!(forced.instance.main_dc_id(), 2);

    let unforced = HarnessBuilder::new().build();
    unforced.instance.suggest_main_dc_id(4);
    assert_eq!(unforced.instance.main_dc_id(), 4);
}

#[tokio::test]
async fn stop_session_never_stops_main() {
    let h = HarnessBuilder::new().build();
    let media = shift_dc_id(4, DOWNLOAD_DC_SHIFT);
    h.instance.send(vec![1, 2, 3, 4], sink_handler(), media, 0, false, 0);

    h.instance.stop_session(2);
    assert!(!h.main_session().stopped.load(Ordering::SeqCst));

    h.instance.stop_session(media);
    assert!(h.factory.session(media).stopped.load(Ordering::SeqCst));
}

// ─── Error engine: migration ─────────────────────────────────────────────────

#[tokio::test]
async fn migration_of_follow_main_switches_main_dc() {
    let h = HarnessBuilder::new().build();
    let old_main = h.main_session();

    let request_id = h
        .instance
        .send(vec![1, 2, 3, 4], sink_handler(), 0, 0, false, 0);
    h.instance
        .exec_callback(request_id, &wire::rpc_error(303, "USER_MIGRATE_5"));

    assert_eq!(h.instance.main_dc_id(), 5);
    assert_eq!(h.instance.request_dc(request_id), Some(-5));
    assert!(old_main.killed.load(Ordering::SeqCst));

    let new_main = h.factory.session(5);
    let resent = new_main.sent();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].request_id(), request_id);
    assert_eq!(resent[0].body(), &[1, 2, 3, 4]);
}

#[tokio::test]
async fn migration_of_pinned_requests_keeps_the_shift() {
    let h = HarnessBuilder::new().build();
    let media_four = shift_dc_id(4, DOWNLOAD_DC_SHIFT);

    let request_id = h
        .instance
        .send(vec![9, 9, 9, 9], sink_handler(), media_four, 0, false, 0);
    h.instance
        .exec_callback(request_id, &wire::rpc_error(303, "FILE_MIGRATE_5"));

    let media_five = shift_dc_id(5, DOWNLOAD_DC_SHIFT);
    assert_eq!(h.instance.request_dc(request_id), Some(media_five));
    assert_eq!(h.factory.session(media_five).sent_count(), 1);
    // Main DC did not move.
    assert_eq!(h.instance.main_dc_id(), 2);
}

// ─── Error engine: transient delays ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn flood_wait_delays_the_resend() {
    let h = HarnessBuilder::new().build();
    let session = h.main_session();

    let request_id = h
        .instance
        .send(vec![1, 2, 3, 4], sink_handler(), 0, 0, false, 0);
    h.instance
        .exec_callback(request_id, &wire::rpc_error(420, "FLOOD_WAIT_3"));

    // Not resent yet, registration untouched.
    assert_eq!(session.sent_count(), 1);
    assert_eq!(h.instance.request_dc(request_id), Some(-2));

    tokio::time::advance(Duration::from_millis(2900)).await;
    settle().await;
    assert_eq!(session.sent_count(), 1, "resend must wait the full flood delay");

    tokio::time::advance(Duration::from_millis(200)).await;
    settle().await;
    assert_eq!(session.sent_count(), 2);
    assert_eq!(h.instance.request_dc(request_id), Some(-2));
}

#[tokio::test(start_paused = true)]
async fn server_errors_back_off_exponentially() {
    let h = HarnessBuilder::new().build();
    let session = h.main_session();

    let request_id = h
        .instance
        .send(vec![1, 2, 3, 4], sink_handler(), 0, 0, false, 0);

    // First 500: one second.
    h.instance
        .exec_callback(request_id, &wire::rpc_error(500, "INTERNAL"));
    tokio::time::advance(Duration::from_millis(1100)).await;
    settle().await;
    assert_eq!(session.sent_count(), 2);

    // Second 500: two seconds.
    h.instance
        .exec_callback(request_id, &wire::rpc_error(500, "INTERNAL"));
    tokio::time::advance(Duration::from_millis(1100)).await;
    settle().await;
    assert_eq!(session.sent_count(), 2, "second retry must wait two seconds");
    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;
    assert_eq!(session.sent_count(), 3);
}

// ─── Error engine: guest-DC authorization ────────────────────────────────────

/// Runs the export/import dance for the waiters parked on `media`.
fn complete_auth_import(h: &Harness, media: ShiftedDcId) {
    let main = h.main_session();
    let export = main
        .find_sent(&wire::export_authorization(4))
        .expect("an exportAuthorization call on the main DC");
    h.instance.exec_callback(
        export.request_id(),
        &wire::exported_authorization(777, &[9, 9, 9]),
    );

    let media_session = h.factory.session(media);
    let import = media_session
        .find_sent(&wire::import_authorization(777, &[9, 9, 9]))
        .expect("an importAuthorization call on the guest DC");
    h.instance
        .exec_callback(import.request_id(), &[1, 2, 3, 4]);
}

#[tokio::test]
async fn guest_dc_import_resends_waiters() {
    let h = HarnessBuilder::new().build();
    h.app.authorized.store(true, Ordering::SeqCst);
    let media = shift_dc_id(4, DOWNLOAD_DC_SHIFT);

    let request_id = h
        .instance
        .send(vec![7, 7, 7, 7], sink_handler(), media, 0, false, 0);
    h.instance
        .exec_callback(request_id, &wire::rpc_error(401, "AUTH_KEY_UNREGISTERED"));

    // Parked: nothing resent on the media session yet, one export on main.
    assert_eq!(h.factory.session(media).sent_count(), 1);
    assert_eq!(h.main_session().sent_count(), 1);

    complete_auth_import(&h, media);

    let media_session = h.factory.session(media);
    let last = media_session.sent().last().cloned().unwrap();
    assert_eq!(last.request_id(), request_id);
    assert_eq!(last.body(), &[7, 7, 7, 7]);
    assert_eq!(h.instance.request_dc(request_id), Some(media));
}

#[tokio::test]
async fn one_export_per_dc_at_a_time() {
    let h = HarnessBuilder::new().build();
    h.app.authorized.store(true, Ordering::SeqCst);
    let media = shift_dc_id(4, DOWNLOAD_DC_SHIFT);

    let first = h.instance.send(vec![1, 1, 1, 1], sink_handler(), media, 0, false, 0);
    let second = h.instance.send(vec![2, 2, 2, 2], sink_handler(), media, 0, false, 0);
    h.instance
        .exec_callback(first, &wire::rpc_error(401, "AUTH_KEY_UNREGISTERED"));
    h.instance
        .exec_callback(second, &wire::rpc_error(401, "AUTH_KEY_UNREGISTERED"));

    let exports = h
        .main_session()
        .sent()
        .iter()
        .filter(|request| request.body() == wire::export_authorization(4))
        .count();
    assert_eq!(exports, 1);

    complete_auth_import(&h, media);

    // Both waiters came back, in submission order.
    let resent: Vec<RequestId> = h.factory.session(media).sent()[3..]
        .iter()
        .map(|request| request.request_id())
        .collect();
    assert_eq!(resent, vec![first, second]);
}

#[tokio::test]
async fn unauthorized_on_main_dc_surfaces() {
    let h = HarnessBuilder::new().build();
    h.app.authorized.store(true, Ordering::SeqCst);
    let failures = Arc::new(Mutex::new(Vec::new()));
    let global: Arc<Mutex<Vec<RequestId>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let global = global.clone();
        h.instance.set_global_fail_handler(move |request_id, _| {
            global.lock().unwrap().push(request_id);
        });
    }

    let request_id = h
        .instance
        .send(vec![1, 2, 3, 4], observing_handler(&failures), 0, 0, false, 0);
    h.instance
        .exec_callback(request_id, &wire::rpc_error(401, "AUTH_KEY_UNREGISTERED"));

    // No recovery possible on the main DC: both handlers fired, cleaned up.
    assert_eq!(failures.lock().unwrap().len(), 1);
    assert_eq!(global.lock().unwrap().as_slice(), &[request_id]);
    assert_eq!(h.instance.request_dc(request_id), None);
}

#[tokio::test]
async fn bad_guest_dc_imports_once_then_dead_letters() {
    let h = HarnessBuilder::new().build();
    h.app.authorized.store(true, Ordering::SeqCst);
    let media = shift_dc_id(4, DOWNLOAD_DC_SHIFT);
    let failures = Arc::new(Mutex::new(Vec::new()));

    let request_id = h.instance.send(
        vec![5, 5, 5, 5],
        observing_handler(&failures),
        media,
        0,
        false,
        0,
    );
    h.instance
        .exec_callback(request_id, &wire::rpc_error(400, "FILE_ID_INVALID"));

    // First occurrence goes through the import dance.
    assert!(failures.lock().unwrap().is_empty());
    complete_auth_import(&h, media);
    let media_session = h.factory.session(media);
    assert_eq!(media_session.sent().last().unwrap().request_id(), request_id);

    // Second occurrence must not loop; it surfaces.
    h.instance
        .exec_callback(request_id, &wire::rpc_error(400, "FILE_ID_INVALID"));
    let surfaced = failures.lock().unwrap();
    assert_eq!(surfaced.len(), 1);
    assert_eq!(surfaced[0].name, "FILE_ID_INVALID");
    assert_eq!(h.instance.request_dc(request_id), None);
}

// ─── Error engine: dependent requests ────────────────────────────────────────

#[tokio::test]
async fn wait_failed_parks_next_to_a_parked_predecessor() {
    let h = HarnessBuilder::new().build();
    h.app.authorized.store(true, Ordering::SeqCst);
    let media = shift_dc_id(4, DOWNLOAD_DC_SHIFT);

    let first = h.instance.send(vec![1, 1, 1, 1], sink_handler(), media, 0, false, 0);
    h.instance
        .exec_callback(first, &wire::rpc_error(400, "FILE_ID_INVALID"));

    let second = h
        .instance
        .send(vec![2, 2, 2, 2], sink_handler(), media, 0, false, first);
    h.instance
        .exec_callback(second, &wire::rpc_error(400, "MSG_WAIT_FAILED"));

    complete_auth_import(&h, media);

    // Both resent after the import, predecessor first.
    let resent: Vec<RequestId> = h.factory.session(media).sent()[3..]
        .iter()
        .map(|request| request.request_id())
        .collect();
    assert_eq!(resent, vec![first, second]);

    // The dependent request inherited the dead-letter mark: a repeat
    // FILE_ID_INVALID surfaces instead of looping through another import.
    h.instance
        .exec_callback(second, &wire::rpc_error(400, "FILE_ID_INVALID"));
    assert_eq!(h.instance.request_dc(second), None);
}

#[tokio::test(start_paused = true)]
async fn wait_failed_requeues_before_a_delayed_predecessor() {
    let h = HarnessBuilder::new().build();
    let session = h.main_session();

    let first = h.instance.send(vec![1, 1, 1, 1], sink_handler(), 0, 0, false, 0);
    h.instance
        .exec_callback(first, &wire::rpc_error(420, "FLOOD_WAIT_5"));

    let second = h
        .instance
        .send(vec![2, 2, 2, 2], sink_handler(), 0, 0, false, first);
    h.instance
        .exec_callback(second, &wire::rpc_error(400, "MSG_WAIT_FAILED"));

    tokio::time::advance(Duration::from_millis(5100)).await;
    settle().await;

    // Both fired together, the dependent immediately before its predecessor.
    let order: Vec<RequestId> = session.sent()[2..]
        .iter()
        .map(|request| request.request_id())
        .collect();
    assert_eq!(order, vec![second, first]);
}

#[tokio::test]
async fn wait_failed_on_a_moved_predecessor_drops_the_dependency() {
    let h = HarnessBuilder::new().build();
    let media = shift_dc_id(4, DOWNLOAD_DC_SHIFT);

    let first = h.instance.send(vec![1, 1, 1, 1], sink_handler(), media, 0, false, 0);
    let second = h
        .instance
        .send(vec![2, 2, 2, 2], sink_handler(), media, 0, false, first);
    let session = h.factory.session(media);

    // Move the predecessor to another DC; the dependency is now stale.
    h.instance
        .exec_callback(first, &wire::rpc_error(303, "FILE_MIGRATE_5"));
    h.instance
        .exec_callback(second, &wire::rpc_error(400, "MSG_WAIT_FAILED"));

    assert_eq!(
        h.instance.request_dc(first),
        Some(shift_dc_id(5, DOWNLOAD_DC_SHIFT))
    );
    let resent = session.sent().last().cloned().unwrap();
    assert_eq!(resent.request_id(), second);
    assert!(resent.after().is_none());
    assert!(resent.needs_layer());
}

// ─── Error engine: connection layer ──────────────────────────────────────────

#[tokio::test]
async fn connection_not_inited_resends_with_layer() {
    let h = HarnessBuilder::new().build();
    let session = h.main_session();

    let request_id = h
        .instance
        .send(vec![1, 2, 3, 4], sink_handler(), 0, 0, false, 0);
    assert!(!session.sent()[0].needs_layer());

    h.instance
        .exec_callback(request_id, &wire::rpc_error(400, "CONNECTION_NOT_INITED"));

    let resent = session.sent();
    assert_eq!(resent.len(), 2);
    assert!(resent[1].needs_layer());
    assert_eq!(h.instance.request_dc(request_id), Some(-2));
}

#[tokio::test]
async fn lang_code_invalid_resets_language_and_surfaces() {
    let h = HarnessBuilder::new().build();
    let failures = Arc::new(Mutex::new(Vec::new()));

    let request_id = h.instance.send(
        vec![1, 2, 3, 4],
        observing_handler(&failures),
        0,
        0,
        false,
        0,
    );
    h.instance.exec_callback(
        request_id,
        &wire::rpc_error(400, "CONNECTION_LANG_CODE_INVALID"),
    );

    assert_eq!(h.language.resets.load(Ordering::SeqCst), 1);
    assert_eq!(failures.lock().unwrap().len(), 1);
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn updates_go_to_the_global_handler() {
    let h = HarnessBuilder::new().build();
    let updates: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let updates = updates.clone();
        h.instance
            .set_updates_handler(move |body| updates.lock().unwrap().push(body.to_vec()));
    }

    h.instance.global_callback(&[0xaa, 0xbb, 0xcc, 0xdd]);
    assert_eq!(updates.lock().unwrap().as_slice(), &[vec![0xaa, 0xbb, 0xcc, 0xdd]]);
}

#[tokio::test]
async fn unparsed_done_results_surface_as_parse_failures() {
    let h = HarnessBuilder::new().build();
    let failures = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let failures = failures.clone();
        ResponseHandler::new(
            Box::new(|_, _| false),
            Box::new(move |_, error: &RpcError| {
                failures.lock().unwrap().push(error.clone());
                false
            }),
        )
    };

    let request_id = h.instance.send(vec![1, 2, 3, 4], handler, 0, 0, false, 0);
    h.instance.exec_callback(request_id, &[0x11, 0x22, 0x33, 0x44]);

    let surfaced = failures.lock().unwrap();
    assert_eq!(surfaced.len(), 1);
    assert_eq!(surfaced[0].name, "RESPONSE_PARSE_FAILED");
    assert_eq!(h.instance.request_dc(request_id), None);
}

#[tokio::test]
async fn delayed_callback_clearing_synthesizes_an_error() {
    let h = HarnessBuilder::new().build();
    let failures = Arc::new(Mutex::new(Vec::new()));

    let request_id = h.instance.send(
        vec![1, 2, 3, 4],
        observing_handler(&failures),
        0,
        0,
        false,
        0,
    );
    h.instance.clear_callbacks_delayed(vec![relay_instance::CallbackClear {
        request_id,
        error_code: 404,
    }]);
    settle().await;

    let surfaced = failures.lock().unwrap();
    assert_eq!(surfaced.len(), 1);
    assert_eq!(surfaced[0].name, "CLEAR_CALLBACK");
    assert!(!h.instance.has_callbacks(request_id));
    assert_eq!(h.instance.request_dc(request_id), None);
}

// ─── Config loop ─────────────────────────────────────────────────────────────

fn test_server_config() -> ServerConfig {
    ServerConfig {
        dc_options: vec![DcOption {
            id: 2,
            address: "149.154.167.51:443".to_string(),
            cdn: false,
            media_only: false,
        }],
        expires: chrono::Utc::now().timestamp() + 3600,
        suggested_lang_code: Some("en".to_string()),
        lang_pack_version: 7,
        base_lang_pack_version: 3,
        autoupdate_url_prefix: Some("https://updates.example.org".to_string()),
        pinned_dialogs_count_max: 0,
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn config_load_distributes_the_result() {
    let h = HarnessBuilder::new().build();
    assert_eq!(h.config_source.loader_count(), 1, "requested at startup");

    h.config_source.last_loader().finish(test_server_config());

    assert_eq!(h.dc_options.lists.lock().unwrap().len(), 1);
    let applied = h.app.applied.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].pinned_dialogs_count_max, 1, "clamped to at least one");
    assert_eq!(h.app.config_updates.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.language.suggested.lock().unwrap().as_slice(),
        &["en".to_string()]
    );
    assert_eq!(h.language.versions.lock().unwrap().as_slice(), &[(7, 3)]);
    assert_eq!(
        h.persister.autoupdate_prefixes.lock().unwrap().as_slice(),
        &["https://updates.example.org".to_string()]
    );
    assert!(h.persister.settings_writes.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(start_paused = true)]
async fn config_reloads_only_when_old() {
    let h = HarnessBuilder::new().build();
    h.config_source.last_loader().finish(test_server_config());

    h.instance.request_config_if_old();
    assert_eq!(h.config_source.loader_count(), 1, "fresh config is kept");

    tokio::time::advance(Duration::from_secs(121)).await;
    h.instance.request_config_if_old();
    assert_eq!(h.config_source.loader_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn blocked_mode_tightens_the_staleness_bound() {
    let h = HarnessBuilder::new().build();
    let mut config = test_server_config();
    config.blocked_mode = true;
    h.config_source.last_loader().finish(config);

    tokio::time::advance(Duration::from_secs(9)).await;
    h.instance.request_config_if_old();
    assert_eq!(h.config_source.loader_count(), 2);
}

#[tokio::test]
async fn a_running_loader_is_not_duplicated() {
    let h = HarnessBuilder::new().build();
    h.instance.request_config();
    h.instance.request_config();
    assert_eq!(h.config_source.loader_count(), 1);
}

#[tokio::test]
async fn user_phone_reaches_the_running_loader() {
    let h = HarnessBuilder::new().build();
    h.instance.set_user_phone("+1000000001");
    assert_eq!(
        h.config_source.last_loader().phones.lock().unwrap().last().unwrap(),
        "+1000000001"
    );
}

#[tokio::test]
async fn cdn_config_feeds_dc_options() {
    let h = HarnessBuilder::new().build();

    h.instance.request_cdn_config();
    let request = h
        .main_session()
        .find_sent(&wire::get_cdn_config())
        .expect("a getCdnConfig call on the main DC");
    // A second ask while one is in flight is a no-op.
    h.instance.request_cdn_config();
    assert_eq!(h.main_session().sent_count(), 1);

    h.instance
        .exec_callback(request.request_id(), &[0x0a, 0xe4, 0x25, 0x57]);
    assert_eq!(h.dc_options.cdn_blobs.lock().unwrap().len(), 1);
    assert!(h.persister.settings_writes.load(Ordering::SeqCst) >= 1);
}

// ─── Keys destroyer mode ─────────────────────────────────────────────────────

#[tokio::test]
async fn keys_destroyer_destroys_every_key_once() {
    let h = HarnessBuilder::new()
        .keys_destroyer()
        .key(2, 0x11)
        .key(3, 0x22)
        .build();
    let mut destroyed_events = h.instance.all_keys_destroyed_events();

    assert!(h.instance.is_keys_destroyer());
    assert_eq!(h.instance.keys_for_write().len(), 2);
    assert_eq!(h.config_source.loader_count(), 0, "no config loop in this mode");

    for dc_id in [2, 3] {
        let slot = shift_dc_id(dc_id, DESTROY_KEY_DC_SHIFT);
        let session = h.factory.session(slot);

        // Not a CDN DC: log out first, then destroy the key.
        let logout = session
            .find_sent(&wire::log_out())
            .expect("a logOut call on the destroy slot");
        h.instance.exec_callback(logout.request_id(), &bool_true_body());

        let destroy = session
            .find_sent(&wire::destroy_auth_key())
            .expect("a destroyAuthKey call on the destroy slot");
        h.instance.exec_callback(
            destroy.request_id(),
            &wire::destroy_auth_key_res(wire::DestroyAuthKeyRes::Ok),
        );
        settle().await;

        assert!(session.killed.load(Ordering::SeqCst));
    }

    assert!(h.instance.keys_for_write().is_empty());
    assert_eq!(destroyed_events.try_recv().ok(), Some(()));
    assert!(destroyed_events.try_recv().is_err(), "the event fires exactly once");
}

#[tokio::test]
async fn keys_destroyer_skips_logout_on_cdn_dcs() {
    let h = HarnessBuilder::new().keys_destroyer().cdn(2).key(2, 0x11).build();

    let slot = shift_dc_id(2, DESTROY_KEY_DC_SHIFT);
    let session = h.factory.session(slot);
    let sent = session.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body(), wire::destroy_auth_key());
}

#[tokio::test]
async fn destroyer_slots_never_collide() {
    // Two keys for the same physical DC land in successive shifts.
    let h = HarnessBuilder::new()
        .keys_destroyer()
        .key(2, 0x11)
        .key(2, 0x22)
        .build();

    assert!(h.factory.has_session(shift_dc_id(2, DESTROY_KEY_DC_SHIFT)));
    assert!(h.factory.has_session(shift_dc_id(2, DESTROY_KEY_DC_SHIFT + 1)));
    assert_eq!(h.instance.keys_for_write().len(), 2);
}

// ─── Key change notifications ────────────────────────────────────────────────

#[tokio::test]
async fn server_confirmed_key_destruction_clears_and_restarts() {
    let h = HarnessBuilder::new().key(3, 0x33).build();
    let mut key_events = h.instance.dc_temporary_key_changed_events();

    // Bring up a session on DC 3 so the restart is observable.
    h.instance
        .send(vec![1, 2, 3, 4], sink_handler(), 3, 0, false, 0);
    let session = h.factory.session(3);

    let keys = h.instance.keys_for_write();
    assert_eq!(keys.len(), 1);
    let key_id = keys[0].key_id();
    let writes_before = h.persister.mtp_data_writes.load(Ordering::SeqCst);
    h.instance.key_destroyed_on_server(3, key_id);

    assert!(h.instance.keys_for_write().is_empty(), "the dc 3 key is gone");
    assert!(h.persister.mtp_data_writes.load(Ordering::SeqCst) > writes_before);
    assert_eq!(session.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(key_events.try_recv().ok(), Some(3));

    // A stale key id changes nothing further.
    h.instance.key_destroyed_on_server(3, key_id);
    assert!(h.instance.keys_for_write().is_empty());
}

// ─── Logout ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn logout_sweeps_guest_dcs() {
    let h = HarnessBuilder::new()
        .key(2, 0x11)
        .key(3, 0x22)
        .key(4, 0x33)
        .cdn(4)
        .build();
    let done = Arc::new(AtomicUsize::new(0));
    {
        let done = done.clone();
        h.instance.logout(move || {
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Main log-out follows the main DC.
    let main_logout = h
        .main_session()
        .find_sent(&wire::log_out())
        .expect("a logOut call on the main DC");

    // Guests: dc 3 only — dc 2 is main, dc 4 is CDN.
    let guest_slot = logout_dc_id(3);
    assert!(h.factory.has_session(guest_slot));
    assert!(!h.factory.has_session(logout_dc_id(2)));
    assert!(!h.factory.has_session(logout_dc_id(4)));

    let guest_session = h.factory.session(guest_slot);
    let guest_logout = guest_session
        .find_sent(&wire::log_out())
        .expect("a logOut call on the guest slot");
    h.instance
        .exec_callback(guest_logout.request_id(), &bool_true_body());
    assert!(guest_session.killed.load(Ordering::SeqCst));

    h.instance
        .exec_callback(main_logout.request_id(), &bool_true_body());
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

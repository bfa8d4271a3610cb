//! The per-DC session contract and the session pool.
//!
//! A session owns one transmission endpoint: connections, packetization,
//! message ids and sequence numbers.  The orchestrator only submits prepared
//! requests and steers the session's lifecycle through this trait.

use std::collections::HashMap;
use std::sync::Arc;

use relay_mtproto::dc_id::{bare_dc_id, ShiftedDcId};
use relay_mtproto::request::{MsgId, RequestId, SerializedRequest};

use crate::dcenter::Dcenter;

// ─── Connection / request states ─────────────────────────────────────────────

pub const DISCONNECTED_STATE: i32 = 0;
pub const CONNECTING_STATE: i32 = 1;
pub const CONNECTED_STATE: i32 = 2;
/// Reported for a request the orchestrator no longer tracks (it is either on
/// the wire or already answered).  Negative states mean "waiting for that
/// many milliseconds".
pub const REQUEST_SENT_STATE: i32 = 3;

// ─── Contract ────────────────────────────────────────────────────────────────

/// The transmission endpoint for one shifted DC.
///
/// Implementations run on their own threads/tasks and report responses back
/// through the orchestrator's dispatcher surface.  Methods must not call back
/// into the orchestrator synchronously.
pub trait Session: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn kill(&self);
    fn restart(&self);
    fn re_init_connection(&self);
    fn unpaused(&self);
    fn ping(&self);

    /// Queue a prepared request; `ms_can_wait` is an advisory batching hint.
    fn send_prepared(&self, request: &SerializedRequest, ms_can_wait: u64);

    /// Best-effort: drop the outbound message for a cancelled request.
    fn cancel(&self, request_id: RequestId, msg_id: MsgId);

    /// State of one in-flight request; negative means waiting-for-ms.
    /// `request_id == 0` asks for the session's own state instead.
    fn request_state(&self, request_id: RequestId) -> i32;

    /// Connection state of the session itself.
    fn state(&self) -> i32;

    /// Human-readable transport name, empty while disconnected.
    fn transport(&self) -> String;

    /// The shifted DC id this session is bound to.
    fn dc_with_shift(&self) -> ShiftedDcId;

    /// Re-read endpoint/proxy options after they changed.
    fn refresh_options(&self);
}

/// Creates sessions on demand.
///
/// Called by the orchestrator whenever routing reaches a shifted DC with no
/// live session.  The returned session is not yet started; the orchestrator
/// calls [`Session::start`] once it is registered in the pool.
pub trait SessionFactory: Send + Sync {
    fn create_session(&self, shifted_dc_id: ShiftedDcId, dc: Arc<Dcenter>) -> Arc<dyn Session>;
}

// ─── Pool ────────────────────────────────────────────────────────────────────

/// Owns the live sessions, keyed by shifted DC id, plus the main-session pin
/// and the quarantine list for killed sessions.
#[derive(Default)]
pub struct SessionPool {
    sessions: HashMap<ShiftedDcId, Arc<dyn Session>>,
    to_destroy: Vec<Arc<dyn Session>>,
    main: Option<Arc<dyn Session>>,
}

impl SessionPool {
    pub fn find(&self, shifted_dc_id: ShiftedDcId) -> Option<Arc<dyn Session>> {
        self.sessions.get(&shifted_dc_id).cloned()
    }

    pub fn insert(&mut self, shifted_dc_id: ShiftedDcId, session: Arc<dyn Session>) {
        self.sessions.insert(shifted_dc_id, session);
    }

    /// Remove a session into quarantine, clearing the main pin if it pointed
    /// at it.  Returns the removed session and whether it was the main one.
    pub fn remove(&mut self, shifted_dc_id: ShiftedDcId) -> Option<(Arc<dyn Session>, bool)> {
        let session = self.sessions.remove(&shifted_dc_id)?;
        let was_main = self
            .main
            .as_ref()
            .is_some_and(|main| Arc::ptr_eq(main, &session));
        if was_main {
            self.main = None;
        }
        self.to_destroy.push(session.clone());
        Some((session, was_main))
    }

    pub fn main(&self) -> Option<Arc<dyn Session>> {
        self.main.clone()
    }

    pub fn set_main(&mut self, session: Arc<dyn Session>) {
        self.main = Some(session);
    }

    pub fn is_main(&self, session: &Arc<dyn Session>) -> bool {
        self.main
            .as_ref()
            .is_some_and(|main| Arc::ptr_eq(main, session))
    }

    /// All live sessions, in no particular order.
    pub fn all(&self) -> Vec<Arc<dyn Session>> {
        self.sessions.values().cloned().collect()
    }

    /// Live sessions whose bare DC id matches `dc_id`.
    pub fn by_bare_dc(&self, dc_id: i32) -> Vec<Arc<dyn Session>> {
        self.sessions
            .iter()
            .filter(|(shifted, _)| bare_dc_id((*shifted).abs()) == dc_id)
            .map(|(_, session)| session.clone())
            .collect()
    }

    /// Remove every session into the caller's hands (teardown path).
    pub fn take_all(&mut self) -> Vec<Arc<dyn Session>> {
        self.main = None;
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    /// Drop quarantined sessions; called from a queued task.
    pub fn drain_destroyed(&mut self) {
        self.to_destroy.clear();
    }
}

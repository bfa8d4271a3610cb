//! Thread-safe request bookkeeping.
//!
//! Three tables track an in-flight request: its DC binding, its serialized
//! payload and its callbacks.  The binding is stored *signed*: a positive
//! value pins the request to that shifted DC, a negative value means "follow
//! whatever the main DC currently is".  Removal is atomic per table but not
//! across tables; readers copy entries out and tolerate misses.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use relay_mtproto::dc_id::{dc_id_shift, shift_dc_id, DcId, ShiftedDcId};
use relay_mtproto::errors::RpcError;
use relay_mtproto::request::{RequestId, SerializedRequest};

// ─── Callbacks ───────────────────────────────────────────────────────────────

/// Invoked with the raw result body; returns `false` if it failed to parse.
pub type DoneHandler = Box<dyn FnMut(RequestId, &[u8]) -> bool + Send>;

/// Invoked with a server or local error; returns `true` if it handled it.
pub type FailHandler = Box<dyn FnMut(RequestId, &RpcError) -> bool + Send>;

/// The callback pair bundled with a request.
#[derive(Default)]
pub struct ResponseHandler {
    pub on_done: Option<DoneHandler>,
    pub on_fail: Option<FailHandler>,
}

impl ResponseHandler {
    pub fn new(on_done: DoneHandler, on_fail: FailHandler) -> Self {
        Self {
            on_done: Some(on_done),
            on_fail: Some(on_fail),
        }
    }

    pub fn done(on_done: DoneHandler) -> Self {
        Self {
            on_done: Some(on_done),
            on_fail: None,
        }
    }

    pub fn fail(on_fail: FailHandler) -> Self {
        Self {
            on_done: None,
            on_fail: Some(on_fail),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.on_done.is_none() && self.on_fail.is_none()
    }
}

impl std::fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ResponseHandler(done: {}, fail: {})",
            self.on_done.is_some(),
            self.on_fail.is_some()
        )
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// The three request tables, each behind its own lock.
///
/// The payload table uses a reader-writer lock: dispatch reads payloads
/// concurrently from session threads, writers are rare.
#[derive(Default)]
pub struct RequestRegistry {
    by_dc: Mutex<HashMap<RequestId, ShiftedDcId>>,
    payloads: RwLock<HashMap<RequestId, SerializedRequest>>,
    callbacks: Mutex<HashMap<RequestId, ResponseHandler>>,
}

impl RequestRegistry {
    /// Bind a request to a signed shifted DC id.
    pub fn register(&self, request_id: RequestId, signed_shifted_dc_id: ShiftedDcId) {
        self.by_dc
            .lock()
            .unwrap()
            .insert(request_id, signed_shifted_dc_id);
    }

    /// Drop the binding and the payload.  Callbacks may have been taken
    /// earlier; they are not touched here.
    pub fn unregister(&self, request_id: RequestId) {
        self.payloads.write().unwrap().remove(&request_id);
        self.by_dc.lock().unwrap().remove(&request_id);
    }

    /// The signed binding of a request, if still registered.
    pub fn query(&self, request_id: RequestId) -> Option<ShiftedDcId> {
        self.by_dc.lock().unwrap().get(&request_id).copied()
    }

    /// Rebind a request to a new bare DC, preserving the sign convention:
    /// a follow-main binding stays follow-main (`-new_dc`, shift 0), a pinned
    /// binding keeps its prior shift.
    pub fn change_dc(&self, request_id: RequestId, new_dc: DcId) -> Option<ShiftedDcId> {
        let mut map = self.by_dc.lock().unwrap();
        let entry = map.get_mut(&request_id)?;
        *entry = if *entry < 0 {
            -new_dc
        } else {
            shift_dc_id(new_dc, dc_id_shift(*entry))
        };
        Some(*entry)
    }

    pub fn store_payload(&self, request_id: RequestId, request: SerializedRequest) {
        self.payloads.write().unwrap().insert(request_id, request);
    }

    /// A clone of the stored payload.  Never hand out references: the entry
    /// may be erased between read and use.
    pub fn payload(&self, request_id: RequestId) -> Option<SerializedRequest> {
        self.payloads.read().unwrap().get(&request_id).cloned()
    }

    pub fn take_payload(&self, request_id: RequestId) -> Option<SerializedRequest> {
        self.payloads.write().unwrap().remove(&request_id)
    }

    /// Store the callback pair; an empty pair is not stored at all.
    pub fn store_callbacks(&self, request_id: RequestId, handler: ResponseHandler) {
        if handler.is_empty() {
            return;
        }
        self.callbacks.lock().unwrap().insert(request_id, handler);
    }

    /// Remove-and-return the callbacks.  The dispatcher puts them back with
    /// [`RequestRegistry::put_back_callbacks`] when the recovery engine keeps
    /// the request alive.
    pub fn take_callbacks(&self, request_id: RequestId) -> Option<ResponseHandler> {
        self.callbacks.lock().unwrap().remove(&request_id)
    }

    pub fn put_back_callbacks(&self, request_id: RequestId, handler: ResponseHandler) {
        self.callbacks.lock().unwrap().insert(request_id, handler);
    }

    pub fn has_callbacks(&self, request_id: RequestId) -> bool {
        self.callbacks.lock().unwrap().contains_key(&request_id)
    }
}

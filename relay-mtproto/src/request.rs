//! Shared serialized-request handles.
//!
//! A request is serialized once by the caller and then travels by reference
//! count: the payload table, the owning session and any dependent request all
//! hold the same handle.  The body is immutable; the small mutable metadata
//! (message id, send time, layer flag, dependency) sits behind its own lock so
//! a session thread can stamp it while the orchestrator still holds clones.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Identifies a request from submission to completion.
pub type RequestId = i32;

/// The outgoing MTProto message id a session assigned to a request.
pub type MsgId = u64;

static GLOBAL_REQUEST_ID: AtomicI32 = AtomicI32::new(0);

/// Allocate the next process-global request id.
///
/// Wraps back to zero at `i32::MAX / 2` so ids stay comfortably below signed
/// overflow and negative ids remain free to encode session pseudo-ids.
pub fn next_request_id() -> RequestId {
    let result = GLOBAL_REQUEST_ID.fetch_add(1, Ordering::Relaxed) + 1;
    if result == i32::MAX / 2 {
        GLOBAL_REQUEST_ID.store(0, Ordering::Relaxed);
    }
    result
}

#[derive(Default)]
struct RequestMeta {
    request_id: RequestId,
    msg_id: MsgId,
    last_sent_time: Option<Instant>,
    needs_layer: bool,
    after: Option<SerializedRequest>,
}

struct RequestData {
    body: Vec<u8>,
    meta: Mutex<RequestMeta>,
}

/// A cheaply cloneable handle to one serialized request.
#[derive(Clone)]
pub struct SerializedRequest(Arc<RequestData>);

impl SerializedRequest {
    /// Wrap a TL-serialized function body.
    pub fn new(body: Vec<u8>) -> Self {
        Self(Arc::new(RequestData {
            body,
            meta: Mutex::new(RequestMeta::default()),
        }))
    }

    /// The TL-serialized body.
    pub fn body(&self) -> &[u8] {
        &self.0.body
    }

    /// The constructor id in the first four body bytes, if present.
    pub fn constructor_id(&self) -> Option<u32> {
        self.0
            .body
            .get(..4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    /// Whether two handles refer to the same request.
    pub fn same_as(&self, other: &SerializedRequest) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn request_id(&self) -> RequestId {
        self.0.meta.lock().unwrap().request_id
    }

    pub fn set_request_id(&self, request_id: RequestId) {
        self.0.meta.lock().unwrap().request_id = request_id;
    }

    pub fn msg_id(&self) -> MsgId {
        self.0.meta.lock().unwrap().msg_id
    }

    /// Stamped by the owning session when the request goes on the wire.
    pub fn set_msg_id(&self, msg_id: MsgId) {
        self.0.meta.lock().unwrap().msg_id = msg_id;
    }

    pub fn needs_layer(&self) -> bool {
        self.0.meta.lock().unwrap().needs_layer
    }

    pub fn set_needs_layer(&self, needs_layer: bool) {
        self.0.meta.lock().unwrap().needs_layer = needs_layer;
    }

    pub fn last_sent_time(&self) -> Option<Instant> {
        self.0.meta.lock().unwrap().last_sent_time
    }

    pub fn mark_sent(&self) {
        self.0.meta.lock().unwrap().last_sent_time = Some(Instant::now());
    }

    /// The predecessor this request waits on, if any.
    pub fn after(&self) -> Option<SerializedRequest> {
        self.0.meta.lock().unwrap().after.clone()
    }

    pub fn set_after(&self, after: Option<SerializedRequest>) {
        self.0.meta.lock().unwrap().after = after;
    }

    pub fn clear_after(&self) {
        self.0.meta.lock().unwrap().after = None;
    }
}

impl std::fmt::Debug for SerializedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SerializedRequest(id={}, {} bytes)",
            self.request_id(),
            self.0.body.len()
        )
    }
}

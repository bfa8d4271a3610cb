//! MTProto protocol vocabulary shared by the orchestrator and its sessions.
//!
//! This crate carries:
//! * The shifted DC identifier space (one physical DC, many logical slots)
//! * Persistent authorization keys and their identifiers
//! * The RPC error representation and its recovery classification
//! * The shared serialized-request handle passed between orchestrator and sessions
//! * The handful of TL wire constants and encoders the orchestrator emits itself
//!
//! It is intentionally transport-agnostic: connections, packetization and the
//! full TL schema live elsewhere.

#![deny(unsafe_code)]

pub mod auth_key;
pub mod dc_id;
pub mod errors;
pub mod request;
pub mod wire;

pub use auth_key::{AuthKey, AuthKeyPtr};
pub use dc_id::{DcId, ShiftedDcId};
pub use errors::RpcError;
pub use request::{next_request_id, MsgId, RequestId, SerializedRequest};

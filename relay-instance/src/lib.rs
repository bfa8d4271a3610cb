//! # relay-instance
//!
//! The MTProto client orchestrator: multiplexes application RPC requests
//! across data centers, tracks each request from submission to completion and
//! reacts to server-driven redirections, floods, authorization imports and
//! key destruction.
//!
//! ## What lives here
//! - Request registry — thread-safe request-id ↔ DC / payload / callback tables
//! - DC directory — lazy `Dcenter` handles with quarantined removal
//! - Session pool — per-shifted-DC sessions, main-session pinning
//! - Request router — `send` resolves a target session and registers the request
//! - Error policy engine — migration, flood/5xx backoff, auth export/import,
//!   layer re-init, dependent-wait requeueing
//! - Config loop — freshness-driven reload of the server configuration
//! - Keys destroyer mode — logs out and destroys every stored key, then exits
//!
//! Sockets, packetization and the TL schema are collaborator territory; plug
//! them in through the [`Session`], [`DcOptions`], [`ConfigSource`],
//! [`Persister`], [`LanguageManager`] and [`AppHooks`] contracts.
//!
//! An [`Instance`] must be created inside a Tokio runtime: resend timers,
//! config refresh and deferred destruction run as tasks on it.

#![deny(unsafe_code)]

mod instance;

pub mod config;
pub mod dcenter;
pub mod delays;
pub mod hooks;
pub mod registry;
pub mod session;

pub use config::{
    ConfigLoader, ConfigSource, DcOption, DcOptions, DcType, DomainResolver, NullConfigSource,
    ServerConfig, StaticDcOptions,
};
pub use dcenter::Dcenter;
pub use hooks::{
    AppHooks, LanguageManager, NullAppHooks, NullLanguageManager, NullPersister, Persister,
};
pub use instance::{
    CallbackClear, Instance, InstanceConfig, Mode, DEFAULT_MAIN_DC,
};
pub use registry::{DoneHandler, FailHandler, ResponseHandler};
pub use session::{Session, SessionFactory};

pub use relay_mtproto::auth_key::{AuthKey, AuthKeyPtr};
pub use relay_mtproto::dc_id::{DcId, ShiftedDcId};
pub use relay_mtproto::errors::RpcError;
pub use relay_mtproto::request::{next_request_id, MsgId, RequestId, SerializedRequest};

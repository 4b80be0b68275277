//! Shroud TLS - non-blocking TLS interception adapter
//!
//! This crate provides:
//! - The duplex [`Endpoint`] contract shared by raw transports and adapters
//! - The black-box [`TlsEngine`] record-codec contract
//! - [`TlsAdapter`], the handshake/wrap/unwrap state machine
//! - Callback executors for suspension-free resumption
//!
//! # Architecture
//!
//! The adapter is strictly non-blocking and callback-driven. A passive
//! `fill`/`flush` that cannot progress returns without side effects; an
//! active `fill_interest`/`write` parks one of two sub-state enums and is
//! resumed by a raw-endpoint callback or an executor task:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 application (decrypted side)             │
//! │   fill / flush / fill_interest / write / shutdown        │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ TlsAdapter (one lock per session,
//!                              │ callbacks dispatched outside it)
//! ┌────────────────────────────┴─────────────────────────────┐
//! │                    raw (encrypted side)                  │
//! │   ≤ 1 write in flight, ≤ 1 fill interest armed           │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod exec;

pub use adapter::{
    HandshakeEvent, HandshakeListener, HandshakeState, SessionPolicy, TlsAdapter, TrafficStats,
};
pub use endpoint::{Endpoint, FillResult, IoCallback};
pub use engine::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine, TlsVersion};
pub use error::{Failure, TlsError};
pub use exec::{DeferredExecutor, Executor, Job, WorkerExecutor};

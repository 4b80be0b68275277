//! TLS engine contract.
//!
//! The record codec is a black box to this crate: the adapter only drives
//! `wrap`/`unwrap` and reacts to the status pair each call reports. Any codec
//! exposing these operations can sit behind the adapter.

use crate::error::TlsError;

/// Result codes for a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// The call consumed and/or produced bytes normally.
    Ok,
    /// The source did not hold a complete record.
    BufferUnderflow,
    /// The destination cannot hold the result.
    BufferOverflow,
    /// The engine is closed in the direction of the call.
    Closed,
}

/// What the engine needs next to make handshake progress.
///
/// `Finished` only appears in [`EngineResult::handshake`], on the call that
/// completes a handshake; [`TlsEngine::handshake_status`] reports one of the
/// other four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    NeedUnwrap,
    NeedWrap,
    NeedTask,
    Finished,
}

/// Protocol version negotiated (or being negotiated) by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// Outcome of one wrap or unwrap call.
#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake: HandshakeStatus,
    /// Bytes consumed from the source.
    pub consumed: usize,
    /// Bytes produced into the destination.
    pub produced: usize,
}

/// A TLS record codec.
///
/// All calls are non-blocking. `wrap` and `unwrap` report progress through
/// [`EngineResult`]; the adapter owns cursor advancement in both directions.
pub trait TlsEngine: Send {
    /// Encrypts application bytes from `src` into `dst`.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    /// Decrypts record bytes from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError>;

    /// What the engine needs next.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Runs any delegated tasks the engine has queued. Called when
    /// [`handshake_status`](TlsEngine::handshake_status) reports `NeedTask`.
    fn run_delegated_tasks(&mut self);

    /// Marks the inbound direction closed. Returns an error if the peer never
    /// sent close-notify.
    fn close_inbound(&mut self) -> Result<(), TlsError>;

    /// Marks the outbound direction closed; the next wrap produces the
    /// close-notify record.
    fn close_outbound(&mut self);

    fn is_inbound_done(&self) -> bool;
    fn is_outbound_done(&self) -> bool;

    /// Largest plaintext a single unwrap may produce. May grow mid-session.
    fn application_buffer_size(&self) -> usize;

    /// Largest record a single wrap may produce or unwrap may require,
    /// reflecting whichever of the current and in-progress handshake sessions
    /// is larger. May grow mid-session.
    fn packet_buffer_size(&self) -> usize;

    /// Negotiated protocol version.
    fn protocol(&self) -> TlsVersion;

    /// True when the engine drives the client side of the handshake.
    fn is_client(&self) -> bool;
}

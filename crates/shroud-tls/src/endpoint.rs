//! Duplex endpoint contract.
//!
//! Both sides of the adapter speak the same shape: the raw (encrypted)
//! endpoint it consumes and the application (decrypted) endpoint it exposes.
//! That symmetry is what lets adapters stack: the decrypted side of one can
//! be the raw side of another.

use bytes::Buf;

use crate::error::TlsError;

/// Outcome of a non-blocking fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillResult {
    /// Bytes were copied into the destination.
    Filled(usize),
    /// No data available right now; try again after fill interest fires.
    Pending,
    /// End of stream.
    Eof,
}

/// Single-shot completion callback for asynchronous endpoint operations.
pub type IoCallback = Box<dyn FnOnce(Result<(), TlsError>) + Send>;

/// A non-blocking byte-stream endpoint.
///
/// `fill` and `flush` never block and never park callbacks: they report what
/// they could do and return. Asynchrony is explicit through `fill_interest`
/// and `write`, each of which arranges exactly one callback invocation.
pub trait Endpoint: Send {
    /// Non-blocking read into `dst`.
    fn fill(&mut self, dst: &mut [u8]) -> Result<FillResult, TlsError>;

    /// Non-blocking write, consuming from the front of `src`. Returns true
    /// iff `src` was fully consumed and nothing remains buffered inside the
    /// endpoint.
    fn flush(&mut self, src: &mut dyn Buf) -> Result<bool, TlsError>;

    /// Arranges for `cb` to succeed when `fill` is next likely to make
    /// progress, or fail on a terminal error. At most one interest may be
    /// armed at a time.
    fn fill_interest(&mut self, cb: IoCallback);

    /// Asynchronous write: the endpoint takes `src`, drains it fully, then
    /// invokes `cb` exactly once. At most one write may be in flight at a
    /// time.
    fn write(&mut self, cb: IoCallback, src: Box<dyn Buf + Send>);

    /// Half-close: no further output. Idempotent.
    fn shutdown_output(&mut self);

    /// Full close. Idempotent.
    fn close(&mut self);

    fn is_input_shutdown(&self) -> bool;
    fn is_output_shutdown(&self) -> bool;
}

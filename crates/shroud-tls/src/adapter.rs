//! TLS duplex stream adapter.
//!
//! [`TlsAdapter`] sits between a raw encrypted [`Endpoint`] and the
//! application: it implements the same endpoint shape on the decrypted side,
//! driving a [`TlsEngine`] to wrap and unwrap records and to make handshake
//! progress from both the fill and flush paths.
//!
//! # State machine
//!
//! ```text
//!                  ┌──────────────────────────────────────────┐
//!                  │                TlsAdapter                │
//!  application ────┤ fill ◄── unwrap ◄── enc-in ◄── raw fill  │──── raw
//!   endpoint   ────┤ flush ──► wrap ──► enc-out ──► raw flush │──── endpoint
//!                  │    handshake: Initial → Handshaking →    │
//!                  │          Succeeded | Failed              │
//!                  └──────────────────────────────────────────┘
//! ```
//!
//! Suspension is explicit: a passive `fill`/`flush` that cannot progress
//! returns `Pending`/`false` and touches no callbacks. Only `fill_interest`
//! and `write` park interest, recorded in two small sub-state enums; the
//! resumption path is always an executor task or a raw-endpoint callback,
//! never an inline re-entry.
//!
//! All session state lives behind one mutex. The fill/flush cross-calls that
//! drive handshake progress stay within a single lock acquisition by passing
//! `&mut Session` through the internal `*_locked` functions, and callbacks
//! are dispatched only after the lock is released.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use shroud_core::{BufferPool, Domain, SessionSettings};

use crate::endpoint::{Endpoint, FillResult, IoCallback};
use crate::engine::{EngineStatus, HandshakeStatus, TlsEngine, TlsVersion};
use crate::error::{Failure, TlsError};
use crate::exec::Executor;

const HS_INITIAL: u8 = 0;
const HS_HANDSHAKING: u8 = 1;
const HS_SUCCEEDED: u8 = 2;
const HS_FAILED: u8 = 3;

/// Lifecycle of the TLS handshake. Monotonic: `Initial → Handshaking →
/// {Succeeded, Failed}`. Renegotiation re-enters handshake semantics but the
/// state stays `Succeeded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initial,
    Handshaking,
    Succeeded,
    Failed,
}

/// Which way the fill side is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillState {
    Idle,
    /// Fill interest registered; waiting for raw bytes.
    Interested,
    /// Fill progress requires a wrap first; waiting on the flush side.
    WaitForFlush,
}

/// Which way the flush side is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    Idle,
    /// Exactly one raw write is in flight.
    Writing,
    /// Flush progress requires an unwrap first; waiting on the fill side.
    WaitForFill,
}

/// Per-session TLS policy.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    /// Allow mid-stream renegotiation (pre-TLS 1.3 peers).
    pub renegotiation_allowed: bool,
    /// Renegotiations permitted per session (-1 = unlimited, 0 = none).
    pub renegotiation_limit: i64,
    /// Treat inbound end-of-stream without close-notify as an error. Required
    /// on clients receiving connection-delimited bodies to defeat truncation
    /// attacks.
    pub require_close_notify: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            renegotiation_allowed: true,
            renegotiation_limit: -1,
            require_close_notify: false,
        }
    }
}

impl From<&SessionSettings> for SessionPolicy {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            renegotiation_allowed: settings.renegotiation_allowed,
            renegotiation_limit: settings.renegotiation_limit,
            require_close_notify: settings.require_close_notify,
        }
    }
}

/// Snapshot passed to handshake listeners.
#[derive(Debug, Clone)]
pub struct HandshakeEvent {
    pub protocol: TlsVersion,
    pub client: bool,
}

/// Observer of handshake outcomes. Each method fires at most once per
/// session, outside the session lock.
pub trait HandshakeListener: Send + Sync {
    fn on_handshake_succeeded(&self, _event: &HandshakeEvent) {}
    fn on_handshake_failed(&self, _event: &HandshakeEvent, _error: &TlsError) {}
}

/// Byte counters for one session.
#[derive(Debug, Clone, Copy)]
pub struct TrafficStats {
    /// Encrypted bytes read from the raw endpoint.
    pub bytes_in: u64,
    /// Encrypted bytes produced toward the raw endpoint.
    pub bytes_out: u64,
}

struct PendingWrite {
    src: Box<dyn Buf + Send>,
    cb: IoCallback,
}

/// Mutable session state, guarded by the session mutex.
struct Session {
    engine: Box<dyn TlsEngine>,
    raw: Box<dyn Endpoint>,
    policy: SessionPolicy,
    renegotiations_left: i64,
    fill_state: FillState,
    flush_state: FlushState,
    /// Encrypted bytes read from the raw endpoint, not yet unwrapped.
    enc_in: Option<shroud_core::PooledBuf>,
    /// Wrapped records not yet accepted by the raw endpoint.
    enc_out: Option<shroud_core::PooledBuf>,
    /// Decrypted bytes not yet handed to the application.
    dec_in: Option<shroud_core::PooledBuf>,
    /// Last unwrap could not parse a full record from the buffered input.
    underflown: bool,
    closed_outbound: bool,
    failure: Failure,
    fill_waiter: Option<IoCallback>,
    pending_write: Option<PendingWrite>,
}

/// Work collected under the session lock and dispatched after it drops.
enum Act {
    Run(Box<dyn FnOnce() + Send>),
    NotifySucceeded(HandshakeEvent),
    NotifyFailed(HandshakeEvent, TlsError),
}

impl Act {
    fn succeed(cb: IoCallback) -> Self {
        Act::Run(Box::new(move || cb(Ok(()))))
    }

    fn fail(cb: IoCallback, error: TlsError) -> Self {
        Act::Run(Box::new(move || cb(Err(error))))
    }
}

struct Inner {
    pool: Arc<BufferPool>,
    executor: Arc<dyn Executor>,
    handshake: AtomicU8,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    listeners: Mutex<Vec<Arc<dyn HandshakeListener>>>,
    session: Mutex<Session>,
}

/// TLS interception adapter over a raw byte-stream endpoint.
///
/// Construction takes the encrypted endpoint, the record engine, a shared
/// buffer pool for scratch buffers, and the executor used for every callback
/// and resumption dispatch. The adapter is itself an [`Endpoint`], so
/// adapters stack.
#[derive(Clone)]
pub struct TlsAdapter {
    inner: Arc<Inner>,
}

impl TlsAdapter {
    pub fn new(
        engine: Box<dyn TlsEngine>,
        raw: Box<dyn Endpoint>,
        pool: Arc<BufferPool>,
        executor: Arc<dyn Executor>,
        policy: SessionPolicy,
    ) -> Self {
        let renegotiations_left = policy.renegotiation_limit;
        Self {
            inner: Arc::new(Inner {
                pool,
                executor,
                handshake: AtomicU8::new(HS_INITIAL),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                session: Mutex::new(Session {
                    engine,
                    raw,
                    policy,
                    renegotiations_left,
                    fill_state: FillState::Idle,
                    flush_state: FlushState::Idle,
                    enc_in: None,
                    enc_out: None,
                    dec_in: None,
                    underflown: false,
                    closed_outbound: false,
                    failure: Failure::default(),
                    fill_waiter: None,
                    pending_write: None,
                }),
            }),
        }
    }

    /// Registers a handshake observer.
    pub fn add_handshake_listener(&self, listener: Arc<dyn HandshakeListener>) {
        self.inner.listeners.lock().push(listener);
    }

    /// Current handshake lifecycle state.
    pub fn handshake_state(&self) -> HandshakeState {
        Inner::handshake_state(&self.inner)
    }

    /// Renegotiations still permitted (-1 = unlimited).
    pub fn renegotiations_remaining(&self) -> i64 {
        self.inner.session.lock().renegotiations_left
    }

    /// Byte counters for this session.
    pub fn traffic(&self) -> TrafficStats {
        TrafficStats {
            bytes_in: self.inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.inner.bytes_out.load(Ordering::Relaxed),
        }
    }
}

impl Endpoint for TlsAdapter {
    fn fill(&mut self, dst: &mut [u8]) -> Result<FillResult, TlsError> {
        Inner::with_session(&self.inner, |s, acts| {
            Inner::fill_locked(&self.inner, s, acts, dst)
        })
    }

    fn flush(&mut self, src: &mut dyn Buf) -> Result<bool, TlsError> {
        Inner::with_session(&self.inner, |s, acts| {
            Inner::flush_locked(&self.inner, s, acts, src)
        })
    }

    fn fill_interest(&mut self, cb: IoCallback) {
        Inner::with_session(&self.inner, |s, acts| {
            Inner::fill_interest_locked(&self.inner, s, acts, cb)
        })
    }

    fn write(&mut self, cb: IoCallback, mut src: Box<dyn Buf + Send>) {
        Inner::with_session(&self.inner, |s, acts| {
            if s.pending_write.is_some() {
                acts.push(Act::fail(cb, TlsError::WritePending));
                return;
            }
            match Inner::flush_locked(&self.inner, s, acts, &mut *src) {
                Ok(true) => acts.push(Act::succeed(cb)),
                Ok(false) => {
                    s.pending_write = Some(PendingWrite { src, cb });
                    Inner::on_incomplete_flush(&self.inner, s, acts);
                }
                Err(e) => acts.push(Act::fail(cb, e)),
            }
        })
    }

    fn shutdown_output(&mut self) {
        Inner::with_session(&self.inner, |s, acts| {
            Inner::shutdown_output_locked(&self.inner, s, acts, false)
        })
    }

    fn close(&mut self) {
        Inner::with_session(&self.inner, |s, acts| {
            s.enc_in = None;
            s.dec_in = None;
            Inner::shutdown_output_locked(&self.inner, s, acts, true)
        })
    }

    fn is_input_shutdown(&self) -> bool {
        let session = self.inner.session.lock();
        session.engine.is_inbound_done() || session.raw.is_input_shutdown()
    }

    fn is_output_shutdown(&self) -> bool {
        let session = self.inner.session.lock();
        session.closed_outbound || session.raw.is_output_shutdown()
    }
}

impl Inner {
    /// Runs `f` under the session lock, then dispatches the collected
    /// actions with the lock released.
    fn with_session<R>(
        inner: &Arc<Inner>,
        f: impl FnOnce(&mut Session, &mut Vec<Act>) -> R,
    ) -> R {
        let mut acts = Vec::new();
        let result = {
            let mut session = inner.session.lock();
            f(&mut *session, &mut acts)
        };
        Self::dispatch(inner, acts);
        result
    }

    fn dispatch(inner: &Arc<Inner>, acts: Vec<Act>) {
        for act in acts {
            match act {
                Act::Run(job) => inner.executor.execute(job),
                Act::NotifySucceeded(event) => {
                    let listeners = inner.listeners.lock().clone();
                    for listener in listeners {
                        listener.on_handshake_succeeded(&event);
                    }
                }
                Act::NotifyFailed(event, error) => {
                    let listeners = inner.listeners.lock().clone();
                    for listener in listeners {
                        listener.on_handshake_failed(&event, &error);
                    }
                }
            }
        }
    }

    fn handshake_state(inner: &Arc<Inner>) -> HandshakeState {
        match inner.handshake.load(Ordering::Acquire) {
            HS_INITIAL => HandshakeState::Initial,
            HS_HANDSHAKING => HandshakeState::Handshaking,
            HS_SUCCEEDED => HandshakeState::Succeeded,
            _ => HandshakeState::Failed,
        }
    }

    fn start_handshaking(inner: &Arc<Inner>) {
        if inner
            .handshake
            .compare_exchange(HS_INITIAL, HS_HANDSHAKING, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            debug!("TLS handshake started");
        }
    }

    /// Marks a `Finished` wrap/unwrap result. The first completion moves the
    /// state word to `Succeeded` and notifies listeners exactly once; later
    /// completions are renegotiations and consume the limit.
    fn handshake_succeeded(inner: &Arc<Inner>, s: &mut Session, acts: &mut Vec<Act>) {
        if inner
            .handshake
            .compare_exchange(
                HS_HANDSHAKING,
                HS_SUCCEEDED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            debug!(protocol = ?s.engine.protocol(), "TLS handshake succeeded");
            acts.push(Act::NotifySucceeded(Self::event(s)));
        } else if Self::handshake_state(inner) == HandshakeState::Succeeded {
            if s.renegotiations_left > 0 {
                s.renegotiations_left -= 1;
            }
            debug!(remaining = s.renegotiations_left, "renegotiation completed");
        }
    }

    /// Records an error, moves an in-progress handshake to `Failed` (with a
    /// single listener notification), and fails a writer suspended on the
    /// fill side. Returns the session's first cause.
    fn fail_session(
        inner: &Arc<Inner>,
        s: &mut Session,
        acts: &mut Vec<Act>,
        error: TlsError,
    ) -> TlsError {
        let first = s.failure.record(error);
        let mut state = inner.handshake.load(Ordering::Acquire);
        while state == HS_INITIAL || state == HS_HANDSHAKING {
            match inner.handshake.compare_exchange(
                state,
                HS_FAILED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    warn!(error = %first, "TLS handshake failed");
                    acts.push(Act::NotifyFailed(Self::event(s), first.clone()));
                    break;
                }
                Err(actual) => state = actual,
            }
        }
        if s.flush_state == FlushState::WaitForFill {
            s.flush_state = FlushState::Idle;
            if let Some(write) = s.pending_write.take() {
                acts.push(Act::fail(write.cb, first.clone()));
            }
        }
        first
    }

    fn event(s: &Session) -> HandshakeEvent {
        HandshakeEvent {
            protocol: s.engine.protocol(),
            client: s.engine.is_client(),
        }
    }

    /// True when the engine has re-entered handshake semantics after a
    /// completed handshake. TLS 1.3 has no renegotiation; its post-handshake
    /// messages pass through.
    fn is_renegotiating(inner: &Arc<Inner>, s: &Session) -> bool {
        Self::handshake_state(inner) == HandshakeState::Succeeded
            && s.engine.protocol() != TlsVersion::Tls13
            && !matches!(
                s.engine.handshake_status(),
                HandshakeStatus::NotHandshaking | HandshakeStatus::Finished
            )
    }

    fn renegotiation_allowed(s: &Session) -> bool {
        s.policy.renegotiation_allowed && s.renegotiations_left != 0
    }

    // --- fill ---

    fn fill_locked(
        inner: &Arc<Inner>,
        s: &mut Session,
        acts: &mut Vec<Act>,
        dst: &mut [u8],
    ) -> Result<FillResult, TlsError> {
        if s.fill_state != FillState::Idle {
            return Ok(FillResult::Pending);
        }
        if let Some(first) = s.failure.first() {
            return Err(first.clone());
        }

        let result = match Self::fill_step(inner, s, acts, dst) {
            Err(e) => {
                s.enc_in = None;
                s.dec_in = None;
                Err(Self::fail_session(inner, s, acts, e))
            }
            ok => ok,
        };

        Self::release_empty_buffers(s);
        if s.flush_state == FlushState::WaitForFill {
            s.flush_state = FlushState::Idle;
            Self::schedule_write_resume(inner, acts);
        }
        result
    }

    fn fill_step(
        inner: &Arc<Inner>,
        s: &mut Session,
        acts: &mut Vec<Act>,
        dst: &mut [u8],
    ) -> Result<FillResult, TlsError> {
        s.underflown = false;
        loop {
            // Previously decrypted bytes are served first.
            if let Some(dec) = s.dec_in.as_mut() {
                if !dec.is_empty() {
                    let n = dec.take_into(dst);
                    return Ok(FillResult::Filled(n));
                }
            }

            match s.engine.handshake_status() {
                HandshakeStatus::NeedTask => {
                    s.engine.run_delegated_tasks();
                    continue;
                }
                HandshakeStatus::NeedWrap => {
                    if s.flush_state != FlushState::Idle {
                        return Ok(FillResult::Pending);
                    }
                    let mut empty: &[u8] = &[];
                    if !Self::flush_locked(inner, s, acts, &mut empty)? {
                        return Ok(FillResult::Pending);
                    }
                    continue;
                }
                _ => {}
            }

            if Self::is_renegotiating(inner, s) && !Self::renegotiation_allowed(s) {
                warn!("renegotiation denied by policy; terminating inbound");
                let _ = s.engine.close_inbound();
                return Ok(FillResult::Eof);
            }

            let packet_size = s.engine.packet_buffer_size();
            s.enc_in
                .get_or_insert_with(|| inner.pool.acquire(packet_size, Domain::Heap));

            // Pull encrypted bytes from the raw endpoint.
            let mut net_read: i64 = 0;
            {
                let Session { raw, enc_in, .. } = s;
                if let Some(enc) = enc_in.as_mut() {
                    if enc.space() == 0 {
                        enc.compact();
                    }
                    if enc.space() > 0 {
                        match raw.fill(enc.space_mut())? {
                            FillResult::Filled(n) => {
                                enc.add_filled(n);
                                net_read = n as i64;
                            }
                            FillResult::Pending => {}
                            FillResult::Eof => net_read = -1,
                        }
                    }
                }
            }
            if net_read > 0 {
                inner.bytes_in.fetch_add(net_read as u64, Ordering::Relaxed);
            }
            if net_read < 0
                && Self::handshake_state(inner) == HandshakeState::Initial
                && s.enc_in.as_ref().map(|b| b.is_empty()).unwrap_or(true)
            {
                // Peer closed before any TLS traffic.
                let _ = s.engine.close_inbound();
            }

            let app_size = s.engine.application_buffer_size();
            let to_caller = dst.len() >= app_size;

            Self::start_handshaking(inner);
            let result = {
                let Session {
                    engine,
                    enc_in,
                    dec_in,
                    ..
                } = s;
                let src: &[u8] = enc_in.as_ref().map(|b| b.chunk()).unwrap_or(&[]);
                if to_caller {
                    engine.unwrap(src, dst)?
                } else {
                    let dec = dec_in
                        .get_or_insert_with(|| inner.pool.acquire(app_size, Domain::Heap));
                    engine.unwrap(src, dec.space_mut())?
                }
            };
            trace!(
                status = ?result.status,
                handshake = ?result.handshake,
                consumed = result.consumed,
                produced = result.produced,
                "unwrap"
            );
            if result.consumed > 0 {
                if let Some(enc) = s.enc_in.as_mut() {
                    enc.advance(result.consumed);
                }
            }
            if !to_caller && result.produced > 0 {
                if let Some(dec) = s.dec_in.as_mut() {
                    dec.add_filled(result.produced);
                }
            }
            if result.handshake == HandshakeStatus::Finished {
                Self::handshake_succeeded(inner, s, acts);
            }

            // Some engines report OK for an empty record they made no
            // progress on; treat that as an underflow.
            let status = if result.status == EngineStatus::Ok
                && result.consumed == 0
                && result.produced == 0
            {
                EngineStatus::BufferUnderflow
            } else {
                result.status
            };

            match status {
                EngineStatus::Closed => {
                    if let Some(first) = s.failure.first() {
                        return Err(first.clone());
                    }
                    return Ok(FillResult::Eof);
                }
                EngineStatus::BufferUnderflow => {
                    let mut full = false;
                    let mut capacity = 0;
                    if let Some(enc) = s.enc_in.as_mut() {
                        enc.compact();
                        full = enc.is_full();
                        capacity = enc.capacity();
                    }
                    if full {
                        let grown = s.engine.packet_buffer_size();
                        if grown > capacity {
                            // The engine raised its record ceiling; move the
                            // partial record into a larger buffer and retry.
                            let mut larger = inner.pool.acquire(grown, Domain::Heap);
                            if let Some(old) = s.enc_in.take() {
                                larger.append(old.chunk());
                            }
                            s.enc_in = Some(larger);
                            continue;
                        }
                        return Err(TlsError::EncryptedOverflow(capacity));
                    }
                    if net_read > 0 {
                        continue;
                    }
                    if net_read < 0 {
                        return Self::inbound_ended(inner, s);
                    }
                    s.underflown = true;
                    return Ok(FillResult::Pending);
                }
                EngineStatus::BufferOverflow => {
                    let app_now = s.engine.application_buffer_size();
                    if !to_caller {
                        let dec_capacity =
                            s.dec_in.as_ref().map(|b| b.capacity()).unwrap_or(0);
                        if app_now > dec_capacity {
                            // Session size grew; re-acquire a larger buffer.
                            s.dec_in = None;
                            continue;
                        }
                    } else if app_now > dst.len() {
                        // The caller's buffer no longer fits a record; route
                        // the next attempt through owned scratch.
                        continue;
                    }
                    return Err(TlsError::Engine("unwrap buffer overflow".into()));
                }
                EngineStatus::Ok => {
                    if result.produced > 0 {
                        if to_caller {
                            return Ok(FillResult::Filled(result.produced));
                        }
                        let n = s.dec_in.as_mut().map(|d| d.take_into(dst)).unwrap_or(0);
                        return Ok(FillResult::Filled(n));
                    }
                    // Handshake-level progress only; go around again.
                }
            }
        }
    }

    /// Raw endpoint reported end-of-stream mid-record or between records.
    fn inbound_ended(inner: &Arc<Inner>, s: &mut Session) -> Result<FillResult, TlsError> {
        let during_handshake = matches!(
            Self::handshake_state(inner),
            HandshakeState::Initial | HandshakeState::Handshaking
        );
        let _ = s.engine.close_inbound();
        if s.policy.require_close_notify {
            if during_handshake {
                return Err(TlsError::AbruptClose);
            }
            return Err(TlsError::Truncated);
        }
        Ok(FillResult::Eof)
    }

    fn release_empty_buffers(s: &mut Session) {
        if s.enc_in.as_ref().map(|b| b.is_empty()).unwrap_or(false) {
            s.enc_in = None;
        }
        if s.dec_in.as_ref().map(|b| b.is_empty()).unwrap_or(false) {
            s.dec_in = None;
        }
    }

    // --- flush ---

    fn flush_locked(
        inner: &Arc<Inner>,
        s: &mut Session,
        acts: &mut Vec<Act>,
        src: &mut dyn Buf,
    ) -> Result<bool, TlsError> {
        if s.flush_state != FlushState::Idle {
            return Ok(false);
        }
        if let Some(first) = s.failure.first() {
            return Err(first.clone());
        }
        if s.closed_outbound && src.has_remaining() {
            return Err(TlsError::Closed);
        }

        match Self::flush_step(inner, s, acts, src) {
            Err(e) => {
                s.enc_out = None;
                Err(Self::fail_session(inner, s, acts, e))
            }
            ok => ok,
        }
    }

    fn flush_step(
        inner: &Arc<Inner>,
        s: &mut Session,
        acts: &mut Vec<Act>,
        src: &mut dyn Buf,
    ) -> Result<bool, TlsError> {
        // Records wrapped earlier must reach the wire before new ones.
        if !Self::flush_pending_encrypted(s)? {
            return Ok(false);
        }

        loop {
            match s.engine.handshake_status() {
                HandshakeStatus::NeedTask => {
                    s.engine.run_delegated_tasks();
                    continue;
                }
                HandshakeStatus::NeedUnwrap => {
                    if s.fill_state == FillState::Idle {
                        let filled = Self::fill_locked(inner, s, acts, &mut [])?;
                        if s.engine.handshake_status() != HandshakeStatus::NeedUnwrap {
                            continue;
                        }
                        if filled == FillResult::Eof {
                            return Err(TlsError::BrokenPipe);
                        }
                    }
                    return Ok(!src.has_remaining() && s.enc_out.is_none());
                }
                _ => {}
            }

            if Self::is_renegotiating(inner, s) && !Self::renegotiation_allowed(s) {
                warn!("renegotiation denied by policy");
                return Err(TlsError::RenegotiationDenied);
            }

            let packet_size = s.engine.packet_buffer_size();
            Self::start_handshaking(inner);
            let result = {
                let Session { engine, enc_out, .. } = s;
                let out = enc_out
                    .get_or_insert_with(|| inner.pool.acquire(packet_size, Domain::Heap));
                engine.wrap(src.chunk(), out.space_mut())?
            };
            trace!(
                status = ?result.status,
                handshake = ?result.handshake,
                consumed = result.consumed,
                produced = result.produced,
                "wrap"
            );
            src.advance(result.consumed);
            if result.produced > 0 {
                if let Some(out) = s.enc_out.as_mut() {
                    out.add_filled(result.produced);
                }
                inner
                    .bytes_out
                    .fetch_add(result.produced as u64, Ordering::Relaxed);
            }
            if result.handshake == HandshakeStatus::Finished {
                Self::handshake_succeeded(inner, s, acts);
            }

            let drained = Self::flush_pending_encrypted(s)?;

            match result.status {
                EngineStatus::Closed => {
                    if !drained {
                        return Ok(false);
                    }
                    s.raw.shutdown_output();
                    if !src.has_remaining() {
                        return Ok(true);
                    }
                    return Err(TlsError::Closed);
                }
                EngineStatus::BufferOverflow => {
                    let out_empty =
                        s.enc_out.as_ref().map(|b| b.is_empty()).unwrap_or(true);
                    let capacity = s.enc_out.as_ref().map(|b| b.capacity()).unwrap_or(0);
                    if out_empty && s.engine.packet_buffer_size() > capacity {
                        s.enc_out = None;
                        continue;
                    }
                    if !drained {
                        return Ok(false);
                    }
                    return Err(TlsError::Engine("wrap buffer overflow".into()));
                }
                EngineStatus::BufferUnderflow => {
                    return Err(TlsError::Engine("unexpected underflow from wrap".into()));
                }
                EngineStatus::Ok => {
                    if !drained {
                        return Ok(false);
                    }
                    if !src.has_remaining()
                        && s.engine.handshake_status() != HandshakeStatus::NeedWrap
                    {
                        return Ok(true);
                    }
                    if result.consumed == 0
                        && result.produced == 0
                        && src.has_remaining()
                        && s.engine.handshake_status() == HandshakeStatus::NotHandshaking
                    {
                        return Err(TlsError::Engine("wrap made no progress".into()));
                    }
                }
            }
        }
    }

    /// Pushes buffered encrypted output to the raw endpoint. Returns true
    /// when nothing remains buffered; the buffer is released once empty.
    fn flush_pending_encrypted(s: &mut Session) -> Result<bool, TlsError> {
        let drained = {
            let Session { raw, enc_out, .. } = s;
            match enc_out.as_mut() {
                None => true,
                Some(out) => {
                    if !out.is_empty() {
                        raw.flush(out)?;
                    }
                    out.is_empty()
                }
            }
        };
        if drained {
            s.enc_out = None;
        }
        Ok(drained)
    }

    // --- suspension protocol ---

    fn fill_interest_locked(
        inner: &Arc<Inner>,
        s: &mut Session,
        acts: &mut Vec<Act>,
        cb: IoCallback,
    ) {
        if s.fill_state != FillState::Idle || s.fill_waiter.is_some() {
            acts.push(Act::fail(cb, TlsError::ReadPending));
            return;
        }
        if let Some(first) = s.failure.first() {
            acts.push(Act::fail(cb, first.clone()));
            return;
        }

        let fillable = s.dec_in.as_ref().map(|b| !b.is_empty()).unwrap_or(false)
            || (!s.underflown
                && s.enc_in.as_ref().map(|b| !b.is_empty()).unwrap_or(false));
        let status = s.engine.handshake_status();
        if fillable || status == HandshakeStatus::NeedTask {
            acts.push(Act::succeed(cb));
            return;
        }

        match status {
            HandshakeStatus::NeedWrap => {
                trace!("fill interest parked behind flush");
                s.fill_state = FillState::WaitForFlush;
                s.fill_waiter = Some(cb);
                if s.flush_state == FlushState::Idle {
                    Self::start_raw_write(inner, s);
                }
            }
            _ => {
                trace!("fill interest parked on raw endpoint");
                s.fill_state = FillState::Interested;
                s.fill_waiter = Some(cb);
                let residue = s.enc_out.as_ref().map(|b| !b.is_empty()).unwrap_or(false);
                if s.flush_state == FlushState::Idle && residue {
                    Self::start_raw_write(inner, s);
                } else if s.flush_state != FlushState::Writing {
                    Self::arm_raw_fill_interest(inner, s);
                }
            }
        }
    }

    /// Routes an active write that could not complete. Never called with a
    /// raw write already in flight.
    fn on_incomplete_flush(inner: &Arc<Inner>, s: &mut Session, acts: &mut Vec<Act>) {
        if s.flush_state != FlushState::Idle {
            return;
        }
        loop {
            match s.engine.handshake_status() {
                HandshakeStatus::NeedUnwrap => {
                    if s.enc_out.as_ref().map(|b| !b.is_empty()).unwrap_or(false) {
                        Self::start_raw_write(inner, s);
                        return;
                    }
                    if s.fill_state != FillState::Idle {
                        s.flush_state = FlushState::WaitForFill;
                        return;
                    }
                    let filled = match Self::fill_locked(inner, s, acts, &mut []) {
                        Ok(filled) => filled,
                        Err(e) => {
                            if let Some(write) = s.pending_write.take() {
                                acts.push(Act::fail(write.cb, e));
                            }
                            return;
                        }
                    };
                    if s.engine.handshake_status() != HandshakeStatus::NeedUnwrap {
                        continue;
                    }
                    if filled == FillResult::Eof {
                        let first = s.failure.record(TlsError::BrokenPipe);
                        if let Some(write) = s.pending_write.take() {
                            acts.push(Act::fail(write.cb, first));
                        }
                        return;
                    }
                    Self::arm_raw_fill_interest(inner, s);
                    s.fill_state = FillState::Interested;
                    s.flush_state = FlushState::WaitForFill;
                    return;
                }
                _ => {
                    Self::start_raw_write(inner, s);
                    return;
                }
            }
        }
    }

    /// Starts the session's single raw write: buffered encrypted output if
    /// any, else an empty write that reschedules on completion.
    fn start_raw_write(inner: &Arc<Inner>, s: &mut Session) {
        debug_assert_eq!(s.flush_state, FlushState::Idle);
        let src: Box<dyn Buf + Send> = match s.enc_out.take() {
            Some(out) if !out.is_empty() => Box::new(out),
            _ => Box::new(Bytes::new()),
        };
        s.flush_state = FlushState::Writing;
        let weak = Arc::downgrade(inner);
        s.raw.write(
            Box::new(move |result| {
                if let Some(inner) = weak.upgrade() {
                    let target = Arc::clone(&inner);
                    inner.executor.execute(Box::new(move || {
                        Inner::on_raw_write_complete(&target, result)
                    }));
                }
            }),
            src,
        );
    }

    fn arm_raw_fill_interest(inner: &Arc<Inner>, s: &mut Session) {
        let weak = Arc::downgrade(inner);
        s.raw.fill_interest(Box::new(move |result| {
            if let Some(inner) = weak.upgrade() {
                let target = Arc::clone(&inner);
                inner
                    .executor
                    .execute(Box::new(move || Inner::on_raw_fill_ready(&target, result)));
            }
        }));
    }

    fn on_raw_fill_ready(inner: &Arc<Inner>, result: Result<(), TlsError>) {
        Self::with_session(inner, |s, acts| match result {
            Ok(()) => {
                trace!("raw endpoint fillable");
                if s.fill_state == FillState::Interested {
                    s.fill_state = FillState::Idle;
                }
                if let Some(cb) = s.fill_waiter.take() {
                    acts.push(Act::succeed(cb));
                }
                if s.flush_state == FlushState::WaitForFill {
                    s.flush_state = FlushState::Idle;
                    Self::schedule_write_resume(inner, acts);
                }
            }
            Err(e) => {
                s.fill_state = FillState::Idle;
                let first = Self::fail_session(inner, s, acts, e);
                if let Some(cb) = s.fill_waiter.take() {
                    acts.push(Act::fail(cb, first));
                }
            }
        })
    }

    fn on_raw_write_complete(inner: &Arc<Inner>, result: Result<(), TlsError>) {
        Self::with_session(inner, |s, acts| match result {
            Ok(()) => {
                trace!("raw write complete");
                s.flush_state = FlushState::Idle;
                if s.closed_outbound && !s.raw.is_output_shutdown() {
                    s.raw.shutdown_output();
                }
                match s.fill_state {
                    FillState::Interested => Self::arm_raw_fill_interest(inner, s),
                    FillState::WaitForFlush => {
                        s.fill_state = FillState::Idle;
                        if let Some(cb) = s.fill_waiter.take() {
                            acts.push(Act::succeed(cb));
                        }
                    }
                    FillState::Idle => {}
                }
                Self::schedule_write_resume(inner, acts);
            }
            Err(e) => {
                s.enc_out = None;
                s.fill_state = FillState::Idle;
                s.flush_state = FlushState::Idle;
                let first = Self::fail_session(inner, s, acts, e);
                if let Some(cb) = s.fill_waiter.take() {
                    acts.push(Act::fail(cb, first.clone()));
                }
                if let Some(write) = s.pending_write.take() {
                    acts.push(Act::fail(write.cb, first));
                }
                if s.closed_outbound {
                    s.raw.close();
                }
            }
        })
    }

    /// Queues a task that retries the suspended application write.
    fn schedule_write_resume(inner: &Arc<Inner>, acts: &mut Vec<Act>) {
        let weak = Arc::downgrade(inner);
        acts.push(Act::Run(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                Inner::resume_write(&inner);
            }
        })));
    }

    fn resume_write(inner: &Arc<Inner>) {
        Self::with_session(inner, |s, acts| {
            let Some(mut write) = s.pending_write.take() else {
                return;
            };
            match Self::flush_locked(inner, s, acts, &mut *write.src) {
                Ok(true) => acts.push(Act::succeed(write.cb)),
                Ok(false) => {
                    s.pending_write = Some(write);
                    Self::on_incomplete_flush(inner, s, acts);
                }
                Err(e) => acts.push(Act::fail(write.cb, e)),
            }
        })
    }

    // --- shutdown ---

    fn shutdown_output_locked(
        inner: &Arc<Inner>,
        s: &mut Session,
        acts: &mut Vec<Act>,
        close: bool,
    ) {
        if !s.closed_outbound {
            s.closed_outbound = true;
            debug!(close, "sending close-notify");
            s.engine.close_outbound();
            let mut empty: &[u8] = &[];
            let flushed = match Self::flush_locked(inner, s, acts, &mut empty) {
                Ok(done) => done,
                Err(e) => {
                    debug!(error = %e, "close-notify flush failed");
                    true
                }
            };
            if !flushed && !close && s.flush_state == FlushState::Idle {
                // Push the remaining close-notify bytes in the background;
                // completion half-closes the raw endpoint.
                Self::start_raw_write(inner, s);
            }
        }
        if close {
            s.raw.close();
        } else if s.flush_state == FlushState::Idle && !s.raw.is_output_shutdown() {
            s.raw.shutdown_output();
        }
    }
}

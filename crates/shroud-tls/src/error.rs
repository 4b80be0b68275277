//! Error types for the TLS stream adapter

use thiserror::Error;

/// Failures surfaced by the adapter and its collaborators.
///
/// Transient back-pressure is never an error: it is reported as `Pending`/
/// `false` returns from fill and flush. Everything here is terminal for the
/// operation that raised it, and most variants are terminal for the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("renegotiation denied")]
    RenegotiationDenied,

    #[error("broken pipe")]
    BrokenPipe,

    #[error("closed abruptly by peer during handshake")]
    AbruptClose,

    #[error("inbound closed without close-notify")]
    Truncated,

    #[error("encrypted buffer max length exceeded ({0} bytes)")]
    EncryptedOverflow(usize),

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("stream closed")]
    Closed,

    #[error("fill interest already registered")]
    ReadPending,

    #[error("write already in progress")]
    WritePending,
}

/// First-failure accumulator.
///
/// The first error recorded for a session wins; later errors are kept as a
/// suppressed chain. Every terminal path reports the first cause.
#[derive(Debug, Default)]
pub struct Failure {
    first: Option<TlsError>,
    suppressed: Vec<TlsError>,
}

impl Failure {
    /// Records an error and returns the session's first cause.
    pub fn record(&mut self, error: TlsError) -> TlsError {
        match &self.first {
            Some(first) => {
                if *first != error {
                    self.suppressed.push(error);
                }
                first.clone()
            }
            None => {
                self.first = Some(error.clone());
                error
            }
        }
    }

    /// The first cause, if any error has been recorded.
    pub fn first(&self) -> Option<&TlsError> {
        self.first.as_ref()
    }

    /// Errors recorded after the first cause.
    pub fn suppressed(&self) -> &[TlsError] {
        &self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failure_wins() {
        let mut failure = Failure::default();
        assert_eq!(
            failure.record(TlsError::BrokenPipe),
            TlsError::BrokenPipe
        );
        assert_eq!(
            failure.record(TlsError::Engine("late".into())),
            TlsError::BrokenPipe
        );
        assert_eq!(failure.first(), Some(&TlsError::BrokenPipe));
        assert_eq!(failure.suppressed(), &[TlsError::Engine("late".into())]);
    }

    #[test]
    fn test_duplicate_error_not_suppressed() {
        let mut failure = Failure::default();
        failure.record(TlsError::BrokenPipe);
        failure.record(TlsError::BrokenPipe);
        assert!(failure.suppressed().is_empty());
    }
}

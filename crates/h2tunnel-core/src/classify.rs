//! Decides how a failed tunnel is torn down

use h2tunnel_transport::TransportError;
use std::error::Error;
use std::io;

/// How to close the client connection after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerdict {
    /// Ordinary termination, close with FIN
    Benign,
    /// The upstream stream broke; close with RST so the client cannot mistake
    /// a truncated exchange for a completed one
    ForceReset,
}

impl ErrorVerdict {
    pub fn is_force_reset(self) -> bool {
        self == ErrorVerdict::ForceReset
    }
}

/// Classify an error from the upstream direction.
///
/// Only the error itself and one level of wrapping (the inner error of an
/// `io::Error`, otherwise `Error::source`) are inspected. A protocol-fatal
/// transport error wrapped twice is classified as `Benign`.
pub fn classify(err: &(dyn Error + 'static)) -> ErrorVerdict {
    if is_protocol_fatal(err) {
        return ErrorVerdict::ForceReset;
    }

    let inner: Option<&(dyn Error + 'static)> = match err.downcast_ref::<io::Error>() {
        Some(io_err) => io_err.get_ref().map(|e| e as &(dyn Error + 'static)),
        None => err.source(),
    };

    match inner {
        Some(inner) if is_protocol_fatal(inner) => ErrorVerdict::ForceReset,
        _ => ErrorVerdict::Benign,
    }
}

fn is_protocol_fatal(err: &(dyn Error + 'static)) -> bool {
    err.downcast_ref::<TransportError>()
        .is_some_and(TransportError::is_protocol_fatal)
}

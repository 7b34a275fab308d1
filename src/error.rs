//! Error types for the serial streaming link.
//!
//! The taxonomy follows how failures are actually handled:
//!
//! - Port-open failures are recovered locally while probing (a port that
//!   cannot be opened is simply not the device we are looking for) and are
//!   only surfaced as errors from an explicit [`connect`] call.
//! - A zero-byte read or a read timeout while streaming is terminal for the
//!   session; the decode loop closes the port and reports [`Disconnected`]
//!   or [`Timeout`].
//! - Malformed frames never produce an error at all; the decoder resyncs
//!   silently.
//!
//! [`connect`]: crate::link::SerialLink::connect
//! [`Disconnected`]: LinkError::Disconnected
//! [`Timeout`]: LinkError::Timeout

use thiserror::Error;

/// Primary error type for the link driver.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The serial endpoint could not be opened (busy, missing, permissions).
    #[error("failed to open port {port}: {source}")]
    PortOpen {
        /// Endpoint name as reported by the enumerator.
        port: String,
        /// Underlying OS-level open failure.
        #[source]
        source: std::io::Error,
    },

    /// No endpoint has been discovered yet; run discovery first.
    #[error("no endpoint discovered")]
    NoEndpoint,

    /// Operation requires an open connection.
    #[error("device is not connected")]
    NotConnected,

    /// The stream returned zero bytes: the device was unplugged or closed
    /// the link.
    #[error("stream closed by device")]
    Disconnected,

    /// A bounded read expired without delivering any data.
    #[error("serial read timed out")]
    Timeout,

    /// Any other I/O failure on the transport.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

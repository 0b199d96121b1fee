//! The transport seam between the protocol stack and the wire.
//!
//! Two implementations exist: a reconnecting TCP stream speaking the
//! byte-stuffed gateway framing, and a raw Linux SocketCAN channel. Both
//! own one reader thread that feeds decoded frames into a handler supplied
//! at construction, and both accept sends from any thread.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::frame::{CanFrame, FrameError};

/// Invoked on the reader thread for every inbound frame.
pub type FrameHandler = Box<dyn Fn(CanFrame) + Send + Sync>;

/// How long a dial may take before it is reported as failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking reads wake up at this interval to check for shutdown.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between reconnect attempts after the channel drops.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is not connected.")]
    NotConnected,
    #[error("Failed to reach the remote endpoint.")]
    Connect(#[source] io::Error),
    #[error("I/O failure on the transport channel.")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A CAN connection.
///
/// Exactly one reader produces inbound frames; any number of threads may
/// send, with writes serialized internally. `close` is a permanent
/// teardown that joins the reader.
pub trait Transport: Send + Sync {
    /// Establishes the underlying channel. Transient failures are
    /// recoverable; the caller may retry.
    fn connect(&self) -> Result<(), TransportError>;

    /// Serializes and transmits one frame. Fails with
    /// [`TransportError::NotConnected`] when the channel is down; an I/O
    /// failure marks the transport disconnected before it is re-raised.
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Permanent teardown. After return no further handler callbacks are
    /// invoked.
    fn close(&self);
}

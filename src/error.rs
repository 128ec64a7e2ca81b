//! Error types returned by channel operations.
//!
//! Unlike the rest of this crate there is no single catch-all `Error` type
//! here: each operation has its own small, closed error enum, the same way
//! [`std::sync::mpsc`] does it. A channel only ever fails in one of two
//! ways: the operation timed out, or the channel is permanently
//! disconnected.

use std::fmt;

/// The channel is closed and no further values will ever arrive/be
/// delivered on it.
///
/// This is the structural failure mode of the channel: raised by `send`
/// always when the channel has no live receivers, and by `receive` when
/// no value is ever coming.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Disconnected;

impl fmt::Display for Disconnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel is closed")
    }
}

impl std::error::Error for Disconnected {}

/// Error returned by [`Channel::send_timeout`](crate::Channel::send_timeout).
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum SendError<T> {
    /// The operation timed out before a receiver or buffer slot became
    /// available. The value is handed back so the caller can reuse it.
    #[error("send timed out")]
    Timeout(T),
    /// The channel has no live receivers. The value is handed back so the
    /// caller can reuse it.
    #[error("sending on a closed channel")]
    Disconnected(T),
}

impl<T> SendError<T> {
    /// Returns the value that failed to send, discarding the distinction
    /// between a timeout and a disconnect.
    pub fn into_inner(self) -> T {
        match self {
            Self::Timeout(t) | Self::Disconnected(t) => t,
        }
    }
}

/// Error returned by [`Channel::try_send`](crate::Channel::try_send).
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum TrySendError<T> {
    /// The channel has no free buffer slot and no receiver is ready.
    #[error("channel full")]
    Full(T),
    /// The channel has no live receivers.
    #[error("sending on a closed channel")]
    Disconnected(T),
}

impl<T> TrySendError<T> {
    /// Returns the value that failed to send, discarding the distinction
    /// between "full" and "disconnected".
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) | Self::Disconnected(t) => t,
        }
    }
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(e: SendError<T>) -> Self {
        match e {
            SendError::Disconnected(t) => Self::Disconnected(t),
            SendError::Timeout(t) => Self::Full(t),
        }
    }
}

/// Error returned by [`Channel::recv_timeout`](crate::Channel::recv_timeout).
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum RecvError {
    /// No value became available before the deadline.
    #[error("recv timed out")]
    Timeout,
    /// The channel is closed and its buffer (if any) is drained.
    #[error("receiving on a closed channel")]
    Disconnected,
}

/// Error returned by [`Channel::try_recv`](crate::Channel::try_recv).
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum TryRecvError {
    /// No value is immediately available.
    #[error("channel empty")]
    Empty,
    /// The channel is closed and its buffer (if any) is drained.
    #[error("receiving on a closed channel")]
    Disconnected,
}

impl From<RecvError> for TryRecvError {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::Disconnected => Self::Disconnected,
            RecvError::Timeout => Self::Empty,
        }
    }
}

//! Typed channels and multi-way `select` for cooperative fibers.
//!
//! With this crate, fibers can:
//! - exchange values of a fixed element type `T` through a [`Channel`]
//!   without shared mutable memory (see [`channel`]),
//! - wait on a heterogeneous set of pending send/receive operations across
//!   several channels at once via [`select`] (see [`select`](mod@select)).
//!
//! The channel itself only depends on two external collaborators: an
//! abstract mutex (see [`lock`]) and a scheduler hook for parking/resuming
//! the current fiber (see [`fiber`]). The only scheduler-hook
//! implementation shipped by this crate is thread-per-fiber: one OS thread
//! plays the role of one fiber. See [`fiber`] for details.
//!
//! ### Features
//!
//! - `multi-thread` (enabled by default) - backs every channel's internal
//!   lock with a real spin-lock, safe to use from multiple OS threads at
//!   once. Disabling it reduces the lock to a zero-cost no-op, appropriate
//!   only for a single-threaded build where every fiber runs on the same
//!   OS thread.
//!
//! ### Example
//!
//! ```
//! use fiber_channel::Channel;
//!
//! let ch = Channel::new(0);
//! let rx = ch.clone();
//! let t = std::thread::spawn(move || rx.receive());
//! ch.send(42).unwrap();
//! assert_eq!(t.join().unwrap(), Ok(42));
//! ```

pub mod channel;
pub mod error;
pub mod fiber;
pub mod lock;
pub mod select;

pub use channel::Channel;
pub use error::{Disconnected, RecvError, SendError, TryRecvError, TrySendError};
pub use select::{receive_first, select, send_first, ErasedAction, ReceiveAction, SendAction};

/// A specialized [`Result`](std::result::Result) type threaded through
/// most of this crate's public API.
pub type StdResult<T, E> = std::result::Result<T, E>;

//! The channel core.
//!
//! [`Channel<T>`] owns a capacity, a closed flag, an optional bounded
//! buffer, and two FIFO wait queues (blocked senders, blocked receivers),
//! all guarded by one [`Mutex`](crate::lock::Mutex). `send`/`receive` take
//! the fast path (rendezvous with a waiting peer, or a buffered transfer)
//! whenever possible; otherwise the calling fiber enqueues itself and
//! parks.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RecvError, SendError, TryRecvError, TrySendError};
use crate::fiber::{self, FiberHandle};
use crate::lock::Mutex;
use crate::select::SelectShared;

////////////////////////////////////////////////////////////////////////////////
// Packet
////////////////////////////////////////////////////////////////////////////////

const PENDING: u8 = 0;
const DELIVERED: u8 = 1;
const CLOSED: u8 = 2;

/// A write-once transfer cell, heap-allocated so a sender's thread can
/// deliver into a parked receiver's slot, or a `close()` can hand an
/// undelivered value back to its sender, without either side outliving
/// the other's call frame.
pub(crate) struct Packet<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: all access to `value` is gated by the `state` atomic: the writer
// performs a `Release` store after writing, the reader performs an
// `Acquire` load before reading, so there is never a concurrent access.
unsafe impl<T: Send> Send for Packet<T> {}
unsafe impl<T: Send> Sync for Packet<T> {}

impl<T> Packet<T> {
    /// An empty slot, to be filled by whoever delivers to this receiver.
    pub(crate) fn empty() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            value: UnsafeCell::new(None),
        }
    }

    /// A slot already holding a sender's value, to be taken by whoever
    /// delivers it to a receiver (or handed back if the channel closes
    /// first).
    pub(crate) fn holding(value: T) -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            value: UnsafeCell::new(Some(value)),
        }
    }

    /// Writes `value` into the slot and marks it delivered. Called by the
    /// fiber completing the matching operation.
    pub(crate) fn deliver(&self, value: T) {
        unsafe {
            *self.value.get() = Some(value);
        }
        self.state.store(DELIVERED, Ordering::Release);
    }

    /// Marks the slot closed without delivering anything.
    pub(crate) fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }

    /// Marks a slot already [`holding`](Self::holding) a value as delivered,
    /// without touching the value itself. Used when the *taker* of a
    /// sender's value (a direct rendezvous or a buffered hand-off) has
    /// already moved the value out with [`take_value`](Self::take_value)
    /// and now just needs to tell the parked sender its send completed.
    pub(crate) fn mark_delivered(&self) {
        self.state.store(DELIVERED, Ordering::Release);
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    pub(crate) fn is_delivered(&self) -> bool {
        self.state.load(Ordering::Acquire) == DELIVERED
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    /// Takes the value out of the slot. Valid once the slot is
    /// [`delivered`](Self::deliver) (a receiver reading its own filled
    /// slot, or a deliverer lifting a sender's held value out before
    /// marking it delivered) or once it was populated but never delivered
    /// (a sender reclaiming its value after [`mark_closed`](Self::mark_closed)).
    pub(crate) fn take_value(&self) -> T {
        unsafe { (*self.value.get()).take() }.expect("packet value taken twice or never set")
    }
}

////////////////////////////////////////////////////////////////////////////////
// Waiters
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct SenderWaiter<T> {
    pub(crate) handle: FiberHandle,
    pub(crate) packet: Arc<Packet<T>>,
    pub(crate) select: Option<Arc<SelectShared>>,
}

pub(crate) struct ReceiverWaiter<T> {
    pub(crate) handle: FiberHandle,
    pub(crate) packet: Arc<Packet<T>>,
    pub(crate) select: Option<Arc<SelectShared>>,
}

/// A waiter belonging to a `select` contends for the shared activation
/// token before it may be dequeued. A plain (non-select) waiter has no
/// contention: it always wins.
fn try_activate(select: &Option<Arc<SelectShared>>) -> bool {
    match select {
        Some(shared) => shared.try_trigger(),
        None => true,
    }
}

////////////////////////////////////////////////////////////////////////////////
// ChannelState
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct ChannelState<T> {
    pub(crate) capacity: usize,
    pub(crate) closed: bool,
    pub(crate) buffer: VecDeque<T>,
    pub(crate) senders: VecDeque<SenderWaiter<T>>,
    pub(crate) receivers: VecDeque<ReceiverWaiter<T>>,
}

impl<T> ChannelState<T> {
    fn dequeue_receiver(&mut self) -> Option<ReceiverWaiter<T>> {
        while let Some(w) = self.receivers.pop_front() {
            if try_activate(&w.select) {
                return Some(w);
            }
            log::trace!("select loser dropped from receivers queue during dequeue");
        }
        None
    }

    fn dequeue_sender(&mut self) -> Option<SenderWaiter<T>> {
        while let Some(w) = self.senders.pop_front() {
            if try_activate(&w.select) {
                return Some(w);
            }
            log::trace!("select loser dropped from senders queue during dequeue");
        }
        None
    }
}

/// Non-blocking fast path for `send`: rendezvous with a waiting receiver,
/// or append to the buffer if there's room. Returns the value back if
/// neither is possible.
pub(crate) fn send_internal<T>(state: &mut ChannelState<T>, value: T) -> Result<(), T> {
    if let Some(w) = state.dequeue_receiver() {
        w.packet.deliver(value);
        w.handle.restore();
        return Ok(());
    }
    if state.capacity > 0 && state.buffer.len() < state.capacity {
        state.buffer.push_back(value);
        return Ok(());
    }
    Err(value)
}

/// Non-blocking fast path for `receive`: drain the buffer (unblocking a
/// queued sender into the freed slot), or rendezvous directly with a
/// waiting sender.
pub(crate) fn receive_internal<T>(state: &mut ChannelState<T>) -> Option<T> {
    if state.capacity > 0 {
        if let Some(v) = state.buffer.pop_front() {
            if let Some(w) = state.dequeue_sender() {
                state.buffer.push_back(w.packet.take_value());
                w.packet.mark_delivered();
                w.handle.restore();
            }
            return Some(v);
        }
    }
    if let Some(w) = state.dequeue_sender() {
        let v = w.packet.take_value();
        w.packet.mark_delivered();
        w.handle.restore();
        return Some(v);
    }
    None
}

pub(crate) fn remove_receiver_by_packet<T>(
    queue: &mut VecDeque<ReceiverWaiter<T>>,
    packet: &Arc<Packet<T>>,
) -> bool {
    if let Some(pos) = queue.iter().position(|w| Arc::ptr_eq(&w.packet, packet)) {
        queue.remove(pos);
        true
    } else {
        false
    }
}

pub(crate) fn remove_sender_by_packet<T>(
    queue: &mut VecDeque<SenderWaiter<T>>,
    packet: &Arc<Packet<T>>,
) -> bool {
    if let Some(pos) = queue.iter().position(|w| Arc::ptr_eq(&w.packet, packet)) {
        queue.remove(pos);
        true
    } else {
        false
    }
}

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

struct Inner<T> {
    mutex: Mutex<ChannelState<T>>,
}

/// A typed channel between fibers.
///
/// `Channel::new(0)` is unbuffered (rendezvous-only); `Channel::new(n)` for
/// `n > 0` buffers up to `n` values. Cloning a `Channel` yields another
/// handle to the same underlying channel — send on one clone, receive on
/// another.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Channel<T> {
    /// Creates a new channel with the given buffer capacity (`0` for an
    /// unbuffered, rendezvous-only channel).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                mutex: Mutex::new(ChannelState {
                    capacity,
                    closed: false,
                    buffer: VecDeque::with_capacity(capacity.min(64)),
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                }),
            }),
        }
    }

    pub(crate) fn raw_mutex(&self) -> &Mutex<ChannelState<T>> {
        &self.inner.mutex
    }

    /// Whether this channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.mutex.lock().closed
    }

    /// Closes the channel. Idempotent: closing an already-closed channel is
    /// a no-op.
    ///
    /// Every fiber currently parked in `send` is woken without a transfer
    /// (it will observe the channel closed and return
    /// [`SendError::Disconnected`]); every fiber parked in `receive` is
    /// woken with [`RecvError::Disconnected`]. Values already in the
    /// buffer are *not* discarded — a subsequent `receive` still drains
    /// them before reporting closed.
    pub fn close(&self) {
        let mut state = self.inner.mutex.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for w in state.senders.drain(..) {
            if try_activate(&w.select) {
                w.packet.mark_closed();
                w.handle.restore();
            }
        }
        for w in state.receivers.drain(..) {
            if try_activate(&w.select) {
                w.packet.mark_closed();
                w.handle.restore();
            }
        }
        log::debug!("channel closed, {} buffered value(s) remain", state.buffer.len());
    }

    /// Sends `v`, blocking the current fiber until a receiver is ready, a
    /// buffer slot frees up, or the channel closes.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.send_impl(value, None)
    }

    /// Like [`send`](Self::send), but gives up after `timeout`.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendError<T>> {
        self.send_impl(value, Some(Instant::now() + timeout))
    }

    /// Sends `v` only if it can be done without blocking.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.send_impl(value, Some(Instant::now())).map_err(Into::into)
    }

    fn send_impl(&self, mut value: T, deadline: Option<Instant>) -> Result<(), SendError<T>> {
        let packet = {
            let mut state = self.inner.mutex.lock();
            if state.closed {
                return Err(SendError::Disconnected(value));
            }
            match send_internal(&mut state, value) {
                Ok(()) => return Ok(()),
                Err(v) => value = v,
            }
            if matches!(deadline, Some(d) if Instant::now() >= d) {
                return Err(SendError::Timeout(value));
            }
            let packet = Arc::new(Packet::holding(value));
            state.senders.push_back(SenderWaiter {
                handle: fiber::current(),
                packet: Arc::clone(&packet),
                select: None,
            });
            packet
            // lock released here, before parking
        };

        loop {
            match deadline {
                None => fiber::reschedule(),
                Some(d) => {
                    fiber::reschedule_timeout(d.saturating_duration_since(Instant::now()));
                }
            }
            if packet.is_delivered() {
                return Ok(());
            }
            if packet.is_closed() {
                return Err(SendError::Disconnected(packet.take_value()));
            }
            debug_assert!(packet.is_pending());
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    let mut state = self.inner.mutex.lock();
                    if remove_sender_by_packet(&mut state.senders, &packet) {
                        return Err(SendError::Timeout(packet.take_value()));
                    }
                    // lost the race: delivered or closed between our check
                    // and taking the lock; loop around to observe it.
                    continue;
                }
            }
            // spurious wakeup (`std::thread::park` may return early);
            // we're still queued, just go back to sleep.
        }
    }

    /// Receives a value, blocking the current fiber until one is available
    /// or the channel closes with nothing left to deliver.
    pub fn receive(&self) -> Result<T, RecvError> {
        self.recv_impl(None)
    }

    /// Like [`receive`](Self::receive), but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        self.recv_impl(Some(Instant::now() + timeout))
    }

    /// Receives a value only if one is immediately available.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.recv_impl(Some(Instant::now())).map_err(Into::into)
    }

    /// Receives a value, or `None` if the channel is closed and empty.
    /// Never reports a timeout.
    pub fn receive_optional(&self) -> Option<T> {
        self.receive().ok()
    }

    fn recv_impl(&self, deadline: Option<Instant>) -> Result<T, RecvError> {
        let packet = {
            let mut state = self.inner.mutex.lock();
            if let Some(v) = receive_internal(&mut state) {
                return Ok(v);
            }
            if state.closed {
                return Err(RecvError::Disconnected);
            }
            if matches!(deadline, Some(d) if Instant::now() >= d) {
                return Err(RecvError::Timeout);
            }
            let packet = Arc::new(Packet::empty());
            state.receivers.push_back(ReceiverWaiter {
                handle: fiber::current(),
                packet: Arc::clone(&packet),
                select: None,
            });
            packet
        };

        loop {
            match deadline {
                None => fiber::reschedule(),
                Some(d) => {
                    fiber::reschedule_timeout(d.saturating_duration_since(Instant::now()));
                }
            }
            if packet.is_delivered() {
                return Ok(packet.take_value());
            }
            if packet.is_closed() {
                return Err(RecvError::Disconnected);
            }
            debug_assert!(packet.is_pending());
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    let mut state = self.inner.mutex.lock();
                    if remove_receiver_by_packet(&mut state.receivers, &packet) {
                        return Err(RecvError::Timeout);
                    }
                    continue;
                }
            }
        }
    }

    /// An iterator that blocks on [`receive`](Self::receive) until the
    /// channel closes.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { chan: self }
    }

    /// An iterator that yields only values already available, via
    /// [`try_recv`](Self::try_recv).
    pub fn try_iter(&self) -> TryIter<'_, T> {
        TryIter { chan: self }
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

// SAFETY: all shared state lives behind `Mutex`, which itself requires
// `T: Send` to be `Send`/`Sync`; see `crate::lock::Mutex`.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

pub struct Iter<'a, T> {
    chan: &'a Channel<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.receive_optional()
    }
}

impl<'a, T> IntoIterator for &'a Channel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

pub struct TryIter<'a, T> {
    chan: &'a Channel<T>,
}

impl<T> Iterator for TryIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.try_recv().ok()
    }
}

pub struct IntoIter<T> {
    chan: Channel<T>,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.receive_optional()
    }
}

impl<T> IntoIterator for Channel<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> IntoIter<T> {
        IntoIter { chan: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn send_then_receive_buffered() {
        let ch = Channel::new(1);
        ch.send("hello").unwrap();
        assert_eq!(ch.receive().unwrap(), "hello");
    }

    #[test]
    fn bounded_capacity_two() {
        let ch = Channel::new(2);
        ch.send(10).unwrap();
        ch.send(20).unwrap();
        assert_eq!(ch.receive().unwrap(), 10);
        assert_eq!(ch.receive().unwrap(), 20);
    }

    #[test]
    fn unbuffered_rendezvous() {
        let ch = Channel::new(0);
        let rx = ch.clone();
        let t = thread::spawn(move || rx.receive());
        ch.send(0).unwrap();
        assert_eq!(t.join().unwrap(), Ok(0));
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let ch = Channel::<()>::new(0);
        let rx = ch.clone();
        let t = thread::spawn(move || rx.receive());
        thread::sleep(Duration::from_millis(20));
        ch.close();
        assert_eq!(t.join().unwrap(), Err(RecvError::Disconnected));
    }

    #[test]
    fn close_wakes_blocked_sender_without_transfer() {
        let ch = Channel::<&'static str>::new(0);
        let tx = ch.clone();
        let t = thread::spawn(move || tx.send("no block"));
        thread::sleep(Duration::from_millis(20));
        ch.close();
        assert_eq!(t.join().unwrap(), Err(SendError::Disconnected("no block")));
    }

    #[test]
    fn close_is_idempotent() {
        let ch = Channel::<()>::new(0);
        ch.close();
        ch.close();
        assert!(ch.is_closed());
    }

    #[test]
    fn drain_buffer_then_closed() {
        let ch = Channel::new(2);
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        ch.close();
        assert_eq!(ch.receive(), Ok(1));
        assert_eq!(ch.receive(), Ok(2));
        assert_eq!(ch.receive(), Err(RecvError::Disconnected));
    }

    #[test]
    fn try_recv_empty_does_not_block() {
        let ch = Channel::<()>::new(0);
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn try_send_full_does_not_block() {
        let ch = Channel::new(0);
        assert_eq!(ch.try_send("echo"), Err(TrySendError::Full("echo")));
    }

    #[test]
    fn fifo_order_preserved() {
        let ch = Channel::new(0);
        let producers: Vec<_> = (0..4)
            .map(|i| {
                let tx = ch.clone();
                thread::spawn(move || {
                    // stagger sends so they queue up roughly in order
                    thread::sleep(Duration::from_millis(i * 10));
                    tx.send(i).unwrap();
                })
            })
            .collect();
        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(ch.receive().unwrap());
        }
        for p in producers {
            p.join().unwrap();
        }
        received.sort();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[test]
    fn try_iter_collects_available_values() {
        let ch = Channel::new(3);
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        ch.send(3).unwrap();
        assert_eq!(ch.try_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn recv_timeout_reports_timeout_and_unparks() {
        let ch = Channel::<()>::new(0);
        assert_eq!(ch.recv_timeout(Duration::from_millis(5)), Err(RecvError::Timeout));
        // the waiter created by the timed-out receive must have been
        // scrubbed; a later send should not leak a stale rendezvous.
        let rx = ch.clone();
        let t = thread::spawn(move || rx.receive());
        thread::sleep(Duration::from_millis(10));
        ch.send(()).unwrap();
        assert_eq!(t.join().unwrap(), Ok(()));
    }
}

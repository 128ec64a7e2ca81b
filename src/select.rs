//! Multi-way `select` across heterogeneous send/receive actions.
//!
//! A `select` call is given a list of actions — each either a pending
//! receive on some `Channel<T>` or a pending send of some value to a
//! `Channel<U>` — and an optional `else` branch. It resolves as soon as
//! one action can complete, in three stages: a non-blocking scan (first
//! ready action wins, by input order), the `else` branch if nothing was
//! ready, or arm every action and park until exactly one of them is woken
//! by a peer.
//!
//! Because the action list is heterogeneous in `T`, `select` cannot return
//! `Result<T, _>` for a fixed `T`; callers get back the winning action's
//! index and a type-erased [`Box<dyn Any>`], which they downcast to the
//! `Result<T, Disconnected>` (receive) or `Result<(), Disconnected>` (send)
//! they know that slot holds. [`receive_first`] and [`send_first`] wrap
//! this up for the common case of selecting across channels that all
//! carry the same `T`.

use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::channel::{receive_internal, send_internal, Channel, Packet};
use crate::error::Disconnected;
use crate::fiber;

////////////////////////////////////////////////////////////////////////////////
// SelectShared
////////////////////////////////////////////////////////////////////////////////

const ACTIVE: u8 = 0;
const DONE: u8 = 1;

/// The activation token shared by every action armed by one `select` call.
///
/// A successful compare-and-set from `Active` to `Done` is "this action
/// gets to be the one that wins", and guarantees the property this whole
/// mechanism exists for: at most one of a select's armed actions ever
/// completes.
pub(crate) struct SelectShared {
    state: AtomicU8,
}

impl SelectShared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ACTIVE),
        }
    }

    /// Attempts to claim this select for the caller. Only the first caller
    /// across every armed action succeeds.
    pub(crate) fn try_trigger(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

////////////////////////////////////////////////////////////////////////////////
// ErasedAction
////////////////////////////////////////////////////////////////////////////////

/// One arm of a `select` call, with its element type erased.
///
/// Implemented by [`ReceiveAction`] and [`SendAction`]. Not object-safe to
/// construct generically — build the concrete action for your channel and
/// upcast it into a `Box<dyn ErasedAction>` when assembling the list
/// passed to [`select`].
pub trait ErasedAction {
    /// A stable, total-orderable identity for the channel this action
    /// belongs to, used to lock every involved channel in a consistent
    /// order.
    #[doc(hidden)]
    fn lock_id(&self) -> usize;

    #[doc(hidden)]
    fn lock(&self);

    #[doc(hidden)]
    fn unlock(&self);

    /// Attempts this action's non-blocking fast path. The action's channel
    /// lock is already held by the caller. Returns whether it succeeded;
    /// on success the result is cached for [`winning_result`](Self::winning_result).
    #[doc(hidden)]
    fn try_execute(&self) -> bool;

    /// Arms this action: enqueues a waiter carrying `shared`, so that some
    /// peer fiber may complete it later. The action's channel lock is
    /// already held by the caller.
    #[doc(hidden)]
    fn arm(&self, shared: Arc<SelectShared>);

    /// Removes this action's waiter from its channel's queue, if it's
    /// still there (it may already have been dequeued by a peer). Acquires
    /// the channel's lock itself.
    #[doc(hidden)]
    fn disarm(&self);

    /// The result to report for this action, if it has resolved (either
    /// via `try_execute` or by being woken while armed). Each concrete
    /// action type downcasts this itself; callers of [`select`] downcast
    /// the `Box<dyn Any>` it's wrapped in.
    #[doc(hidden)]
    fn winning_result(&self) -> Option<Box<dyn Any>>;
}

////////////////////////////////////////////////////////////////////////////////
// ReceiveAction
////////////////////////////////////////////////////////////////////////////////

/// A pending receive on `channel`, usable as one arm of [`select`].
pub struct ReceiveAction<T> {
    channel: Channel<T>,
    fast_result: Cell<Option<Result<T, Disconnected>>>,
    packet: Cell<Option<Arc<Packet<T>>>>,
}

impl<T> ReceiveAction<T> {
    /// Creates a receive action for `channel`.
    pub fn new(channel: Channel<T>) -> Self {
        Self {
            channel,
            fast_result: Cell::new(None),
            packet: Cell::new(None),
        }
    }
}

impl<T: 'static> ErasedAction for ReceiveAction<T> {
    fn lock_id(&self) -> usize {
        self.channel.raw_mutex().id()
    }

    fn lock(&self) {
        self.channel.raw_mutex().raw_latch().raw_lock();
    }

    fn unlock(&self) {
        self.channel.raw_mutex().raw_latch().raw_unlock();
    }

    fn try_execute(&self) -> bool {
        // SAFETY: caller holds this action's channel lock (see `lock`).
        let state = unsafe { self.channel.raw_mutex().data_mut_unchecked() };
        if let Some(v) = receive_internal(state) {
            self.fast_result.set(Some(Ok(v)));
            return true;
        }
        if state.closed {
            self.fast_result.set(Some(Err(Disconnected)));
            return true;
        }
        false
    }

    fn arm(&self, shared: Arc<SelectShared>) {
        // SAFETY: caller holds this action's channel lock (see `lock`).
        let state = unsafe { self.channel.raw_mutex().data_mut_unchecked() };
        let packet = Arc::new(Packet::empty());
        state.receivers.push_back(crate::channel::ReceiverWaiter {
            handle: fiber::current(),
            packet: Arc::clone(&packet),
            select: Some(shared),
        });
        self.packet.set(Some(packet));
    }

    fn disarm(&self) {
        if let Some(packet) = self.packet.take() {
            self.lock();
            // SAFETY: lock held immediately above.
            let state = unsafe { self.channel.raw_mutex().data_mut_unchecked() };
            crate::channel::remove_receiver_by_packet(&mut state.receivers, &packet);
            self.unlock();
            self.packet.set(Some(packet));
        }
    }

    fn winning_result(&self) -> Option<Box<dyn Any>> {
        if let Some(r) = self.fast_result.take() {
            return Some(Box::new(r));
        }
        let packet = self.packet.take()?;
        let result = if packet.is_delivered() {
            Some(Box::new(Ok::<T, Disconnected>(packet.take_value())) as Box<dyn Any>)
        } else if packet.is_closed() {
            Some(Box::new(Err::<T, Disconnected>(Disconnected)) as Box<dyn Any>)
        } else {
            None
        };
        self.packet.set(Some(packet));
        result
    }
}

////////////////////////////////////////////////////////////////////////////////
// SendAction
////////////////////////////////////////////////////////////////////////////////

/// A pending send of `value` to `channel`, usable as one arm of [`select`].
pub struct SendAction<T> {
    channel: Channel<T>,
    value: Cell<Option<T>>,
    fast_result: Cell<Option<Result<(), Disconnected>>>,
    packet: Cell<Option<Arc<Packet<T>>>>,
}

impl<T> SendAction<T> {
    /// Creates a send action carrying `value` to `channel`.
    pub fn new(channel: Channel<T>, value: T) -> Self {
        Self {
            channel,
            value: Cell::new(Some(value)),
            fast_result: Cell::new(None),
            packet: Cell::new(None),
        }
    }
}

impl<T: 'static> ErasedAction for SendAction<T> {
    fn lock_id(&self) -> usize {
        self.channel.raw_mutex().id()
    }

    fn lock(&self) {
        self.channel.raw_mutex().raw_latch().raw_lock();
    }

    fn unlock(&self) {
        self.channel.raw_mutex().raw_latch().raw_unlock();
    }

    fn try_execute(&self) -> bool {
        // SAFETY: caller holds this action's channel lock (see `lock`).
        let state = unsafe { self.channel.raw_mutex().data_mut_unchecked() };
        if state.closed {
            self.fast_result.set(Some(Err(Disconnected)));
            return true;
        }
        let value = self.value.take().expect("send action executed twice");
        match send_internal(state, value) {
            Ok(()) => {
                self.fast_result.set(Some(Ok(())));
                true
            }
            Err(v) => {
                self.value.set(Some(v));
                false
            }
        }
    }

    fn arm(&self, shared: Arc<SelectShared>) {
        // SAFETY: caller holds this action's channel lock (see `lock`).
        let state = unsafe { self.channel.raw_mutex().data_mut_unchecked() };
        let value = self.value.take().expect("send action armed twice");
        let packet = Arc::new(Packet::holding(value));
        state.senders.push_back(crate::channel::SenderWaiter {
            handle: fiber::current(),
            packet: Arc::clone(&packet),
            select: Some(shared),
        });
        self.packet.set(Some(packet));
    }

    fn disarm(&self) {
        if let Some(packet) = self.packet.take() {
            self.lock();
            // SAFETY: lock held immediately above.
            let state = unsafe { self.channel.raw_mutex().data_mut_unchecked() };
            let removed = crate::channel::remove_sender_by_packet(&mut state.senders, &packet);
            self.unlock();
            if removed {
                // Never claimed by a peer: reclaim the value so a later
                // retry of this same select can arm or execute again.
                self.value.set(Some(packet.take_value()));
            } else {
                self.packet.set(Some(packet));
            }
        }
    }

    fn winning_result(&self) -> Option<Box<dyn Any>> {
        if let Some(r) = self.fast_result.take() {
            return Some(Box::new(r));
        }
        let packet = self.packet.take()?;
        let result = if packet.is_delivered() {
            Some(Box::new(Ok::<(), Disconnected>(())) as Box<dyn Any>)
        } else if packet.is_closed() {
            // The channel closed before this branch was chosen to proceed;
            // the value never left the packet and is dropped here, the
            // same as a losing branch's value in Go's `select`.
            Some(Box::new(Err::<(), Disconnected>(Disconnected)) as Box<dyn Any>)
        } else {
            None
        };
        self.packet.set(Some(packet));
        result
    }
}

////////////////////////////////////////////////////////////////////////////////
// select
////////////////////////////////////////////////////////////////////////////////

fn lock_all_ordered(actions: &[Box<dyn ErasedAction>]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..actions.len()).collect();
    order.sort_by_key(|&i| actions[i].lock_id());
    let mut locked = Vec::with_capacity(order.len());
    let mut last_id = None;
    for i in order {
        let id = actions[i].lock_id();
        if last_id != Some(id) {
            actions[i].lock();
            locked.push(i);
            last_id = Some(id);
        }
    }
    locked
}

fn unlock_all(actions: &[Box<dyn ErasedAction>], locked: &[usize]) {
    for &i in locked.iter().rev() {
        actions[i].unlock();
    }
}

fn find_winner(actions: &[Box<dyn ErasedAction>]) -> Option<(usize, Box<dyn Any>)> {
    for (i, action) in actions.iter().enumerate() {
        if let Some(result) = action.winning_result() {
            return Some((i, result));
        }
    }
    None
}

/// Waits on a heterogeneous list of pending send/receive actions, resolving
/// as soon as one of them can complete.
///
/// Returns the winning action's index (or `actions.len()` if `has_else` is
/// set and none were immediately ready) and its type-erased result.
/// Distinct channels that compare equal under [`ErasedAction::lock_id`] are
/// only locked once, so passing the same channel in two actions is safe.
///
/// # Panics
///
/// Panics if `actions` is empty and `has_else` is `false` — there is
/// nothing to wait on.
pub fn select(actions: Vec<Box<dyn ErasedAction>>, has_else: bool) -> (usize, Box<dyn Any>) {
    assert!(
        !actions.is_empty() || has_else,
        "select requires at least one action or an else branch"
    );

    loop {
        let locked = lock_all_ordered(&actions);

        let mut ready = None;
        for (i, action) in actions.iter().enumerate() {
            if action.try_execute() {
                ready = Some(i);
                break;
            }
        }

        if let Some(i) = ready {
            let result = actions[i]
                .winning_result()
                .expect("action reported ready but produced no result");
            unlock_all(&actions, &locked);
            return (i, result);
        }

        if has_else {
            unlock_all(&actions, &locked);
            return (actions.len(), Box::new(()));
        }

        let shared = Arc::new(SelectShared::new());
        for action in &actions {
            action.arm(Arc::clone(&shared));
        }
        unlock_all(&actions, &locked);

        fiber::reschedule();

        for action in &actions {
            action.disarm();
        }

        if let Some((i, result)) = find_winner(&actions) {
            return (i, result);
        }
        // every action was disarmed without ever resolving: a spurious
        // wakeup (`std::thread::park` may return early). Loop and try
        // again.
        log::trace!("select woke spuriously with no winning action, retrying");
    }
}

/// Receives from whichever of `channels` is ready first, in the order
/// given when more than one is ready simultaneously.
pub fn receive_first<T: 'static>(channels: &[&Channel<T>]) -> Result<T, Disconnected> {
    let actions: Vec<Box<dyn ErasedAction>> = channels
        .iter()
        .map(|c| Box::new(ReceiveAction::new((*c).clone())) as Box<dyn ErasedAction>)
        .collect();
    let (_, result) = select(actions, false);
    *result
        .downcast::<Result<T, Disconnected>>()
        .expect("ReceiveAction result type mismatch")
}

/// Sends `value` to whichever of `channels` accepts it first.
///
/// Requires `T: Clone` because every channel is armed with its own copy of
/// `value` before the winner is known; all but the delivered copy are
/// dropped once `select` resolves.
pub fn send_first<T: 'static + Clone>(value: T, channels: &[&Channel<T>]) -> Result<(), Disconnected> {
    let actions: Vec<Box<dyn ErasedAction>> = channels
        .iter()
        .map(|c| Box::new(SendAction::new((*c).clone(), value.clone())) as Box<dyn ErasedAction>)
        .collect();
    let (_, result) = select(actions, false);
    *result
        .downcast::<Result<(), Disconnected>>()
        .expect("SendAction result type mismatch")
}

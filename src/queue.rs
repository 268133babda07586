//! Wait-queue core pairing pending senders with pending receivers.
//!
//! All queue mutations and the status transition are serialised by a single
//! mutex. Completion of an operation record is a one-way state transition
//! performed under that mutex; the associated wake-up is always signalled
//! after the mutex is released, so that a woken task can immediately re-enter
//! the channel without lock-order hazards.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::task::Waker;

use crossbeam_utils::CachePadded;
use diatomic_waker::primitives::DiatomicWaker;

use crate::loom_exports::cell::UnsafeCell;
use crate::loom_exports::debug_or_loom_assert;
use crate::loom_exports::sync::atomic::AtomicUsize;
use crate::loom_exports::sync::{Arc, Mutex};
use crate::select::Selection;

/// States of a send operation record.
mod send_state {
    pub(super) const PENDING: usize = 0;
    /// The value was buffered or claimed by a receiver.
    pub(super) const SENT: usize = 1;
    /// The channel closed first; the value is back in the record's slot.
    pub(super) const RETURNED: usize = 2;
    /// The owning future was dropped while the send was still blocked.
    pub(super) const CANCELLED: usize = 3;
}

/// States of a receive operation record.
mod recv_state {
    pub(super) const PENDING: usize = 0;
    /// A value was handed over through the record's slot.
    pub(super) const VALUE: usize = 1;
    /// The channel closed with nothing left to deliver.
    pub(super) const CLOSED: usize = 2;
    /// The receive lost its selection arbitration or was withdrawn.
    pub(super) const CANCELLED: usize = 3;
}

/// A send operation record.
///
/// The value itself lives in the owning queue entry until a receiver claims
/// it; the record's slot is only used in the reverse direction, to hand the
/// value back when the channel closes underneath a blocked sender.
pub(crate) struct SendOp<T> {
    /// Operation state; leaves `PENDING` exactly once, under the channel
    /// mutex.
    state: AtomicUsize,
    /// Hand-back slot, written before the `RETURNED` transition.
    value: UnsafeCell<Option<T>>,
    /// Signal fulfilled once the operation completes.
    waker: DiatomicWaker,
}

unsafe impl<T: Send> Send for SendOp<T> {}
unsafe impl<T: Send> Sync for SendOp<T> {}

impl<T> SendOp<T> {
    fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicUsize::new(send_state::PENDING),
            value: UnsafeCell::new(None),
            waker: DiatomicWaker::new(),
        })
    }

    /// A record born completed, for values that are buffered without ever
    /// having a waiting sender.
    fn sent() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicUsize::new(send_state::SENT),
            value: UnsafeCell::new(None),
            waker: DiatomicWaker::new(),
        })
    }

    /// A record born failed, for sends admitted after the channel closed.
    fn returned(value: T) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicUsize::new(send_state::RETURNED),
            value: UnsafeCell::new(Some(value)),
            waker: DiatomicWaker::new(),
        })
    }

    fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == send_state::PENDING
    }

    pub(crate) fn is_sent(&self) -> bool {
        self.state.load(Ordering::Acquire) == send_state::SENT
    }

    /// Marks the value as buffered or delivered. Runs under the channel
    /// mutex; returns whether this call performed the transition.
    fn complete_sent(&self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.state.store(send_state::SENT, Ordering::Release);
        true
    }

    /// Hands the value back to a blocked sender whose channel closed. Runs
    /// under the channel mutex.
    fn complete_returned(&self, value: T) -> bool {
        if !self.is_pending() {
            return false;
        }
        // Safety: the record is still pending so the owner does not read the
        // slot, and the channel mutex excludes any other writer.
        self.value.with_mut(|slot| unsafe { *slot = Some(value) });
        self.state.store(send_state::RETURNED, Ordering::Release);
        true
    }

    fn cancel(&self) {
        self.state.store(send_state::CANCELLED, Ordering::Release);
    }

    /// Completed outcome, if any: `Ok(())` once the value was buffered or
    /// delivered, `Err(value)` once the channel closed under a blocked send.
    pub(crate) fn outcome(&self) -> Option<Result<(), T>> {
        match self.state.load(Ordering::Acquire) {
            send_state::SENT => Some(Ok(())),
            send_state::RETURNED => {
                // Safety: `RETURNED` was observed with acquire ordering so
                // the slot write is visible, and the operation owner is the
                // only reader.
                self.value.with_mut(|slot| unsafe { (*slot).take() }).map(Err)
            }
            _ => None,
        }
    }

    /// Registers the owner's waker.
    ///
    /// # Safety
    ///
    /// May not race with another `register`/`unregister` call; only the
    /// operation owner may call this.
    pub(crate) unsafe fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// Unregisters the owner's waker.
    ///
    /// # Safety
    ///
    /// Same contract as [`SendOp::register`].
    pub(crate) unsafe fn unregister(&self) {
        self.waker.unregister();
    }

    fn notify(&self) {
        self.waker.notify();
    }
}

/// A receive operation record.
pub(crate) struct RecvOp<T> {
    /// Operation state; leaves `PENDING` exactly once, under the channel
    /// mutex.
    state: AtomicUsize,
    /// Hand-over slot, written before the `VALUE` transition.
    value: UnsafeCell<Option<T>>,
    /// Signal fulfilled once the operation completes.
    waker: DiatomicWaker,
    /// Arbitration group and branch index, for receives raced by a selector.
    selection: Option<(Arc<Selection>, usize)>,
}

unsafe impl<T: Send> Send for RecvOp<T> {}
unsafe impl<T: Send> Sync for RecvOp<T> {}

impl<T> RecvOp<T> {
    fn pending(selection: Option<(Arc<Selection>, usize)>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicUsize::new(recv_state::PENDING),
            value: UnsafeCell::new(None),
            waker: DiatomicWaker::new(),
            selection,
        })
    }

    /// A record born completed, for receives admitted after the channel was
    /// closed and drained.
    fn closed() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicUsize::new(recv_state::CLOSED),
            value: UnsafeCell::new(None),
            waker: DiatomicWaker::new(),
            selection: None,
        })
    }

    /// Hands a value over to the receiver. Runs under the channel mutex.
    fn complete_value(&self, value: T) -> bool {
        if self.state.load(Ordering::Acquire) != recv_state::PENDING {
            return false;
        }
        // Safety: the record is still pending so the owner does not read the
        // slot, and the channel mutex excludes any other writer.
        self.value.with_mut(|slot| unsafe { *slot = Some(value) });
        self.state.store(recv_state::VALUE, Ordering::Release);
        true
    }

    fn complete_closed(&self) -> bool {
        if self.state.load(Ordering::Acquire) != recv_state::PENDING {
            return false;
        }
        self.state.store(recv_state::CLOSED, Ordering::Release);
        true
    }

    fn complete_cancelled(&self) -> bool {
        if self.state.load(Ordering::Acquire) != recv_state::PENDING {
            return false;
        }
        self.state.store(recv_state::CANCELLED, Ordering::Release);
        true
    }

    /// Takes back a value that was handed over but never observed by the
    /// owner. Runs under the channel mutex, from the owner's cancellation.
    fn take_unclaimed_value(&self) -> Option<T> {
        if self.state.load(Ordering::Acquire) != recv_state::VALUE {
            return None;
        }
        // Safety: the matcher's slot write happened before its release store
        // of `VALUE`, and the owner is the only reader.
        self.value.with_mut(|slot| unsafe { (*slot).take() })
    }

    /// Completed outcome, if any: `Some(value)` when a value was matched,
    /// `None` when the channel closed or the receive lost its arbitration.
    pub(crate) fn outcome(&self) -> Option<Option<T>> {
        match self.state.load(Ordering::Acquire) {
            recv_state::VALUE => {
                // Safety: same argument as for `SendOp::outcome`.
                self.value.with_mut(|slot| unsafe { (*slot).take() }).map(Some)
            }
            recv_state::CLOSED | recv_state::CANCELLED => Some(None),
            _ => None,
        }
    }

    /// Registers the owner's waker.
    ///
    /// # Safety
    ///
    /// May not race with another `register`/`unregister` call; only the
    /// operation owner may call this.
    pub(crate) unsafe fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// Unregisters the owner's waker.
    ///
    /// # Safety
    ///
    /// Same contract as [`RecvOp::register`].
    pub(crate) unsafe fn unregister(&self) {
        self.waker.unregister();
    }

    fn notify(&self) {
        self.waker.notify();
    }
}

/// Entry of the send queue.
///
/// Entries whose record has completed form a prefix of the queue and hold
/// the buffered values; entries still pending are blocked senders, in
/// arrival order.
struct SendEntry<T> {
    value: T,
    op: Arc<SendOp<T>>,
}

/// Records completed under the channel mutex, signalled after it is
/// released.
struct WakeList<T> {
    senders: Vec<Arc<SendOp<T>>>,
    receivers: Vec<Arc<RecvOp<T>>>,
}

impl<T> WakeList<T> {
    fn new() -> Self {
        Self {
            senders: Vec::new(),
            receivers: Vec::new(),
        }
    }

    fn notify(self) {
        for op in self.senders {
            op.notify();
        }
        for op in self.receivers {
            op.notify();
        }
    }
}

/// Mutable channel state.
struct Inner<T> {
    /// Pending and buffered send operations, in arrival order.
    sends: VecDeque<SendEntry<T>>,
    /// Blocked receive operations, in arrival order.
    recvs: VecDeque<Arc<RecvOp<T>>>,
    /// Set once by `close`; never reverts.
    closed: bool,
}

impl<T> Inner<T> {
    /// Completes the first blocked sender once a buffer slot frees up.
    ///
    /// With a zero capacity this is the rendezvous hand-over: the head entry
    /// itself is completed right before its value is taken.
    fn promote_at_capacity(&mut self, capacity: usize, wakes: &mut WakeList<T>) {
        if self.sends.len() > capacity {
            let op = &self.sends[capacity].op;
            if op.complete_sent() {
                wakes.senders.push(op.clone());
            }
        }
    }

    /// Pairs queued receivers with deliverable values, in FIFO order.
    ///
    /// Runs under the channel mutex. A receiver that lost its selection
    /// arbitration is completed as cancelled and skipped, leaving the value
    /// for the next receiver in line.
    fn match_pairs(&mut self, capacity: usize, wakes: &mut WakeList<T>) {
        while !self.recvs.is_empty() && !self.sends.is_empty() {
            let recv = self.recvs.pop_front().unwrap();
            if let Some((selection, index)) = recv.selection.as_ref() {
                if !selection.try_claim(*index) {
                    if recv.complete_cancelled() {
                        wakes.receivers.push(recv);
                    }
                    continue;
                }
            }
            self.promote_at_capacity(capacity, wakes);
            let entry = self.sends.pop_front().unwrap();
            debug_or_loom_assert!(entry.op.is_sent());
            if recv.complete_value(entry.value) {
                wakes.receivers.push(recv);
            }
        }
    }
}

/// State shared by all handles to a channel.
pub(crate) struct Core<T> {
    inner: CachePadded<Mutex<Inner<T>>>,
    capacity: usize,
}

impl<T> Core<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: CachePadded::new(Mutex::new(Inner {
                sends: VecDeque::new(),
                recvs: VecDeque::new(),
                closed: false,
            })),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admits a send operation.
    ///
    /// The returned record is already complete if the value could be
    /// buffered, delivered to a waiting receiver, or refused by a closed
    /// channel.
    pub(crate) fn push_send(&self, value: T) -> Arc<SendOp<T>> {
        let mut wakes = WakeList::new();
        let op;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return SendOp::returned(value);
            }
            op = SendOp::pending();
            if inner.sends.len() < self.capacity {
                op.complete_sent();
            }
            inner.sends.push_back(SendEntry {
                value,
                op: op.clone(),
            });
            inner.match_pairs(self.capacity, &mut wakes);
        }
        wakes.notify();
        op
    }

    /// Admits a receive operation, optionally on behalf of a selector
    /// branch.
    ///
    /// The returned record is already complete if a value was immediately
    /// available or the channel was closed and drained.
    pub(crate) fn push_recv(
        &self,
        selection: Option<(Arc<Selection>, usize)>,
    ) -> Arc<RecvOp<T>> {
        let mut wakes = WakeList::new();
        let op;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed && inner.sends.is_empty() {
                return RecvOp::closed();
            }
            op = RecvOp::pending(selection);
            inner.recvs.push_back(op.clone());
            inner.match_pairs(self.capacity, &mut wakes);
        }
        wakes.notify();
        op
    }

    /// Attempts to hand a value over without waiting.
    ///
    /// On a full channel this only succeeds if a waiting receiver takes the
    /// value during the call.
    pub(crate) fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        let mut wakes = WakeList::new();
        let result;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(PushError::Closed(value));
            }
            let op = SendOp::pending();
            if inner.sends.len() < self.capacity {
                op.complete_sent();
            }
            inner.sends.push_back(SendEntry {
                value,
                op: op.clone(),
            });
            inner.match_pairs(self.capacity, &mut wakes);
            if op.is_sent() {
                result = Ok(());
            } else {
                // No slot and no waiting receiver: withdraw the entry, which
                // is necessarily still the tail.
                debug_or_loom_assert!(Arc::ptr_eq(&inner.sends.back().unwrap().op, &op));
                let entry = inner.sends.pop_back().unwrap();
                result = Err(PushError::Full(entry.value));
            }
        }
        wakes.notify();
        result
    }

    /// Attempts to take a value without waiting.
    ///
    /// A value counts as available whether it is buffered or still owned by
    /// a blocked rendezvous sender.
    pub(crate) fn try_pop(&self) -> Result<T, PopError> {
        let mut wakes = WakeList::new();
        let value;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.sends.is_empty() {
                return if inner.closed {
                    Err(PopError::Closed)
                } else {
                    Err(PopError::Empty)
                };
            }
            inner.promote_at_capacity(self.capacity, &mut wakes);
            let entry = inner.sends.pop_front().unwrap();
            debug_or_loom_assert!(entry.op.is_sent());
            value = entry.value;
        }
        wakes.notify();
        Ok(value)
    }

    /// Closes the channel.
    ///
    /// Every queued receiver reports the closure; senders whose value was
    /// never buffered fail and get their value back. Buffered values remain
    /// retrievable until drained.
    pub(crate) fn close(&self) -> bool {
        let mut wakes = WakeList::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            inner.closed = true;
            for op in inner.recvs.drain(..) {
                if op.complete_closed() {
                    wakes.receivers.push(op);
                }
            }
            while inner.sends.back().map_or(false, |entry| !entry.op.is_sent()) {
                let SendEntry { value, op } = inner.sends.pop_back().unwrap();
                if op.complete_returned(value) {
                    wakes.senders.push(op);
                }
            }
        }
        wakes.notify();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Withdraws a send operation whose owner is going away.
    ///
    /// A value that was already buffered or delivered is left alone; a value
    /// still waiting for room is dropped with its entry.
    pub(crate) fn cancel_send(&self, op: &Arc<SendOp<T>>) {
        let mut inner = self.inner.lock().unwrap();
        if !op.is_pending() {
            return;
        }
        if let Some(pos) = inner.sends.iter().position(|entry| Arc::ptr_eq(&entry.op, op)) {
            let _ = inner.sends.remove(pos);
        }
        op.cancel();
    }

    /// Withdraws a receive operation whose owner is going away.
    ///
    /// If the matcher already handed a value to the record, the value is
    /// re-queued ahead of the buffered values so that it is not lost.
    pub(crate) fn cancel_recv(&self, op: &Arc<RecvOp<T>>) {
        let mut wakes = WakeList::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(value) = op.take_unclaimed_value() {
                inner.sends.push_front(SendEntry {
                    value,
                    op: SendOp::sent(),
                });
                inner.match_pairs(self.capacity, &mut wakes);
            } else if op.complete_cancelled() {
                if let Some(pos) = inner.recvs.iter().position(|r| Arc::ptr_eq(r, op)) {
                    let _ = inner.recvs.remove(pos);
                }
            }
        }
        wakes.notify();
    }
}

/// Error occurring when a value cannot be handed over without waiting.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum PushError<T> {
    /// No buffer slot and no waiting receiver.
    Full(T),
    /// The channel is closed.
    Closed(T),
}

/// Error occurring when no value can be taken without waiting.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum PopError {
    /// The channel is open but has nothing to deliver.
    Empty,
    /// The channel is closed and drained.
    Closed,
}

/// Regular tests.
#[cfg(all(test, not(conflux_loom)))]
mod tests {
    use super::*;

    #[test]
    fn core_buffering_fifo() {
        let core = Core::new(3);

        core.try_push(1).unwrap();
        core.try_push(2).unwrap();
        core.try_push(3).unwrap();
        assert_eq!(core.try_push(4), Err(PushError::Full(4)));

        assert_eq!(core.try_pop(), Ok(1));
        assert_eq!(core.try_pop(), Ok(2));
        assert_eq!(core.try_pop(), Ok(3));
        assert_eq!(core.try_pop(), Err(PopError::Empty));
    }

    #[test]
    fn core_closed_keeps_buffered_values() {
        let core = Core::new(3);

        core.try_push(42).unwrap();
        assert!(core.close());
        assert!(!core.close());

        assert_eq!(core.try_push(13), Err(PushError::Closed(13)));
        assert_eq!(core.try_pop(), Ok(42));
        assert_eq!(core.try_pop(), Err(PopError::Closed));
    }

    #[test]
    fn core_blocked_sender_promoted_on_pop() {
        let core = Core::new(2);

        core.try_push(1).unwrap();
        core.try_push(2).unwrap();
        let op = core.push_send(3);
        assert!(!op.is_sent());

        assert_eq!(core.try_pop(), Ok(1));
        assert!(op.is_sent());
        assert_eq!(core.try_pop(), Ok(2));
        assert_eq!(core.try_pop(), Ok(3));
    }

    #[test]
    fn core_rendezvous_via_try_pop() {
        let core = Core::new(0);

        assert_eq!(core.try_push(7), Err(PushError::Full(7)));

        let op = core.push_send(7);
        assert!(!op.is_sent());
        assert_eq!(core.try_pop(), Ok(7));
        assert_eq!(op.outcome(), Some(Ok(())));
    }

    #[test]
    fn core_close_hands_value_back_to_blocked_sender() {
        let core = Core::new(1);

        core.try_push(1).unwrap();
        let op = core.push_send(2);
        assert!(core.close());

        assert_eq!(op.outcome(), Some(Err(2)));
        assert_eq!(core.try_pop(), Ok(1));
        assert_eq!(core.try_pop(), Err(PopError::Closed));
    }

    #[test]
    fn core_receiver_completed_by_later_send() {
        let core = Core::new(0);

        let op = core.push_recv(None);
        assert_eq!(op.outcome(), None);

        let send_op = core.push_send(7);
        assert_eq!(send_op.outcome(), Some(Ok(())));
        assert_eq!(op.outcome(), Some(Some(7)));
    }

    #[test]
    fn core_cancelled_receive_requeues_unclaimed_value() {
        let core = Core::new(1);

        let op = core.push_recv(None);
        core.try_push(7).unwrap();

        // The value reached the record but its owner never looked at it.
        core.cancel_recv(&op);
        assert_eq!(core.try_pop(), Ok(7));
    }

    #[test]
    fn core_cancelled_receive_is_skipped() {
        let core = Core::new(0);

        let op = core.push_recv(None);
        core.cancel_recv(&op);
        assert_eq!(op.outcome(), Some(None));

        // No receiver left: a non-blocking push must fail.
        assert_eq!(core.try_push(7), Err(PushError::Full(7)));
    }
}

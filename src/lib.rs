//! An asynchronous, multi-producer, multi-consumer bounded channel with
//! rendezvous support and multi-way receive selection.
//!
//! A [`Channel`] is a single shared handle: clones refer to the same
//! underlying channel and any clone may send, receive or close. The
//! capacity bounds the number of values that may be *buffered*, i.e. the
//! number of sends that may complete before a receiver takes their value.
//! With a capacity of zero the channel is a rendezvous point: every send
//! completes only once a receiver takes the value.
//!
//! # Closing
//!
//! A channel can be closed from any handle, exactly once. Closing fails
//! every blocked operation: waiting receivers report the closure and
//! blocked senders get their value back. Values buffered before the closure
//! remain receivable until drained, which gives [`Channel::stream`]
//! consumers a deterministic end of iteration.
//!
//! # Selection
//!
//! [`Select`] waits on receive operations over several channels at once and
//! completes exactly one of them, running the winning handler on the caller;
//! with a default branch it instead sweeps the channels without waiting.
//!
//! # Cancellation
//!
//! Dropping a pending send or receive future withdraws the operation from
//! the channel. A successfully sent value is never lost: if a receive
//! future is dropped in the narrow window after a value was handed to it,
//! the value is re-queued and handed to the next receiver.
//!
//! # Example
//!
//! ```
//! use conflux::Channel;
//! use futures_executor::{block_on, ThreadPool};
//!
//! let pool = ThreadPool::new().unwrap();
//!
//! let channel = Channel::new(3);
//! let sender = channel.clone();
//!
//! block_on(async move {
//!     pool.spawn_ok(async move {
//!         assert_eq!(sender.send("Hello").await, Ok(()));
//!     });
//!
//!     assert_eq!(channel.recv().await, Ok("Hello"));
//! });
//! ```
//!
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]

mod loom_exports;
mod queue;
mod select;

use std::error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;

use crate::loom_exports::sync::Arc;
use crate::queue::{Core, PopError, PushError, RecvOp, SendOp};
use crate::select::Selection;

pub use select::{Select, SelectOrDefault};

/// A bounded channel.
///
/// All clones of a handle refer to the same channel. The element type only
/// needs to be `Send` for the channel to be usable across threads; values
/// are moved through the channel, never cloned.
pub struct Channel<T> {
    core: Arc<Core<T>>,
}

impl<T> Channel<T> {
    /// Creates an open channel able to buffer `capacity` values.
    ///
    /// A capacity of zero is allowed and makes the channel a rendezvous
    /// point.
    pub fn new(capacity: usize) -> Self {
        Self {
            core: Arc::new(Core::new(capacity)),
        }
    }

    /// Sends a value, if necessary waiting until buffer space or a matching
    /// receiver becomes available.
    ///
    /// The operation is admitted to the channel when the returned future is
    /// first polled. If the channel is closed before the value could be
    /// buffered or delivered, the value is handed back in the error.
    pub async fn send(&self, message: T) -> Result<(), SendError<T>> {
        SendFuture {
            channel: self,
            message: Some(message),
            op: None,
        }
        .await
    }

    /// Attempts to send a value immediately.
    ///
    /// On a channel with no spare buffer slot this still succeeds if a
    /// waiting receiver takes the value during the call, so it can complete
    /// a rendezvous.
    pub fn try_send(&self, message: T) -> Result<(), TrySendError<T>> {
        match self.core.try_push(message) {
            Ok(()) => Ok(()),
            Err(PushError::Full(v)) => Err(TrySendError::Full(v)),
            Err(PushError::Closed(v)) => Err(TrySendError::Closed(v)),
        }
    }

    /// Receives a value, if necessary waiting until one becomes available.
    ///
    /// Values buffered before a closure remain receivable; once the channel
    /// is closed and drained every receive fails.
    pub async fn recv(&self) -> Result<T, RecvError> {
        RecvFuture {
            channel: self,
            op: None,
            selection: None,
        }
        .await
    }

    /// Receive raced by a selector: the operation may only consume a value
    /// if its branch wins the arbitration.
    pub(crate) async fn recv_arbitrated(
        &self,
        selection: Arc<Selection>,
        index: usize,
    ) -> Result<T, RecvError> {
        RecvFuture {
            channel: self,
            op: None,
            selection: Some((selection, index)),
        }
        .await
    }

    /// Attempts to receive a value immediately.
    ///
    /// A value counts as available whether it is buffered or still owned by
    /// a blocked rendezvous sender, in which case that sender completes.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        match self.core.try_pop() {
            Ok(v) => Ok(v),
            Err(PopError::Empty) => Err(TryRecvError::Empty),
            Err(PopError::Closed) => Err(TryRecvError::Closed),
        }
    }

    /// Closes the channel.
    ///
    /// Returns `true` if this call performed the open to closed transition,
    /// `false` if the channel was closed already. Waiting receivers fail
    /// immediately; blocked senders fail and get their value back; buffered
    /// values remain receivable until drained.
    pub fn close(&self) -> bool {
        self.core.close()
    }

    /// Checks whether the channel is still open.
    ///
    /// This is advisory: another handle may close the channel right after
    /// the call returns.
    pub fn is_open(&self) -> bool {
        !self.core.is_closed()
    }

    /// Returns the number of values the channel can buffer.
    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    /// Returns a stream of the values received on this channel.
    ///
    /// The stream yields each value exactly once, in FIFO order, and ends
    /// once the channel is closed and drained. Dropping the stream neither
    /// closes the channel nor loses values, so iteration can be abandoned
    /// and picked up again at will.
    pub fn stream(&self) -> RecvStream<'_, T> {
        RecvStream {
            channel: self,
            op: None,
        }
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// Shared polling protocol of `RecvFuture` and `RecvStream`.
///
/// The operation is admitted on the first call; afterwards the record is
/// checked, the waker registered and the record checked again, so that a
/// completion racing the registration is never missed.
fn poll_recv<T>(
    channel: &Channel<T>,
    op_slot: &mut Option<Arc<RecvOp<T>>>,
    selection: &mut Option<(Arc<Selection>, usize)>,
    cx: &mut Context<'_>,
) -> Poll<Result<T, RecvError>> {
    if op_slot.is_none() {
        *op_slot = Some(channel.core.push_recv(selection.take()));
    }
    let ready = {
        let op = op_slot.as_ref().unwrap();
        match op.outcome() {
            Some(outcome) => Some(outcome),
            None => {
                // Safety: this future or stream is the only owner of the
                // record, so waker registration cannot race.
                unsafe { op.register(cx.waker()) };
                match op.outcome() {
                    Some(outcome) => {
                        unsafe { op.unregister() };
                        Some(outcome)
                    }
                    None => None,
                }
            }
        }
    };
    match ready {
        Some(outcome) => {
            *op_slot = None;
            Poll::Ready(outcome.ok_or(RecvError))
        }
        None => Poll::Pending,
    }
}

/// Future of a send operation.
struct SendFuture<'a, T> {
    channel: &'a Channel<T>,
    message: Option<T>,
    op: Option<Arc<SendOp<T>>>,
}

impl<T> Unpin for SendFuture<'_, T> {}

impl<'a, T> Future for SendFuture<'a, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.op.is_none() {
            let message = this.message.take().unwrap();
            this.op = Some(this.channel.core.push_send(message));
        }
        let ready = {
            let op = this.op.as_ref().unwrap();
            match op.outcome() {
                Some(outcome) => Some(outcome),
                None => {
                    // Safety: this future is the only owner of the record,
                    // so waker registration cannot race.
                    unsafe { op.register(cx.waker()) };
                    match op.outcome() {
                        Some(outcome) => {
                            unsafe { op.unregister() };
                            Some(outcome)
                        }
                        None => None,
                    }
                }
            }
        };
        match ready {
            Some(outcome) => {
                this.op = None;
                Poll::Ready(outcome.map_err(SendError))
            }
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            self.channel.core.cancel_send(&op);
        }
    }
}

/// Future of a receive operation.
struct RecvFuture<'a, T> {
    channel: &'a Channel<T>,
    op: Option<Arc<RecvOp<T>>>,
    selection: Option<(Arc<Selection>, usize)>,
}

impl<T> Unpin for RecvFuture<'_, T> {}

impl<'a, T> Future for RecvFuture<'a, T> {
    type Output = Result<T, RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        poll_recv(this.channel, &mut this.op, &mut this.selection, cx)
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            self.channel.core.cancel_recv(&op);
        }
    }
}

/// Stream of the values received on a channel.
///
/// Returned by [`Channel::stream`].
pub struct RecvStream<'a, T> {
    channel: &'a Channel<T>,
    op: Option<Arc<RecvOp<T>>>,
}

impl<T> Unpin for RecvStream<'_, T> {}

impl<'a, T> Stream for RecvStream<'a, T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = &mut *self;
        let mut selection = None;
        match poll_recv(this.channel, &mut this.op, &mut selection, cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Some(value)),
            Poll::Ready(Err(RecvError)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for RecvStream<'_, T> {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            self.channel.core.cancel_recv(&op);
        }
    }
}

impl<T> fmt::Debug for RecvStream<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvStream").finish_non_exhaustive()
    }
}

/// An error returned when an attempt to send a message synchronously is
/// unsuccessful.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrySendError<T> {
    /// The channel has no spare buffer slot and no waiting receiver.
    Full(T),
    /// The channel is closed.
    Closed(T),
}

impl<T: fmt::Debug> error::Error for TrySendError<T> {}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => "sending into a full channel".fmt(f),
            TrySendError::Closed(_) => "sending into a closed channel".fmt(f),
        }
    }
}

/// An error returned when an attempt to receive a message synchronously is
/// unsuccessful.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TryRecvError {
    /// The channel has nothing to deliver.
    Empty,
    /// The channel is closed and drained.
    Closed,
}

impl error::Error for TryRecvError {}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => "receiving from an empty channel".fmt(f),
            TryRecvError::Closed => "receiving from a closed channel".fmt(f),
        }
    }
}

/// An error returned when a send fails because the channel is closed.
///
/// The undelivered value is handed back to the caller.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct SendError<T>(pub T);

impl<T: fmt::Debug> error::Error for SendError<T> {}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "sending into a closed channel".fmt(f)
    }
}

/// An error returned when a receive fails because the channel is closed and
/// drained, or because the receive was raced by a selector and lost.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecvError;

impl error::Error for RecvError {}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "receiving from a closed channel".fmt(f)
    }
}

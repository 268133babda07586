//! Multi-way receive selection.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use crate::loom_exports::sync::atomic::AtomicUsize;
use crate::loom_exports::sync::Arc;
use crate::{Channel, TryRecvError};

/// Marker of a selection with no elected winner.
const UNDECIDED: usize = usize::MAX;

/// Single-assignment cell electing the winning branch of one selector run.
///
/// Every receive record registered by one run shares one `Selection`. The
/// first record offered a value claims the cell, inside the offering
/// channel's matcher; the records of every other branch are thereby made
/// non-selectable and get skipped by their matchers, so at most one branch
/// ever consumes a value.
pub(crate) struct Selection {
    winner: AtomicUsize,
}

impl Selection {
    fn new() -> Self {
        Self {
            winner: AtomicUsize::new(UNDECIDED),
        }
    }

    /// Attempts to elect the branch at `index`; returns whether the record
    /// that asked may consume a value.
    pub(crate) fn try_claim(&self, index: usize) -> bool {
        self.winner
            .compare_exchange(UNDECIDED, index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A deferred handler invocation, produced by the winning branch and run on
/// the caller of `run`.
type Thunk<'a> = Box<dyn FnOnce() + 'a>;

type BranchFuture<'a> = Pin<Box<dyn Future<Output = Option<Thunk<'a>>> + 'a>>;

/// Outcome of the non-blocking attempt of one case.
enum Sweep {
    /// A value was available; the case handler has run.
    Handled,
    /// The channel is open but had nothing to deliver.
    Empty,
    /// The channel is closed and drained.
    Closed,
}

/// A registered receive case, erased over its element type.
trait Case<'a> {
    /// Non-blocking attempt, for the sweep of the with-default variant.
    fn sweep(self: Box<Self>) -> Sweep;

    /// Arbitrated receive, for the asynchronous race.
    fn into_branch(self: Box<Self>, selection: Arc<Selection>, index: usize) -> BranchFuture<'a>;
}

struct RecvCase<'a, T, F> {
    channel: &'a Channel<T>,
    handler: F,
}

impl<'a, T, F> Case<'a> for RecvCase<'a, T, F>
where
    T: 'a,
    F: FnOnce(T) + 'a,
{
    fn sweep(self: Box<Self>) -> Sweep {
        match self.channel.try_recv() {
            Ok(value) => {
                (self.handler)(value);
                Sweep::Handled
            }
            Err(TryRecvError::Empty) => Sweep::Empty,
            Err(TryRecvError::Closed) => Sweep::Closed,
        }
    }

    fn into_branch(self: Box<Self>, selection: Arc<Selection>, index: usize) -> BranchFuture<'a> {
        let RecvCase { channel, handler } = *self;

        Box::pin(async move {
            match channel.recv_arbitrated(selection, index).await {
                Ok(value) => {
                    let thunk: Thunk<'a> = Box::new(move || handler(value));
                    Some(thunk)
                }
                Err(_) => None,
            }
        })
    }
}

/// A multi-way receive combinator.
///
/// A selector accumulates receive cases, each a channel paired with a
/// handler for the received value, and completes exactly one of them when
/// run. The builder moves through each call, so a partially assembled
/// selector can never be shared or reused.
///
/// [`run`](Select::run) waits until one of the channels yields a value and
/// invokes that case's handler with it; if instead every channel is closed
/// and drained, no handler is invoked. Adding a default branch with
/// [`or_default`](Select::or_default) turns the selector into its
/// non-waiting variant, [`SelectOrDefault`].
///
/// # Example
///
/// ```
/// use std::cell::Cell;
///
/// use conflux::{Channel, Select};
/// use futures_executor::block_on;
///
/// let numbers = Channel::<u32>::new(1);
/// let words = Channel::<&str>::new(1);
/// words.try_send("seven").unwrap();
///
/// let got = Cell::new("");
/// let completed = block_on(
///     Select::new()
///         .recv(&numbers, |_| {})
///         .recv(&words, |w| got.set(w))
///         .run(),
/// );
///
/// assert!(completed);
/// assert_eq!(got.get(), "seven");
/// ```
#[must_use = "a selector does nothing until run"]
pub struct Select<'a> {
    cases: Vec<Box<dyn Case<'a> + 'a>>,
}

impl<'a> Select<'a> {
    /// Creates a selector with no cases.
    pub fn new() -> Self {
        Self { cases: Vec::new() }
    }

    /// Adds a receive case.
    ///
    /// If this case wins, `handler` is invoked with the received value on
    /// the task that runs the selector, before `run` returns.
    pub fn recv<T, F>(mut self, channel: &'a Channel<T>, handler: F) -> Self
    where
        T: 'a,
        F: FnOnce(T) + 'a,
    {
        self.cases.push(Box::new(RecvCase { channel, handler }));
        self
    }

    /// Adds a default branch, yielding the non-waiting selector variant.
    pub fn or_default<F>(self, handler: F) -> SelectOrDefault<'a>
    where
        F: FnOnce() + 'a,
    {
        SelectOrDefault {
            cases: self.cases,
            default: Box::new(handler),
        }
    }

    /// Races the cases and completes exactly one receive.
    ///
    /// Returns `true` once a case's channel yielded a value and its handler
    /// ran, or `false`, with no handler invoked, once every channel is
    /// closed and drained. Pending receives of the losing cases are
    /// withdrawn from their channels before the winning handler runs, so
    /// senders on the losing channels are left undisturbed.
    ///
    /// When several channels are ready at the same time, the first branch to
    /// elect itself wins; under single-threaded scheduling that is the first
    /// ready case in declaration order, while under parallel senders the
    /// outcome is a race by design.
    pub async fn run(self) -> bool {
        let selection = Arc::new(Selection::new());
        let branches = self
            .cases
            .into_iter()
            .enumerate()
            .map(|(index, case)| Some(case.into_branch(selection.clone(), index)))
            .collect();

        match (Race { branches }).await {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }
}

impl Default for Select<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Select<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Select")
            .field("cases", &self.cases.len())
            .finish_non_exhaustive()
    }
}

/// A selector with a default branch.
///
/// Returned by [`Select::or_default`]; unlike [`Select`], running it never
/// waits.
///
/// # Example
///
/// ```
/// use conflux::{Channel, Select};
///
/// let data = Channel::<u64>::new(4);
///
/// let completed = Select::new()
///     .recv(&data, |_| unreachable!())
///     .or_default(|| {})
///     .run();
///
/// assert!(completed);
/// ```
#[must_use = "a selector does nothing until run"]
pub struct SelectOrDefault<'a> {
    cases: Vec<Box<dyn Case<'a> + 'a>>,
    default: Box<dyn FnOnce() + 'a>,
}

impl<'a> SelectOrDefault<'a> {
    /// Sweeps the cases in declaration order, without waiting.
    ///
    /// The first case whose channel has an immediately available value has
    /// its handler invoked, and `run` returns `true`. If every channel is
    /// closed and drained, neither a case handler nor the default runs and
    /// `run` returns `false`. Otherwise the default handler runs and `run`
    /// returns `true`.
    pub fn run(self) -> bool {
        let mut all_closed = true;
        for case in self.cases {
            match case.sweep() {
                Sweep::Handled => return true,
                Sweep::Empty => all_closed = false,
                Sweep::Closed => {}
            }
        }
        if all_closed {
            return false;
        }
        (self.default)();
        true
    }
}

impl fmt::Debug for SelectOrDefault<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectOrDefault")
            .field("cases", &self.cases.len())
            .finish_non_exhaustive()
    }
}

/// Race of the branch futures of one selector run.
struct Race<'a> {
    /// Live branches. A slot is vacated when its branch reports a closed
    /// channel; every slot is vacated when a branch wins, which withdraws
    /// the losers' pending receives from their channels.
    branches: Vec<Option<BranchFuture<'a>>>,
}

impl<'a> Future for Race<'a> {
    type Output = Option<Thunk<'a>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        let mut live = 0;
        for slot in 0..this.branches.len() {
            let polled = match this.branches[slot].as_mut() {
                Some(branch) => branch.as_mut().poll(cx),
                None => continue,
            };
            match polled {
                Poll::Ready(Some(handler)) => {
                    this.branches.clear();
                    return Poll::Ready(Some(handler));
                }
                Poll::Ready(None) => this.branches[slot] = None,
                Poll::Pending => live += 1,
            }
        }

        if live == 0 {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

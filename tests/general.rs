//! Note: timer-based tests are disabled for MIRI.

#[cfg(not(miri))]
use std::future::Future;
#[cfg(not(miri))]
use std::task::{Context, Poll};
use std::thread;
#[cfg(not(miri))]
use std::time::Duration;

use futures_executor::block_on;
#[cfg(not(miri))]
use futures_task::noop_waker;
#[cfg(not(miri))]
use futures_util::pin_mut;
use futures_util::StreamExt;

use conflux::{Channel, RecvError, SendError, TryRecvError, TrySendError};

// Sleep for the provided number of milliseconds.
#[cfg(not(miri))]
fn sleep(millis: u64) {
    thread::sleep(Duration::from_millis(millis));
}

// Poll the future once and keep it alive for the specified number of
// milliseconds.
#[cfg(not(miri))]
fn poll_once_and_keep_alive<F: Future>(f: F, millis: u64) -> Poll<F::Output> {
    pin_mut!(f);
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);

    let res = f.poll(&mut cx);

    // Delay the drop of the original (shadowed) future.
    sleep(millis);

    res
}

// Basic non-blocking sending/receiving functionality.
#[test]
fn try_send_try_recv() {
    let channel = Channel::new(2);

    assert_eq!(channel.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(channel.try_send(3), Ok(()));
    assert_eq!(channel.try_send(7), Ok(()));
    assert_eq!(channel.try_send(13), Err(TrySendError::Full(13)));

    assert_eq!(channel.try_recv(), Ok(3));
    assert_eq!(channel.try_recv(), Ok(7));
    assert_eq!(channel.try_recv(), Err(TryRecvError::Empty));

    assert!(channel.close());
    assert_eq!(channel.try_recv(), Err(TryRecvError::Closed));
}

// A zero-capacity channel hands the value over synchronously.
#[test]
fn rendezvous_send_recv() {
    let channel = Channel::new(0);
    let sender = channel.clone();

    let th_send = thread::spawn(move || {
        assert_eq!(block_on(sender.send(7)), Ok(()));
    });

    assert_eq!(block_on(channel.recv()), Ok(7));

    th_send.join().unwrap();
}

// Buffered values come out in the order the sends completed.
#[test]
fn buffered_fifo() {
    let channel = Channel::new(3);

    block_on(async {
        assert_eq!(channel.send(1).await, Ok(()));
        assert_eq!(channel.send(2).await, Ok(()));
        assert_eq!(channel.send(3).await, Ok(()));

        assert_eq!(channel.recv().await, Ok(1));
        assert_eq!(channel.recv().await, Ok(2));
        assert_eq!(channel.recv().await, Ok(3));
    });
}

// A sender blocked on a full channel completes as soon as a receive frees a
// slot, and its value keeps its place in line.
#[cfg(not(miri))]
#[test]
fn blocked_send_completes_on_recv() {
    let channel = Channel::new(2);
    let sender = channel.clone();

    block_on(channel.send(1)).unwrap();
    block_on(channel.send(2)).unwrap();

    let th_send = thread::spawn(move || {
        assert_eq!(block_on(sender.send(3)), Ok(())); // blocked until t0 + 100
    });

    sleep(100);
    assert_eq!(block_on(channel.recv()), Ok(1)); // t = t0 + 100

    th_send.join().unwrap();

    assert_eq!(block_on(channel.recv()), Ok(2));
    assert_eq!(block_on(channel.recv()), Ok(3));
}

// Closing an open, empty channel fails subsequent receives; a second close
// is a no-op.
#[test]
fn recv_after_close() {
    let channel = Channel::<i32>::new(4);

    assert!(channel.is_open());
    assert!(channel.close());
    assert!(!channel.close());
    assert!(!channel.is_open());

    assert_eq!(block_on(channel.recv()), Err(RecvError));
}

// Values buffered before the closure drain in order, then the stream ends.
#[test]
fn drain_via_stream() {
    let channel = Channel::new(5);

    for i in 1..=5 {
        channel.try_send(i).unwrap();
    }
    channel.close();

    let drained: Vec<_> = block_on(channel.stream().collect());
    assert_eq!(drained, vec![1, 2, 3, 4, 5]);

    assert_eq!(channel.try_recv(), Err(TryRecvError::Closed));
}

// Abandoning a stream neither closes the channel nor loses values.
#[test]
fn stream_early_termination() {
    let channel = Channel::new(2);

    channel.try_send(1).unwrap();
    channel.try_send(2).unwrap();

    {
        let mut stream = channel.stream();
        assert_eq!(block_on(stream.next()), Some(1));
    }

    assert!(channel.is_open());
    assert_eq!(channel.try_recv(), Ok(2));
}

// Sends admitted after the closure fail and hand the value back.
#[test]
fn send_after_close() {
    let channel = Channel::new(4);

    block_on(channel.send(3)).unwrap();
    channel.close();

    assert_eq!(block_on(channel.send(13)), Err(SendError(13)));
    assert_eq!(channel.try_send(42), Err(TrySendError::Closed(42)));

    // The value buffered before the closure is still there.
    assert_eq!(channel.try_recv(), Ok(3));
}

// A sender still blocked at close time fails, while the buffered value stays
// retrievable.
#[cfg(not(miri))]
#[test]
fn blocked_send_fails_on_close() {
    let channel = Channel::new(1);
    let sender = channel.clone();

    block_on(channel.send(1)).unwrap();

    let th_send = thread::spawn(move || {
        assert_eq!(block_on(sender.send(2)), Err(SendError(2))); // blocked from t0 to t0 + 100
    });

    sleep(100);
    channel.close(); // t = t0 + 100

    th_send.join().unwrap();

    assert_eq!(channel.try_recv(), Ok(1));
    assert_eq!(channel.try_recv(), Err(TryRecvError::Closed));
}

// A receiver blocked on an empty channel is drained by the closure.
#[cfg(not(miri))]
#[test]
fn blocked_recv_fails_on_close() {
    let channel = Channel::<i32>::new(4);
    let receiver = channel.clone();

    let th_recv = thread::spawn(move || {
        assert_eq!(block_on(receiver.recv()), Err(RecvError)); // blocked from t0 to t0 + 100
    });

    sleep(100);
    channel.close(); // t = t0 + 100

    th_recv.join().unwrap();
}

// Abandon a pending receive after a value was already handed to it: the
// value must resurface.
#[cfg(not(miri))]
#[test]
fn cancelled_recv_requeues_delivered_value() {
    let channel = Channel::new(1);
    let sender = channel.clone();

    let th_send = thread::spawn(move || {
        sleep(100);
        sender.try_send(7).unwrap(); // t = t0 + 100, lands in the pending receive
    });

    assert_eq!(poll_once_and_keep_alive(channel.recv(), 300), Poll::Pending); // dropped at t0 + 300

    assert_eq!(channel.try_recv(), Ok(7)); // t = t0 + 300

    th_send.join().unwrap();
}

// Abandon a pending rendezvous receive before any send: the channel is left
// with no taker.
#[cfg(not(miri))]
#[test]
fn cancelled_recv_releases_rendezvous() {
    let channel = Channel::<i32>::new(0);

    assert_eq!(poll_once_and_keep_alive(channel.recv(), 0), Poll::Pending);

    assert_eq!(channel.try_send(3), Err(TrySendError::Full(3)));
}

// Abandon a blocked send: its value is withdrawn from the queue.
#[cfg(not(miri))]
#[test]
fn cancelled_send_withdraws_value() {
    let channel = Channel::new(1);

    channel.try_send(1).unwrap();
    assert_eq!(poll_once_and_keep_alive(channel.send(2), 0), Poll::Pending);

    assert_eq!(channel.try_recv(), Ok(1));
    assert_eq!(channel.try_recv(), Err(TryRecvError::Empty));
}

// SPSC stress test.
#[test]
fn spsc_stress() {
    const CAPACITY: usize = 3;
    const COUNT: usize = if cfg!(miri) { 50 } else { 100_000 };

    let channel = Channel::new(CAPACITY);
    let sender = channel.clone();

    let th_send = thread::spawn(move || {
        block_on(async {
            for i in 0..COUNT {
                sender.send(i).await.unwrap();
            }
        });
    });
    let th_recv = thread::spawn(move || {
        block_on(async {
            for i in 0..COUNT {
                assert_eq!(channel.recv().await, Ok(i));
            }
        });

        assert!(channel.try_recv().is_err());
    });

    th_send.join().unwrap();
    th_recv.join().unwrap();
}

// MPMC stress test: every sent value is received exactly once.
#[test]
fn mpmc_stress() {
    const CAPACITY: usize = 3;
    const COUNT: usize = if cfg!(miri) { 20 } else { 25_000 };
    const SENDERS: usize = 4;
    const RECEIVERS: usize = 2;

    let channel = Channel::new(CAPACITY);

    let th_send: Vec<_> = (0..SENDERS)
        .map(|_| {
            let sender = channel.clone();

            thread::spawn(move || {
                block_on(async {
                    for i in 0..COUNT {
                        sender.send(i).await.unwrap();
                    }
                });
            })
        })
        .collect();

    let th_recv: Vec<_> = (0..RECEIVERS)
        .map(|_| {
            let receiver = channel.clone();

            thread::spawn(move || {
                let mut received = Vec::new();
                block_on(async {
                    while let Ok(i) = receiver.recv().await {
                        received.push(i);
                    }
                });

                received
            })
        })
        .collect();

    for th in th_send {
        th.join().unwrap();
    }
    channel.close();

    let mut stats = vec![0; COUNT];
    for th in th_recv {
        for i in th.join().unwrap() {
            stats[i] += 1;
        }
    }

    for count in stats {
        assert_eq!(count, SENDERS);
    }
}

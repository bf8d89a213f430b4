//! Serial delivery of reconciled calls to one listener.
//!
//! Each listener gets its own queue and worker task. Calls are delivered one
//! at a time in the order they were queued, so listener code never observes
//! two overlapping invocations. Producers only touch the queue, never the
//! listener, which keeps delivery outside of any replica lock.
//!
//! While a call is queued and not yet delivered, a newer call of the same
//! result kind may be folded into it (see [`Deliver::coalesce`]). Only the
//! tail of the queue is ever coalesced, so relative order with other calls is
//! preserved.

use crate::listener::Deliver;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Delivery counters for one listener.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotifierStats {
    pub queued: u64,
    pub delivered: u64,
    pub coalesced: u64,
}

struct QueueState<C> {
    queue: VecDeque<C>,
    paused: bool,
    closed: bool,
    delivering: bool,
    coalesce: bool,
    stats: NotifierStats,
}

struct Shared<C> {
    state: Mutex<QueueState<C>>,
    /// Wakes the worker when work arrives or delivery resumes.
    wake: Notify,
    /// Wakes `flush` callers when the queue runs dry.
    idle: Notify,
}

impl<C> Shared<C> {
    fn settled(&self) -> bool {
        let state = self.state.lock();
        state.closed || state.paused || (state.queue.is_empty() && !state.delivering)
    }
}

/// Serial, optionally coalescing, delivery queue for one listener.
pub struct ListenerNotifier<L: ?Sized, C> {
    shared: Arc<Shared<C>>,
    worker: JoinHandle<()>,
    _listener: PhantomData<fn(&L)>,
}

impl<L, C> ListenerNotifier<L, C>
where
    L: ?Sized + Send + Sync + 'static,
    C: Deliver<L>,
{
    /// Start a worker delivering to `listener`. Must be called inside a Tokio runtime.
    pub fn spawn(listener: Arc<L>, coalesce: bool) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                paused: false,
                closed: false,
                delivering: false,
                coalesce,
                stats: NotifierStats::default(),
            }),
            wake: Notify::new(),
            idle: Notify::new(),
        });

        let worker = tokio::spawn(Self::run(shared.clone(), listener));

        Self {
            shared,
            worker,
            _listener: PhantomData,
        }
    }

    async fn run(shared: Arc<Shared<C>>, listener: Arc<L>) {
        loop {
            let next = {
                let mut state = shared.state.lock();
                if state.closed {
                    break;
                }
                let next = if state.paused {
                    None
                } else {
                    state.queue.pop_front()
                };
                state.delivering = next.is_some();
                next
            };

            match next {
                Some(call) => {
                    call.deliver(&*listener);
                    let mut state = shared.state.lock();
                    state.delivering = false;
                    state.stats.delivered += 1;
                    if state.queue.is_empty() {
                        shared.idle.notify_waiters();
                    }
                }
                None => {
                    shared.idle.notify_waiters();
                    shared.wake.notified().await;
                }
            }
        }
        shared.idle.notify_waiters();
    }

    /// Queue a call. Returns false once the notifier is closed.
    pub fn notify(&self, call: C) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return false;
            }
            state.stats.queued += 1;

            let leftover = match (state.coalesce, state.queue.back_mut()) {
                (true, Some(tail)) => tail.coalesce(call),
                _ => Some(call),
            };
            match leftover {
                Some(call) => state.queue.push_back(call),
                None => state.stats.coalesced += 1,
            }
        }
        self.shared.wake.notify_one();
        true
    }

    /// Hold delivery. Calls keep queueing (and coalescing) until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.shared.state.lock().paused = false;
        self.shared.wake.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Discard queued calls and stop the worker.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.shared.wake.notify_one();
        self.shared.idle.notify_waiters();
        self.worker.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Calls queued and not yet delivered.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn stats(&self) -> NotifierStats {
        self.shared.state.lock().stats.clone()
    }

    /// Wait until everything queued so far has been delivered.
    ///
    /// Returns early if the notifier is paused or closed.
    pub async fn flush(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.shared.settled() {
                return;
            }
            idle.await;
        }
    }
}

impl<L: ?Sized, C> Drop for ListenerNotifier<L, C> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.queue.clear();
        }
        self.shared.wake.notify_one();
        self.shared.idle.notify_waiters();
        self.worker.abort();
    }
}

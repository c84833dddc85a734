//! A small single-threaded cooperative executor: the runtime that gives
//! the async socket shim (`socket.rs`), the TLS handshake loop (`tls.rs`),
//! and the timeout scope (`timeout.rs`) something to suspend into.
//!
//! Per the spec's concurrency model, scheduling is single-threaded and
//! cooperative: one logical task per in-flight request, all I/O
//! non-blocking and registered with [`crate::reactor`]. `spawn` exists
//! only for fire-and-forget background work such as the connection pool's
//! idle-eviction sweepers (spec.md §4.D) — the public API never requires
//! callers to spawn anything themselves.

use crate::reactor::ReactorHandle;
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const COMPLETED: u8 = 2;

type ReadyQueue = Arc<Mutex<VecDeque<Arc<Task>>>>;

struct Task {
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    state: AtomicU8,
    ready: ReadyQueue,
}

impl Task {
    fn schedule(self: &Arc<Self>) {
        if self.state.swap(SCHEDULED, Ordering::AcqRel) != SCHEDULED {
            self.ready.lock().unwrap().push_back(self.clone());
        }
    }

    fn poll(self: &Arc<Self>) {
        let mut slot = self.future.lock().unwrap();
        let Some(mut fut) = slot.take() else {
            return;
        };
        self.state.store(IDLE, Ordering::Release);

        let waker = Waker::from(Arc::new(TaskWaker(self.clone())));
        let mut cx = Context::from_waker(&waker);
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.state.store(COMPLETED, Ordering::Release);
            }
            Poll::Pending => {
                *slot = Some(fut);
            }
        }
    }

    fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }
}

struct TaskWaker(Arc<Task>);

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.0.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.schedule();
    }
}

struct TimerEntry {
    at: Instant,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the nearest deadline sorts first.
        other.at.cmp(&self.at)
    }
}

struct RuntimeContext {
    reactor: Rc<ReactorHandle>,
    timers: Rc<RefCell<BinaryHeap<TimerEntry>>>,
    ready: ReadyQueue,
}

thread_local! {
    static CONTEXT: RefCell<Option<RuntimeContext>> = const { RefCell::new(None) };
}

/// Registers a wakeup for `deadline` on the current runtime. Used by
/// [`sleep`] and by the timeout scope; panics outside `Runtime::block_on`.
pub(crate) fn schedule_timer(at: Instant, waker: Waker) {
    CONTEXT.with(|cell| {
        let ctx = cell.borrow();
        let ctx = ctx.as_ref().expect("no httpflow runtime is running on this thread");
        ctx.timers.borrow_mut().push(TimerEntry { at, waker });
    });
}

fn spawn_on_current(future: impl Future<Output = ()> + Send + 'static) {
    CONTEXT.with(|cell| {
        let ctx = cell.borrow();
        let ctx = ctx.as_ref().expect("no httpflow runtime is running on this thread");
        let task = Arc::new(Task {
            future: Mutex::new(Some(Box::pin(future))),
            state: AtomicU8::new(SCHEDULED),
            ready: ctx.ready.clone(),
        });
        ctx.ready.lock().unwrap().push_back(task);
    });
}

/// Spawns a fire-and-forget background task on the currently running
/// [`Runtime`]. Intended for the connection pool's idle-eviction sweeper.
pub fn spawn(future: impl Future<Output = ()> + Send + 'static) {
    spawn_on_current(future);
}

/// The cooperative single-threaded runtime. One `Runtime` owns one
/// reactor; a process may run several, each on its own OS thread, sharing
/// a [`crate::pool::Pool`] (which is why the pool's internal state is
/// mutex-guarded even though each individual runtime is single-threaded).
pub struct Runtime {
    reactor: Rc<ReactorHandle>,
    timers: Rc<RefCell<BinaryHeap<TimerEntry>>>,
    ready: ReadyQueue,
}

impl Runtime {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            reactor: Rc::new(ReactorHandle::new()?),
            timers: Rc::new(RefCell::new(BinaryHeap::new())),
            ready: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    /// Drives `future` to completion, servicing the reactor and timers in
    /// between polls, and returns its output.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let ctx = RuntimeContext {
            reactor: self.reactor.clone(),
            timers: self.timers.clone(),
            ready: self.ready.clone(),
        };
        CONTEXT.with(|cell| {
            *cell.borrow_mut() = Some(ctx);
        });

        let result = crate::reactor::enter(self.reactor.clone(), || self.drive(future));

        CONTEXT.with(|cell| {
            *cell.borrow_mut() = None;
        });
        result
    }

    fn drive<F: Future>(&self, future: F) -> F::Output {
        let mut pinned = Box::pin(future);
        struct RootWaker(std::sync::atomic::AtomicBool);
        impl Wake for RootWaker {
            fn wake(self: Arc<Self>) {
                self.0.store(true, Ordering::Release);
            }
            fn wake_by_ref(self: &Arc<Self>) {
                self.0.store(true, Ordering::Release);
            }
        }
        let root = Arc::new(RootWaker(std::sync::atomic::AtomicBool::new(true)));

        loop {
            if root.0.swap(false, Ordering::AcqRel) {
                let waker = Waker::from(root.clone());
                let mut cx = Context::from_waker(&waker);
                if let Poll::Ready(output) = pinned.as_mut().poll(&mut cx) {
                    return output;
                }
            }

            self.run_ready_tasks();

            if root.0.load(Ordering::Acquire) {
                continue;
            }

            self.park_until_next_event();
        }
    }

    fn run_ready_tasks(&self) {
        loop {
            let task = self.ready.lock().unwrap().pop_front();
            let Some(task) = task else { break };
            if !task.is_completed() {
                task.poll();
            }
        }
    }

    fn park_until_next_event(&self) {
        let deadline = self.timers.borrow().peek().map(|e| e.at);
        let timeout_ms = match deadline {
            Some(at) => {
                let now = Instant::now();
                if at <= now {
                    0
                } else {
                    (at - now).as_millis().min(i32::MAX as u128) as i32
                }
            }
            None => {
                if self.reactor.has_pending() {
                    -1
                } else {
                    // No timers, no I/O registered, and the root future is
                    // still pending: nothing will ever wake it.
                    0
                }
            }
        };

        let _ = self.reactor.turn(timeout_ms);
        self.fire_expired_timers();
    }

    fn fire_expired_timers(&self) {
        let now = Instant::now();
        let mut timers = self.timers.borrow_mut();
        let mut fired = Vec::new();
        while let Some(entry) = timers.peek() {
            if entry.at <= now {
                fired.push(timers.pop().unwrap());
            } else {
                break;
            }
        }
        drop(timers);
        for entry in fired {
            entry.waker.wake();
        }
    }
}

/// Returns a future that resolves once `duration` has elapsed, relative to
/// the currently running [`Runtime`].
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
    }
}

pub struct Sleep {
    deadline: Instant,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            Poll::Ready(())
        } else {
            schedule_timer(self.deadline, cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_returns_ready_value() {
        let rt = Runtime::new().unwrap();
        let value = rt.block_on(async { 1 + 1 });
        assert_eq!(value, 2);
    }

    #[test]
    fn sleep_resolves_after_deadline() {
        let rt = Runtime::new().unwrap();
        let started = Instant::now();
        rt.block_on(sleep(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn spawned_task_runs_to_completion() {
        let rt = Runtime::new().unwrap();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag2 = flag.clone();
        rt.block_on(async move {
            spawn(async move {
                flag2.store(true, Ordering::SeqCst);
            });
            sleep(Duration::from_millis(5)).await;
        });
        assert!(flag.load(Ordering::SeqCst));
    }
}

//! Scoped timeout primitive (spec component C).
//!
//! [`timeout`] races a future against a deadline. When the deadline fires
//! first, it cancels the bounded region's own [`CancellationToken`] and
//! polls the inner future once more before giving up, so a handler that
//! observes the cancellation and unwinds cleanly still gets to run (and may
//! even swallow it and resolve normally); only if the future is still
//! pending after that poll does [`Error::Timeout`] surface. If a caller-held
//! [`CancellationToken`] fires first, [`Error::Cancelled`] is returned
//! instead — unless the deadline also fired by the time the cancellation is
//! observed, in which case `Timeout` takes precedence, per spec.md §4.C.

use crate::error::Error;
use crate::executor::{self, Sleep};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// A cooperative cancellation signal. Cloning shares the same underlying
/// flag; firing it wakes every future currently awaiting it.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationInner>,
}

#[derive(Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        if let Some(waker) = self.inner.waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    fn poll_cancelled(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.cancelled.load(Ordering::Acquire) {
            Poll::Ready(())
        } else {
            *self.inner.waker.lock().unwrap() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Runs `fut` to completion, timing out after `duration` and surfacing
/// [`Error::Timeout`] if it hasn't resolved by then.
pub async fn timeout<F>(duration: Duration, fut: F) -> Result<F::Output, Error>
where
    F: Future,
{
    with_cancellation(duration, CancellationToken::new(), fut).await
}

/// Runs `fut` to completion, timing out after `duration` or returning
/// [`Error::Cancelled`] if `token` fires first. If both the deadline and the
/// token fire before the next poll, `Timeout` takes precedence.
pub async fn with_cancellation<F>(
    duration: Duration,
    token: CancellationToken,
    fut: F,
) -> Result<F::Output, Error>
where
    F: Future,
{
    Scope {
        fut,
        sleep: executor::sleep(duration),
        token,
    }
    .await
}

struct Scope<F> {
    fut: F,
    sleep: Sleep,
    token: CancellationToken,
}

impl<F: Future> Future for Scope<F> {
    type Output = Result<F::Output, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: Scope is only ever driven via `.await`; none of its
        // fields are moved out before being dropped, so projecting the
        // pin through a raw `&mut` reference is sound here.
        let this = unsafe { self.get_unchecked_mut() };

        // Check the deadline before the inner future so a simultaneous
        // ready-and-expired race always reports Timeout deterministically.
        let sleep = unsafe { Pin::new_unchecked(&mut this.sleep) };
        if sleep.poll(cx).is_ready() {
            // Fire the scope's own cancellation signal and give the inner
            // future one more poll so cleanup code guarded on
            // `token.is_cancelled()` runs (and can swallow the
            // cancellation) before we commit to Timeout.
            this.token.cancel();
            let fut = unsafe { Pin::new_unchecked(&mut this.fut) };
            return match fut.poll(cx) {
                Poll::Ready(output) => Poll::Ready(Ok(output)),
                Poll::Pending => Poll::Ready(Err(Error::Timeout)),
            };
        }

        let fut = unsafe { Pin::new_unchecked(&mut this.fut) };
        if let Poll::Ready(output) = fut.poll(cx) {
            return Poll::Ready(Ok(output));
        }

        if this.token.poll_cancelled(cx).is_ready() {
            return Poll::Ready(Err(Error::Cancelled));
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Runtime;

    #[test]
    fn inner_future_wins_when_fast_enough() {
        let rt = Runtime::new().unwrap();
        let result = rt.block_on(timeout(Duration::from_millis(50), async { 42 }));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn deadline_wins_when_inner_future_never_resolves() {
        let rt = Runtime::new().unwrap();
        let result = rt.block_on(timeout(Duration::from_millis(10), std::future::pending::<()>()));
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn cancellation_token_reports_cancelled() {
        let rt = Runtime::new().unwrap();
        let token = CancellationToken::new();
        let token2 = token.clone();
        let result = rt.block_on(async move {
            executor::spawn(async move {
                executor::sleep(Duration::from_millis(5)).await;
                token2.cancel();
            });
            with_cancellation(
                Duration::from_secs(5),
                token,
                std::future::pending::<()>(),
            )
            .await
        });
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    /// A future that never resolves on its own, but records whether it
    /// observed `token.is_cancelled()` on any poll. `swallow` controls
    /// whether it then reports itself complete (cleanup absorbed the
    /// cancellation) or stays pending (ordinary uncooperative work).
    struct ObservesCancellation {
        token: CancellationToken,
        swallow: bool,
        saw_cancellation: Arc<AtomicBool>,
    }

    impl Future for ObservesCancellation {
        type Output = ();

        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
            if self.token.is_cancelled() {
                self.saw_cancellation.store(true, Ordering::Release);
                if self.swallow {
                    return Poll::Ready(());
                }
            }
            Poll::Pending
        }
    }

    #[test]
    fn swallowed_cancellation_resolves_the_scope_instead_of_timing_out() {
        let rt = Runtime::new().unwrap();
        let token = CancellationToken::new();
        let saw_cancellation = Arc::new(AtomicBool::new(false));
        let fut = ObservesCancellation {
            token: token.clone(),
            swallow: true,
            saw_cancellation: saw_cancellation.clone(),
        };
        let result = rt.block_on(with_cancellation(Duration::from_millis(10), token, fut));
        assert!(saw_cancellation.load(Ordering::Acquire), "cleanup never observed cancellation");
        assert!(result.is_ok(), "expected swallowed cancellation to resolve the scope, got {result:?}");
    }

    #[test]
    fn unswallowed_cancellation_still_times_out_after_cleanup_runs() {
        let rt = Runtime::new().unwrap();
        let token = CancellationToken::new();
        let saw_cancellation = Arc::new(AtomicBool::new(false));
        let fut = ObservesCancellation {
            token: token.clone(),
            swallow: false,
            saw_cancellation: saw_cancellation.clone(),
        };
        let result = rt.block_on(with_cancellation(Duration::from_millis(10), token, fut));
        assert!(saw_cancellation.load(Ordering::Acquire), "cleanup never observed cancellation");
        assert!(matches!(result, Err(Error::Timeout)));
    }
}

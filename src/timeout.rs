// From async-std future::timeout, except that futures_timer is swapped in.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_timer::Delay;
use futures_util::future::{select, Either};
use futures_util::pin_mut;
use pin_project_lite::pin_project;

pub(crate) async fn timeout<F, T>(dur: Duration, f: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    let f = TimeoutFuture {
        future: f,
        delay: Delay::new(dur),
    };
    f.await
}

pin_project! {
    /// A future that times out after a duration of time.
    pub(crate) struct TimeoutFuture<F> {
        #[pin]
        future: F,
        #[pin]
        delay: Delay,
    }
}

impl<F: Future> Future for TimeoutFuture<F> {
    type Output = Result<F::Output, TimeoutError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.future.poll(cx) {
            Poll::Ready(v) => Poll::Ready(Ok(v)),
            Poll::Pending => match this.delay.poll(cx) {
                Poll::Ready(_) => Poll::Ready(Err(TimeoutError { _private: () })),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// An error returned when a future times out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TimeoutError {
    _private: (),
}

impl Error for TimeoutError {}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        "future has timed out".fmt(f)
    }
}

/// How a [`race_with_grace`] ended.
#[derive(Debug)]
pub(crate) enum Deadline<T> {
    /// The future finished before the deadline.
    Completed(T),
    /// The deadline passed. `unwound` tells whether the future finished within the grace period
    /// after being aborted.
    Expired { unwound: bool },
}

/// Two-level timeout: race `future` against `duration`, and if the deadline wins, call `abort`
/// and keep driving the future for at most `grace` so it can release what it holds.
///
/// The deadline is polled first, so it wins when both are ready at once. Anything the future
/// produces during the grace period is dropped.
pub(crate) async fn race_with_grace<F, A>(
    duration: Duration,
    grace: Duration,
    future: F,
    abort: A,
) -> Deadline<F::Output>
where
    F: Future,
    A: FnOnce(),
{
    pin_mut!(future);

    match select(Delay::new(duration), future).await {
        Either::Right((output, _)) => Deadline::Completed(output),
        Either::Left(((), future)) => {
            abort();
            match timeout(grace, future).await {
                Ok(output) => {
                    drop(output);
                    Deadline::Expired { unwound: true }
                }
                Err(TimeoutError { .. }) => Deadline::Expired { unwound: false },
            }
        }
    }
}

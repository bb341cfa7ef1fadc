use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use async_io::Timer;
use pin_project::pin_project;

/// Await `f`, giving up at `deadline`.
pub(crate) async fn timeout<F, T>(deadline: Instant, f: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    TimeoutFuture::new(f, deadline).await
}

/// A future that times out at a deadline.
#[pin_project]
#[derive(Debug)]
pub(crate) struct TimeoutFuture<F> {
    #[pin]
    future: F,
    #[pin]
    delay: Timer,
}

impl<F> TimeoutFuture<F> {
    pub(crate) fn new(future: F, deadline: Instant) -> TimeoutFuture<F> {
        TimeoutFuture {
            future,
            delay: Timer::at(deadline),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[async_std::test]
    async fn completes_before_deadline() {
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(timeout(deadline, async { 7 }).await, Ok(7));
    }

    #[async_std::test]
    async fn expires() {
        let deadline = Instant::now() + Duration::from_millis(20);
        let never = futures_lite::future::pending::<()>();
        assert!(timeout(deadline, never).await.is_err());
    }
}

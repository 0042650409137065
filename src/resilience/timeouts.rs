//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap backend calls with a deadline
//! - Bound the gap between request body frames sent to a backend
//! - Cancel operations cleanly on timeout
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - Timed-out requests return 504 Gateway Timeout

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use http_body::{Body as HttpBody, Frame, SizeHint};
use thiserror::Error;
use tokio::time::Sleep;

/// Outcome of a call that did not produce a value.
#[derive(Debug)]
pub enum CallError<E> {
    /// The deadline elapsed; the call future was dropped.
    TimedOut(Duration),
    Failed(E),
}

/// Run `fut` with `limit` as its deadline.
pub async fn with_deadline<F, T, E>(limit: Duration, fut: F) -> Result<T, CallError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CallError::Failed(e)),
        Err(_) => Err(CallError::TimedOut(limit)),
    }
}

/// The request body stalled for longer than the write timeout.
#[derive(Debug, Error)]
#[error("request body idle for more than {0:?}")]
pub struct BodyIdleTimeout(pub Duration);

/// Request body that fails once no frame arrives within `limit`.
///
/// The timer restarts after every frame, so a slow but steady upload
/// is never cut.
pub struct IdleTimeoutBody {
    inner: Body,
    limit: Duration,
    /// Armed on the first poll that finds no frame ready.
    idle: Option<Pin<Box<Sleep>>>,
}

impl IdleTimeoutBody {
    pub fn new(inner: Body, limit: Duration) -> Self {
        Self {
            inner,
            limit,
            idle: None,
        }
    }
}

impl HttpBody for IdleTimeoutBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                this.idle = None;
                Poll::Ready(frame)
            }
            Poll::Pending => {
                let limit = this.limit;
                let idle = this.idle.get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
                match idle.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Some(Err(axum::Error::new(BodyIdleTimeout(limit))))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A body whose sender never sends anything.
    struct Stalled;

    impl HttpBody for Stalled {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            Poll::Pending
        }
    }

    async fn next_frame(body: &mut IdleTimeoutBody) -> Option<Result<Frame<Bytes>, axum::Error>> {
        std::future::poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx)).await
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_times_out() {
        let start = tokio::time::Instant::now();
        let mut body = IdleTimeoutBody::new(Body::new(Stalled), Duration::from_secs(2));
        let err = next_frame(&mut body).await.unwrap().unwrap_err();
        assert!(err.to_string().contains("idle"));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_pass_through() {
        let mut body = IdleTimeoutBody::new(Body::from("payload"), Duration::from_secs(2));
        let frame = next_frame(&mut body).await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from("payload"));
        assert!(next_frame(&mut body).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, ()>(())
        };
        let res = with_deadline(Duration::from_secs(1), slow).await;
        assert!(matches!(res, Err(CallError::TimedOut(d)) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn passes_through() {
        assert!(matches!(with_deadline(Duration::from_secs(1), async { Ok::<_, ()>(7) }).await, Ok(7)));
        assert!(matches!(
            with_deadline(Duration::from_secs(1), async { Err::<(), _>("boom") }).await,
            Err(CallError::Failed("boom"))
        ));
    }
}

// Copyright 2025 Recall Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Idle timeouts for streaming transfers.
//!
//! A transfer only fails when no bytes have moved for the socket timeout, however long the
//! transfer as a whole takes. A zero timeout disables the check.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Last time bytes moved on one connection. Clones share the same clock.
#[derive(Clone, Debug)]
pub struct ActivityClock {
    last: Arc<Mutex<Instant>>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = Instant::now();
    }

    /// Time since bytes last moved.
    pub fn idle(&self) -> Duration {
        let last = *self.last.lock().unwrap_or_else(|e| e.into_inner());
        Instant::now().saturating_duration_since(last)
    }
}

pub fn timed_out(timeout: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("no data transferred for {:?}", timeout),
    )
}

/// Awaits `send`, failing with [`io::ErrorKind::TimedOut`] once `clock` has been idle for
/// `timeout`. Covers connecting, streaming a request body and waiting for response headers.
pub async fn with_idle_timeout<F, T, E>(
    send: F,
    clock: &ActivityClock,
    timeout: Duration,
) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    if timeout.is_zero() {
        return send.await.map_err(Into::into);
    }
    tokio::pin!(send);
    loop {
        let idle = clock.idle();
        if idle >= timeout {
            return Err(timed_out(timeout).into());
        }
        tokio::select! {
            result = &mut send => return result.map_err(Into::into),
            _ = tokio::time::sleep(timeout - idle) => {}
        }
    }
}

/// Reader that touches a clock whenever a read completes. With a timeout set, a read that
/// stays pending for that long fails with [`io::ErrorKind::TimedOut`].
#[pin_project]
pub struct IdleReader<R> {
    #[pin]
    inner: R,
    clock: ActivityClock,
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<R> IdleReader<R> {
    /// Bounds every read of `inner` by `timeout`.
    pub fn new(inner: R, clock: ActivityClock, timeout: Duration) -> Self {
        Self {
            inner,
            clock,
            timeout: (!timeout.is_zero()).then_some(timeout),
            sleep: None,
        }
    }

    /// Only records progress. Used for request bodies, whose stalls surface through
    /// [`with_idle_timeout`] since the HTTP client stops polling them.
    pub fn tracking(inner: R, clock: ActivityClock) -> Self {
        Self {
            inner,
            clock,
            timeout: None,
            sleep: None,
        }
    }
}

impl<R: AsyncRead> AsyncRead for IdleReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.clock.touch();
                *this.sleep = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let Some(timeout) = *this.timeout else {
                    return Poll::Pending;
                };
                let sleep = this
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        *this.sleep = None;
                        Poll::Ready(Err(timed_out(timeout)))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

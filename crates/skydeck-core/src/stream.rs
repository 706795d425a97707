// ── Reactive state streams ──
//
// `Stream` adapter over a supervisor's `watch`ed connection state, for
// consumers that prefer combinators over `changed()` loops.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::supervisor::ConnectionState;

/// `Stream` of connection-state transitions.
///
/// Yields the current state immediately, then one item per transition.
/// Ends when the supervisor task is gone.
pub struct StateStream {
    inner: WatchStream<ConnectionState>,
}

impl StateStream {
    pub(crate) fn new(receiver: watch::Receiver<ConnectionState>) -> Self {
        Self {
            inner: WatchStream::new(receiver),
        }
    }
}

impl Stream for StateStream {
    type Item = ConnectionState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // WatchStream<ConnectionState> is Unpin, so projecting is safe.
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

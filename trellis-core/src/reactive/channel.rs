//! Change Channels
//!
//! Every consumer owns one change channel. A channel is an unbounded,
//! order-preserving broadcast queue: each call to [`ChangeChannel::subscribe`]
//! opens an independent reader that sees every event published from that
//! point on, in publication order.
//!
//! Publishing never blocks and never drops events. Closing the channel lets
//! each reader drain what is already queued and then end.

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::Span;

use crate::task::Batch;

/// A type-erased, cheaply clonable value carried by a change event.
///
/// Consumers read states and queries of many different types, so the
/// channel carries values behind `Arc<dyn Any>` and readers downcast.
#[derive(Clone)]
pub struct ChangeValue(Arc<dyn Any + Send + Sync>);

impl ChangeValue {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the value if it has type `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Clone the value out if it has type `T`.
    pub fn get<T: Clone + 'static>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for ChangeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChangeValue(..)")
    }
}

/// One change notification.
#[derive(Debug, Clone)]
pub struct Change {
    /// The new value.
    pub value: ChangeValue,

    /// The causal batch active when the triggering write happened.
    pub batch: Batch,

    /// Trace handle of the triggering write. The core only threads it
    /// through; follow-up spans use it as their parent.
    pub span: Span,
}

/// The publishing side of a consumer's change stream.
pub(crate) struct ChangeChannel {
    readers: Mutex<Readers>,
}

struct Readers {
    senders: Vec<mpsc::UnboundedSender<Change>>,
    closed: bool,
    published: u64,
}

impl ChangeChannel {
    pub(crate) fn new() -> Self {
        Self {
            readers: Mutex::new(Readers {
                senders: Vec::new(),
                closed: false,
                published: 0,
            }),
        }
    }

    /// Enqueue a change for every open reader.
    ///
    /// Readers that were dropped are pruned here.
    pub(crate) fn publish(&self, change: Change) {
        let mut readers = self.readers.lock();
        if readers.closed {
            return;
        }
        readers.published += 1;
        readers
            .senders
            .retain(|sender| sender.send(change.clone()).is_ok());
    }

    /// Open a new reader.
    ///
    /// On a closed channel the reader ends immediately.
    pub(crate) fn subscribe(&self) -> Changes {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = self.readers.lock();
        if !readers.closed {
            readers.senders.push(tx);
        }
        Changes { rx }
    }

    /// Close the channel. Queued events remain readable.
    pub(crate) fn close(&self) {
        let mut readers = self.readers.lock();
        readers.closed = true;
        readers.senders.clear();
    }

    /// Number of changes published while the channel was open.
    pub(crate) fn published(&self) -> u64 {
        self.readers.lock().published
    }

    pub(crate) fn reader_count(&self) -> usize {
        self.readers.lock().senders.len()
    }
}

/// A reader over a consumer's change events.
///
/// Usable either through [`Changes::recv`] or as a [`Stream`].
pub struct Changes {
    rx: mpsc::UnboundedReceiver<Change>,
}

impl Changes {
    /// Wait for the next change. Returns `None` once the consumer has been
    /// retired and every queued change was read.
    pub async fn recv(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    /// Take the next change if one is already queued.
    pub fn try_recv(&mut self) -> Option<Change> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Changes {
    type Item = Change;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Change>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for Changes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changes").finish_non_exhaustive()
    }
}

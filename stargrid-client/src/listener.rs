//! # Event Streams
//!
//! Consumer-side handles over the dispatcher's channels: a
//! [`TxSubscription`] receives the transaction events routed to one
//! subscription id, a [`BlockStream`] receives the broadcast block feed.
//!
//! A `TxSubscription` detaches itself from routing when dropped, so an
//! abandoned handle never leaks a registry entry. Unsubscribing is a
//! local operation only; the protocol has no server-side unsubscribe
//! message.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{broadcast, mpsc};
use tokio_stream::Stream;

use crate::dispatcher::DispatcherCommand;
use crate::protocol::{Block, Tx};
use crate::registry::SubscriptionId;

/// A live stream of transaction events for one subscription.
///
/// Returned by [`crate::client::StargridClient::subscribe_txs`]. Events
/// buffer into the stream as soon as the server routes them, independent
/// of acknowledgement timing. The stream ends when the subscription is
/// removed or the session closes.
#[derive(Debug)]
pub struct TxSubscription {
    id: SubscriptionId,
    rx: mpsc::Receiver<Tx>,
    /// Present until the subscription has been unregistered, either
    /// explicitly or on drop.
    unsubscribe_info: Option<mpsc::Sender<DispatcherCommand>>,
}

impl TxSubscription {
    pub(crate) fn new(
        id: SubscriptionId,
        rx: mpsc::Receiver<Tx>,
        command_tx: mpsc::Sender<DispatcherCommand>,
    ) -> Self {
        Self {
            id,
            rx,
            unsubscribe_info: Some(command_tx),
        }
    }

    /// The id the server uses to correlate events and acknowledgements to
    /// this subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receives the next transaction event. Returns `None` once the
    /// subscription is detached or the session has closed.
    pub async fn recv(&mut self) -> Option<Tx> {
        self.rx.recv().await
    }

    /// Detaches this subscription from routing.
    ///
    /// Immediate from the caller's perspective; events already dispatched
    /// before the removal takes effect are not retracted and may still be
    /// read from the stream.
    pub fn unsubscribe(&mut self) {
        if let Some(commands) = self.unsubscribe_info.take() {
            tracing::debug!(id = self.id, "unsubscribing tx subscription");
            if commands
                .try_send(DispatcherCommand::Unregister(self.id))
                .is_err()
            {
                // Dispatcher gone or backlogged; session teardown clears
                // the registry either way.
                tracing::debug!(id = self.id, "dispatcher unavailable for unsubscribe");
            }
        }
    }
}

impl Stream for TxSubscription {
    type Item = Tx;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Tx>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TxSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A stream over the broadcast block feed.
///
/// Every `BlockStream` sees every block in arrival order. A consumer that
/// falls too far behind skips the overwritten blocks and keeps going.
#[derive(Debug)]
pub struct BlockStream {
    rx: broadcast::Receiver<Block>,
}

impl BlockStream {
    pub(crate) fn new(rx: broadcast::Receiver<Block>) -> Self {
        Self { rx }
    }

    /// Receives the next block. Returns `None` once the session has
    /// closed.
    pub async fn recv(&mut self) -> Option<Block> {
        loop {
            match self.rx.recv().await {
                Ok(block) => return Some(block),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "block stream lagging, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// A second, independent stream over the same block feed, starting at
    /// the current position.
    pub fn resubscribe(&self) -> BlockStream {
        BlockStream {
            rx: self.rx.resubscribe(),
        }
    }
}

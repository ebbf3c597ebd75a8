//! # Stargrid Client
//!
//! The public surface of the crate: [`StargridClient`] composes the
//! connection, registry and dispatcher into the typed entry points an
//! application uses.
//!
//! ## Usage
//!
//! ```no_run
//! use stargrid_client::{ClientConfig, StargridClient};
//! use stargrid_client::filter::{EventFilter, FilterExpr};
//!
//! # async fn run() -> Result<(), stargrid_client::ClientError> {
//! let client = StargridClient::new(ClientConfig::default());
//! client.connect().await?;
//!
//! let filters = vec![
//!     EventFilter::new().with("transfer", "amount", FilterExpr::matches("100")),
//! ];
//! let mut txs = client.subscribe_txs(filters).await?;
//! while let Some(tx) = txs.recv().await {
//!     println!("tx at height {}: {}", tx.height, tx.txhash);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ClientConfig;
use crate::connection::{self, ConnectionState, Session};
use crate::dispatcher::DispatcherCommand;
use crate::error::ClientError;
use crate::filter::EventFilter;
use crate::listener::{BlockStream, TxSubscription};
use crate::protocol::{self, Block, CloseFrame};
use crate::registry::SubscriptionIds;

/// A client for the Stargrid event-notification protocol.
///
/// Cheaply clonable; all clones share one underlying session. A client is
/// created disconnected and owns no transport until [`connect`] is called.
/// Dropping every clone tears the session down.
///
/// [`connect`]: StargridClient::connect
#[derive(Debug, Clone)]
pub struct StargridClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    session: Mutex<Option<Session>>,
    state_tx: watch::Sender<ConnectionState>,
    blocks_tx: broadcast::Sender<Block>,
    errors_tx: broadcast::Sender<ClientError>,
    ids: SubscriptionIds,
    blocks_requested: AtomicBool,
}

impl StargridClient {
    pub fn new(config: ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (blocks_tx, _) = broadcast::channel(config.channels.block_event_buffer);
        let (errors_tx, _) = broadcast::channel(config.channels.error_event_buffer);
        Self {
            inner: Arc::new(ClientInner {
                config,
                session: Mutex::new(None),
                state_tx,
                blocks_tx,
                errors_tx,
                ids: SubscriptionIds::new(),
                blocks_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Opens a session to the configured endpoint.
    ///
    /// Resolves once the transport reports "open", or fails with
    /// [`ClientError::ConnectionTimeout`] after the configured deadline.
    /// Calling `connect` while a session is already open first tears the
    /// old session down: its subscriptions are abandoned without drain and
    /// the id counter restarts at 1.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut slot = self.inner.session.lock().await;
        if let Some(old) = slot.take() {
            tracing::info!("replacing existing session");
            old.shutdown().await;
        }

        self.inner.ids.reset();
        self.inner.blocks_requested.store(false, Ordering::SeqCst);

        let session = connection::open(
            &self.inner.config,
            self.inner.blocks_tx.clone(),
            self.inner.errors_tx.clone(),
            self.inner.state_tx.clone(),
        )
        .await?;
        *slot = Some(session);
        Ok(())
    }

    /// Tears the current session down, if any. All subscriptions end; the
    /// close signal fires with a normal-closure frame.
    pub async fn close(&self) {
        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            session.shutdown().await;
        }
    }

    /// Whether a transport session is currently open. True strictly
    /// between the connected signal and the close signal.
    pub fn connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Runs `handler` once the client is connected.
    ///
    /// If a session is already open the handler runs immediately on the
    /// caller's task; otherwise it is armed one-shot on the next connected
    /// signal. A handler error is redirected to the shared error channel
    /// and never propagates into message dispatch.
    pub fn on_connect<F>(&self, handler: F)
    where
        F: FnOnce(&StargridClient) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + 'static,
    {
        if self.connected() {
            if let Err(e) = handler(self) {
                let _ = self.inner.errors_tx.send(ClientError::Handler(e.to_string()));
            }
            return;
        }

        let client = self.clone();
        let mut state_rx = self.inner.state_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *state_rx.borrow_and_update() == ConnectionState::Connected {
                    if let Err(e) = handler(&client) {
                        let _ = client
                            .inner
                            .errors_tx
                            .send(ClientError::Handler(e.to_string()));
                    }
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Subscribes to the block stream. Fire-and-forget: the blocks
    /// subscription is global and carries no acknowledgement.
    pub async fn subscribe_blocks(&self) -> Result<(), ClientError> {
        let slot = self.inner.session.lock().await;
        let session = self.open_session(&slot)?;
        session
            .outbound_tx
            .send(Message::text(protocol::subscribe_blocks_frame()))
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Returns a stream of blocks, issuing the blocks subscription to the
    /// server on first use. Further calls share the same feed. Dropping
    /// the stream detaches the consumer.
    pub async fn blocks(&self) -> Result<BlockStream, ClientError> {
        if !self.inner.blocks_requested.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.subscribe_blocks().await {
                self.inner.blocks_requested.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(BlockStream::new(self.inner.blocks_tx.subscribe()))
    }

    /// Subscribes to transaction events matching `filters`.
    ///
    /// Allocates the next subscription id, registers the event channel and
    /// sends the subscribe request, returning immediately with the live
    /// stream. Events buffer into the stream as the server routes them,
    /// independent of acknowledgement timing; a rejected subscription
    /// surfaces as [`ClientError::Subscription`] on the error channel, not
    /// on the returned stream.
    pub async fn subscribe_txs(
        &self,
        filters: Vec<EventFilter>,
    ) -> Result<TxSubscription, ClientError> {
        let slot = self.inner.session.lock().await;
        let session = self.open_session(&slot)?;

        let id = self.inner.ids.next_id();
        let (tx, rx) = mpsc::channel(self.inner.config.channels.subscription_event_buffer);

        // Register before the frame hits the wire so an early ack or tx
        // cannot outrun its own subscription.
        session
            .command_tx
            .send(DispatcherCommand::Register { id, channel: tx })
            .await
            .map_err(|_| ClientError::NotConnected)?;
        session
            .outbound_tx
            .send(Message::text(protocol::subscribe_txs_frame(id, &filters)))
            .await
            .map_err(|_| ClientError::NotConnected)?;

        tracing::debug!(id, "tx subscription requested");
        Ok(TxSubscription::new(id, rx, session.command_tx.clone()))
    }

    /// A receiver on the shared error channel: subscription rejections,
    /// decode failures, transport errors and handler failures all land
    /// here.
    pub fn errors(&self) -> broadcast::Receiver<ClientError> {
        self.inner.errors_tx.subscribe()
    }

    /// Waits for the current session to end.
    ///
    /// Resolves with the close frame on graceful close, or with the
    /// transport error that precipitated closure; whichever occurs first
    /// settles it, exactly once. Recoverable errors (decode failures,
    /// subscription rejections) do not settle `sync`.
    pub async fn sync(&self) -> Result<CloseFrame, ClientError> {
        let (mut close_rx, mut fatal_rx) = {
            let slot = self.inner.session.lock().await;
            match slot.as_ref() {
                Some(session) => (session.close_rx.clone(), session.fatal_rx.clone()),
                None => return Err(ClientError::NotConnected),
            }
        };

        tokio::select! {
            biased;
            Some(err) = settled(&mut fatal_rx) => Err(err),
            Some(frame) = settled(&mut close_rx) => Ok(frame),
            else => Err(ClientError::Transport(
                "connection tasks terminated without a close frame".into(),
            )),
        }
    }

    fn open_session<'a>(
        &self,
        slot: &'a Option<Session>,
    ) -> Result<&'a Session, ClientError> {
        slot.as_ref()
            .filter(|_| self.connected())
            .ok_or(ClientError::NotConnected)
    }
}

/// Resolves with the first `Some` value observed on the watch, or `None`
/// when the sender is gone without ever publishing one.
async fn settled<T: Clone>(rx: &mut watch::Receiver<Option<T>>) -> Option<T> {
    match rx.wait_for(|value| value.is_some()).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    }
}

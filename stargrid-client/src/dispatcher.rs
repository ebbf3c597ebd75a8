//! # Message Dispatcher
//!
//! The `Dispatcher` is the single background task that consumes the inbound
//! side of the transport and routes every decoded payload to the right
//! internal channel.
//!
//! ## Purpose
//! One WebSocket delivers an untyped stream of block events, transaction
//! events and subscription control messages. The dispatcher classifies
//! each frame and either broadcasts a block, hands a transaction to the
//! subscription registry for per-id routing, or resolves a pending
//! acknowledgement. This keeps every consumer on a clean, typed channel
//! instead of filtering the full firehose itself.
//!
//! The dispatcher also owns the registry: registrations and removals
//! arrive over a command channel, which the select loop drains with
//! priority. A registration enqueued before its subscribe frame was
//! written is therefore always applied before any later-arriving server
//! message, so an early acknowledgement or transaction cannot slip past
//! its own subscription.

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{ConnectionState, WsStream};
use crate::error::ClientError;
use crate::protocol::{Block, CloseFrame, Inbound, Tx};
use crate::registry::{SubscriptionId, SubscriptionRegistry};

/// Commands that mutate the dispatcher's registry.
#[derive(Debug)]
pub(crate) enum DispatcherCommand {
    /// Registers the event channel for a new transaction subscription.
    Register {
        id: SubscriptionId,
        channel: mpsc::Sender<Tx>,
    },
    /// Removes a subscription; its stream is detached from routing.
    Unregister(SubscriptionId),
    /// Tears the session down.
    Shutdown,
}

pub(crate) struct Dispatcher {
    pub(crate) stream: SplitStream<WsStream>,
    pub(crate) command_rx: mpsc::Receiver<DispatcherCommand>,
    pub(crate) outbound_tx: mpsc::Sender<Message>,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) blocks_tx: broadcast::Sender<Block>,
    pub(crate) errors_tx: broadcast::Sender<ClientError>,
    pub(crate) close_tx: watch::Sender<Option<CloseFrame>>,
    pub(crate) fatal_tx: watch::Sender<Option<ClientError>>,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
}

impl Dispatcher {
    /// Runs the dispatch loop until the transport ends or a shutdown
    /// command arrives. Always publishes exactly one close frame.
    pub(crate) async fn run(mut self) {
        tracing::debug!("dispatcher started");
        loop {
            tokio::select! {
                biased;
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                self.teardown(CloseFrame { code: 1000, reason: None }, None);
                                break;
                            }
                        }
                        // Every handle to this session is gone.
                        None => {
                            self.teardown(CloseFrame { code: 1000, reason: None }, None);
                            break;
                        }
                    }
                }
                frame = self.stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_payload(text.as_str()).await,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = self.outbound_tx.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let close = frame
                                .map(|f| CloseFrame {
                                    code: f.code.into(),
                                    reason: if f.reason.is_empty() {
                                        None
                                    } else {
                                        Some(f.reason.to_string())
                                    },
                                })
                                .unwrap_or(CloseFrame { code: 1005, reason: None });
                            self.teardown(close, None);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let err = ClientError::from(e);
                            let _ = self.errors_tx.send(err.clone());
                            self.teardown(CloseFrame { code: 1006, reason: None }, Some(err));
                            break;
                        }
                        None => {
                            self.teardown(CloseFrame { code: 1006, reason: None }, None);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Returns `true` when the dispatcher should shut down.
    async fn handle_command(&mut self, command: DispatcherCommand) -> bool {
        match command {
            DispatcherCommand::Register { id, channel } => {
                self.registry.register(id, channel);
                false
            }
            DispatcherCommand::Unregister(id) => {
                self.registry.unregister(id);
                false
            }
            DispatcherCommand::Shutdown => {
                let _ = self.outbound_tx.send(Message::Close(None)).await;
                true
            }
        }
    }

    async fn handle_payload(&mut self, text: &str) {
        match Inbound::parse(text) {
            Ok(Inbound::Block(block)) => {
                // No receivers is fine; blocks are broadcast best-effort.
                let _ = self.blocks_tx.send(block);
            }
            Ok(Inbound::Tx(tx)) => self.registry.route(tx).await,
            Ok(Inbound::Ack(ack)) => {
                if self.registry.acknowledge(ack.id) {
                    if let Some(message) = ack.error {
                        tracing::warn!(id = ack.id, %message, "subscription rejected by server");
                        let _ = self.errors_tx.send(ClientError::Subscription {
                            id: ack.id,
                            message,
                        });
                    }
                } else {
                    tracing::trace!(id = ack.id, "acknowledgement without pending subscription, dropping");
                }
            }
            Ok(Inbound::Unknown) => {
                tracing::trace!("unrecognized control message, dropping");
            }
            Err(e) => {
                tracing::warn!("dropping undecodable payload: {e}");
                let _ = self.errors_tx.send(e);
            }
        }
    }

    fn teardown(&mut self, frame: CloseFrame, fatal: Option<ClientError>) {
        tracing::info!(code = frame.code, reason = ?frame.reason, "session closed");
        if let Some(err) = fatal {
            self.fatal_tx.send_replace(Some(err));
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.close_tx.send_replace(Some(frame));
        self.registry.clear();
    }
}

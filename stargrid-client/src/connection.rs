//! Transport session lifecycle: dialing with a deadline, the writer task,
//! and the channel wiring between the public client and the dispatcher.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, DispatcherCommand};
use crate::error::ClientError;
use crate::protocol::{Block, CloseFrame};
use crate::registry::SubscriptionRegistry;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Whether a transport session is currently open.
///
/// `Connected` holds strictly between the connected signal and the close
/// signal of a session; operations that talk to the server require it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// One open transport session and the handles into its background tasks.
///
/// Dropping the session (or calling [`Session::shutdown`]) abandons all
/// subscriptions; the protocol has no per-session state worth draining.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) outbound_tx: mpsc::Sender<Message>,
    pub(crate) command_tx: mpsc::Sender<DispatcherCommand>,
    pub(crate) close_rx: watch::Receiver<Option<CloseFrame>>,
    pub(crate) fatal_rx: watch::Receiver<Option<ClientError>>,
    dispatcher: JoinHandle<()>,
}

impl Session {
    /// Tears the session down and waits for the dispatcher to publish its
    /// close frame and clear the registry.
    pub(crate) async fn shutdown(self) {
        if self.command_tx.send(DispatcherCommand::Shutdown).await.is_ok() {
            let _ = self.dispatcher.await;
        } else {
            // Dispatcher already gone; nothing left to wait for.
            self.dispatcher.abort();
        }
    }
}

/// Opens a transport session against `config.endpoint`.
///
/// Resolves once the transport reports "open", or fails with
/// [`ClientError::ConnectionTimeout`] when that has not happened within
/// the configured deadline. On success the reader (dispatcher) and writer
/// tasks are running and the state watch reads `Connected`.
pub(crate) async fn open(
    config: &ClientConfig,
    blocks_tx: broadcast::Sender<Block>,
    errors_tx: broadcast::Sender<ClientError>,
    state_tx: watch::Sender<ConnectionState>,
) -> Result<Session, ClientError> {
    state_tx.send_replace(ConnectionState::Connecting);
    let deadline = config.connect_timeout();
    tracing::info!(endpoint = %config.endpoint, "connecting to Stargrid server");

    let socket = match tokio::time::timeout(deadline, connect_async(config.endpoint.as_str())).await
    {
        Err(_) => {
            state_tx.send_replace(ConnectionState::Disconnected);
            return Err(ClientError::ConnectionTimeout(deadline));
        }
        Ok(Err(e)) => {
            state_tx.send_replace(ConnectionState::Disconnected);
            return Err(e.into());
        }
        Ok(Ok((socket, _response))) => socket,
    };

    let (sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.channels.outbound_frame_buffer);
    let (command_tx, command_rx) = mpsc::channel(config.channels.dispatcher_command_buffer);
    let (close_tx, close_rx) = watch::channel(None);
    let (fatal_tx, fatal_rx) = watch::channel(None);

    tokio::spawn(write_loop(sink, outbound_rx, errors_tx.clone()));

    let dispatcher = Dispatcher {
        stream,
        command_rx,
        outbound_tx: outbound_tx.clone(),
        registry: SubscriptionRegistry::default(),
        blocks_tx,
        errors_tx,
        close_tx,
        fatal_tx,
        state_tx: state_tx.clone(),
    };
    let dispatcher = tokio::spawn(dispatcher.run());

    state_tx.send_replace(ConnectionState::Connected);
    tracing::info!("transport session open");

    Ok(Session {
        outbound_tx,
        command_tx,
        close_rx,
        fatal_rx,
        dispatcher,
    })
}

/// Drains the outbound queue into the transport sink. Exits after writing
/// a close frame or when the queue's senders are gone.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::Receiver<Message>,
    errors_tx: broadcast::Sender<ClientError>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if let Err(e) = sink.send(frame).await {
            tracing::warn!("failed to write frame: {e}");
            let _ = errors_tx.send(ClientError::from(e));
            break;
        }
        if closing {
            break;
        }
    }
}

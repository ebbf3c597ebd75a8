use std::future::Future;
use std::sync::Once;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use stargrid_client::filter::{EventFilter, FilterExpr};
use stargrid_client::{ClientConfig, ClientError, StargridClient};

type ServerSocket = WebSocketStream<TcpStream>;

static INIT_LOGGING: Once = Once::new();

fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = stargrid_logger::init(&stargrid_logger::LogConfig::default());
    });
}

/// Binds an in-process server that serves a single connection with the
/// given handler, returning the endpoint to dial.
async fn spawn_server<F, Fut>(handler: F) -> Result<String>
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            match accept_async(stream).await {
                Ok(ws) => handler(ws).await,
                Err(e) => eprintln!("server handshake failed: {e}"),
            }
        }
    });
    Ok(format!("ws://{addr}"))
}

fn config_for(endpoint: String) -> ClientConfig {
    ClientConfig {
        endpoint,
        connect_timeout_ms: 2000,
        ..ClientConfig::default()
    }
}

async fn connected_client(endpoint: String) -> Result<StargridClient> {
    let client = StargridClient::new(config_for(endpoint));
    client.connect().await?;
    Ok(client)
}

/// Reads frames until the next text payload.
async fn next_text(ws: &mut ServerSocket) -> Option<String> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            return Some(text.to_string());
        }
    }
    None
}

#[tokio::test]
async fn delivers_tx_to_matching_subscription() -> Result<()> {
    init_logging();
    let endpoint = spawn_server(|mut ws| async move {
        let frame = next_text(&mut ws).await.expect("subscribe frame");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["subscribe"]["txs"]["id"], 1);
        assert_eq!(
            value["subscribe"]["txs"]["filters"][0]["transfer"]["amount"]["match"],
            "100"
        );
        ws.send(Message::text(r#"{"subscription":{"id":1}}"#))
            .await
            .unwrap();
        ws.send(Message::text(
            r#"{"tx":{"id":1,"tx":{"raw":"cafe","height":"512","tx":"beef","txhash":"0xfeed","events":[{"name":"transfer","attributes":{"amount":{"value":"100","indexed":true}}}]}}}"#,
        ))
        .await
        .unwrap();
        let _ = ws.next().await;
    })
    .await?;

    let client = connected_client(endpoint).await?;
    let filters = vec![EventFilter::new().with("transfer", "amount", FilterExpr::matches("100"))];
    let mut sub = client.subscribe_txs(filters).await?;
    assert_eq!(sub.id(), 1);

    let tx = timeout(Duration::from_secs(2), sub.recv())
        .await?
        .expect("tx event");
    assert_eq!(tx.subscription_id, 1);
    assert_eq!(tx.height, 512);
    assert_eq!(tx.txhash, "0xfeed");
    assert!(tx.error.is_none());
    let amount = &tx.events[0].attributes["amount"];
    assert_eq!(amount.value, "100");
    assert!(amount.indexed);
    Ok(())
}

#[tokio::test]
async fn subscription_rejection_surfaces_once_on_error_channel() -> Result<()> {
    init_logging();
    let endpoint = spawn_server(|mut ws| async move {
        let _ = next_text(&mut ws).await;
        ws.send(Message::text(
            r#"{"subscription":{"id":1,"error":"invalid filter"}}"#,
        ))
        .await
        .unwrap();
        let _ = ws.next().await;
    })
    .await?;

    let client = connected_client(endpoint).await?;
    let mut errors = client.errors();
    let mut sub = client.subscribe_txs(vec![]).await?;

    let err = timeout(Duration::from_secs(2), errors.recv()).await??;
    assert_eq!(
        err,
        ClientError::Subscription {
            id: 1,
            message: "invalid filter".to_string(),
        }
    );

    // Exactly once, and nothing error-related on the tx stream itself.
    assert!(timeout(Duration::from_millis(200), errors.recv())
        .await
        .is_err());
    assert!(timeout(Duration::from_millis(200), sub.recv())
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn tx_for_unknown_id_is_dropped_without_disturbing_others() -> Result<()> {
    init_logging();
    let endpoint = spawn_server(|mut ws| async move {
        let _ = next_text(&mut ws).await;
        let _ = next_text(&mut ws).await;
        ws.send(Message::text(r#"{"subscription":{"id":1}}"#))
            .await
            .unwrap();
        ws.send(Message::text(r#"{"subscription":{"id":2}}"#))
            .await
            .unwrap();
        // No subscription carries id 99; this must vanish silently.
        ws.send(Message::text(
            r#"{"tx":{"id":99,"tx":{"raw":"aa","height":1,"tx":"bb","txhash":"0x1","events":[]}}}"#,
        ))
        .await
        .unwrap();
        ws.send(Message::text(
            r#"{"tx":{"id":2,"tx":{"raw":"cc","height":2,"tx":"dd","txhash":"0x2","events":[]}}}"#,
        ))
        .await
        .unwrap();
        let _ = ws.next().await;
    })
    .await?;

    let client = connected_client(endpoint).await?;
    let mut errors = client.errors();
    let mut sub1 = client.subscribe_txs(vec![]).await?;
    let mut sub2 = client.subscribe_txs(vec![]).await?;

    let tx = timeout(Duration::from_secs(2), sub2.recv())
        .await?
        .expect("tx for subscription 2");
    assert_eq!(tx.subscription_id, 2);
    assert_eq!(tx.txhash, "0x2");

    assert!(timeout(Duration::from_millis(200), sub1.recv())
        .await
        .is_err());
    assert!(timeout(Duration::from_millis(200), errors.recv())
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn unsubscribe_detaches_the_stream() -> Result<()> {
    init_logging();
    let endpoint = spawn_server(|mut ws| async move {
        let _ = next_text(&mut ws).await;
        ws.send(Message::text(r#"{"subscription":{"id":1}}"#))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        ws.send(Message::text(
            r#"{"tx":{"id":1,"tx":{"raw":"aa","height":1,"tx":"bb","txhash":"0x1","events":[]}}}"#,
        ))
        .await
        .unwrap();
        let _ = ws.next().await;
    })
    .await?;

    let client = connected_client(endpoint).await?;
    let mut sub = client.subscribe_txs(vec![]).await?;
    sub.unsubscribe();

    // The detached stream ends without ever seeing the late tx.
    let next = timeout(Duration::from_secs(1), sub.recv()).await?;
    assert!(next.is_none());
    Ok(())
}

#[tokio::test]
async fn subscription_ids_are_strictly_increasing_from_one() -> Result<()> {
    init_logging();
    let endpoint = spawn_server(|mut ws| async move {
        while next_text(&mut ws).await.is_some() {}
    })
    .await?;

    let client = connected_client(endpoint).await?;
    let sub1 = client.subscribe_txs(vec![]).await?;
    let sub2 = client.subscribe_txs(vec![]).await?;
    let sub3 = client.subscribe_txs(vec![]).await?;
    assert_eq!(
        [sub1.id(), sub2.id(), sub3.id()],
        [1, 2, 3],
        "ids must increase strictly even before any acknowledgement"
    );
    Ok(())
}

#[tokio::test]
async fn blocks_stream_subscribes_lazily_and_delivers() -> Result<()> {
    init_logging();
    let endpoint = spawn_server(|mut ws| async move {
        let frame = next_text(&mut ws).await.expect("subscribe frame");
        assert_eq!(frame, r#"{"subscribe":"blocks"}"#);
        ws.send(Message::text(
            r#"{"block":{"raw":"abcd","height":42,"hash":"0xblock","chain_id":"stargrid-1","time":"2024-01-15T10:30:00Z","events":[]}}"#,
        ))
        .await
        .unwrap();
        let _ = ws.next().await;
    })
    .await?;

    let client = connected_client(endpoint).await?;
    let mut blocks = client.blocks().await?;
    let block = timeout(Duration::from_secs(2), blocks.recv())
        .await?
        .expect("block event");
    assert_eq!(block.height, 42);
    assert_eq!(block.chain_id, "stargrid-1");
    assert_eq!(block.hash, "0xblock");
    assert_eq!(
        block.time,
        "2024-01-15T10:30:00Z".parse::<chrono::DateTime<chrono::Utc>>()?
    );
    Ok(())
}

#[tokio::test]
async fn decode_failures_do_not_stop_processing() -> Result<()> {
    init_logging();
    let endpoint = spawn_server(|mut ws| async move {
        let _ = next_text(&mut ws).await;
        ws.send(Message::text("this is not json")).await.unwrap();
        ws.send(Message::text(
            r#"{"block":{"raw":"abcd","height":"7","hash":"0x7","chain_id":"stargrid-1","time":"2024-01-15T10:30:00Z","events":[]}}"#,
        ))
        .await
        .unwrap();
        let _ = ws.next().await;
    })
    .await?;

    let client = connected_client(endpoint).await?;
    let mut errors = client.errors();
    let mut blocks = client.blocks().await?;

    let err = timeout(Duration::from_secs(2), errors.recv()).await??;
    assert!(matches!(err, ClientError::Decode(_)));

    // The malformed frame was skipped, not fatal.
    let block = timeout(Duration::from_secs(2), blocks.recv())
        .await?
        .expect("block after decode error");
    assert_eq!(block.height, 7);
    assert!(client.connected());
    Ok(())
}

#[tokio::test]
async fn graceful_close_resolves_sync_with_the_frame() -> Result<()> {
    init_logging();
    let endpoint = spawn_server(|mut ws| async move {
        ws.close(Some(WsCloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await
        .unwrap();
    })
    .await?;

    let client = connected_client(endpoint).await?;
    let frame = timeout(Duration::from_secs(2), client.sync()).await??;
    assert_eq!(frame.code, 1000);
    assert_eq!(frame.reason.as_deref(), Some("bye"));
    assert!(!client.connected());
    Ok(())
}

#[tokio::test]
async fn connect_times_out_against_a_silent_server() -> Result<()> {
    init_logging();
    // Accepts TCP but never answers the WebSocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
    });

    let deadline = Duration::from_millis(300);
    let client = StargridClient::new(ClientConfig {
        endpoint: format!("ws://{addr}"),
        connect_timeout_ms: deadline.as_millis() as u64,
        ..ClientConfig::default()
    });

    let started = Instant::now();
    let err = client.connect().await.expect_err("connect must time out");
    let elapsed = started.elapsed();

    assert_eq!(err, ClientError::ConnectionTimeout(deadline));
    assert!(elapsed >= deadline, "timed out early: {elapsed:?}");
    assert!(
        elapsed < deadline + Duration::from_millis(500),
        "timed out late: {elapsed:?}"
    );
    assert!(!client.connected());
    Ok(())
}

#[tokio::test]
async fn operations_require_an_open_session() -> Result<()> {
    init_logging();
    let client = StargridClient::new(ClientConfig::default());
    assert!(!client.connected());
    assert_eq!(
        client.subscribe_blocks().await,
        Err(ClientError::NotConnected)
    );
    assert!(matches!(
        client.subscribe_txs(vec![]).await,
        Err(ClientError::NotConnected)
    ));
    assert!(matches!(client.sync().await, Err(ClientError::NotConnected)));
    Ok(())
}

#[tokio::test]
async fn on_connect_runs_immediately_and_reports_handler_failures() -> Result<()> {
    init_logging();
    let endpoint = spawn_server(|mut ws| async move {
        let _ = ws.next().await;
    })
    .await?;

    let client = connected_client(endpoint).await?;
    let mut errors = client.errors();

    let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let observed = ran.clone();
    client.on_connect(move |_| {
        observed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    });
    assert!(ran.load(std::sync::atomic::Ordering::SeqCst));

    client.on_connect(|_| Err("boom".into()));
    let err = timeout(Duration::from_secs(2), errors.recv()).await??;
    assert_eq!(err, ClientError::Handler("boom".to_string()));
    Ok(())
}

#[tokio::test]
async fn reconnect_replaces_the_session_and_restarts_ids() -> Result<()> {
    init_logging();
    // This server keeps accepting connections and drains their frames.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if let Ok(mut ws) = accept_async(stream).await {
                    while ws.next().await.is_some() {}
                }
            });
        }
    });

    let client = connected_client(format!("ws://{addr}")).await?;
    let sub = client.subscribe_txs(vec![]).await?;
    assert_eq!(sub.id(), 1);
    drop(sub);

    client.connect().await?;
    assert!(client.connected());
    let sub = client.subscribe_txs(vec![]).await?;
    assert_eq!(sub.id(), 1, "a new session starts a new id sequence");
    Ok(())
}

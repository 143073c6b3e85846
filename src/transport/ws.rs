//! WebSocket Transport
//!
//! Speaks the broker's text protocol over a WebSocket link. One reader task
//! decodes server operations and routes deliveries by sid; one writer task
//! drains the outbound queue so that enqueue operations never block.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::codec::{ClientOp, ConnectInfo, Decoder, ServerInfo, ServerOp};
use super::error::{TransportError, TransportResult};
use super::topic::{validate_pattern, validate_subject};
use super::{
    ConnectOptions, Credentials, Established, InboundMessage, Session, Transport,
    TransportEvent, TransportSubscription,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Schemes accepted for the duplex link
pub const DUPLEX_SCHEMES: [&str; 2] = ["ws", "wss"];

/// Check that a URL parses and uses a duplex-transport scheme
pub fn check_url(raw: &str) -> TransportResult<url::Url> {
    let url = url::Url::parse(raw).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    if !DUPLEX_SCHEMES.contains(&url.scheme()) {
        return Err(TransportError::InvalidUrl(format!(
            "unsupported scheme '{}', expected ws:// or wss://",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(TransportError::InvalidUrl("missing host".to_string()));
    }
    Ok(url)
}

/// WebSocket implementation of [`Transport`]
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, options: &ConnectOptions) -> TransportResult<Established> {
        let url = check_url(&options.url)?;

        tracing::debug!(url = %url, "Opening broker link");
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();
        let mut decoder = Decoder::new();

        let info = match read_op(&mut source, &mut decoder).await? {
            ServerOp::Info(info) => info,
            other => {
                return Err(TransportError::Handshake(format!(
                    "expected INFO, got {:?}",
                    other
                )))
            }
        };
        decoder.set_max_payload(info.max_payload);

        send_op(&mut sink, &ClientOp::Connect(connect_info(options))).await?;
        send_op(&mut sink, &ClientOp::Ping).await?;

        loop {
            match read_op(&mut source, &mut decoder).await? {
                ServerOp::Pong => break,
                ServerOp::Ping => send_op(&mut sink, &ClientOp::Pong).await?,
                ServerOp::Ok | ServerOp::Info(_) => {}
                ServerOp::Err(message) => {
                    return Err(if message.to_ascii_lowercase().contains("authorization") {
                        TransportError::Authorization(message)
                    } else {
                        TransportError::Handshake(message)
                    });
                }
                ServerOp::Msg { .. } => {
                    return Err(TransportError::Protocol(
                        "MSG received before handshake completed".to_string(),
                    ))
                }
            }
        }

        tracing::info!(
            server_id = %info.server_id,
            version = %info.version,
            "Broker handshake complete"
        );

        Ok(WsSession::start(info, sink, source, decoder))
    }
}

fn connect_info(options: &ConnectOptions) -> ConnectInfo {
    let mut info = ConnectInfo::new(&options.name);
    match &options.credentials {
        Credentials::Token(token) => info.auth_token = Some(token.clone()),
        Credentials::UserPass { user, pass } => {
            info.user = Some(user.clone());
            info.pass = Some(pass.clone());
        }
        Credentials::None => {}
    }
    info
}

async fn send_op(sink: &mut WsSink, op: &ClientOp) -> TransportResult<()> {
    sink.send(Message::Binary(op.encode()?)).await?;
    Ok(())
}

async fn read_op<S>(source: &mut S, decoder: &mut Decoder) -> TransportResult<ServerOp>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        if let Some(op) = decoder.next_op()? {
            return Ok(op);
        }
        match source.next().await {
            Some(Ok(Message::Binary(data))) => decoder.push(&data),
            Some(Ok(Message::Text(text))) => decoder.push(text.as_bytes()),
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Commands for the writer task
enum Outbound {
    Frame(Vec<u8>),
    Flush(oneshot::Sender<()>),
    Close,
}

/// State shared between the session handle and its tasks
struct WsShared {
    outbound: mpsc::UnboundedSender<Outbound>,
    subscriptions: Mutex<HashMap<u64, mpsc::UnboundedSender<InboundMessage>>>,
    next_sid: AtomicU64,
    closed: AtomicBool,
}

impl WsShared {
    fn enqueue(&self, op: &ClientOp) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(op.encode()?))
            .map_err(|_| TransportError::Closed)
    }

    fn route(&self, sid: u64, message: InboundMessage) {
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = subs.get(&sid) {
            if tx.send(message).is_err() {
                subs.remove(&sid);
            }
        } else {
            tracing::trace!(sid, "Delivery for unknown sid dropped");
        }
    }

    fn clear_subscriptions(&self) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// An established WebSocket session
pub struct WsSession {
    shared: Arc<WsShared>,
    info: ServerInfo,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl WsSession {
    fn start(info: ServerInfo, sink: WsSink, source: WsSource, decoder: Decoder) -> Established {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(WsShared {
            outbound: outbound_tx,
            subscriptions: Mutex::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), source, decoder, events_tx));

        let session = WsSession {
            shared,
            info,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        };

        Established {
            session: Arc::new(session),
            events: events_rx,
        }
    }

    /// INFO block received during the handshake
    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Outbound::Frame(frame) => {
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    tracing::debug!(error = %e, "Broker send failed, stopping writer");
                    break;
                }
            }
            Outbound::Flush(ack) => {
                if let Err(e) = sink.flush().await {
                    tracing::debug!(error = %e, "Broker flush failed, stopping writer");
                    break;
                }
                let _ = ack.send(());
            }
            Outbound::Close => {
                let _ = sink.close().await;
                break;
            }
        }
    }
}

async fn read_loop(
    shared: Arc<WsShared>,
    mut source: WsSource,
    mut decoder: Decoder,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = 'link: loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => decoder.push(&data),
            Some(Ok(Message::Text(text))) => decoder.push(text.as_bytes()),
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }

        loop {
            match decoder.next_op() {
                Ok(Some(ServerOp::Msg {
                    subject,
                    sid,
                    reply,
                    payload,
                })) => shared.route(
                    sid,
                    InboundMessage {
                        subject,
                        reply,
                        payload,
                    },
                ),
                Ok(Some(ServerOp::Ping)) => {
                    let _ = shared.enqueue(&ClientOp::Pong);
                }
                Ok(Some(ServerOp::Err(message))) => {
                    tracing::warn!(message = %message, "Broker reported an error");
                    let _ = events.send(TransportEvent::Error { message });
                }
                Ok(Some(ServerOp::Info(info))) => {
                    tracing::debug!(server_id = %info.server_id, "Broker INFO update");
                }
                Ok(Some(ServerOp::Ok | ServerOp::Pong)) => {}
                Ok(None) => break,
                Err(e) => {
                    // The stream can no longer be trusted
                    tracing::warn!(error = %e, "Broker protocol violation, dropping link");
                    let message = e.to_string();
                    let _ = events.send(TransportEvent::Error {
                        message: message.clone(),
                    });
                    break 'link Some(message);
                }
            }
        }
    };

    shared.clear_subscriptions();
    let _ = shared.outbound.send(Outbound::Close);
    if !shared.closed.swap(true, Ordering::SeqCst) {
        tracing::info!(reason = ?reason, "Broker link dropped");
        let _ = events.send(TransportEvent::Disconnect { reason });
    }
}

#[async_trait]
impl Session for WsSession {
    fn publish(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        validate_subject(subject)?;
        self.shared.enqueue(&ClientOp::Pub {
            subject: subject.to_string(),
            payload,
        })
    }

    fn subscribe(&self, pattern: &str) -> TransportResult<TransportSubscription> {
        validate_pattern(pattern)?;
        let sid = self.shared.next_sid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sid, tx);

        if let Err(e) = self.shared.enqueue(&ClientOp::Sub {
            subject: pattern.to_string(),
            sid,
        }) {
            self.shared
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&sid);
            return Err(e);
        }

        Ok(TransportSubscription { sid, messages: rx })
    }

    fn unsubscribe(&self, sid: u64) -> TransportResult<()> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&sid);
        self.shared.enqueue(&ClientOp::Unsub { sid })
    }

    async fn flush(&self) -> TransportResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared
            .outbound
            .send(Outbound::Flush(ack_tx))
            .map_err(|_| TransportError::Closed)?;
        ack_rx.await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shared.outbound.send(Outbound::Close);
        self.shared.clear_subscriptions();

        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reader) = reader {
            reader.abort();
        }

        tracing::debug!("Broker link closed");
        Ok(())
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_url_schemes() {
        assert!(check_url("ws://localhost:8080").is_ok());
        assert!(check_url("wss://broker.example.com/ws").is_ok());
        assert!(matches!(
            check_url("http://localhost:8080"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            check_url("localhost:8080"),
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(check_url(""), Err(TransportError::InvalidUrl(_))));
    }

    #[test]
    fn test_connect_info_credentials() {
        let options = ConnectOptions::new("ws://localhost:8080").credentials(
            Credentials::UserPass {
                user: "a".to_string(),
                pass: "b".to_string(),
            },
        );
        let info = connect_info(&options);
        assert_eq!(info.user.as_deref(), Some("a"));
        assert_eq!(info.pass.as_deref(), Some("b"));
        assert!(info.auth_token.is_none());

        let options =
            ConnectOptions::new("ws://localhost:8080").credentials(Credentials::Token("t".into()));
        let info = connect_info(&options);
        assert_eq!(info.auth_token.as_deref(), Some("t"));
        assert!(info.user.is_none());
    }

    type ServerSocket = WebSocketStream<TcpStream>;

    /// Run a scripted broker on a local port; returns its URL
    async fn serve<F, Fut>(script: F) -> (String, JoinHandle<()>)
    where
        F: FnOnce(ServerSocket) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            script(ws).await;
        });
        (format!("ws://{}", addr), handle)
    }

    async fn send_text(ws: &mut ServerSocket, text: &str) {
        ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    async fn next_text(ws: &mut ServerSocket) -> String {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return String::from_utf8(data).unwrap(),
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("Expected a frame, got {:?}", other),
            }
        }
    }

    /// INFO, then CONNECT + PING from the client; returns the CONNECT line
    async fn open_handshake(ws: &mut ServerSocket, info: &str) -> String {
        send_text(ws, &format!("INFO {}\r\n", info)).await;
        let connect = next_text(ws).await;
        assert_eq!(next_text(ws).await, "PING\r\n");
        connect
    }

    fn user_pass(url: &str) -> ConnectOptions {
        ConnectOptions::new(url).credentials(Credentials::UserPass {
            user: "a".to_string(),
            pass: "b".to_string(),
        })
    }

    #[tokio::test]
    async fn test_session_over_websocket() {
        let (url, server) = serve(|mut ws| async move {
            let connect = open_handshake(&mut ws, r#"{"server_id":"s1","version":"2.10"}"#).await;
            assert!(connect.starts_with("CONNECT {"));
            assert!(connect.contains("\"user\":\"a\""));
            assert!(connect.contains("\"pass\":\"b\""));
            send_text(&mut ws, "PONG\r\n").await;

            assert_eq!(next_text(&mut ws).await, "SUB orders.* 1\r\n");
            send_text(&mut ws, "MSG orders.created 1 5\r\nhello\r\n").await;

            assert_eq!(next_text(&mut ws).await, "PUB audit.login 2\r\nhi\r\n");

            send_text(&mut ws, "PING\r\n").await;
            assert_eq!(next_text(&mut ws).await, "PONG\r\n");

            send_text(&mut ws, "-ERR 'Slow Consumer'\r\n").await;
            ws.close(None).await.unwrap();
        })
        .await;

        let Established {
            session,
            mut events,
        } = WsTransport::new().connect(&user_pass(&url)).await.unwrap();

        let mut sub = session.subscribe("orders.*").unwrap();
        assert_eq!(sub.sid, 1);
        let message = sub.messages.recv().await.unwrap();
        assert_eq!(message.subject, "orders.created");
        assert_eq!(&message.payload[..], b"hello");

        session
            .publish("audit.login", Bytes::from_static(b"hi"))
            .unwrap();
        session.flush().await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Error {
                message: "Slow Consumer".to_string()
            })
        );
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnect { .. })
        ));

        // Link gone: subscription feeds close, enqueue fails
        assert!(sub.messages.recv().await.is_none());
        assert!(matches!(
            session.publish("audit.login", Bytes::new()),
            Err(TransportError::Closed)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_authorization_violation() {
        let (url, server) = serve(|mut ws| async move {
            open_handshake(&mut ws, r#"{"auth_required":true}"#).await;
            send_text(&mut ws, "-ERR 'Authorization Violation'\r\n").await;
        })
        .await;

        let result = WsTransport::new().connect(&user_pass(&url)).await;
        assert!(matches!(result, Err(TransportError::Authorization(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_violation_drops_link() {
        let (url, server) = serve(|mut ws| async move {
            open_handshake(&mut ws, "{}").await;
            send_text(&mut ws, "PONG\r\n").await;
            send_text(&mut ws, "BOGUS\r\n").await;
            // Client closes its side after the violation
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
        })
        .await;

        let Established {
            session: _session,
            mut events,
        } = WsTransport::new().connect(&user_pass(&url)).await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Error { .. })
        ));
        match events.recv().await {
            Some(TransportEvent::Disconnect { reason }) => {
                assert!(reason.unwrap().contains("BOGUS"));
            }
            other => panic!("Expected Disconnect, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_payload_drops_link() {
        let (url, server) = serve(|mut ws| async move {
            open_handshake(&mut ws, r#"{"max_payload":16}"#).await;
            send_text(&mut ws, "PONG\r\n").await;
            assert_eq!(next_text(&mut ws).await, "SUB big.> 1\r\n");
            send_text(&mut ws, "MSG big.one 1 18446744073709551615\r\n").await;
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_close() {
                    break;
                }
            }
        })
        .await;

        let Established {
            session,
            mut events,
        } = WsTransport::new().connect(&user_pass(&url)).await.unwrap();
        let mut sub = session.subscribe("big.>").unwrap();

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Error { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnect { .. })
        ));
        assert!(sub.messages.recv().await.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        // Port 1 is reserved and nothing listens there
        let result = WsTransport::new()
            .connect(&ConnectOptions::new("ws://127.0.0.1:1"))
            .await;
        assert!(result.is_err());
    }
}

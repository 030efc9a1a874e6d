//! Gateway: accepts browser connections and runs one [`Session`] per connection.
//!
//! # Data Flow
//!
//! ```text
//! WebSocket listener
//!   → Gateway::new_connection            (id allocated, registry insert)
//!     → Session::run                     (token → settings → hook)
//!       → DaemonLink::open               (connect, select, handshake)
//!       ⇄ relay until either end closes or times out
//!     → registry remove, GatewayEvent::Close
//! ```
//!
//! Hosts observe sessions through [`Gateway::subscribe`] and may veto or
//! rewrite settings with a [`SettingsValidator`].

pub mod registry;

pub use registry::SessionRegistry;

use crate::config::GatewayConfig;
use crate::session::{accept_all, Session, SessionContext, SettingsValidator, DAEMON_INACTIVITY_TIMEOUT};
use crate::transport::websocket::start_listener;
use guac_core::{GuacError, GuacResult, SettingsResolver, TokenCipher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, info_span, Instrument};

/// Lifecycle notifications for the embedding host.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// guacd accepted the handshake.
    Open { session_id: u64 },
    /// The session is fully torn down and out of the registry.
    Close { session_id: u64 },
    /// The session is closing because of `error`. Always followed by `Close`.
    Error {
        session_id: u64,
        error: Arc<GuacError>,
    },
}

/// The gateway. Share it as `Arc<Gateway>`.
pub struct Gateway {
    config: GatewayConfig,
    context: Arc<SessionContext>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    /// Gateway that accepts every resolved session unchanged.
    pub fn new(config: GatewayConfig) -> GuacResult<Self> {
        Self::with_validator(config, accept_all())
    }

    /// Gateway that runs `validator` on every session before contacting guacd.
    pub fn with_validator(config: GatewayConfig, validator: Arc<dyn SettingsValidator>) -> GuacResult<Self> {
        Self::build(config, validator, DAEMON_INACTIVITY_TIMEOUT)
    }

    fn build(
        config: GatewayConfig,
        validator: Arc<dyn SettingsValidator>,
        daemon_inactivity: Duration,
    ) -> GuacResult<Self> {
        let key = config
            .key
            .as_deref()
            .ok_or_else(|| GuacError::Config("no token key configured ([crypt] key)".into()))?;
        let cipher = TokenCipher::new(config.cipher, key)?;

        let (events, _) = broadcast::channel(256);
        let context = SessionContext {
            daemon: config.daemon.clone(),
            max_inactivity: config.max_inactivity,
            daemon_inactivity,
            cipher,
            resolver: SettingsResolver::new(config.defaults.clone(), config.allow_list.clone()),
            validator,
            registry: Arc::new(SessionRegistry::new()),
            events,
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            context: Arc::new(context),
            next_id: AtomicU64::new(1),
            shutdown_tx,
        })
    }

    /// Receive lifecycle events for every session.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.context.events.subscribe()
    }

    /// Start a session for an upgraded browser connection.
    ///
    /// `request_uri` is the upgrade request's path and query. Returns the new
    /// session id; the session runs on its own task.
    pub async fn new_connection<S>(&self, ws: WebSocketStream<S>, request_uri: &str) -> u64
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        self.context.registry.insert(id, cancel_tx).await;

        let session = Session::new(id, ws, Arc::clone(&self.context), cancel_rx);
        let request_uri = request_uri.to_string();
        tokio::spawn(
            async move { session.run(&request_uri).await }
                .instrument(info_span!("connection", id)),
        );
        id
    }

    /// Accept WebSocket connections on the configured address until
    /// [`close`](Self::close) is called.
    pub async fn run(self: Arc<Self>) -> GuacResult<()> {
        let (mut connections, accept_task) = start_listener(self.config.bind_addr).await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(daemon = %self.config.daemon.address(), "gateway started");

        loop {
            tokio::select! {
                _ = shutdown_rx.wait_for(|closed| *closed) => break,
                conn = connections.recv() => match conn {
                    Some(conn) => {
                        debug!(remote = %conn.remote_addr, "new client connection");
                        self.new_connection(conn.ws_stream, &conn.request_uri).await;
                    }
                    None => break,
                },
            }
        }

        accept_task.abort();
        info!("gateway stopped accepting connections");
        Ok(())
    }

    /// Close one session. Returns `false` if no such session is open.
    pub async fn close_session(&self, id: u64) -> bool {
        self.context.registry.cancel(id).await
    }

    pub async fn active_sessions(&self) -> usize {
        self.context.registry.len().await
    }

    pub async fn session_ids(&self) -> Vec<u64> {
        self.context.registry.ids().await
    }

    /// Stop accepting and close every open session.
    pub async fn close(&self) {
        self.shutdown_tx.send_replace(true);
        let closing = self.context.registry.cancel_all().await;
        info!(sessions = closing, "gateway closing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, ConfigOverrides};
    use futures_util::{SinkExt, StreamExt};
    use guac_core::{CipherAlgorithm, ConnectionSettings, TokenPayload};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;

    const KEY: &str = "MySuperSecretKeyForParamsToken12";
    const WAIT: Duration = Duration::from_secs(2);

    type Browser = WebSocketStream<tokio::io::DuplexStream>;

    async fn fake_daemon() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn config(daemon_port: u16, max_inactivity_ms: u64) -> GatewayConfig {
        let mut file = ConfigFile::default();
        file.crypt.key = Some(KEY.into());
        let overrides = ConfigOverrides {
            daemon_host: Some("127.0.0.1".into()),
            daemon_port: Some(daemon_port),
            max_inactivity_ms: Some(max_inactivity_ms),
            ..Default::default()
        };
        GatewayConfig::from_file(file, overrides).unwrap()
    }

    fn gateway(daemon_port: u16, max_inactivity_ms: u64) -> Gateway {
        Gateway::new(config(daemon_port, max_inactivity_ms)).unwrap()
    }

    fn token(payload: serde_json::Value) -> String {
        let payload: TokenPayload = serde_json::from_value(payload).unwrap();
        let cipher = TokenCipher::new(CipherAlgorithm::Aes256Gcm, KEY.as_bytes()).unwrap();
        let token = cipher.encrypt(&payload).unwrap();
        url::form_urlencoded::byte_serialize(token.as_bytes()).collect()
    }

    fn rdp_uri(extra: &str) -> String {
        let token = token(json!({"connection": {"type": "rdp", "settings": {"hostname": "desk"}}}));
        format!("/?token={token}{extra}")
    }

    async fn ws_pair() -> (WebSocketStream<tokio::io::DuplexStream>, Browser) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    async fn accept_daemon(listener: &TcpListener) -> TcpStream {
        timeout(WAIT, listener.accept()).await.unwrap().unwrap().0
    }

    async fn read_until(stream: &mut TcpStream, terminators: usize) -> String {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while received.iter().filter(|&&b| b == b';').count() < terminators {
            let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap();
            assert!(n > 0, "gateway closed the daemon socket early");
            received.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(received).unwrap()
    }

    async fn next_event(events: &mut broadcast::Receiver<GatewayEvent>) -> GatewayEvent {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    /// Drive guacd's side of the handshake for a session requesting `args`.
    async fn complete_handshake(daemon: &mut TcpStream) {
        read_until(daemon, 1).await;
        daemon.write_all(b"4.args,8.hostname;").await.unwrap();
        read_until(daemon, 5).await;
    }

    async fn expect_browser_closed(browser: &mut Browser) {
        loop {
            match timeout(WAIT, browser.next()).await.unwrap() {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(other)) => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_and_forwarding() {
        let (listener, port) = fake_daemon().await;
        let validator = Arc::new(|settings: ConnectionSettings| async move {
            let mut parameters = settings.parameters;
            parameters.insert("password".into(), json!("from-hook"));
            Ok::<_, String>(ConnectionSettings::new(settings.connection_type, parameters))
        });
        let gateway = Gateway::with_validator(config(port, 10_000), validator).unwrap();
        let mut events = gateway.subscribe();

        let (server_ws, mut browser) = ws_pair().await;
        let uri = rdp_uri("&width=640&hostname=evil&GUAC_AUDIO=audio%2FL16");
        let id = gateway.new_connection(server_ws, &uri).await;
        assert_eq!(id, 1);
        assert_eq!(gateway.session_ids().await, [1]);

        let mut daemon = accept_daemon(&listener).await;
        assert_eq!(read_until(&mut daemon, 1).await, "6.select,3.rdp;");

        daemon.write_all(b"4.args,8.hostname,5.width,8.password;").await.unwrap();
        assert_eq!(
            read_until(&mut daemon, 5).await,
            "4.size,3.640,3.768,2.96;5.audio,9.audio/L16;5.video;5.image;\
             7.connect,4.desk,3.640,9.from-hook;"
        );

        match next_event(&mut events).await {
            GatewayEvent::Open { session_id } => assert_eq!(session_id, 1),
            other => panic!("expected open, got {other:?}"),
        }

        daemon.write_all(b"4.sync,1.1;4.sync,1.2;3.nop").await.unwrap();
        match timeout(WAIT, browser.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => assert_eq!(text, "4.sync,1.1;4.sync,1.2;"),
            other => panic!("unexpected message: {other:?}"),
        }

        browser.send(Message::Text("3.key,2.65,1.1;".into())).await.unwrap();
        assert_eq!(read_until(&mut daemon, 1).await, "3.key,2.65,1.1;");

        browser.close(None).await.unwrap();
        match next_event(&mut events).await {
            GatewayEvent::Close { session_id } => assert_eq!(session_id, 1),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(gateway.active_sessions().await, 0);

        let mut buf = [0u8; 16];
        let n = timeout(WAIT, daemon.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0, "daemon socket should close with the session");
    }

    #[tokio::test]
    async fn test_bad_token_never_contacts_daemon() {
        let (listener, port) = fake_daemon().await;
        let gateway = gateway(port, 10_000);
        let mut events = gateway.subscribe();

        for uri in ["/?token=bm90LWEtdG9rZW4%3D", "/?width=800"] {
            let (server_ws, mut browser) = ws_pair().await;
            let id = gateway.new_connection(server_ws, uri).await;

            match next_event(&mut events).await {
                GatewayEvent::Error { session_id, error } => {
                    assert_eq!(session_id, id);
                    assert!(matches!(*error, GuacError::TokenValidation));
                }
                other => panic!("expected error, got {other:?}"),
            }
            assert!(matches!(next_event(&mut events).await, GatewayEvent::Close { .. }));
            expect_browser_closed(&mut browser).await;
        }

        assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());
        assert_eq!(gateway.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_validator_rejection() {
        let (listener, port) = fake_daemon().await;
        let validator = Arc::new(|_settings: ConnectionSettings| async move {
            Err::<ConnectionSettings, _>("host not permitted".to_string())
        });
        let gateway = Gateway::with_validator(config(port, 10_000), validator).unwrap();
        let mut events = gateway.subscribe();

        let (server_ws, mut browser) = ws_pair().await;
        gateway.new_connection(server_ws, &rdp_uri("")).await;

        match next_event(&mut events).await {
            GatewayEvent::Error { error, .. } => match &*error {
                GuacError::SettingsRejected(reason) => assert_eq!(reason, "host not permitted"),
                other => panic!("expected rejection, got {other:?}"),
            },
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Close { .. }));
        expect_browser_closed(&mut browser).await;
        assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_browser_inactivity_closes_both_ends() {
        let (listener, port) = fake_daemon().await;
        let gateway = gateway(port, 100);
        let mut events = gateway.subscribe();

        let (server_ws, mut browser) = ws_pair().await;
        let started = tokio::time::Instant::now();
        gateway.new_connection(server_ws, &rdp_uri("")).await;
        let mut daemon = accept_daemon(&listener).await;

        match next_event(&mut events).await {
            GatewayEvent::Error { error, .. } => {
                assert!(matches!(*error, GuacError::BrowserInactivityTimeout));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Close { .. }));
        expect_browser_closed(&mut browser).await;

        read_until(&mut daemon, 1).await;
        let mut buf = [0u8; 16];
        let n = timeout(WAIT, daemon.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_browser_activity_resets_inactivity() {
        let (listener, port) = fake_daemon().await;
        let gateway = gateway(port, 150);
        let mut events = gateway.subscribe();

        let (server_ws, mut browser) = ws_pair().await;
        gateway.new_connection(server_ws, &rdp_uri("")).await;
        let mut daemon = accept_daemon(&listener).await;
        complete_handshake(&mut daemon).await;
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Open { .. }));

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(75)).await;
            browser.send(Message::Text("3.nop;".into())).await.unwrap();
        }
        assert_eq!(gateway.active_sessions().await, 1);

        match next_event(&mut events).await {
            GatewayEvent::Error { error, .. } => {
                assert!(matches!(*error, GuacError::BrowserInactivityTimeout));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_daemon_hangup_closes_browser_without_error() {
        let (listener, port) = fake_daemon().await;
        let gateway = gateway(port, 10_000);
        let mut events = gateway.subscribe();

        let (server_ws, mut browser) = ws_pair().await;
        gateway.new_connection(server_ws, &rdp_uri("")).await;
        let mut daemon = accept_daemon(&listener).await;
        complete_handshake(&mut daemon).await;
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Open { .. }));

        drop(daemon);
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Close { session_id: 1 }));
        expect_browser_closed(&mut browser).await;
    }

    #[tokio::test]
    async fn test_unreachable_daemon_reports_error() {
        let (listener, port) = fake_daemon().await;
        drop(listener);
        let gateway = gateway(port, 10_000);
        let mut events = gateway.subscribe();

        let (server_ws, mut browser) = ws_pair().await;
        gateway.new_connection(server_ws, &rdp_uri("")).await;

        match next_event(&mut events).await {
            GatewayEvent::Error { error, .. } => {
                assert!(matches!(*error, GuacError::DaemonUnreachable(_)));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Close { .. }));
        expect_browser_closed(&mut browser).await;
    }

    #[tokio::test]
    async fn test_closing_one_session_leaves_others() {
        let (listener, port) = fake_daemon().await;
        let gateway = gateway(port, 10_000);
        let mut events = gateway.subscribe();

        let (server_a, mut browser_a) = ws_pair().await;
        let id_a = gateway.new_connection(server_a, &rdp_uri("")).await;
        let mut daemon_a = accept_daemon(&listener).await;

        let (server_b, mut browser_b) = ws_pair().await;
        let id_b = gateway.new_connection(server_b, &rdp_uri("")).await;
        let mut daemon_b = accept_daemon(&listener).await;
        assert_ne!(id_a, id_b);

        complete_handshake(&mut daemon_a).await;
        complete_handshake(&mut daemon_b).await;
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Open { .. }));
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Open { .. }));

        assert!(gateway.close_session(id_a).await);
        match next_event(&mut events).await {
            GatewayEvent::Close { session_id } => assert_eq!(session_id, id_a),
            other => panic!("expected close, got {other:?}"),
        }
        expect_browser_closed(&mut browser_a).await;
        assert_eq!(gateway.session_ids().await, [id_b]);
        assert!(!gateway.close_session(id_a).await);

        daemon_b.write_all(b"4.sync,1.7;").await.unwrap();
        match timeout(WAIT, browser_b.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => assert_eq!(text, "4.sync,1.7;"),
            other => panic!("unexpected message: {other:?}"),
        }
        browser_b.send(Message::Text("4.sync,1.7;".into())).await.unwrap();
        assert_eq!(read_until(&mut daemon_b, 1).await, "4.sync,1.7;");
    }

    #[tokio::test]
    async fn test_gateway_close_closes_every_session() {
        let (listener, port) = fake_daemon().await;
        let gateway = gateway(port, 10_000);
        let mut events = gateway.subscribe();

        let mut browsers = Vec::new();
        let mut daemons = Vec::new();
        for _ in 0..2 {
            let (server_ws, browser) = ws_pair().await;
            gateway.new_connection(server_ws, &rdp_uri("")).await;
            browsers.push(browser);
            daemons.push(accept_daemon(&listener).await);
        }
        assert_eq!(gateway.active_sessions().await, 2);

        gateway.close().await;
        for _ in 0..2 {
            assert!(matches!(next_event(&mut events).await, GatewayEvent::Close { .. }));
        }
        assert_eq!(gateway.active_sessions().await, 0);
        for browser in &mut browsers {
            expect_browser_closed(browser).await;
        }
    }

    /// Send 64 KiB frames from the browser until the session goes away, then
    /// wait for its close frame.
    fn flood_from_browser(mut browser: Browser) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let frame = "x".repeat(64 * 1024);
            for _ in 0..512 {
                if browser.send(Message::Text(frame.clone())).await.is_err() {
                    return;
                }
            }
            while let Some(Ok(_)) = browser.next().await {}
        })
    }

    #[tokio::test]
    async fn test_daemon_not_reading_times_out() {
        let (listener, port) = fake_daemon().await;
        let gateway = Gateway::build(config(port, 0), accept_all(), Duration::from_millis(300)).unwrap();
        let mut events = gateway.subscribe();

        let (server_ws, browser) = ws_pair().await;
        gateway.new_connection(server_ws, &rdp_uri("")).await;
        let mut daemon = accept_daemon(&listener).await;
        complete_handshake(&mut daemon).await;
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Open { .. }));

        // guacd stays connected but stops reading.
        let flood = flood_from_browser(browser);

        match next_event(&mut events).await {
            GatewayEvent::Error { error, .. } => {
                assert!(matches!(*error, GuacError::DaemonInactivityTimeout));
            }
            other => panic!("expected daemon timeout, got {other:?}"),
        }
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Close { .. }));
        assert_eq!(gateway.active_sessions().await, 0);
        timeout(WAIT, flood).await.unwrap().unwrap();
        drop(daemon);
    }

    #[tokio::test]
    async fn test_close_session_while_daemon_not_reading() {
        let (listener, port) = fake_daemon().await;
        let gateway = gateway(port, 0);
        let mut events = gateway.subscribe();

        let (server_ws, browser) = ws_pair().await;
        let id = gateway.new_connection(server_ws, &rdp_uri("")).await;
        let mut daemon = accept_daemon(&listener).await;
        complete_handshake(&mut daemon).await;
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Open { .. }));

        let flood = flood_from_browser(browser);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(gateway.close_session(id).await);
        match next_event(&mut events).await {
            GatewayEvent::Close { session_id } => assert_eq!(session_id, id),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(gateway.active_sessions().await, 0);
        timeout(WAIT, flood).await.unwrap().unwrap();
        drop(daemon);
    }

    #[tokio::test]
    async fn test_close_session_while_browser_not_reading() {
        let (listener, port) = fake_daemon().await;
        let gateway = gateway(port, 0);
        let mut events = gateway.subscribe();

        let (server_ws, browser) = ws_pair().await;
        let id = gateway.new_connection(server_ws, &rdp_uri("")).await;
        let mut daemon = accept_daemon(&listener).await;
        complete_handshake(&mut daemon).await;
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Open { .. }));

        // guacd streams far more than the browser transport buffers.
        let writer = tokio::spawn(async move {
            let chunk = format!("4.blob,{}.{};", 60 * 1024, "y".repeat(60 * 1024));
            for _ in 0..256 {
                if daemon.write_all(chunk.as_bytes()).await.is_err() {
                    break;
                }
            }
            daemon
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(gateway.close_session(id).await);
        match next_event(&mut events).await {
            GatewayEvent::Close { session_id } => assert_eq!(session_id, id),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(gateway.active_sessions().await, 0);
        drop(browser);
        timeout(WAIT, writer).await.unwrap().unwrap();
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let config = GatewayConfig::from_file(ConfigFile::default(), ConfigOverrides::default()).unwrap();
        assert!(matches!(Gateway::new(config), Err(GuacError::Config(_))));
    }
}

//! Browser sessions.
//!
//! A [`Session`] owns one browser WebSocket and, once its token has been
//! accepted, one [`DaemonLink`]. It runs as a single task: every state change
//! happens inside [`Session::run`], so no locking is needed per session.

pub mod activity;
pub mod daemon;
pub mod hook;

pub use activity::InactivityMonitor;
pub use daemon::{DaemonLink, LinkEvent, LinkState, DAEMON_INACTIVITY_TIMEOUT};
pub use hook::{accept_all, SettingsValidator, ValidationFuture};

use crate::config::DaemonTarget;
use crate::gateway::registry::SessionRegistry;
use crate::gateway::GatewayEvent;
use crate::handshake::{ClientCapabilities, Handshake};
use futures_util::{SinkExt, StreamExt};
use guac_core::{GuacError, GuacResult, QueryParams, SettingsResolver, TokenCipher};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, trace};

/// Query parameter carrying the encrypted connection token.
pub const TOKEN_PARAM: &str = "token";

/// How long to wait for the browser to acknowledge a close frame.
const WS_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the relay loop stopped: `None` for a clean close.
type Ending = Option<GuacError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

/// Everything a session needs from the gateway, shared by all sessions.
pub struct SessionContext {
    pub daemon: DaemonTarget,
    /// Browser-side inactivity threshold; `None` disables it.
    pub max_inactivity: Option<Duration>,
    pub daemon_inactivity: Duration,
    pub cipher: TokenCipher,
    pub resolver: SettingsResolver,
    pub validator: Arc<dyn SettingsValidator>,
    pub registry: Arc<SessionRegistry>,
    pub events: broadcast::Sender<GatewayEvent>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("daemon", &self.daemon)
            .field("max_inactivity", &self.max_inactivity)
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

/// One browser connection relayed to guacd.
pub struct Session<S> {
    id: u64,
    state: SessionState,
    ws: WebSocketStream<S>,
    link: Option<DaemonLink>,
    monitor: InactivityMonitor,
    ctx: Arc<SessionContext>,
    /// The gateway's handle for closing this session from outside; a message
    /// (or the sender being dropped) closes it cleanly.
    cancel_rx: mpsc::Receiver<()>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: u64,
        ws: WebSocketStream<S>,
        ctx: Arc<SessionContext>,
        cancel_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            id,
            state: SessionState::Open,
            ws,
            link: None,
            monitor: InactivityMonitor::new(ctx.max_inactivity),
            ctx,
            cancel_rx,
        }
    }

    /// Drive the session to completion.
    pub async fn run(mut self, request_uri: &str) {
        debug!(uri = %request_uri, "client connection open");

        let outcome = match self.establish(request_uri).await {
            Ok(Some(link_events)) => self.relay(link_events).await,
            Ok(None) => None,
            Err(e) => Some(e),
        };

        match outcome {
            Some(e) => self.error(e).await,
            None => self.close(None).await,
        }
    }

    /// Token, settings and hook. Opens the daemon link on success.
    ///
    /// Returns `Ok(None)` when the session was cancelled while the hook ran.
    async fn establish(&mut self, request_uri: &str) -> GuacResult<Option<mpsc::Receiver<LinkEvent>>> {
        let mut query = QueryParams::parse(request_uri);
        let token = query.take(TOKEN_PARAM).ok_or(GuacError::TokenValidation)?;
        let payload = self.ctx.cipher.decrypt(&token)?;

        let settings = self.ctx.resolver.resolve(&payload, &query);
        debug!(
            connection_type = settings.connection_type.map(|t| t.as_str()).unwrap_or(""),
            width = settings.dimensions.width,
            height = settings.dimensions.height,
            dpi = settings.dimensions.dpi,
            "resolved connection settings"
        );

        let settings = tokio::select! {
            _ = self.cancel_rx.recv() => return Ok(None),
            result = self.ctx.validator.validate(settings) => {
                result.map_err(GuacError::SettingsRejected)?
            }
        };

        let handshake = Handshake::new(settings, ClientCapabilities::from_query(&query));
        let (events_tx, events_rx) = mpsc::channel(64);
        self.link = Some(DaemonLink::open(
            &self.ctx.daemon,
            handshake,
            self.ctx.daemon_inactivity,
            events_tx,
        ));
        self.monitor.touch();
        Ok(Some(events_rx))
    }

    /// Forward traffic until one side ends. Returns the closing error, if any.
    ///
    /// Writes to the browser go through [`Session::send`], so cancel and the
    /// inactivity deadline still apply while the browser is slow to read.
    async fn relay(&mut self, mut link_events: mpsc::Receiver<LinkEvent>) -> Ending {
        loop {
            tokio::select! {
                _ = self.cancel_rx.recv() => {
                    debug!("session closed by gateway");
                    return None;
                }
                _ = self.monitor.expired() => {
                    return Some(GuacError::BrowserInactivityTimeout);
                }
                event = link_events.recv() => match event {
                    Some(LinkEvent::Open) => {
                        if let Some(link) = self.link.as_mut() {
                            if link.mark_open() {
                                debug!("guacd handshake complete");
                                let _ = self.ctx.events.send(GatewayEvent::Open { session_id: self.id });
                            }
                        }
                    }
                    Some(LinkEvent::Data(text)) => {
                        trace!(data = %text, "guacd -> browser");
                        if let Err(ending) = self.send(Message::Text(text)).await {
                            return ending;
                        }
                    }
                    Some(LinkEvent::Closed(error)) => {
                        if let Some(link) = self.link.as_mut() {
                            link.mark_closed();
                        }
                        return error;
                    }
                    None => return None,
                },
                msg = self.ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.process_received_message(text.into_bytes()),
                    Some(Ok(Message::Binary(data))) => self.process_received_message(data),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(ending) = self.send(Message::Pong(payload)).await {
                            return ending;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("client closed connection");
                        return None;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Some(GuacError::Transport(e.to_string())),
                },
            }
        }
    }

    /// Browser data goes to guacd verbatim.
    fn process_received_message(&mut self, data: Vec<u8>) {
        self.monitor.touch();
        if let Some(link) = self.link.as_ref() {
            link.send(data);
        }
    }

    /// Write one frame to the browser unless the session is cancelled or
    /// goes idle first.
    async fn send(&mut self, message: Message) -> Result<(), Ending> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel_rx.recv() => {
                debug!("session closed by gateway");
                Err(None)
            }
            _ = self.monitor.expired() => Err(Some(GuacError::BrowserInactivityTimeout)),
            result = self.ws.send(message) => {
                result.map_err(|e| Some(GuacError::Transport(e.to_string())))
            }
        }
    }

    /// Report `error` to the host, then close.
    async fn error(&mut self, error: GuacError) {
        let error = Arc::new(error);
        let _ = self.ctx.events.send(GatewayEvent::Error {
            session_id: self.id,
            error: Arc::clone(&error),
        });
        self.close(Some(error.as_ref())).await;
    }

    /// Tear down both ends. Idempotent.
    async fn close(&mut self, error: Option<&GuacError>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.monitor.stop();

        if let Some(error) = error {
            error!(%error, "closing connection with error");
        }

        if let Some(link) = self.link.as_mut() {
            link.close(error);
        }

        match tokio::time::timeout(WS_CLOSE_TIMEOUT, self.ws.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "websocket close failed"),
            Err(_) => debug!("websocket close timed out"),
        }

        self.ctx.registry.remove(self.id).await;
        self.state = SessionState::Closed;
        let _ = self.ctx.events.send(GatewayEvent::Close { session_id: self.id });
        debug!("client connection closed");
    }
}

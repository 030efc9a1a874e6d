//! Connection to guacd for one session.
//!
//! [`DaemonLink::open`] spawns a relay task that owns the TCP socket. The
//! task connects, sends `select`, answers guacd's attribute request, and
//! afterwards forwards every complete instruction to the session through an
//! `mpsc` channel of [`LinkEvent`]s. The session writes to guacd through the
//! [`DaemonLink`] handle, which is also how the task gets cancelled.
//!
//! ```text
//! OPENING ──(handshake reply sent)──▶ OPEN
//!    │                                  │
//!    └──────────────▶ CLOSED ◀──────────┘
//! ```

use super::activity::InactivityMonitor;
use crate::config::DaemonTarget;
use crate::handshake::Handshake;
use guac_core::{GuacError, InstructionBuffer};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, Instrument};

/// guacd is considered gone after this long without sending anything.
pub const DAEMON_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a [`DaemonLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Connecting or handshaking.
    Opening,
    /// Handshake reply sent; instructions flow both ways.
    Open,
    /// Terminal.
    Closed,
}

/// Notifications from the relay task to the owning session.
#[derive(Debug)]
pub enum LinkEvent {
    /// The handshake completed. Sent at most once.
    Open,
    /// One or more complete instructions to forward to the browser.
    Data(String),
    /// The task ended on its own: guacd hung up (`None`) or failed.
    Closed(Option<GuacError>),
}

/// Handle to a session's guacd connection.
#[derive(Debug)]
pub struct DaemonLink {
    state: LinkState,
    /// Session→guacd data. Unbounded so the session loop never waits on
    /// guacd; a guacd that stops reading trips its inactivity timeout.
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Dropping or sending stops the relay task.
    cancel_tx: mpsc::Sender<()>,
}

impl DaemonLink {
    /// Connect to guacd and start the handshake in a background task.
    ///
    /// `inactivity_timeout` runs from this call, so it also bounds the connect.
    pub fn open(
        target: &DaemonTarget,
        handshake: Handshake,
        inactivity_timeout: Duration,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let relay = LinkRelay {
            address: target.address(),
            handshake,
            monitor: InactivityMonitor::new(Some(inactivity_timeout)),
            buffer: InstructionBuffer::new(),
            handshake_sent: false,
            opened: false,
            events,
            cancel_rx,
        };
        tokio::spawn(relay.run(write_rx).in_current_span());

        Self {
            state: LinkState::Opening,
            write_tx,
            cancel_tx,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Queue raw bytes for guacd. Never waits. No-op once closed.
    pub fn send(&self, data: Vec<u8>) {
        if self.state == LinkState::Closed {
            return;
        }
        trace!(data = %String::from_utf8_lossy(&data), "browser -> guacd");
        if self.write_tx.send(data).is_err() {
            debug!("daemon write channel closed, relay ended");
        }
    }

    /// Record the handshake completing. Returns `true` on the first call only.
    pub fn mark_open(&mut self) -> bool {
        if self.state != LinkState::Opening {
            return false;
        }
        self.state = LinkState::Open;
        true
    }

    /// Record that the relay task ended on its own.
    pub fn mark_closed(&mut self) {
        self.state = LinkState::Closed;
    }

    /// Stop the relay task and close the socket. Idempotent.
    ///
    /// Safe while a write to guacd is in flight: the relay races every write
    /// against this signal.
    pub fn close(&mut self, error: Option<&GuacError>) {
        if self.state == LinkState::Closed {
            return;
        }
        match error {
            Some(error) => debug!(%error, "closing guacd connection with error"),
            None => debug!("closing guacd connection"),
        }
        let _ = self.cancel_tx.try_send(());
        self.state = LinkState::Closed;
    }
}

/// State owned by the relay task.
struct LinkRelay {
    address: String,
    handshake: Handshake,
    monitor: InactivityMonitor,
    buffer: InstructionBuffer,
    handshake_sent: bool,
    opened: bool,
    events: mpsc::Sender<LinkEvent>,
    cancel_rx: mpsc::Receiver<()>,
}

/// How the relay loop ended.
enum RelayEnd {
    /// The session closed the link (or went away); it needs no notification.
    Cancelled,
    /// The link ended on its own; report to the session.
    Closed(Option<GuacError>),
}

/// Output of one read from guacd, delivered in order: replies first.
#[derive(Default)]
struct Received {
    replies: Vec<Vec<u8>>,
    events: Vec<LinkEvent>,
}

impl LinkRelay {
    async fn run(mut self, write_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let address = self.address.clone();
        let end = match self.guarded(TcpStream::connect(address)).await {
            Err(end) => end,
            Ok(Err(e)) => RelayEnd::Closed(Some(GuacError::DaemonUnreachable(format!(
                "{}: {e}",
                self.address
            )))),
            Ok(Ok(stream)) => {
                debug!(addr = %self.address, "guacd connection open");
                self.relay(stream, write_rx).await
            }
        };

        match end {
            RelayEnd::Cancelled => debug!("guacd relay cancelled"),
            RelayEnd::Closed(error) => {
                debug!("guacd relay ended");
                let notify = self.events.send(LinkEvent::Closed(error));
                tokio::select! {
                    _ = self.cancel_rx.recv() => {}
                    _ = notify => {}
                }
            }
        }
    }

    /// Await `fut` unless the link is cancelled or guacd goes quiet first.
    async fn guarded<F: Future>(&mut self, fut: F) -> Result<F::Output, RelayEnd> {
        tokio::select! {
            _ = self.cancel_rx.recv() => Err(RelayEnd::Cancelled),
            _ = self.monitor.expired() => {
                Err(RelayEnd::Closed(Some(GuacError::DaemonInactivityTimeout)))
            }
            output = fut => Ok(output),
        }
    }

    /// Write to guacd, guarded by cancel and the inactivity deadline.
    async fn write(&mut self, write_half: &mut OwnedWriteHalf, data: &[u8]) -> Result<(), RelayEnd> {
        self.guarded(write_half.write_all(data))
            .await?
            .map_err(|e| RelayEnd::Closed(Some(GuacError::Daemon(e.to_string()))))
    }

    /// Bidirectional relay. Four concurrent branches:
    /// - **Cancel**: the session closed the link.
    /// - **Inactivity**: guacd sent nothing for too long.
    /// - **guacd→session**: handshake while opening, bulk forwarding after.
    /// - **session→guacd**: raw bytes written verbatim.
    ///
    /// Every await inside a branch is itself guarded, so cancel and the
    /// deadline stay live while a write is stalled.
    async fn relay(&mut self, stream: TcpStream, mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>) -> RelayEnd {
        let (mut read_half, mut write_half) = stream.into_split();

        debug!(
            connection_type = self.handshake.settings().connection_type.map(|t| t.as_str()).unwrap_or(""),
            "selecting connection type"
        );
        let select = self.handshake.select();
        let end = match self.write(&mut write_half, &select).await {
            Err(end) => end,
            Ok(()) => self.forward(&mut read_half, &mut write_half, &mut write_rx).await,
        };

        let _ = write_half.shutdown().await;
        end
    }

    async fn forward(
        &mut self,
        read_half: &mut OwnedReadHalf,
        write_half: &mut OwnedWriteHalf,
        write_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> RelayEnd {
        let mut buf = vec![0u8; 8192];
        loop {
            tokio::select! {
                _ = self.cancel_rx.recv() => return RelayEnd::Cancelled,
                _ = self.monitor.expired() => {
                    return RelayEnd::Closed(Some(GuacError::DaemonInactivityTimeout));
                }
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!("guacd closed connection");
                        return RelayEnd::Closed(None);
                    }
                    Ok(n) => {
                        self.monitor.touch();
                        self.buffer.feed(&buf[..n]);
                        let received = match self.process_received() {
                            Ok(received) => received,
                            Err(error) => return RelayEnd::Closed(Some(error)),
                        };
                        if let Err(end) = self.deliver(write_half, received).await {
                            return end;
                        }
                    }
                    Err(e) => return RelayEnd::Closed(Some(GuacError::Daemon(e.to_string()))),
                },
                Some(data) = write_rx.recv() => {
                    if let Err(end) = self.write(write_half, &data).await {
                        return end;
                    }
                }
            }
        }
    }

    /// Decode buffered guacd data after a read.
    fn process_received(&mut self) -> Result<Received, GuacError> {
        let mut received = Received::default();

        if !self.handshake_sent {
            // Incomplete handshake from guacd; wait for the next part.
            let Some(requested) = self.buffer.next_instruction() else {
                return Ok(received);
            };
            debug!(%requested, "guacd sent handshake");
            received.replies = self.handshake.reply(&requested);
            self.handshake_sent = true;
        }

        if !self.opened {
            self.opened = true;
            received.events.push(LinkEvent::Open);
        }

        if let Some(chunk) = self.buffer.take_complete() {
            let text = String::from_utf8(chunk)
                .map_err(|e| GuacError::Codec(format!("guacd sent invalid UTF-8: {e}")))?;
            received.events.push(LinkEvent::Data(text));
        }
        Ok(received)
    }

    /// Send handshake replies to guacd, then events to the session.
    async fn deliver(&mut self, write_half: &mut OwnedWriteHalf, received: Received) -> Result<(), RelayEnd> {
        for reply in &received.replies {
            trace!(data = %String::from_utf8_lossy(reply), "handshake -> guacd");
            self.write(write_half, reply).await?;
        }
        for event in received.events {
            let events = self.events.clone();
            if self.guarded(events.send(event)).await?.is_err() {
                // Session dropped its receiver.
                return Err(RelayEnd::Cancelled);
            }
        }
        Ok(())
    }
}

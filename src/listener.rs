//! Per-connection receive loop.
//!
//! The listener owns the [`Transport`] from hand-off until it exits. It
//! frames inbound bytes, answers `PING`, drives SASL and `CAP END`,
//! raises the registration-complete signal on `001`, and forwards every
//! message to the event sink. Writes from the rest of the program arrive
//! over an mpsc queue, so nothing else ever touches the socket.
//!
//! On exit it always closes the session (TLS close-notify, then the
//! socket), clears the shared `connected` flag and only then reports the
//! exit reason.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::NetError;
use crate::framer::{Crlf, Framer};
use crate::icb::{self, IcbDecoder, IcbSession};
use crate::manager::{Event, Status};
use crate::message::Message;
use crate::sasl::SaslEngine;
use crate::transport::{Transport, RECV_BUF_LEN};

/// Why the listener stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Told to stop through its cancellation token.
    Stopped,
    /// The connection failed underneath it.
    Lost(String),
}

/// Value returned from the listener task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerExit {
    /// Exit cause.
    pub reason: ExitReason,
}

enum Inbound {
    Irc(Framer<Crlf>),
    Icb {
        decoder: IcbDecoder,
        session: IcbSession,
    },
}

/// Receive loop state for one session.
pub struct Listener {
    config: Arc<Config>,
    server: String,
    inbound: Inbound,
    sasl: SaslEngine,
    events: mpsc::UnboundedSender<Event>,
    connected: Arc<AtomicBool>,
    welcome: Option<oneshot::Sender<()>>,
    outbox: Vec<Vec<u8>>,
}

impl Listener {
    /// Listener for a session registered as `nickname` on `server`.
    ///
    /// `requested_caps` is the number of `CAP REQ` lines already sent;
    /// `welcome` fires once on the first `001`.
    pub fn new(
        config: Arc<Config>,
        server: &str,
        nickname: &str,
        requested_caps: usize,
        events: mpsc::UnboundedSender<Event>,
        connected: Arc<AtomicBool>,
        welcome: oneshot::Sender<()>,
    ) -> Self {
        let inbound = if config.icb {
            Inbound::Icb {
                decoder: IcbDecoder::new(),
                session: IcbSession::new(nickname),
            }
        } else {
            Inbound::Irc(Framer::with_max_len(config.max_line_len))
        };
        let sasl = SaslEngine::new(&config, requested_caps);
        Self {
            config,
            server: server.to_owned(),
            inbound,
            sasl,
            events,
            connected,
            welcome: Some(welcome),
            outbox: Vec::new(),
        }
    }

    /// Run on a new task.
    pub fn spawn(
        self,
        transport: Transport,
        outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> JoinHandle<ListenerExit> {
        tokio::spawn(self.run(transport, outbound, cancel))
    }

    /// Run until cancelled or the connection is lost.
    pub async fn run(
        mut self,
        mut transport: Transport,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> ListenerExit {
        let reason = self.pump(&mut transport, &mut outbound, &cancel).await;

        transport.close().await;
        self.connected.store(false, Ordering::SeqCst);

        // Sessions that never registered are reported by the manager.
        let registered = self.welcome.is_none();
        match &reason {
            ExitReason::Stopped => {
                info!(server = %self.server, "disconnected");
                if registered {
                    let _ = self.events.send(Event::Status(Status::Disconnected));
                }
            }
            ExitReason::Lost(why) => {
                warn!(server = %self.server, "Connection to IRC server lost: {}", why);
                if registered {
                    let _ = self
                        .events
                        .send(Event::Status(Status::ConnectionLost(why.clone())));
                }
            }
        }
        ListenerExit { reason }
    }

    async fn pump(
        &mut self,
        transport: &mut Transport,
        outbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> ExitReason {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let interval = self.config.ping_interval();
        let dead_after = self.config.ping_timeout();
        let mut last_rx = Instant::now();
        let mut last_ping = last_rx;

        loop {
            if let Err(e) = self.flush(transport).await {
                return ExitReason::Lost(e.to_string());
            }

            let ping_at = last_rx.max(last_ping) + interval;
            let wake_at = ping_at.min(last_rx + dead_after);

            tokio::select! {
                biased;

                Some(bytes) = outbound.recv() => {
                    if let Err(e) = transport.send_raw(&bytes).await {
                        return ExitReason::Lost(e.to_string());
                    }
                }
                _ = cancel.cancelled() => return ExitReason::Stopped,
                res = transport.recv(&mut buf) => match res {
                    Ok(0) => return ExitReason::Lost(NetError::ConnectionClosed.to_string()),
                    Ok(n) => {
                        last_rx = Instant::now();
                        if let Err(e) = self.on_bytes(&buf[..n]) {
                            return ExitReason::Lost(e.to_string());
                        }
                    }
                    Err(e) => return ExitReason::Lost(e.to_string()),
                },
                _ = sleep_until(wake_at) => {
                    if last_rx.elapsed() >= dead_after {
                        return ExitReason::Lost("Ping timeout".to_owned());
                    }
                    if Instant::now() >= ping_at {
                        debug!(server = %self.server, "checking connection");
                        self.queue_ping();
                        last_ping = Instant::now();
                    }
                }
            }
        }
    }

    async fn flush(&mut self, transport: &mut Transport) -> Result<(), NetError> {
        for bytes in std::mem::take(&mut self.outbox) {
            transport.send_raw(&bytes).await?;
        }
        Ok(())
    }

    fn on_bytes(&mut self, chunk: &[u8]) -> Result<(), NetError> {
        let lines: Vec<String> = match &mut self.inbound {
            Inbound::Irc(framer) => framer
                .feed(chunk)?
                .iter()
                .map(|line| String::from_utf8_lossy(line).into_owned())
                .collect(),
            Inbound::Icb { decoder, session } => {
                let mut lines = Vec::new();
                for packet in decoder.feed(chunk) {
                    let translated = session.translate(&packet);
                    lines.extend(translated.lines);
                    self.outbox.extend(translated.replies);
                }
                lines
            }
        };

        for line in lines {
            self.dispatch(&line);
        }
        Ok(())
    }

    fn dispatch(&mut self, line: &str) {
        let Some(msg) = Message::parse(line) else {
            debug!(line, "unparsable line");
            return;
        };

        match msg.command.as_str() {
            "PING" => {
                let pong = format!("PONG :{}", msg.trailing().unwrap_or(&self.server));
                self.queue_line(&pong);
            }
            "001" => {
                if let Some(welcome) = self.welcome.take() {
                    self.connected.store(true, Ordering::SeqCst);
                    let _ = welcome.send(());
                    info!(server = %self.server, "registration complete");
                }
            }
            "ERROR" => warn!("server error: {}", msg.trailing().unwrap_or("")),
            cmd if SaslEngine::handles(cmd) => {
                for reply in self.sasl.handle(&msg) {
                    self.queue_line(&reply);
                }
            }
            _ => {}
        }

        let _ = self.events.send(Event::Message(msg));
    }

    fn queue_line(&mut self, line: &str) {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.outbox.push(bytes);
    }

    fn queue_ping(&mut self) {
        match self.inbound {
            Inbound::Irc(_) => {
                let ping = format!("PING :{}", self.server);
                self.queue_line(&ping);
            }
            Inbound::Icb { .. } => self.outbox.push(icb::noop_packet()),
        }
    }
}

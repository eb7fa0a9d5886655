//! Connection lifecycle.
//!
//! [`ConnectionManager`] runs one connect attempt at a time: resolve,
//! TCP connect, optional SOCKS5 tunnel, optional TLS, registration, then
//! hands the transport to a [`Listener`] and waits for the server's
//! welcome. Failures are folded into a single user-facing reason and
//! passed through the [`ReconnectPolicy`].
//!
//! Status changes and every received message are published on an
//! unbounded [`Event`] channel handed out by [`ConnectionManager::new`].
//!
//! A session lost underneath the listener is re-established in the
//! background when `auto_reconnect` is set. A user disconnect never
//! triggers a reconnect and cancels any pending retry sleep.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ConnError, NetError};
use crate::icb;
use crate::listener::{ExitReason, Listener, ListenerExit};
use crate::message::Message;
use crate::reconnect::{Action, ReconnectPolicy};
use crate::registration::{self, ConnectionRequest};
use crate::transport::{connect_any, Transport, CONNECT_PHASE_TIMEOUT, HANDSHAKE_TIMEOUT};
use crate::{resolver, socks, tls};

/// Reason reported when name resolution fails.
pub const REASON_RESOLVE: &str = "Unable to get a list of IP addresses";
/// Reason reported when no address accepts the connection.
pub const REASON_CONNECT: &str = "Failed to establish a connection";
/// Reason reported when the certificate does not match the host.
pub const REASON_HOSTNAME: &str = "Hostname checking failed!";
/// Reason reported when registration is not acknowledged in time.
pub const REASON_WELCOME: &str = "Event welcome not signaled!";

/// Connection state changes published to the event sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// An attempt started.
    Connecting,
    /// Registration acknowledged.
    Connected,
    /// An attempt failed.
    Failed(String),
    /// A retry is scheduled after this delay.
    Retrying(Duration),
    /// The retry budget is spent.
    GaveUp,
    /// The session ended on request.
    Disconnected,
    /// The session ended on its own.
    ConnectionLost(String),
}

/// Everything the manager publishes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Lifecycle change.
    Status(Status),
    /// Line received from the server.
    Message(Message),
}

/// Details of an established session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Established {
    /// Server as requested.
    pub server: String,
    /// Port as requested.
    pub port: String,
    /// Address actually connected to (the proxy when tunnelling).
    pub peer: SocketAddr,
    /// Whether TLS is layered on the socket.
    pub tls: bool,
}

/// The last server connected to, kept for reconnection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastServer {
    /// Host name.
    pub server: String,
    /// Port.
    pub port: String,
    /// Server password, if one was given.
    pub password: Option<String>,
}

/// Why an attempt ended without a session.
enum Abort {
    Failed(String),
    Cancelled,
}

struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    supervisor: JoinHandle<ListenerExit>,
}

struct Inner {
    config: Arc<Config>,
    events: mpsc::UnboundedSender<Event>,
    policy: Mutex<ReconnectPolicy>,
    connecting: AtomicBool,
    connected: Arc<AtomicBool>,
    last_server: RwLock<Option<LastServer>>,
    last_request: Mutex<Option<ConnectionRequest>>,
    session: Mutex<Option<Session>>,
    retry_cancel: Mutex<CancellationToken>,
    next_id: AtomicU64,
}

/// Holds the in-flight flag for the duration of one attempt.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns at most one live session. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connecting", &self.is_connecting())
            .field("connected", &self.is_connected())
            .field("last_server", &self.last_server())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager and the receiving end of its event sink.
    pub fn new(config: Arc<Config>) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self::with_sender(config, events), rx)
    }

    /// Create a manager publishing into an existing sink.
    pub fn with_sender(config: Arc<Config>, events: mpsc::UnboundedSender<Event>) -> Self {
        let policy = ReconnectPolicy::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                policy: Mutex::new(policy),
                connecting: AtomicBool::new(false),
                connected: Arc::new(AtomicBool::new(false)),
                last_server: RwLock::new(None),
                last_request: Mutex::new(None),
                session: Mutex::new(None),
                retry_cancel: Mutex::new(CancellationToken::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// True while registration is acknowledged and the listener runs.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// True while an attempt is in flight.
    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::Acquire)
    }

    /// Last server successfully connected to.
    pub fn last_server(&self) -> Option<LastServer> {
        self.inner.last_server.read().clone()
    }

    /// Failures recorded by the reconnect policy since the last success.
    pub fn failed_attempts(&self) -> u32 {
        self.inner.policy.lock().attempt()
    }

    /// Run one connect attempt.
    ///
    /// # Errors
    ///
    /// [`ConnError::AlreadyInProgress`] if another attempt is in flight,
    /// [`ConnError::AlreadyConnected`] if a session is live,
    /// [`ConnError::Cancelled`] if [`disconnect`](Self::disconnect) ran
    /// before the welcome, otherwise [`ConnError::Failed`] with the reason
    /// and the policy's decision.
    pub async fn connect(&self, req: &ConnectionRequest) -> Result<Established, ConnError> {
        let cancel = self.inner.retry_cancel.lock().child_token();
        self.connect_once(req, &cancel).await
    }

    async fn connect_once(
        &self,
        req: &ConnectionRequest,
        cancel: &CancellationToken,
    ) -> Result<Established, ConnError> {
        let Some(_in_flight) = InFlight::acquire(&self.inner.connecting) else {
            warn!(server = %req.server, "connection attempt already in progress");
            return Err(ConnError::AlreadyInProgress);
        };
        if self.inner.session.lock().is_some() {
            return Err(ConnError::AlreadyConnected);
        }

        info!("Connecting to {} ({})", req.server, req.port);
        self.publish(Status::Connecting);

        match self.attempt(req, cancel).await {
            Ok(established) => {
                self.inner.policy.lock().on_success();
                *self.inner.last_server.write() = Some(LastServer {
                    server: req.server.clone(),
                    port: req.port.clone(),
                    password: req.password.clone(),
                });
                *self.inner.last_request.lock() = Some(req.clone());
                info!(peer = %established.peer, tls = established.tls, "Connected to {}", req.server);
                self.publish(Status::Connected);
                Ok(established)
            }
            Err(Abort::Cancelled) => {
                info!(server = %req.server, "connection attempt cancelled");
                Err(ConnError::Cancelled)
            }
            Err(Abort::Failed(reason)) => {
                let action = self.inner.policy.lock().on_failure();
                warn!(server = %req.server, ?action, "{}", reason);
                self.publish(Status::Failed(reason.clone()));
                Err(ConnError::Failed { reason, action })
            }
        }
    }

    /// Connect, sleeping and retrying as the policy allows.
    ///
    /// Publishes [`Status::Retrying`] before each sleep and
    /// [`Status::GaveUp`] when the policy gives up. A call to
    /// [`disconnect`](Self::disconnect) cancels the sleep or the attempt
    /// in flight.
    pub async fn connect_with_retry(&self, req: &ConnectionRequest) -> Result<Established, ConnError> {
        let cancel = self.inner.retry_cancel.lock().child_token();
        loop {
            let err = match self.connect_once(req, &cancel).await {
                Ok(established) => return Ok(established),
                Err(err) => err,
            };
            match err.action() {
                Some(Action::RetryAfter(delay)) => {
                    info!("Reconnecting in {} seconds", delay.as_secs());
                    self.publish(Status::Retrying(delay));
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("retry cancelled");
                            return Err(err);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Some(Action::GiveUp) => {
                    warn!(server = %req.server, "giving up after repeated failures");
                    self.publish(Status::GaveUp);
                    return Err(err);
                }
                None => return Err(err),
            }
        }
    }

    /// Reconnect to the last server with the last request.
    ///
    /// Returns `None` if nothing has connected yet.
    pub async fn reconnect(&self) -> Option<Result<Established, ConnError>> {
        let req = self.inner.last_request.lock().clone()?;
        Some(self.connect_with_retry(&req).await)
    }

    /// End the session and cancel any pending retry or attempt in flight.
    ///
    /// Sends `QUIT` (with `quit_message` as its trailing text) before the
    /// listener stops. Returns the listener's exit, or `None` if no
    /// session was live. An interrupted attempt returns
    /// [`ConnError::Cancelled`] to its caller and stores no session.
    pub async fn disconnect(&self, quit_message: Option<&str>) -> Option<ListenerExit> {
        let stale = std::mem::replace(&mut *self.inner.retry_cancel.lock(), CancellationToken::new());
        stale.cancel();

        let session = self.inner.session.lock().take()?;
        if !self.inner.config.icb {
            let quit = match quit_message {
                Some(text) => format!("QUIT :{}\r\n", text),
                None => "QUIT\r\n".to_owned(),
            };
            let _ = session.outbound.send(quit.into_bytes());
        }
        session.cancel.cancel();

        match session.supervisor.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                warn!("listener supervisor failed: {}", e);
                None
            }
        }
    }

    /// Queue one protocol line; CRLF is appended.
    ///
    /// # Errors
    ///
    /// [`NetError::ConnectionClosed`] when no session is live.
    pub fn send_line(&self, line: &str) -> Result<(), NetError> {
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        self.send_raw(bytes)
    }

    /// Queue raw bytes, e.g. an ICB packet.
    ///
    /// # Errors
    ///
    /// [`NetError::ConnectionClosed`] when no session is live.
    pub fn send_raw(&self, bytes: Vec<u8>) -> Result<(), NetError> {
        let session = self.inner.session.lock();
        let session = session.as_ref().ok_or(NetError::ConnectionClosed)?;
        session
            .outbound
            .send(bytes)
            .map_err(|_| NetError::ConnectionClosed)
    }

    fn publish(&self, status: Status) {
        let _ = self.inner.events.send(Event::Status(status));
    }

    async fn attempt(
        &self,
        req: &ConnectionRequest,
        cancel: &CancellationToken,
    ) -> Result<Established, Abort> {
        let config = Arc::clone(&self.inner.config);
        let caps = if config.icb {
            Vec::new()
        } else {
            registration::requested_caps(&config)
        };

        let transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Abort::Cancelled),
            opened = self.open_and_register(req, &caps) => opened?,
        };

        let established = Established {
            server: req.server.clone(),
            port: req.port.clone(),
            peer: transport.peer_addr(),
            tls: transport.is_tls(),
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (welcome_tx, welcome_rx) = oneshot::channel();
        let stop = CancellationToken::new();
        let listener = Listener::new(
            Arc::clone(&config),
            &req.server,
            &req.nickname,
            caps.len(),
            self.inner.events.clone(),
            Arc::clone(&self.inner.connected),
            welcome_tx,
        );
        let handle = listener.spawn(transport, outbound_rx, stop.clone());

        let welcomed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            waited = timeout(config.welcome_timeout(), welcome_rx) => Some(matches!(waited, Ok(Ok(())))),
        };
        match welcomed {
            Some(true) => {}
            Some(false) => {
                stop.cancel();
                let _ = handle.await;
                return Err(Abort::Failed(REASON_WELCOME.to_owned()));
            }
            None => {
                stop.cancel();
                let _ = handle.await;
                return Err(Abort::Cancelled);
            }
        }

        // disconnect() cancels before it takes the slot, so checking under
        // the lock either stores a session it will tear down or stores none.
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = self.inner.session.lock();
            if !cancel.is_cancelled() {
                let supervisor = spawn_supervisor(self.clone(), id, handle);
                *slot = Some(Session {
                    id,
                    outbound,
                    cancel: stop,
                    supervisor,
                });
                return Ok(established);
            }
        }
        stop.cancel();
        let _ = handle.await;
        Err(Abort::Cancelled)
    }

    async fn open_and_register(
        &self,
        req: &ConnectionRequest,
        caps: &[&'static str],
    ) -> Result<Transport, Abort> {
        let mut transport = self.open_transport(req).await.map_err(Abort::Failed)?;
        if let Err(e) = register(&mut transport, req, caps, self.inner.config.icb).await {
            warn!(error = %e, "sending registration failed");
            transport.close().await;
            return Err(Abort::Failed(REASON_CONNECT.to_owned()));
        }
        Ok(transport)
    }

    async fn open_transport(&self, req: &ConnectionRequest) -> Result<Transport, String> {
        let config = &self.inner.config;
        let (host, port) = if config.socks {
            (config.socks_host.as_str(), config.socks_port.as_str())
        } else {
            (req.server.as_str(), req.port.as_str())
        };

        let addrs = resolver::resolve(host, port, HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| {
                warn!(host, port, error = %e, "resolve failed");
                REASON_RESOLVE.to_owned()
            })?;
        info!("Get a list of IP addresses complete");

        let tcp = connect_any(&addrs, CONNECT_PHASE_TIMEOUT)
            .await
            .map_err(|e| {
                warn!(host, port, error = %e, "connect failed");
                REASON_CONNECT.to_owned()
            })?;
        let mut transport = Transport::tcp(tcp).map_err(|e| {
            warn!(error = %e, "socket setup failed");
            REASON_CONNECT.to_owned()
        })?;

        if config.socks {
            let target_port: u16 = req.port.trim().parse().map_err(|_| {
                warn!(port = %req.port, "port is not a number");
                REASON_CONNECT.to_owned()
            })?;
            let stream = transport
                .tcp_mut()
                .ok_or_else(|| REASON_CONNECT.to_owned())?;
            socks::handshake(stream, &req.server, target_port, config.socks_atyp, HANDSHAKE_TIMEOUT)
                .await
                .map_err(|e| {
                    warn!(proxy = host, error = %e, "SOCKS handshake failed");
                    e.to_string()
                })?;
        }

        if config.tls {
            let tls_config = tls::client_config(config).map_err(|e| {
                warn!(error = %e, "TLS setup failed");
                REASON_CONNECT.to_owned()
            })?;
            let connector = TlsConnector::from(Arc::new(tls_config));
            transport = transport
                .upgrade_tls(&connector, &req.server, HANDSHAKE_TIMEOUT)
                .await
                .map_err(|e| {
                    if e.is_hostname_mismatch() {
                        warn!(server = %req.server, "certificate does not match host");
                        REASON_HOSTNAME.to_owned()
                    } else {
                        warn!(error = %e, "TLS handshake failed");
                        REASON_CONNECT.to_owned()
                    }
                })?;
            if config.hostname_checking {
                info!("Hostname checking OK!");
            }
        }

        Ok(transport)
    }

    async fn supervise(self, id: u64, handle: JoinHandle<ListenerExit>) -> ListenerExit {
        let exit = match handle.await {
            Ok(exit) => exit,
            Err(e) => ListenerExit {
                reason: ExitReason::Lost(format!("listener task failed: {}", e)),
            },
        };

        let removed = {
            let mut slot = self.inner.session.lock();
            if slot.as_ref().map(|s| s.id) == Some(id) {
                slot.take()
            } else {
                None
            }
        };

        if let (ExitReason::Lost(_), Some(_)) = (&exit.reason, removed) {
            if self.inner.config.auto_reconnect {
                let req = self.inner.last_request.lock().clone();
                if let Some(req) = req {
                    info!(server = %req.server, "reconnecting after connection loss");
                    spawn_retry(self.clone(), req);
                }
            }
        }
        exit
    }
}

fn spawn_supervisor(
    manager: ConnectionManager,
    id: u64,
    handle: JoinHandle<ListenerExit>,
) -> JoinHandle<ListenerExit> {
    tokio::spawn(manager.supervise(id, handle))
}

fn spawn_retry(manager: ConnectionManager, req: ConnectionRequest) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = manager.connect_with_retry(&req).await {
            debug!("background reconnect ended: {}", e);
        }
    })
}

async fn register(
    transport: &mut Transport,
    req: &ConnectionRequest,
    caps: &[&str],
    icb: bool,
) -> Result<(), NetError> {
    if icb {
        let password = req.password.as_deref().unwrap_or("");
        let login = icb::login_packet(&req.username, &req.nickname, password)?;
        return transport.send_raw(&login).await;
    }
    for line in registration::registration_lines(req, caps) {
        transport.send_line(&line).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<Config> {
        Arc::new(Config {
            reconnect_delay: 10,
            reconnect_backoff_delay: 60,
            reconnect_delay_max: 240,
            reconnect_retries: 30,
            ..Config::default()
        })
    }

    #[test]
    fn test_in_flight_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = InFlight::acquire(&flag).unwrap();
        assert!(InFlight::acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(InFlight::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn test_unresolvable_host_reports_reason_and_base_delay() {
        let (manager, mut events) = ConnectionManager::new(config());
        let req = ConnectionRequest::new("name.invalid", "6667", "alice");

        let err = manager.connect(&req).await.unwrap_err();
        assert_eq!(err.reason(), REASON_RESOLVE);
        assert_eq!(err.action(), Some(Action::RetryAfter(Duration::from_secs(10))));
        assert!(!manager.is_connecting());
        assert!(!manager.is_connected());
        assert_eq!(manager.last_server(), None);

        assert_eq!(events.recv().await, Some(Event::Status(Status::Connecting)));
        assert_eq!(
            events.recv().await,
            Some(Event::Status(Status::Failed(REASON_RESOLVE.to_owned())))
        );
    }

    #[tokio::test]
    async fn test_send_without_session() {
        let (manager, _events) = ConnectionManager::new(config());
        assert!(matches!(
            manager.send_line("PRIVMSG #a :hi"),
            Err(NetError::ConnectionClosed)
        ));
        assert_eq!(manager.disconnect(None).await, None);
    }

    #[tokio::test]
    async fn test_reconnect_without_history() {
        let (manager, _events) = ConnectionManager::new(config());
        assert!(manager.reconnect().await.is_none());
    }
}

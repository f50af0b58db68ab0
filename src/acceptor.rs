//! Accept loops that start one relay session per inbound connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use crate::config::{TransportMode, UdpFraming};
use crate::dial::{BoxedEndpoint, Dialer};
use crate::error::{Error, Result};
use crate::framing::DatagramStream;
use crate::relay::{relay, RelayReport};
use crate::shutdown::ShutdownSignal;
use crate::udp::UdpStream;

/// Default deadline for the TLS handshake of an accepted connection.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Inbound listener.
pub enum Listener {
    /// Plain TCP connections.
    Tcp(TcpListener),
    /// TLS connections. The handshake runs inside the session task and must
    /// finish within `handshake_timeout`.
    Tls {
        listener: TcpListener,
        acceptor: TlsAcceptor,
        handshake_timeout: Duration,
    },
}

impl Listener {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr(),
            Listener::Tls { listener, .. } => listener.local_addr(),
        }
    }

    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        match self {
            Listener::Tcp(listener) => listener.accept().await,
            Listener::Tls { listener, .. } => listener.accept().await,
        }
    }

    fn tls_handshake(&self) -> Option<TlsHandshake> {
        match self {
            Listener::Tcp(_) => None,
            Listener::Tls {
                acceptor,
                handshake_timeout,
                ..
            } => Some(TlsHandshake {
                acceptor: acceptor.clone(),
                timeout: *handshake_timeout,
            }),
        }
    }
}

#[derive(Clone)]
struct TlsHandshake {
    acceptor: TlsAcceptor,
    timeout: Duration,
}

impl TlsHandshake {
    async fn accept(&self, stream: TcpStream) -> Option<TlsStream<TcpStream>> {
        match tokio::time::timeout(self.timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => {
                let sni = tls_stream.get_ref().1.server_name().unwrap_or("");
                tracing::debug!(sni, "TLS handshake complete");
                Some(tls_stream)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "TLS handshake failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "TLS handshake timed out");
                None
            }
        }
    }
}

/// Optional ceiling on concurrently running sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionLimit {
    semaphore: Option<Arc<Semaphore>>,
}

impl SessionLimit {
    /// `None` means unbounded.
    pub fn new(max_sessions: Option<usize>) -> Self {
        Self {
            semaphore: max_sessions.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Reserves a slot. `Err(())` means the limit is reached.
    fn try_admit(&self) -> std::result::Result<Option<OwnedSemaphorePermit>, ()> {
        match &self.semaphore {
            None => Ok(None),
            Some(semaphore) => Arc::clone(semaphore)
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| ()),
        }
    }
}

/// What to do with each accepted connection.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    /// Dials the outbound leg.
    pub dialer: Arc<Dialer>,
    /// In UDP mode the inbound connection carries datagrams.
    pub mode: TransportMode,
    pub framing: UdpFraming,
}

impl SessionPlan {
    /// Wraps the stream side that carries datagrams according to the framing mode.
    fn frame(&self, stream: BoxedEndpoint) -> BoxedEndpoint {
        frame_datagrams(stream, self.mode, self.framing)
    }
}

/// Applies length-prefixed framing to a datagram-carrying stream when enabled.
pub fn frame_datagrams(
    stream: BoxedEndpoint,
    mode: TransportMode,
    framing: UdpFraming,
) -> BoxedEndpoint {
    match (mode, framing) {
        (TransportMode::Udp, UdpFraming::LengthPrefixed) => Box::new(DatagramStream::new(stream)),
        _ => stream,
    }
}

/// Accepts connections until shutdown, running one relay session for each.
///
/// Returns `Ok(())` when `shutdown` fires. Sessions already running are left
/// to finish on their own.
pub async fn serve(
    listener: Listener,
    plan: SessionPlan,
    limit: SessionLimit,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let tls = listener.tls_handshake();

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    return Err(Error::Io(e));
                }
            },
            _ = shutdown.recv() => {
                tracing::info!("shutdown signal received, no longer accepting connections");
                return Ok(());
            }
        };

        let Ok(permit) = limit.try_admit() else {
            tracing::warn!(%peer, "session limit reached, dropping connection");
            drop(stream);
            continue;
        };

        let id = next_session_id();
        tracing::info!(session = id, %peer, "connection accepted");

        let span = tracing::info_span!("session", id, %peer);
        let plan = plan.clone();
        let tls = tls.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(
            async move {
                let _permit = permit;
                run_session(stream, tls, plan, shutdown).await;
            }
            .instrument(span),
        );
    }
}

/// Handshakes (if TLS), dials the outbound leg, then relays.
async fn run_session(
    stream: TcpStream,
    tls: Option<TlsHandshake>,
    plan: SessionPlan,
    shutdown: ShutdownSignal,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
    }

    let inbound: BoxedEndpoint = match tls {
        None => Box::new(stream),
        Some(handshake) => match handshake.accept(stream).await {
            Some(tls_stream) => Box::new(tls_stream),
            None => return,
        },
    };

    let outbound = match plan.dialer.dial(&shutdown).await {
        Ok(outbound) => outbound,
        Err(Error::Cancelled) => {
            tracing::debug!("dial cancelled by shutdown");
            return;
        }
        Err(e) => {
            tracing::error!(target_addr = plan.dialer.address(), error = %e, "outbound dial failed");
            return;
        }
    };

    let report = relay(plan.frame(inbound), outbound).await;
    log_report(&report);
}

/// Runs relay sessions over one shared UDP socket, one at a time.
///
/// Each session dials the tunnel and relays until the tunnel closes; then
/// the next tunnel is dialed. Returns `Ok(())` when `shutdown` fires, or the
/// dial error if the dial policy gives up.
pub async fn serve_udp(
    socket: Arc<UdpSocket>,
    dialer: Arc<Dialer>,
    framing: UdpFraming,
    shutdown: ShutdownSignal,
) -> Result<()> {
    loop {
        let tunnel = match dialer.dial(&shutdown).await {
            Ok(tunnel) => tunnel,
            Err(Error::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        };

        let id = next_session_id();
        tracing::info!(session = id, remote = dialer.address(), "UDP tunnel established");

        let local = UdpStream::from_socket(Arc::clone(&socket));
        let tunnel = frame_datagrams(tunnel, TransportMode::Udp, framing);
        let session = tokio::spawn(
            relay(local, tunnel).instrument(tracing::info_span!("session", id)),
        );

        tokio::select! {
            joined = session => match joined {
                Ok(report) => log_report(&report),
                Err(e) => tracing::error!(session = id, error = %e, "relay task failed"),
            },
            _ = shutdown.recv() => {
                tracing::info!("shutdown signal received, no longer starting UDP sessions");
                return Ok(());
            }
        }

        // Avoid spinning when the server closes tunnels immediately.
        tokio::select! {
            _ = tokio::time::sleep(redial_pause(&dialer)) => {}
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

fn redial_pause(dialer: &Dialer) -> Duration {
    dialer.policy().initial_delay
}

fn log_report(report: &RelayReport) {
    if report.is_clean() {
        tracing::info!(
            sent = report.a_to_b,
            received = report.b_to_a,
            closed_by = ?report.first,
            "session closed"
        );
    } else {
        tracing::warn!(
            sent = report.a_to_b,
            received = report.b_to_a,
            closed_by = ?report.first,
            reason = %report.end,
            "session ended with error"
        );
    }
}

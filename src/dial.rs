//! Outbound leg establishment with retry.
//!
//! A [`Dialer`] knows where to connect and how: plain TCP, TLS over TCP, or a
//! connected UDP socket. [`Dialer::dial`] keeps trying until it connects,
//! the attempt limit is reached, or shutdown fires.

use rand::Rng;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;

use crate::common::DnsResolver;
use crate::error::{Error, Result};
use crate::relay::Endpoint;
use crate::shutdown::ShutdownSignal;
use crate::tls::compute_fingerprint;
use crate::udp::UdpStream;

/// Default delay between dial attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// An owned endpoint of any concrete type.
pub type BoxedEndpoint = Box<dyn Endpoint + Unpin>;

/// Retry timing for outbound dials.
#[derive(Debug, Clone, PartialEq)]
pub struct DialPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Growth factor applied after each failure. `1.0` keeps the delay fixed.
    pub multiplier: f64,
    /// Randomise each delay within `[delay / 2, delay]`.
    pub jitter: bool,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_INTERVAL)
    }
}

impl DialPolicy {
    /// Unbounded retries at a constant interval.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
            jitter: false,
            max_attempts: None,
        }
    }

    /// Returns the delay to wait after `failures` consecutive failed attempts.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let cap = self.max_delay.max(self.initial_delay);
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let delay = if scaled.is_finite() && scaled < cap.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            cap
        };

        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            rand::thread_rng().gen_range(half..=delay)
        } else {
            delay
        }
    }
}

/// Runs `attempt` until it succeeds, following `policy`.
///
/// Returns [`Error::Cancelled`] as soon as `shutdown` fires, whether an
/// attempt is in flight or the loop is sleeping.
pub async fn retry<T, F, Fut>(
    address: &str,
    policy: &DialPolicy,
    shutdown: &ShutdownSignal,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures: u32 = 0;

    loop {
        if shutdown.is_triggered() {
            return Err(Error::Cancelled);
        }

        let outcome = tokio::select! {
            outcome = attempt() => outcome,
            _ = shutdown.recv() => return Err(Error::Cancelled),
        };

        let err = match outcome {
            Ok(value) => {
                if failures > 0 {
                    tracing::info!(address, attempts = failures + 1, "connected after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        failures += 1;
        if policy.max_attempts.is_some_and(|max| failures >= max) {
            tracing::warn!(address, attempts = failures, error = %err, "giving up on dial");
            return Err(Error::DialExhausted {
                target: address.to_string(),
                attempts: failures,
            });
        }

        let delay = policy.delay_for(failures);
        tracing::warn!(address, attempt = failures, error = %err, retry_in = ?delay, "dial failed, retrying");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return Err(Error::Cancelled),
        }
    }
}

/// Transport used for the outbound leg.
#[derive(Clone)]
pub enum Transport {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP with the given connector and SNI name.
    Tls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    /// A UDP socket connected to the target.
    Udp,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "Tcp"),
            Transport::Tls { server_name, .. } => {
                f.debug_struct("Tls").field("server_name", server_name).finish()
            }
            Transport::Udp => write!(f, "Udp"),
        }
    }
}

/// Dials one fixed outbound target.
#[derive(Debug)]
pub struct Dialer {
    address: String,
    transport: Transport,
    policy: DialPolicy,
    resolver: DnsResolver,
}

impl Dialer {
    pub fn new(address: impl Into<String>, transport: Transport, policy: DialPolicy) -> Self {
        Self {
            address: address.into(),
            transport,
            policy,
            resolver: DnsResolver::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn policy(&self) -> &DialPolicy {
        &self.policy
    }

    /// Connects to the target, retrying per the dial policy.
    pub async fn dial(&self, shutdown: &ShutdownSignal) -> Result<BoxedEndpoint> {
        retry(&self.address, &self.policy, shutdown, || self.dial_once()).await
    }

    /// Makes a single connection attempt.
    pub async fn dial_once(&self) -> Result<BoxedEndpoint> {
        let addr = self
            .resolver
            .resolve_address(&self.address)
            .await
            .map_err(|e| Error::DialFailed(e.to_string()))?;

        match &self.transport {
            Transport::Tcp => {
                let stream = connect_tcp(addr, false).await?;
                tracing::debug!(%addr, "connected");
                Ok(Box::new(stream))
            }
            Transport::Tls {
                connector,
                server_name,
            } => {
                let stream = connect_tcp(addr, true).await?;
                let tls = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(|e| Error::DialFailed(format!("TLS handshake with {}: {}", addr, e)))?;

                if let Some(cert) = tls.get_ref().1.peer_certificates().and_then(|c| c.first()) {
                    tracing::debug!(%addr, fingerprint = %compute_fingerprint(cert), "tunnel established");
                }
                Ok(Box::new(tls))
            }
            Transport::Udp => {
                let stream = UdpStream::connect(addr)
                    .await
                    .map_err(|e| Error::DialFailed(format!("UDP connect {}: {}", addr, e)))?;
                tracing::debug!(%addr, local = ?stream.local_addr().ok(), "UDP socket connected");
                Ok(Box::new(stream))
            }
        }
    }
}

/// Opens a TCP connection, optionally with keep-alive enabled.
async fn connect_tcp(addr: SocketAddr, keepalive: bool) -> Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| Error::DialFailed(format!("socket for {}: {}", addr, e)))?;

    if keepalive {
        socket
            .set_keepalive(true)
            .map_err(|e| Error::DialFailed(format!("keep-alive for {}: {}", addr, e)))?;
    }

    let stream = socket
        .connect(addr)
        .await
        .map_err(|e| Error::DialFailed(format!("connect {}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Wraps a client TLS config for [`Transport::Tls`].
pub fn tls_transport(config: rustls::ClientConfig, server_name: &str) -> Result<Transport> {
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| Error::Config(format!("invalid server name '{}': {}", server_name, e)))?;
    Ok(Transport::Tls {
        connector: TlsConnector::from(Arc::new(config)),
        server_name,
    })
}

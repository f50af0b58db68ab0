//! Server side: terminate TLS and forward plain traffic to the destination.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::acceptor::{serve, Listener, SessionLimit, SessionPlan, TLS_HANDSHAKE_TIMEOUT};
use crate::common::{format_duration, DnsResolver};
use crate::config::{TransportMode, TunnelConfig};
use crate::dial::{Dialer, Transport};
use crate::error::{Error, Result};
use crate::shutdown::ShutdownSignal;
use crate::tls::{build_server_config, generate_self_signed_identity, TlsError, TlsIdentity};

/// Runs the tunnel server until `shutdown` fires.
pub async fn run_server(config: &TunnelConfig, shutdown: ShutdownSignal) -> Result<()> {
    let server = Server::bind(config).await?;
    server.print_startup_message(config);
    server.run(shutdown).await
}

/// A bound tunnel server.
pub struct Server {
    listener: Listener,
    plan: SessionPlan,
    limit: SessionLimit,
    identity: TlsIdentity,
}

impl Server {
    /// Generates the TLS identity, binds the listener and prepares the dialer.
    pub async fn bind(config: &TunnelConfig) -> Result<Self> {
        let identity = generate_identity().await?;
        let tls_config = build_server_config(&identity)?;

        let (transport, forward) = match config.mode {
            TransportMode::Tcp => (Transport::Tcp, config.forward.clone()),
            TransportMode::Udp => {
                // The UDP destination is resolved once; a bad name is a startup error.
                let addr = DnsResolver::new().resolve_address(&config.forward).await?;
                (Transport::Udp, addr.to_string())
            }
        };

        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|e| Error::ListenFailed(format!("{}: {}", config.listen, e)))?;

        Ok(Self {
            listener: Listener::Tls {
                listener,
                acceptor: TlsAcceptor::from(Arc::new(tls_config)),
                handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
            },
            plan: SessionPlan {
                dialer: Arc::new(Dialer::new(forward, transport, config.dial_policy.clone())),
                mode: config.mode,
                framing: config.framing,
            },
            limit: SessionLimit::new(config.max_sessions),
            identity,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// SHA-256 fingerprint of the certificate this server presents.
    pub fn fingerprint(&self) -> &str {
        &self.identity.fingerprint
    }

    /// Accepts TLS connections until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let local_addr = self.local_addr()?;
        tracing::info!(%local_addr, fingerprint = %self.identity.fingerprint, "server listening");

        serve(self.listener, self.plan, self.limit, shutdown).await?;

        tracing::info!("server stopped accepting connections");
        Ok(())
    }

    /// Prints the startup summary to stderr.
    pub fn print_startup_message(&self, config: &TunnelConfig) {
        eprintln!("Starting server...");
        eprintln!("  Listen: {}", config.listen);
        eprintln!("  Forward: {} ({})", config.forward, config.mode);
        if config.mode == TransportMode::Udp {
            eprintln!("  UDP Framing: {}", config.framing);
        }
        eprintln!(
            "  Retry Interval: {}",
            format_duration(config.dial_policy.initial_delay)
        );
        match config.max_sessions {
            Some(n) => eprintln!("  Max Sessions: {}", n),
            None => eprintln!("  Max Sessions: unbounded"),
        }
        eprintln!("  Certificate Valid Until: {}", self.identity.not_after);
        eprintln!("  Fingerprint (SHA-256): {}", self.identity.fingerprint);
    }
}

/// RSA key generation is CPU-bound, so it runs on the blocking pool.
async fn generate_identity() -> Result<TlsIdentity> {
    let identity = tokio::task::spawn_blocking(generate_self_signed_identity)
        .await
        .map_err(|e| TlsError::KeyGeneration(format!("key generation task failed: {}", e)))??;
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UdpFraming;
    use crate::dial::DialPolicy;

    fn config(listen: &str, forward: &str, mode: TransportMode) -> TunnelConfig {
        TunnelConfig {
            listen: listen.parse().unwrap(),
            forward: forward.to_string(),
            server_name: None,
            mode,
            framing: UdpFraming::Raw,
            dial_policy: DialPolicy::default(),
            max_sessions: None,
        }
    }

    #[tokio::test]
    async fn test_bind_reports_address_and_fingerprint() {
        let server = Server::bind(&config("127.0.0.1:0", "127.0.0.1:1985", TransportMode::Tcp))
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.fingerprint().len(), 32 * 3 - 1);
    }

    #[tokio::test]
    async fn test_bind_on_used_port_fails_with_listen_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let result = Server::bind(&config(&addr, "127.0.0.1:1985", TransportMode::Tcp)).await;
        match result {
            Err(e @ Error::ListenFailed(_)) => assert_eq!(i32::from(e.exit_code()), 10),
            Err(e) => panic!("expected ListenFailed, got {}", e),
            Ok(_) => panic!("expected ListenFailed"),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_identity_generation_leaves_runtime_responsive() {
        use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

        let done = AtomicBool::new(false);
        let ticks = AtomicU32::new(0);

        let (identity, ()) = tokio::join!(
            async {
                let identity = generate_identity().await;
                done.store(true, Ordering::SeqCst);
                identity
            },
            async {
                while !done.load(Ordering::SeqCst) {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            }
        );

        assert!(!identity.unwrap().fingerprint.is_empty());
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_udp_forward_is_resolved_at_startup() {
        let server = Server::bind(&config("127.0.0.1:0", ":5353", TransportMode::Udp))
            .await
            .unwrap();
        assert_eq!(server.plan.dialer.address(), "127.0.0.1:5353");
    }
}

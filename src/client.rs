//! Client side: accept plain traffic and forward it over TLS.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};

use crate::acceptor::{serve, serve_udp, Listener, SessionLimit, SessionPlan};
use crate::common::format_duration;
use crate::config::{TransportMode, TunnelConfig};
use crate::dial::{tls_transport, Dialer};
use crate::error::{Error, Result};
use crate::shutdown::ShutdownSignal;
use crate::tls::build_client_config_insecure;

/// Runs the tunnel client until `shutdown` fires.
pub async fn run_client(config: &TunnelConfig, shutdown: ShutdownSignal) -> Result<()> {
    let client = Client::bind(config).await?;
    print_startup_message(config);
    client.run(shutdown).await
}

enum Inbound {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

/// A bound tunnel client.
pub struct Client {
    inbound: Inbound,
    plan: SessionPlan,
    limit: SessionLimit,
}

impl Client {
    /// Builds the TLS connector and binds the local listener or socket.
    pub async fn bind(config: &TunnelConfig) -> Result<Self> {
        let server_name = config
            .server_name
            .as_deref()
            .ok_or_else(|| Error::Config("client requires an SNI server name".to_string()))?;
        let transport = tls_transport(build_client_config_insecure()?, server_name)?;

        let inbound = match config.mode {
            TransportMode::Tcp => Inbound::Tcp(
                TcpListener::bind(config.listen)
                    .await
                    .map_err(|e| Error::ListenFailed(format!("{}: {}", config.listen, e)))?,
            ),
            TransportMode::Udp => Inbound::Udp(Arc::new(
                UdpSocket::bind(config.listen)
                    .await
                    .map_err(|e| Error::ListenFailed(format!("{}: {}", config.listen, e)))?,
            )),
        };

        Ok(Self {
            inbound,
            plan: SessionPlan {
                dialer: Arc::new(Dialer::new(
                    config.forward.clone(),
                    transport,
                    config.dial_policy.clone(),
                )),
                mode: config.mode,
                framing: config.framing,
            },
            limit: SessionLimit::new(config.max_sessions),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.inbound {
            Inbound::Tcp(listener) => listener.local_addr()?,
            Inbound::Udp(socket) => socket.local_addr()?,
        };
        Ok(addr)
    }

    /// Serves local traffic until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let local_addr = self.local_addr()?;
        let remote = self.plan.dialer.address().to_string();

        match self.inbound {
            Inbound::Tcp(listener) => {
                tracing::info!(%local_addr, %remote, "client listening (tcp)");
                // The tunnel leg is the outbound side here, so the listener
                // itself never carries framed datagrams.
                let plan = SessionPlan {
                    mode: TransportMode::Tcp,
                    ..self.plan
                };
                serve(Listener::Tcp(listener), plan, self.limit, shutdown).await?;
            }
            Inbound::Udp(socket) => {
                tracing::info!(%local_addr, %remote, "client listening (udp)");
                serve_udp(socket, self.plan.dialer, self.plan.framing, shutdown).await?;
            }
        }

        tracing::info!("client stopped");
        Ok(())
    }
}

fn print_startup_message(config: &TunnelConfig) {
    eprintln!("Starting client...");
    eprintln!("  Listen: {} ({})", config.listen, config.mode);
    eprintln!("  Remote: {}", config.forward);
    if let Some(name) = &config.server_name {
        eprintln!("  SNI: {}", name);
    }
    if config.mode == TransportMode::Udp {
        eprintln!("  UDP Framing: {}", config.framing);
    }
    eprintln!(
        "  Retry Interval: {}",
        format_duration(config.dial_policy.initial_delay)
    );
    eprintln!("  Certificate Verification: disabled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UdpFraming;
    use crate::dial::DialPolicy;

    fn config(mode: TransportMode, server_name: Option<&str>) -> TunnelConfig {
        TunnelConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            forward: "127.0.0.1:9999".to_string(),
            server_name: server_name.map(str::to_string),
            mode,
            framing: UdpFraming::Raw,
            dial_policy: DialPolicy::default(),
            max_sessions: None,
        }
    }

    #[tokio::test]
    async fn test_bind_tcp_and_udp() {
        let tcp = Client::bind(&config(TransportMode::Tcp, Some("example.com")))
            .await
            .unwrap();
        assert_ne!(tcp.local_addr().unwrap().port(), 0);

        let udp = Client::bind(&config(TransportMode::Udp, Some("example.com")))
            .await
            .unwrap();
        assert_ne!(udp.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_requires_server_name() {
        let result = Client::bind(&config(TransportMode::Tcp, None)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

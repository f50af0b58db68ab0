//! Validated tunnel configuration.

use std::fmt;
use std::net::SocketAddr;

use crate::cli::{ClientArgs, RetryArgs, ServerArgs};
use crate::common::{parse_listen_address, split_host_port};
use crate::dial::DialPolicy;
use crate::error::{Error, Result};

/// Kind of plain traffic carried through the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Tcp,
    Udp,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Tcp => write!(f, "tcp"),
            TransportMode::Udp => write!(f, "udp"),
        }
    }
}

/// How UDP datagrams are carried on the TLS stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UdpFraming {
    /// Payloads are written back to back; boundaries are not preserved.
    #[default]
    Raw,
    /// Each datagram travels as one varint length-prefixed frame.
    LengthPrefixed,
}

impl fmt::Display for UdpFraming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UdpFraming::Raw => write!(f, "raw"),
            UdpFraming::LengthPrefixed => write!(f, "length-prefixed"),
        }
    }
}

/// Configuration for one relay process, server or client side.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local address to accept traffic on.
    pub listen: SocketAddr,
    /// `host:port` the outbound leg connects to.
    pub forward: String,
    /// SNI name sent in the TLS handshake (client side only).
    pub server_name: Option<String>,
    pub mode: TransportMode,
    pub framing: UdpFraming,
    pub dial_policy: DialPolicy,
    /// Ceiling on concurrent sessions. `None` is unbounded.
    pub max_sessions: Option<usize>,
}

impl TunnelConfig {
    /// Builds the server-side configuration.
    pub fn from_server_args(args: &ServerArgs) -> Result<Self> {
        let config = Self {
            listen: parse_listen_address(&args.listen)?,
            forward: args.forward.clone(),
            server_name: None,
            mode: mode_from_flag(args.udp),
            framing: args.udp_framing,
            dial_policy: dial_policy_from_args(&args.retry)?,
            max_sessions: args.max_sessions.filter(|&n| n > 0),
        };
        config.validate()?;
        Ok(config)
    }

    /// Builds the client-side configuration.
    pub fn from_client_args(args: &ClientArgs) -> Result<Self> {
        let config = Self {
            listen: parse_listen_address(&args.listen)?,
            forward: args.remote.clone(),
            server_name: Some(args.sni.clone()),
            mode: mode_from_flag(args.udp),
            framing: args.udp_framing,
            dial_policy: dial_policy_from_args(&args.retry)?,
            max_sessions: args.max_sessions.filter(|&n| n > 0),
        };
        config.validate()?;
        if config.server_name.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Config("SNI server name must not be empty".to_string()));
        }
        Ok(config)
    }

    /// Checks invariants that do not depend on the network.
    pub fn validate(&self) -> Result<()> {
        split_host_port(&self.forward)?;

        let policy = &self.dial_policy;
        if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry multiplier must be at least 1.0, got {}",
                policy.multiplier
            )));
        }
        if policy.max_delay < policy.initial_delay {
            return Err(Error::Config(
                "max retry interval must not be shorter than the retry interval".to_string(),
            ));
        }
        if policy.max_attempts == Some(0) {
            return Err(Error::Config("max retries must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn mode_from_flag(udp: bool) -> TransportMode {
    if udp {
        TransportMode::Udp
    } else {
        TransportMode::Tcp
    }
}

fn dial_policy_from_args(args: &RetryArgs) -> Result<DialPolicy> {
    if args.retry_interval.is_zero() {
        return Err(Error::Config("retry interval must be positive".to_string()));
    }
    Ok(DialPolicy {
        initial_delay: args.retry_interval,
        max_delay: args.max_retry_interval.unwrap_or(args.retry_interval),
        multiplier: args.retry_multiplier,
        jitter: args.retry_jitter,
        max_attempts: args.max_retries,
    })
}

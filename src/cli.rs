//! CLI definitions for tlsrelay.

use clap::{builder::PossibleValuesParser, Args, Parser, Subcommand};
use std::time::Duration;

use crate::config::UdpFraming;

/// Default server listen address.
pub const DEFAULT_SERVER_LISTEN: &str = ":8080";

/// Default server forward address.
pub const DEFAULT_SERVER_FORWARD: &str = ":1985";

/// Default client listen address.
pub const DEFAULT_CLIENT_LISTEN: &str = ":8888";

/// Default client remote (tunnel server) address.
pub const DEFAULT_CLIENT_REMOTE: &str = ":9999";

/// Default SNI server name.
pub const DEFAULT_SNI: &str = "example.com";

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// TLS tunnel for plain TCP and UDP services.
#[derive(Debug, Parser)]
#[command(name = "tlsrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept TLS and forward plain traffic to a destination
    Server(ServerArgs),

    /// Accept plain traffic and forward it over TLS to a server
    Client(ClientArgs),

    /// Show version information
    Version,
}

/// Retry settings for outbound dials.
#[derive(Debug, Args)]
pub struct RetryArgs {
    /// Delay between dial attempts
    #[arg(long, value_parser = parse_duration, default_value = "200ms")]
    pub retry_interval: Duration,

    /// Upper bound for the delay when backing off (defaults to --retry-interval)
    #[arg(long, value_parser = parse_duration)]
    pub max_retry_interval: Option<Duration>,

    /// Factor the delay grows by after each failed attempt
    #[arg(long, default_value_t = 1.0)]
    pub retry_multiplier: f64,

    /// Randomise each delay between half and all of its value
    #[arg(long, default_value_t = false)]
    pub retry_jitter: bool,

    /// Give up after this many attempts (unbounded if omitted)
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Arguments for the server subcommand.
#[derive(Debug, Parser)]
pub struct ServerArgs {
    /// TLS listen address (e.g., :8080)
    #[arg(long, default_value = DEFAULT_SERVER_LISTEN)]
    pub listen: String,

    /// Destination address for the unwrapped traffic (e.g., 127.0.0.1:1985)
    #[arg(long, default_value = DEFAULT_SERVER_FORWARD)]
    pub forward: String,

    /// Forward to a UDP destination instead of TCP
    #[arg(long, default_value_t = false)]
    pub udp: bool,

    /// How datagrams are carried on the TLS stream
    #[arg(long, value_enum, default_value_t = UdpFraming::Raw)]
    pub udp_framing: UdpFraming,

    #[command(flatten)]
    pub retry: RetryArgs,

    /// Maximum concurrent sessions (0 or omitted for unbounded)
    #[arg(long)]
    pub max_sessions: Option<usize>,
}

/// Arguments for the client subcommand.
#[derive(Debug, Parser)]
pub struct ClientArgs {
    /// Local listen address (e.g., :8888)
    #[arg(long, default_value = DEFAULT_CLIENT_LISTEN)]
    pub listen: String,

    /// Tunnel server address (e.g., server.example.com:9999)
    #[arg(long, default_value = DEFAULT_CLIENT_REMOTE)]
    pub remote: String,

    /// TLS SNI hostname
    #[arg(long, default_value = DEFAULT_SNI)]
    pub sni: String,

    /// Accept UDP datagrams instead of TCP connections
    #[arg(long, default_value_t = false)]
    pub udp: bool,

    /// How datagrams are carried on the TLS stream
    #[arg(long, value_enum, default_value_t = UdpFraming::Raw)]
    pub udp_framing: UdpFraming,

    #[command(flatten)]
    pub retry: RetryArgs,

    /// Maximum concurrent sessions (0 or omitted for unbounded)
    #[arg(long)]
    pub max_sessions: Option<usize>,
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("TLSRELAY_COMMIT").unwrap_or("unknown"),
            built: option_env!("TLSRELAY_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "tlsrelay version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}

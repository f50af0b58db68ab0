//! Address handling shared by the server and client sides.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Host used when an address is given as `:port`.
pub const DEFAULT_CONNECT_HOST: &str = "127.0.0.1";

/// Splits a `host:port` address into its parts.
///
/// Brackets around IPv6 hosts are removed. An empty host (`:port`) means
/// the local machine.
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let Some(colon_pos) = address.rfind(':') else {
        return Err(Error::Config(format!(
            "address must include port: '{}'",
            address
        )));
    };

    let host_part = &address[..colon_pos];
    let port_part = &address[colon_pos + 1..];

    let host = if host_part.starts_with('[') && host_part.ends_with(']') {
        &host_part[1..host_part.len() - 1]
    } else {
        host_part
    };

    if host.contains(':') && !host_part.starts_with('[') {
        return Err(Error::Config(format!(
            "IPv6 host must be enclosed in brackets: '{}'",
            address
        )));
    }

    let port: u16 = port_part
        .parse()
        .map_err(|_| Error::Config(format!("invalid port in address '{}'", address)))?;

    let host = if host.is_empty() {
        DEFAULT_CONNECT_HOST
    } else {
        host
    };

    Ok((host.to_string(), port))
}

/// Parses a listen address. `:port` binds all IPv4 interfaces.
pub fn parse_listen_address(listen: &str) -> Result<SocketAddr> {
    let addr_str = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };

    addr_str
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", listen, e)))
}

/// Shared DNS resolver, created on first use and reused afterwards.
///
/// Lookups run concurrently; only the one-time initialisation is serialised.
pub struct DnsResolver {
    resolver: OnceCell<Resolver<TokioConnectionProvider>>,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self {
            resolver: OnceCell::new(),
        }
    }

    async fn resolver(&self) -> Result<&Resolver<TokioConnectionProvider>> {
        self.resolver
            .get_or_try_init(|| async {
                Resolver::builder_tokio()
                    .map(|builder| builder.build())
                    .map_err(|e| Error::Config(format!("failed to create DNS resolver: {}", e)))
            })
            .await
    }

    /// Resolves `host` to a socket address. Literal IPs skip the lookup.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let response = self
            .resolver()
            .await?
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Config(format!("failed to resolve '{}': {}", host, e)))?;

        response
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| Error::Config(format!("no addresses found for '{}'", host)))
    }

    /// Splits and resolves a `host:port` address.
    pub async fn resolve_address(&self, address: &str) -> Result<SocketAddr> {
        let (host, port) = split_host_port(address)?;
        self.resolve(&host, port).await
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver").finish_non_exhaustive()
    }
}

/// Formats a duration the way Go prints one (`1h30m10s`, `200ms`).
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let nanos = d.subsec_nanos();

    if secs == 0 && nanos == 0 {
        return "0s".to_string();
    }

    let mut result = String::new();

    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs_remainder = secs % 60;

    if hours > 0 {
        result.push_str(&format!("{}h", hours));
    }
    if mins > 0 {
        result.push_str(&format!("{}m", mins));
    }
    if secs_remainder > 0 || (hours == 0 && mins == 0 && nanos == 0) {
        result.push_str(&format!("{}s", secs_remainder));
    } else if nanos > 0 && hours == 0 && mins == 0 && secs_remainder == 0 {
        let ms = nanos / 1_000_000;
        if ms > 0 {
            result.push_str(&format!("{}ms", ms));
        }
    }

    if result.is_empty() {
        "0s".to_string()
    } else {
        result
    }
}

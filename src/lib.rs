//! tlsrelay - TLS tunnel for plain TCP and UDP services.
//!
//! The client side accepts plain TCP connections or UDP datagrams and carries
//! them over TLS to the server side, which unwraps them and forwards the plain
//! traffic to a destination service.

pub mod acceptor;
pub mod cli;
pub mod client;
pub mod common;
pub mod config;
pub mod dial;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod tls;
pub mod udp;

pub use acceptor::{serve, serve_udp, Listener, SessionLimit, SessionPlan, TLS_HANDSHAKE_TIMEOUT};
pub use cli::{BuildInfo, Cli, ClientArgs, Command, RetryArgs, ServerArgs};
pub use client::{run_client, Client};
pub use common::{format_duration, parse_listen_address, split_host_port, DnsResolver};
pub use config::{TransportMode, TunnelConfig, UdpFraming};
pub use dial::{retry, tls_transport, BoxedEndpoint, DialPolicy, Dialer, Transport};
pub use error::{Error, ExitCode, Result};
pub use framing::DatagramStream;
pub use protocol::{decode_frame, encode_frame, ProtocolError, ProtocolResult, MAX_FRAME_PAYLOAD};
pub use relay::{relay, Direction, DirectionEnd, Endpoint, RelayReport, RELAY_BUFFER_SIZE};
pub use server::{run_server, Server};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use tls::{
    build_client_config_insecure, build_server_config, compute_fingerprint, format_fingerprint,
    generate_self_signed_identity, TlsError, TlsIdentity, TlsResult,
};
pub use udp::{PeerMode, PeerSlot, UdpStream, MAX_DATAGRAM_SIZE};

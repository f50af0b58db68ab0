//! UDP socket exposed as a duplex byte-stream endpoint.
//!
//! A [`UdpStream`] tracks a single peer address. Reads return one datagram
//! each; writes send one datagram to the tracked peer. This is only correct
//! for one active peer per socket: datagrams from a second sender replace
//! the tracked peer, and replies follow the most recent sender. Callers that
//! need several UDP peers must run one socket and one relay session per peer.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// How the tracked peer address is maintained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// The peer is learned from received datagrams (last sender wins).
    Learned,
    /// The socket is connected to a fixed destination.
    Fixed,
}

/// Shared handle to the peer address tracked by one [`UdpStream`].
#[derive(Debug, Clone, Default)]
pub struct PeerSlot(Arc<Mutex<Option<SocketAddr>>>);

impl PeerSlot {
    fn with_peer(addr: SocketAddr) -> Self {
        Self(Arc::new(Mutex::new(Some(addr))))
    }

    /// Returns the currently tracked peer, if any.
    pub fn get(&self) -> Option<SocketAddr> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records `addr` as the peer, returning the previous one.
    fn replace(&self, addr: SocketAddr) -> Option<SocketAddr> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(addr)
    }
}

/// A UDP socket adapted to the `AsyncRead`/`AsyncWrite` endpoint contract.
#[derive(Debug)]
pub struct UdpStream {
    socket: Arc<UdpSocket>,
    peer: PeerSlot,
    mode: PeerMode,
    closed: bool,
}

impl UdpStream {
    /// Binds a socket on `addr` and learns the peer from incoming datagrams.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(Arc::new(socket)))
    }

    /// Adapts an already bound socket, learning the peer from incoming datagrams.
    ///
    /// Each call creates a fresh, empty peer slot.
    pub fn from_socket(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            peer: PeerSlot::default(),
            mode: PeerMode::Learned,
            closed: false,
        }
    }

    /// Opens a socket connected to `target`.
    ///
    /// The local side binds the unspecified address of the target's family on
    /// an ephemeral port. The tracked peer is fixed to `target`.
    pub async fn connect(target: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;

        Ok(Self {
            socket: Arc::new(socket),
            peer: PeerSlot::with_peer(target),
            mode: PeerMode::Fixed,
            closed: false,
        })
    }

    /// Returns the peer address replies are sent to, if one is known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer.get()
    }

    /// Returns a handle that observes the tracked peer after the stream is moved.
    pub fn peer_slot(&self) -> PeerSlot {
        self.peer.clone()
    }

    pub fn mode(&self) -> PeerMode {
        self.mode
    }

    /// Returns the local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            let before = buf.filled().len();
            let from = ready!(this.socket.poll_recv_from(cx, buf))?;

            if this.mode == PeerMode::Learned {
                let previous = this.peer.replace(from);
                if previous != Some(from) {
                    tracing::debug!(peer = %from, ?previous, "UDP peer updated");
                }
            }

            // An empty datagram would read as EOF; drop it.
            if buf.filled().len() > before {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let Some(peer) = this.peer.get() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no UDP peer has been seen yet",
            )));
        };

        let sent = match this.mode {
            PeerMode::Fixed => ready!(this.socket.poll_send(cx, data))?,
            PeerMode::Learned => ready!(this.socket.poll_send_to(cx, data, peer))?,
        };
        Poll::Ready(Ok(sent))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().closed = true;
        Poll::Ready(Ok(()))
    }
}

//! Transport session layers and the shared dispatch types.
//!
//! The two session layers are concrete adapters over the same narrow
//! interface: each turns wire traffic into [`RpcMessage`]s (decoded
//! packet + peer endpoint + reply sink) and consumes reply packets from
//! its sink. The worker pool sees only that interface and never the
//! sockets.
//!
//! ```text
//! TCP conn ──reader──┐                       ┌──writer task──► TCP conn
//!                    ├──► RpcMessage ──► ... ┤
//! UDP sock ──recv────┘                       └──reply queue──► UDP sock
//! ```

use std::net::{IpAddr, SocketAddr};

use tokio::sync::mpsc;

use crate::error::{Result, RpcError};
use crate::protocol::wire::transport_id;
use crate::protocol::RpcPacket;

pub mod tcp;
pub mod udp;

pub use tcp::TcpSessionHandler;
pub use udp::UdpDatagramHandler;

/// Transport kind attached to inbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Stream transport.
    Tcp,
    /// Datagram transport.
    Udp,
}

impl Transport {
    /// Protocol identifier as used in port-mapper records (TCP=6, UDP=17).
    #[inline]
    pub fn id(&self) -> u32 {
        match self {
            Transport::Tcp => transport_id::TCP,
            Transport::Udp => transport_id::UDP,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

/// The peer a request arrived from, carried alongside the packet so the
/// reply can be routed without re-resolving anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEndpoint {
    /// Peer address.
    pub addr: IpAddr,
    /// Peer port.
    pub port: u16,
    /// Transport the request arrived on.
    pub transport: Transport,
}

impl ClientEndpoint {
    /// Endpoint for a TCP peer.
    pub fn tcp(peer: SocketAddr) -> Self {
        Self {
            addr: peer.ip(),
            port: peer.port(),
            transport: Transport::Tcp,
        }
    }

    /// Endpoint for a UDP peer.
    pub fn udp(peer: SocketAddr) -> Self {
        Self {
            addr: peer.ip(),
            port: peer.port(),
            transport: Transport::Udp,
        }
    }

    /// The peer as a socket address.
    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl std::fmt::Display for ClientEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.addr, self.port, self.transport)
    }
}

/// Where a reply goes: the originating connection's writer task (TCP)
/// or the shared reply queue drained by the datagram sender (UDP).
#[derive(Clone)]
pub enum ReplySink {
    /// Per-connection writer channel.
    Stream(mpsc::Sender<RpcPacket>),
    /// Shared datagram reply queue; the peer address rides along.
    Datagram(mpsc::Sender<(SocketAddr, RpcPacket)>),
}

impl ReplySink {
    /// Hand a reply packet to the transport that produced the request.
    ///
    /// Fails with [`RpcError::ConnectionClosed`] when the session is
    /// gone; the reply packet is dropped (and thus returned to its
    /// pool) in that case.
    pub async fn send(&self, reply: RpcPacket, endpoint: &ClientEndpoint) -> Result<()> {
        match self {
            ReplySink::Stream(tx) => tx
                .send(reply)
                .await
                .map_err(|_| RpcError::ConnectionClosed),
            ReplySink::Datagram(tx) => tx
                .send((endpoint.socket_addr(), reply))
                .await
                .map_err(|_| RpcError::ConnectionClosed),
        }
    }
}

/// A decoded request on its way to a worker.
pub struct RpcMessage {
    /// The decoded call packet.
    pub packet: RpcPacket,
    /// Originating peer.
    pub endpoint: ClientEndpoint,
    /// Reply routing.
    pub sink: ReplySink,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_ids_match_protocol_numbers() {
        assert_eq!(Transport::Tcp.id(), 6);
        assert_eq!(Transport::Udp.id(), 17);
    }

    #[test]
    fn test_endpoint_roundtrip() {
        let sa: SocketAddr = "192.0.2.7:2049".parse().unwrap();
        let ep = ClientEndpoint::tcp(sa);
        assert_eq!(ep.socket_addr(), sa);
        assert_eq!(ep.transport, Transport::Tcp);
        assert_eq!(ep.to_string(), "192.0.2.7:2049/TCP");
    }

    #[tokio::test]
    async fn test_stream_sink_delivers_reply() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ReplySink::Stream(tx);
        let ep = ClientEndpoint::tcp("127.0.0.1:9999".parse().unwrap());

        let mut pkt = RpcPacket::new(64);
        pkt.put_u32(11).unwrap();
        sink.send(pkt, &ep).await.unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.message_len(), 4);
    }

    #[tokio::test]
    async fn test_datagram_sink_attaches_peer() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ReplySink::Datagram(tx);
        let ep = ClientEndpoint::udp("127.0.0.1:5353".parse().unwrap());

        sink.send(RpcPacket::new(16), &ep).await.unwrap();

        let (addr, _pkt) = rx.recv().await.unwrap();
        assert_eq!(addr, ep.socket_addr());
    }

    #[tokio::test]
    async fn test_closed_sink_reports_connection_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = ReplySink::Stream(tx);
        let ep = ClientEndpoint::tcp("127.0.0.1:1".parse().unwrap());

        let err = sink.send(RpcPacket::new(16), &ep).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }
}

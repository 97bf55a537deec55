//! Datagram (UDP) session layer.
//!
//! Every inbound datagram is one complete message; there is no
//! multi-datagram reassembly. The receive loop allocates a fresh pooled
//! packet per datagram (a packet handed to the workers cannot be reused
//! for the next receive until it comes back through the pool), attaches
//! the peer address, and hands off.
//!
//! The socket has no per-request connection to reply on, so workers
//! never write to it directly: replies land on a dedicated reply queue
//! and a single sender task drains it onto the shared socket using the
//! address stored with each reply.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::pool::PacketPool;
use crate::protocol::wire::RPC_VERSION;
use crate::protocol::RpcPacket;
use crate::transport::{ClientEndpoint, ReplySink, RpcMessage};
use crate::worker::Dispatch;

/// Depth of the shared reply queue.
const REPLY_QUEUE_DEPTH: usize = 64;

/// Datagram session handler: one receive loop, one reply sender.
pub struct UdpDatagramHandler {
    local_addr: SocketAddr,
    token: CancellationToken,
    recv_task: JoinHandle<()>,
    send_task: JoinHandle<()>,
}

impl UdpDatagramHandler {
    /// Bind `addr` and start the receive and reply-sender loops.
    pub async fn bind(
        addr: SocketAddr,
        pool: Arc<PacketPool>,
        dispatch: Dispatch,
        max_message_size: usize,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let token = parent.child_token();

        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);

        let recv_task = tokio::spawn(recv_loop(
            socket.clone(),
            pool,
            dispatch,
            reply_tx,
            max_message_size,
            token.clone(),
        ));
        let send_task = tokio::spawn(send_loop(socket, reply_rx, token.clone()));

        tracing::debug!(addr = %local_addr, "UDP datagram handler listening");
        Ok(Self {
            local_addr,
            token,
            recv_task,
            send_task,
        })
    }

    /// The bound local address.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound UDP port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop receiving and drain the sender.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.recv_task.await;
        let _ = self.send_task.await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    pool: Arc<PacketPool>,
    dispatch: Dispatch,
    reply_tx: mpsc::Sender<(SocketAddr, RpcPacket)>,
    max_message_size: usize,
    token: CancellationToken,
) {
    loop {
        // Fresh packet per datagram; the previous one is downstream.
        let mut pkt = match pool.allocate_cancellable(max_message_size, &token).await {
            Ok(p) => p,
            Err(RpcError::PoolCancelled) => break,
            Err(e) => {
                tracing::error!("datagram packet allocation failed: {}", e);
                break;
            }
        };

        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut pkt.buf_mut()[RpcPacket::HEADER_RESERVE..]) => received,
        };
        let (len, peer) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("datagram receive failed: {}", e);
                continue;
            }
        };

        pkt.set_end(RpcPacket::HEADER_RESERVE + len);
        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);

        // Framing errors drop the datagram; nothing is sent back.
        if let Err(e) = pkt.validate_call() {
            tracing::warn!(peer = %peer, "malformed datagram dropped: {}", e);
            continue;
        }

        let version = match pkt.rpc_version() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(peer = %peer, "malformed datagram dropped: {}", e);
                continue;
            }
        };
        if version != RPC_VERSION {
            tracing::debug!(peer = %peer, "RPC version mismatch, denying");
            if pkt.build_rpc_mismatch().is_ok() && reply_tx.send((peer, pkt)).await.is_err() {
                break;
            }
            continue;
        }

        dispatch
            .submit(RpcMessage {
                packet: pkt,
                endpoint: ClientEndpoint::udp(peer),
                sink: ReplySink::Datagram(reply_tx.clone()),
            })
            .await;
    }
}

/// Single consumer of the reply queue; the only writer on the socket.
async fn send_loop(
    socket: Arc<UdpSocket>,
    mut replies: mpsc::Receiver<(SocketAddr, RpcPacket)>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = replies.recv() => next,
        };
        match next {
            Some((peer, pkt)) => {
                if let Err(e) = socket.send_to(pkt.body(), peer).await {
                    tracing::warn!(peer = %peer, "reply send failed: {}", e);
                }
            }
            None => break,
        }
    }
}

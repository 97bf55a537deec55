//! Stream (TCP) session layer.
//!
//! One reader task per accepted connection reassembles record-marked
//! messages: each fragment is a 4-byte word (high bit = last fragment,
//! low 31 bits = byte length) followed by that many payload bytes, and
//! a message is complete when the last-fragment flag is seen. A
//! declared length that would overflow the receive packet aborts the
//! connection; a protocol-version mismatch gets a synthesized denied
//! reply without touching the worker pool.
//!
//! Replies leave through a per-connection writer task fed by an mpsc
//! channel, so workers never contend on the socket. The fragment word
//! is written into the packet's reserved header bytes and the whole
//! frame goes out as one write.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::pool::PacketPool;
use crate::protocol::wire::{FRAGMENT_LENGTH_MASK, LAST_FRAGMENT, RPC_VERSION};
use crate::protocol::RpcPacket;
use crate::transport::{ClientEndpoint, ReplySink, RpcMessage};
use crate::worker::Dispatch;

/// Depth of each connection's reply channel.
const REPLY_CHANNEL_DEPTH: usize = 32;

/// Listening TCP session handler.
pub struct TcpSessionHandler {
    local_addr: SocketAddr,
    token: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl TcpSessionHandler {
    /// Bind `addr` and start accepting connections. Port 0 picks an
    /// ephemeral port; see [`local_addr`](Self::local_addr).
    pub async fn bind(
        addr: SocketAddr,
        pool: Arc<PacketPool>,
        dispatch: Dispatch,
        max_message_size: usize,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let token = parent.child_token();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            pool,
            dispatch,
            max_message_size,
            token.clone(),
        ));

        tracing::debug!(addr = %local_addr, "TCP session handler listening");
        Ok(Self {
            local_addr,
            token,
            accept_task,
        })
    }

    /// The bound local address.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound TCP port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and tear down reader tasks. In-flight requests
    /// may be abandoned; their packets return to the pool on drop.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.accept_task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    pool: Arc<PacketPool>,
    dispatch: Dispatch,
    max_message_size: usize,
    token: CancellationToken,
) {
    let mut next_session = 1u64;
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let session = next_session;
                next_session += 1;
                tracing::debug!(session, peer = %peer, "connection accepted");
                tokio::spawn(connection_task(
                    stream,
                    peer,
                    session,
                    pool.clone(),
                    dispatch.clone(),
                    max_message_size,
                    token.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
            }
        }
    }
}

async fn connection_task(
    stream: TcpStream,
    peer: SocketAddr,
    session: u64,
    pool: Arc<PacketPool>,
    dispatch: Dispatch,
    max_message_size: usize,
    token: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_DEPTH);
    let writer_task = tokio::spawn(write_loop(writer, reply_rx));

    let endpoint = ClientEndpoint::tcp(peer);
    match read_loop(
        &mut reader,
        endpoint,
        &reply_tx,
        &pool,
        &dispatch,
        max_message_size,
        &token,
    )
    .await
    {
        Ok(()) => tracing::debug!(session, peer = %peer, "connection closed"),
        Err(e) => tracing::warn!(session, peer = %peer, "connection aborted: {}", e),
    }

    // Let queued replies flush before the write half is dropped.
    drop(reply_tx);
    let _ = writer_task.await;
}

/// Read messages until the peer closes, the token fires, or a framing
/// error aborts the connection.
async fn read_loop(
    reader: &mut OwnedReadHalf,
    endpoint: ClientEndpoint,
    reply_tx: &mpsc::Sender<RpcPacket>,
    pool: &Arc<PacketPool>,
    dispatch: &Dispatch,
    max_message_size: usize,
    token: &CancellationToken,
) -> Result<()> {
    loop {
        // First fragment word of the next message; a clean close can
        // only happen here, between messages.
        let word = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            word = read_fragment_word(reader) => word?,
        };
        let word = match word {
            Some(w) => w,
            None => return Ok(()),
        };
        let (mut last, mut frag_len) = split_fragment_word(word, max_message_size)?;

        // A lone fragment only needs its own length; a multi-fragment
        // message gets the full-size packet up front since the total is
        // unknown.
        let wanted = if last { frag_len } else { max_message_size };
        let mut pkt = match pool.allocate_cancellable(wanted, token).await {
            Ok(p) => p,
            Err(RpcError::PoolCancelled) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut offset = RpcPacket::HEADER_RESERVE;

        // Reassemble fragments until the last-fragment flag is seen.
        loop {
            if offset + frag_len > pkt.capacity() {
                return Err(RpcError::Framing(format!(
                    "message of {}+ bytes overflows {}-byte packet",
                    offset - RpcPacket::HEADER_RESERVE + frag_len,
                    pkt.capacity() - RpcPacket::HEADER_RESERVE
                )));
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                read = reader.read_exact(&mut pkt.buf_mut()[offset..offset + frag_len]) => {
                    read?;
                }
            }
            offset += frag_len;

            if last {
                break;
            }

            let word = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                word = read_fragment_word(reader) => word?,
            };
            let word = word.ok_or_else(|| {
                RpcError::Framing("connection closed between fragments".to_string())
            })?;
            (last, frag_len) = split_fragment_word(word, max_message_size)?;
        }

        pkt.set_end(offset);
        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);

        // Malformed headers close the connection; they never reach the
        // processor.
        pkt.validate_call()?;

        if pkt.rpc_version()? != RPC_VERSION {
            tracing::debug!(peer = %endpoint, "RPC version mismatch, denying");
            pkt.build_rpc_mismatch()?;
            if reply_tx.send(pkt).await.is_err() {
                return Err(RpcError::ConnectionClosed);
            }
            continue;
        }

        dispatch
            .submit(RpcMessage {
                packet: pkt,
                endpoint,
                sink: ReplySink::Stream(reply_tx.clone()),
            })
            .await;
    }
}

/// Split a fragment word into its last-fragment flag and length,
/// rejecting lengths beyond the configured maximum.
fn split_fragment_word(word: u32, max_message_size: usize) -> Result<(bool, usize)> {
    let last = word & LAST_FRAGMENT != 0;
    let frag_len = (word & FRAGMENT_LENGTH_MASK) as usize;
    if frag_len > max_message_size {
        return Err(RpcError::Framing(format!(
            "fragment of {} bytes exceeds maximum message size {}",
            frag_len, max_message_size
        )));
    }
    Ok((last, frag_len))
}

/// Read one 4-byte fragment word. `Ok(None)` means the peer closed
/// cleanly before sending any of it.
async fn read_fragment_word(reader: &mut OwnedReadHalf) -> Result<Option<u32>> {
    let mut word = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut word[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(RpcError::Framing(
                "connection closed inside fragment header".to_string(),
            ));
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(word)))
}

/// Drain the reply channel onto the socket. Each reply is stamped with
/// its fragment word and leaves as a single write.
async fn write_loop(mut writer: OwnedWriteHalf, mut replies: mpsc::Receiver<RpcPacket>) {
    while let Some(mut pkt) = replies.recv().await {
        let len = pkt.message_len() as u32;
        pkt.write_fragment_header(LAST_FRAGMENT | len);
        if let Err(e) = writer.write_all(pkt.frame()).await {
            tracing::debug!("reply write failed: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!("reply flush failed: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NullAuthenticator;
    use crate::processor::RpcProcessor;
    use crate::protocol::wire::{auth_flavor, reject_status, reply_state};
    use crate::worker::RequestHandler;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Replies with a single result word: the received message length.
    struct LengthProcessor;

    #[async_trait]
    impl RpcProcessor for LengthProcessor {
        async fn process(
            &self,
            mut packet: RpcPacket,
            _endpoint: &ClientEndpoint,
        ) -> Result<Option<RpcPacket>> {
            let len = packet.message_len() as u32;
            packet.build_reply_header()?;
            packet.put_u32(len)?;
            Ok(Some(packet))
        }
    }

    async fn start_handler() -> (TcpSessionHandler, CancellationToken) {
        let token = CancellationToken::new();
        let handler = Arc::new(RequestHandler::new(
            Arc::new(LengthProcessor),
            Arc::new(NullAuthenticator),
            vec![],
        ));
        let tcp = TcpSessionHandler::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(PacketPool::default()),
            Dispatch::Inline(handler),
            65536,
            &token,
        )
        .await
        .unwrap();
        (tcp, token)
    }

    fn call_frame(total_len: usize, version: u32) -> Vec<u8> {
        let mut pkt = RpcPacket::new(total_len.max(64));
        pkt.build_call_header(100005, 1, 0, auth_flavor::AUTH_NULL, &[], 0, &[])
            .unwrap();
        if version != RPC_VERSION {
            pkt.set_write_pos(12);
            pkt.put_u32(version).unwrap();
        }
        let padding = total_len.saturating_sub(pkt.message_len());
        pkt.set_write_pos(pkt.end());
        pkt.put_bytes(&vec![0xEE; padding]).unwrap();
        pkt.body().to_vec()
    }

    async fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
        let mut word = [0u8; 4];
        stream.read_exact(&mut word).await.unwrap();
        let word = u32::from_be_bytes(word);
        assert_ne!(word & LAST_FRAGMENT, 0, "reply must be a single fragment");
        let len = (word & FRAGMENT_LENGTH_MASK) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    fn reply_word(body: &[u8], index: usize) -> u32 {
        u32::from_be_bytes(body[index * 4..index * 4 + 4].try_into().unwrap())
    }

    #[tokio::test]
    async fn test_unfragmented_message_roundtrip() {
        let (tcp, token) = start_handler().await;
        let mut stream = TcpStream::connect(tcp.local_addr()).await.unwrap();

        let body = call_frame(354, RPC_VERSION);
        assert_eq!(body.len(), 354);
        let mut frame = (LAST_FRAGMENT | 354).to_be_bytes().to_vec();
        frame.extend_from_slice(&body);
        stream.write_all(&frame).await.unwrap();

        let reply = read_reply(&mut stream).await;
        // xid | reply | accepted | null verf | success | length result
        assert_eq!(reply_word(&reply, 1), 1);
        assert_eq!(reply_word(&reply, 2), reply_state::ACCEPTED);
        assert_eq!(reply_word(&reply, 6), 354);

        token.cancel();
        tcp.shutdown().await;
    }

    #[tokio::test]
    async fn test_three_fragment_message_reassembles() {
        let (tcp, token) = start_handler().await;
        let mut stream = TcpStream::connect(tcp.local_addr()).await.unwrap();

        let body = call_frame(354, RPC_VERSION);
        // Fragment lengths 100 + 250 + 4 = 354; only the third carries
        // the last-fragment flag.
        let splits = [(0usize, 100usize, false), (100, 250, false), (350, 4, true)];
        for (start, len, last) in splits {
            let mut word = len as u32;
            if last {
                word |= LAST_FRAGMENT;
            }
            stream.write_all(&word.to_be_bytes()).await.unwrap();
            stream.write_all(&body[start..start + len]).await.unwrap();
        }

        let reply = read_reply(&mut stream).await;
        assert_eq!(reply_word(&reply, 6), 354, "reassembled length differs");

        token.cancel();
        tcp.shutdown().await;
    }

    #[tokio::test]
    async fn test_version_mismatch_denied_without_processor() {
        let (tcp, token) = start_handler().await;
        let mut stream = TcpStream::connect(tcp.local_addr()).await.unwrap();

        let body = call_frame(40, 3);
        let mut frame = (LAST_FRAGMENT | body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&body);
        stream.write_all(&frame).await.unwrap();

        let reply = read_reply(&mut stream).await;
        assert_eq!(reply_word(&reply, 1), 1);
        assert_eq!(reply_word(&reply, 2), reply_state::DENIED);
        assert_eq!(reply_word(&reply, 3), reject_status::RPC_MISMATCH);
        assert_eq!(reply_word(&reply, 4), RPC_VERSION);
        assert_eq!(reply_word(&reply, 5), RPC_VERSION);

        // The connection stays usable after the denial.
        let body = call_frame(64, RPC_VERSION);
        let mut frame = (LAST_FRAGMENT | body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&body);
        stream.write_all(&frame).await.unwrap();
        let reply = read_reply(&mut stream).await;
        assert_eq!(reply_word(&reply, 2), reply_state::ACCEPTED);

        token.cancel();
        tcp.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_fragment_aborts_connection() {
        let (tcp, token) = start_handler().await;
        let mut stream = TcpStream::connect(tcp.local_addr()).await.unwrap();

        // Declared length far beyond the maximum message size.
        let word = LAST_FRAGMENT | 0x00FF_FFFF;
        stream.write_all(&word.to_be_bytes()).await.unwrap();

        // The server closes without replying.
        let mut buf = [0u8; 4];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("server left connection open");
        assert_eq!(read.unwrap(), 0);

        token.cancel();
        tcp.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (tcp, token) = start_handler().await;
        let addr = tcp.local_addr();
        token.cancel();
        tcp.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // After shutdown no new session answers; the connect either
        // fails outright or sees an immediate close instead of a reply.
        match TcpStream::connect(addr).await {
            Err(_) => {}
            Ok(mut stream) => {
                let body = call_frame(40, RPC_VERSION);
                let mut frame = (LAST_FRAGMENT | body.len() as u32).to_be_bytes().to_vec();
                frame.extend_from_slice(&body);
                let _ = stream.write_all(&frame).await;

                let mut buf = [0u8; 4];
                let read = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut buf))
                    .await
                    .expect("dead session must not reply");
                assert!(matches!(read, Ok(0) | Err(_)));
            }
        }
    }
}

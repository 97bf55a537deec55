//! RPC message buffer with XDR-style primitive pack/unpack.
//!
//! An [`RpcPacket`] owns a fixed-size byte buffer plus independent read
//! and write cursors and an end-of-data offset. The first 4 bytes of the
//! buffer are reserved for the stream fragment word so a TCP reply can be
//! sent as one contiguous write; the RPC message itself always starts at
//! offset 4, on both transports, so decoding is uniform.
//!
//! All multi-byte integers are big-endian. Variable-length fields (opaque
//! byte runs, strings) carry a 4-byte length prefix and are padded to the
//! next 4-byte boundary.
//!
//! # Example
//!
//! ```
//! use rpcwire::protocol::RpcPacket;
//!
//! let mut pkt = RpcPacket::new(512);
//! pkt.put_u32(42).unwrap();
//! pkt.put_opaque(b"abc").unwrap();
//!
//! pkt.set_read_pos(RpcPacket::HEADER_RESERVE);
//! assert_eq!(pkt.get_u32().unwrap(), 42);
//! assert_eq!(pkt.get_opaque().unwrap(), b"abc");
//! ```

use bytes::BytesMut;

use crate::error::{Result, RpcError};
use crate::pool::PoolHandle;

/// Round a length up to the next 4-byte boundary.
#[inline]
pub fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// An RPC message buffer with read/write cursors.
///
/// Packets are either borrowed from a [`PacketPool`](crate::pool::PacketPool)
/// (the `owner` tag is set, and dropping the packet returns the buffer to
/// its pool) or constructed ad hoc with [`RpcPacket::new`] (dropping simply
/// frees the buffer). Release logic checks the tag, not the construction
/// site.
pub struct RpcPacket {
    /// Backing storage; length is fixed at construction.
    buf: BytesMut,
    /// Read cursor (absolute buffer offset).
    rx: usize,
    /// Write cursor (absolute buffer offset).
    tx: usize,
    /// End-of-data offset; bytes in `HEADER_RESERVE..end` are the message.
    end: usize,
    /// Owning pool class, if any.
    owner: Option<PoolHandle>,
}

impl RpcPacket {
    /// Bytes reserved at the front of the buffer for the stream
    /// fragment length/flag word.
    pub const HEADER_RESERVE: usize = 4;

    /// Create an unpooled packet able to hold `msg_capacity` message bytes.
    pub fn new(msg_capacity: usize) -> Self {
        Self::from_parts(BytesMut::zeroed(msg_capacity + Self::HEADER_RESERVE), None)
    }

    /// Wrap a pool-owned buffer. The buffer length must already include
    /// the header reservation.
    pub(crate) fn from_parts(buf: BytesMut, owner: Option<PoolHandle>) -> Self {
        debug_assert!(buf.len() >= Self::HEADER_RESERVE);
        Self {
            buf,
            rx: Self::HEADER_RESERVE,
            tx: Self::HEADER_RESERVE,
            end: Self::HEADER_RESERVE,
            owner,
        }
    }

    /// Total buffer capacity, header reservation included.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Reset cursors and end-of-data for buffer reuse.
    pub fn reset(&mut self) {
        self.rx = Self::HEADER_RESERVE;
        self.tx = Self::HEADER_RESERVE;
        self.end = Self::HEADER_RESERVE;
    }

    /// True if this packet came from a pool.
    #[inline]
    pub fn is_pooled(&self) -> bool {
        self.owner.is_some()
    }

    // ------------------------------------------------------------------
    // Cursor / length management
    // ------------------------------------------------------------------

    /// Current read cursor (absolute offset).
    #[inline]
    pub fn read_pos(&self) -> usize {
        self.rx
    }

    /// Move the read cursor to an absolute offset.
    #[inline]
    pub fn set_read_pos(&mut self, pos: usize) {
        self.rx = pos;
    }

    /// Current write cursor (absolute offset).
    #[inline]
    pub fn write_pos(&self) -> usize {
        self.tx
    }

    /// Move the write cursor to an absolute offset.
    #[inline]
    pub fn set_write_pos(&mut self, pos: usize) {
        self.tx = pos;
    }

    /// End-of-data offset.
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    /// Set the end-of-data offset (used after a receive fills the buffer).
    #[inline]
    pub fn set_end(&mut self, end: usize) {
        self.end = end;
    }

    /// Message length in bytes, excluding the header reservation.
    #[inline]
    pub fn message_len(&self) -> usize {
        self.end.saturating_sub(Self::HEADER_RESERVE)
    }

    /// Remaining unread bytes between the read cursor and end-of-data.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.rx)
    }

    // ------------------------------------------------------------------
    // Raw buffer access
    // ------------------------------------------------------------------

    /// The full frame: fragment word area plus message bytes.
    #[inline]
    pub fn frame(&self) -> &[u8] {
        &self.buf[..self.end]
    }

    /// The message bytes only (no fragment word).
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.buf[Self::HEADER_RESERVE..self.end]
    }

    /// Mutable view of the whole buffer, for socket receives.
    #[inline]
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Write the stream fragment word into the reserved header area.
    #[inline]
    pub fn write_fragment_header(&mut self, word: u32) {
        self.buf[..4].copy_from_slice(&word.to_be_bytes());
    }

    // ------------------------------------------------------------------
    // Pack primitives
    // ------------------------------------------------------------------

    fn check_write(&self, need: usize) -> Result<()> {
        if self.tx + need > self.buf.len() {
            return Err(RpcError::Framing(format!(
                "write of {} bytes at offset {} overruns {}-byte packet",
                need,
                self.tx,
                self.buf.len()
            )));
        }
        Ok(())
    }

    #[inline]
    fn bump_end(&mut self) {
        if self.tx > self.end {
            self.end = self.tx;
        }
    }

    /// Pack a 32-bit unsigned integer.
    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.check_write(4)?;
        self.buf[self.tx..self.tx + 4].copy_from_slice(&v.to_be_bytes());
        self.tx += 4;
        self.bump_end();
        Ok(())
    }

    /// Pack a 32-bit signed integer.
    pub fn put_i32(&mut self, v: i32) -> Result<()> {
        self.put_u32(v as u32)
    }

    /// Pack a 64-bit unsigned integer.
    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.check_write(8)?;
        self.buf[self.tx..self.tx + 8].copy_from_slice(&v.to_be_bytes());
        self.tx += 8;
        self.bump_end();
        Ok(())
    }

    /// Pack raw bytes with no length prefix and no padding.
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.check_write(data.len())?;
        self.buf[self.tx..self.tx + data.len()].copy_from_slice(data);
        self.tx += data.len();
        self.bump_end();
        Ok(())
    }

    /// Pack an opaque byte run: 4-byte length, data, zero padding to a
    /// 4-byte boundary.
    pub fn put_opaque(&mut self, data: &[u8]) -> Result<()> {
        let pad = pad4(data.len());
        self.check_write(4 + data.len() + pad)?;
        self.put_u32(data.len() as u32)?;
        self.put_bytes(data)?;
        for _ in 0..pad {
            self.buf[self.tx] = 0;
            self.tx += 1;
        }
        self.bump_end();
        Ok(())
    }

    /// Pack a string with opaque framing (not NUL-terminated).
    pub fn put_string(&mut self, s: &str) -> Result<()> {
        self.put_opaque(s.as_bytes())
    }

    /// Pack a fixed-size run of 32-bit integers (no length prefix).
    pub fn put_u32_slice(&mut self, values: &[u32]) -> Result<()> {
        self.check_write(values.len() * 4)?;
        for v in values {
            self.put_u32(*v)?;
        }
        Ok(())
    }

    /// Advance the write cursor to the next 4-byte boundary, zeroing
    /// the skipped bytes.
    pub fn align_write(&mut self) -> Result<()> {
        let pad = pad4(self.tx);
        self.check_write(pad)?;
        for _ in 0..pad {
            self.buf[self.tx] = 0;
            self.tx += 1;
        }
        self.bump_end();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unpack primitives
    // ------------------------------------------------------------------

    fn check_read(&self, need: usize) -> Result<()> {
        if self.rx + need > self.end {
            return Err(RpcError::Framing(format!(
                "read of {} bytes at offset {} overruns message end {}",
                need, self.rx, self.end
            )));
        }
        Ok(())
    }

    /// Unpack a 32-bit unsigned integer.
    pub fn get_u32(&mut self) -> Result<u32> {
        self.check_read(4)?;
        let v = u32::from_be_bytes([
            self.buf[self.rx],
            self.buf[self.rx + 1],
            self.buf[self.rx + 2],
            self.buf[self.rx + 3],
        ]);
        self.rx += 4;
        Ok(v)
    }

    /// Unpack a 32-bit signed integer.
    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    /// Unpack a 64-bit unsigned integer.
    pub fn get_u64(&mut self) -> Result<u64> {
        self.check_read(8)?;
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[self.rx..self.rx + 8]);
        self.rx += 8;
        Ok(u64::from_be_bytes(b))
    }

    /// Unpack `len` raw bytes (no length prefix, no padding).
    pub fn get_bytes(&mut self, len: usize) -> Result<&[u8]> {
        self.check_read(len)?;
        let start = self.rx;
        self.rx += len;
        Ok(&self.buf[start..start + len])
    }

    /// Unpack an opaque byte run and skip its padding.
    pub fn get_opaque(&mut self) -> Result<&[u8]> {
        let len = self.get_u32()? as usize;
        let pad = pad4(len);
        self.check_read(len + pad)?;
        let start = self.rx;
        self.rx += len + pad;
        Ok(&self.buf[start..start + len])
    }

    /// Unpack a string (opaque framing, UTF-8 contents).
    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_opaque()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RpcError::Framing("string field is not valid UTF-8".to_string()))
    }

    /// Unpack a fixed-size run of `count` 32-bit integers.
    pub fn get_u32_vec(&mut self, count: usize) -> Result<Vec<u32>> {
        self.check_read(count * 4)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.get_u32()?);
        }
        Ok(out)
    }

    /// Skip `len` bytes of the message.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.check_read(len)?;
        self.rx += len;
        Ok(())
    }

    /// Advance the read cursor to the next 4-byte boundary.
    pub fn align_read(&mut self) -> Result<()> {
        self.skip(pad4(self.rx))
    }

    /// Read a 32-bit integer at an absolute offset without moving the
    /// read cursor.
    pub fn peek_u32_at(&self, offset: usize) -> Result<u32> {
        if offset + 4 > self.end {
            return Err(RpcError::Framing(format!(
                "peek at offset {} overruns message end {}",
                offset, self.end
            )));
        }
        Ok(u32::from_be_bytes([
            self.buf[offset],
            self.buf[offset + 1],
            self.buf[offset + 2],
            self.buf[offset + 3],
        ]))
    }
}

impl std::fmt::Debug for RpcPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPacket")
            .field("capacity", &self.buf.len())
            .field("rx", &self.rx)
            .field("tx", &self.tx)
            .field("end", &self.end)
            .field("pooled", &self.owner.is_some())
            .finish()
    }
}

impl Drop for RpcPacket {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release(std::mem::take(&mut self.buf));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad4() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 3);
        assert_eq!(pad4(2), 2);
        assert_eq!(pad4(3), 1);
        assert_eq!(pad4(4), 0);
        assert_eq!(pad4(5), 3);
    }

    #[test]
    fn test_u32_roundtrip() {
        let mut pkt = RpcPacket::new(64);
        pkt.put_u32(0xDEADBEEF).unwrap();
        pkt.put_u32(0).unwrap();
        pkt.put_u32(u32::MAX).unwrap();

        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);
        assert_eq!(pkt.get_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(pkt.get_u32().unwrap(), 0);
        assert_eq!(pkt.get_u32().unwrap(), u32::MAX);
    }

    #[test]
    fn test_i32_and_u64_roundtrip() {
        let mut pkt = RpcPacket::new(64);
        pkt.put_i32(-1).unwrap();
        pkt.put_u64(0x0102_0304_0506_0708).unwrap();

        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);
        assert_eq!(pkt.get_i32().unwrap(), -1);
        assert_eq!(pkt.get_u64().unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_big_endian_layout() {
        let mut pkt = RpcPacket::new(16);
        pkt.put_u32(0x01020304).unwrap();
        assert_eq!(&pkt.body()[..4], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_opaque_occupies_length_plus_pad() {
        for len in 0..9usize {
            let data = vec![0xAB; len];
            let mut pkt = RpcPacket::new(64);
            pkt.put_opaque(&data).unwrap();
            assert_eq!(
                pkt.message_len(),
                4 + len + pad4(len),
                "opaque of length {} mis-sized",
                len
            );
        }
    }

    #[test]
    fn test_opaque_roundtrip() {
        let mut pkt = RpcPacket::new(64);
        pkt.put_opaque(b"hello").unwrap();
        pkt.put_u32(7).unwrap();

        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);
        assert_eq!(pkt.get_opaque().unwrap(), b"hello");
        // Cursor must have skipped the 3 pad bytes.
        assert_eq!(pkt.get_u32().unwrap(), 7);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut pkt = RpcPacket::new(64);
        pkt.put_string("mount").unwrap();

        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);
        assert_eq!(pkt.get_string().unwrap(), "mount");
    }

    #[test]
    fn test_string_not_nul_terminated() {
        let mut pkt = RpcPacket::new(64);
        pkt.put_string("abcd").unwrap();
        // 4 length bytes + 4 data bytes, no terminator, no padding needed.
        assert_eq!(pkt.message_len(), 8);
    }

    #[test]
    fn test_u32_slice_roundtrip() {
        let mut pkt = RpcPacket::new(64);
        pkt.put_u32_slice(&[1, 2, 3]).unwrap();

        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);
        assert_eq!(pkt.get_u32_vec(3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_write_overrun_is_framing_error() {
        let mut pkt = RpcPacket::new(8);
        pkt.put_u64(1).unwrap();
        let err = pkt.put_u32(2).unwrap_err();
        assert!(matches!(err, RpcError::Framing(_)));
    }

    #[test]
    fn test_read_overrun_is_framing_error() {
        let mut pkt = RpcPacket::new(16);
        pkt.put_u32(1).unwrap();
        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);
        pkt.get_u32().unwrap();
        assert!(matches!(pkt.get_u32(), Err(RpcError::Framing(_))));
    }

    #[test]
    fn test_declared_opaque_longer_than_message_fails() {
        let mut pkt = RpcPacket::new(32);
        pkt.put_u32(1000).unwrap(); // claims 1000 bytes follow
        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);
        assert!(matches!(pkt.get_opaque(), Err(RpcError::Framing(_))));
    }

    #[test]
    fn test_reset_rewinds_cursors() {
        let mut pkt = RpcPacket::new(32);
        pkt.put_u32(9).unwrap();
        assert_eq!(pkt.message_len(), 4);

        pkt.reset();
        assert_eq!(pkt.message_len(), 0);
        assert_eq!(pkt.read_pos(), RpcPacket::HEADER_RESERVE);
        assert_eq!(pkt.write_pos(), RpcPacket::HEADER_RESERVE);
    }

    #[test]
    fn test_fragment_header_does_not_alias_message() {
        let mut pkt = RpcPacket::new(32);
        pkt.put_u32(0x11223344).unwrap();
        pkt.write_fragment_header(0x8000_0004);

        assert_eq!(&pkt.frame()[..4], &[0x80, 0x00, 0x00, 0x04]);
        assert_eq!(&pkt.body()[..4], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_align_read_and_write() {
        let mut pkt = RpcPacket::new(32);
        pkt.put_bytes(b"ab").unwrap();
        pkt.align_write().unwrap();
        assert_eq!(pkt.write_pos() % 4, 0);
        pkt.put_u32(5).unwrap();

        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);
        pkt.skip(2).unwrap();
        pkt.align_read().unwrap();
        assert_eq!(pkt.get_u32().unwrap(), 5);
    }

    #[test]
    fn test_unpooled_packet_is_untagged() {
        let pkt = RpcPacket::new(16);
        assert!(!pkt.is_pooled());
        assert_eq!(pkt.capacity(), 16 + RpcPacket::HEADER_RESERVE);
    }

    #[test]
    fn test_peek_does_not_move_cursor() {
        let mut pkt = RpcPacket::new(16);
        pkt.put_u32(77).unwrap();
        pkt.set_read_pos(RpcPacket::HEADER_RESERVE);

        assert_eq!(pkt.peek_u32_at(RpcPacket::HEADER_RESERVE).unwrap(), 77);
        assert_eq!(pkt.read_pos(), RpcPacket::HEADER_RESERVE);
        assert!(pkt.peek_u32_at(100).is_err());
    }
}

//! Reusable packet pool with small/large size classes.
//!
//! Allocation picks the smallest class that fits the requested message
//! size. Each class keeps its own free list, construction count,
//! allocation ceiling, lock and waiter notification, so the small and
//! large classes never contend with each other.
//!
//! Below the ceiling an empty free list just constructs a new buffer; at
//! the ceiling [`PacketPool::allocate`] waits until another task releases
//! a packet. Release happens when a pooled [`RpcPacket`] is dropped: the
//! packet carries an owner tag pointing back at its class, and the drop
//! path pushes the buffer onto the free list and wakes exactly one
//! waiter. Packets constructed outside the pool carry no tag and are
//! simply freed.
//!
//! # Example
//!
//! ```ignore
//! let pool = PacketPool::new(512, Some(50), 65536, Some(50));
//! let pkt = pool.allocate(300).await?; // small class
//! drop(pkt);                           // back on the small free list
//! ```

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::protocol::RpcPacket;

/// Default small packet message capacity.
pub const DEFAULT_SMALL_PACKET_SIZE: usize = 512;

/// Default large packet message capacity.
pub const DEFAULT_LARGE_PACKET_SIZE: usize = 65536;

/// Default per-class allocation ceiling.
pub const DEFAULT_PACKET_CEILING: usize = 50;

/// One size class: free list plus construction accounting.
struct ClassState {
    free: Vec<BytesMut>,
    constructed: usize,
}

struct PoolClass {
    /// Message capacity of packets in this class.
    msg_capacity: usize,
    /// Maximum packets ever constructed; `None` = unbounded.
    ceiling: Option<usize>,
    state: Mutex<ClassState>,
    released: Notify,
}

impl PoolClass {
    fn new(msg_capacity: usize, ceiling: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            msg_capacity,
            ceiling,
            state: Mutex::new(ClassState {
                free: Vec::new(),
                constructed: 0,
            }),
            released: Notify::new(),
        })
    }

    /// Take a free buffer, or construct one if below the ceiling.
    fn try_take(&self) -> Option<BytesMut> {
        let mut st = self.state.lock().expect("pool class lock poisoned");
        if let Some(buf) = st.free.pop() {
            return Some(buf);
        }
        match self.ceiling {
            Some(ceiling) if st.constructed >= ceiling => None,
            _ => {
                st.constructed += 1;
                Some(BytesMut::zeroed(
                    self.msg_capacity + RpcPacket::HEADER_RESERVE,
                ))
            }
        }
    }

    async fn acquire(self: Arc<Self>) -> RpcPacket {
        loop {
            let released = self.released.notified();
            if let Some(buf) = self.try_take() {
                return RpcPacket::from_parts(buf, Some(PoolHandle(self.clone())));
            }
            released.await;
        }
    }

    fn available(&self) -> usize {
        self.state
            .lock()
            .expect("pool class lock poisoned")
            .free
            .len()
    }

    fn in_use(&self) -> usize {
        let st = self.state.lock().expect("pool class lock poisoned");
        st.constructed - st.free.len()
    }
}

/// Owner tag carried by pooled packets; dropping the packet routes its
/// buffer back here.
pub struct PoolHandle(Arc<PoolClass>);

impl PoolHandle {
    /// Return a buffer to the free list and wake one waiter.
    pub(crate) fn release(&self, buf: BytesMut) {
        {
            let mut st = self.0.state.lock().expect("pool class lock poisoned");
            st.free.push(buf);
        }
        self.0.released.notify_one();
    }
}

/// Packet pool with independent small and large classes.
pub struct PacketPool {
    small: Arc<PoolClass>,
    large: Arc<PoolClass>,
}

impl PacketPool {
    /// Create a pool. Sizes are message capacities (the 4-byte fragment
    /// header reservation is added internally); a `None` ceiling makes
    /// that class unbounded, so allocation never blocks on it.
    pub fn new(
        small_size: usize,
        small_ceiling: Option<usize>,
        large_size: usize,
        large_ceiling: Option<usize>,
    ) -> Self {
        debug_assert!(small_size < large_size);
        Self {
            small: PoolClass::new(small_size, small_ceiling),
            large: PoolClass::new(large_size, large_ceiling),
        }
    }

    fn class_for(&self, msg_len: usize) -> Result<&Arc<PoolClass>> {
        if msg_len <= self.small.msg_capacity {
            Ok(&self.small)
        } else if msg_len <= self.large.msg_capacity {
            Ok(&self.large)
        } else {
            Err(RpcError::PacketTooLarge(msg_len, self.large.msg_capacity))
        }
    }

    /// Allocate a packet able to hold a `msg_len`-byte message, waiting
    /// if the chosen class is at its ceiling with nothing free.
    pub async fn allocate(&self, msg_len: usize) -> Result<RpcPacket> {
        Ok(self.class_for(msg_len)?.clone().acquire().await)
    }

    /// Allocate as [`allocate`](Self::allocate), but give up when the
    /// token fires. A cancelled wait is a transient condition, not a
    /// protocol error; the caller gets [`RpcError::PoolCancelled`] and
    /// no packet.
    pub async fn allocate_cancellable(
        &self,
        msg_len: usize,
        token: &CancellationToken,
    ) -> Result<RpcPacket> {
        let class = self.class_for(msg_len)?.clone();
        tokio::select! {
            pkt = class.acquire() => Ok(pkt),
            _ = token.cancelled() => Err(RpcError::PoolCancelled),
        }
    }

    /// Free packets in the small class.
    pub fn small_available(&self) -> usize {
        self.small.available()
    }

    /// Outstanding packets in the small class.
    pub fn small_in_use(&self) -> usize {
        self.small.in_use()
    }

    /// Free packets in the large class.
    pub fn large_available(&self) -> usize {
        self.large.available()
    }

    /// Outstanding packets in the large class.
    pub fn large_in_use(&self) -> usize {
        self.large.in_use()
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new(
            DEFAULT_SMALL_PACKET_SIZE,
            Some(DEFAULT_PACKET_CEILING),
            DEFAULT_LARGE_PACKET_SIZE,
            Some(DEFAULT_PACKET_CEILING),
        )
    }
}

use crate::memory_pool::{DefaultAllocator, MemoryAllocator};
use anyhow::bail;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Configuration of the per-stream assembler.
pub struct StreamConfig {
    /// Maximum number of live (in-flight) heaps held by the stream. When a
    ///  packet arrives for a new heap and all slots are in use, the oldest
    ///  slot is evicted even if its heap is incomplete. This prevents heaps
    ///  with lost packets from hanging around forever.
    pub max_heaps: usize,

    /// Allocator for heap payload buffers. Defaults to plain heap allocation;
    ///  install a [`crate::memory_pool::MemoryPool`] to recycle buffers.
    pub memory_allocator: Arc<dyn MemoryAllocator>,
}

impl StreamConfig {
    pub const DEFAULT_MAX_HEAPS: usize = 4;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_heaps == 0 {
            bail!("a stream needs at least one live heap slot");
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            max_heaps: Self::DEFAULT_MAX_HEAPS,
            memory_allocator: Arc::new(DefaultAllocator),
        }
    }
}

/// Configuration of the ring consumer on top of a stream.
pub struct RingConfig {
    /// Capacity of the ring of completed heaps. When the ring is full the
    ///  stream pauses its readers until the consumer pops.
    pub ring_heaps: usize,

    /// Drop non-contiguous heaps at the ring instead of queueing them.
    pub contiguous_only: bool,
}

impl RingConfig {
    pub const DEFAULT_RING_HEAPS: usize = 4;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ring_heaps == 0 {
            bail!("the heap ring needs a capacity of at least one");
        }
        Ok(())
    }
}

impl Default for RingConfig {
    fn default() -> RingConfig {
        RingConfig {
            ring_heaps: Self::DEFAULT_RING_HEAPS,
            contiguous_only: true,
        }
    }
}

/// Configuration of a UDP reader.
pub struct UdpConfig {
    /// Maximum packet size that will be accepted. Larger datagrams are
    ///  detected via a one-byte overflow slot in the receive buffer and
    ///  dropped as truncated.
    pub max_size: usize,

    /// Requested socket receive buffer size, or 0 to leave the OS default.
    ///  The operating system may silently clip the requested size; the reader
    ///  logs a warning when it detects that.
    pub buffer_size: usize,

    /// Number of packets received per I/O turn when the OS provides a
    ///  vectored multi-message receive.
    pub mmsg_count: usize,

    /// Interface address for IPv4 multicast group joins. `None` lets the
    ///  stack pick.
    pub multicast_interface_v4: Option<Ipv4Addr>,

    /// Interface index for IPv6 multicast group joins. `None` lets the
    ///  stack pick.
    pub multicast_interface_v6: Option<u32>,
}

impl UdpConfig {
    pub const DEFAULT_MAX_SIZE: usize = 9200;
    pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;
    pub const DEFAULT_MMSG_COUNT: usize = 64;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_size == 0 {
            bail!("max packet size must be positive");
        }
        if self.mmsg_count == 0 {
            bail!("batched receive needs room for at least one message");
        }
        Ok(())
    }
}

impl Default for UdpConfig {
    fn default() -> UdpConfig {
        UdpConfig {
            max_size: Self::DEFAULT_MAX_SIZE,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            mmsg_count: Self::DEFAULT_MMSG_COUNT,
            multicast_interface_v4: None,
            multicast_interface_v6: None,
        }
    }
}

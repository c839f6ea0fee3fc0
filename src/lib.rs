//! Receive core for SPEAD (Streaming Protocol for Exchanging Astronomical
//!  Data) over UDP: readers acquire raw octet runs from the network, from
//!  memory or from a kernel-bypass capture path, a per-stream assembler
//!  reconstructs multi-packet *heaps* under bounded memory, and a ring
//!  consumer hands completed heaps downstream with backpressure.
//!
//! ## Design goals
//!
//! * High-throughput ingest on reliable data-centre networks
//!   * batched UDP receives (`recvmmsg`) where the OS provides them
//!   * a kernel-bypass integration path that demultiplexes raw frames from
//!     one capture descriptor per interface to many streams
//! * Bounded memory under packet loss
//!   * at most `max_heaps` heaps are live per stream; adding a new heap
//!     ages out the oldest one even if it is incomplete, so heaps with lost
//!     packets never accumulate
//! * Lossless backpressure towards the network where the transport allows it
//!   * when the consumer falls behind, the stream parks undeliverable heaps
//!     on a small resume queue and the readers stop receiving; a resume
//!     signal flows back once the consumer drains
//! * No ordering guarantees across heaps - SPEAD senders interleave heaps
//!   freely, and a receiver that insists on cross-heap order would stall on
//!   every lost packet
//!
//! ## Wire format
//!
//! The packet decoder speaks the SPEAD-64-48 flavour. Every packet starts
//!  with an 8-byte header followed by 8-byte item pointers and payload, all
//!  big-endian:
//!
//! ```ascii
//! 0: magic (0x53)
//! 1: version (0x4)
//! 2: item pointer id width in bytes (2)
//! 3: heap address width in bytes (6)
//! 4: reserved (u16, 0)
//! 6: number of item pointers (u16)
//! 8: item pointers (u64 each):
//!     * bit 63: immediate flag
//!     * bits 62..48: item id
//!     * bits 47..0: immediate value, or payload offset
//! *: payload
//! ```
//!
//! Bookkeeping items (heap cnt, heap length, payload offset/length, stream
//!  control) steer reassembly; all other item pointers are buffered on the
//!  heap for downstream item decoding.
//!
//! ## Threading model
//!
//! All readers run as tasks on the shared tokio runtime. One mutex per
//!  stream protects the assembler and the reader list; it is the only lock
//!  held across the `heap_ready` consumer callback, which must therefore
//!  never block (the ring consumer's push is non-blocking by construction).
//!  Each bypass service serialises its registry and its packet dispatch on a
//!  single strand task, so no lock is shared with the capture path.

pub mod bypass;
pub mod config;
pub mod heap;
pub mod live_heap;
pub mod mem_reader;
pub mod memory_pool;
pub mod packet;
pub mod reader;
pub mod ring;
pub mod ring_stream;
pub mod stream;
pub mod udp_reader;

#[cfg(test)]
pub(crate) mod test_util;

use crate::config::{RingConfig, StreamConfig};
use crate::heap::Heap;
use crate::live_heap::LiveHeap;
use crate::ring::{HeapRing, PushError, RingError};
use crate::stream::{ConsumeOutcome, HeapConsumer, Stream, StreamCore};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info, warn};

/// Consumer side of a [`RingStream`]: a non-blocking push into the ring,
///  with an async waiter on ring space armed whenever the push fails.
struct RingConsumer {
    ring: Arc<HeapRing>,
    /// Back-reference to the stream, filled in after the stream exists. Weak
    ///  because the stream owns the consumer, not the other way around.
    core: OnceLock<Weak<StreamCore>>,
    contiguous_only: bool,
}

impl RingConsumer {
    /// Arrange for the stream to be resumed once the consumer has popped.
    ///  The waiter runs without the stream lock and takes it only for the
    ///  resume itself.
    fn arm_resume_waiter(&self) {
        let ring = self.ring.clone();
        let core = self.core.get().cloned();
        tokio::spawn(async move {
            if ring.wait_space().await.is_err() {
                // the ring stopped while we waited - expected during shutdown
                return;
            }
            let Some(core) = core.and_then(|weak| weak.upgrade()) else {
                return;
            };
            let (stopped, unpaused) = {
                let mut shared = core.lock();
                let unpaused = shared.resume_and_notify();
                (shared.assembler.is_stopped(), unpaused)
            };
            if stopped && unpaused {
                // the stream stopped while paused; now that the flushed heaps
                //  have drained into the ring, nothing more will be produced
                ring.stop();
            }
        });
    }
}

impl HeapConsumer for RingConsumer {
    fn heap_ready(&self, heap: LiveHeap) -> ConsumeOutcome {
        if self.contiguous_only && !heap.is_contiguous() {
            warn!(
                "dropped incomplete heap {} ({}/{:?} bytes of payload)",
                heap.cnt(),
                heap.received_length(),
                heap.heap_length()
            );
            return ConsumeOutcome::Consumed;
        }
        match self.ring.try_push(heap) {
            Ok(()) => ConsumeOutcome::Consumed,
            Err(PushError::Full(heap)) => {
                self.arm_resume_waiter();
                ConsumeOutcome::NotReady(heap)
            }
            Err(PushError::Stopped(heap)) => {
                // no resume is coming from a stopped ring, so drop instead
                info!("dropped heap {} due to external stop", heap.cnt());
                ConsumeOutcome::Consumed
            }
        }
    }

    fn on_stop(&self, still_paused: bool) {
        // while paused, flushed heaps are still parked upstream; the resume
        //  waiter stops the ring once they have drained
        if !still_paused {
            self.ring.stop();
        }
    }
}

/// A stream that pushes its completed heaps into a bounded ring. If the ring
///  fills up, the stream pauses its readers until the consumer pops.
///
/// On the consumer side, heaps are frozen as they are extracted.
pub struct RingStream {
    stream: Stream,
    ring: Arc<HeapRing>,
}

impl RingStream {
    pub fn new(stream_config: StreamConfig, ring_config: RingConfig) -> anyhow::Result<RingStream> {
        ring_config.validate()?;
        let ring = Arc::new(HeapRing::new(ring_config.ring_heaps));
        let consumer = Arc::new(RingConsumer {
            ring: ring.clone(),
            core: OnceLock::new(),
            contiguous_only: ring_config.contiguous_only,
        });
        let stream = Stream::new(stream_config, consumer.clone())?;
        consumer
            .core
            .set(Arc::downgrade(stream.core()))
            .unwrap_or_else(|_| unreachable!("consumer back-reference is set exactly once"));
        Ok(RingStream { stream, ring })
    }

    /// The underlying stream, e.g. for attaching readers.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Wait until a contiguous heap is available, freeze it and return it.
    ///  Non-contiguous heaps encountered on the way are discarded with a log.
    ///
    /// Fails with [`RingError::Stopped`] once the stream has stopped and the
    ///  ring is drained.
    pub async fn pop(&self) -> Result<Heap, RingError> {
        loop {
            let heap = self.ring.pop().await?;
            if heap.is_contiguous() {
                return Ok(Heap::from(heap));
            }
            info!("received incomplete heap {}", heap.cnt());
        }
    }

    /// Like [`pop`](RingStream::pop), but fails with [`RingError::Empty`]
    ///  instead of waiting.
    pub fn try_pop(&self) -> Result<Heap, RingError> {
        loop {
            let heap = self.ring.try_pop()?;
            if heap.is_contiguous() {
                return Ok(Heap::from(heap));
            }
            info!("received incomplete heap {}", heap.cnt());
        }
    }

    /// Stop the ring and the stream, and wait for all readers to wind up.
    pub async fn stop(&self) {
        // stop the ring first: heaps flushed during the stream stop then drop
        //  at the ring instead of waiting for space that will never come
        self.ring.stop();
        self.stream.stop().await;
        debug!("ring stream stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::decode_packet;
    use crate::test_util::PacketBuilder;
    use std::time::Duration;

    fn ring_stream(ring_heaps: usize, contiguous_only: bool) -> RingStream {
        RingStream::new(
            StreamConfig::default(),
            RingConfig {
                ring_heaps,
                contiguous_only,
            },
        )
        .unwrap()
    }

    fn feed(stream: &Stream, packet: &[u8]) -> bool {
        let (_, header) = decode_packet(packet).unwrap();
        let payload = &packet[header.payload_start..][..header.payload_length as usize];
        stream.core().lock().assembler.add_packet(&header, payload)
    }

    fn complete_heap(cnt: u64) -> Vec<u8> {
        PacketBuilder::new(cnt).heap_length(8).payload(0, &[cnt as u8; 8]).build()
    }

    async fn wait_until_unpaused(stream: &Stream) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while stream.is_paused() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("stream should resume");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_ring_pauses_and_pop_resumes() {
        let rs = ring_stream(1, true);

        assert!(feed(rs.stream(), &complete_heap(5)));
        assert!(!rs.stream().is_paused());

        assert!(feed(rs.stream(), &complete_heap(6)));
        assert!(rs.stream().is_paused());

        assert_eq!(rs.pop().await.unwrap().cnt(), 5);
        wait_until_unpaused(rs.stream()).await;

        assert_eq!(rs.pop().await.unwrap().cnt(), 6);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_network_stop_stops_ring_after_drain() {
        let rs = ring_stream(4, true);

        assert!(feed(rs.stream(), &complete_heap(1)));
        assert!(feed(rs.stream(), &PacketBuilder::stream_stop(2).build()));
        assert!(rs.stream().is_stopped());

        assert_eq!(rs.pop().await.unwrap().cnt(), 1);
        assert_eq!(rs.pop().await.unwrap_err(), RingError::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_network_stop_while_paused_delivers_parked_heaps() {
        let rs = ring_stream(1, true);

        assert!(feed(rs.stream(), &complete_heap(1)));
        assert!(feed(rs.stream(), &complete_heap(2)));
        assert!(rs.stream().is_paused());

        assert!(feed(rs.stream(), &PacketBuilder::stream_stop(3).build()));

        assert_eq!(rs.pop().await.unwrap().cnt(), 1);
        assert_eq!(rs.pop().await.unwrap().cnt(), 2);
        assert_eq!(rs.pop().await.unwrap_err(), RingError::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_user_stop_discards_and_wakes_consumers() {
        let rs = ring_stream(1, true);

        assert!(feed(rs.stream(), &complete_heap(1)));
        assert!(feed(rs.stream(), &complete_heap(2)));
        assert!(rs.stream().is_paused());

        rs.stop().await;
        // the queued heap drains; the heap parked on the resume queue is gone
        assert_eq!(rs.pop().await.unwrap().cnt(), 1);
        assert_eq!(rs.pop().await.unwrap_err(), RingError::Stopped);
        assert_eq!(rs.try_pop().unwrap_err(), RingError::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_incomplete_heaps_are_dropped_at_the_ring() {
        let rs = ring_stream(4, true);

        // half a heap, then enough new heaps to evict it
        let partial = PacketBuilder::new(1).heap_length(64).payload(0, &[0u8; 32]).build();
        assert!(feed(rs.stream(), &partial));
        for cnt in 2..=6u64 {
            assert!(feed(rs.stream(), &complete_heap(cnt)));
        }

        assert_eq!(rs.try_pop().unwrap().cnt(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pop_discards_incomplete_heaps_when_queued() {
        let rs = ring_stream(4, false);

        let partial = PacketBuilder::new(1).heap_length(64).payload(0, &[0u8; 32]).build();
        assert!(feed(rs.stream(), &partial));
        for cnt in 2..=6u64 {
            assert!(feed(rs.stream(), &complete_heap(cnt)));
        }

        // the evicted incomplete heap 1 is in the ring but pop skips it
        assert_eq!(rs.pop().await.unwrap().cnt(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_try_pop_empty() {
        let rs = ring_stream(1, true);
        assert_eq!(rs.try_pop().unwrap_err(), RingError::Empty);
    }
}

use crate::config::StreamConfig;
use crate::live_heap::LiveHeap;
use crate::memory_pool::MemoryAllocator;
use crate::packet::{decode_packet, PacketHeader};
use crate::reader::{Reader, StreamState};
use anyhow::bail;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// What a [`HeapConsumer`] did with a heap it was offered.
pub enum ConsumeOutcome {
    /// The heap was consumed or deliberately dropped.
    Consumed,
    /// The consumer is not ready; the heap is handed back and the stream
    ///  pauses until [`StreamShared::resume_and_notify`] is driven by the
    ///  consumer becoming ready again.
    NotReady(LiveHeap),
}

/// Downstream sink for heaps leaving the assembler, called with the stream
///  mutex held. `heap_ready` must therefore never block; a consumer that is
///  momentarily full returns [`ConsumeOutcome::NotReady`] and must arrange
///  for the stream to be resumed later, or the stream deadlocks.
pub trait HeapConsumer: Send + Sync + 'static {
    fn heap_ready(&self, heap: LiveHeap) -> ConsumeOutcome;

    /// The stream has stopped and flushed its live heaps. `still_paused`
    ///  tells the consumer whether flushed heaps are still waiting on the
    ///  resume queue.
    fn on_stop(&self, _still_paused: bool) {}
}

/// Consumer that drops every heap. Useful as a sink when only the assembly
///  side effects are of interest.
pub struct DiscardConsumer;

impl HeapConsumer for DiscardConsumer {
    fn heap_ready(&self, heap: LiveHeap) -> ConsumeOutcome {
        trace!("discarding heap {:?}", heap);
        ConsumeOutcome::Consumed
    }
}

/// Marks an unoccupied slot in the heap cnt array.
const HOLE: i64 = -1;

/// Reassembles a stream of packets into heaps under a bounded number of
///  live-heap slots.
///
/// Live heaps are stored in a circular array with a parallel array of heap
///  cnts (scanning the cnts touches fewer cache lines than chasing the heaps
///  themselves). Removing a heap leaves a hole rather than shifting the
///  array, so only a head index is needed; adding a new heap evicts whatever
///  occupies the slot after the head, which ages out the longest-lived heap
///  even when holes would still have room.
pub struct StreamAssembler {
    slots: Vec<Option<LiveHeap>>,
    heap_cnts: Vec<i64>,
    /// Slot of the most recently inserted heap.
    head: usize,
    /// Heaps that could not be pushed downstream. During regular operation
    ///  this holds at most two entries (a packet can evict an old heap and
    ///  complete its own); a flush while the consumer is not ready can add
    ///  more. The stream is paused iff this queue is non-empty.
    resume_heaps: VecDeque<LiveHeap>,
    stopped: bool,
    consumer: Arc<dyn HeapConsumer>,
    allocator: Arc<dyn MemoryAllocator>,
}

impl StreamAssembler {
    pub fn new(config: &StreamConfig, consumer: Arc<dyn HeapConsumer>) -> StreamAssembler {
        StreamAssembler {
            slots: (0..config.max_heaps).map(|_| None).collect(),
            heap_cnts: vec![HOLE; config.max_heaps],
            head: 0,
            resume_heaps: VecDeque::new(),
            stopped: false,
            consumer,
            allocator: config.memory_allocator.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_paused(&self) -> bool {
        !self.resume_heaps.is_empty()
    }

    /// Feed one decoded packet into the stream. Returns whether the packet
    ///  was accepted; packets arriving after the stream stopped and
    ///  duplicates are rejected.
    pub fn add_packet(&mut self, header: &PacketHeader, payload: &[u8]) -> bool {
        if self.stopped {
            trace!("dropping packet for heap {} received after stream stop", header.heap_cnt);
            return false;
        }

        // A packet whose only cargo is the stream-stop control stops the
        //  stream without creating a live heap for it.
        if header.is_stream_stop && header.payload_length == 0 && header.items.is_empty() {
            debug!("stream control stop received");
            self.stop_received();
            return true;
        }

        let cnt = header.heap_cnt as i64;
        let slot = match self.heap_cnts.iter().position(|&c| c == cnt) {
            Some(slot) => slot,
            None => {
                let pos = (self.head + 1) % self.slots.len();
                if self.heap_cnts[pos] != HOLE {
                    let victim = self.slots[pos].take().expect("occupied slot holds a heap");
                    self.heap_cnts[pos] = HOLE;
                    debug!("evicting heap {:?} to make room for heap {}", victim, header.heap_cnt);
                    self.emit(victim);
                }
                self.slots[pos] = Some(LiveHeap::new(header, &self.allocator));
                self.heap_cnts[pos] = cnt;
                self.head = pos;
                pos
            }
        };

        let heap = self.slots[slot].as_mut().expect("slot with matching cnt holds a heap");
        let added = heap.add_packet(header, payload);
        if added && heap.is_ready() {
            let heap = self.slots[slot].take().expect("slot with matching cnt holds a heap");
            self.heap_cnts[slot] = HOLE;
            self.emit(heap);
        }
        if added && header.is_stream_stop {
            debug!("stream control stop received");
            self.stop_received();
        }
        added
    }

    /// Emit every occupied slot downstream, oldest first. The stream counts
    ///  as stopped afterwards.
    pub fn flush(&mut self) {
        let n = self.slots.len();
        for k in 1..=n {
            let slot = (self.head + k) % n;
            if self.heap_cnts[slot] != HOLE {
                let heap = self.slots[slot].take().expect("occupied slot holds a heap");
                self.heap_cnts[slot] = HOLE;
                self.emit(heap);
            }
        }
        self.stopped = true;
    }

    /// Shut the stream down: flush the live heaps and tell the consumer.
    pub(crate) fn stop_received(&mut self) {
        self.flush();
        self.consumer.on_stop(self.is_paused());
    }

    /// Re-offer queued heaps to the consumer, oldest first, stopping at the
    ///  first one it again refuses. Returns whether the stream is unpaused
    ///  afterwards. Must be called under the stream mutex.
    pub fn resume(&mut self) -> bool {
        while let Some(heap) = self.resume_heaps.pop_front() {
            match self.consumer.heap_ready(heap) {
                ConsumeOutcome::Consumed => {}
                ConsumeOutcome::NotReady(heap) => {
                    self.resume_heaps.push_front(heap);
                    break;
                }
            }
        }
        !self.is_paused()
    }

    /// Throw away the resume queue. This intentionally does not resume; it
    ///  exists for stopping the stream from the application side.
    pub(crate) fn discard_resume(&mut self) {
        if !self.resume_heaps.is_empty() {
            debug!("discarding {} undelivered heaps", self.resume_heaps.len());
            self.resume_heaps.clear();
        }
    }

    fn emit(&mut self, heap: LiveHeap) {
        if self.is_paused() {
            trace!("stream is paused - queueing heap {:?} behind the resume queue", heap);
            self.resume_heaps.push_back(heap);
            return;
        }
        match self.consumer.heap_ready(heap) {
            ConsumeOutcome::Consumed => {}
            ConsumeOutcome::NotReady(heap) => {
                debug!("downstream is not ready for heap {:?} - pausing the stream", heap);
                self.resume_heaps.push_back(heap);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn occupied_cnts(&self) -> Vec<u64> {
        self.heap_cnts.iter().filter(|&&c| c != HOLE).map(|&c| c as u64).collect()
    }
}

/// Push packets found in a block of memory into the assembler. Returns the
///  number of bytes consumed. Processing stops at the first undecodable
///  packet, because there is no way to find the next packet after a corrupt
///  one. The stream is not stopped.
pub fn mem_to_stream(assembler: &mut StreamAssembler, data: &[u8]) -> usize {
    let mut pos = 0;
    while pos < data.len() {
        match decode_packet(&data[pos..]) {
            Ok((consumed, header)) => {
                let payload = &data[pos + header.payload_start..][..header.payload_length as usize];
                assembler.add_packet(&header, payload);
                pos += consumed;
            }
            Err(e) => {
                debug!("stopping in-memory packet walk: {}", e);
                break;
            }
        }
    }
    pos
}

pub(crate) struct StreamShared {
    pub(crate) assembler: StreamAssembler,
    readers: Vec<Arc<dyn Reader>>,
}

impl StreamShared {
    pub(crate) fn state(&self) -> StreamState {
        StreamState {
            stopped: self.assembler.is_stopped(),
            paused: self.assembler.is_paused(),
        }
    }

    /// Resume the assembler and, if the pause lifted, notify every reader so
    ///  it re-arms its receive path. Readers re-enter their capture loops
    ///  only through this notification, never by polling.
    pub(crate) fn resume_and_notify(&mut self) -> bool {
        let unpaused = self.assembler.resume();
        if unpaused {
            let state = self.state();
            for reader in &self.readers {
                reader.state_change(state);
            }
        }
        unpaused
    }
}

/// The stream mutex and everything it protects. Readers hold a weak
///  reference; the [`Stream`] owns the strong one.
pub(crate) struct StreamCore {
    shared: Mutex<StreamShared>,
}

impl StreamCore {
    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamShared> {
        self.shared.lock().unwrap()
    }
}

/// A thread-safe stream fed by readers. All access to the assembler and the
///  reader list is serialised by one mutex; that mutex is the only lock held
///  across `heap_ready`, which is why consumers must not block.
pub struct Stream {
    core: Arc<StreamCore>,
}

impl Stream {
    pub fn new(config: StreamConfig, consumer: Arc<dyn HeapConsumer>) -> anyhow::Result<Stream> {
        config.validate()?;
        let assembler = StreamAssembler::new(&config, consumer);
        Ok(Stream {
            core: Arc::new(StreamCore {
                shared: Mutex::new(StreamShared {
                    assembler,
                    readers: Vec::new(),
                }),
            }),
        })
    }

    pub(crate) fn core(&self) -> &Arc<StreamCore> {
        &self.core
    }

    pub fn is_stopped(&self) -> bool {
        self.core.lock().assembler.is_stopped()
    }

    pub fn is_paused(&self) -> bool {
        self.core.lock().assembler.is_paused()
    }

    /// Register a reader and run its second-phase initialisation. The reader
    ///  is started under the stream lock; its start future is awaited after
    ///  the lock has been dropped.
    pub async fn attach_reader(&self, reader: Arc<dyn Reader>) -> anyhow::Result<()> {
        let start_rx = {
            let mut shared = self.core.lock();
            if shared.assembler.is_stopped() {
                bail!("cannot attach a reader to a stopped stream");
            }
            shared.readers.push(reader.clone());
            reader.start()
        };
        if let Some(rx) = start_rx {
            match rx.await {
                Ok(result) => result?,
                Err(_) => bail!("reader start was abandoned"),
            }
        }
        Ok(())
    }

    /// Stop the stream and block until all readers have wound up. After this
    ///  returns there are no more outstanding reader completion handlers.
    ///  Calling it a second time is a no-op.
    pub async fn stop(&self) {
        let readers = {
            let mut shared = self.core.lock();
            shared.assembler.discard_resume();
            if !shared.assembler.is_stopped() {
                shared.assembler.stop_received();
            }
            let state = shared.state();
            for reader in &shared.readers {
                reader.state_change(state);
            }
            std::mem::take(&mut shared.readers)
        };
        for reader in readers {
            reader.join().await;
        }
    }
}

use crate::memory_pool::MemoryAllocator;
use crate::packet::{ItemPointer, PacketHeader};
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Reassembly state for a single heap while its packets are still arriving.
///
/// Payload is written at the offsets named in the packets, so the arrival
///  order of packets within a heap does not affect the final contents. The
///  set of received payload extents is tracked separately from the buffer so
///  that duplicates can be ignored and gaps detected.
pub struct LiveHeap {
    cnt: u64,
    /// Total payload length declared by the sender, once seen. The first
    ///  declaration wins; later disagreeing declarations are logged.
    heap_length: Option<u64>,
    received_length: u64,
    /// Non-overlapping received extents, `start -> end` (exclusive), merged
    ///  on insert. Abutting extents are coalesced, so a contiguous heap has
    ///  exactly one entry.
    extents: BTreeMap<u64, u64>,
    payload: BytesMut,
    items: Vec<ItemPointer>,
    saw_end_marker: bool,
}

impl LiveHeap {
    pub(crate) fn new(header: &PacketHeader, allocator: &Arc<dyn MemoryAllocator>) -> LiveHeap {
        let mut payload = allocator.allocate(header.heap_length.unwrap_or(0) as usize);
        if let Some(length) = header.heap_length {
            payload.resize(length as usize, 0);
        }
        LiveHeap {
            cnt: header.heap_cnt,
            heap_length: header.heap_length,
            received_length: 0,
            extents: BTreeMap::new(),
            payload,
            items: Vec::new(),
            saw_end_marker: false,
        }
    }

    /// Merge one packet into the heap. Returns `false` if the packet was a
    ///  duplicate or otherwise not usable; the heap is unchanged in that case.
    pub(crate) fn add_packet(&mut self, header: &PacketHeader, payload: &[u8]) -> bool {
        debug_assert_eq!(header.heap_cnt, self.cnt);
        debug_assert_eq!(header.payload_length as usize, payload.len());

        if self.heap_length.is_none() {
            if let Some(length) = header.heap_length {
                self.heap_length = Some(length);
                self.payload.resize(length as usize, 0);
            }
        }
        else if header.heap_length.is_some() && header.heap_length != self.heap_length {
            warn!(
                "heap {}: packet declares heap length {:?} but {:?} was declared before - keeping the first",
                self.cnt, header.heap_length, self.heap_length
            );
        }

        if !payload.is_empty() {
            let start = header.payload_offset;
            let end = start + payload.len() as u64;

            if let Some(declared) = self.heap_length {
                if end > declared {
                    warn!(
                        "heap {}: payload extent {}..{} exceeds declared length {} - dropping packet",
                        self.cnt, start, end, declared
                    );
                    return false;
                }
            }
            if self.is_covered(start, end) {
                trace!("heap {}: duplicate payload extent {}..{} - ignoring", self.cnt, start, end);
                return false;
            }

            if (self.payload.len() as u64) < end {
                self.payload.resize(end as usize, 0);
            }
            if self.copy_uncovered(start, payload) {
                debug!(
                    "heap {}: extent {}..{} overlaps previously received payload - first write wins",
                    self.cnt, start, end
                );
            }
            self.received_length += self.insert_extent(start, end);
        }

        self.items.extend_from_slice(&header.items);
        if header.is_stream_stop {
            self.saw_end_marker = true;
        }
        true
    }

    pub fn cnt(&self) -> u64 {
        self.cnt
    }

    pub fn heap_length(&self) -> Option<u64> {
        self.heap_length
    }

    pub fn received_length(&self) -> u64 {
        self.received_length
    }

    /// All declared payload is present. For a heap without a declared length
    ///  this can only become true once the end-of-heap marker has been seen
    ///  and the received payload forms a single gap-free run from offset 0.
    pub fn is_contiguous(&self) -> bool {
        match self.heap_length {
            Some(length) => self.received_length == length,
            None => {
                self.saw_end_marker
                    && match self.extents.first_key_value() {
                        None => true,
                        Some((&start, &end)) => {
                            start == 0 && end == self.received_length && self.extents.len() == 1
                        }
                    }
            }
        }
    }

    /// The heap can be taken out of the live list: either it is contiguous or
    ///  one of its packets carried the stop marker.
    pub(crate) fn is_ready(&self) -> bool {
        self.is_contiguous() || self.saw_end_marker
    }

    pub(crate) fn into_parts(self) -> (u64, bool, BytesMut, Vec<ItemPointer>) {
        let contiguous = self.is_contiguous();
        (self.cnt, contiguous, self.payload, self.items)
    }

    /// True iff `start..end` is entirely inside one already-received extent.
    fn is_covered(&self, start: u64, end: u64) -> bool {
        match self.extents.range(..=start).next_back() {
            Some((_, &e)) => e >= end,
            None => false,
        }
    }

    /// Copy the parts of `data` that fall into gaps, leaving already-received
    ///  bytes untouched. Returns whether any overlap was skipped.
    fn copy_uncovered(&mut self, offset: u64, data: &[u8]) -> bool {
        let end = offset + data.len() as u64;
        let mut overlap = false;
        let mut cursor = offset;

        let covered: Vec<(u64, u64)> = self
            .extents
            .range(..end)
            .map(|(&s, &e)| (s.max(offset), e.min(end)))
            .filter(|&(s, e)| s < e)
            .collect();

        for (s, e) in covered {
            overlap = true;
            if cursor < s {
                let from = (cursor - offset) as usize;
                let to = (s - offset) as usize;
                self.payload[cursor as usize..s as usize].copy_from_slice(&data[from..to]);
            }
            cursor = e;
        }
        if cursor < end {
            let from = (cursor - offset) as usize;
            self.payload[cursor as usize..end as usize].copy_from_slice(&data[from..]);
        }
        overlap
    }

    /// Merge `start..end` into the extent set, coalescing overlapping and
    ///  abutting neighbours. Returns the number of newly covered bytes.
    fn insert_extent(&mut self, mut start: u64, mut end: u64) -> u64 {
        let mut new_bytes = end - start;

        let absorbed: Vec<(u64, u64)> = self
            .extents
            .range(..=end)
            .map(|(&s, &e)| (s, e))
            .filter(|&(_, e)| e >= start)
            .collect();

        for (s, e) in absorbed {
            let overlap_start = s.max(start);
            let overlap_end = e.min(end);
            if overlap_end > overlap_start {
                new_bytes -= overlap_end - overlap_start;
            }
            start = start.min(s);
            end = end.max(e);
            self.extents.remove(&s);
        }
        self.extents.insert(start, end);
        new_bytes
    }

    #[cfg(test)]
    pub(crate) fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl std::fmt::Debug for LiveHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HEAP{{#{}:{}/{} bytes}}",
            self.cnt,
            self.received_length,
            self.heap_length.map(|l| l.to_string()).unwrap_or("?".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_pool::DefaultAllocator;
    use crate::packet::decode_packet;
    use crate::test_util::PacketBuilder;
    use rstest::rstest;

    fn allocator() -> Arc<dyn MemoryAllocator> {
        Arc::new(DefaultAllocator)
    }

    fn add(heap: &mut LiveHeap, packet: &[u8]) -> bool {
        let (_, header) = decode_packet(packet).unwrap();
        let payload = &packet[header.payload_start..][..header.payload_length as usize];
        heap.add_packet(&header, payload)
    }

    fn new_heap(packet: &[u8]) -> LiveHeap {
        let (_, header) = decode_packet(packet).unwrap();
        LiveHeap::new(&header, &allocator())
    }

    #[test]
    fn test_two_packet_reassembly() {
        let first = PacketBuilder::new(10).heap_length(8).payload(0, &[1, 2, 3, 4]).build();
        let second = PacketBuilder::new(10).heap_length(8).payload(4, &[5, 6, 7, 8]).build();

        let mut heap = new_heap(&first);
        assert!(add(&mut heap, &first));
        assert!(!heap.is_contiguous());
        assert_eq!(heap.received_length(), 4);

        assert!(add(&mut heap, &second));
        assert!(heap.is_contiguous());
        assert_eq!(heap.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[rstest]
    #[case::in_order(&[0, 4])]
    #[case::reversed(&[4, 0])]
    fn test_arrival_order_does_not_matter(#[case] offsets: &[u64]) {
        let mut heap = new_heap(
            &PacketBuilder::new(1).heap_length(8).payload(offsets[0], &[0; 4]).build(),
        );
        for &offset in offsets {
            let value = (offset + 1) as u8;
            let packet = PacketBuilder::new(1)
                .heap_length(8)
                .payload(offset, &[value; 4])
                .build();
            assert!(add(&mut heap, &packet));
        }
        assert!(heap.is_contiguous());
        assert_eq!(heap.payload(), &[1, 1, 1, 1, 5, 5, 5, 5]);
    }

    #[test]
    fn test_duplicate_extent_is_ignored() {
        let packet = PacketBuilder::new(2).heap_length(8).payload(0, &[1; 4]).build();
        let mut heap = new_heap(&packet);
        assert!(add(&mut heap, &packet));
        assert!(!add(&mut heap, &packet));
        assert_eq!(heap.received_length(), 4);
    }

    #[test]
    fn test_conflicting_overlap_first_write_wins() {
        let first = PacketBuilder::new(3).heap_length(8).payload(0, &[1; 6]).build();
        let second = PacketBuilder::new(3).heap_length(8).payload(4, &[2; 4]).build();

        let mut heap = new_heap(&first);
        assert!(add(&mut heap, &first));
        assert!(add(&mut heap, &second));

        assert!(heap.is_contiguous());
        assert_eq!(heap.payload(), &[1, 1, 1, 1, 1, 1, 2, 2]);
    }

    #[test]
    fn test_extent_beyond_declared_length_is_dropped() {
        let first = PacketBuilder::new(4).heap_length(4).payload(0, &[1; 4]).build();
        let bad = PacketBuilder::new(4).heap_length(4).payload(4, &[2; 4]).build();

        let mut heap = new_heap(&first);
        assert!(add(&mut heap, &first));
        assert!(!add(&mut heap, &bad));
        assert_eq!(heap.received_length(), 4);
    }

    #[test]
    fn test_unknown_length_completes_on_end_marker() {
        let data = PacketBuilder::new(5).payload(0, &[9; 16]).build();
        let mut heap = new_heap(&data);
        assert!(add(&mut heap, &data));
        assert!(!heap.is_contiguous());
        assert!(!heap.is_ready());

        let fin = PacketBuilder::new(5).payload(16, &[9; 16]).with_stream_stop().build();
        assert!(add(&mut heap, &fin));
        assert!(heap.is_ready());
        assert!(heap.is_contiguous());
        assert_eq!(heap.received_length(), 32);
    }

    #[test]
    fn test_unknown_length_with_gap_is_not_contiguous_at_marker() {
        let data = PacketBuilder::new(6).payload(8, &[1; 8]).with_stream_stop().build();
        let mut heap = new_heap(&data);
        assert!(add(&mut heap, &data));
        assert!(heap.is_ready());
        assert!(!heap.is_contiguous());
    }

    #[test]
    fn test_items_are_buffered() {
        let packet = PacketBuilder::new(7)
            .heap_length(4)
            .item(ItemPointer::immediate(0x1000, 77))
            .payload(0, &[0; 4])
            .build();
        let mut heap = new_heap(&packet);
        assert!(add(&mut heap, &packet));

        let (cnt, contiguous, _, items) = heap.into_parts();
        assert_eq!(cnt, 7);
        assert!(contiguous);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value(), 77);
    }
}

use crate::live_heap::LiveHeap;
use crate::packet::ItemPointer;
use bytes::Bytes;

/// An immutable heap, frozen out of a [`LiveHeap`] once no more packets will
///  be merged into it. Item decoding is the consumer's concern; the heap
///  hands out the payload and the raw item pointers in wire order.
pub struct Heap {
    cnt: u64,
    contiguous: bool,
    payload: Bytes,
    items: Vec<ItemPointer>,
}

impl From<LiveHeap> for Heap {
    fn from(live: LiveHeap) -> Heap {
        let (cnt, contiguous, payload, items) = live.into_parts();
        Heap {
            cnt,
            contiguous,
            payload: payload.freeze(),
            items,
        }
    }
}

impl Heap {
    pub fn cnt(&self) -> u64 {
        self.cnt
    }

    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn items(&self) -> &[ItemPointer] {
        &self.items
    }

    /// The payload slice an addressed item pointer refers to, running up to
    ///  the next addressed item (or the end of the payload), which is how
    ///  SPEAD delimits item values.
    pub fn item_payload(&self, item: ItemPointer) -> Option<&[u8]> {
        if item.is_immediate() {
            return None;
        }
        let start = item.value();
        let end = self
            .items
            .iter()
            .filter(|i| !i.is_immediate())
            .map(|i| i.value())
            .filter(|&addr| addr > start)
            .min()
            .unwrap_or(self.payload.len() as u64);
        self.payload.get(start as usize..end as usize)
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FROZEN{{#{}:{} bytes, {} items}}", self.cnt, self.payload.len(), self.items.len())
    }
}

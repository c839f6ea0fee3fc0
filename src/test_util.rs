//! Helpers for building SPEAD packets in tests. Mirrors what a compliant
//!  sender puts on the wire so receive tests can run against real octet runs
//!  rather than hand-assembled buffers.

use crate::packet::{
    ItemPointer, CTRL_STREAM_STOP, HEAP_CNT_ID, HEAP_LENGTH_ID, PAYLOAD_LENGTH_ID,
    PAYLOAD_OFFSET_ID, STREAM_CTRL_ID,
};
use bytes::{BufMut, BytesMut};

pub struct PacketBuilder {
    heap_cnt: u64,
    heap_length: Option<u64>,
    payload_offset: u64,
    payload: Vec<u8>,
    extra_items: Vec<ItemPointer>,
    stream_stop: bool,
}

impl PacketBuilder {
    pub fn new(heap_cnt: u64) -> PacketBuilder {
        PacketBuilder {
            heap_cnt,
            heap_length: None,
            payload_offset: 0,
            payload: Vec::new(),
            extra_items: Vec::new(),
            stream_stop: false,
        }
    }

    /// A packet carrying nothing but the stream-stop control item.
    pub fn stream_stop(heap_cnt: u64) -> PacketBuilder {
        let mut builder = PacketBuilder::new(heap_cnt);
        builder.stream_stop = true;
        builder
    }

    pub fn heap_length(mut self, length: u64) -> PacketBuilder {
        self.heap_length = Some(length);
        self
    }

    pub fn payload(mut self, offset: u64, data: &[u8]) -> PacketBuilder {
        self.payload_offset = offset;
        self.payload = data.to_vec();
        self
    }

    pub fn item(mut self, pointer: ItemPointer) -> PacketBuilder {
        self.extra_items.push(pointer);
        self
    }

    pub fn with_stream_stop(mut self) -> PacketBuilder {
        self.stream_stop = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut items = vec![
            ItemPointer::immediate(HEAP_CNT_ID, self.heap_cnt),
            ItemPointer::immediate(PAYLOAD_OFFSET_ID, self.payload_offset),
            ItemPointer::immediate(PAYLOAD_LENGTH_ID, self.payload.len() as u64),
        ];
        if let Some(length) = self.heap_length {
            items.push(ItemPointer::immediate(HEAP_LENGTH_ID, length));
        }
        if self.stream_stop {
            items.push(ItemPointer::immediate(STREAM_CTRL_ID, CTRL_STREAM_STOP));
        }
        items.extend(self.extra_items);

        let mut buf = BytesMut::with_capacity(8 + 8 * items.len() + self.payload.len());
        buf.put_u8(0x53);
        buf.put_u8(0x4);
        buf.put_u8(2);
        buf.put_u8(6);
        buf.put_u16(0);
        buf.put_u16(items.len() as u16);
        for item in items {
            buf.put_u64(item.to_raw());
        }
        buf.put_slice(&self.payload);
        buf.to_vec()
    }
}

/// Serialise a complete heap as `chunks`-many packets of equal payload share,
///  in offset order. The payload length must divide evenly.
pub fn heap_packets(heap_cnt: u64, payload: &[u8], chunks: usize) -> Vec<Vec<u8>> {
    assert_eq!(payload.len() % chunks, 0);
    let chunk_len = payload.len() / chunks;
    (0..chunks)
        .map(|i| {
            PacketBuilder::new(heap_cnt)
                .heap_length(payload.len() as u64)
                .payload((i * chunk_len) as u64, &payload[i * chunk_len..(i + 1) * chunk_len])
                .build()
        })
        .collect()
}

use bytes::Buf;
use thiserror::Error;

/// Item identifiers defined by the SPEAD protocol. Items below `0x10` are
///  bookkeeping items consumed by the receive core itself; everything else is
///  application data and is buffered on the live heap for downstream decoding.
pub const HEAP_CNT_ID: u16 = 0x01;
pub const HEAP_LENGTH_ID: u16 = 0x02;
pub const PAYLOAD_OFFSET_ID: u16 = 0x03;
pub const PAYLOAD_LENGTH_ID: u16 = 0x04;
pub const DESCRIPTOR_ID: u16 = 0x05;
pub const STREAM_CTRL_ID: u16 = 0x06;

/// Immediate value of a `STREAM_CTRL_ID` item that terminates the stream.
pub const CTRL_STREAM_STOP: u64 = 2;

/// Number of bits used for heap addresses (the SPEAD-64-48 flavour). The
///  remaining `64 - 1 - 48 = 15` bits of an item pointer hold the item id.
pub const HEAP_ADDRESS_BITS: u32 = 48;

const MAGIC: u8 = 0x53;
const VERSION: u8 = 0x4;
const ITEM_ID_WIDTH_BYTES: u8 = ((64 - HEAP_ADDRESS_BITS) / 8) as u8;
const HEAP_ADDRESS_WIDTH_BYTES: u8 = (HEAP_ADDRESS_BITS / 8) as u8;
const HEADER_LEN: usize = 8;
const ITEM_POINTER_LEN: usize = 8;

const ADDRESS_MASK: u64 = (1 << HEAP_ADDRESS_BITS) - 1;
const IMMEDIATE_FLAG: u64 = 1 << 63;

/// A single 64-bit SPEAD item pointer: one flag bit, a 15-bit item id and a
///  48-bit immediate value or payload address.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ItemPointer(u64);

impl ItemPointer {
    pub fn from_raw(raw: u64) -> ItemPointer {
        ItemPointer(raw)
    }

    pub fn immediate(id: u16, value: u64) -> ItemPointer {
        ItemPointer(IMMEDIATE_FLAG | ((id as u64) << HEAP_ADDRESS_BITS) | (value & ADDRESS_MASK))
    }

    pub fn addressed(id: u16, address: u64) -> ItemPointer {
        ItemPointer(((id as u64) << HEAP_ADDRESS_BITS) | (address & ADDRESS_MASK))
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn is_immediate(self) -> bool {
        self.0 & IMMEDIATE_FLAG != 0
    }

    pub fn id(self) -> u16 {
        ((self.0 & !IMMEDIATE_FLAG) >> HEAP_ADDRESS_BITS) as u16
    }

    /// The low 48 bits: an immediate value or a payload offset, depending on
    ///  the flag bit.
    pub fn value(self) -> u64 {
        self.0 & ADDRESS_MASK
    }
}

impl std::fmt::Debug for ItemPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_immediate() {
            write!(f, "ITEM{{#{:#x}={}}}", self.id(), self.value())
        }
        else {
            write!(f, "ITEM{{#{:#x}@{}}}", self.id(), self.value())
        }
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PacketError {
    #[error("packet is too short to hold a SPEAD header ({0} bytes)")]
    TooShort(usize),
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("unsupported flavour: item id width {id_width}, heap address width {addr_width}")]
    BadFlavour { id_width: u8, addr_width: u8 },
    #[error("packet truncated: declared {declared} bytes but only {actual} available")]
    Truncated { declared: usize, actual: usize },
    #[error("mandatory item {0} missing")]
    MissingItem(&'static str),
}

/// The decoded bookkeeping of a single SPEAD packet. Produced by
///  [`decode_packet`]; the payload itself stays in the caller's receive buffer
///  and is located via [`payload_start`](PacketHeader::payload_start).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub heap_cnt: u64,
    /// Declared total payload length of the heap, if the sender provided one.
    pub heap_length: Option<u64>,
    pub payload_offset: u64,
    pub payload_length: u64,
    /// Offset of the first payload byte within the decoded octet run.
    pub payload_start: usize,
    /// This packet carries the stream-stop control item.
    pub is_stream_stop: bool,
    /// Item pointers other than the bookkeeping items, in wire order. These
    ///  are buffered on the live heap for downstream item decoding.
    pub items: Vec<ItemPointer>,
}

/// Decode one SPEAD packet from the front of `data`.
///
/// On success returns the number of bytes the packet occupies together with
///  the header. A consumed length smaller than `data.len()` means trailing
///  bytes follow (the next packet, for in-memory sources; a framing error for
///  datagram sources).
pub fn decode_packet(data: &[u8]) -> Result<(usize, PacketHeader), PacketError> {
    if data.len() < HEADER_LEN {
        return Err(PacketError::TooShort(data.len()));
    }

    let mut buf = data;
    let magic = buf.get_u8();
    if magic != MAGIC {
        return Err(PacketError::BadMagic(magic));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(PacketError::BadVersion(version));
    }
    let id_width = buf.get_u8();
    let addr_width = buf.get_u8();
    if id_width != ITEM_ID_WIDTH_BYTES || addr_width != HEAP_ADDRESS_WIDTH_BYTES {
        return Err(PacketError::BadFlavour { id_width, addr_width });
    }
    let _reserved = buf.get_u16();
    let n_items = buf.get_u16() as usize;

    let pointers_len = n_items * ITEM_POINTER_LEN;
    if data.len() < HEADER_LEN + pointers_len {
        return Err(PacketError::Truncated {
            declared: HEADER_LEN + pointers_len,
            actual: data.len(),
        });
    }

    let mut heap_cnt = None;
    let mut heap_length = None;
    let mut payload_offset = None;
    let mut payload_length = None;
    let mut is_stream_stop = false;
    let mut items = Vec::new();

    for _ in 0..n_items {
        let pointer = ItemPointer::from_raw(buf.get_u64());
        match (pointer.id(), pointer.is_immediate()) {
            (HEAP_CNT_ID, true) => heap_cnt = Some(pointer.value()),
            (HEAP_LENGTH_ID, true) => heap_length = Some(pointer.value()),
            (PAYLOAD_OFFSET_ID, true) => payload_offset = Some(pointer.value()),
            (PAYLOAD_LENGTH_ID, true) => payload_length = Some(pointer.value()),
            (STREAM_CTRL_ID, true) => {
                if pointer.value() == CTRL_STREAM_STOP {
                    is_stream_stop = true;
                }
            }
            _ => items.push(pointer),
        }
    }

    let heap_cnt = heap_cnt.ok_or(PacketError::MissingItem("heap cnt"))?;
    let payload_offset = payload_offset.ok_or(PacketError::MissingItem("payload offset"))?;
    let payload_length = payload_length.ok_or(PacketError::MissingItem("payload length"))?;

    let payload_start = HEADER_LEN + pointers_len;
    let total = payload_start + payload_length as usize;
    if data.len() < total {
        return Err(PacketError::Truncated {
            declared: total,
            actual: data.len(),
        });
    }

    Ok((
        total,
        PacketHeader {
            heap_cnt,
            heap_length,
            payload_offset,
            payload_length,
            payload_start,
            is_stream_stop,
            items,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::PacketBuilder;
    use rstest::rstest;

    #[test]
    fn test_decode_data_packet() {
        let data = PacketBuilder::new(10)
            .heap_length(2048)
            .payload(0, &[7u8; 1024])
            .build();

        let (consumed, header) = decode_packet(&data).unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(header.heap_cnt, 10);
        assert_eq!(header.heap_length, Some(2048));
        assert_eq!(header.payload_offset, 0);
        assert_eq!(header.payload_length, 1024);
        assert!(!header.is_stream_stop);
        assert_eq!(&data[header.payload_start..][..1024], &[7u8; 1024]);
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut data = PacketBuilder::new(1).heap_length(4).payload(0, &[1, 2, 3, 4]).build();
        let packet_len = data.len();
        data.extend_from_slice(&[0xaa; 17]);

        let (consumed, header) = decode_packet(&data).unwrap();
        assert_eq!(consumed, packet_len);
        assert_eq!(header.heap_cnt, 1);
    }

    #[test]
    fn test_decode_stream_stop() {
        let data = PacketBuilder::stream_stop(99).build();
        let (consumed, header) = decode_packet(&data).unwrap();
        assert_eq!(consumed, data.len());
        assert!(header.is_stream_stop);
        assert_eq!(header.payload_length, 0);
    }

    #[test]
    fn test_non_bookkeeping_items_are_buffered() {
        let data = PacketBuilder::new(3)
            .heap_length(8)
            .item(ItemPointer::immediate(0x1234, 42))
            .item(ItemPointer::addressed(0x1235, 0))
            .payload(0, &[0u8; 8])
            .build();

        let (_, header) = decode_packet(&data).unwrap();
        assert_eq!(header.items.len(), 2);
        assert_eq!(header.items[0].id(), 0x1234);
        assert!(header.items[0].is_immediate());
        assert_eq!(header.items[0].value(), 42);
        assert_eq!(header.items[1].id(), 0x1235);
        assert!(!header.items[1].is_immediate());
    }

    #[rstest]
    #[case::empty(vec![], PacketError::TooShort(0))]
    #[case::short(vec![0x53, 0x4, 2], PacketError::TooShort(3))]
    #[case::bad_magic(vec![0x54, 0x4, 2, 6, 0, 0, 0, 0], PacketError::BadMagic(0x54))]
    #[case::bad_version(vec![0x53, 0x3, 2, 6, 0, 0, 0, 0], PacketError::BadVersion(0x3))]
    #[case::bad_flavour(vec![0x53, 0x4, 1, 7, 0, 0, 0, 0], PacketError::BadFlavour { id_width: 1, addr_width: 7 })]
    #[case::pointer_overrun(vec![0x53, 0x4, 2, 6, 0, 0, 0, 2], PacketError::Truncated { declared: 24, actual: 8 })]
    fn test_decode_errors(#[case] data: Vec<u8>, #[case] expected: PacketError) {
        assert_eq!(decode_packet(&data).unwrap_err(), expected);
    }

    #[test]
    fn test_missing_mandatory_item() {
        // only a heap cnt, no payload bookkeeping
        let mut data = vec![0x53, 0x4, 2, 6, 0, 0, 0, 1];
        data.extend_from_slice(&ItemPointer::immediate(HEAP_CNT_ID, 1).to_raw().to_be_bytes());
        assert_eq!(decode_packet(&data).unwrap_err(), PacketError::MissingItem("payload offset"));
    }

    #[test]
    fn test_payload_truncated() {
        let mut data = PacketBuilder::new(1).heap_length(100).payload(0, &[0u8; 100]).build();
        data.truncate(data.len() - 1);
        assert!(matches!(decode_packet(&data).unwrap_err(), PacketError::Truncated { .. }));
    }

    #[rstest]
    #[case::immediate(ItemPointer::immediate(0x7fff, 0xffff_ffff_ffff))]
    #[case::addressed(ItemPointer::addressed(0x7fff, 0xffff_ffff_ffff))]
    #[case::zero(ItemPointer::immediate(0, 0))]
    fn test_item_pointer_round_trip(#[case] pointer: ItemPointer) {
        let restored = ItemPointer::from_raw(pointer.to_raw());
        assert_eq!(restored, pointer);
        assert_eq!(restored.is_immediate(), pointer.is_immediate());
        assert_eq!(restored.id(), pointer.id());
        assert_eq!(restored.value(), pointer.value());
    }
}

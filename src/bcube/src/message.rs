//! Fragment wire format, shared by both transports:
//! `[msg_length:4][name_length:4][start_param_offset:4][name][payload]`,
//! little-endian, where `msg_length` counts the header too.

use std::io::{ErrorKind, Read};

use byteorder::{ByteOrder, LittleEndian};
use bytes::BufMut;
use thiserror::Error;

use crate::strategy::RoutingEntry;
use crate::tensor::{BlockLayout, TensorEntry, TensorError};

pub const HEADER_SIZE: usize = 3 * std::mem::size_of::<u32>();

static_assertions::const_assert_eq!(HEADER_SIZE, 12);

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Message of {0} bytes is shorter than the header")]
    Truncated(usize),
    #[error("Declared length {declared} does not match {actual} available bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("Name length {name_len} exceeds message length {msg_len}")]
    NameOverflow { name_len: usize, msg_len: usize },
    #[error("Message of {0} bytes exceeds the {1} byte limit")]
    TooLarge(usize, usize),
    #[error("Header field {field} = {value} does not fit in 32 bits")]
    FieldOverflow { field: &'static str, value: usize },
    #[error("Tensor name is not valid UTF-8")]
    InvalidName,
    #[error("Tensor: {0}")]
    Tensor(#[from] TensorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub msg_length: u32,
    pub name_length: u32,
    pub start_param: u32,
}

fn to_u32(field: &'static str, value: usize) -> Result<u32, MessageError> {
    u32::try_from(value).map_err(|_| MessageError::FieldOverflow { field, value })
}

impl FragmentHeader {
    pub fn new(name_len: usize, first_block: usize, payload_len: usize) -> Result<Self, MessageError> {
        let total = HEADER_SIZE
            .checked_add(name_len)
            .and_then(|n| n.checked_add(payload_len))
            .ok_or(MessageError::FieldOverflow {
                field: "msg_length",
                value: usize::MAX,
            })?;
        Ok(FragmentHeader {
            msg_length: to_u32("msg_length", total)?,
            name_length: to_u32("name_length", name_len)?,
            start_param: to_u32("start_param", first_block)?,
        })
    }

    pub fn read(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < HEADER_SIZE {
            return Err(MessageError::Truncated(buf.len()));
        }
        let header = FragmentHeader {
            msg_length: LittleEndian::read_u32(&buf[0..4]),
            name_length: LittleEndian::read_u32(&buf[4..8]),
            start_param: LittleEndian::read_u32(&buf[8..12]),
        };
        let msg_len = header.msg_length as usize;
        if msg_len < HEADER_SIZE {
            return Err(MessageError::Truncated(msg_len));
        }
        if header.name_length as usize > msg_len - HEADER_SIZE {
            return Err(MessageError::NameOverflow {
                name_len: header.name_length as usize,
                msg_len,
            });
        }
        Ok(header)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentMessage {
    pub name: String,
    pub first_block: usize,
    pub payload: Vec<u8>,
}

pub fn encode(name: &str, first_block: usize, payload: &[u8]) -> Result<Vec<u8>, MessageError> {
    let header = FragmentHeader::new(name.len(), first_block, payload.len())?;
    let mut buf = Vec::with_capacity(header.msg_length as usize);
    buf.put_u32_le(header.msg_length);
    buf.put_u32_le(header.name_length);
    buf.put_u32_le(header.start_param);
    buf.put_slice(name.as_bytes());
    buf.put_slice(payload);
    Ok(buf)
}

/// Encodes the blocks named by `entry` out of `tensor`.
pub fn encode_fragment(
    tensor: &TensorEntry,
    layout: &BlockLayout,
    entry: &RoutingEntry,
) -> Result<Vec<u8>, MessageError> {
    let range = layout.byte_range(entry.first_block, entry.block_count);
    layout.check(&range, tensor.len())?;
    encode(&tensor.name, entry.first_block, &tensor.data[range])
}

pub fn decode(buf: &[u8]) -> Result<FragmentMessage, MessageError> {
    let header = FragmentHeader::read(buf)?;
    let msg_len = header.msg_length as usize;
    if msg_len != buf.len() {
        return Err(MessageError::LengthMismatch {
            declared: msg_len,
            actual: buf.len(),
        });
    }
    let name_end = HEADER_SIZE + header.name_length as usize;
    let name = std::str::from_utf8(&buf[HEADER_SIZE..name_end])
        .map_err(|_| MessageError::InvalidName)?
        .to_string();
    Ok(FragmentMessage {
        name,
        first_block: header.start_param as usize,
        payload: buf[name_end..].to_vec(),
    })
}

/// Reads one whole message from a stream. Returns `None` on a clean end of
/// stream before any header byte.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, MessageError> {
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(MessageError::Truncated(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let parsed = FragmentHeader::read(&header)?;
    let msg_len = parsed.msg_length as usize;
    if msg_len > max_len {
        return Err(MessageError::TooLarge(msg_len, max_len));
    }
    let mut buf = vec![0u8; msg_len];
    buf[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut buf[HEADER_SIZE..])?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use super::*;
    use crate::tensor::DataType;

    #[test]
    fn round_trip_payload_sizes() {
        let block = 100;
        for size in [0, 1, block, 10 * block] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let buf = encode("grad1", 7, &payload).unwrap();
            assert_eq!(buf.len(), HEADER_SIZE + 5 + size);
            assert_eq!(LittleEndian::read_u32(&buf[0..4]) as usize, buf.len());
            let msg = decode(&buf).unwrap();
            assert_eq!(msg.name, "grad1");
            assert_eq!(msg.first_block, 7);
            assert_eq!(msg.payload, payload);
        }
    }

    #[test]
    fn rejects_malformed_headers() {
        let buf = encode("w", 0, &[1, 2, 3]).unwrap();
        assert!(matches!(decode(&buf[..8]), Err(MessageError::Truncated(8))));
        assert!(matches!(
            decode(&buf[..buf.len() - 1]),
            Err(MessageError::LengthMismatch { .. })
        ));

        let mut bad = buf.clone();
        LittleEndian::write_u32(&mut bad[4..8], 100);
        assert!(matches!(decode(&bad), Err(MessageError::NameOverflow { .. })));

        let mut bad = buf.clone();
        LittleEndian::write_u32(&mut bad[0..4], 4);
        assert!(matches!(decode(&bad), Err(MessageError::Truncated(4))));

        let mut bad = buf;
        bad[HEADER_SIZE] = 0xff;
        assert!(matches!(decode(&bad), Err(MessageError::InvalidName)));
    }

    #[test]
    fn frames_from_stream() {
        let mut stream = encode("a", 1, &[9; 10]).unwrap();
        stream.extend(encode("b", 2, &[]).unwrap());
        let mut cursor = Cursor::new(stream);
        let first = read_frame(&mut cursor, 1 << 10).unwrap().unwrap();
        assert_eq!(decode(&first).unwrap().name, "a");
        let second = read_frame(&mut cursor, 1 << 10).unwrap().unwrap();
        assert_eq!(decode(&second).unwrap().first_block, 2);
        assert!(read_frame(&mut cursor, 1 << 10).unwrap().is_none());

        let mut cursor = Cursor::new(encode("big", 0, &[0; 64]).unwrap());
        assert!(matches!(
            read_frame(&mut cursor, 32),
            Err(MessageError::TooLarge(79, 32))
        ));
    }

    #[test]
    fn header_fields_must_fit_u32() {
        let over = u32::MAX as usize + 1;
        assert!(matches!(
            encode("a", over, &[]),
            Err(MessageError::FieldOverflow { field: "start_param", .. })
        ));
        // the payload is not allocated, only its length is checked
        assert!(matches!(
            FragmentHeader::new(1, 0, u32::MAX as usize - HEADER_SIZE),
            Err(MessageError::FieldOverflow { field: "msg_length", .. })
        ));
        assert!(matches!(
            FragmentHeader::new(over, 0, 0),
            Err(MessageError::FieldOverflow { field: "msg_length", .. })
        ));
        let header = FragmentHeader::new(1, 3, u32::MAX as usize - HEADER_SIZE - 1).unwrap();
        assert_eq!(header.msg_length, u32::MAX);
    }

    #[test]
    fn fragment_uses_layout() {
        let data: Arc<[u8]> = (0..300u32).map(|i| i as u8).collect::<Vec<_>>().into();
        let tensor = TensorEntry::new("grad1", DataType::U8, data).unwrap();
        let layout = BlockLayout::for_tensor(&tensor, 3);
        let entry = RoutingEntry {
            node_id: 1,
            first_block: 1,
            block_count: 2,
        };
        let msg = decode(&encode_fragment(&tensor, &layout, &entry).unwrap()).unwrap();
        assert_eq!(msg.payload.len(), 200);
        assert_eq!(msg.payload[0], 100);
    }
}

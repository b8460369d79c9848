use byteorder::{ByteOrder, LittleEndian};

use super::provider::RemoteRegion;
use super::FabricError;

pub const CONTROL_SIZE: usize = 24;

const KIND_MEMORY_REGION: u32 = 1;
const KIND_READY: u32 = 2;
const KIND_DONE: u32 = 3;

/// Messages the receiving side of a connection sends back to the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    MemoryRegion(RemoteRegion),
    Ready,
    Done,
}

impl ControlMessage {
    pub fn encode(&self, buf: &mut [u8; CONTROL_SIZE]) {
        buf.fill(0);
        match self {
            ControlMessage::MemoryRegion(region) => {
                LittleEndian::write_u32(&mut buf[0..4], KIND_MEMORY_REGION);
                LittleEndian::write_u32(&mut buf[4..8], region.rkey);
                LittleEndian::write_u64(&mut buf[8..16], region.addr);
                LittleEndian::write_u64(&mut buf[16..24], region.len);
            }
            ControlMessage::Ready => LittleEndian::write_u32(&mut buf[0..4], KIND_READY),
            ControlMessage::Done => LittleEndian::write_u32(&mut buf[0..4], KIND_DONE),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FabricError> {
        if buf.len() < CONTROL_SIZE {
            return Err(FabricError::InvalidControl(buf.len() as u32));
        }
        match LittleEndian::read_u32(&buf[0..4]) {
            KIND_MEMORY_REGION => Ok(ControlMessage::MemoryRegion(RemoteRegion {
                rkey: LittleEndian::read_u32(&buf[4..8]),
                addr: LittleEndian::read_u64(&buf[8..16]),
                len: LittleEndian::read_u64(&buf[16..24]),
            })),
            KIND_READY => Ok(ControlMessage::Ready),
            KIND_DONE => Ok(ControlMessage::Done),
            kind => Err(FabricError::InvalidControl(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages() {
        let mut buf = [0u8; CONTROL_SIZE];
        let region = RemoteRegion {
            addr: 0xdead_0000,
            rkey: 7,
            len: 4096,
        };
        for msg in [
            ControlMessage::MemoryRegion(region),
            ControlMessage::Ready,
            ControlMessage::Done,
        ] {
            msg.encode(&mut buf);
            assert_eq!(ControlMessage::decode(&buf).unwrap(), msg);
        }
        LittleEndian::write_u32(&mut buf[0..4], 9);
        assert!(matches!(
            ControlMessage::decode(&buf),
            Err(FabricError::InvalidControl(9))
        ));
    }
}

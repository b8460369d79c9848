use super::control::{ControlMessage, CONTROL_SIZE};
use super::provider::{AccessFlags, FabricEndpoint, MemoryRegion};
use super::FabricError;

pub const WR_CONTROL_RECV: u64 = 1;
pub const WR_CONTROL_SEND: u64 = 2;
pub const WR_DATA_RECV: u64 = 3;
pub const WR_DATA_WRITE: u64 = 4;

/// Registered memory of one connection: the data buffer and a control
/// buffer whose first half receives and second half sends control messages.
/// Owned by exactly one connection; dropping it deregisters both regions.
pub struct ConnectionContext<E: FabricEndpoint> {
    pub peer: usize,
    pub data: E::Region,
    pub control: E::Region,
}

impl<E: FabricEndpoint> ConnectionContext<E> {
    /// Context of the writing side; the data buffer is the source of writes.
    pub fn for_writer(endpoint: &E, peer: usize, buffer_size: usize) -> Result<Self, FabricError> {
        Self::new(endpoint, peer, buffer_size, AccessFlags::LOCAL_WRITE)
    }

    /// Context of the receiving side; the peer writes into the data buffer.
    pub fn for_reader(endpoint: &E, peer: usize, buffer_size: usize) -> Result<Self, FabricError> {
        Self::new(
            endpoint,
            peer,
            buffer_size,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE,
        )
    }

    fn new(
        endpoint: &E,
        peer: usize,
        buffer_size: usize,
        data_access: AccessFlags,
    ) -> Result<Self, FabricError> {
        let data = endpoint.register(buffer_size, data_access)?;
        let control = endpoint.register(2 * CONTROL_SIZE, AccessFlags::LOCAL_WRITE)?;
        log::trace!("Registered {} byte buffer for node {}", buffer_size, peer);
        Ok(ConnectionContext {
            peer,
            data,
            control,
        })
    }

    pub fn post_control_recv(&self, endpoint: &E) -> Result<(), FabricError> {
        endpoint.post_recv(WR_CONTROL_RECV, &self.control, 0, CONTROL_SIZE)
    }

    /// Zero-length receive consumed by a write with immediate.
    pub fn post_data_recv(&self, endpoint: &E) -> Result<(), FabricError> {
        endpoint.post_recv(WR_DATA_RECV, &self.data, 0, 0)
    }

    pub fn read_control(&self) -> Result<ControlMessage, FabricError> {
        let mut buf = [0u8; CONTROL_SIZE];
        self.control.read_at(0, &mut buf)?;
        ControlMessage::decode(&buf)
    }

    pub fn send_control(&self, endpoint: &E, msg: ControlMessage) -> Result<(), FabricError> {
        let mut buf = [0u8; CONTROL_SIZE];
        msg.encode(&mut buf);
        self.control.write_at(CONTROL_SIZE, &buf)?;
        endpoint.post_send(WR_CONTROL_SEND, &self.control, CONTROL_SIZE, CONTROL_SIZE)
    }

    pub fn advertisement(&self) -> ControlMessage {
        ControlMessage::MemoryRegion(self.data.remote())
    }
}

impl<E: FabricEndpoint> Drop for ConnectionContext<E> {
    fn drop(&mut self) {
        log::trace!("Releasing connection context of node {}", self.peer);
    }
}

//! Provider seam over an rdma_cm / verbs style fabric. Connection
//! management is event driven: `resolve_addr`, `resolve_route` and
//! `connect` only start an operation, whose outcome is later read with
//! `get_cm_event`.

use std::net::SocketAddr;
use std::time::Duration;

use bitflags::bitflags;

use super::FabricError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 0b0001;
        const REMOTE_WRITE = 0b0010;
        const REMOTE_READ = 0b0100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParams {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

/// Connection manager events seen on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    Established,
    Rejected,
    Unreachable,
    Disconnected,
}

/// Connection manager events seen on a listener. Connections are named by
/// their endpoint token after the request.
#[derive(Debug)]
pub enum ListenerEvent<E> {
    ConnectRequest(E),
    Established(u64),
    Disconnected(u64),
}

/// Where a peer may write into our memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    pub addr: u64,
    pub rkey: u32,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    Recv,
    RecvRdmaWithImm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLength,
    RemoteAccess,
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub opcode: WcOpcode,
    pub status: WcStatus,
    pub byte_len: usize,
    pub imm_data: Option<u32>,
}

pub trait MemoryRegion: Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remote(&self) -> RemoteRegion;

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), FabricError>;

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), FabricError>;
}

pub trait CompletionQueue: Send + 'static {
    /// Waits up to `timeout` for the next completion. Fails with
    /// `FabricError::QueueClosed` once the queue is closed and drained.
    fn next(&self, timeout: Duration) -> Result<Option<WorkCompletion>, FabricError>;
}

pub trait FabricEndpoint: Send + Sync + 'static {
    type Region: MemoryRegion;
    type Queue: CompletionQueue;

    /// Identifies the connection on the listener side.
    fn token(&self) -> u64;

    fn resolve_addr(
        &self,
        src: Option<SocketAddr>,
        dst: SocketAddr,
        timeout: Duration,
    ) -> Result<(), FabricError>;

    fn resolve_route(&self, timeout: Duration) -> Result<(), FabricError>;

    fn connect(&self, params: &ConnParams) -> Result<(), FabricError>;

    fn accept(&self, params: &ConnParams) -> Result<(), FabricError>;

    fn reject(&self) -> Result<(), FabricError>;

    fn disconnect(&self) -> Result<(), FabricError>;

    fn get_cm_event(&self, timeout: Duration) -> Result<Option<CmEventKind>, FabricError>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn register(&self, len: usize, access: AccessFlags) -> Result<Self::Region, FabricError>;

    fn post_recv(
        &self,
        wr_id: u64,
        region: &Self::Region,
        offset: usize,
        len: usize,
    ) -> Result<(), FabricError>;

    fn post_send(
        &self,
        wr_id: u64,
        region: &Self::Region,
        offset: usize,
        len: usize,
    ) -> Result<(), FabricError>;

    fn post_write_with_imm(
        &self,
        wr_id: u64,
        region: &Self::Region,
        len: usize,
        remote: RemoteRegion,
        imm: u32,
    ) -> Result<(), FabricError>;

    fn completion_queue(&self) -> Self::Queue;
}

pub trait FabricListener: Send + 'static {
    type Endpoint: FabricEndpoint;

    fn get_cm_event(
        &self,
        timeout: Duration,
    ) -> Result<Option<ListenerEvent<Self::Endpoint>>, FabricError>;
}

pub trait FabricProvider: Clone + Send + Sync + 'static {
    type Endpoint: FabricEndpoint;
    type Listener: FabricListener<Endpoint = Self::Endpoint>;

    fn create_endpoint(&self) -> Result<Self::Endpoint, FabricError>;

    fn listen(&self, addr: SocketAddr, backlog: usize) -> Result<Self::Listener, FabricError>;
}

//! Fabric over plain TCP connections, for hosts without an RDMA device.
//! Each queue pair is one stream carrying framed work requests:
//! `[kind:4][body_len:4][body]`, little-endian. A remote write is applied
//! by the receiving process to its own registered region, then completes
//! the posted receive with the immediate value.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use bytes::BufMut;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use super::provider::{
    AccessFlags, CmEventKind, ConnParams, FabricEndpoint, FabricListener, FabricProvider,
    ListenerEvent, MemoryRegion, RemoteRegion, WcOpcode, WcStatus, WorkCompletion,
};
use super::queue_pair::{Delivery, HostQueue, HostRegion, PostedRecv, RecvQueue, RegionTable};
use super::FabricError;
use crate::utils::lock;
use crate::utils::tcp;

const FRAME_HEADER: usize = 8;
const WRITE_HEADER: usize = 16;

const FRAME_REQUEST: u32 = 1;
const FRAME_ACCEPT: u32 = 2;
const FRAME_REJECT: u32 = 3;
const FRAME_SEND: u32 = 4;
const FRAME_WRITE: u32 = 5;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn write_frame(stream: &mut TcpStream, kind: u32, parts: &[&[u8]]) -> std::io::Result<()> {
    let body_len: usize = parts.iter().map(|p| p.len()).sum();
    let body_len = u32::try_from(body_len)
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "frame body too large"))?;
    let mut buf = Vec::with_capacity(FRAME_HEADER + body_len as usize);
    buf.put_u32_le(kind);
    buf.put_u32_le(body_len);
    for part in parts {
        buf.put_slice(part);
    }
    stream.write_all(&buf)
}

/// Returns `None` on a clean end of stream.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<(u32, Vec<u8>)>> {
    let mut header = [0u8; FRAME_HEADER];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let kind = LittleEndian::read_u32(&header[0..4]);
    let mut body = vec![0u8; LittleEndian::read_u32(&header[4..8]) as usize];
    stream.read_exact(&mut body)?;
    Ok(Some((kind, body)))
}

fn disconnected(err: std::io::Error) -> FabricError {
    log::trace!("Fabric stream write failed: {}", err);
    FabricError::Disconnected
}

struct Shared {
    regions: Arc<RegionTable>,
    next_token: AtomicU64,
}

/// Fabric of this process. Registered memory is only reachable through
/// connections made by this handle or its clones.
#[derive(Clone)]
pub struct SocketFabric {
    inner: Arc<Shared>,
}

impl Default for SocketFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketFabric {
    pub fn new() -> Self {
        SocketFabric {
            inner: Arc::new(Shared {
                regions: Arc::new(RegionTable::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Number of memory regions currently registered.
    pub fn live_registrations(&self) -> usize {
        self.inner.regions.live()
    }
}

impl fmt::Debug for SocketFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketFabric")
            .field("live_registrations", &self.live_registrations())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Idle,
    AddrResolved,
    RouteResolved,
    Connecting,
    Connected,
    Disconnected,
}

type ListenerSender = Sender<ListenerEvent<SocketEndpoint>>;

struct QueuePair {
    state: EndpointState,
    src: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    // set on the accepting side only
    listener: Option<ListenerSender>,
    // read half of an accepted stream until the reader takes it
    accepted: Option<TcpStream>,
    recv: RecvQueue,
}

struct EndpointInner {
    token: u64,
    shared: Arc<Shared>,
    events_tx: Sender<CmEventKind>,
    events_rx: Receiver<CmEventKind>,
    cq: HostQueue,
    qp: Mutex<QueuePair>,
    writer: Mutex<Option<TcpStream>>,
}

impl EndpointInner {
    fn new(shared: Arc<Shared>) -> Self {
        let (events_tx, events_rx) = channel::unbounded();
        let (recv, cq) = RecvQueue::new();
        EndpointInner {
            token: shared.next_token.fetch_add(1, Ordering::Relaxed),
            shared,
            events_tx,
            events_rx,
            cq,
            qp: Mutex::new(QueuePair {
                state: EndpointState::Idle,
                src: None,
                dst: None,
                listener: None,
                accepted: None,
                recv,
            }),
            writer: Mutex::new(None),
        }
    }

    fn event(&self, kind: CmEventKind) {
        if self.events_tx.send(kind).is_err() {
            log::warn!("Endpoint {} dropped cm event {:?}", self.token, kind);
        }
    }

    fn notify_listener(tx: Option<ListenerSender>, event: ListenerEvent<SocketEndpoint>) {
        if let Some(tx) = tx {
            if let Err(e) = tx.send(event) {
                log::warn!("Listener is gone, dropping {:?}", e.into_inner());
            }
        }
    }

    fn send_frame(&self, kind: u32, parts: &[&[u8]]) -> Result<(), FabricError> {
        let mut writer = lock(&self.writer);
        let stream = writer.as_mut().ok_or(FabricError::Disconnected)?;
        write_frame(stream, kind, parts).map_err(disconnected)
    }

    fn check_connected(&self) -> Result<(), FabricError> {
        match lock(&self.qp).state {
            EndpointState::Connected => Ok(()),
            _ => Err(FabricError::Disconnected),
        }
    }

    fn complete_local(&self, wc: WorkCompletion) {
        lock(&self.qp).recv.push(wc);
    }

    fn deliver(&self, delivery: Delivery) {
        let mut qp = lock(&self.qp);
        if qp.state == EndpointState::Connected {
            qp.recv.deliver(delivery);
        }
    }

    fn refused(&self, kind: CmEventKind) {
        lock(&self.qp).state = EndpointState::Idle;
        if let Some(stream) = lock(&self.writer).take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::trace!("Shutdown of refused stream: {}", e);
            }
        }
        self.event(kind);
    }

    fn established(&self) {
        {
            let mut qp = lock(&self.qp);
            if qp.state != EndpointState::Connecting {
                return;
            }
            qp.state = EndpointState::Connected;
        }
        self.event(CmEventKind::Established);
    }

    fn handle_frame(&self, kind: u32, body: Vec<u8>) -> Result<(), FabricError> {
        match kind {
            FRAME_SEND => self.deliver(Delivery::Send(body)),
            FRAME_WRITE => {
                if body.len() < WRITE_HEADER {
                    return Err(FabricError::InvalidState(format!(
                        "write frame of {} bytes",
                        body.len()
                    )));
                }
                let remote = RemoteRegion {
                    rkey: LittleEndian::read_u32(&body[0..4]),
                    addr: LittleEndian::read_u64(&body[4..12]),
                    len: (body.len() - WRITE_HEADER) as u64,
                };
                let imm = LittleEndian::read_u32(&body[12..16]);
                self.shared.regions.write_remote(remote, &body[WRITE_HEADER..])?;
                self.deliver(Delivery::WriteImm {
                    imm,
                    len: body.len() - WRITE_HEADER,
                });
            }
            kind => {
                return Err(FabricError::InvalidState(format!("unexpected frame {}", kind)));
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        let (was_connected, listener) = {
            let mut qp = lock(&self.qp);
            if qp.state == EndpointState::Disconnected {
                return;
            }
            let was_connected = matches!(
                qp.state,
                EndpointState::Connecting | EndpointState::Connected
            );
            qp.state = EndpointState::Disconnected;
            qp.recv.close();
            qp.accepted = None;
            (was_connected, qp.listener.take())
        };
        if let Some(stream) = lock(&self.writer).take() {
            // the reader of either side sees the end of stream
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::trace!("Shutdown of endpoint {}: {}", self.token, e);
            }
        }
        if was_connected {
            match listener {
                Some(tx) => Self::notify_listener(Some(tx), ListenerEvent::Disconnected(self.token)),
                None => self.event(CmEventKind::Disconnected),
            }
        }
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads frames until the stream ends. Holds the endpoint weakly, so
/// dropping the endpoint shuts the stream down and ends the reader.
fn read_frames(endpoint: Weak<EndpointInner>, mut stream: TcpStream) {
    loop {
        let frame = read_frame(&mut stream);
        let Some(inner) = endpoint.upgrade() else {
            break;
        };
        let result = match frame {
            Ok(Some((FRAME_ACCEPT, _))) => {
                inner.established();
                Ok(())
            }
            Ok(Some((FRAME_REJECT, _))) => {
                inner.refused(CmEventKind::Rejected);
                break;
            }
            Ok(Some((kind, body))) => inner.handle_frame(kind, body),
            Ok(None) => Err(FabricError::Disconnected),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            if !matches!(e, FabricError::Disconnected) {
                log::warn!("Endpoint {} breaks the connection: {}", inner.token, e);
            }
            inner.shutdown();
            break;
        }
    }
}

fn spawn_reader(token: u64, endpoint: Weak<EndpointInner>, stream: TcpStream) -> std::io::Result<()> {
    thread::Builder::new()
        .name(format!("bcube-sockfab-{}", token))
        .spawn(move || read_frames(endpoint, stream))
        .map(drop)
}

/// Opens the stream of a client endpoint and sends the connection request.
fn run_client(endpoint: Weak<EndpointInner>, src: SocketAddr, dst: SocketAddr) {
    let stream = tcp::connect_from(src.ip(), &dst);
    let Some(inner) = endpoint.upgrade() else {
        return;
    };
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            log::trace!("Connect {} -> {}: {}", src, dst, e);
            let kind = match e.kind() {
                ErrorKind::ConnectionRefused => CmEventKind::Rejected,
                _ => CmEventKind::Unreachable,
            };
            inner.refused(kind);
            return;
        }
    };
    let reader = stream
        .try_clone()
        .and_then(|reader| write_frame(&mut stream, FRAME_REQUEST, &[]).map(|()| reader));
    match reader {
        Ok(reader) => {
            *lock(&inner.writer) = Some(stream);
            drop(inner);
            read_frames(endpoint, reader);
        }
        Err(e) => {
            log::trace!("Connection request {} -> {}: {}", src, dst, e);
            inner.refused(CmEventKind::Unreachable);
        }
    }
}

pub struct SocketEndpoint(Arc<EndpointInner>);

impl fmt::Debug for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SocketEndpoint").field(&self.0.token).finish()
    }
}

impl SocketEndpoint {
    fn transition(&self, from: EndpointState, to: EndpointState) -> Result<(), FabricError> {
        let mut qp = lock(&self.0.qp);
        if qp.state != from {
            return Err(FabricError::InvalidState(format!(
                "{:?}, expected {:?}",
                qp.state, from
            )));
        }
        qp.state = to;
        Ok(())
    }
}

impl FabricEndpoint for SocketEndpoint {
    type Region = HostRegion;
    type Queue = HostQueue;

    fn token(&self) -> u64 {
        self.0.token
    }

    fn resolve_addr(
        &self,
        src: Option<SocketAddr>,
        dst: SocketAddr,
        _timeout: Duration,
    ) -> Result<(), FabricError> {
        {
            let mut qp = lock(&self.0.qp);
            if qp.state != EndpointState::Idle {
                return Err(FabricError::InvalidState(format!("{:?}", qp.state)));
            }
            qp.src = Some(src.unwrap_or_else(|| {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            }));
            qp.dst = Some(dst);
            qp.state = EndpointState::AddrResolved;
        }
        self.0.event(CmEventKind::AddrResolved);
        Ok(())
    }

    fn resolve_route(&self, _timeout: Duration) -> Result<(), FabricError> {
        self.transition(EndpointState::AddrResolved, EndpointState::RouteResolved)?;
        self.0.event(CmEventKind::RouteResolved);
        Ok(())
    }

    fn connect(&self, _params: &ConnParams) -> Result<(), FabricError> {
        self.transition(EndpointState::RouteResolved, EndpointState::Connecting)?;
        let (src, dst) = {
            let qp = lock(&self.0.qp);
            (qp.src, qp.dst)
        };
        let (Some(src), Some(dst)) = (src, dst) else {
            return Err(FabricError::InvalidState("no destination".to_string()));
        };
        let endpoint = Arc::downgrade(&self.0);
        thread::Builder::new()
            .name(format!("bcube-sockfab-{}", self.0.token))
            .spawn(move || run_client(endpoint, src, dst))?;
        Ok(())
    }

    fn accept(&self, _params: &ConnParams) -> Result<(), FabricError> {
        let (reader, listener) = {
            let mut qp = lock(&self.0.qp);
            if qp.state != EndpointState::Connecting {
                return Err(FabricError::InvalidState(format!("{:?}", qp.state)));
            }
            qp.state = EndpointState::Connected;
            (qp.accepted.take(), qp.listener.clone())
        };
        let reader = reader.ok_or(FabricError::Disconnected)?;
        self.0.send_frame(FRAME_ACCEPT, &[])?;
        spawn_reader(self.0.token, Arc::downgrade(&self.0), reader)?;
        EndpointInner::notify_listener(listener, ListenerEvent::Established(self.0.token));
        Ok(())
    }

    fn reject(&self) -> Result<(), FabricError> {
        if let Err(e) = self.0.send_frame(FRAME_REJECT, &[]) {
            log::debug!("Reject of endpoint {} not delivered: {}", self.0.token, e);
        }
        {
            // no disconnect event for a connection that never existed
            let mut qp = lock(&self.0.qp);
            qp.state = EndpointState::Disconnected;
            qp.recv.close();
            qp.accepted = None;
        }
        if let Some(stream) = lock(&self.0.writer).take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::trace!("Shutdown of rejected stream: {}", e);
            }
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), FabricError> {
        self.0.shutdown();
        Ok(())
    }

    fn get_cm_event(&self, timeout: Duration) -> Result<Option<CmEventKind>, FabricError> {
        match self.0.events_rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(FabricError::Disconnected),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.0.qp).dst
    }

    fn register(&self, len: usize, access: AccessFlags) -> Result<HostRegion, FabricError> {
        Ok(self.0.shared.regions.register(len, access))
    }

    fn post_recv(
        &self,
        wr_id: u64,
        region: &HostRegion,
        offset: usize,
        len: usize,
    ) -> Result<(), FabricError> {
        region.check(offset, len)?;
        let mut qp = lock(&self.0.qp);
        if qp.state == EndpointState::Disconnected {
            return Err(FabricError::Disconnected);
        }
        qp.recv.post(PostedRecv {
            wr_id,
            region: region.downgrade(),
            offset,
            len,
        });
        Ok(())
    }

    fn post_send(
        &self,
        wr_id: u64,
        region: &HostRegion,
        offset: usize,
        len: usize,
    ) -> Result<(), FabricError> {
        let mut bytes = vec![0u8; len];
        region.read_at(offset, &mut bytes)?;
        self.0.check_connected()?;
        self.0.send_frame(FRAME_SEND, &[&bytes])?;
        self.0.complete_local(WorkCompletion {
            wr_id,
            opcode: WcOpcode::Send,
            status: WcStatus::Success,
            byte_len: len,
            imm_data: None,
        });
        Ok(())
    }

    fn post_write_with_imm(
        &self,
        wr_id: u64,
        region: &HostRegion,
        len: usize,
        remote: RemoteRegion,
        imm: u32,
    ) -> Result<(), FabricError> {
        let mut bytes = vec![0u8; len];
        region.read_at(0, &mut bytes)?;
        self.0.check_connected()?;
        let mut header = [0u8; WRITE_HEADER];
        LittleEndian::write_u32(&mut header[0..4], remote.rkey);
        LittleEndian::write_u64(&mut header[4..12], remote.addr);
        LittleEndian::write_u32(&mut header[12..16], imm);
        self.0.send_frame(FRAME_WRITE, &[&header, &bytes])?;
        self.0.complete_local(WorkCompletion {
            wr_id,
            opcode: WcOpcode::RdmaWrite,
            status: WcStatus::Success,
            byte_len: len,
            imm_data: None,
        });
        Ok(())
    }

    fn completion_queue(&self) -> HostQueue {
        self.0.cq.clone()
    }
}

/// Waits for the connection request on a freshly accepted stream and turns
/// it into a server endpoint.
fn admit(
    shared: &Arc<Shared>,
    local: SocketAddr,
    mut stream: TcpStream,
    tx: &ListenerSender,
) -> Result<SocketEndpoint, FabricError> {
    let peer = stream.peer_addr()?;
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
    match read_frame(&mut stream)? {
        Some((FRAME_REQUEST, _)) => {}
        other => {
            return Err(FabricError::InvalidState(format!(
                "expected a connection request from {}, got {:?}",
                peer,
                other.map(|(kind, _)| kind)
            )))
        }
    }
    stream.set_read_timeout(None)?;
    let inner = EndpointInner::new(Arc::clone(shared));
    {
        let mut qp = lock(&inner.qp);
        qp.state = EndpointState::Connecting;
        qp.src = Some(local);
        qp.dst = Some(peer);
        qp.listener = Some(tx.clone());
        qp.accepted = Some(stream.try_clone()?);
    }
    *lock(&inner.writer) = Some(stream);
    Ok(SocketEndpoint(Arc::new(inner)))
}

fn run_listener(
    shared: Arc<Shared>,
    listener: TcpListener,
    local: SocketAddr,
    tx: ListenerSender,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("Fabric listener {} accept: {}", local, e);
                break;
            }
        };
        match admit(&shared, local, stream, &tx) {
            Ok(endpoint) => {
                if tx.send(ListenerEvent::ConnectRequest(endpoint)).is_err() {
                    break;
                }
            }
            Err(e) => log::warn!("Fabric listener {} dropped a connection: {}", local, e),
        }
    }
    log::trace!("Fabric listener {} exits", local);
}

pub struct SocketListener {
    addr: SocketAddr,
    rx: Receiver<ListenerEvent<SocketEndpoint>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SocketListener {
    /// Bound address, with the port the system picked for port 0.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Fabric listener {} panicked", self.addr);
            }
        }
    }
}

impl FabricListener for SocketListener {
    type Endpoint = SocketEndpoint;

    fn get_cm_event(
        &self,
        timeout: Duration,
    ) -> Result<Option<ListenerEvent<SocketEndpoint>>, FabricError> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(FabricError::Disconnected),
        }
    }
}

impl FabricProvider for SocketFabric {
    type Endpoint = SocketEndpoint;
    type Listener = SocketListener;

    fn create_endpoint(&self) -> Result<SocketEndpoint, FabricError> {
        Ok(SocketEndpoint(Arc::new(EndpointInner::new(Arc::clone(
            &self.inner,
        )))))
    }

    fn listen(&self, addr: SocketAddr, backlog: usize) -> Result<SocketListener, FabricError> {
        let listener = tcp::listen(&addr, backlog.min(i32::MAX as usize) as i32).map_err(|e| {
            match e.kind() {
                ErrorKind::AddrInUse => FabricError::AddrInUse(addr),
                _ => e.into(),
            }
        })?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let (tx, rx) = channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let shared = Arc::clone(&self.inner);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("bcube-sockfab-listen-{}", local))
                .spawn(move || run_listener(shared, listener, local, tx, stop))?
        };
        Ok(SocketListener {
            addr: local,
            rx,
            stop,
            handle: Some(handle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fabric::CompletionQueue;

    const T: Duration = Duration::from_secs(5);

    fn params() -> ConnParams {
        ConnParams {
            initiator_depth: 1,
            responder_resources: 1,
            retry_count: 7,
            rnr_retry_count: 7,
        }
    }

    fn localhost() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    fn start_connect(fabric: &SocketFabric, dst: SocketAddr) -> SocketEndpoint {
        let client = fabric.create_endpoint().unwrap();
        client.resolve_addr(Some(localhost()), dst, T).unwrap();
        assert_eq!(client.get_cm_event(T).unwrap(), Some(CmEventKind::AddrResolved));
        client.resolve_route(T).unwrap();
        assert_eq!(client.get_cm_event(T).unwrap(), Some(CmEventKind::RouteResolved));
        client.connect(&params()).unwrap();
        client
    }

    fn next_request(listener: &SocketListener) -> SocketEndpoint {
        match listener.get_cm_event(T).unwrap() {
            Some(ListenerEvent::ConnectRequest(ep)) => ep,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn refused_without_listener() {
        let port = TcpListener::bind(localhost()).unwrap().local_addr().unwrap().port();
        let fabric = SocketFabric::new();
        let client = start_connect(&fabric, SocketAddr::new(localhost().ip(), port));
        assert_eq!(client.get_cm_event(T).unwrap(), Some(CmEventKind::Rejected));
    }

    #[test]
    fn reject_reaches_the_client() {
        let fabric = SocketFabric::new();
        let listener = fabric.listen(localhost(), 16).unwrap();
        let client = start_connect(&fabric, listener.local_addr());
        let server = next_request(&listener);
        assert_eq!(server.peer_addr().map(|a| a.ip()), Some(localhost().ip()));
        server.reject().unwrap();
        assert_eq!(client.get_cm_event(T).unwrap(), Some(CmEventKind::Rejected));
    }

    #[test]
    fn write_with_imm_across_fabrics() {
        // separate handles stand in for separate processes
        let client_fabric = SocketFabric::new();
        let server_fabric = SocketFabric::new();
        let listener = server_fabric.listen(localhost(), 16).unwrap();
        let client = start_connect(&client_fabric, listener.local_addr());
        let server = next_request(&listener);

        let target = server
            .register(64, AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE)
            .unwrap();
        server.post_recv(7, &target, 0, 0).unwrap();
        server.accept(&params()).unwrap();
        assert_eq!(client.get_cm_event(T).unwrap(), Some(CmEventKind::Established));
        assert!(matches!(
            listener.get_cm_event(T).unwrap(),
            Some(ListenerEvent::Established(token)) if token == server.token()
        ));

        let source = client.register(64, AccessFlags::LOCAL_WRITE).unwrap();
        source.write_at(0, b"hello").unwrap();
        client
            .post_write_with_imm(1, &source, 5, target.remote(), 5)
            .unwrap();
        let wc = server.completion_queue().next(T).unwrap().unwrap();
        assert_eq!((wc.wr_id, wc.opcode, wc.imm_data), (7, WcOpcode::RecvRdmaWithImm, Some(5)));
        let mut buf = [0u8; 5];
        target.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        let wc = client.completion_queue().next(T).unwrap().unwrap();
        assert_eq!(wc.opcode, WcOpcode::RdmaWrite);

        let control = server.register(8, AccessFlags::LOCAL_WRITE).unwrap();
        let inbox = client.register(8, AccessFlags::LOCAL_WRITE).unwrap();
        client.post_recv(3, &inbox, 0, 8).unwrap();
        control.write_at(0, &[1, 2, 3, 4]).unwrap();
        server.post_send(2, &control, 0, 4).unwrap();
        let wc = client.completion_queue().next(T).unwrap().unwrap();
        assert_eq!((wc.wr_id, wc.opcode, wc.byte_len), (3, WcOpcode::Recv, 4));
        let mut got = [0u8; 4];
        inbox.read_at(0, &mut got).unwrap();
        assert_eq!(got, [1, 2, 3, 4]);

        client.disconnect().unwrap();
        assert!(matches!(
            listener.get_cm_event(T).unwrap(),
            Some(ListenerEvent::Disconnected(token)) if token == server.token()
        ));
        // the send completion is drained before the close shows
        assert_eq!(server.completion_queue().next(T).unwrap().unwrap().opcode, WcOpcode::Send);
        assert!(matches!(
            server.completion_queue().next(T),
            Err(FabricError::QueueClosed)
        ));
        drop((target, control));
        assert_eq!(server_fabric.live_registrations(), 0);
        assert_eq!(client_fabric.live_registrations(), 2);
    }

    #[test]
    fn write_without_remote_access_breaks_the_connection() {
        let fabric = SocketFabric::new();
        let listener = fabric.listen(localhost(), 16).unwrap();
        let client = start_connect(&fabric, listener.local_addr());
        let server = next_request(&listener);
        let target = server.register(8, AccessFlags::LOCAL_WRITE).unwrap();
        server.post_recv(7, &target, 0, 0).unwrap();
        server.accept(&params()).unwrap();
        assert_eq!(client.get_cm_event(T).unwrap(), Some(CmEventKind::Established));

        let source = client.register(8, AccessFlags::LOCAL_WRITE).unwrap();
        client
            .post_write_with_imm(1, &source, 4, target.remote(), 4)
            .unwrap();
        assert_eq!(client.get_cm_event(T).unwrap(), Some(CmEventKind::Disconnected));
        assert!(matches!(
            server.completion_queue().next(T),
            Err(FabricError::QueueClosed)
        ));
    }
}

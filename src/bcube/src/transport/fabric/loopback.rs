//! In-process fabric. Endpoints, registered regions and completion queues
//! live in one address space, so the connection state machine and the data
//! path run unchanged on a single host.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use super::provider::{
    AccessFlags, CmEventKind, ConnParams, FabricEndpoint, FabricListener, FabricProvider,
    ListenerEvent, MemoryRegion, RemoteRegion, WcOpcode, WcStatus, WorkCompletion,
};
use super::queue_pair::{Delivery, HostQueue, HostRegion, PostedRecv, RecvQueue, RegionTable};
use super::FabricError;
use crate::utils::lock;

type ListenerSender = Sender<ListenerEvent<LoopbackEndpoint>>;

struct Fabric {
    listeners: Mutex<HashMap<SocketAddr, ListenerSender>>,
    regions: Arc<RegionTable>,
    // destination -> connection attempts still to be rejected
    rejections: Mutex<HashMap<SocketAddr, usize>>,
    // destination -> connection attempts left without any answer
    stalls: Mutex<HashMap<SocketAddr, usize>>,
    next_token: AtomicU64,
    rejected: AtomicUsize,
}

fn take_one(counts: &Mutex<HashMap<SocketAddr, usize>>, dst: SocketAddr) -> bool {
    let mut counts = lock(counts);
    match counts.get_mut(&dst) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

impl Fabric {
    fn find_listener(&self, dst: SocketAddr) -> Option<(SocketAddr, ListenerSender)> {
        let listeners = lock(&self.listeners);
        let wildcard = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), dst.port());
        [dst, wildcard]
            .into_iter()
            .find_map(|addr| listeners.get(&addr).map(|tx| (addr, tx.clone())))
    }

    fn notify_listener(&self, addr: SocketAddr, event: ListenerEvent<LoopbackEndpoint>) {
        let tx = lock(&self.listeners).get(&addr).cloned();
        if let Some(tx) = tx {
            if let Err(e) = tx.send(event) {
                log::warn!("Listener {} is gone, dropping {:?}", addr, e.into_inner());
            }
        }
    }
}

/// Handle to one in-process fabric. Clones share the same fabric.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<Fabric>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        LoopbackFabric {
            inner: Arc::new(Fabric {
                listeners: Mutex::new(HashMap::new()),
                regions: Arc::new(RegionTable::new()),
                rejections: Mutex::new(HashMap::new()),
                stalls: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                rejected: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of memory regions currently registered.
    pub fn live_registrations(&self) -> usize {
        self.inner.regions.live()
    }

    /// Number of connection attempts rejected so far.
    pub fn rejected_count(&self) -> usize {
        self.inner.rejected.load(Ordering::SeqCst)
    }

    /// Rejects the next `count` connection attempts towards `addr`.
    pub fn reject_next(&self, addr: SocketAddr, count: usize) {
        *lock(&self.inner.rejections).entry(addr).or_insert(0) += count;
    }

    /// Leaves the next `count` connection attempts towards `addr` without
    /// any connection manager event, as if the request was lost.
    pub fn stall_next(&self, addr: SocketAddr, count: usize) {
        *lock(&self.inner.stalls).entry(addr).or_insert(0) += count;
    }
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackFabric")
            .field("live_registrations", &self.live_registrations())
            .field("rejected", &self.rejected_count())
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

struct QueuePair {
    state: EndpointState,
    src: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    peer: Weak<EndpointInner>,
    // set on the accepting side only
    listener: Option<SocketAddr>,
    recv: RecvQueue,
}

struct EndpointInner {
    token: u64,
    fabric: Arc<Fabric>,
    events_tx: Sender<CmEventKind>,
    events_rx: Receiver<CmEventKind>,
    cq: HostQueue,
    qp: Mutex<QueuePair>,
}

impl EndpointInner {
    fn new(fabric: Arc<Fabric>) -> Self {
        let (events_tx, events_rx) = channel::unbounded();
        let (recv, cq) = RecvQueue::new();
        EndpointInner {
            token: fabric.next_token.fetch_add(1, Ordering::Relaxed),
            fabric,
            events_tx,
            events_rx,
            cq,
            qp: Mutex::new(QueuePair {
                state: EndpointState::Idle,
                src: None,
                dst: None,
                peer: Weak::new(),
                listener: None,
                recv,
            }),
        }
    }

    fn event(&self, kind: CmEventKind) {
        if self.events_tx.send(kind).is_err() {
            log::warn!("Endpoint {} dropped cm event {:?}", self.token, kind);
        }
    }

    fn connected_peer(&self) -> Result<Arc<EndpointInner>, FabricError> {
        let qp = lock(&self.qp);
        if qp.state != EndpointState::Connected {
            return Err(FabricError::Disconnected);
        }
        qp.peer.upgrade().ok_or(FabricError::Disconnected)
    }

    fn deliver(&self, delivery: Delivery) -> Result<(), FabricError> {
        let mut qp = lock(&self.qp);
        if qp.state != EndpointState::Connected {
            return Err(FabricError::Disconnected);
        }
        qp.recv.deliver(delivery);
        Ok(())
    }

    fn complete_local(&self, wc: WorkCompletion) {
        lock(&self.qp).recv.push(wc);
    }

    fn shutdown(&self) {
        let (was_connected, peer, listener) = {
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
            (was_connected, qp.peer.upgrade(), qp.listener)
        };
        if was_connected {
            match listener {
                Some(addr) => self
                    .fabric
                    .notify_listener(addr, ListenerEvent::Disconnected(self.token)),
                None => self.event(CmEventKind::Disconnected),
            }
        }
        if let Some(peer) = peer {
            peer.shutdown();
        }
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct LoopbackEndpoint(Arc<EndpointInner>);

impl fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LoopbackEndpoint").field(&self.0.token).finish()
    }
}

impl LoopbackEndpoint {
    fn transition(
        &self,
        from: EndpointState,
        to: EndpointState,
    ) -> Result<QueuePairSnapshot, FabricError> {
        let mut qp = lock(&self.0.qp);
        if qp.state != from {
            return Err(FabricError::InvalidState(format!(
                "{:?}, expected {:?}",
                qp.state, from
            )));
        }
        qp.state = to;
        Ok(QueuePairSnapshot {
            src: qp.src,
            dst: qp.dst,
            peer: qp.peer.clone(),
            listener: qp.listener,
        })
    }

    fn refuse(&self) {
        self.0.fabric.rejected.fetch_add(1, Ordering::SeqCst);
        lock(&self.0.qp).state = EndpointState::Idle;
        self.0.event(CmEventKind::Rejected);
    }
}

struct QueuePairSnapshot {
    src: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    peer: Weak<EndpointInner>,
    listener: Option<SocketAddr>,
}

impl FabricEndpoint for LoopbackEndpoint {
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
        let snapshot = self.transition(EndpointState::RouteResolved, EndpointState::Connecting)?;
        let dst = snapshot
            .dst
            .ok_or_else(|| FabricError::InvalidState("no destination".to_string()))?;
        if take_one(&self.0.fabric.stalls, dst) {
            log::trace!("Connection request {} towards {} is lost", self.0.token, dst);
            return Ok(());
        }
        if take_one(&self.0.fabric.rejections, dst) {
            self.refuse();
            return Ok(());
        }
        let Some((listener_addr, tx)) = self.0.fabric.find_listener(dst) else {
            self.refuse();
            return Ok(());
        };
        let server = Arc::new(EndpointInner::new(Arc::clone(&self.0.fabric)));
        {
            let mut qp = lock(&server.qp);
            qp.state = EndpointState::Connecting;
            qp.src = Some(dst);
            qp.dst = snapshot.src;
            qp.peer = Arc::downgrade(&self.0);
            qp.listener = Some(listener_addr);
        }
        lock(&self.0.qp).peer = Arc::downgrade(&server);
        if tx
            .send(ListenerEvent::ConnectRequest(LoopbackEndpoint(server)))
            .is_err()
        {
            self.refuse();
        }
        Ok(())
    }

    fn accept(&self, _params: &ConnParams) -> Result<(), FabricError> {
        let snapshot = self.transition(EndpointState::Connecting, EndpointState::Connected)?;
        let peer = snapshot.peer.upgrade().ok_or(FabricError::Disconnected)?;
        {
            let mut qp = lock(&peer.qp);
            if qp.state != EndpointState::Connecting {
                return Err(FabricError::Disconnected);
            }
            qp.state = EndpointState::Connected;
        }
        peer.event(CmEventKind::Established);
        if let Some(addr) = snapshot.listener {
            self.0
                .fabric
                .notify_listener(addr, ListenerEvent::Established(self.0.token));
        }
        Ok(())
    }

    fn reject(&self) -> Result<(), FabricError> {
        let peer = {
            let mut qp = lock(&self.0.qp);
            qp.state = EndpointState::Disconnected;
            qp.recv.close();
            qp.peer.upgrade()
        };
        if let Some(peer) = peer {
            LoopbackEndpoint(peer).refuse();
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
        Ok(self.0.fabric.regions.register(len, access))
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
        let peer = self.0.connected_peer()?;
        peer.deliver(Delivery::Send(bytes))?;
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
        let peer = self.0.connected_peer()?;
        self.0.fabric.regions.write_remote(remote, &bytes)?;
        peer.deliver(Delivery::WriteImm { imm, len })?;
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

pub struct LoopbackListener {
    addr: SocketAddr,
    rx: Receiver<ListenerEvent<LoopbackEndpoint>>,
    fabric: Arc<Fabric>,
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        lock(&self.fabric.listeners).remove(&self.addr);
    }
}

impl FabricListener for LoopbackListener {
    type Endpoint = LoopbackEndpoint;

    fn get_cm_event(
        &self,
        timeout: Duration,
    ) -> Result<Option<ListenerEvent<LoopbackEndpoint>>, FabricError> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(FabricError::Disconnected),
        }
    }
}

impl FabricProvider for LoopbackFabric {
    type Endpoint = LoopbackEndpoint;
    type Listener = LoopbackListener;

    fn create_endpoint(&self) -> Result<LoopbackEndpoint, FabricError> {
        Ok(LoopbackEndpoint(Arc::new(EndpointInner::new(Arc::clone(
            &self.inner,
        )))))
    }

    fn listen(&self, addr: SocketAddr, _backlog: usize) -> Result<LoopbackListener, FabricError> {
        let mut listeners = lock(&self.inner.listeners);
        if listeners.contains_key(&addr) {
            return Err(FabricError::AddrInUse(addr));
        }
        let (tx, rx) = channel::unbounded();
        listeners.insert(addr, tx);
        Ok(LoopbackListener {
            addr,
            rx,
            fabric: Arc::clone(&self.inner),
        })
    }
}

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::config::FabricTransportConfig;
use super::context::{ConnectionContext, WR_DATA_WRITE};
use super::control::ControlMessage;
use super::provider::{
    CmEventKind, CompletionQueue, ConnParams, FabricEndpoint, FabricListener, FabricProvider,
    ListenerEvent, MemoryRegion, RemoteRegion, WcOpcode, WcStatus, WorkCompletion,
};
use super::FabricError;
use crate::aggregator::Aggregator;
use crate::message::decode;
use crate::transport::{FaultSlot, PeerLink, TransportError};
use crate::utils::lock;

pub(crate) fn conn_params(config: &FabricTransportConfig) -> ConnParams {
    ConnParams {
        initiator_depth: config.initiator_depth,
        responder_resources: config.responder_resources,
        retry_count: config.retry_count,
        rnr_retry_count: config.rnr_retry_count,
    }
}

/// Poller errors that only mean the connection went away.
fn is_teardown(err: &FabricError) -> bool {
    matches!(err, FabricError::QueueClosed | FabricError::Disconnected)
}

fn check_completion(wc: &WorkCompletion) -> Result<(), FabricError> {
    match wc.status {
        WcStatus::Success => Ok(()),
        WcStatus::Flushed => Err(FabricError::Disconnected),
        status => Err(FabricError::Completion {
            wr_id: wc.wr_id,
            opcode: wc.opcode,
            status,
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    AddrResolving,
    RouteResolving,
    ConnectSent,
}

#[derive(Debug, Default)]
struct RemoteState {
    region: Option<RemoteRegion>,
    // the peer consumed the previous write
    idle: bool,
    closed: bool,
}

/// Writing side of a connection to one neighbor.
pub struct FabricLink<E: FabricEndpoint> {
    peer: usize,
    level: usize,
    // declared before the endpoint so the regions are released first
    context: ConnectionContext<E>,
    endpoint: E,
    remote: Mutex<RemoteState>,
    remote_cv: Condvar,
    poller: Mutex<Option<JoinHandle<()>>>,
    ready_timeout: Duration,
}

impl<E: FabricEndpoint> fmt::Debug for FabricLink<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricLink")
            .field("peer", &self.peer)
            .field("level", &self.level)
            .field("token", &self.endpoint.token())
            .finish()
    }
}

impl<E: FabricEndpoint> FabricLink<E> {
    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }

    fn update_remote<F: FnOnce(&mut RemoteState)>(&self, f: F) {
        f(&mut lock(&self.remote));
        self.remote_cv.notify_all();
    }

    fn handle_completion(&self, wc: WorkCompletion) -> Result<(), FabricError> {
        check_completion(&wc)?;
        match wc.opcode {
            WcOpcode::Recv => {
                let msg = self.context.read_control()?;
                // re-armed before the peer can observe our next write
                self.context.post_control_recv(&self.endpoint)?;
                match msg {
                    ControlMessage::MemoryRegion(region) => {
                        log::debug!("Node {} advertised {} byte buffer", self.peer, region.len);
                        self.update_remote(|r| {
                            r.region = Some(region);
                            r.idle = true;
                        });
                    }
                    ControlMessage::Ready => self.update_remote(|r| r.idle = true),
                    ControlMessage::Done => {
                        log::debug!("Node {} is done receiving", self.peer);
                        self.update_remote(|r| r.closed = true);
                        self.endpoint.disconnect()?;
                    }
                }
                Ok(())
            }
            WcOpcode::RdmaWrite | WcOpcode::Send => Ok(()),
            opcode => Err(FabricError::UnexpectedOpcode(opcode)),
        }
    }

    fn poll(self: Arc<Self>, poll_timeout: Duration, faults: Arc<FaultSlot>) {
        let cq = self.endpoint.completion_queue();
        loop {
            let result = match cq.next(poll_timeout) {
                Ok(Some(wc)) => self.handle_completion(wc),
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(e) if is_teardown(&e) => break,
                Err(e) => {
                    faults.record(&format!("Send poller of node {}", self.peer), e);
                    break;
                }
            }
        }
        log::trace!("Send poller of node {} exits", self.peer);
        self.update_remote(|r| r.closed = true);
    }

    pub(crate) fn start_poller(
        self: &Arc<Self>,
        poll_timeout: Duration,
        faults: Arc<FaultSlot>,
    ) -> std::io::Result<()> {
        let link = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("bcube-fabric-send-{}", self.peer))
            .spawn(move || link.poll(poll_timeout, faults))?;
        *lock(&self.poller) = Some(handle);
        Ok(())
    }

    pub(crate) fn close(&self) {
        if let Err(e) = self.endpoint.disconnect() {
            log::debug!("Disconnect from node {}: {}", self.peer, e);
        }
        if let Some(handle) = lock(&self.poller).take() {
            if handle.join().is_err() {
                log::error!("Send poller of node {} panicked", self.peer);
            }
        }
    }
}

impl<E: FabricEndpoint> PeerLink for FabricLink<E> {
    fn peer(&self) -> usize {
        self.peer
    }

    fn send_message(&self, msg: &[u8]) -> Result<(), TransportError> {
        let local_capacity = self.context.data.len();
        if msg.len() > local_capacity {
            return Err(TransportError::PayloadTooLarge {
                peer: self.peer,
                len: msg.len(),
                capacity: local_capacity,
            });
        }
        // held until the write is posted, so writes on one link never overlap
        let remote = lock(&self.remote);
        let (mut remote, _) = self
            .remote_cv
            .wait_timeout_while(remote, self.ready_timeout, |r| {
                !r.closed && !(r.idle && r.region.is_some())
            })
            .unwrap_or_else(|e| e.into_inner());
        if remote.closed {
            return Err(TransportError::Disconnected(self.peer));
        }
        let region = match remote.region {
            Some(region) if remote.idle => region,
            _ => {
                return Err(TransportError::ReadyTimeout {
                    peer: self.peer,
                    timeout: self.ready_timeout,
                })
            }
        };
        if msg.len() as u64 > region.len {
            return Err(TransportError::PayloadTooLarge {
                peer: self.peer,
                len: msg.len(),
                capacity: region.len as usize,
            });
        }
        self.context.data.write_at(0, msg)?;
        self.endpoint
            .post_write_with_imm(WR_DATA_WRITE, &self.context.data, msg.len(), region, msg.len() as u32)?;
        // cleared only once the write is out; the next Ready belongs to it
        remote.idle = false;
        Ok(())
    }
}

/// Runs the client side of the connection state machine towards `remote`.
pub(crate) fn connect<P: FabricProvider>(
    provider: &P,
    config: &FabricTransportConfig,
    local: SocketAddr,
    remote: SocketAddr,
    peer: usize,
    level: usize,
) -> Result<FabricLink<P::Endpoint>, TransportError> {
    let resolve_timeout = Duration::from_millis(config.resolve_timeout_ms);
    let event_timeout = Duration::from_millis(config.cm_event_timeout_ms);
    let params = conn_params(config);

    'attempt: for attempt in 1..=config.max_connect_attempts {
        let endpoint = provider.create_endpoint()?;
        endpoint.resolve_addr(Some(local), remote, resolve_timeout)?;
        let mut state = ClientState::AddrResolving;
        let mut context = None;
        loop {
            let Some(event) = endpoint.get_cm_event(event_timeout)? else {
                log::debug!(
                    "Connection {} -> {} got no event in {:?} while {:?}, retrying",
                    local,
                    remote,
                    event_timeout,
                    state
                );
                drop(context.take());
                thread::sleep(Duration::from_millis(config.reject_backoff_ms));
                continue 'attempt;
            };
            match (state, event) {
                (ClientState::AddrResolving, CmEventKind::AddrResolved) => {
                    let ctx = ConnectionContext::for_writer(&endpoint, peer, config.buffer_size)?;
                    ctx.post_control_recv(&endpoint)?;
                    context = Some(ctx);
                    endpoint.resolve_route(resolve_timeout)?;
                    state = ClientState::RouteResolving;
                }
                (ClientState::RouteResolving, CmEventKind::RouteResolved) => {
                    endpoint.connect(&params)?;
                    state = ClientState::ConnectSent;
                }
                (ClientState::ConnectSent, CmEventKind::Established) => {
                    let context = context.take().ok_or_else(|| {
                        TransportError::UnexpectedEvent {
                            state: format!("{:?}", state),
                            event: "established without context".to_string(),
                        }
                    })?;
                    log::debug!(
                        "Connected {} -> {} (node {}) after {} attempts",
                        local,
                        remote,
                        peer,
                        attempt
                    );
                    return Ok(FabricLink {
                        peer,
                        level,
                        context,
                        endpoint,
                        remote: Mutex::new(RemoteState::default()),
                        remote_cv: Condvar::new(),
                        poller: Mutex::new(None),
                        ready_timeout: Duration::from_millis(config.ready_timeout_ms),
                    });
                }
                (
                    _,
                    CmEventKind::Rejected
                    | CmEventKind::Unreachable
                    | CmEventKind::AddrError
                    | CmEventKind::RouteError,
                ) => {
                    drop(context.take());
                    if attempt % 50 == 1 {
                        log::debug!("Connection {} -> {}: {:?}, retrying", local, remote, event);
                    }
                    thread::sleep(Duration::from_millis(config.reject_backoff_ms));
                    continue 'attempt;
                }
                (state, event) => {
                    return Err(TransportError::UnexpectedEvent {
                        state: format!("{:?}", state),
                        event: format!("{:?}", event),
                    })
                }
            }
        }
    }
    Err(TransportError::ConnectTimeout {
        local,
        remote,
        attempts: config.max_connect_attempts,
    })
}

/// Receiving side of a connection from one neighbor.
pub(crate) struct Inbound<E: FabricEndpoint> {
    peer: usize,
    context: ConnectionContext<E>,
    endpoint: E,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl<E: FabricEndpoint> Inbound<E> {
    fn handle_completion(&self, wc: WorkCompletion, aggregator: &Aggregator) -> Result<(), TransportError> {
        check_completion(&wc)?;
        match wc.opcode {
            WcOpcode::RecvRdmaWithImm => {
                let len = wc.imm_data.unwrap_or(0) as usize;
                let mut buf = vec![0u8; len];
                self.context.data.read_at(0, &mut buf)?;
                let msg = decode(&buf)?;
                // the payload is copied out, keep it even if the peer leaves now
                aggregator.insert_message(self.peer, msg);
                // Ready only after the buffer can take the next write
                self.context.post_data_recv(&self.endpoint)?;
                self.context.send_control(&self.endpoint, ControlMessage::Ready)?;
                Ok(())
            }
            WcOpcode::Send => Ok(()),
            opcode => Err(FabricError::UnexpectedOpcode(opcode).into()),
        }
    }

    fn poll(self: Arc<Self>, poll_timeout: Duration, aggregator: Arc<Aggregator>, faults: Arc<FaultSlot>) {
        let cq = self.endpoint.completion_queue();
        loop {
            let result = match cq.next(poll_timeout) {
                Ok(Some(wc)) => self.handle_completion(wc, &aggregator),
                Ok(None) => continue,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => {}
                Err(TransportError::Fabric(e)) if is_teardown(&e) => break,
                Err(e) => {
                    faults.record(&format!("Receive poller of node {}", self.peer), e);
                    break;
                }
            }
        }
        log::trace!("Receive poller of node {} exits", self.peer);
    }

    pub(crate) fn close(&self) {
        if let Err(e) = self.context.send_control(&self.endpoint, ControlMessage::Done) {
            log::debug!("Done to node {}: {}", self.peer, e);
        }
        if let Err(e) = self.endpoint.disconnect() {
            log::debug!("Disconnect from node {}: {}", self.peer, e);
        }
    }

    fn join(&self) {
        if let Some(handle) = lock(&self.poller).take() {
            if handle.join().is_err() {
                log::error!("Receive poller of node {} panicked", self.peer);
            }
        }
    }
}

#[derive(Debug, Default)]
struct AcceptStatus {
    established: usize,
    live: usize,
}

/// Inbound connections shared by the listener threads and the transport.
pub(crate) struct InboundRegistry<E: FabricEndpoint> {
    conns: Mutex<HashMap<u64, Arc<Inbound<E>>>>,
    status: Mutex<AcceptStatus>,
    status_cv: Condvar,
    expected: usize,
}

impl<E: FabricEndpoint> InboundRegistry<E> {
    pub(crate) fn new(expected: usize) -> Self {
        InboundRegistry {
            conns: Mutex::new(HashMap::new()),
            status: Mutex::new(AcceptStatus::default()),
            status_cv: Condvar::new(),
            expected,
        }
    }

    /// Waits until every expected connection is established. Returns the
    /// number established when `timeout` passes or `stop` turns true first.
    pub(crate) fn wait_established<F: Fn() -> bool>(
        &self,
        timeout: Duration,
        stop: F,
    ) -> usize {
        let deadline = std::time::Instant::now() + timeout;
        let mut status = lock(&self.status);
        while status.established < self.expected && !stop() {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            let slice = (deadline - now).min(Duration::from_millis(100));
            status = self
                .status_cv
                .wait_timeout(status, slice)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        status.established
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Inbound<E>>> {
        lock(&self.conns).values().cloned().collect()
    }

    fn finished(&self) -> bool {
        let status = lock(&self.status);
        status.established >= self.expected && status.live == 0
    }

    fn add(&self, token: u64, conn: Arc<Inbound<E>>) {
        lock(&self.conns).insert(token, conn);
        let mut status = lock(&self.status);
        status.established += 1;
        status.live += 1;
        drop(status);
        self.status_cv.notify_all();
    }

    fn remove(&self, token: u64) -> Option<Arc<Inbound<E>>> {
        let conn = lock(&self.conns).remove(&token)?;
        lock(&self.status).live -= 1;
        Some(conn)
    }

    fn drain(&self) -> Vec<Arc<Inbound<E>>> {
        let conns: Vec<_> = lock(&self.conns).drain().map(|(_, c)| c).collect();
        lock(&self.status).live -= conns.len();
        conns
    }
}

/// What a listener thread needs besides its listener.
pub(crate) struct ListenerState<E: FabricEndpoint> {
    pub registry: Arc<InboundRegistry<E>>,
    // per-level neighbor address -> rank
    pub peers: HashMap<Ipv4Addr, usize>,
    pub config: FabricTransportConfig,
    pub aggregator: Arc<Aggregator>,
    pub faults: Arc<FaultSlot>,
    pub shutdown: Arc<AtomicBool>,
}

impl<E: FabricEndpoint> ListenerState<E> {
    fn on_connect_request(
        &self,
        endpoint: E,
        pending: &mut HashMap<u64, Inbound<E>>,
    ) -> Result<(), TransportError> {
        let peer = endpoint.peer_addr().and_then(|addr| match addr.ip() {
            std::net::IpAddr::V4(ip) => self.peers.get(&ip).copied(),
            std::net::IpAddr::V6(_) => None,
        });
        let Some(peer) = peer else {
            log::warn!("Rejecting connection from unknown address {:?}", endpoint.peer_addr());
            endpoint.reject()?;
            return Ok(());
        };
        let context = ConnectionContext::for_reader(&endpoint, peer, self.config.buffer_size)?;
        context.post_data_recv(&endpoint)?;
        endpoint.accept(&conn_params(&self.config))?;
        pending.insert(
            endpoint.token(),
            Inbound {
                peer,
                context,
                endpoint,
                poller: Mutex::new(None),
            },
        );
        Ok(())
    }

    fn on_established(&self, conn: Inbound<E>) -> Result<(), TransportError> {
        conn.context
            .send_control(&conn.endpoint, conn.context.advertisement())?;
        let token = conn.endpoint.token();
        let peer = conn.peer;
        let conn = Arc::new(conn);
        let handle = {
            let conn = Arc::clone(&conn);
            let poll_timeout = Duration::from_millis(self.config.poll_timeout_ms);
            let aggregator = Arc::clone(&self.aggregator);
            let faults = Arc::clone(&self.faults);
            thread::Builder::new()
                .name(format!("bcube-fabric-recv-{}", peer))
                .spawn(move || conn.poll(poll_timeout, aggregator, faults))?
        };
        *lock(&conn.poller) = Some(handle);
        self.registry.add(token, conn);
        log::debug!("Accepted connection from node {}", peer);
        Ok(())
    }

    fn on_disconnected(&self, token: u64, pending: &mut HashMap<u64, Inbound<E>>) {
        if pending.remove(&token).is_some() {
            return;
        }
        if let Some(conn) = self.registry.remove(token) {
            log::debug!("Node {} disconnected", conn.peer);
            conn.join();
        }
    }

    /// Serves one listener until shutdown or until every accepted
    /// connection is gone again.
    pub(crate) fn serve<L: FabricListener<Endpoint = E>>(self, listener: L) {
        let timeout = Duration::from_millis(self.config.poll_timeout_ms);
        let mut pending = HashMap::new();
        while !self.shutdown.load(Ordering::Acquire) && !self.registry.finished() {
            let event = match listener.get_cm_event(timeout) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    self.faults.record("Fabric listener", e);
                    break;
                }
            };
            let result = match event {
                ListenerEvent::ConnectRequest(endpoint) => {
                    self.on_connect_request(endpoint, &mut pending)
                }
                ListenerEvent::Established(token) => match pending.remove(&token) {
                    Some(conn) => self.on_established(conn),
                    None => Err(TransportError::UnexpectedEvent {
                        state: "listening".to_string(),
                        event: format!("established {}", token),
                    }),
                },
                ListenerEvent::Disconnected(token) => {
                    self.on_disconnected(token, &mut pending);
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.faults.record("Fabric listener", e);
                break;
            }
        }
        for conn in self.registry.drain() {
            conn.close();
            conn.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fabric::LoopbackFabric;

    const T: Duration = Duration::from_secs(2);

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn test_config() -> FabricTransportConfig {
        FabricTransportConfig {
            buffer_size: 64,
            cm_event_timeout_ms: 50,
            reject_backoff_ms: 5,
            max_connect_attempts: 10,
            ready_timeout_ms: 2000,
            poll_timeout_ms: 20,
            ..Default::default()
        }
    }

    type Server = (
        <LoopbackFabric as FabricProvider>::Endpoint,
        ConnectionContext<<LoopbackFabric as FabricProvider>::Endpoint>,
    );

    /// Accepts one connection the way the listener does.
    fn accept_one<L: FabricListener<Endpoint = <LoopbackFabric as FabricProvider>::Endpoint>>(
        listener: &L,
        config: &FabricTransportConfig,
    ) -> Server {
        loop {
            match listener.get_cm_event(T).unwrap() {
                Some(ListenerEvent::ConnectRequest(endpoint)) => {
                    let context = ConnectionContext::for_reader(&endpoint, 0, config.buffer_size).unwrap();
                    context.post_data_recv(&endpoint).unwrap();
                    endpoint.accept(&conn_params(config)).unwrap();
                    return (endpoint, context);
                }
                Some(_) => continue,
                None => panic!("no connect request"),
            }
        }
    }

    #[test]
    fn lost_requests_are_retried() {
        let fabric = LoopbackFabric::new();
        let config = test_config();
        let remote = addr("10.0.0.2:7000");
        let listener = fabric.listen(remote, 16).unwrap();
        fabric.stall_next(remote, 2);
        thread::scope(|s| {
            let client = s.spawn(|| connect(&fabric, &config, addr("10.0.0.1:0"), remote, 1, 0));
            let _server = accept_one(&listener, &config);
            let link = client.join().unwrap().unwrap();
            assert_eq!((link.peer(), link.level()), (1, 0));
        });
        assert_eq!(fabric.rejected_count(), 0);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let fabric = LoopbackFabric::new();
        let config = FabricTransportConfig {
            max_connect_attempts: 3,
            ..test_config()
        };
        let remote = addr("10.0.0.2:7000");
        let _listener = fabric.listen(remote, 16).unwrap();
        fabric.reject_next(remote, 100);
        let err = connect(&fabric, &config, addr("10.0.0.1:0"), remote, 1, 0).unwrap_err();
        assert!(
            matches!(err, TransportError::ConnectTimeout { attempts: 3, remote: r, .. } if r == remote),
            "{}",
            err
        );
        assert_eq!(fabric.rejected_count(), 3);
        // contexts of the failed attempts are released
        assert_eq!(fabric.live_registrations(), 0);
    }

    #[test]
    fn writer_leaves_after_done() {
        let fabric = LoopbackFabric::new();
        let config = test_config();
        let remote = addr("10.0.0.2:7000");
        let listener = fabric.listen(remote, 16).unwrap();
        let faults = Arc::new(FaultSlot::new());
        let (link, server, server_ctx) = thread::scope(|s| {
            let client = s.spawn(|| connect(&fabric, &config, addr("10.0.0.1:0"), remote, 1, 0));
            let (server, server_ctx) = accept_one(&listener, &config);
            (client.join().unwrap().unwrap(), server, server_ctx)
        });
        let link = Arc::new(link);
        link.start_poller(Duration::from_millis(20), Arc::clone(&faults)).unwrap();

        server_ctx.send_control(&server, server_ctx.advertisement()).unwrap();
        link.send_message(b"abc").unwrap();
        let cq = server.completion_queue();
        let wc = loop {
            let wc = cq.next(T).unwrap().unwrap();
            if wc.opcode == WcOpcode::RecvRdmaWithImm {
                break wc;
            }
        };
        assert_eq!(wc.imm_data, Some(3));
        let mut buf = [0u8; 3];
        server_ctx.data.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        server_ctx.send_control(&server, ControlMessage::Done).unwrap();
        loop {
            match listener.get_cm_event(T).unwrap() {
                Some(ListenerEvent::Disconnected(token)) => {
                    assert_eq!(token, server.token());
                    break;
                }
                Some(_) => continue,
                None => panic!("writer did not disconnect after Done"),
            }
        }
        assert!(matches!(
            link.send_message(b"late"),
            Err(TransportError::Disconnected(1))
        ));
        link.close();
        assert!(!faults.is_set());
    }

    #[test]
    fn oversize_message_is_refused_before_the_wire() {
        let fabric = LoopbackFabric::new();
        let config = test_config();
        let remote = addr("10.0.0.2:7000");
        let listener = fabric.listen(remote, 16).unwrap();
        let (link, _server) = thread::scope(|s| {
            let client = s.spawn(|| connect(&fabric, &config, addr("10.0.0.1:0"), remote, 1, 0));
            let server = accept_one(&listener, &config);
            (client.join().unwrap().unwrap(), server)
        });
        // no advertisement yet, the local capacity alone decides
        assert!(matches!(
            link.send_message(&[0u8; 65]),
            Err(TransportError::PayloadTooLarge { peer: 1, len: 65, capacity: 64 })
        ));
    }
}

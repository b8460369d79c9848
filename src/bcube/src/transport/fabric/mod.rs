pub mod config;
pub mod connection;
pub mod context;
pub mod control;
pub mod loopback;
pub mod provider;
mod queue_pair;
pub mod socket;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

pub use config::FabricTransportConfig;
pub use connection::FabricLink;
pub use loopback::LoopbackFabric;
pub use queue_pair::{HostQueue, HostRegion};
pub use socket::SocketFabric;
pub use provider::{
    AccessFlags, CmEventKind, CompletionQueue, ConnParams, FabricEndpoint, FabricListener,
    FabricProvider, ListenerEvent, MemoryRegion, RemoteRegion, WcOpcode, WcStatus,
    WorkCompletion,
};

use super::{
    BindMode, LinkRef, PeerLink, Transport, TransportContext, TransportError, Transporter,
};
use connection::{InboundRegistry, ListenerState};

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Address {0} is already in use")]
    AddrInUse(SocketAddr),
    #[error("Operation not allowed in endpoint state {0}")]
    InvalidState(String),
    #[error("Endpoint is not connected")]
    Disconnected,
    #[error("Completion queue is closed")]
    QueueClosed,
    #[error("Access of {len} bytes at offset {offset} exceeds region of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("No remote write access with rkey {0}")]
    RemoteAccess(u32),
    #[error("Work completion error, wr_id={wr_id}, opcode={opcode:?}, status={status:?}")]
    Completion {
        wr_id: u64,
        opcode: WcOpcode,
        status: WcStatus,
    },
    #[error("Unexpected work completion opcode {0:?}")]
    UnexpectedOpcode(WcOpcode),
    #[error("Invalid control message {0}")]
    InvalidControl(u32),
}

pub struct FabricTransporter<P: FabricProvider> {
    pub provider: P,
    pub config: FabricTransportConfig,
}

impl<P: FabricProvider> FabricTransporter<P> {
    pub fn new(provider: P, config: FabricTransportConfig) -> Self {
        FabricTransporter { provider, config }
    }
}

pub struct FabricTransport<P: FabricProvider> {
    links: HashMap<usize, Arc<FabricLink<P::Endpoint>>>,
    inbound: Arc<InboundRegistry<P::Endpoint>>,
    listeners: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl<P: FabricProvider> FabricTransport<P> {
    pub fn num_inbound(&self) -> usize {
        self.inbound.snapshot().len()
    }
}

fn join_connector<E: FabricEndpoint>(
    handle: JoinHandle<Result<FabricLink<E>, TransportError>>,
) -> Result<FabricLink<E>, TransportError> {
    handle
        .join()
        .map_err(|_| TransportError::Fault("fabric connector panicked".to_string()))?
}

impl<P: FabricProvider> Transporter for FabricTransporter<P> {
    type Transport = FabricTransport<P>;

    fn establish(self, ctx: TransportContext<'_>) -> Result<FabricTransport<P>, TransportError> {
        let config = self.config;
        let provider = self.provider;
        let expected = ctx.expected_inbound();
        let mut transport = FabricTransport {
            links: HashMap::new(),
            inbound: Arc::new(InboundRegistry::new(expected)),
            listeners: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        let listen_addrs = match config.bind {
            BindMode::Wildcard => vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                ctx.listen_port,
            )],
            BindMode::PerLevel => ctx
                .neighbors
                .local_ips
                .iter()
                .map(|ip| SocketAddr::new(IpAddr::V4(*ip), ctx.listen_port))
                .collect(),
        };
        let peers: HashMap<Ipv4Addr, usize> = ctx
            .neighbors
            .iter()
            .map(|(level, node)| (node.ip(level), node.rank))
            .collect();
        for addr in listen_addrs {
            let listener = provider.listen(addr, config.listen_backlog)?;
            let state = ListenerState {
                registry: Arc::clone(&transport.inbound),
                peers: peers.clone(),
                config: config.clone(),
                aggregator: Arc::clone(&ctx.aggregator),
                faults: Arc::clone(&ctx.faults),
                shutdown: Arc::clone(&transport.shutdown),
            };
            let handle = thread::Builder::new()
                .name(format!("bcube-fabric-listen-{}", addr))
                .spawn(move || state.serve(listener))?;
            transport.listeners.push(handle);
        }

        let mut connectors = Vec::with_capacity(ctx.neighbors.len());
        for (level, node) in ctx.neighbors.iter() {
            let local = SocketAddr::new(IpAddr::V4(ctx.neighbors.local_ips[level]), 0);
            let remote = SocketAddr::new(IpAddr::V4(node.ip(level)), ctx.listen_port);
            let provider = provider.clone();
            let config = config.clone();
            let peer = node.rank;
            let handle = thread::Builder::new()
                .name(format!("bcube-fabric-connect-{}", peer))
                .spawn(move || connection::connect(&provider, &config, local, remote, peer, level))?;
            connectors.push(handle);
        }
        let poll_timeout = Duration::from_millis(config.poll_timeout_ms);
        let mut first_err = None;
        for handle in connectors {
            match join_connector(handle) {
                Ok(link) => {
                    let link = Arc::new(link);
                    link.start_poller(poll_timeout, Arc::clone(&ctx.faults))?;
                    transport.links.insert(link.peer(), link);
                }
                Err(e) => {
                    log::error!("Rank {} failed to connect: {}", ctx.rank(), e);
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        let timeout = Duration::from_millis(config.establish_timeout_ms);
        let established = transport
            .inbound
            .wait_established(timeout, || ctx.faults.is_set());
        ctx.faults.check()?;
        if established < expected {
            return Err(TransportError::EstablishTimeout {
                established,
                expected,
                timeout,
            });
        }
        log::info!(
            "Rank {} established {} outbound and {} inbound fabric connections",
            ctx.rank(),
            transport.links.len(),
            established
        );
        Ok(transport)
    }
}

impl<P: FabricProvider> Transport for FabricTransport<P> {
    fn link(&self, node: usize) -> Option<LinkRef> {
        self.links.get(&node).map(|link| Arc::clone(link) as LinkRef)
    }

    fn num_links(&self) -> usize {
        self.links.len()
    }
}

impl<P: FabricProvider> Drop for FabricTransport<P> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for conn in self.inbound.snapshot() {
            conn.close();
        }
        for link in self.links.values() {
            link.close();
        }
        for handle in self.listeners.drain(..) {
            if handle.join().is_err() {
                log::error!("Fabric listener thread panicked");
            }
        }
    }
}

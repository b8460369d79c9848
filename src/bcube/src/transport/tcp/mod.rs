pub mod config;

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, TryRecvError};

pub use config::TcpTransportConfig;

use super::{
    BindMode, FaultSlot, LinkRef, PeerLink, Transport, TransportContext, TransportError,
    Transporter,
};
use crate::aggregator::Aggregator;
use crate::message::{decode, read_frame};
use crate::topology::NeighborSet;
use crate::utils::lock;
use crate::utils::tcp::{self, Hello};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outbound byte stream towards one neighbor.
#[derive(Debug)]
pub struct TcpLink {
    peer: usize,
    level: usize,
    max_message_size: usize,
    stream: Mutex<TcpStream>,
}

impl TcpLink {
    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }
}

impl PeerLink for TcpLink {
    fn peer(&self) -> usize {
        self.peer
    }

    fn send_message(&self, msg: &[u8]) -> Result<(), TransportError> {
        // the reader drops the stream on anything larger
        if msg.len() > self.max_message_size {
            return Err(TransportError::PayloadTooLarge {
                peer: self.peer,
                len: msg.len(),
                capacity: self.max_message_size,
            });
        }
        let mut stream = lock(&self.stream);
        let mut written = 0;
        while written < msg.len() {
            match stream.write(&msg[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("Write to node {} failed: {}", self.peer, e);
                    break;
                }
            }
        }
        if written < msg.len() {
            return Err(TransportError::ShortWrite {
                peer: self.peer,
                written,
                expected: msg.len(),
            });
        }
        Ok(())
    }
}

pub struct TcpTransporter {
    pub config: TcpTransportConfig,
}

impl TcpTransporter {
    pub fn new(config: TcpTransportConfig) -> Self {
        TcpTransporter { config }
    }
}

pub struct TcpTransport {
    links: HashMap<usize, Arc<TcpLink>>,
    // read halves kept to unblock the readers on drop
    inbound: Vec<TcpStream>,
    readers: Vec<JoinHandle<()>>,
}

fn listen_addrs(mode: BindMode, neighbors: &NeighborSet, port: u16) -> Vec<SocketAddr> {
    match mode {
        BindMode::Wildcard => vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)],
        BindMode::PerLevel => neighbors
            .local_ips
            .iter()
            .map(|ip| SocketAddr::new(IpAddr::V4(*ip), port))
            .collect(),
    }
}

fn bind_with_retry(addr: SocketAddr, config: &TcpTransportConfig) -> Result<TcpListener, TransportError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match tcp::listen(&addr, config.listen_backlog) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                return Ok(listener);
            }
            Err(source) if attempts >= config.bind_retries => {
                return Err(TransportError::Bind {
                    addr,
                    attempts,
                    source,
                })
            }
            Err(e) => {
                log::warn!("Bind {} failed ({}), retrying", addr, e);
                thread::sleep(Duration::from_millis(config.bind_retry_interval_ms));
            }
        }
    }
}

fn connect_with_retry(
    local: SocketAddr,
    remote: SocketAddr,
    config: &TcpTransportConfig,
) -> Result<TcpStream, TransportError> {
    for attempt in 1..=config.connect_retries {
        match tcp::connect_from(local.ip(), &remote) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if attempt % 50 == 1 {
                    log::debug!("Connect {} -> {} failed: {}, retrying", local, remote, e);
                }
                thread::sleep(Duration::from_millis(config.connect_retry_interval_ms));
            }
        }
    }
    Err(TransportError::ConnectTimeout {
        local,
        remote,
        attempts: config.connect_retries,
    })
}

fn connect_all(
    neighbors: NeighborSet,
    port: u16,
    config: TcpTransportConfig,
) -> Result<Vec<TcpLink>, TransportError> {
    let mut links = Vec::with_capacity(neighbors.len());
    for (level, node) in neighbors.iter() {
        let local = SocketAddr::new(IpAddr::V4(neighbors.local_ips[level]), 0);
        let remote = SocketAddr::new(IpAddr::V4(node.ip(level)), port);
        let mut stream = connect_with_retry(local, remote, &config)?;
        let hello = Hello {
            magic: config.magic,
            rank: neighbors.rank as u32,
            level: level as u32,
        };
        tcp::write_hello(&mut stream, &hello)?;
        log::debug!("Rank {} connected to {} over level {}", neighbors.rank, node.rank, level);
        links.push(TcpLink {
            peer: node.rank,
            level,
            max_message_size: config.max_message_size,
            stream: Mutex::new(stream),
        });
    }
    Ok(links)
}

fn spawn_reader(
    peer: usize,
    mut stream: TcpStream,
    max_message_size: usize,
    aggregator: Arc<Aggregator>,
    faults: Arc<FaultSlot>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("bcube-tcp-recv-{}", peer))
        .spawn(move || loop {
            let frame = match read_frame(&mut stream, max_message_size) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::debug!("Stream from node {} closed", peer);
                    break;
                }
                Err(e) => {
                    faults.record(&format!("TCP receive from node {}", peer), e);
                    break;
                }
            };
            match decode(&frame) {
                Ok(msg) => {
                    aggregator.insert_message(peer, msg);
                }
                Err(e) => {
                    faults.record(&format!("TCP decode from node {}", peer), e);
                    break;
                }
            }
        })
}

impl Transporter for TcpTransporter {
    type Transport = TcpTransport;

    fn establish(self, ctx: TransportContext<'_>) -> Result<TcpTransport, TransportError> {
        let config = self.config;
        let listeners = listen_addrs(config.bind, ctx.neighbors, ctx.listen_port)
            .into_iter()
            .map(|addr| bind_with_retry(addr, &config))
            .collect::<Result<Vec<_>, _>>()?;

        let (connected_tx, connected_rx) = channel::bounded(1);
        let connector = {
            let neighbors = ctx.neighbors.clone();
            let port = ctx.listen_port;
            let config = config.clone();
            thread::Builder::new()
                .name(format!("bcube-tcp-connect-{}", ctx.rank()))
                .spawn(move || {
                    if connected_tx.send(connect_all(neighbors, port, config)).is_err() {
                        log::warn!("TCP connector finished after establish gave up");
                    }
                })?
        };
        let connector_lost = || TransportError::Fault("TCP connector panicked".to_string());
        let mut outbound = None;

        let expected = ctx.expected_inbound();
        let timeout = Duration::from_millis(config.establish_timeout_ms);
        let hello_timeout = Duration::from_millis(config.hello_timeout_ms);
        let deadline = Instant::now() + timeout;
        let mut accepted: HashMap<usize, TcpStream> = HashMap::with_capacity(expected);
        while accepted.len() < expected {
            // a failed connector fails establish without waiting for inbound
            if outbound.is_none() {
                match connected_rx.try_recv() {
                    Ok(result) => outbound = Some(result?),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => return Err(connector_lost()),
                }
            }
            let mut progress = false;
            for listener in listeners.iter() {
                let Some((stream, hello)) = tcp::try_accept(listener, config.magic, hello_timeout)? else {
                    continue;
                };
                progress = true;
                let peer = hello.rank as usize;
                if ctx.neighbors.level_of(peer) != Some(hello.level as usize) {
                    return Err(TransportError::UnexpectedPeer(format!(
                        "rank {} level {}",
                        hello.rank, hello.level
                    )));
                }
                if accepted.insert(peer, stream).is_some() {
                    return Err(TransportError::DuplicatePeer(peer));
                }
                log::debug!("Rank {} accepted node {}", ctx.rank(), peer);
            }
            if progress {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(TransportError::EstablishTimeout {
                    established: accepted.len(),
                    expected,
                    timeout,
                });
            }
            thread::sleep(ACCEPT_POLL_INTERVAL);
        }

        let outbound = match outbound {
            Some(links) => links,
            None => connected_rx.recv().map_err(|_| connector_lost())??,
        };
        connector.join().map_err(|_| connector_lost())?;

        let mut inbound = Vec::with_capacity(accepted.len());
        let mut readers = Vec::with_capacity(accepted.len());
        for (peer, stream) in accepted {
            inbound.push(stream.try_clone()?);
            readers.push(spawn_reader(
                peer,
                stream,
                config.max_message_size,
                Arc::clone(&ctx.aggregator),
                Arc::clone(&ctx.faults),
            )?);
        }
        let links = outbound
            .into_iter()
            .map(|link| (link.peer, Arc::new(link)))
            .collect::<HashMap<_, _>>();
        log::info!(
            "Rank {} established {} outbound and {} inbound TCP connections",
            ctx.rank(),
            links.len(),
            inbound.len()
        );
        Ok(TcpTransport {
            links,
            inbound,
            readers,
        })
    }
}

impl Transport for TcpTransport {
    fn link(&self, node: usize) -> Option<LinkRef> {
        self.links.get(&node).map(|link| Arc::clone(link) as LinkRef)
    }

    fn num_links(&self) -> usize {
        self.links.len()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for link in self.links.values() {
            let _ = lock(&link.stream).shutdown(Shutdown::Write);
        }
        for stream in self.inbound.iter() {
            let _ = stream.shutdown(Shutdown::Read);
        }
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                log::error!("TCP reader thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn fast_config() -> TcpTransportConfig {
        TcpTransportConfig {
            bind_retries: 2,
            bind_retry_interval_ms: 10,
            connect_retries: 3,
            connect_retry_interval_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn bind_gives_up_on_a_taken_port() {
        // std listeners do not set SO_REUSEPORT, so the port stays taken
        let taken = TcpListener::bind(local(0)).unwrap();
        let addr = taken.local_addr().unwrap();
        match bind_with_retry(addr, &fast_config()) {
            Err(TransportError::Bind { addr: a, attempts: 2, source }) => {
                assert_eq!(a, addr);
                assert_eq!(source.kind(), ErrorKind::AddrInUse);
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn connect_gives_up_after_retries() {
        let port = TcpListener::bind(local(0)).unwrap().local_addr().unwrap().port();
        let start = Instant::now();
        match connect_with_retry(local(0), local(port), &fast_config()) {
            Err(TransportError::ConnectTimeout { remote, attempts: 3, .. }) => {
                assert_eq!(remote, local(port))
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn link_refuses_messages_the_reader_would_drop() {
        let listener = TcpListener::bind(local(0)).unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut inbound, _) = listener.accept().unwrap();
        let link = TcpLink {
            peer: 4,
            level: 1,
            max_message_size: 16,
            stream: Mutex::new(stream),
        };
        assert!(matches!(
            link.send_message(&[0u8; 17]),
            Err(TransportError::PayloadTooLarge { peer: 4, len: 17, capacity: 16 })
        ));
        link.send_message(&[7u8; 16]).unwrap();
        let mut buf = [0u8; 16];
        std::io::Read::read_exact(&mut inbound, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);
    }
}

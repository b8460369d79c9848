use std::fmt::Debug;
use std::sync::Arc;

use super::{FaultSlot, TransportError};
use crate::aggregator::Aggregator;
use crate::topology::{NeighborSet, Topology};

/// Outbound half of a connection to a one-hop neighbor.
pub trait PeerLink: Send + Sync + Debug {
    fn peer(&self) -> usize;

    /// Sends one fully encoded wire message. Either the whole message is
    /// handed to the transport or an error is returned.
    fn send_message(&self, msg: &[u8]) -> Result<(), TransportError>;
}

pub type LinkRef = Arc<dyn PeerLink>;

/// Everything a transport needs to wire up the local rank.
pub struct TransportContext<'a> {
    pub topology: &'a Topology,
    pub neighbors: &'a NeighborSet,
    pub listen_port: u16,
    // inbound fragments are delivered here
    pub aggregator: Arc<Aggregator>,
    pub faults: Arc<FaultSlot>,
}

impl<'a> TransportContext<'a> {
    #[inline]
    pub fn rank(&self) -> usize {
        self.neighbors.rank
    }

    /// Number of inbound connections the server side has to accept.
    #[inline]
    pub fn expected_inbound(&self) -> usize {
        self.topology.edges_per_node()
    }
}

/// Connection establishment for one backend. Consumed once per process.
pub trait Transporter {
    type Transport: Transport;

    fn establish(self, ctx: TransportContext<'_>) -> Result<Self::Transport, TransportError>;
}

/// A transport with every neighbor connection established.
pub trait Transport: Send + Sync {
    fn link(&self, node: usize) -> Option<LinkRef>;

    fn num_links(&self) -> usize;
}

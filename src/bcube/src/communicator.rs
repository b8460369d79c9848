use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::aggregator::{Aggregator, ReceivedFragment};
use crate::config::{CollectiveConfig, Config};
use crate::error::Error;
use crate::pipeline::SendPipeline;
use crate::strategy::{Phase, RoutingParams, StrategyTable};
use crate::tensor::{BlockLayout, DataType, TensorEntry, TensorError};
use crate::topology::{NeighborSet, Topology};
use crate::transport::{FaultSlot, Transport, TransportContext, Transporter};

const FAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One rank of the BCube: its topology view, its links and the collective
/// round that runs over them.
pub struct Communicator<T: Transport> {
    rank: usize,
    topology: Topology,
    neighbors: NeighborSet,
    table: StrategyTable,
    // lanes hold links, so the pipeline goes before the transport
    pipeline: SendPipeline,
    transport: T,
    aggregator: Arc<Aggregator>,
    faults: Arc<FaultSlot>,
    collective: CollectiveConfig,
}

impl<T: Transport> Communicator<T> {
    pub fn init<X>(config: &Config, rank: usize, transporter: X) -> Result<Self, Error>
    where
        X: Transporter<Transport = T>,
    {
        let topo_config = &config.topology;
        let topology = Topology::new(
            topo_config.group_size,
            topo_config.level_count,
            &topo_config.addresses,
        )?;
        let neighbors = NeighborSet::resolve(&topology, rank)?;
        let table = StrategyTable::build(RoutingParams::from_topology(&topology));
        let aggregator = Arc::new(Aggregator::new(table.expected_fragments()));
        let faults = Arc::new(FaultSlot::new());

        let transport = transporter.establish(TransportContext {
            topology: &topology,
            neighbors: &neighbors,
            listen_port: config.listen_port,
            aggregator: Arc::clone(&aggregator),
            faults: Arc::clone(&faults),
        })?;
        let bound = table.local(rank)?.bind(|node| transport.link(node))?;
        let pipeline = SendPipeline::new(
            bound,
            table.total_blocks(),
            table.num_lanes(),
            config.collective.step_timeout(),
            Arc::clone(&faults),
        );
        log::info!(
            "Rank {} ready with {} links, {} steps of {} lanes",
            rank,
            transport.num_links(),
            table.num_steps(),
            table.num_lanes()
        );
        Ok(Communicator {
            rank,
            topology,
            neighbors,
            table,
            pipeline,
            transport,
            aggregator,
            faults,
            collective: config.collective.clone(),
        })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    #[inline]
    pub fn neighbors(&self) -> &NeighborSet {
        &self.neighbors
    }

    #[inline]
    pub fn strategy(&self) -> &StrategyTable {
        &self.table
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Waits for every fragment of `name`, giving up early on a fault.
    fn wait_fragments(&self, name: &str) -> Result<Vec<ReceivedFragment>, Error> {
        let timeout = self.collective.recv_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            self.faults.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::RecvTimeout {
                    name: name.to_string(),
                    timeout,
                });
            }
            let slice = (deadline - now).min(FAULT_POLL_INTERVAL);
            if let Some(fragments) = self.aggregator.wait_completed(name, slice) {
                return Ok(fragments);
            }
        }
    }

    /// Sums `buf` element-wise across all ranks. Every rank must call this
    /// with the same name, type and length; on success every rank holds the
    /// same reduced buffer.
    pub fn all_reduce(&self, name: &str, dtype: DataType, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() % dtype.size() != 0 {
            return Err(TensorError::Misaligned {
                len: buf.len(),
                elem: dtype.size(),
            }
            .into());
        }
        let layout = BlockLayout::new(buf.len() / dtype.size(), dtype.size(), self.table.total_blocks());
        for step in 0..self.table.num_steps() {
            let wire_name = format!("{}@{}", name, step);
            let entry = TensorEntry::new(wire_name.as_str(), dtype, Arc::from(&buf[..]))?;
            self.pipeline.submit(&entry, step)?;
            drop(entry);

            let fragments = self.wait_fragments(&wire_name)?;
            let phase = self.table.phase(step);
            for fragment in fragments {
                let offset = layout.byte_offset(fragment.first_block);
                let range = offset..offset + fragment.payload.len();
                layout.check(&range, buf.len())?;
                match phase {
                    Phase::Scatter => dtype.sum_into(&mut buf[range], &fragment.payload),
                    Phase::Gather => buf[range].copy_from_slice(&fragment.payload),
                }
            }
            log::trace!("Rank {} finished step {} of {}", self.rank, step, name);
        }
        log::debug!("Rank {} reduced {} ({} bytes)", self.rank, name, buf.len());
        Ok(())
    }
}

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bcube::aggregator::Aggregator;
use bcube::message::decode;
use bcube::tensor::DataType;
use bcube::transport::{
    LinkRef, PeerLink, Transport, TransportContext, TransportError, Transporter,
};
use bcube::Communicator;

use common::{expected_sum, input, local_config, run_ranks, GRAD_LEN};

/// Rendezvous of the aggregators of every rank in the process.
#[derive(Default)]
struct Hub {
    aggregators: Mutex<HashMap<usize, Arc<Aggregator>>>,
    registered: Condvar,
}

impl Hub {
    fn lookup(&self, rank: usize) -> Option<Arc<Aggregator>> {
        let aggregators = self.aggregators.lock().unwrap();
        let (aggregators, _) = self
            .registered
            .wait_timeout_while(aggregators, Duration::from_secs(10), |m| {
                !m.contains_key(&rank)
            })
            .unwrap();
        aggregators.get(&rank).cloned()
    }
}

#[derive(Debug)]
struct MemoryLink {
    from: usize,
    to: usize,
    hub: Arc<Hub>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Hub")
    }
}

impl PeerLink for MemoryLink {
    fn peer(&self) -> usize {
        self.to
    }

    fn send_message(&self, msg: &[u8]) -> Result<(), TransportError> {
        let aggregator = self
            .hub
            .lookup(self.to)
            .ok_or(TransportError::Disconnected(self.to))?;
        aggregator.insert_message(self.from, decode(msg)?);
        Ok(())
    }
}

struct MemoryTransporter(Arc<Hub>);

struct MemoryTransport(HashMap<usize, Arc<MemoryLink>>);

impl Transporter for MemoryTransporter {
    type Transport = MemoryTransport;

    fn establish(self, ctx: TransportContext<'_>) -> Result<MemoryTransport, TransportError> {
        let hub = self.0;
        hub.aggregators
            .lock()
            .unwrap()
            .insert(ctx.rank(), Arc::clone(&ctx.aggregator));
        hub.registered.notify_all();
        let links = ctx
            .neighbors
            .iter()
            .map(|(_, node)| {
                let link = MemoryLink {
                    from: ctx.rank(),
                    to: node.rank,
                    hub: Arc::clone(&hub),
                };
                (node.rank, Arc::new(link))
            })
            .collect();
        Ok(MemoryTransport(links))
    }
}

impl Transport for MemoryTransport {
    fn link(&self, node: usize) -> Option<LinkRef> {
        self.0.get(&node).map(|l| Arc::clone(l) as LinkRef)
    }

    fn num_links(&self) -> usize {
        self.0.len()
    }
}

#[test]
fn grad1_reduced_among_nine_nodes() {
    let config = local_config(3, 2, 0);
    let hub = Arc::new(Hub::default());
    let results = run_ranks(9, |rank| {
        let comm = Communicator::init(&config, rank, MemoryTransporter(Arc::clone(&hub))).unwrap();
        assert_eq!(comm.transport().num_links(), 4);
        let mut buf = input(rank, GRAD_LEN);
        comm.all_reduce("grad1", DataType::U8, &mut buf).unwrap();
        buf
    });
    let expected = expected_sum(9, GRAD_LEN);
    for (rank, buf) in results.iter().enumerate() {
        assert_eq!(buf, &expected, "rank {} diverged", rank);
    }
}

#[test]
fn uneven_f32_blocks_and_repeated_rounds() {
    // 75 elements over 18 blocks
    let config = local_config(3, 2, 0);
    let hub = Arc::new(Hub::default());
    let results = run_ranks(9, |rank| {
        let comm = Communicator::init(&config, rank, MemoryTransporter(Arc::clone(&hub))).unwrap();
        let mut rounds = Vec::new();
        for round in 0..3 {
            let mut buf: Vec<u8> = (0..75)
                .flat_map(|i| ((rank * 100 + i + round) as f32).to_le_bytes())
                .collect();
            comm.all_reduce("w", DataType::F32, &mut buf).unwrap();
            rounds.push(buf);
        }
        rounds
    });
    for round in 0..3 {
        let expected: Vec<u8> = (0..75)
            .flat_map(|i| {
                let sum: usize = (0..9).map(|rank| rank * 100 + i + round).sum();
                (sum as f32).to_le_bytes()
            })
            .collect();
        for rounds in results.iter() {
            assert_eq!(rounds[round], expected);
        }
    }
}

#[test]
fn larger_cube() {
    let config = local_config(2, 3, 0);
    let hub = Arc::new(Hub::default());
    let results = run_ranks(8, |rank| {
        let comm = Communicator::init(&config, rank, MemoryTransporter(Arc::clone(&hub))).unwrap();
        let mut buf = input(rank, 1000);
        comm.all_reduce("grad2", DataType::U8, &mut buf).unwrap();
        buf
    });
    let expected = expected_sum(8, 1000);
    assert!(results.iter().all(|buf| *buf == expected));
}

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::message::{encode_fragment, MessageError};
use crate::strategy::{BoundEntry, BoundStrategy};
use crate::tensor::{BlockLayout, TensorEntry};
use crate::transport::{FaultSlot, LinkRef, TransportError};
use crate::utils::lock;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Step {step} out of range for {steps} steps")]
    StepOutOfRange { step: usize, steps: usize },
    #[error("Step {step} did not finish within {timeout:?}")]
    Timeout { step: usize, timeout: Duration },
    #[error("Lane {lane}: {source}")]
    Message {
        lane: usize,
        #[source]
        source: MessageError,
    },
    #[error("Lane {lane}: {source}")]
    Transport {
        lane: usize,
        #[source]
        source: TransportError,
    },
    #[error("Failed to spawn lane: {0}")]
    Spawn(std::io::Error),
    #[error("Pipeline is unusable after a timed out step")]
    Poisoned,
    #[error("Transport: {0}")]
    Fault(#[from] TransportError),
}

struct HandshakeState {
    tensor: Option<TensorEntry>,
    step: usize,
    // bumped on every submit; lanes run once per generation
    generation: u64,
    finished: usize,
    errors: Vec<PipelineError>,
    shutdown: bool,
    poisoned: bool,
}

/// Rendezvous between the submitting caller and the lanes.
struct Handshake {
    state: Mutex<HandshakeState>,
    lane_cv: Condvar,
    done_cv: Condvar,
}

/// Fans a tensor out to the neighbors of every lane in parallel, one lane
/// per level. Lanes start on the first submit and live until drop.
pub struct SendPipeline {
    strategy: Arc<BoundStrategy<LinkRef>>,
    num_blocks: usize,
    num_lanes: usize,
    step_timeout: Duration,
    handshake: Arc<Handshake>,
    lanes: OnceCell<Vec<JoinHandle<()>>>,
    submit_lock: Mutex<()>,
    faults: Arc<FaultSlot>,
}

fn send_entries(
    lane: usize,
    tensor: &TensorEntry,
    layout: &BlockLayout,
    entries: &[BoundEntry<LinkRef>],
) -> Result<(), PipelineError> {
    for entry in entries {
        let buf = encode_fragment(tensor, layout, &entry.route)
            .map_err(|source| PipelineError::Message { lane, source })?;
        entry
            .link
            .send_message(&buf)
            .map_err(|source| PipelineError::Transport { lane, source })?;
        log::trace!(
            "Lane {} sent blocks {:?} of {} to node {}",
            lane,
            entry.route.blocks(),
            tensor.name,
            entry.route.node_id
        );
    }
    Ok(())
}

fn run_lane(lane: usize, strategy: Arc<BoundStrategy<LinkRef>>, num_blocks: usize, handshake: Arc<Handshake>) {
    let mut seen = 0;
    loop {
        let (tensor, step) = {
            let state = lock(&handshake.state);
            let mut state = handshake
                .lane_cv
                .wait_while(state, |s| !s.shutdown && s.generation == seen)
                .unwrap_or_else(|e| e.into_inner());
            if state.shutdown {
                break;
            }
            seen = state.generation;
            match state.tensor.clone() {
                Some(tensor) => (tensor, state.step),
                None => {
                    state.finished += 1;
                    handshake.done_cv.notify_all();
                    continue;
                }
            }
        };

        let layout = BlockLayout::for_tensor(&tensor, num_blocks);
        let entries = strategy
            .lanes(step)
            .and_then(|lanes| lanes.get(lane))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let result = send_entries(lane, &tensor, &layout, entries);
        drop(tensor);

        let mut state = lock(&handshake.state);
        if state.generation == seen {
            if let Err(e) = result {
                state.errors.push(e);
            }
            state.finished += 1;
            handshake.done_cv.notify_all();
        }
    }
    log::trace!("Lane {} exits", lane);
}

impl SendPipeline {
    pub fn new(
        strategy: BoundStrategy<LinkRef>,
        num_blocks: usize,
        num_lanes: usize,
        step_timeout: Duration,
        faults: Arc<FaultSlot>,
    ) -> Self {
        SendPipeline {
            strategy: Arc::new(strategy),
            num_blocks,
            num_lanes,
            step_timeout,
            handshake: Arc::new(Handshake {
                state: Mutex::new(HandshakeState {
                    tensor: None,
                    step: 0,
                    generation: 0,
                    finished: 0,
                    errors: Vec::new(),
                    shutdown: false,
                    poisoned: false,
                }),
                lane_cv: Condvar::new(),
                done_cv: Condvar::new(),
            }),
            lanes: OnceCell::new(),
            submit_lock: Mutex::new(()),
            faults,
        }
    }

    #[inline]
    pub fn num_lanes(&self) -> usize {
        self.num_lanes
    }

    fn spawn_lanes(&self) -> Result<Vec<JoinHandle<()>>, PipelineError> {
        (0..self.num_lanes)
            .map(|lane| {
                let strategy = Arc::clone(&self.strategy);
                let handshake = Arc::clone(&self.handshake);
                let num_blocks = self.num_blocks;
                thread::Builder::new()
                    .name(format!("bcube-lane-{}", lane))
                    .spawn(move || run_lane(lane, strategy, num_blocks, handshake))
                    .map_err(PipelineError::Spawn)
            })
            .collect()
    }

    /// Sends the part of `tensor` that `step` assigns to this rank and
    /// returns once every lane finished.
    pub fn submit(&self, tensor: &TensorEntry, step: usize) -> Result<(), PipelineError> {
        let steps = self.strategy.num_steps();
        if step >= steps {
            return Err(PipelineError::StepOutOfRange { step, steps });
        }
        self.faults.check()?;
        let _submit = lock(&self.submit_lock);
        self.lanes.get_or_try_init(|| self.spawn_lanes())?;

        let mut state = lock(&self.handshake.state);
        if state.poisoned {
            return Err(PipelineError::Poisoned);
        }
        state.tensor = Some(tensor.clone());
        state.step = step;
        state.generation += 1;
        state.finished = 0;
        state.errors.clear();
        self.handshake.lane_cv.notify_all();

        let num_lanes = self.num_lanes;
        let (mut state, wait) = self
            .handshake
            .done_cv
            .wait_timeout_while(state, self.step_timeout, |s| s.finished < num_lanes)
            .unwrap_or_else(|e| e.into_inner());
        state.tensor = None;
        if wait.timed_out() && state.finished < num_lanes {
            state.poisoned = true;
            return Err(PipelineError::Timeout {
                step,
                timeout: self.step_timeout,
            });
        }
        let errors = std::mem::take(&mut state.errors);
        drop(state);
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for SendPipeline {
    fn drop(&mut self) {
        lock(&self.handshake.state).shutdown = true;
        self.handshake.lane_cv.notify_all();
        if let Some(lanes) = self.lanes.take() {
            for lane in lanes {
                if lane.join().is_err() {
                    log::error!("Pipeline lane panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::message::decode;
    use crate::strategy::{RoutingParams, StrategyTable};
    use crate::tensor::DataType;
    use crate::transport::PeerLink;

    #[derive(Debug)]
    struct Recorder {
        peer: usize,
        sent: Mutex<Vec<Vec<u8>>>,
        fail: bool,
        delay: Duration,
    }

    impl PeerLink for Recorder {
        fn peer(&self) -> usize {
            self.peer
        }

        fn send_message(&self, msg: &[u8]) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Disconnected(self.peer));
            }
            thread::sleep(self.delay);
            lock(&self.sent).push(msg.to_vec());
            Ok(())
        }
    }

    fn pipeline(rank: usize, failing: Option<usize>) -> (SendPipeline, HashMap<usize, Arc<Recorder>>) {
        pipeline_with(rank, failing, Duration::ZERO, Duration::from_secs(10))
    }

    fn pipeline_with(
        rank: usize,
        failing: Option<usize>,
        delay: Duration,
        step_timeout: Duration,
    ) -> (SendPipeline, HashMap<usize, Arc<Recorder>>) {
        let table = StrategyTable::build(RoutingParams {
            group_size: 3,
            level_count: 2,
            node_count: 9,
        });
        let mut links = HashMap::new();
        let bound = table
            .local(rank)
            .unwrap()
            .bind(|node| {
                let link = links
                    .entry(node)
                    .or_insert_with(|| {
                        Arc::new(Recorder {
                            peer: node,
                            sent: Mutex::new(Vec::new()),
                            fail: failing == Some(node),
                            delay,
                        })
                    })
                    .clone();
                Some(link as LinkRef)
            })
            .unwrap();
        let pipeline = SendPipeline::new(
            bound,
            table.total_blocks(),
            table.num_lanes(),
            step_timeout,
            Arc::new(FaultSlot::new()),
        );
        (pipeline, links)
    }

    fn tensor() -> TensorEntry {
        let data: Arc<[u8]> = (0..300u32).map(|i| i as u8).collect::<Vec<_>>().into();
        TensorEntry::new("grad1", DataType::U8, data).unwrap()
    }

    #[test]
    fn every_step_reaches_each_neighbor_once_per_lane() {
        let (pipeline, links) = pipeline(4, None);
        for step in 0..4 {
            pipeline.submit(&tensor(), step).unwrap();
        }
        // rank 4 talks to 3, 5 on level 0 and 1, 7 on level 1
        let mut peers: Vec<_> = links.keys().copied().collect();
        peers.sort_unstable();
        assert_eq!(peers, vec![1, 3, 5, 7]);
        for link in links.values() {
            let sent = lock(&link.sent);
            // exactly one lane walks each level per step
            assert_eq!(sent.len(), 4);
            for msg in sent.iter() {
                assert_eq!(decode(msg).unwrap().name, "grad1");
            }
        }
    }

    #[test]
    fn lane_error_is_reported() {
        let (pipeline, _links) = pipeline(4, Some(5));
        let err = (0..4)
            .map(|step| pipeline.submit(&tensor(), step))
            .find_map(Result::err)
            .unwrap();
        assert!(matches!(
            err,
            PipelineError::Transport {
                source: TransportError::Disconnected(5),
                ..
            }
        ));
    }

    #[test]
    fn slow_step_times_out_and_poisons() {
        let (pipeline, _links) = pipeline_with(4, None, Duration::from_millis(300), Duration::from_millis(50));
        assert!(matches!(
            pipeline.submit(&tensor(), 0),
            Err(PipelineError::Timeout { step: 0, .. })
        ));
        assert!(matches!(pipeline.submit(&tensor(), 1), Err(PipelineError::Poisoned)));
    }

    #[test]
    fn reported_fault_stops_submit() {
        let (pipeline, links) = pipeline(4, None);
        pipeline.faults.record("Receive poller of node 3", "wc status error");
        assert!(matches!(
            pipeline.submit(&tensor(), 0),
            Err(PipelineError::Fault(TransportError::Fault(_)))
        ));
        assert!(links.values().all(|link| lock(&link.sent).is_empty()));
    }

    #[test]
    fn step_out_of_range() {
        let (pipeline, _links) = pipeline(0, None);
        assert!(matches!(
            pipeline.submit(&tensor(), 4),
            Err(PipelineError::StepOutOfRange { step: 4, steps: 4 })
        ));
    }
}

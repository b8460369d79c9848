use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::message::FragmentMessage;
use crate::utils::lock;

/// One inbound piece of a named tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFragment {
    pub name: String,
    pub first_block: usize,
    pub payload: Vec<u8>,
    // rank of the sender
    pub origin: usize,
    pub arrival: u64,
}

/// Accumulates fragments per tensor name until `expected` of them arrived,
/// then publishes the whole set to the completed map.
///
/// The pending and completed maps have their own locks, which are never held
/// at the same time.
pub struct Aggregator {
    expected: usize,
    arrivals: AtomicU64,
    pending: Mutex<HashMap<String, Vec<ReceivedFragment>>>,
    completed: Mutex<HashMap<String, Vec<ReceivedFragment>>>,
    completed_cv: Condvar,
}

impl Aggregator {
    pub fn new(expected: usize) -> Self {
        assert!(expected > 0);
        Aggregator {
            expected,
            arrivals: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            completed_cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn insert_message(&self, origin: usize, msg: FragmentMessage) -> bool {
        let fragment = ReceivedFragment {
            name: msg.name,
            first_block: msg.first_block,
            payload: msg.payload,
            origin,
            arrival: self.arrivals.fetch_add(1, Ordering::Relaxed),
        };
        self.insert(fragment)
    }

    /// Returns true when this fragment completed its tensor.
    pub fn insert(&self, fragment: ReceivedFragment) -> bool {
        let name = fragment.name.clone();
        let ready = {
            let mut pending = lock(&self.pending);
            let fragments = pending.entry(name.clone()).or_default();
            fragments.push(fragment);
            if fragments.len() == self.expected {
                pending.remove(&name)
            } else {
                None
            }
        };
        let Some(fragments) = ready else {
            return false;
        };
        log::trace!("Tensor {} received all {} fragments", name, self.expected);
        let mut completed = lock(&self.completed);
        match completed.get_mut(&name) {
            Some(existing) => {
                log::warn!("Tensor {} completed again before being drained", name);
                existing.extend(fragments);
            }
            None => {
                completed.insert(name, fragments);
            }
        }
        drop(completed);
        self.completed_cv.notify_all();
        true
    }

    pub fn pending_len(&self, name: &str) -> usize {
        lock(&self.pending).get(name).map_or(0, Vec::len)
    }

    pub fn is_completed(&self, name: &str) -> bool {
        lock(&self.completed).contains_key(name)
    }

    pub fn take_completed(&self, name: &str) -> Option<Vec<ReceivedFragment>> {
        lock(&self.completed).remove(name)
    }

    pub fn drain_completed(&self) -> HashMap<String, Vec<ReceivedFragment>> {
        std::mem::take(&mut *lock(&self.completed))
    }

    /// Blocks until `name` completes or `timeout` passes.
    pub fn wait_completed(&self, name: &str, timeout: Duration) -> Option<Vec<ReceivedFragment>> {
        let completed = lock(&self.completed);
        let (mut completed, _) = self
            .completed_cv
            .wait_timeout_while(completed, timeout, |map| !map.contains_key(name))
            .unwrap_or_else(|e| e.into_inner());
        completed.remove(name)
    }
}

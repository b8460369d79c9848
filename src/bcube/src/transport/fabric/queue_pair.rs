//! Host-memory building blocks shared by the software providers: a table of
//! registered regions addressed by rkey, completion queues, and the receive
//! side of a queue pair.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use super::provider::{
    AccessFlags, CompletionQueue, MemoryRegion, RemoteRegion, WcOpcode, WcStatus, WorkCompletion,
};
use super::FabricError;
use crate::utils::lock;

/// Registered regions of one provider instance.
pub(super) struct RegionTable {
    regions: Mutex<HashMap<u32, Weak<RegionInner>>>,
    next_rkey: AtomicU32,
    live: AtomicUsize,
}

impl RegionTable {
    pub(super) fn new() -> Self {
        RegionTable {
            regions: Mutex::new(HashMap::new()),
            next_rkey: AtomicU32::new(1),
            live: AtomicUsize::new(0),
        }
    }

    pub(super) fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(super) fn register(self: &Arc<Self>, len: usize, access: AccessFlags) -> HostRegion {
        let rkey = self.next_rkey.fetch_add(1, Ordering::Relaxed);
        let region = Arc::new(RegionInner {
            rkey,
            base: (rkey as u64) << 32,
            access,
            data: Mutex::new(vec![0u8; len]),
            table: Arc::clone(self),
        });
        lock(&self.regions).insert(rkey, Arc::downgrade(&region));
        self.live.fetch_add(1, Ordering::SeqCst);
        HostRegion(region)
    }

    /// Performs the target side of a remote write.
    pub(super) fn write_remote(&self, remote: RemoteRegion, bytes: &[u8]) -> Result<(), FabricError> {
        let target = lock(&self.regions)
            .get(&remote.rkey)
            .and_then(Weak::upgrade)
            .filter(|r| r.access.contains(AccessFlags::REMOTE_WRITE))
            .ok_or(FabricError::RemoteAccess(remote.rkey))?;
        let offset = remote
            .addr
            .checked_sub(target.base)
            .ok_or(FabricError::RemoteAccess(remote.rkey))? as usize;
        target.write_at(offset, bytes)
    }
}

pub(super) struct RegionInner {
    rkey: u32,
    base: u64,
    access: AccessFlags,
    data: Mutex<Vec<u8>>,
    table: Arc<RegionTable>,
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        lock(&self.table.regions).remove(&self.rkey);
        self.table.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RegionInner {
    fn check(offset: usize, len: usize, capacity: usize) -> Result<(), FabricError> {
        match offset.checked_add(len) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(FabricError::OutOfBounds {
                offset,
                len,
                capacity,
            }),
        }
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> Result<(), FabricError> {
        let mut data = lock(&self.data);
        Self::check(offset, src.len(), data.len())?;
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<(), FabricError> {
        let data = lock(&self.data);
        Self::check(offset, dst.len(), data.len())?;
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }
}

/// Region registered in host memory. Dropping it deregisters it.
pub struct HostRegion(Arc<RegionInner>);

impl HostRegion {
    pub(super) fn check(&self, offset: usize, len: usize) -> Result<(), FabricError> {
        RegionInner::check(offset, len, self.len())
    }

    pub(super) fn downgrade(&self) -> Weak<RegionInner> {
        Arc::downgrade(&self.0)
    }
}

impl MemoryRegion for HostRegion {
    fn len(&self) -> usize {
        lock(&self.0.data).len()
    }

    fn remote(&self) -> RemoteRegion {
        RemoteRegion {
            addr: self.0.base,
            rkey: self.0.rkey,
            len: self.len() as u64,
        }
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), FabricError> {
        self.0.write_at(offset, data)
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), FabricError> {
        self.0.read_at(offset, buf)
    }
}

/// Completion queue backed by a channel. Closed once every sender is gone
/// and the remaining completions are drained.
#[derive(Clone)]
pub struct HostQueue(Receiver<WorkCompletion>);

impl CompletionQueue for HostQueue {
    fn next(&self, timeout: Duration) -> Result<Option<WorkCompletion>, FabricError> {
        match self.0.recv_timeout(timeout) {
            Ok(wc) => Ok(Some(wc)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(FabricError::QueueClosed),
        }
    }
}

pub(super) enum Delivery {
    Send(Vec<u8>),
    WriteImm { imm: u32, len: usize },
}

pub(super) struct PostedRecv {
    pub(super) wr_id: u64,
    pub(super) region: Weak<RegionInner>,
    pub(super) offset: usize,
    pub(super) len: usize,
}

/// Receive queue and completion sink of one queue pair. Callers keep it
/// under the queue pair lock, so completions are queued in delivery order.
pub(super) struct RecvQueue {
    posted: VecDeque<PostedRecv>,
    // deliveries that arrived before a receive was posted
    unexpected: VecDeque<Delivery>,
    completions: Option<Sender<WorkCompletion>>,
}

impl RecvQueue {
    pub(super) fn new() -> (Self, HostQueue) {
        let (tx, rx) = channel::unbounded();
        let queue = RecvQueue {
            posted: VecDeque::new(),
            unexpected: VecDeque::new(),
            completions: Some(tx),
        };
        (queue, HostQueue(rx))
    }

    pub(super) fn push(&self, wc: WorkCompletion) {
        if let Some(tx) = &self.completions {
            if tx.send(wc).is_err() {
                log::warn!("Completion queue dropped, wr_id={}", wc.wr_id);
            }
        }
    }

    pub(super) fn post(&mut self, recv: PostedRecv) {
        match self.unexpected.pop_front() {
            Some(delivery) => self.complete(recv, delivery),
            None => self.posted.push_back(recv),
        }
    }

    pub(super) fn deliver(&mut self, delivery: Delivery) {
        match self.posted.pop_front() {
            Some(recv) => self.complete(recv, delivery),
            None => self.unexpected.push_back(delivery),
        }
    }

    /// Drops pending work and closes the completion queue.
    pub(super) fn close(&mut self) {
        self.posted.clear();
        self.unexpected.clear();
        self.completions = None;
    }

    fn complete(&self, recv: PostedRecv, delivery: Delivery) {
        let mut wc = WorkCompletion {
            wr_id: recv.wr_id,
            opcode: WcOpcode::Recv,
            status: WcStatus::Success,
            byte_len: 0,
            imm_data: None,
        };
        match delivery {
            Delivery::Send(bytes) => {
                wc.byte_len = bytes.len();
                wc.status = match recv.region.upgrade() {
                    None => WcStatus::Flushed,
                    Some(_) if bytes.len() > recv.len => WcStatus::LocalLength,
                    Some(region) => match region.write_at(recv.offset, &bytes) {
                        Ok(()) => WcStatus::Success,
                        Err(_) => WcStatus::LocalLength,
                    },
                };
            }
            Delivery::WriteImm { imm, len } => {
                wc.opcode = WcOpcode::RecvRdmaWithImm;
                wc.byte_len = len;
                wc.imm_data = Some(imm);
            }
        }
        self.push(wc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drains_before_closing() {
        let table = Arc::new(RegionTable::new());
        let region = table.register(8, AccessFlags::LOCAL_WRITE);
        let (mut rq, cq) = RecvQueue::new();
        rq.deliver(Delivery::Send(vec![1, 2]));
        assert!(cq.next(Duration::from_millis(10)).unwrap().is_none());
        rq.post(PostedRecv {
            wr_id: 9,
            region: region.downgrade(),
            offset: 0,
            len: 8,
        });
        rq.close();
        let wc = cq.next(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!((wc.wr_id, wc.byte_len, wc.status), (9, 2, WcStatus::Success));
        assert!(matches!(cq.next(Duration::from_secs(1)), Err(FabricError::QueueClosed)));
        assert_eq!(table.live(), 1);
        drop(region);
        assert_eq!(table.live(), 0);
    }
}

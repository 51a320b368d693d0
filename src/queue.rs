//! Bounded work queue
//!
//! Stores the work units advertised by the server and partitions them into
//! exclusive nonce ranges. Detects block transitions and defers range requests
//! while the backlog is empty.
//!
//! The queue lives on the control context and never talks to the connection or
//! the orchestrator directly: side effects are recorded as [`QueueSignal`]s
//! that the owner drains after every call with [`WorkQueue::take_signals`].

use crate::types::{AdvertisedWork, BlockId, NonceRange, WorkUnit, MAX_NONCES};
use crate::utils::clamp;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Smallest range the queue hands out
pub const MIN_RANGE_SIZE: u64 = 256;

/// Largest range the queue hands out
pub const MAX_RANGE_SIZE: u64 = MAX_NONCES;

/// Range size used when a kernel does not ask for one
pub const DEFAULT_RANGE_SIZE: u64 = 0x10000;

/// Identifies a stale-work subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

/// Called with the new block identifier whenever queued work goes stale
pub type StaleSubscriber = Box<dyn FnMut(&BlockId) + Send>;

/// Side effects requested by the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSignal {
    /// The backlog is short; ask the connection for more work
    RequestWork,
    /// The miner became idle (`true`) or has work again (`false`)
    Idle(bool),
}

/// Outcome of a range request
#[derive(Debug)]
pub enum RangeFetch {
    /// A range was carved immediately
    Ready(NonceRange),
    /// No work is queued; the receiver resolves once work arrives
    Pending(oneshot::Receiver<NonceRange>),
}

/// Partitioning cursor over the unit currently being handed out
#[derive(Debug)]
struct Cursor {
    unit: Arc<WorkUnit>,
    base: u64,
}

/// Backlog of work units plus the block epoch they belong to
pub struct WorkQueue {
    depth: usize,
    backlog: VecDeque<Arc<WorkUnit>>,
    cursor: Option<Cursor>,
    deferred: VecDeque<(oneshot::Sender<NonceRange>, u64)>,
    block: Option<BlockId>,
    last_block: Option<BlockId>,
    subscribers: Vec<(SubscriberId, StaleSubscriber)>,
    signals: Vec<QueueSignal>,
}

impl WorkQueue {
    /// Create a queue keeping at most `depth` units
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            backlog: VecDeque::with_capacity(depth.max(1)),
            cursor: None,
            deferred: VecDeque::new(),
            block: None,
            last_block: None,
            subscribers: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// Configured backlog depth
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of units waiting in the backlog
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Number of deferred range requests
    pub fn pending_len(&self) -> usize {
        self.deferred.len()
    }

    /// Current block
    pub fn block(&self) -> Option<&BlockId> {
        self.block.as_ref()
    }

    /// Block before the current one
    pub fn last_block(&self) -> Option<&BlockId> {
        self.last_block.as_ref()
    }

    /// Drain the side effects recorded since the last call, in order
    pub fn take_signals(&mut self) -> Vec<QueueSignal> {
        std::mem::take(&mut self.signals)
    }

    /// Whether a range belongs to a block other than the current one
    pub fn is_range_stale(&self, range: &NonceRange) -> bool {
        self.block.as_ref() != Some(&range.unit().identifier)
    }

    /// Register a stale-work subscriber; adding the same id twice is a no-op
    pub fn add_stale_subscriber(&mut self, id: SubscriberId, subscriber: StaleSubscriber) {
        if !self.subscribers.iter().any(|(existing, _)| *existing == id) {
            self.subscribers.push((id, subscriber));
        }
    }

    /// Remove a stale-work subscriber; unknown ids are ignored
    pub fn remove_stale_subscriber(&mut self, id: SubscriberId) {
        self.subscribers.retain(|(existing, _)| *existing != id);
    }

    /// Number of registered stale-work subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Accept work advertised by the server
    pub fn store_work(&mut self, work: &AdvertisedWork) {
        if self.last_block.as_ref() == Some(&work.identifier) {
            debug!(block = %work.identifier, "Server gave work from the previous block, ignoring");
            self.request_if_short();
            return;
        }

        let new_block = self.block.as_ref() != Some(&work.identifier);
        if new_block {
            self.backlog.clear();
            self.cursor = None;
            self.last_block = self.block.replace(work.identifier.clone());
            debug!(block = %work.identifier, "New block (work queue)");
        }

        self.signals.push(QueueSignal::Idle(false));

        match WorkUnit::from_advertised(work) {
            Ok(unit) => {
                if self.backlog.len() >= self.depth {
                    self.backlog.pop_front();
                }
                self.backlog.push_back(Arc::new(unit));
            }
            Err(e) => debug!("Dropping malformed work: {}", e),
        }

        self.request_if_short();

        if new_block {
            for (_, subscriber) in self.subscribers.iter_mut() {
                subscriber(&work.identifier);
            }
        }

        // Resolving a request can defer it again, so only the requests that
        // were pending on entry get one attempt each.
        let pending = self.deferred.len();
        for _ in 0..pending {
            let Some((reply, size)) = self.deferred.pop_front() else {
                break;
            };
            if reply.is_closed() {
                continue;
            }
            self.fetch_range_into(size, reply);
        }
    }

    /// Request a range of `size` nonces (clamped to the allowed bounds)
    pub fn fetch_range(&mut self, size: u64) -> RangeFetch {
        let (reply, mut receiver) = oneshot::channel();
        self.fetch_range_into(size, reply);
        match receiver.try_recv() {
            Ok(range) => RangeFetch::Ready(range),
            Err(_) => RangeFetch::Pending(receiver),
        }
    }

    /// Request a range and deliver it through `reply`, now or once work arrives
    pub fn fetch_range_into(&mut self, size: u64, reply: oneshot::Sender<NonceRange>) {
        if reply.is_closed() {
            return;
        }
        let size = clamp(size, MIN_RANGE_SIZE, MAX_RANGE_SIZE);

        match self.next_range(size) {
            Some(range) => {
                let _ = reply.send(range);
            }
            None => {
                self.signals.push(QueueSignal::RequestWork);
                self.signals.push(QueueSignal::Idle(true));
                self.deferred.push_back((reply, size));
            }
        }
    }

    fn next_range(&mut self, size: u64) -> Option<NonceRange> {
        if self.cursor.is_none() {
            let unit = self.backlog.pop_front()?;
            // Taking a unit always leaves the backlog short of its depth
            self.signals.push(QueueSignal::RequestWork);
            self.cursor = Some(Cursor { unit, base: 0 });
        }

        let cursor = self.cursor.as_mut()?;
        let take = size.min(cursor.unit.nonces - cursor.base);
        let range = NonceRange::new(Arc::clone(&cursor.unit), cursor.base, take);
        cursor.base += take;

        let exhausted = cursor.base >= cursor.unit.nonces;
        if exhausted {
            self.cursor = None;
        }
        Some(range)
    }

    fn request_if_short(&mut self) {
        if self.backlog.len() < self.depth {
            self.signals.push(QueueSignal::RequestWork);
        }
    }
}

//! Double-buffered queue reader
//!
//! A [`QueueReader`] keeps the next nonce range fetched and preprocessed so a
//! dedicated compute thread never waits on the control context. It is split
//! in two halves when started:
//!
//! - a control task on the tokio runtime that fetches ranges, reacts to stale
//!   notifications and records execution samples;
//! - a [`ReaderFeed`] iterator consumed by the compute thread.
//!
//! The halves share a depth-1 handoff slot and talk over a per-reader event
//! channel.

use crate::interface::{CoreInterface, KernelInterface};
use crate::queue::SubscriberId;
use crate::types::{BlockId, NonceRange};
use crate::Result;
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Number of execution samples averaged for calibration
pub const SAMPLES: usize = 3;

/// Turns a range into whatever the compute loop consumes
pub type Preprocessor<P> = Box<dyn FnMut(&NonceRange) -> P + Send>;

/// Chooses the next fetch size from `(average execution time, last size)`
///
/// Called with `(None, None)` when the reader starts. Returning `None` falls
/// back to the default range size.
pub type WorkSizer = Box<dyn FnMut(Option<Duration>, Option<u64>) -> Option<u64> + Send>;

/// Contents of the handoff slot
enum Handoff<P> {
    Work(P, NonceRange),
    Stop,
}

/// Messages posted to a reader's control task
#[derive(Debug)]
enum ReaderEvent {
    /// The compute thread finished a range
    Executed { elapsed: Duration, range: NonceRange },
    /// The compute thread took the slot contents
    Consumed,
    /// The queue switched to a new block
    Stale(BlockId),
    /// An outstanding fetch completed
    Fetched(Result<NonceRange>),
    /// Tear the reader down
    Stop,
}

/// Tracks recent execution times and the calibrated fetch size
pub struct ExecutionSizer {
    samples: VecDeque<Duration>,
    sizer: Option<WorkSizer>,
    size: Option<u64>,
}

impl ExecutionSizer {
    /// Create a sizer; without a sizing function the size stays uncalibrated
    pub fn new(sizer: Option<WorkSizer>) -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLES),
            sizer,
            size: None,
        }
    }

    /// Requested fetch size, `None` until calibrated
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Forget samples and ask the sizing function for an initial size
    pub fn reset(&mut self) {
        self.samples.clear();
        if let Some(sizer) = self.sizer.as_mut() {
            self.size = sizer(None, None);
        }
    }

    /// Record one execution of `size` nonces
    pub fn record(&mut self, elapsed: Duration, size: u64) {
        self.samples.push_back(elapsed);
        while self.samples.len() > SAMPLES {
            self.samples.pop_front();
        }

        if self.samples.len() == SAMPLES {
            let average = self.samples.iter().sum::<Duration>() / SAMPLES as u32;
            if let Some(sizer) = self.sizer.as_mut() {
                self.size = sizer(Some(average), Some(size));
            }
        }
    }
}

/// Builder for one core's reader
pub struct QueueReader<P> {
    core: CoreInterface,
    preprocessor: Preprocessor<P>,
    sizer: Option<WorkSizer>,
}

impl QueueReader<NonceRange> {
    /// Reader that hands ranges to the compute loop unchanged
    pub fn passthrough(core: CoreInterface) -> Self {
        Self::new(core, NonceRange::clone)
    }
}

impl<P: Send + 'static> QueueReader<P> {
    /// Create a reader for `core` preprocessing every range with `preprocessor`
    pub fn new<F>(core: CoreInterface, preprocessor: F) -> Self
    where
        F: FnMut(&NonceRange) -> P + Send + 'static,
    {
        Self {
            core,
            preprocessor: Box::new(preprocessor),
            sizer: None,
        }
    }

    /// Calibrate fetch sizes with `sizer`
    pub fn with_work_sizer<F>(mut self, sizer: F) -> Self
    where
        F: FnMut(Option<Duration>, Option<u64>) -> Option<u64> + Send + 'static,
    {
        self.sizer = Some(Box::new(sizer));
        self
    }

    /// Start prefetching; must be called from within the tokio runtime
    pub fn start(self) -> (ReaderHandle, ReaderFeed<P>) {
        let (slot_tx, slot_rx) = crossbeam_channel::bounded(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let interface = self.core.interface().clone();

        let mut control = ReaderControl {
            core: self.core,
            interface: interface.clone(),
            preprocessor: self.preprocessor,
            sizer: ExecutionSizer::new(self.sizer),
            slot_tx,
            slot_rx: slot_rx.clone(),
            events: events_tx.clone(),
            in_flight: false,
            latest_block: None,
            subscription: None,
        };
        control.sizer.reset();
        control.request_more();

        let stale_events = events_tx.clone();
        control.subscription = Some(interface.add_stale_callback(Box::new(
            move |block: &BlockId| {
                let _ = stale_events.send(ReaderEvent::Stale(block.clone()));
            },
        )));

        tokio::spawn(control.run(events_rx));

        let handle = ReaderHandle {
            events: events_tx.clone(),
        };
        let feed = ReaderFeed {
            slot: slot_rx,
            events: events_tx,
            current: None,
            started_at: None,
            finished: false,
        };
        (handle, feed)
    }
}

/// Control-side handle used by the kernel to stop a reader
#[derive(Clone)]
pub struct ReaderHandle {
    events: mpsc::UnboundedSender<ReaderEvent>,
}

impl ReaderHandle {
    /// Drain the slot and terminate the compute loop at its next poll
    pub fn stop(&self) {
        let _ = self.events.send(ReaderEvent::Stop);
    }
}

struct ReaderControl<P> {
    core: CoreInterface,
    interface: KernelInterface,
    preprocessor: Preprocessor<P>,
    sizer: ExecutionSizer,
    slot_tx: Sender<Handoff<P>>,
    slot_rx: Receiver<Handoff<P>>,
    events: mpsc::UnboundedSender<ReaderEvent>,
    in_flight: bool,
    latest_block: Option<BlockId>,
    subscription: Option<SubscriberId>,
}

impl<P: Send + 'static> ReaderControl<P> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ReaderEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ReaderEvent::Executed { elapsed, range } => self.ran_execution(elapsed, &range),
                ReaderEvent::Consumed => self.request_more(),
                ReaderEvent::Stale(block) => self.on_stale(block),
                ReaderEvent::Fetched(result) => self.on_fetched(result),
                ReaderEvent::Stop => break,
            }
        }
        self.shutdown();
    }

    fn request_more(&mut self) {
        if self.in_flight || self.slot_tx.is_full() {
            return;
        }
        self.in_flight = true;

        let interface = self.interface.clone();
        let events = self.events.clone();
        let size = self.sizer.size();
        tokio::spawn(async move {
            let result = interface.fetch_range(size).await;
            let _ = events.send(ReaderEvent::Fetched(result));
        });
    }

    fn on_fetched(&mut self, result: Result<NonceRange>) {
        self.in_flight = false;

        let range = match result {
            Ok(range) => range,
            Err(e) => {
                debug!("Range fetch abandoned: {}", e);
                return;
            }
        };

        if let Some(latest) = &self.latest_block {
            if range.unit().identifier != *latest {
                debug!(block = %range.unit().identifier, "Discarding range from an old block");
                self.request_more();
                return;
            }
        }

        let payload = (self.preprocessor)(&range);
        if self.slot_tx.try_send(Handoff::Work(payload, range)).is_err() {
            debug!("Handoff slot already filled, dropping range");
        }
    }

    fn on_stale(&mut self, block: BlockId) {
        self.latest_block = Some(block);

        // With an empty slot the next range is either in flight or about to
        // be requested by the compute thread.
        if self.slot_rx.try_recv().is_ok() {
            debug!("Discarding prefetched work from the previous block");
            self.request_more();
        }
    }

    fn ran_execution(&mut self, elapsed: Duration, range: &NonceRange) {
        let seconds = elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.core.update_rate(range.size() as f64 / seconds);
        }
        self.sizer.record(elapsed, range.size());
    }

    fn shutdown(&mut self) {
        while self.slot_rx.try_recv().is_ok() {}
        let _ = self.slot_tx.try_send(Handoff::Stop);

        if let Some(id) = self.subscription.take() {
            self.interface.remove_stale_callback(id);
        }
    }
}

/// Compute-side iterator over preprocessed ranges
///
/// Blocks until the next range is available and ends once the reader is
/// stopped. Every call also reports the previous range as executed.
pub struct ReaderFeed<P> {
    slot: Receiver<Handoff<P>>,
    events: mpsc::UnboundedSender<ReaderEvent>,
    current: Option<NonceRange>,
    started_at: Option<Instant>,
    finished: bool,
}

impl<P> Iterator for ReaderFeed<P> {
    type Item = P;

    fn next(&mut self) -> Option<P> {
        if self.finished {
            return None;
        }

        let now = Instant::now();
        if let (Some(range), Some(started_at)) = (self.current.take(), self.started_at) {
            let _ = self.events.send(ReaderEvent::Executed {
                elapsed: now.duration_since(started_at),
                range,
            });
        }
        self.started_at = Some(now);

        match self.slot.recv() {
            Ok(Handoff::Work(payload, range)) => {
                self.current = Some(range);
                let _ = self.events.send(ReaderEvent::Consumed);
                Some(payload)
            }
            Ok(Handoff::Stop) | Err(_) => {
                self.finished = true;
                None
            }
        }
    }
}

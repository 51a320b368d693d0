//! Kernel boundary
//!
//! [`KernelInterface`] is everything a compute kernel may touch: nonce ranges
//! out, results in, stale-work subscriptions, rate reporting and error
//! escalation. It is a cheap clonable handle; every request that needs the
//! queue or the connection travels to the control context as a
//! [`ControlMessage`].

use crate::crypto;
use crate::logger::{Logger, Severity};
use crate::miner::ControlMessage;
use crate::queue::{StaleSubscriber, SubscriberId};
use crate::types::{NonceRange, Target};
use crate::{Error, Result, APP_VERSION};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Sliding window of recent rate samples
#[derive(Debug, Clone)]
pub struct RateWindow {
    depth: usize,
    samples: VecDeque<f64>,
}

impl RateWindow {
    /// Create a window keeping `depth` samples
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            samples: VecDeque::new(),
        }
    }

    /// Change the depth; the window is truncated on the next push
    pub fn set_depth(&mut self, depth: usize) {
        self.depth = depth.max(1);
    }

    /// Append a sample, dropping the oldest ones beyond the depth
    pub fn push(&mut self, rate: f64) {
        self.samples.push_back(rate);
        while self.samples.len() > self.depth {
            self.samples.pop_front();
        }
    }

    /// Mean of the window, 0 when empty
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    /// Number of samples held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples are held
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Shared view of one core's rate window
pub type CoreRate = Arc<Mutex<RateWindow>>;

/// Handle given to kernels
#[derive(Clone)]
pub struct KernelInterface {
    control: mpsc::UnboundedSender<ControlMessage>,
    logger: Arc<dyn Logger>,
    samples: Arc<AtomicUsize>,
    next_subscriber: Arc<AtomicU64>,
}

impl KernelInterface {
    pub(crate) fn new(
        control: mpsc::UnboundedSender<ControlMessage>,
        logger: Arc<dyn Logger>,
        samples: Arc<AtomicUsize>,
        next_subscriber: Arc<AtomicU64>,
    ) -> Self {
        Self {
            control,
            logger,
            samples,
            next_subscriber,
        }
    }

    /// Engine version string
    pub fn version(&self) -> &'static str {
        APP_VERSION
    }

    /// Register a compute core
    pub fn add_core(&self) -> CoreInterface {
        let window = Arc::new(Mutex::new(RateWindow::new(
            self.samples.load(Ordering::Relaxed),
        )));
        let _ = self.control.send(ControlMessage::AddCore(Arc::clone(&window)));
        CoreInterface {
            interface: self.clone(),
            window,
        }
    }

    /// Fetch a nonce range; `None` asks for the default size
    ///
    /// Resolves once work is available. Fails only when the miner has shut
    /// down.
    pub async fn fetch_range(&self, size: Option<u64>) -> Result<NonceRange> {
        let (reply, receiver) = oneshot::channel();
        self.control
            .send(ControlMessage::FetchRange { size, reply })
            .map_err(|_| Error::cancelled("fetch_range"))?;
        receiver.await.map_err(|_| Error::cancelled("fetch_range"))
    }

    /// Call `callback` with the new block whenever queued work goes stale
    pub fn add_stale_callback(&self, callback: StaleSubscriber) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let _ = self.control.send(ControlMessage::AddStaleSubscriber {
            id,
            subscriber: callback,
        });
        id
    }

    /// Remove a stale-work callback
    pub fn remove_stale_callback(&self, id: SubscriberId) {
        let _ = self.control.send(ControlMessage::RemoveStaleSubscriber(id));
    }

    /// Forward kernel metadata to the connection
    pub fn set_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self.control.send(ControlMessage::SetMeta {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Check a little-endian hash against a little-endian target
    pub fn check_target(&self, hash: &[u8; 32], target: &Target) -> bool {
        crypto::check_target(hash, target.as_bytes())
    }

    /// SHA-256d of the range's header with `nonce` (masked to 32 bits)
    pub fn calculate_hash(&self, range: &NonceRange, nonce: u64) -> [u8; 32] {
        crypto::calculate_hash(&range.unit().data, nonce as u32)
    }

    /// Report a candidate nonce for `range`
    ///
    /// The receiver yields `true` when the nonce met the full target and was
    /// submitted. It can be dropped without waiting.
    pub fn found_nonce(&self, range: &NonceRange, nonce: u64) -> oneshot::Receiver<bool> {
        let (reply, receiver) = oneshot::channel();
        let _ = self.control.send(ControlMessage::FoundNonce {
            range: range.clone(),
            nonce,
            reply: Some(reply),
        });
        receiver
    }

    /// Informational message
    pub fn log(&self, message: &str) {
        self.logger.log(Severity::Info, message);
    }

    /// Diagnostic message, shown in verbose mode
    pub fn debug(&self, message: &str) {
        self.logger.report_debug(message);
    }

    /// Recoverable kernel problem; mining continues
    pub fn error(&self, message: &str) {
        self.logger
            .log(Severity::Error, &format!("Kernel error: {}", message));
    }

    /// Unrecoverable kernel problem; the miner shuts down and exits non-zero
    pub fn fatal(&self, message: Option<&str>) {
        if let Some(message) = message {
            self.logger
                .log(Severity::Error, &format!("FATAL kernel error: {}", message));
        }
        let _ = self
            .control
            .send(ControlMessage::Fatal(message.map(str::to_string)));
    }
}

/// Per-core handle owning a rate window
pub struct CoreInterface {
    interface: KernelInterface,
    window: CoreRate,
}

impl CoreInterface {
    /// The kernel interface this core belongs to
    pub fn interface(&self) -> &KernelInterface {
        &self.interface
    }

    /// Record a rate sample in hashes per second
    pub fn update_rate(&self, rate: f64) {
        {
            let mut window = self.window.lock();
            window.set_depth(self.interface.samples.load(Ordering::Relaxed));
            window.push(rate);
        }
        let _ = self.interface.control.send(ControlMessage::RatesChanged);
    }

    /// Mean of the recent samples, 0 before the first one
    pub fn rate(&self) -> f64 {
        self.window.lock().mean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_window_mean() {
        let mut window = RateWindow::new(3);
        assert_eq!(window.mean(), 0.0);

        for rate in [10.0, 20.0, 30.0, 40.0] {
            window.push(rate);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.mean(), 30.0);
    }

    #[test]
    fn test_rate_window_truncates_on_next_push() {
        let mut window = RateWindow::new(4);
        for rate in [1.0, 2.0, 3.0, 4.0] {
            window.push(rate);
        }

        window.set_depth(2);
        assert_eq!(window.len(), 4);

        window.push(6.0);
        assert_eq!(window.len(), 2);
        assert_eq!(window.mean(), 5.0);
    }
}

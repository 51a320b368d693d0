//! Mining orchestrator
//!
//! The [`Miner`] owns the work queue, the upstream connection and the
//! failover, idle and rate state. It runs as a single task and processes
//! [`ControlMessage`]s posted by the connection, the kernel interface, the
//! queue readers and its own timers, one at a time.

use crate::client::{Connection, ConnectionEvent, ConnectionEvents, Connector};
use crate::crypto;
use crate::interface::{CoreRate, KernelInterface};
use crate::kernel::Kernel;
use crate::logger::{Logger, Severity};
use crate::queue::{QueueSignal, StaleSubscriber, SubscriberId, WorkQueue, DEFAULT_RANGE_SIZE};
use crate::types::{AdvertisedWork, NonceRange};
use crate::utils::RateLimiter;
use crate::{Error, Result, APP_NAME, APP_VERSION};
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Interval of work requests while idle
pub const IDLE_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Delay before a primary failure is forgiven
pub const FAILURE_DECAY: Duration = Duration::from_secs(300);

/// Minimum spacing of `rate` metadata updates
pub const META_RATE_INTERVAL: Duration = Duration::from_secs(30);

/// Messages processed by the miner's control loop
pub enum ControlMessage {
    /// Event reported by the connection
    Connection(ConnectionEvent),
    /// A compute core was registered
    AddCore(CoreRate),
    /// A core recorded a new rate sample
    RatesChanged,
    /// A kernel asks for a nonce range
    FetchRange {
        size: Option<u64>,
        reply: oneshot::Sender<NonceRange>,
    },
    /// A kernel reports a candidate nonce
    FoundNonce {
        range: NonceRange,
        nonce: u64,
        reply: Option<oneshot::Sender<bool>>,
    },
    AddStaleSubscriber {
        id: SubscriberId,
        subscriber: StaleSubscriber,
    },
    RemoveStaleSubscriber(SubscriberId),
    /// Kernel metadata for the connection
    SetMeta { key: String, value: String },
    /// A kernel cannot continue
    Fatal(Option<String>),
    /// Idle recovery timer fired
    IdleTick,
    /// Failure decay timer fired
    DecayFailures,
    /// Orderly shutdown requested
    Shutdown,
}

/// Engine settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinerConfig {
    /// Backlog depth of the work queue
    pub queue_size: usize,
    /// Number of rate samples averaged per core
    pub avg_samples: usize,
    /// Whether a backup endpoint is configured
    pub has_backup: bool,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            queue_size: 1,
            avg_samples: 10,
            has_backup: false,
        }
    }
}

/// What the miner should do after a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    /// Nothing besides counting it
    None,
    /// Forgive the failure after [`FAILURE_DECAY`]
    DecayLater,
    /// Move to the backup endpoint
    SwitchToBackup,
    /// Move back to the primary endpoint
    ReturnToPrimary,
}

/// Primary/backup failover state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failover {
    failures: u32,
    backup: bool,
}

impl Failover {
    /// Count a failure and decide what to do about it
    ///
    /// The primary is abandoned on its third failure; the backup on its
    /// second.
    pub fn record_failure(&mut self) -> FailoverAction {
        if self.backup {
            if self.failures >= 1 {
                self.failures = 0;
                self.backup = false;
                FailoverAction::ReturnToPrimary
            } else {
                self.failures += 1;
                FailoverAction::None
            }
        } else if self.failures >= 2 {
            self.failures = 0;
            self.backup = true;
            FailoverAction::SwitchToBackup
        } else {
            self.failures += 1;
            FailoverAction::DecayLater
        }
    }

    /// Forgive one primary failure, keeping at least one on record
    pub fn decay(&mut self) {
        if self.failures > 1 && !self.backup {
            self.failures -= 1;
        }
    }

    /// Primary failures currently on record
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the backup connection is in use
    pub fn on_backup(&self) -> bool {
        self.backup
    }
}

/// Outcome of handling one control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
    Fatal(Option<String>),
}

/// Cloneable handle used to stop a running miner
#[derive(Clone)]
pub struct MinerHandle {
    control: mpsc::UnboundedSender<ControlMessage>,
}

impl MinerHandle {
    /// Request an orderly shutdown
    pub fn shutdown(&self) {
        let _ = self.control.send(ControlMessage::Shutdown);
    }
}

/// The orchestrator
pub struct Miner {
    config: MinerConfig,
    connector: Box<dyn Connector>,
    connection: Option<Box<dyn Connection>>,
    logger: Arc<dyn Logger>,
    queue: WorkQueue,
    cores: Vec<CoreRate>,
    idle: bool,
    idle_loop_armed: bool,
    failover: Failover,
    meta_limiter: RateLimiter,
    samples: Arc<AtomicUsize>,
    next_subscriber: Arc<AtomicU64>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl Miner {
    /// Create a miner; nothing happens until [`Miner::run`]
    pub fn new(config: MinerConfig, connector: Box<dyn Connector>, logger: Arc<dyn Logger>) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            queue: WorkQueue::new(config.queue_size),
            samples: Arc::new(AtomicUsize::new(config.avg_samples.max(1))),
            next_subscriber: Arc::new(AtomicU64::new(0)),
            config,
            connector,
            connection: None,
            logger,
            cores: Vec::new(),
            idle: true,
            idle_loop_armed: false,
            failover: Failover::default(),
            meta_limiter: RateLimiter::ready(META_RATE_INTERVAL),
            control_tx,
            control_rx,
        }
    }

    /// Handle for kernels; all handles share one subscriber id space
    pub fn interface(&self) -> KernelInterface {
        KernelInterface::new(
            self.control_tx.clone(),
            Arc::clone(&self.logger),
            Arc::clone(&self.samples),
            Arc::clone(&self.next_subscriber),
        )
    }

    /// Handle for stopping the miner from elsewhere
    pub fn handle(&self) -> MinerHandle {
        MinerHandle {
            control: self.control_tx.clone(),
        }
    }

    /// Whether the queue has run dry since the last work arrived
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Primary/backup connection state
    pub fn failover(&self) -> &Failover {
        &self.failover
    }

    /// The shared work queue
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Connect, start `kernel` and process messages until shutdown
    ///
    /// Returns an error when the kernel reported a fatal condition.
    pub async fn run(mut self, mut kernel: Box<dyn Kernel>) -> Result<()> {
        self.logger.log(
            Severity::Info,
            &format!("{} v{} starting...", APP_NAME, APP_VERSION),
        );
        self.open_connection(false)?;

        if let Err(e) = kernel.start().await {
            error!("Kernel {} failed to start: {}", kernel.name(), e);
            self.disconnect();
            return Err(e);
        }
        info!("Kernel {} started", kernel.name());

        let outcome = self.control_loop().await;

        if let Err(e) = kernel.stop().await {
            warn!("Kernel {} did not stop cleanly: {}", kernel.name(), e);
        }
        self.disconnect();
        info!("Miner stopped");
        outcome
    }

    async fn control_loop(&mut self) -> Result<()> {
        while let Some(message) = self.control_rx.recv().await {
            match self.process(message)? {
                Flow::Continue => {}
                Flow::Shutdown => return Ok(()),
                Flow::Fatal(message) => {
                    return Err(Error::fatal(
                        message.unwrap_or_else(|| "kernel requested shutdown".to_string()),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Handle a single control message
    pub fn process(&mut self, message: ControlMessage) -> Result<Flow> {
        match message {
            ControlMessage::Connection(event) => self.on_connection_event(event)?,
            ControlMessage::AddCore(window) => self.cores.push(window),
            ControlMessage::RatesChanged => self.update_average(),
            ControlMessage::FetchRange { size, reply } => {
                self.queue
                    .fetch_range_into(size.unwrap_or(DEFAULT_RANGE_SIZE), reply);
                self.apply_queue_signals();
            }
            ControlMessage::FoundNonce {
                range,
                nonce,
                reply,
            } => {
                let submitted = self.found_nonce(&range, nonce);
                if let Some(reply) = reply {
                    let _ = reply.send(submitted);
                }
            }
            ControlMessage::AddStaleSubscriber { id, subscriber } => {
                self.queue.add_stale_subscriber(id, subscriber)
            }
            ControlMessage::RemoveStaleSubscriber(id) => self.queue.remove_stale_subscriber(id),
            ControlMessage::SetMeta { key, value } => self.set_meta(&key, value),
            ControlMessage::Fatal(message) => return Ok(Flow::Fatal(message)),
            ControlMessage::IdleTick => self.idle_tick(),
            ControlMessage::DecayFailures => self.failover.decay(),
            ControlMessage::Shutdown => return Ok(Flow::Shutdown),
        }
        Ok(Flow::Continue)
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) -> Result<()> {
        match event {
            ConnectionEvent::Work(work) => self.on_work(&work),
            ConnectionEvent::Block(block) => self.logger.report_block(&block),
            ConnectionEvent::Failure => self.on_failure()?,
            ConnectionEvent::Connected => self.logger.report_connected(true),
            ConnectionEvent::Disconnected => self.logger.report_connected(false),
            ConnectionEvent::Message(message) => self.logger.report_msg(&message),
            ConnectionEvent::LongPoll(_) => {
                if let Some(connection) = &self.connection {
                    self.logger.report_type(&connection.kind());
                }
            }
            ConnectionEvent::Push => self.logger.log(Severity::Info, "LP: New work pushed"),
            ConnectionEvent::Log(message) => self.logger.log(Severity::Info, &message),
            ConnectionEvent::Debug(message) => self.logger.report_debug(&message),
        }
        Ok(())
    }

    fn on_work(&mut self, work: &AdvertisedWork) {
        self.logger
            .report_debug("Server gave new work; passing to work queue");
        self.queue.store_work(work);
        self.apply_queue_signals();
    }

    fn on_failure(&mut self) -> Result<()> {
        self.logger.report_connection_failed();
        if !self.config.has_backup {
            return Ok(());
        }

        match self.failover.record_failure() {
            FailoverAction::None => {}
            FailoverAction::DecayLater => {
                self.schedule(ControlMessage::DecayFailures, FAILURE_DECAY)
            }
            FailoverAction::SwitchToBackup => {
                self.logger.log(
                    Severity::Warning,
                    "Primary server failed too many times, attempting to connect to backup server",
                );
                self.open_connection(true)?;
            }
            FailoverAction::ReturnToPrimary => {
                self.logger.log(
                    Severity::Warning,
                    "Backup server failed, attempting to return to primary server",
                );
                self.open_connection(false)?;
            }
        }
        Ok(())
    }

    /// Replace the connection with a fresh one to the primary or backup
    fn open_connection(&mut self, backup: bool) -> Result<()> {
        self.disconnect();

        let events = ConnectionEvents::new(self.control_tx.clone());
        let mut connection = self.connector.open(backup, events)?;
        self.logger.report_type(&connection.kind());
        connection.set_meta("version", format!("{} {}", APP_NAME, APP_VERSION));
        connection.set_meta(
            "os",
            format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        );
        connection.connect();
        self.connection = Some(connection);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect();
        }
    }

    fn request_work(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.request_work();
        }
    }

    fn set_meta(&mut self, key: &str, value: String) {
        if let Some(connection) = self.connection.as_mut() {
            connection.set_meta(key, value);
        }
    }

    fn apply_queue_signals(&mut self) {
        for signal in self.queue.take_signals() {
            match signal {
                QueueSignal::RequestWork => self.request_work(),
                QueueSignal::Idle(idle) => self.report_idle(idle),
            }
        }
    }

    /// Record whether the miner has work; only transitions have effects
    pub fn report_idle(&mut self, idle: bool) {
        if self.idle == idle {
            return;
        }
        self.idle = idle;

        if idle {
            self.logger
                .log(Severity::Warning, "Work queue empty, miner is idle");
            self.logger.report_rate(0.0, true);
            self.set_meta("rate", "0".to_string());
            self.meta_limiter.mark();
            self.fix_idle();
        } else {
            self.logger.update_status(true);
        }
    }

    fn fix_idle(&mut self) {
        self.request_work();
        if !self.idle_loop_armed {
            self.idle_loop_armed = true;
            self.schedule(ControlMessage::IdleTick, IDLE_RETRY_INTERVAL);
        }
    }

    fn idle_tick(&mut self) {
        self.idle_loop_armed = false;
        if self.idle {
            debug!("Still idle, asking for work again");
            self.fix_idle();
        }
    }

    fn update_average(&mut self) {
        let total: f64 = if self.idle {
            0.0
        } else {
            self.cores.iter().map(|core| core.lock().mean()).sum()
        };

        self.logger.report_rate(total, true);
        if self.meta_limiter.try_request() {
            self.set_meta("rate", format!("{:.0}", total));
        }
    }

    fn found_nonce(&mut self, range: &NonceRange, nonce: u64) -> bool {
        let nonce = (nonce & 0xffff_ffff) as u32;

        if self.queue.is_range_stale(range) {
            return false;
        }

        let unit = range.unit();
        let hash = crypto::calculate_hash(&unit.data, nonce);
        if !unit.target.is_met_by(&hash) {
            self.logger
                .report_debug("Result didn't meet full difficulty, not sending");
            return false;
        }

        let Some(connection) = self.connection.as_mut() else {
            self.logger
                .report_debug("No connection to submit the result to");
            return false;
        };
        let submission = connection.send_result(crypto::format_solution(&unit.data, nonce));
        let logger = Arc::clone(&self.logger);
        tokio::spawn(async move {
            match submission.await {
                Ok(accepted) => logger.report_found(&hash, accepted),
                Err(e) => logger.report_debug(&format!("Result submission failed: {}", e)),
            }
        });
        true
    }

    fn schedule(&self, message: ControlMessage, delay: Duration) {
        let control = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control.send(message);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockId;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Record {
        opened: Vec<bool>,
        connects: usize,
        disconnects: usize,
        work_requests: usize,
        meta: Vec<(String, String)>,
        results: Vec<[u8; 80]>,
    }

    struct MockConnection {
        record: Arc<Mutex<Record>>,
    }

    impl Connection for MockConnection {
        fn connect(&mut self) {
            self.record.lock().connects += 1;
        }

        fn disconnect(&mut self) {
            self.record.lock().disconnects += 1;
        }

        fn request_work(&mut self) {
            self.record.lock().work_requests += 1;
        }

        fn send_result(&mut self, solution: [u8; 80]) -> BoxFuture<'static, Result<bool>> {
            self.record.lock().results.push(solution);
            Box::pin(async { Ok(true) })
        }

        fn set_meta(&mut self, key: &str, value: String) {
            self.record.lock().meta.push((key.to_string(), value));
        }

        fn kind(&self) -> String {
            "Mock".to_string()
        }
    }

    struct MockConnector {
        record: Arc<Mutex<Record>>,
    }

    impl Connector for MockConnector {
        fn open(&self, backup: bool, _events: ConnectionEvents) -> Result<Box<dyn Connection>> {
            self.record.lock().opened.push(backup);
            Ok(Box::new(MockConnection {
                record: Arc::clone(&self.record),
            }))
        }
    }

    #[derive(Default)]
    struct MockLogger {
        rates: Mutex<Vec<f64>>,
        found: Mutex<Vec<bool>>,
        messages: Mutex<Vec<String>>,
    }

    impl Logger for MockLogger {
        fn report_rate(&self, rate: f64, _update: bool) {
            self.rates.lock().push(rate);
        }
        fn report_type(&self, _kind: &str) {}
        fn report_block(&self, _block: &BlockId) {}
        fn report_found(&self, _hash: &[u8; 32], accepted: bool) {
            self.found.lock().push(accepted);
        }
        fn report_msg(&self, _message: &str) {}
        fn report_connected(&self, _connected: bool) {}
        fn report_connection_failed(&self) {}
        fn report_debug(&self, message: &str) {
            self.messages.lock().push(message.to_string());
        }
        fn log(&self, _severity: Severity, message: &str) {
            self.messages.lock().push(message.to_string());
        }
        fn update_status(&self, _force: bool) {}
    }

    fn miner(has_backup: bool) -> (Miner, Arc<Mutex<Record>>, Arc<MockLogger>) {
        let record = Arc::new(Mutex::new(Record::default()));
        let logger = Arc::new(MockLogger::default());
        let config = MinerConfig {
            has_backup,
            ..MinerConfig::default()
        };
        let mut miner = Miner::new(
            config,
            Box::new(MockConnector {
                record: Arc::clone(&record),
            }),
            logger.clone(),
        );
        miner.open_connection(false).unwrap();
        (miner, record, logger)
    }

    fn work(id: &str) -> AdvertisedWork {
        AdvertisedWork {
            data: vec![0x5a; 80],
            target: vec![0xff; 32],
            mask: 32,
            identifier: BlockId::from(id),
        }
    }

    fn failure(miner: &mut Miner) {
        miner
            .process(ControlMessage::Connection(ConnectionEvent::Failure))
            .unwrap();
    }

    #[test]
    fn test_failover_state_machine() {
        let mut failover = Failover::default();
        assert_eq!(failover.record_failure(), FailoverAction::DecayLater);
        assert_eq!(failover.record_failure(), FailoverAction::DecayLater);
        assert_eq!(failover.record_failure(), FailoverAction::SwitchToBackup);
        assert!(failover.on_backup());
        assert_eq!(failover.failures(), 0);

        assert_eq!(failover.record_failure(), FailoverAction::None);
        assert_eq!(failover.record_failure(), FailoverAction::ReturnToPrimary);
        assert!(!failover.on_backup());
        assert_eq!(failover.failures(), 0);
    }

    #[test]
    fn test_failover_decay_keeps_one_failure() {
        let mut failover = Failover::default();
        failover.record_failure();
        failover.decay();
        assert_eq!(failover.failures(), 1);

        failover.record_failure();
        failover.decay();
        assert_eq!(failover.failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_primary_failures_switch_to_backup() {
        let (mut miner, record, _) = miner(true);

        failure(&mut miner);
        failure(&mut miner);
        assert_eq!(record.lock().opened, vec![false]);

        failure(&mut miner);
        assert_eq!(record.lock().opened, vec![false, true]);
        assert_eq!(record.lock().disconnects, 1);
        assert!(miner.failover().on_backup());
        assert_eq!(miner.failover().failures(), 0);

        failure(&mut miner);
        failure(&mut miner);
        assert_eq!(record.lock().opened, vec![false, true, false]);
        assert!(!miner.failover().on_backup());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_without_backup_are_only_reported() {
        let (mut miner, record, _) = miner(false);
        for _ in 0..5 {
            failure(&mut miner);
        }
        assert_eq!(record.lock().opened, vec![false]);
        assert_eq!(miner.failover().failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_failures_decay() {
        let (mut miner, _, _) = miner(true);
        failure(&mut miner);
        failure(&mut miner);
        assert_eq!(miner.failover().failures(), 2);

        // Both decay timers fire after five minutes
        for _ in 0..2 {
            let message = miner.control_rx.recv().await.unwrap();
            assert!(matches!(message, ControlMessage::DecayFailures));
            miner.process(message).unwrap();
        }
        assert_eq!(miner.failover().failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_idle_is_idempotent() {
        let (mut miner, record, logger) = miner(false);
        assert!(miner.is_idle());

        miner.report_idle(true);
        assert_eq!(record.lock().work_requests, 0);

        miner.report_idle(false);
        miner.report_idle(false);
        assert!(!miner.is_idle());

        miner.report_idle(true);
        miner.report_idle(true);
        assert_eq!(record.lock().work_requests, 1);
        assert_eq!(*logger.rates.lock(), vec![0.0]);
        assert!(record
            .lock()
            .meta
            .contains(&("rate".to_string(), "0".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_loop_requests_work_until_active() {
        let (mut miner, record, _) = miner(false);
        miner.report_idle(false);
        miner.report_idle(true);
        assert_eq!(record.lock().work_requests, 1);

        let tick = miner.control_rx.recv().await.unwrap();
        assert!(matches!(tick, ControlMessage::IdleTick));
        miner.process(tick).unwrap();
        assert_eq!(record.lock().work_requests, 2);

        miner.report_idle(false);
        let tick = miner.control_rx.recv().await.unwrap();
        miner.process(tick).unwrap();
        assert_eq!(record.lock().work_requests, 2);
        assert!(!miner.idle_loop_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rates_sum_over_cores_and_zero_while_idle() {
        let (mut miner, record, logger) = miner(false);
        let interface = miner.interface();
        let first = interface.add_core();
        let second = interface.add_core();
        for _ in 0..2 {
            let message = miner.control_rx.recv().await.unwrap();
            miner.process(message).unwrap();
        }

        first.update_rate(100.0);
        second.update_rate(250.0);

        miner.process(ControlMessage::RatesChanged).unwrap();
        assert_eq!(logger.rates.lock().last(), Some(&0.0));

        miner.report_idle(false);
        miner.process(ControlMessage::RatesChanged).unwrap();
        assert_eq!(logger.rates.lock().last(), Some(&350.0));

        // Only the first rate update reaches the connection within the window
        let published = record
            .lock()
            .meta
            .iter()
            .filter(|(key, _)| key == "rate")
            .count();
        assert_eq!(published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_found_nonce_validation() {
        let (mut miner, record, logger) = miner(false);
        miner
            .process(ControlMessage::Connection(ConnectionEvent::Work(work("a"))))
            .unwrap();

        let range = match miner.queue.fetch_range(1024) {
            crate::queue::RangeFetch::Ready(range) => range,
            crate::queue::RangeFetch::Pending(_) => panic!("work was stored"),
        };

        // Maximum target: every hash meets it. High bits are masked away.
        assert!(miner.found_nonce(&range, (1 << 40) | 7));
        let solution = record.lock().results[0];
        assert_eq!(&solution[76..], &7u32.to_le_bytes());

        tokio::task::yield_now().await;
        assert_eq!(*logger.found.lock(), vec![true]);

        miner
            .process(ControlMessage::Connection(ConnectionEvent::Work(work("b"))))
            .unwrap();
        assert!(!miner.found_nonce(&range, 7));
        assert_eq!(record.lock().results.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_target_is_not_submitted() {
        let (mut miner, record, logger) = miner(false);
        let mut hard = work("a");
        hard.target = vec![0; 32];
        miner
            .process(ControlMessage::Connection(ConnectionEvent::Work(hard)))
            .unwrap();

        let (reply, mut verdict) = oneshot::channel();
        let (range_tx, mut range_rx) = oneshot::channel();
        miner
            .process(ControlMessage::FetchRange {
                size: None,
                reply: range_tx,
            })
            .unwrap();
        let range = range_rx.try_recv().unwrap();
        assert_eq!(range.size(), DEFAULT_RANGE_SIZE);

        miner
            .process(ControlMessage::FoundNonce {
                range,
                nonce: 1,
                reply: Some(reply),
            })
            .unwrap();
        assert_eq!(verdict.try_recv(), Ok(false));
        assert!(record.lock().results.is_empty());
        assert!(logger
            .messages
            .lock()
            .iter()
            .any(|m| m.contains("didn't meet full difficulty")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_and_fatal_flow() {
        let (mut miner, _, _) = miner(false);
        assert_eq!(
            miner.process(ControlMessage::Shutdown).unwrap(),
            Flow::Shutdown
        );
        assert_eq!(
            miner
                .process(ControlMessage::Fatal(Some("device lost".into())))
                .unwrap(),
            Flow::Fatal(Some("device lost".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_subscribers_from_separate_interfaces() {
        use std::sync::atomic::Ordering;

        let (mut miner, _, _) = miner(false);
        let notified = Arc::new(AtomicUsize::new(0));
        let first = miner.interface();
        let second = miner.interface();

        let mut ids = Vec::new();
        for interface in [&first, &second] {
            let notified = Arc::clone(&notified);
            ids.push(interface.add_stale_callback(Box::new(move |_: &BlockId| {
                notified.fetch_add(1, Ordering::SeqCst);
            })));
        }
        assert_ne!(ids[0], ids[1]);
        for _ in 0..2 {
            let message = miner.control_rx.recv().await.unwrap();
            miner.process(message).unwrap();
        }
        assert_eq!(miner.queue().subscriber_count(), 2);

        miner
            .process(ControlMessage::Connection(ConnectionEvent::Work(work("a"))))
            .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 2);

        first.remove_stale_callback(ids[0]);
        let message = miner.control_rx.recv().await.unwrap();
        miner.process(message).unwrap();
        assert_eq!(miner.queue().subscriber_count(), 1);

        miner
            .process(ControlMessage::Connection(ConnectionEvent::Work(work("b"))))
            .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 3);
    }
}

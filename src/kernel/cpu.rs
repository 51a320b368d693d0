//! CPU mining kernel
//!
//! One dedicated OS thread per core, each fed by its own queue reader. Every
//! range is preprocessed into a [`CpuJob`] holding the header midstate, so a
//! nonce costs two compressions.

use super::{Kernel, KernelOptions};
use crate::crypto;
use crate::interface::KernelInterface;
use crate::queue::{MAX_RANGE_SIZE, MIN_RANGE_SIZE};
use crate::reader::{QueueReader, ReaderFeed, ReaderHandle};
use crate::types::NonceRange;
use crate::utils::clamp;
use crate::{Error, Result};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Options understood by this kernel
const KNOWN_OPTIONS: &[&str] = &["THREADS", "AGGRESSION", "FASTLOOP", "EXECUTION_MS"];

/// Nonces hashed between checks of the running flag
const STOP_CHECK_INTERVAL: u64 = 0x4000;

/// Resolved CPU kernel options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    /// Number of mining threads
    pub threads: usize,
    /// Initial range size is `2^(12 + aggression)`
    pub aggression: u32,
    /// Adapt range sizes to the measured rate
    pub fastloop: bool,
    /// Execution time the adaptive sizing aims for
    pub execution_target: Duration,
}

impl CpuConfig {
    /// Resolve options, failing on malformed values
    pub fn from_options(options: &KernelOptions) -> Result<Self> {
        for key in options.keys() {
            if !KNOWN_OPTIONS.contains(&key) {
                warn!("Ignoring unknown cpu kernel option {}", key);
            }
        }

        let threads = options.get_or("THREADS", num_cpus::get())?;
        if threads == 0 {
            return Err(Error::kernel("cpu", "THREADS must be greater than 0"));
        }
        let aggression = options.get_or("AGGRESSION", 4u32)?.min(20);
        let execution_ms = options.get_or("EXECUTION_MS", 1000u64)?;
        if execution_ms == 0 {
            return Err(Error::kernel("cpu", "EXECUTION_MS must be greater than 0"));
        }

        Ok(Self {
            threads,
            aggression,
            fastloop: options.flag("FASTLOOP", true),
            execution_target: Duration::from_millis(execution_ms),
        })
    }

    /// Size of the first range each core asks for
    pub fn initial_size(&self) -> u64 {
        1u64 << (12 + self.aggression)
    }

    /// Next range size given the average execution time of the last size
    pub fn next_size(&self, average: Option<Duration>, last: Option<u64>) -> u64 {
        match (average, last) {
            (Some(average), Some(last)) if self.fastloop && !average.is_zero() => {
                let scale = self.execution_target.as_secs_f64() / average.as_secs_f64();
                clamp((last as f64 * scale) as u64, MIN_RANGE_SIZE, MAX_RANGE_SIZE)
            }
            (_, Some(last)) if self.fastloop => last,
            _ => self.initial_size(),
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            aggression: 4,
            fastloop: true,
            execution_target: Duration::from_secs(1),
        }
    }
}

/// A range prepared for hashing
pub struct CpuJob {
    range: NonceRange,
    midstate: [u32; 8],
    tail: [u8; 16],
}

impl CpuJob {
    /// Precompute the midstate and the nonce-less tail of the hash input
    pub fn prepare(range: &NonceRange) -> Self {
        let unit = range.unit();
        let input = crypto::hash_input(&unit.data, 0);
        let mut tail = [0u8; 16];
        tail.copy_from_slice(&input[64..]);

        Self {
            range: range.clone(),
            midstate: crypto::midstate_words(&unit.midstate),
            tail,
        }
    }

    pub fn range(&self) -> &NonceRange {
        &self.range
    }

    /// SHA-256d of the header with `nonce`
    pub fn hash(&self, nonce: u32) -> [u8; 32] {
        let mut tail = self.tail;
        BigEndian::write_u32(&mut tail[12..], nonce);
        crypto::hash_from_midstate(&self.midstate, &tail)
    }
}

/// Multi-threaded CPU kernel
pub struct CpuKernel {
    interface: KernelInterface,
    config: CpuConfig,
    running: Arc<AtomicBool>,
    readers: Vec<ReaderHandle>,
    threads: Vec<JoinHandle<()>>,
}

impl CpuKernel {
    pub fn new(interface: KernelInterface, config: CpuConfig) -> Self {
        info!("Creating CPU kernel with {} threads", config.threads);
        Self {
            interface,
            config,
            running: Arc::new(AtomicBool::new(false)),
            readers: Vec::new(),
            threads: Vec::new(),
        }
    }

    fn mine_thread(
        index: usize,
        feed: ReaderFeed<CpuJob>,
        interface: KernelInterface,
        runtime: Handle,
        running: Arc<AtomicBool>,
    ) {
        debug!("CPU thread {} started", index);
        let mut hashes = 0u64;

        for job in feed {
            for nonce in job.range().nonces() {
                if nonce % STOP_CHECK_INTERVAL == 0 && !running.load(Ordering::Relaxed) {
                    debug!("CPU thread {} stopping after {} hashes", index, hashes);
                    return;
                }

                let hash = job.hash(nonce as u32);
                hashes += 1;
                if hash[28..] == [0u8; 4] {
                    Self::submit(&interface, &runtime, job.range(), nonce);
                }
            }
        }

        debug!("CPU thread {} finished after {} hashes", index, hashes);
    }

    /// Hand a candidate to the engine and sanity-check a refusal off-thread
    fn submit(interface: &KernelInterface, runtime: &Handle, range: &NonceRange, nonce: u64) {
        let verdict = interface.found_nonce(range, nonce);
        let interface = interface.clone();
        let range = range.clone();
        runtime.spawn(async move {
            if let Ok(false) = verdict.await {
                let hash = interface.calculate_hash(&range, nonce);
                if hash[28..] != [0u8; 4] {
                    interface.error("Unusual behavior from the CPU kernel, hash mismatch");
                }
            }
        });
    }
}

#[async_trait]
impl Kernel for CpuKernel {
    fn name(&self) -> &'static str {
        "cpu"
    }

    async fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state("CPU kernel already started"));
        }

        self.interface.set_meta("kernel", format!("cpu {}", self.interface.version()));
        self.interface.set_meta("cores", self.config.threads.to_string());

        let runtime = Handle::current();
        for index in 0..self.config.threads {
            let core = self.interface.add_core();
            let config = self.config.clone();
            let (handle, feed) = QueueReader::new(core, CpuJob::prepare)
                .with_work_sizer(move |average, last| Some(config.next_size(average, last)))
                .start();

            let interface = self.interface.clone();
            let runtime = runtime.clone();
            let running = Arc::clone(&self.running);
            let thread = std::thread::Builder::new()
                .name(format!("cpu-{}", index))
                .spawn(move || Self::mine_thread(index, feed, interface, runtime, running))
                .map_err(|e| Error::kernel("cpu", format!("Failed to spawn thread: {}", e)))?;

            self.readers.push(handle);
            self.threads.push(thread);
        }

        self.interface
            .log(&format!("CPU kernel running on {} threads", self.config.threads));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        for reader in self.readers.drain(..) {
            reader.stop();
        }

        let threads: Vec<_> = self.threads.drain(..).collect();
        tokio::task::spawn_blocking(move || {
            for thread in threads {
                if thread.join().is_err() {
                    warn!("CPU thread panicked");
                }
            }
        })
        .await
        .map_err(|e| Error::kernel("cpu", format!("Failed to join threads: {}", e)))?;

        info!("CPU kernel stopped");
        Ok(())
    }
}

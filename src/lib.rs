//! sha256d-miner
//!
//! A SHA-256d getwork mining engine:
//! - a bounded work queue that partitions block headers into nonce ranges
//! - per-core queue readers that prefetch and preprocess ranges
//! - a narrow kernel interface for pluggable compute backends
//! - a miner orchestrator with long polling, idle detection and backup pool failover

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod interface;
pub mod kernel;
pub mod logger;
pub mod miner;
pub mod queue;
pub mod reader;
pub mod types;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use interface::{CoreInterface, KernelInterface};
pub use kernel::{Kernel, KernelFactory, KernelOptions};
pub use logger::{Logger, StatusLogger};
pub use miner::{Miner, MinerConfig, MinerHandle};
pub use queue::WorkQueue;
pub use reader::QueueReader;
pub use types::*;

/// Application information
pub const APP_NAME: &str = "sha256d-miner";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

//! sha256d-miner - Main Application
//!
//! Wires the getwork connection, the engine and the selected compute kernel
//! together and runs until interrupted or a fatal error occurs.

use sha256d_miner::{
    client::RpcConnector,
    config::Config,
    kernel::KernelFactory,
    logger::{init_tracing, StatusLogger},
    miner::Miner,
    Result, APP_NAME, APP_VERSION,
};

use std::sync::Arc;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        error!("{} exiting: {}", APP_NAME, e);
        eprintln!("{}: {}", APP_NAME, e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = Config::load().await?;
    let _guard = init_tracing(
        config.effective_log_level(),
        config.log_format,
        config.log_file.as_deref(),
    )?;

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        "Configuration: kernel={}, queue_size={}, avg_samples={}, backup={}",
        config.kernel,
        config.queue_size,
        config.avg_samples,
        config.backup_url.is_some()
    );

    let connector = RpcConnector::new(
        config.url()?,
        config.backup_url.as_deref(),
        config.rpc_settings()?,
    )?;
    let logger = Arc::new(StatusLogger::new(config.verbose));
    let miner = Miner::new(config.miner_config(), Box::new(connector), logger);
    let kernel = KernelFactory::create(&config.kernel, miner.interface(), &config.kernel_options())?;

    let handle = miner.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            handle.shutdown();
        }
    });

    miner.run(kernel).await
}

//! Status reporting and tracing setup
//!
//! The engine reports through the [`Logger`] trait. [`StatusLogger`] is the
//! stock implementation: it keeps share counters and emits a throttled status
//! line, everything going out through `tracing`.

use crate::config::{LogFormat, LogLevel};
use crate::types::BlockId;
use crate::utils::{format_hash_rate, RateLimiter};
use crate::Result;
use parking_lot::Mutex;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Minimum spacing between unforced status lines
pub const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Severity of a free-form log message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Sink for everything the engine wants the operator to see
pub trait Logger: Send + Sync {
    /// Current aggregate rate in hashes per second
    fn report_rate(&self, rate: f64, update: bool);

    /// Kind of upstream connection in use
    fn report_type(&self, kind: &str);

    /// The server announced a new block
    fn report_block(&self, block: &BlockId);

    /// A submitted result came back accepted or rejected
    fn report_found(&self, hash: &[u8; 32], accepted: bool);

    /// Message from the server operator
    fn report_msg(&self, message: &str);

    /// Connection state changed
    fn report_connected(&self, connected: bool);

    /// Connecting failed and will be retried
    fn report_connection_failed(&self);

    /// Verbose-only diagnostics
    fn report_debug(&self, message: &str);

    /// Free-form message
    fn log(&self, severity: Severity, message: &str);

    /// Refresh the status line; unforced refreshes are throttled
    fn update_status(&self, force: bool);
}

#[derive(Debug)]
struct StatusState {
    rate: f64,
    accepted: u64,
    rejected: u64,
    kind: Option<String>,
    limiter: RateLimiter,
}

/// Counters snapshot of a [`StatusLogger`]
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub rate: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub kind: Option<String>,
}

/// Logger printing a status line through `tracing`
#[derive(Debug)]
pub struct StatusLogger {
    verbose: bool,
    state: Mutex<StatusState>,
}

impl StatusLogger {
    /// Create a logger; `verbose` enables debug reports and full hashes
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            state: Mutex::new(StatusState {
                rate: 0.0,
                accepted: 0,
                rejected: 0,
                kind: None,
                limiter: RateLimiter::ready(STATUS_INTERVAL),
            }),
        }
    }

    /// Current counters
    pub fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock();
        StatusSnapshot {
            rate: state.rate,
            accepted: state.accepted,
            rejected: state.rejected,
            kind: state.kind.clone(),
        }
    }

    /// Render the status line from the current counters
    pub fn status_line(&self) -> String {
        let state = self.state.lock();
        Self::render(&state)
    }

    fn render(state: &StatusState) -> String {
        let kind = state
            .kind
            .as_ref()
            .map(|k| format!(" [{}]", k))
            .unwrap_or_default();
        format!(
            "[{}] [{} Accepted] [{} Rejected]{}",
            format_hash_rate(state.rate),
            state.accepted,
            state.rejected,
            kind
        )
    }
}

impl Logger for StatusLogger {
    fn report_rate(&self, rate: f64, update: bool) {
        self.state.lock().rate = rate;
        if update {
            self.update_status(false);
        }
    }

    fn report_type(&self, kind: &str) {
        self.state.lock().kind = Some(kind.to_string());
    }

    fn report_block(&self, block: &BlockId) {
        self.log(Severity::Info, &format!("Currently on block: {}", block));
    }

    fn report_found(&self, hash: &[u8; 32], accepted: bool) {
        {
            let mut state = self.state.lock();
            if accepted {
                state.accepted += 1;
            } else {
                state.rejected += 1;
            }
        }

        let mut display = *hash;
        display.reverse();
        let verdict = if accepted { "accepted" } else { "rejected" };
        let message = if self.verbose {
            format!("Result {}... {}", hex::encode(&display[..8]), verdict)
        } else {
            format!("Result: {} {}", hex::encode(&display[4..8]), verdict)
        };
        self.log(Severity::Info, &message);
    }

    fn report_msg(&self, message: &str) {
        self.log(Severity::Info, &format!("MSG: {}", message));
    }

    fn report_connected(&self, connected: bool) {
        if connected {
            self.log(Severity::Info, "Connected to server");
        } else {
            self.log(Severity::Warning, "Disconnected from server");
        }
    }

    fn report_connection_failed(&self) {
        self.log(Severity::Warning, "Failed to connect, retrying...");
    }

    fn report_debug(&self, message: &str) {
        if self.verbose {
            self.log(Severity::Info, message);
        } else {
            debug!("{}", message);
        }
    }

    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
    }

    fn update_status(&self, force: bool) {
        let mut state = self.state.lock();
        if force {
            state.limiter.mark();
        } else if !state.limiter.try_request() {
            return;
        }
        info!(target: "status", "{}", Self::render(&state));
    }
}

/// Install the global tracing subscriber
///
/// Returns the appender guard when logging to a file; it must be held for as
/// long as log output is wanted.
pub fn init_tracing(
    level: LogLevel,
    format: LogFormat,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::from(level).as_str()));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path.file_name().ok_or_else(|| {
                crate::Error::config(format!("Invalid log file path: {}", path.display()))
            })?;
            let appender =
                tracing_appender::rolling::never(directory.unwrap_or(Path::new(".")), file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let installed = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false))
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    installed.map_err(|e| crate::Error::config(format!("Failed to install logger: {}", e)))?;

    Ok(guard)
}

//! Utility functions and helpers
//!
//! Formatting, throttling and retry helpers shared by the miner, the logger
//! and the connection.

use std::time::Duration;
use tokio::time::Instant;

/// Values accepted as "true" for boolean kernel options
const TRUE_STRINGS: &[&str] = &["t", "true", "on", "1", "y", "yes"];

/// Format hash rate as a human-readable string
pub fn format_hash_rate(hashes_per_sec: f64) -> String {
    const UNITS: &[&str] = &["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
    let mut rate = hashes_per_sec;
    let mut unit_index = 0;

    while rate >= 1000.0 && unit_index < UNITS.len() - 1 {
        rate /= 1000.0;
        unit_index += 1;
    }

    format!("{:.2} {}", rate, UNITS[unit_index])
}

/// Interpret a boolean option value; a bare flag (no value) counts as set
pub fn parse_flag(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => TRUE_STRINGS.contains(&v.trim().to_ascii_lowercase().as_str()),
    }
}

/// Clamp a value between min and max
pub fn clamp<T: PartialOrd>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff calculator
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            current_attempt: 0,
        }
    }

    /// Get the next delay
    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.current_attempt == 0 {
            self.initial_delay
        } else {
            let factor = self.multiplier.powi(self.current_attempt as i32);
            self.initial_delay.mul_f64(factor).min(self.max_delay)
        };

        self.current_attempt = self.current_attempt.saturating_add(1);
        delay
    }

    /// Reset the backoff state
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Rate limiter for throttling periodic reports
#[derive(Debug)]
pub struct RateLimiter {
    last_request: Option<Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    /// Create a limiter whose first window starts now
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_request: Some(Instant::now()),
            min_interval,
        }
    }

    /// Create a limiter that allows the first request immediately
    pub fn ready(min_interval: Duration) -> Self {
        Self {
            last_request: None,
            min_interval,
        }
    }

    /// Check if a request is allowed and update state
    pub fn try_request(&mut self) -> bool {
        let now = Instant::now();
        match self.last_request {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_request = Some(now);
                true
            }
        }
    }

    /// Record a request made outside the limiter
    pub fn mark(&mut self) {
        self.last_request = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hash_rate() {
        assert_eq!(format_hash_rate(0.0), "0.00 H/s");
        assert_eq!(format_hash_rate(100.0), "100.00 H/s");
        assert_eq!(format_hash_rate(1500.0), "1.50 KH/s");
        assert_eq!(format_hash_rate(1000000.0), "1.00 MH/s");
        assert_eq!(format_hash_rate(1500000000.0), "1.50 GH/s");
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(None));
        assert!(parse_flag(Some("yes")));
        assert!(parse_flag(Some("ON")));
        assert!(parse_flag(Some("1")));
        assert!(!parse_flag(Some("0")));
        assert!(!parse_flag(Some("off")));
        assert!(!parse_flag(Some("")));
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(5, 0, 10), 5);
        assert_eq!(clamp(-1, 0, 10), 0);
        assert_eq!(clamp(15, 0, 10), 10);
        assert_eq!(clamp(5.5, 0.0, 10.0), 5.5);
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0);

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1600));
        assert_eq!(backoff.next_delay(), Duration::from_millis(3200));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5)); // Capped at max

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter() {
        let mut limiter = RateLimiter::new(Duration::from_millis(100));

        // The first window starts at construction
        assert!(!limiter.try_request());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(limiter.try_request());
        assert!(!limiter.try_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_rate_limiter() {
        let mut limiter = RateLimiter::ready(Duration::from_secs(1));
        assert!(limiter.try_request());
        assert!(!limiter.try_request());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_request());
    }
}

//! Log throttling utility
//!
//! Limits how often the same message is logged and counts what was
//! dropped, so a camera that keeps failing does not flood the log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Log throttler keyed by message class
///
/// ```rust
/// use multicam::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert_eq!(throttler.check("read_error"), Some(0));
/// assert_eq!(throttler.check("read_error"), None);
/// ```
pub struct LogThrottler {
    entries: Mutex<HashMap<String, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Decide whether a message for `key` should be emitted now.
    ///
    /// Returns `Some(n)` when it should, where `n` is the number of repeats
    /// swallowed since the last emitted message. Returns `None` when throttled.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed = entry.suppressed.saturating_add(1);
                None
            }
            Some(entry) => {
                entry.last_logged = now;
                Some(std::mem::take(&mut entry.suppressed))
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget every key, so the next failure of any kind is logged at once
    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }
}

/// Throttled error that reports how many repeats were suppressed
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::error!("{} (suppressed {} repeats)", format!($($arg)*), suppressed);
            } else {
                tracing::error!($($arg)*);
            }
        }
    };
}

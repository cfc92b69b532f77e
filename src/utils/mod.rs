pub mod logging;

use chrono::Utc;

// Re-export common functions and types
pub use logging::{default_log_file, init_logging};

/// Current wall-clock time in epoch milliseconds, the unit stored in queue items
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

//! Foundational low-level utilities shared across sita crates.
//!
//! Provides atomic file-write helpers, time utilities used by session
//! records and statistics, and size-based rotation for the runtime log file.

pub mod atomic_io;
pub mod log_rotation;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use log_rotation::{rotate_log_if_oversized, LogRotationPolicy};
pub use time_utils::{current_unix_timestamp_ms, format_duration_hms};

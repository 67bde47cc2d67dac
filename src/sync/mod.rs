//! Unattended queue mirroring: engine, sinks, locks, watermarks, scheduler.

pub mod engine;
pub mod lock;
pub mod scheduler;
pub mod sink;
pub mod watermark;

pub use engine::{SyncEngine, TickStats};
pub use lock::{LockGuard, LockManager};
pub use scheduler::Scheduler;
pub use sink::{delivery_stem, Delivery, Sink};
pub use watermark::{FileWatermarkStore, WatermarkStore};

/// File-name form of a task key: anything outside `[A-Za-z0-9.-]` becomes `_`.
pub(crate) fn key_file_stem(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

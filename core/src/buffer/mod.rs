//! Bounded log buffers
//!
//! Each run owns a [`RunLogs`]: a [`RingBuffer`] of raw display lines and an
//! [`EntryBuffer`] of the same lines parsed into structured entries. Both
//! evict oldest-first once full.

mod entry;
mod logs;
mod ring;

pub use entry::{parse_line, EntryBuffer, LogEntry};
pub use logs::{format_line, RunLogs};
pub use ring::RingBuffer;

use std::sync::{Mutex, MutexGuard};

/// Buffers hold plain data, so a panic in another holder cannot leave them
/// half-updated in a way that matters; recover instead of propagating.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

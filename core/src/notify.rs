//! Change notification shared between the run registry, reader tasks and
//! whatever front end renders them.

use std::sync::Arc;

use tokio::sync::watch;

/// Generation counter bumped after every observable change.
///
/// Receivers only learn that *something* changed; they re-read snapshots on
/// their own schedule, so a slow consumer never applies back-pressure to
/// subprocess readers.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: Arc<watch::Sender<u64>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Record a change and wake subscribers.
    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Opens once `count_down` has been called `count` times.
#[derive(Debug)]
pub struct CountdownLatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        }
    }

    /// Extra calls after the latch opened are ignored.
    pub fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.notify.notify_waiters();
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.remaining() == 0
    }

    pub async fn wait(&self) {
        loop {
            // Registered before the check so a concurrent count_down is not missed.
            let notified = self.notify.notified();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
#[path = "tests/latch_tests.rs"]
mod tests;

// =============================================================================
// Trellis Matrix NextServer - Dock Primitive
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Cooperative wait point shared by the fetch admission gate and the
//   request worker. `wait(pred)` suspends the task until `pred()` holds;
//   every state change of interest calls `notify_all()`.
//
// =============================================================================

use std::time::Duration;

use tokio::sync::Notify;

/// A notification dock. Waiters enroll before re-checking their predicate,
/// so a notification between the check and the suspension is never lost.
#[derive(Debug, Default)]
pub struct Dock {
    notify: Notify,
}

impl Dock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend until `pred()` returns true.
    pub async fn wait<F>(&self, mut pred: F)
    where
        F: FnMut() -> bool,
    {
        loop {
            // `Notified` only enrolls in the waiter list once polled, which
            // would leave a window for `notify_waiters` between the
            // predicate check and the await. `enable` closes it.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if pred() {
                return;
            }

            notified.await;
        }
    }

    /// Suspend until `pred()` returns true or `timeout` elapses. Returns
    /// whether the predicate was satisfied.
    pub async fn wait_for<F>(&self, timeout: Duration, mut pred: F) -> bool
    where
        F: FnMut() -> bool,
    {
        tokio::time::timeout(timeout, self.wait(&mut pred))
            .await
            .is_ok()
    }

    /// Wake every task suspended in `wait`.
    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_when_pred_holds() {
        let dock = Dock::new();
        dock.wait(|| true).await;
    }

    #[tokio::test]
    async fn wait_wakes_on_notify() {
        let dock = Arc::new(Dock::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let dock = Arc::clone(&dock);
            let flag = Arc::clone(&flag);
            tokio::spawn(async move {
                dock.wait(|| flag.load(Ordering::SeqCst)).await;
            })
        };

        tokio::task::yield_now().await;
        flag.store(true, Ordering::SeqCst);
        dock.notify_all();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let dock = Dock::new();
        let satisfied = dock.wait_for(Duration::from_millis(10), || false).await;
        assert!(!satisfied);
    }
}

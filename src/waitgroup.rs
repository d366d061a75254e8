use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Outstanding-work counter for a listener. Every accepted connection takes a
/// [`WorkGuard`]; shutdown waits for the count to drain back to zero.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one unit of outstanding work. The returned guard releases it when
    /// dropped, on every exit path, exactly once.
    pub fn add(&self) -> WorkGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Wait until the count reaches zero.
    pub async fn wait(&self) {
        loop {
            // Arm the notification before checking, so a release between the
            // check and the await cannot be missed.
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct WorkGuard {
    inner: Arc<Inner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_once_all_guards_drop() {
        let wg = WaitGroup::new();
        let g1 = wg.add();
        let g2 = wg.add();
        assert_eq!(wg.count(), 2);

        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };
        drop(g1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(g2);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should finish after the last guard")
            .unwrap();
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn wait_on_idle_group_returns_immediately() {
        let wg = WaitGroup::new();
        tokio::time::timeout(Duration::from_millis(100), wg.wait())
            .await
            .unwrap();
    }
}

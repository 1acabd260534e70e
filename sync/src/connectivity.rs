use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Shared online/offline flag. While offline the coordinator accumulates
/// operations; the transition back to online triggers a batched flush.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    notify: Notify,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            notify: Notify::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns true when this call changed the state.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.swap(online, Ordering::SeqCst) != online;
        if changed && online {
            self.notify.notify_waiters();
        }
        changed
    }

    pub async fn wait_until_online(&self) {
        while !self.is_online() {
            let notified = self.notify.notified();
            if self.is_online() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_until_online_wakes_on_transition() {
        let monitor = Arc::new(ConnectivityMonitor::new(false));
        let waiter = monitor.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_until_online().await;
            true
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        assert!(monitor.set_online(true));
        assert!(handle.await.unwrap());
    }

    #[test]
    fn set_online_reports_transitions_only() {
        let monitor = ConnectivityMonitor::new(true);
        assert!(!monitor.set_online(true));
        assert!(monitor.set_online(false));
        assert!(monitor.set_online(true));
    }
}

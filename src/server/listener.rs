use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use tokio::sync::Notify;

static GLOBAL: Lazy<ListenerGroup> = Lazy::new(ListenerGroup::new);

/// Wait-group over the accept loops of every running server, so
/// [`crate::run_forever`] can block until the last one exits.
#[derive(Default)]
pub struct ListenerGroup {
    active: AtomicUsize,
    idle: Notify,
}

pub struct ListenerGuard<'a> {
    group: &'a ListenerGroup,
}

impl ListenerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide group shared by all accept servers.
    pub fn global() -> &'static ListenerGroup {
        &GLOBAL
    }

    /// Join the group; the returned guard leaves it on drop.
    pub fn enter(&self) -> ListenerGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        ListenerGuard { group: self }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolves once no members remain. Returns immediately when the
    /// group is already empty.
    pub async fn wait(&self) {
        loop {
            let idle = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        if self.group.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.group.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn wait_returns_immediately_when_empty() {
        let group = ListenerGroup::new();
        timeout(Duration::from_secs(1), group.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn wait_blocks_until_every_member_leaves() {
        let group: &'static ListenerGroup = Box::leak(Box::new(ListenerGroup::new()));
        let first = group.enter();
        let second = group.enter();
        assert_eq!(group.active(), 2);

        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            drop(first);
            sleep(Duration::from_millis(20)).await;
            drop(second);
        });

        timeout(Duration::from_secs(5), group.wait()).await.unwrap();
        assert_eq!(group.active(), 0);
    }
}

//! A waitable counter of in-flight transport attempts.

use tokio::sync::watch;

/// Counts transports currently executing; [`Enroute::wait`] resolves when
/// the count reaches zero. Replaces the original design's wait group with a
/// watch channel so any number of tasks can await the drain.
#[derive(Debug)]
pub(crate) struct Enroute {
    count: watch::Sender<usize>,
}

impl Enroute {
    pub(crate) fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    pub(crate) fn start(&self) {
        self.count.send_modify(|c| *c += 1);
    }

    pub(crate) fn done(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }

    pub(crate) fn active(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolves once no transport is in flight. Returns immediately if the
    /// counter is already zero.
    pub(crate) async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // wait_for checks the current value before waiting for changes, and
        // the sender lives in self, so this cannot error.
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_when_idle() {
        let enroute = Enroute::new();
        enroute.wait().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_done() {
        let enroute = Arc::new(Enroute::new());
        enroute.start();
        enroute.start();

        let waiter = {
            let enroute = enroute.clone();
            tokio::spawn(async move { enroute.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        enroute.done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        enroute.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(enroute.active(), 0);
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An immutable value that is replaced wholesale. Readers get an `Arc` to the current version
///  and never see a partial update; a reload installs a new version atomically.
pub struct SnapshotStore<T> {
    what: &'static str,
    sender: watch::Sender<Arc<T>>,
}

impl<T: Send + Sync + 'static> SnapshotStore<T> {
    pub fn new(what: &'static str, initial: T) -> SnapshotStore<T> {
        let (sender, _) = watch::channel(Arc::new(initial));
        SnapshotStore {
            what,
            sender,
        }
    }

    pub fn snapshot(&self) -> Arc<T> {
        self.sender.borrow().clone()
    }

    pub fn install(&self, value: T) {
        self.sender.send_replace(Arc::new(value));
        debug!("installed new {}", self.what);
    }

    /// notified whenever a new version is installed
    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.sender.subscribe()
    }

    /// Calls `load` at every `interval` (starting right away) and installs the result. A failed
    ///  load is logged and keeps the current version.
    pub async fn run_reload_loop<F, Fut>(&self, interval: Duration, cancel: CancellationToken, mut load: F)
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let mut ticks = time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => match load().await {
                    Ok(value) => {
                        info!("reloaded {}", self.what);
                        self.install(value);
                    }
                    Err(e) => warn!("reloading {} failed, keeping the previous version: {}", self.what, e),
                }
            }
        }
    }
}

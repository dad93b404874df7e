//! Shared resources for one job run.

use std::sync::Arc;

use survey_cache::ResponseCache;
use tokio::sync::watch;

use crate::limiter::{BucketCollection, LimiterConfig};

/// Cache, limiters, and the stop signal shared by every interview of a run.
///
/// The cache and limiters are `Arc`s so several runs may share them; the
/// stop signal belongs to this environment.
#[derive(Debug)]
pub struct RunEnvironment {
    cache: Option<Arc<ResponseCache>>,
    limiters: Arc<BucketCollection>,
    stop: Arc<watch::Sender<bool>>,
}

impl Default for RunEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl RunEnvironment {
    /// No cache, default limiter tuning.
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            cache: None,
            limiters: Arc::new(BucketCollection::new(LimiterConfig::default())),
            stop: Arc::new(stop),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_limiters(mut self, limiters: Arc<BucketCollection>) -> Self {
        self.limiters = limiters;
        self
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn limiters(&self) -> &Arc<BucketCollection> {
        &self.limiters
    }

    /// A handle that can cancel the run from elsewhere (e.g. on Ctrl-C).
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop),
        }
    }

    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}

#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves once a stop has been requested. Never resolves if the sender is
/// gone without stopping.
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

//! Watch subscription lifecycle.
//!
//! Every long-lived worker (local watch, outbound writer, remote watch) runs
//! as a subscription registered in a [`WatchTable`] under a [`WatchKey`].
//! The table lock only guards handle manipulation; stopping a subscription
//! happens outside it.

use crate::error::{ReplicatorError, ReplicatorResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Which side of replication a subscription serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchScope {
    /// Watch on the local store for one kind.
    Local,
    /// Writer applying mirror operations of one kind to one peer.
    Outbound,
    /// Watch on one peer's mirrors of one kind.
    Remote,
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchScope::Local => f.write_str("local"),
            WatchScope::Outbound => f.write_str("outbound"),
            WatchScope::Remote => f.write_str("remote"),
        }
    }
}

/// Identity of a subscription: (scope, endpoint, resource type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey {
    /// Scope.
    pub scope: WatchScope,
    /// Cluster identifier of the endpoint.
    pub endpoint: String,
    /// Resource type identifier.
    pub resource: String,
}

impl WatchKey {
    /// Build a key.
    pub fn new(scope: WatchScope, endpoint: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            scope,
            endpoint: endpoint.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.endpoint, self.resource)
    }
}

/// Cancellation signal handed to a subscription worker.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Whether the subscription has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the subscription is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // A dropped sender also means the subscription is gone.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

struct Subscription {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    async fn stop(self, key: &WatchKey) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::error!(watch = %key, "Subscription worker panicked");
            }
        }
        tracing::debug!(watch = %key, "Subscription stopped");
    }
}

/// Process-wide table of live subscriptions.
#[derive(Default)]
pub struct WatchTable {
    entries: Mutex<HashMap<WatchKey, Subscription>>,
}

impl WatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a subscription.
    ///
    /// Fails with [`ReplicatorError::DuplicateWatch`] if a live subscription
    /// already holds `key`. A finished worker's slot is reused.
    pub fn start<F, Fut>(&self, key: WatchKey, worker: F) -> ReplicatorResult<()>
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            if !existing.task.is_finished() {
                tracing::error!(watch = %key, "Refusing to start a duplicate watch");
                return Err(ReplicatorError::DuplicateWatch(key.to_string()));
            }
        }

        let (cancel, rx) = watch::channel(false);
        let task = tokio::spawn(worker(CancelSignal { rx }));
        tracing::debug!(watch = %key, "Subscription started");
        entries.insert(key, Subscription { cancel, task });
        Ok(())
    }

    /// Cancel a subscription and wait for its worker to stop.
    ///
    /// Returns `false` for an unknown key. Once this returns, the worker will
    /// not issue any further call.
    pub async fn cancel(&self, key: &WatchKey) -> bool {
        let subscription = self.entries.lock().remove(key);
        match subscription {
            Some(subscription) => {
                subscription.stop(key).await;
                true
            }
            None => false,
        }
    }

    /// Cancel every subscription whose key matches `predicate`, concurrently.
    pub async fn cancel_where(&self, predicate: impl Fn(&WatchKey) -> bool) -> usize {
        let stopped: Vec<(WatchKey, Subscription)> = {
            let mut entries = self.entries.lock();
            let keys: Vec<WatchKey> = entries.keys().filter(|k| predicate(k)).cloned().collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|s| (k, s)))
                .collect()
        };

        let count = stopped.len();
        futures::future::join_all(
            stopped
                .into_iter()
                .map(|(key, subscription)| async move { subscription.stop(&key).await }),
        )
        .await;
        count
    }

    /// Cancel everything.
    pub async fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true).await
    }

    /// Whether a live subscription holds `key`.
    pub fn is_active(&self, key: &WatchKey) -> bool {
        self.entries
            .lock()
            .get(key)
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }

    /// Keys of every registered subscription, sorted.
    pub fn keys(&self) -> Vec<WatchKey> {
        let mut keys: Vec<WatchKey> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

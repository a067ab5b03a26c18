//! Coalescing queues between the local router and the outbound writers.
//!
//! Each (peer, type) writer drains one [`Outbox`]. Pending work is keyed by
//! object, so a queue never holds more than one operation per source plus a
//! single prune request, however far the peer falls behind.

use crate::object::ObjectKey;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

/// Work queued for the outbound writer of one (peer, type).
#[derive(Debug, Clone)]
pub enum MirrorOp {
    /// Create or update the mirror.
    Upsert {
        /// Key of the source and its mirror.
        key: ObjectKey,
        /// Desired mirror.
        mirror: DynamicObject,
    },
    /// Delete the mirror if it is ours.
    Delete(ObjectKey),
    /// Delete every mirror whose source is gone or targets another peer.
    Prune,
}

impl MirrorOp {
    /// Object the operation applies to; `None` for [`MirrorOp::Prune`].
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            MirrorOp::Upsert { key, .. } | MirrorOp::Delete(key) => Some(key),
            MirrorOp::Prune => None,
        }
    }
}

#[derive(Default)]
struct Pending {
    order: VecDeque<ObjectKey>,
    ops: HashMap<ObjectKey, MirrorOp>,
    prune: bool,
    closed: bool,
}

impl Pending {
    fn pop(&mut self) -> Option<MirrorOp> {
        while let Some(key) = self.order.pop_front() {
            if let Some(op) = self.ops.remove(&key) {
                return Some(op);
            }
        }
        if std::mem::take(&mut self.prune) {
            return Some(MirrorOp::Prune);
        }
        None
    }
}

/// Pending operations of one writer. A newer operation on an object replaces
/// the queued one in place; prune requests collapse into one.
#[derive(Default)]
pub struct Outbox {
    pending: Mutex<Pending>,
    notify: Notify,
}

impl Outbox {
    /// Queue `op`. Returns `false` once the outbox is closed.
    pub fn push(&self, op: MirrorOp) -> bool {
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return false;
            }
            match op.key().cloned() {
                Some(key) => {
                    if pending.ops.insert(key.clone(), op).is_none() {
                        pending.order.push_back(key);
                    }
                }
                None => pending.prune = true,
            }
        }
        self.notify.notify_one();
        true
    }

    /// Next operation, waiting for one. `None` once closed.
    pub async fn next(&self) -> Option<MirrorOp> {
        loop {
            {
                let mut pending = self.pending.lock();
                if pending.closed {
                    return None;
                }
                if let Some(op) = pending.pop() {
                    return Some(op);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Number of queued operations, a pending prune included.
    pub fn len(&self) -> usize {
        let pending = self.pending.lock();
        pending.ops.len() + usize::from(pending.prune)
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the last resync pass has not reached its prune yet.
    pub fn pass_in_progress(&self) -> bool {
        self.pending.lock().prune
    }

    /// Drop queued work and wake the writer so it stops.
    pub fn close(&self) {
        {
            let mut pending = self.pending.lock();
            pending.closed = true;
            pending.order.clear();
            pending.ops.clear();
            pending.prune = false;
        }
        self.notify.notify_one();
    }
}

/// Outboxes of every writer, keyed by (peer, type).
///
/// Pushing never waits, so the local watch is not slowed down by a slow peer.
#[derive(Default)]
pub struct Outboxes {
    boxes: Mutex<HashMap<(String, String), Arc<Outbox>>>,
}

impl Outboxes {
    /// Install the outbox of a writer. A previous outbox for the same
    /// (peer, type) is closed.
    pub fn open(&self, cluster_id: &str, resource: &str) -> Arc<Outbox> {
        let outbox = Arc::new(Outbox::default());
        let previous = self
            .boxes
            .lock()
            .insert((cluster_id.to_string(), resource.to_string()), outbox.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        outbox
    }

    fn get(&self, cluster_id: &str, resource: &str) -> Option<Arc<Outbox>> {
        self.boxes
            .lock()
            .get(&(cluster_id.to_string(), resource.to_string()))
            .cloned()
    }

    /// Queue an operation. Returns `false` if no writer serves (peer, type).
    pub fn send(&self, cluster_id: &str, resource: &str, op: MirrorOp) -> bool {
        self.get(cluster_id, resource)
            .is_some_and(|outbox| outbox.push(op))
    }

    /// Queue `Prune` to every writer of a type.
    pub fn prune_all(&self, resource: &str) {
        for ((_, r), outbox) in self.boxes.lock().iter() {
            if r == resource {
                outbox.push(MirrorOp::Prune);
            }
        }
    }

    /// Peers whose writer of `resource` is still working through the
    /// previous resync pass.
    pub fn busy_peers(&self, resource: &str) -> HashSet<String> {
        self.boxes
            .lock()
            .iter()
            .filter(|((_, r), outbox)| r == resource && outbox.pass_in_progress())
            .map(|((c, _), _)| c.clone())
            .collect()
    }

    fn close_where(&self, mut matches: impl FnMut(&str, &str) -> bool) {
        self.boxes.lock().retain(|(c, r), outbox| {
            if matches(c, r) {
                outbox.close();
                false
            } else {
                true
            }
        });
    }

    /// Close every outbox of a peer.
    pub fn close_cluster(&self, cluster_id: &str) {
        self.close_where(|c, _| c == cluster_id);
    }

    /// Close every outbox of a type.
    pub fn close_resource(&self, resource: &str) {
        self.close_where(|_, r| r == resource);
    }

    /// Close every outbox.
    pub fn clear(&self) {
        self.close_where(|_, _| true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upsert(name: &str, cidr: &str) -> MirrorOp {
        let mut mirror = DynamicObject {
            types: None,
            metadata: Default::default(),
            data: json!({ "spec": { "podCIDR": cidr } }),
        };
        mirror.metadata.name = Some(name.to_string());
        MirrorOp::Upsert {
            key: ObjectKey::new(Some("default"), name),
            mirror,
        }
    }

    fn cidr_of(op: &MirrorOp) -> Option<&str> {
        match op {
            MirrorOp::Upsert { mirror, .. } => mirror.data["spec"]["podCIDR"].as_str(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn newer_operations_replace_queued_ones() {
        let outbox = Outbox::default();
        outbox.push(upsert("a", "10.0.0.0/16"));
        outbox.push(upsert("b", "10.1.0.0/16"));
        outbox.push(MirrorOp::Prune);
        for round in 0..10 {
            outbox.push(upsert("a", &format!("10.{}.0.0/16", round)));
            outbox.push(MirrorOp::Prune);
        }
        assert_eq!(outbox.len(), 3);
        assert!(outbox.pass_in_progress());

        let first = outbox.next().await.unwrap();
        assert_eq!(first.key(), Some(&ObjectKey::new(Some("default"), "a")));
        assert_eq!(cidr_of(&first), Some("10.9.0.0/16"));
        assert_eq!(cidr_of(&outbox.next().await.unwrap()), Some("10.1.0.0/16"));
        assert!(matches!(outbox.next().await, Some(MirrorOp::Prune)));
        assert!(outbox.is_empty());
        assert!(!outbox.pass_in_progress());
    }

    #[tokio::test]
    async fn delete_supersedes_a_queued_upsert() {
        let outbox = Outbox::default();
        outbox.push(upsert("a", "10.0.0.0/16"));
        outbox.push(MirrorOp::Delete(ObjectKey::new(Some("default"), "a")));

        assert_eq!(outbox.len(), 1);
        assert!(matches!(outbox.next().await, Some(MirrorOp::Delete(_))));
    }

    #[tokio::test]
    async fn close_wakes_a_waiting_writer() {
        let outbox = Arc::new(Outbox::default());
        let waiter = tokio::spawn({
            let outbox = outbox.clone();
            async move { outbox.next().await }
        });
        tokio::task::yield_now().await;

        outbox.close();
        assert!(waiter.await.unwrap().is_none());
        assert!(!outbox.push(MirrorOp::Prune));
    }

    #[test]
    fn outboxes_route_by_peer_and_type() {
        let outboxes = Outboxes::default();
        let c1 = outboxes.open("c1", "t");
        let c2 = outboxes.open("c2", "t");

        assert!(outboxes.send("c1", "t", MirrorOp::Prune));
        assert!(!outboxes.send("c3", "t", MirrorOp::Prune));
        assert_eq!(c1.len(), 1);
        assert!(c2.is_empty());

        outboxes.prune_all("t");
        assert_eq!(c1.len(), 1);
        assert_eq!(c2.len(), 1);
        assert_eq!(
            outboxes.busy_peers("t"),
            HashSet::from(["c1".to_string(), "c2".to_string()])
        );

        outboxes.close_cluster("c1");
        assert!(!outboxes.send("c1", "t", MirrorOp::Prune));
        assert!(c1.is_empty());

        let replaced = outboxes.open("c2", "t");
        assert!(!c2.push(MirrorOp::Prune), "replaced outbox is closed");
        assert!(outboxes.send("c2", "t", MirrorOp::Prune));
        assert_eq!(replaced.len(), 1);
    }
}

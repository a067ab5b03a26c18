//! Per-object replication conditions.
//!
//! Objects whose replication keeps failing, or whose markers cannot be
//! interpreted, are recorded here instead of halting their watch. An entry is
//! cleared by the next successful operation on the same object and cluster.

use crate::object::ObjectKey;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;

/// Why an object is not replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionReason {
    /// Creating or updating the mirror exhausted its retries.
    UpsertFailed,
    /// Deleting the mirror exhausted its retries.
    DeleteFailed,
    /// The destination marker cannot be interpreted.
    MalformedMarker,
    /// An object that is not our mirror already holds the name on the peer.
    MirrorCollision,
    /// Copying the mirror status back exhausted its retries.
    StatusSyncFailed,
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionReason::UpsertFailed => "UpsertFailed",
            ConditionReason::DeleteFailed => "DeleteFailed",
            ConditionReason::MalformedMarker => "MalformedMarker",
            ConditionReason::MirrorCollision => "MirrorCollision",
            ConditionReason::StatusSyncFailed => "StatusSyncFailed",
        };
        f.write_str(s)
    }
}

/// A recorded condition.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationCondition {
    /// Resource type identifier.
    pub resource: String,
    /// Object key.
    pub key: ObjectKey,
    /// Peer the failure concerns. `None` for local-side problems.
    pub cluster: Option<String>,
    /// Reason.
    pub reason: ConditionReason,
    /// Last error message.
    pub message: String,
    /// Times this reason was recorded in a row.
    pub attempts: u32,
    /// When the reason last changed.
    pub last_transition_time: DateTime<Utc>,
}

type ConditionSlot = (String, ObjectKey, Option<String>);

/// Table of current conditions.
#[derive(Debug, Default)]
pub struct ReplicationConditions {
    entries: Mutex<BTreeMap<ConditionSlot, ReplicationCondition>>,
}

impl ReplicationConditions {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. Repeating the same reason bumps `attempts` and keeps
    /// the transition time.
    pub fn record(
        &self,
        resource: &str,
        key: &ObjectKey,
        cluster: Option<&str>,
        reason: ConditionReason,
        message: impl Into<String>,
    ) {
        let slot = (resource.to_string(), key.clone(), cluster.map(str::to_string));
        let message = message.into();
        let mut entries = self.entries.lock();
        match entries.get_mut(&slot) {
            Some(existing) if existing.reason == reason => {
                existing.attempts += 1;
                existing.message = message;
            }
            _ => {
                entries.insert(
                    slot,
                    ReplicationCondition {
                        resource: resource.to_string(),
                        key: key.clone(),
                        cluster: cluster.map(str::to_string),
                        reason,
                        message,
                        attempts: 1,
                        last_transition_time: Utc::now(),
                    },
                );
            }
        }
    }

    /// Clear the condition for an object on a cluster, whatever its reason.
    pub fn clear(&self, resource: &str, key: &ObjectKey, cluster: Option<&str>) -> bool {
        let slot = (resource.to_string(), key.clone(), cluster.map(str::to_string));
        self.entries.lock().remove(&slot).is_some()
    }

    /// Clear a condition only if it carries `reason`.
    pub fn clear_reason(
        &self,
        resource: &str,
        key: &ObjectKey,
        cluster: Option<&str>,
        reason: ConditionReason,
    ) -> bool {
        let slot = (resource.to_string(), key.clone(), cluster.map(str::to_string));
        let mut entries = self.entries.lock();
        if entries.get(&slot).is_some_and(|c| c.reason == reason) {
            entries.remove(&slot);
            return true;
        }
        false
    }

    /// Drop every condition concerning a peer.
    pub fn clear_cluster(&self, cluster: &str) {
        self.entries
            .lock()
            .retain(|(_, _, c), _| c.as_deref() != Some(cluster));
    }

    /// Drop every condition of a resource type.
    pub fn clear_resource(&self, resource: &str) {
        self.entries.lock().retain(|(r, _, _), _| r != resource);
    }

    /// Current conditions, ordered by (type, key, cluster).
    pub fn list(&self) -> Vec<ReplicationCondition> {
        self.entries.lock().values().cloned().collect()
    }

    /// Look one condition up.
    pub fn get(
        &self,
        resource: &str,
        key: &ObjectKey,
        cluster: Option<&str>,
    ) -> Option<ReplicationCondition> {
        let slot = (resource.to_string(), key.clone(), cluster.map(str::to_string));
        self.entries.lock().get(&slot).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUNNEL: &str = "net.example.io/v1alpha1/TunnelEndpoint";

    #[test]
    fn repeated_reason_counts_attempts() {
        let table = ReplicationConditions::new();
        let key = ObjectKey::new(Some("default"), "tun-a");

        table.record(TUNNEL, &key, Some("c2"), ConditionReason::UpsertFailed, "timeout");
        let first = table.get(TUNNEL, &key, Some("c2")).unwrap();
        table.record(TUNNEL, &key, Some("c2"), ConditionReason::UpsertFailed, "refused");

        let second = table.get(TUNNEL, &key, Some("c2")).unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.message, "refused");
        assert_eq!(second.last_transition_time, first.last_transition_time);

        table.record(TUNNEL, &key, Some("c2"), ConditionReason::MirrorCollision, "taken");
        assert_eq!(table.get(TUNNEL, &key, Some("c2")).unwrap().attempts, 1);
    }

    #[test]
    fn clear_variants() {
        let table = ReplicationConditions::new();
        let key = ObjectKey::new(Some("default"), "tun-a");
        table.record(TUNNEL, &key, None, ConditionReason::MalformedMarker, "bad");
        table.record(TUNNEL, &key, Some("c1"), ConditionReason::UpsertFailed, "x");
        table.record(TUNNEL, &key, Some("c2"), ConditionReason::DeleteFailed, "y");

        assert!(!table.clear_reason(TUNNEL, &key, None, ConditionReason::UpsertFailed));
        assert!(table.clear_reason(TUNNEL, &key, None, ConditionReason::MalformedMarker));
        table.clear_cluster("c1");
        assert_eq!(table.list().len(), 1);
        table.clear_resource(TUNNEL);
        assert!(table.list().is_empty());
    }
}

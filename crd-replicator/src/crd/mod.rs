//! Custom Resource Definitions consumed by the replication engine.
//!
//! - [`PeerCluster`]: a peering descriptor, one per remote cluster
//! - [`ReplicationPolicy`]: resource kinds eligible for replication

mod peering;
mod policy;

pub use peering::{PeerCluster, PeerClusterSpec, PeerClusterStatus};
pub use policy::{ReplicationPolicy, ReplicationPolicySpec};

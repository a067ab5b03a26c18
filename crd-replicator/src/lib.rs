//! Multi-cluster custom resource replication.
//!
//! This crate replicates objects of registered kinds from a local cluster to
//! peer clusters and pulls the status of those mirrors back. The local object
//! owns the spec; the remote mirror owns the status.
//!
//! # Components
//!
//! - **Resource Type Registry** ([`resource`]): kinds eligible for replication
//! - **Remote Endpoint Registry** ([`peer`]): one handle per peer cluster
//! - **Local Watch Manager** ([`controller::local`]): fans local changes out
//!   to the destination peer
//! - **Remote Watch Manager** ([`controller::remote`]): writes mirror status
//!   back onto the local object
//! - **Peering Lifecycle Reconciler** ([`controller::peering`]): peer state
//!   machine and the only starter of watches
//! - **Watch subscriptions** ([`watch`]): the table of live subscriptions
//!
//! # Markers
//!
//! ```yaml
//! apiVersion: net.example.io/v1alpha1
//! kind: TunnelEndpoint
//! metadata:
//!   name: tun-a
//!   labels:
//!     replication.peering.io/local-origin: "true"
//!     replication.peering.io/destination-cluster: cluster-2
//! spec:
//!   podCIDR: 10.0.0.0/12
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conditions;
pub mod config;
pub mod connector;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod object;
pub mod observability;
pub mod peer;
pub mod resource;
pub mod retry;
pub mod store;
pub mod watch;

pub use config::ReplicatorConfig;
pub use crd::{PeerCluster, PeerClusterSpec, ReplicationPolicy, ReplicationPolicySpec};
pub use engine::{EngineBuilder, ReplicationEngine};
pub use error::{ReplicatorError, ReplicatorResult};
pub use peer::{PeerPhase, PeeringDescriptor};
pub use resource::{ResourceScope, ResourceTypeDescriptor};

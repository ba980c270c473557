//! Cluster Coordination
//!
//! Membership tracking over an injected group channel.
//!
//! # Architecture
//!
//! A [`CoordinatorRegistry`] opens one [`Coordinator`] per named
//! channel. The coordinator's pump task turns channel events into
//! atomic [`ClusterView`] swaps and listener callbacks; transport
//! trouble surfaces as advisory partition suspicions while the pump
//! reconnects with backoff.
//!
//! # Usage
//!
//! ```toml
//! # bufmesh.toml
//! [node]
//! name = "node-a"
//! channel = "analytics"
//! probe_interval = "5s"
//! ```

mod coordinator;
mod view;

pub use coordinator::{
    ClusterError, Coordinator, CoordinatorListener, CoordinatorRegistry, TaskHandle,
};
pub use view::ClusterView;

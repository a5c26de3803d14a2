//! dropscale-target — the droplet autoscaling target.
//!
//! Reconciles a desired worker count against the droplet fleet at the
//! provider. Scale-out pre-reserves addresses, composes secure
//! introduction into user-data, and creates workers concurrently;
//! scale-in drains nodes through the cluster host, shuts droplets down
//! gracefully, and sweeps abandoned credential tags. The fleet at the
//! provider is the only durable state: a process restart observes it
//! afresh on the next scale cycle.

pub mod cluster;
pub mod error;
mod scaling;
mod target;
mod template;

pub use cluster::{node_remote_id, ClusterHost, NodeResource, StaticClusterHost};
pub use error::TargetError;
pub use target::{DropletTarget, TargetStatus};
pub use template::{DropletTemplate, DEFAULT_INTRODUCTION_FILENAME};

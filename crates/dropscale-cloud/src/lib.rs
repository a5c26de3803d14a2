//! dropscale-cloud — DigitalOcean capability layer.
//!
//! Narrow, independently fakeable interfaces over the droplet, tag and
//! reserved-address APIs, plus the shared plumbing every caller of those
//! APIs needs: a paginator for list endpoints, a bounded retry engine
//! with transient-error classification, and a token-bucket rate limiter.
//!
//! Production code talks to the REST API through [`api::DropletApi`];
//! tests drive the same traits through [`fake::FakeCloud`].

pub mod api;
pub mod error;
pub mod fake;
pub mod paginate;
pub mod ratelimit;
pub mod retry;
pub mod traits;
pub mod types;

pub use error::{CloudError, CloudResult};
pub use paginate::Paginator;
pub use ratelimit::{RateLimitCancelled, RateLimiter};
pub use retry::{retry, retry_on_transient, AttemptError, RetryError};
pub use traits::{
    CloudProvider, DropletActions, Droplets, ReservedIpv4Actions, ReservedIpv4s,
    ReservedIpv6Actions, ReservedIpv6s, Tags,
};
pub use types::{
    Action, Droplet, DropletCreateRequest, DropletId, DropletStatus, ListOptions, NetworkV4,
    NetworkV6, Networks, PageInfo, Region, ReservedIpv4, ReservedIpv6, ResourceRef, SshKeyRef,
    Tag,
};

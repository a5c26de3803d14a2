//! Pool error types.

use dropscale_cloud::{CloudError, DropletId, RateLimitCancelled, RetryError};
use thiserror::Error;

/// Errors from pre-reservation and assignment.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("insufficient reserved IPv4 addresses")]
    InsufficientIpv4,

    #[error("insufficient reserved IPv6 addresses")]
    InsufficientIpv6,

    /// Assignment was requested for an address without a live
    /// pre-reservation (never claimed, expired, or already consumed).
    #[error("address {0} is not pre-reserved")]
    NotPrereserved(String),

    #[error("cannot enumerate reserved addresses")]
    List(#[source] CloudError),

    #[error("cannot create a new reserved address for region {region}")]
    Create {
        region: String,
        #[source]
        source: CloudError,
    },

    #[error("cannot assign {ip} to droplet {droplet_id}")]
    Assign {
        ip: String,
        droplet_id: DropletId,
        #[source]
        source: RetryError<CloudError>,
    },

    #[error(transparent)]
    Cancelled(#[from] RateLimitCancelled),
}

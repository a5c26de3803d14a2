//! Target error types.

use dropscale_cloud::{CloudError, DropletId, DropletStatus, RetryError};
use dropscale_pool::PoolError;
use dropscale_vault::BindError;
use thiserror::Error;

/// Errors surfaced by the scaling target.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("required config param {0} not found")]
    MissingConfig(&'static str),

    #[error("invalid value for config param {key}: {reason}")]
    InvalidConfig { key: &'static str, reason: String },

    #[error(
        "a secure introduction approle has been specified but neither reserved IP addresses nor a tag prefix are configured"
    )]
    NoIntroductionChannel,

    #[error("unable to find a DigitalOcean token")]
    MissingToken,

    #[error("failed to read token: {0}")]
    TokenRead(#[source] std::io::Error),

    #[error("target is not configured; set_config must be called first")]
    NotConfigured,

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("cannot pre-reserve {count} IPv{family} addresses")]
    Prereserve {
        family: u8,
        count: u64,
        #[source]
        source: PoolError,
    },

    #[error("failed to assign reserved address to droplet {droplet_id}")]
    AssignAddress {
        droplet_id: DropletId,
        #[source]
        source: PoolError,
    },

    #[error(transparent)]
    Bind(#[from] BindError),

    /// Transient marker used inside the stability poll.
    #[error("waiting for droplets to become stable")]
    AwaitingStability,

    #[error("failed to confirm droplet stability")]
    Stability(#[source] Box<RetryError<TargetError>>),

    #[error("timed out waiting for droplet {droplet_id} to become {status:?}")]
    StatusWait {
        droplet_id: DropletId,
        status: DropletStatus,
    },

    #[error("failed to scale out: {}", joined(.0))]
    ScaleOut(Vec<TargetError>),

    #[error("worker task failed: {0}")]
    Task(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,
}

/// Render an aggregate of per-worker failures on one line.
fn joined(errors: &[TargetError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_out_aggregate_joins_messages() {
        let err = TargetError::ScaleOut(vec![
            TargetError::MissingConfig("name"),
            TargetError::AwaitingStability,
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("required config param name not found"));
        assert!(rendered.contains("; waiting for droplets to become stable"));
    }
}

//! The reserved-address pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dropscale_cloud::{
    retry_on_transient, CloudProvider, DropletId, Paginator, RateLimiter,
};

use crate::error::PoolError;
use crate::{CREATE_BURST, CREATE_RECHARGE_SECS};

/// Live pre-reservations, keyed by address string and partitioned by
/// family. Values are claim expiry instants; the provider's own record
/// is re-listed on every pre-reserve, so nothing else needs caching.
#[derive(Default)]
struct PoolState {
    v4: HashMap<String, Instant>,
    v6: HashMap<String, Instant>,
}

/// Hands out provider reserved addresses under short-lived claims.
///
/// One lock serializes all pool operations, provider calls included:
/// two concurrent scale-outs never see the same address as free, at
/// the cost of pool-level work being sequential. Assignment retries
/// (the provider 422s on concurrent address actions) also run under
/// the lock.
pub struct ReservedAddressPool {
    provider: Arc<dyn CloudProvider>,
    limiter: RateLimiter,
    state: Mutex<PoolState>,
}

impl ReservedAddressPool {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self::with_rate_limiter(
            provider,
            RateLimiter::new(
                CREATE_BURST,
                Duration::from_secs(CREATE_RECHARGE_SECS),
                true,
            ),
        )
    }

    /// Override the creation rate limiter (tests use tiny buckets).
    pub fn with_rate_limiter(provider: Arc<dyn CloudProvider>, limiter: RateLimiter) -> Self {
        Self {
            provider,
            limiter,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Claim `count` unassigned IPv4 addresses for `expiry`.
    ///
    /// Addresses under a live claim are skipped; expired claims are
    /// collected first. When the listing comes up short and
    /// `create_if_missing` is set, new addresses are created under the
    /// creation rate limit; otherwise the call fails with no claims
    /// recorded. Claims recorded by earlier calls are never touched.
    pub async fn prereserve_ipv4s(
        &self,
        cancel: &CancellationToken,
        count: usize,
        region: &str,
        create_if_missing: bool,
        expiry: Duration,
    ) -> Result<Vec<String>, PoolError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.v4.retain(|_, expires| *expires > now);

        let listed = Paginator::new(|opts| self.provider.reserved_ipv4s().list(opts))
            .collect_all()
            .await
            .map_err(PoolError::List)?;

        let mut admitted: Vec<String> = Vec::with_capacity(count);
        for reservation in &listed {
            if admitted.len() == count {
                break;
            }
            if reservation.is_assigned()
                || reservation.region_slug().is_some_and(|slug| slug != region)
                || state.v4.contains_key(&reservation.ip)
            {
                continue;
            }
            admitted.push(reservation.ip.clone());
        }

        while admitted.len() < count {
            if !create_if_missing {
                return Err(PoolError::InsufficientIpv4);
            }
            self.limiter.consume(cancel).await?;
            let created = self
                .provider
                .reserved_ipv4s()
                .create(region)
                .await
                .map_err(|source| PoolError::Create {
                    region: region.to_string(),
                    source,
                })?;
            info!(ip = %created.ip, region, "created new reserved IPv4 address");
            admitted.push(created.ip);
        }

        let expires_at = Instant::now() + expiry;
        for ip in &admitted {
            state.v4.insert(ip.clone(), expires_at);
        }
        debug!(count = admitted.len(), region, "pre-reserved IPv4 addresses");
        Ok(admitted)
    }

    /// Assign a pre-reserved IPv4 address to a droplet.
    ///
    /// The claim is consumed whether or not the provider action
    /// succeeds; a failed assignment cannot be retried against the
    /// same claim.
    pub async fn assign_ipv4(
        &self,
        cancel: &CancellationToken,
        droplet_id: DropletId,
        ip: &str,
    ) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.v4.remove(ip) {
            Some(expires) if expires > now => {}
            _ => return Err(PoolError::NotPrereserved(ip.to_string())),
        }

        retry_on_transient(cancel, || {
            self.provider.reserved_ipv4_actions().assign(ip, droplet_id)
        })
        .await
        .map_err(|source| PoolError::Assign {
            ip: ip.to_string(),
            droplet_id,
            source,
        })?;

        info!(ip, droplet_id, "assigned reserved IPv4 address");
        Ok(())
    }

    /// IPv6 counterpart of [`Self::prereserve_ipv4s`].
    pub async fn prereserve_ipv6s(
        &self,
        cancel: &CancellationToken,
        count: usize,
        region: &str,
        create_if_missing: bool,
        expiry: Duration,
    ) -> Result<Vec<String>, PoolError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.v6.retain(|_, expires| *expires > now);

        let listed = Paginator::new(|opts| self.provider.reserved_ipv6s().list(opts))
            .collect_all()
            .await
            .map_err(PoolError::List)?;

        let mut admitted: Vec<String> = Vec::with_capacity(count);
        for reservation in &listed {
            if admitted.len() == count {
                break;
            }
            if reservation.is_assigned()
                || reservation.region_slug().is_some_and(|slug| slug != region)
                || state.v6.contains_key(&reservation.ip)
            {
                continue;
            }
            admitted.push(reservation.ip.clone());
        }

        while admitted.len() < count {
            if !create_if_missing {
                return Err(PoolError::InsufficientIpv6);
            }
            self.limiter.consume(cancel).await?;
            let created = self
                .provider
                .reserved_ipv6s()
                .create(region)
                .await
                .map_err(|source| PoolError::Create {
                    region: region.to_string(),
                    source,
                })?;
            info!(ip = %created.ip, region, "created new reserved IPv6 address");
            admitted.push(created.ip);
        }

        let expires_at = Instant::now() + expiry;
        for ip in &admitted {
            state.v6.insert(ip.clone(), expires_at);
        }
        debug!(count = admitted.len(), region, "pre-reserved IPv6 addresses");
        Ok(admitted)
    }

    /// IPv6 counterpart of [`Self::assign_ipv4`].
    pub async fn assign_ipv6(
        &self,
        cancel: &CancellationToken,
        droplet_id: DropletId,
        ip: &str,
    ) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.v6.remove(ip) {
            Some(expires) if expires > now => {}
            _ => return Err(PoolError::NotPrereserved(ip.to_string())),
        }

        retry_on_transient(cancel, || {
            self.provider.reserved_ipv6_actions().assign(ip, droplet_id)
        })
        .await
        .map_err(|source| PoolError::Assign {
            ip: ip.to_string(),
            droplet_id,
            source,
        })?;

        info!(ip, droplet_id, "assigned reserved IPv6 address");
        Ok(())
    }
}

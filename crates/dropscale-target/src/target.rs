//! The scaling target surface: `set_config`, `scale`, `status`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use dropscale_cloud::api::DropletApi;
use dropscale_cloud::CloudProvider;
use dropscale_pool::ReservedAddressPool;
use dropscale_vault::{IntroductionBinder, SecretIssuer};

use crate::cluster::ClusterHost;
use crate::error::TargetError;
use crate::scaling::{count_droplets, direction, Direction};
use crate::template::{ConfigView, DropletTemplate};

const KEY_TOKEN: &str = "token";
const TOKEN_ENV_VARS: [&str; 2] = ["DIGITALOCEAN_TOKEN", "DIGITALOCEAN_ACCESS_TOKEN"];

/// Pool state reported to the host.
#[derive(Debug, Clone, Default)]
pub struct TargetStatus {
    pub ready: bool,
    pub count: i64,
    pub meta: HashMap<String, String>,
}

/// Reconciles a desired worker count against the droplet fleet.
///
/// One instance lives per process; `set_config` (re)builds the provider
/// client and the reserved-address pool, and `scale`/`status` are
/// driven by the host with per-policy config maps.
pub struct DropletTarget {
    pub(crate) cancel: CancellationToken,
    pub(crate) agent_config: HashMap<String, String>,
    pub(crate) provider: Option<Arc<dyn CloudProvider>>,
    pub(crate) pool: Option<Arc<ReservedAddressPool>>,
    pub(crate) binder: Arc<IntroductionBinder>,
    pub(crate) cluster: Arc<dyn ClusterHost>,
}

impl DropletTarget {
    pub fn new(issuer: Arc<dyn SecretIssuer>, cluster: Arc<dyn ClusterHost>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            agent_config: HashMap::new(),
            provider: None,
            pool: None,
            binder: Arc::new(IntroductionBinder::new(issuer)),
            cluster,
        }
    }

    /// Build a target over an existing provider (embedding and tests);
    /// `set_config` would otherwise construct the REST client.
    pub fn with_provider(
        issuer: Arc<dyn SecretIssuer>,
        cluster: Arc<dyn ClusterHost>,
        provider: Arc<dyn CloudProvider>,
    ) -> Self {
        let mut target = Self::new(issuer, cluster);
        target.pool = Some(Arc::new(ReservedAddressPool::new(provider.clone())));
        target.provider = Some(provider);
        target
    }

    /// Store the agent configuration and (re)build the provider client
    /// and reserved-address pool from the configured token.
    pub fn set_config(&mut self, config: HashMap<String, String>) -> Result<(), TargetError> {
        self.agent_config = config;

        let token = match self.agent_config.get(KEY_TOKEN) {
            Some(value) => path_or_contents(value)?,
            None => env_token().ok_or(TargetError::MissingToken)?,
        };

        let provider: Arc<dyn CloudProvider> = Arc::new(DropletApi::new(token.trim_end()));
        self.pool = Some(Arc::new(ReservedAddressPool::new(provider.clone())));
        self.provider = Some(provider);
        Ok(())
    }

    /// Reconcile the fleet towards `desired` workers.
    ///
    /// A negative `desired` is the host's dry-run sentinel; the
    /// provider offers no simulation, so the call is a no-op.
    pub async fn scale(
        &self,
        desired: i64,
        config: &HashMap<String, String>,
    ) -> Result<(), TargetError> {
        if desired < 0 {
            return Ok(());
        }

        let template = DropletTemplate::from_config(&ConfigView {
            call: config,
            agent: &self.agent_config,
        })?;
        let provider = self.provider()?;

        let (total, _) = count_droplets(provider.droplets(), &template.name).await?;

        match direction(total, desired) {
            Direction::Out(diff) => self.scale_out(&template, desired, diff).await,
            Direction::In(diff) => self.scale_in(&template, desired, diff, config).await,
            Direction::None => {
                info!(
                    tag = %template.name,
                    current_count = total,
                    strategy_count = desired,
                    "scaling not required"
                );
                Ok(())
            }
        }
    }

    /// Report readiness and worker counts.
    ///
    /// The cluster readiness gate runs first; an unready pool
    /// short-circuits without touching the cloud.
    pub async fn status(
        &self,
        config: &HashMap<String, String>,
    ) -> Result<TargetStatus, TargetError> {
        let ready = self.cluster.is_pool_ready(config).await?;
        if !ready {
            return Ok(TargetStatus::default());
        }

        let template = DropletTemplate::from_config(&ConfigView {
            call: config,
            agent: &self.agent_config,
        })?;
        let provider = self.provider()?;
        let (total, active) = count_droplets(provider.droplets(), &template.name).await?;

        Ok(TargetStatus {
            ready: total == active,
            count: total,
            meta: HashMap::new(),
        })
    }

    /// Cancel every in-flight and future operation.
    ///
    /// Called when the host shuts the target down; waits, retries and
    /// rate-limited blocks all return promptly.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn provider(&self) -> Result<&Arc<dyn CloudProvider>, TargetError> {
        self.provider.as_ref().ok_or(TargetError::NotConfigured)
    }

    pub(crate) fn pool(&self) -> Result<&Arc<ReservedAddressPool>, TargetError> {
        self.pool.as_ref().ok_or(TargetError::NotConfigured)
    }
}

/// Resolve a config value that is either a literal token or a path to
/// a file holding it (`~` expands through `HOME`).
pub(crate) fn path_or_contents(value: &str) -> Result<String, TargetError> {
    if value.is_empty() {
        return Ok(String::new());
    }

    let mut path = value.to_string();
    if let Some(rest) = path.strip_prefix('~')
        && let Ok(home) = std::env::var("HOME")
    {
        path = format!("{home}{rest}");
    }

    if Path::new(&path).exists() {
        return std::fs::read_to_string(&path).map_err(TargetError::TokenRead);
    }

    Ok(value.to_string())
}

fn env_token() -> Option<String> {
    TOKEN_ENV_VARS
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
}

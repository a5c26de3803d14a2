//! Scale-out / scale-in orchestration.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dropscale_cloud::{
    retry, AttemptError, CloudError, CloudProvider, DropletCreateRequest, DropletId,
    DropletStatus, Droplets, Paginator, SshKeyRef,
};
use dropscale_pool::ReservedAddressPool;
use dropscale_vault::IntroductionBinder;

use crate::error::TargetError;
use crate::target::DropletTarget;
use crate::template::DropletTemplate;

/// Claims on pre-reserved addresses outlive a failed scale-out by at
/// most this long before expiry reclaims them.
const RESERVATION_EXPIRY: Duration = Duration::from_secs(5 * 60);

const STABLE_POLL_INTERVAL: Duration = Duration::from_secs(10);
const STABLE_POLL_ATTEMPTS: u32 = 15;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(3);
const POWER_OFF_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Tags snapshotted by the sweeper get this long to acquire their
/// droplet before an unreferenced tag is considered abandoned.
const TAG_SWEEP_DELAY: Duration = Duration::from_secs(60);

/// Which way a scale call moves the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Out(u64),
    In(u64),
    None,
}

pub(crate) fn direction(current: i64, desired: i64) -> Direction {
    if desired < current {
        Direction::In((current - desired) as u64)
    } else if desired > current {
        Direction::Out((desired - current) as u64)
    } else {
        Direction::None
    }
}

/// Count workers carrying the group tag: `(total, active)`.
pub(crate) async fn count_droplets(
    droplets: &dyn Droplets,
    tag: &str,
) -> Result<(i64, i64), CloudError> {
    let mut total: i64 = 0;
    let mut active: i64 = 0;
    let mut pager = Paginator::new(|opts| droplets.list_by_tag(tag, opts));
    while let Some(page) = pager.next_page().await {
        let page = page?;
        total += page.len() as i64;
        active += page.iter().filter(|d| d.is_active()).count() as i64;
    }
    Ok((total, active))
}

impl DropletTarget {
    pub(crate) async fn scale_out(
        &self,
        template: &DropletTemplate,
        desired: i64,
        diff: u64,
    ) -> Result<(), TargetError> {
        let provider = self.provider()?.clone();
        let pool = self.pool()?.clone();
        info!(
            action = "scale_out",
            tag = %template.name,
            count = diff,
            "creating droplets"
        );

        let reserved_v4 = if template.reserve_ipv4 {
            pool.prereserve_ipv4s(
                &self.cancel,
                diff as usize,
                &template.region,
                template.create_reserved_addresses,
                RESERVATION_EXPIRY,
            )
            .await
            .map_err(|source| TargetError::Prereserve {
                family: 4,
                count: diff,
                source,
            })?
        } else {
            Vec::new()
        };
        let reserved_v6 = if template.reserve_ipv6 {
            pool.prereserve_ipv6s(
                &self.cancel,
                diff as usize,
                &template.region,
                template.create_reserved_addresses,
                RESERVATION_EXPIRY,
            )
            .await
            .map_err(|source| TargetError::Prereserve {
                family: 6,
                count: diff,
                source,
            })?
        } else {
            Vec::new()
        };

        let user_data = load_user_data(&template.user_data).await;

        let mut tasks = JoinSet::new();
        for i in 0..diff as usize {
            tasks.spawn(create_worker(
                provider.clone(),
                pool.clone(),
                self.binder.clone(),
                self.cancel.clone(),
                template.clone(),
                user_data.clone(),
                reserved_v4.get(i).cloned(),
                reserved_v6.get(i).cloned(),
            ));
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(
                        action = "scale_out",
                        tag = %template.name,
                        error = %err,
                        "worker creation failed"
                    );
                    failures.push(err);
                }
                Err(join_err) => failures.push(TargetError::Task(join_err.to_string())),
            }
        }
        if !failures.is_empty() {
            return Err(TargetError::ScaleOut(failures));
        }

        debug!(tag = %template.name, "successfully created droplets");
        self.ensure_stable(template, desired).await?;
        debug!(tag = %template.name, "scale out confirmed");
        Ok(())
    }

    pub(crate) async fn scale_in(
        &self,
        template: &DropletTemplate,
        desired: i64,
        diff: u64,
        config: &std::collections::HashMap<String, String>,
    ) -> Result<(), TargetError> {
        let drained = self
            .cluster
            .run_pre_scale_in(config, diff as usize)
            .await
            .map_err(TargetError::Cluster)?;
        let names: HashSet<String> = drained
            .iter()
            .map(|node| node.remote_resource_id.clone())
            .collect();

        info!(
            action = "scale_in",
            tag = %template.name,
            count = diff,
            "deleting droplets"
        );

        self.delete_droplets(template, &names).await?;
        debug!(tag = %template.name, "successfully started deletion process");

        self.ensure_stable(template, desired).await?;
        debug!(tag = %template.name, "scale in confirmed");

        self.cluster
            .run_post_scale_in(config, &drained)
            .await
            .map_err(TargetError::Cluster)?;

        if !template.tag_prefix.is_empty() {
            let provider = self.provider()?.clone();
            let prefix = template.tag_prefix.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                sweep_credential_tags(provider, &prefix, &cancel).await;
            });
        }

        Ok(())
    }

    /// Shut down every listed droplet whose name was drained, one page
    /// at a time: a page's shutdowns complete before the next page is
    /// fetched, so the listing never races its own deletions.
    async fn delete_droplets(
        &self,
        template: &DropletTemplate,
        names: &HashSet<String>,
    ) -> Result<(), TargetError> {
        let provider = self.provider()?.clone();
        let mut pager = Paginator::new(|opts| provider.droplets().list_by_tag(&template.name, opts));
        let mut started = 0usize;

        while let Some(page) = pager.next_page().await {
            let page = page?;
            let mut tasks: JoinSet<()> = JoinSet::new();
            for droplet in page {
                if !names.contains(&droplet.name) {
                    continue;
                }
                started += 1;
                let provider = provider.clone();
                let cancel = self.cancel.clone();
                tasks.spawn(async move {
                    if let Err(err) = shutdown_droplet(provider.as_ref(), &cancel, droplet.id).await
                    {
                        // Best effort per droplet; the stability wait
                        // and the next scale cycle observe leftovers.
                        warn!(
                            action = "delete",
                            droplet_id = droplet.id,
                            error = %err,
                            "error deleting droplet"
                        );
                    }
                });
            }
            while tasks.join_next().await.is_some() {}

            if started == names.len() {
                break;
            }
        }

        Ok(())
    }

    /// Poll worker counts until exactly `desired` are active.
    pub(crate) async fn ensure_stable(
        &self,
        template: &DropletTemplate,
        desired: i64,
    ) -> Result<(), TargetError> {
        let provider = self.provider()?.clone();
        retry(
            &self.cancel,
            STABLE_POLL_INTERVAL,
            STABLE_POLL_ATTEMPTS,
            || {
                let droplets = provider.droplets();
                let name = template.name.as_str();
                async move {
                    let (_, active) = count_droplets(droplets, name)
                        .await
                        .map_err(|err| AttemptError::Fatal(TargetError::Cloud(err)))?;
                    if active == desired {
                        Ok(())
                    } else {
                        Err(AttemptError::Transient(TargetError::AwaitingStability))
                    }
                }
            },
        )
        .await
        .map_err(|err| TargetError::Stability(Box::new(err)))
    }

    /// Delete workers that outlived their grace period without being
    /// claimed by the cluster.
    ///
    /// `whitelist` holds the names of workers known to the cluster;
    /// anything younger than `grace` is left alone unconditionally,
    /// since freshly booted workers register asynchronously.
    pub async fn delete_orphaned_workers(
        &self,
        config: &std::collections::HashMap<String, String>,
        whitelist: &HashSet<String>,
        grace: Duration,
    ) -> Result<u64, TargetError> {
        let template = DropletTemplate::from_config(&crate::template::ConfigView {
            call: config,
            agent: &self.agent_config,
        })?;
        let provider = self.provider()?.clone();

        let droplets = Paginator::new(|opts| provider.droplets().list_by_tag(&template.name, opts))
            .collect_all()
            .await?;

        let now = chrono::Utc::now();
        let mut deleted = 0u64;
        for droplet in droplets {
            let age = now.signed_duration_since(droplet.created_at);
            if !age.to_std().is_ok_and(|a| a > grace) {
                continue;
            }
            if whitelist.contains(&droplet.name) {
                continue;
            }
            match provider.droplets().delete(droplet.id).await {
                Ok(()) => {
                    info!(
                        action = "delete",
                        droplet_id = droplet.id,
                        tag = %template.name,
                        "deleted orphaned droplet"
                    );
                    deleted += 1;
                }
                Err(err) => warn!(
                    action = "delete",
                    droplet_id = droplet.id,
                    error = %err,
                    "failed to delete orphaned droplet"
                ),
            }
        }
        Ok(deleted)
    }
}

/// One scale-out worker: compose user-data, create the droplet, bind
/// its reserved addresses, and run tag delivery when that channel is
/// in use. Each worker fails independently; the caller aggregates.
#[allow(clippy::too_many_arguments)]
async fn create_worker(
    provider: Arc<dyn CloudProvider>,
    pool: Arc<ReservedAddressPool>,
    binder: Arc<IntroductionBinder>,
    cancel: CancellationToken,
    template: DropletTemplate,
    user_data: String,
    reserved_v4: Option<String>,
    reserved_v6: Option<String>,
) -> Result<(), TargetError> {
    let name = format!("{}-{}", template.name, Uuid::new_v4());

    let mut user_data = user_data;
    let introduction = template.introduction();
    if let Some(intro) = &introduction {
        user_data = binder
            .user_data_for_new_worker(
                &user_data,
                intro,
                reserved_v4.as_deref(),
                reserved_v6.as_deref(),
            )
            .await?;
    }

    let request = DropletCreateRequest {
        name,
        region: template.region.clone(),
        size: template.size.clone(),
        vpc_uuid: Some(template.vpc.clone()),
        image: template.snapshot_id,
        tags: template.tags.clone(),
        ipv6: template.ipv6,
        ssh_keys: template
            .ssh_keys
            .iter()
            .map(|fingerprint| SshKeyRef {
                fingerprint: fingerprint.clone(),
            })
            .collect(),
        user_data: if user_data.is_empty() {
            None
        } else {
            Some(user_data)
        },
    };

    let droplet = provider.droplets().create(&request).await?;
    info!(
        action = "scale_out",
        droplet_id = droplet.id,
        name = %droplet.name,
        "created droplet"
    );

    if let Some(ip) = &reserved_v4 {
        pool.assign_ipv4(&cancel, droplet.id, ip)
            .await
            .map_err(|source| TargetError::AssignAddress {
                droplet_id: droplet.id,
                source,
            })?;
    }
    if let Some(ip) = &reserved_v6 {
        pool.assign_ipv6(&cancel, droplet.id, ip)
            .await
            .map_err(|source| TargetError::AssignAddress {
                droplet_id: droplet.id,
                source,
            })?;
    }

    // Without a reserved address the credential could not ride in the
    // user-data; deliver it through the tag channel instead.
    if let Some(intro) = &introduction
        && !intro.tag_prefix.is_empty()
        && reserved_v4.is_none()
        && reserved_v6.is_none()
    {
        binder
            .tag_new_worker(
                &cancel,
                intro,
                droplet.id,
                template.ipv6,
                provider.droplets(),
                provider.tags(),
            )
            .await?;
    }

    Ok(())
}

/// Gracefully remove one droplet: power off, wait for `off`, delete.
///
/// A power-off wait timeout is logged and deletion proceeds anyway;
/// the provider accepts deletion of a droplet that is still shutting
/// down.
pub(crate) async fn shutdown_droplet(
    provider: &dyn CloudProvider,
    cancel: &CancellationToken,
    id: DropletId,
) -> Result<(), TargetError> {
    debug!(droplet_id = id, "gracefully shutting down droplet");
    provider.droplet_actions().power_off(id).await?;

    if let Err(err) = wait_for_droplet_status(
        provider.droplets(),
        cancel,
        id,
        DropletStatus::Off,
        POWER_OFF_DEADLINE,
    )
    .await
    {
        warn!(
            droplet_id = id,
            error = %err,
            "timeout while waiting for droplet to become off"
        );
    }

    debug!(droplet_id = id, "deleting droplet");
    provider.droplets().delete(id).await?;
    Ok(())
}

/// Poll a droplet until it reports `want`, within `deadline`.
async fn wait_for_droplet_status(
    droplets: &dyn Droplets,
    cancel: &CancellationToken,
    id: DropletId,
    want: DropletStatus,
    deadline: Duration,
) -> Result<(), TargetError> {
    let wait = async {
        loop {
            let droplet = droplets.get(id).await?;
            if droplet.status == want {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TargetError::Cancelled),
                _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
            }
        }
    };
    match tokio::time::timeout(deadline, wait).await {
        Ok(result) => result,
        Err(_) => Err(TargetError::StatusWait {
            droplet_id: id,
            status: want,
        }),
    }
}

/// Delete credential tags that no longer reference any droplet.
///
/// Only tags present in an initial snapshot are candidates, and they
/// are re-checked after [`TAG_SWEEP_DELAY`]: a tag created for a
/// droplet that has not been attached yet is in the current listing
/// but not the snapshot, so it survives.
pub(crate) async fn sweep_credential_tags(
    provider: Arc<dyn CloudProvider>,
    prefix: &str,
    cancel: &CancellationToken,
) {
    let snapshot = match list_prefixed_tags(provider.as_ref(), prefix).await {
        Ok(tags) => tags
            .into_iter()
            .map(|tag| tag.name)
            .collect::<HashSet<String>>(),
        Err(err) => {
            warn!(error = %err, prefix, "tag sweep aborted: cannot list tags");
            return;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(TAG_SWEEP_DELAY) => {}
    }

    let current = match list_prefixed_tags(provider.as_ref(), prefix).await {
        Ok(tags) => tags,
        Err(err) => {
            warn!(error = %err, prefix, "tag sweep aborted: cannot re-list tags");
            return;
        }
    };

    for tag in current {
        if !snapshot.contains(&tag.name) || tag.resources.count != 0 {
            continue;
        }
        match provider.tags().delete(&tag.name).await {
            Ok(()) => info!(action = "delete", tag = %tag.name, "deleted unused credential tag"),
            Err(err) => warn!(
                action = "delete",
                tag = %tag.name,
                error = %err,
                "failed to delete unused credential tag"
            ),
        }
    }
}

async fn list_prefixed_tags(
    provider: &dyn CloudProvider,
    prefix: &str,
) -> Result<Vec<dropscale_cloud::Tag>, CloudError> {
    let all = Paginator::new(|opts| provider.tags().list(opts))
        .collect_all()
        .await?;
    Ok(all
        .into_iter()
        .filter(|tag| tag.name.starts_with(prefix))
        .collect())
}

/// The `user_data` config value is either a path to a file holding the
/// data or the data itself.
async fn load_user_data(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    match tokio::fs::read_to_string(value).await {
        Ok(contents) => contents,
        Err(_) => value.to_string(),
    }
}

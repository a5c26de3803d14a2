//! Secure-introduction delivery.
//!
//! Two channels exist, chosen per worker:
//!
//! - **Pre-boot**: when a reserved address is bound to the worker, its
//!   public IP is known before creation, so the wrapped credential is
//!   issued up front and a fragment that writes it to disk is
//!   prepended to the user-data.
//! - **Post-boot tag**: without a reservation the IP is only known
//!   after creation. The user-data gets a fragment that polls the
//!   instance metadata endpoint for a tag carrying the credential,
//!   while the control side waits for the droplet's addresses, issues
//!   the credential bound to them, and attaches it as a tag.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dropscale_cloud::{
    retry, retry_on_transient, AttemptError, CloudError, DropletId, Droplets, ResourceRef,
    RetryError, Tags,
};
use dropscale_cloudinit::{prepend_shell_script, ComposeError};

use crate::issuer::{IssueError, SecretIssuer};
use crate::tag_safe;

/// Instance metadata endpoint serving the droplet's own tags.
const METADATA_TAGS_URL: &str = "http://169.254.169.254/metadata/v1/tags";

const NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(6);
const NETWORK_POLL_ATTEMPTS: u32 = 10;

/// Secure-introduction parameters of one worker group.
#[derive(Debug, Clone)]
pub struct IntroductionConfig {
    pub approle: String,
    /// Tag-channel prefix; empty disables the tag channel.
    pub tag_prefix: String,
    /// Absolute path on the worker the credential is written to.
    pub filename: String,
    pub secret_ttl: Duration,
    pub wrap_ttl: Duration,
}

/// Secure-introduction failures.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to generate wrapped secure introduction")]
    Issue(#[from] IssueError),

    #[error("failed to insert secure introduction into user data")]
    Compose(#[from] ComposeError),

    #[error("could not determine the droplet's IP addresses")]
    AwaitNetworks(#[source] RetryError<NetworkWaitError>),

    #[error("failed to create secure introduction tag for droplet {droplet_id}")]
    CreateTag {
        droplet_id: DropletId,
        #[source]
        source: CloudError,
    },

    #[error("failed to tag droplet {droplet_id} with wrapped secure introduction")]
    AttachTag {
        droplet_id: DropletId,
        #[source]
        source: RetryError<CloudError>,
    },
}

/// Why one poll of the droplet's network metadata did not yield
/// addresses yet.
#[derive(Debug, Error)]
pub enum NetworkWaitError {
    #[error("cannot retrieve droplet metadata: {0}")]
    Get(#[from] CloudError),

    #[error("no IPv4 network information is yet available")]
    NoIpv4,

    #[error("no IPv6 network information is yet available")]
    NoIpv6,
}

/// The boot fragment writing an already-issued credential to disk.
pub fn write_credential_script(token: &str, filename: &str) -> String {
    format!(
        "#!/bin/sh\n\
         echo \"{token}\" > \"{filename}\"\n"
    )
}

/// The boot fragment polling instance metadata for the credential tag.
///
/// The control side attaches the tag shortly after creation; a minute
/// of one-second retries covers the gap. The fragment exits 0 once
/// exactly one credential line has been extracted, 1 otherwise.
pub fn tag_poll_script(tag_prefix: &str, filename: &str) -> String {
    format!(
        "#!/bin/sh\n\
         \n\
         for ATTEMPT in $(seq 1 60) ; do\n\
         \x20   curl -s {METADATA_TAGS_URL} | sed -n 's#{tag_prefix}##p' | head -n 1 > \"{filename}\"\n\
         \x20   if [ \"$(wc -l < \"{filename}\")\" = \"1\" ] ; then\n\
         \x20       exit 0\n\
         \x20   fi\n\
         \x20   sleep 1\n\
         done\n\
         exit 1\n"
    )
}

/// Applies secure introduction to new workers.
pub struct IntroductionBinder {
    issuer: Arc<dyn SecretIssuer>,
}

impl IntroductionBinder {
    pub fn new(issuer: Arc<dyn SecretIssuer>) -> Self {
        Self { issuer }
    }

    /// Compute the final user-data for a worker about to be created.
    ///
    /// With a known address the credential itself is baked in; with a
    /// tag prefix the polling fragment is baked in; with neither the
    /// user-data passes through untouched (template validation rejects
    /// that combination when an approle is configured).
    pub async fn user_data_for_new_worker(
        &self,
        user_data: &str,
        config: &IntroductionConfig,
        allowed_ipv4: Option<&str>,
        allowed_ipv6: Option<&str>,
    ) -> Result<String, BindError> {
        if allowed_ipv4.is_some() || allowed_ipv6.is_some() {
            let token = self
                .issuer
                .issue_wrapped_credential(
                    &config.approle,
                    allowed_ipv4,
                    allowed_ipv6,
                    config.secret_ttl,
                    config.wrap_ttl,
                )
                .await?;
            let script = write_credential_script(&token, &config.filename);
            let result = prepend_shell_script(user_data, &script)?;
            debug!(
                ipv4 = allowed_ipv4.unwrap_or(""),
                ipv6 = allowed_ipv6.unwrap_or(""),
                "embedded wrapped credential in user data"
            );
            return Ok(result);
        }

        if !config.tag_prefix.is_empty() {
            let script = tag_poll_script(&config.tag_prefix, &config.filename);
            return Ok(prepend_shell_script(user_data, &script)?);
        }

        Ok(user_data.to_string())
    }

    /// Post-creation phase of the tag channel.
    ///
    /// Creation responses carry no network information; the droplet's
    /// addresses appear in its metadata shortly afterwards. Poll for
    /// them, issue a credential bound to them, and attach it as a tag
    /// named `prefix || credential`.
    pub async fn tag_new_worker(
        &self,
        cancel: &CancellationToken,
        config: &IntroductionConfig,
        droplet_id: DropletId,
        ipv6_enabled: bool,
        droplets: &dyn Droplets,
        tags: &dyn Tags,
    ) -> Result<(), BindError> {
        let (ipv4, ipv6) = retry(
            cancel,
            NETWORK_POLL_INTERVAL,
            NETWORK_POLL_ATTEMPTS,
            || async move {
                let droplet = droplets
                    .get(droplet_id)
                    .await
                    .map_err(|err| AttemptError::Transient(NetworkWaitError::Get(err)))?;
                let ipv4 = droplet
                    .networks
                    .v4
                    .first()
                    .map(|n| n.ip_address.clone())
                    .ok_or(AttemptError::Transient(NetworkWaitError::NoIpv4))?;
                let ipv6 = if ipv6_enabled {
                    Some(
                        droplet
                            .networks
                            .v6
                            .first()
                            .map(|n| n.ip_address.clone())
                            .ok_or(AttemptError::Transient(NetworkWaitError::NoIpv6))?,
                    )
                } else {
                    None
                };
                Ok((ipv4, ipv6))
            },
        )
        .await
        .map_err(BindError::AwaitNetworks)?;

        info!(
            droplet_id,
            %ipv4,
            ipv6 = ipv6.as_deref().unwrap_or(""),
            "droplet addresses are available"
        );

        let token = self
            .issuer
            .issue_wrapped_credential(
                &config.approle,
                Some(&ipv4),
                ipv6.as_deref(),
                config.secret_ttl,
                config.wrap_ttl,
            )
            .await?;

        let tag_name = format!("{}{}", config.tag_prefix, tag_safe(&token));
        tags.create(&tag_name)
            .await
            .map_err(|source| BindError::CreateTag { droplet_id, source })?;

        // Tagging races other in-flight droplet operations and the
        // provider answers 422 until they settle.
        let resources = [ResourceRef::droplet(droplet_id)];
        retry_on_transient(cancel, || tags.tag_resources(&tag_name, &resources))
            .await
            .map_err(|source| BindError::AttachTag { droplet_id, source })?;

        info!(droplet_id, "secure introduction tag has been added");
        Ok(())
    }
}

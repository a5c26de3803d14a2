//! Wrapped credential issuance.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::tag_safe;

/// Credential issuance failures.
#[derive(Debug, Error)]
pub enum IssueError {
    /// Neither an IPv4 nor an IPv6 bind address was supplied.
    #[error("at least one authorised IP address must be provided")]
    NoBindAddress,

    #[error("vault is not configured: {0} is not set")]
    MissingEnv(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("vault returned http {status}: {message}")]
    Api { status: u16, message: String },

    #[error("vault response carried no wrapping token")]
    NoWrapToken,
}

impl From<reqwest::Error> for IssueError {
    fn from(err: reqwest::Error) -> Self {
        IssueError::Transport(err.to_string())
    }
}

/// Issues wrapped, IP-scoped, single-use credentials.
#[async_trait]
pub trait SecretIssuer: Send + Sync {
    /// Create a credential for `approle` redeemable once, only from
    /// the given addresses, within `secret_ttl`; the returned wrapping
    /// token itself expires after `wrap_ttl`.
    async fn issue_wrapped_credential(
        &self,
        approle: &str,
        allowed_ipv4: Option<&str>,
        allowed_ipv6: Option<&str>,
        secret_ttl: Duration,
        wrap_ttl: Duration,
    ) -> Result<String, IssueError>;
}

/// The host-exact CIDRs an issued credential is bound to.
fn bind_cidrs(allowed_ipv4: Option<&str>, allowed_ipv6: Option<&str>) -> Vec<String> {
    let mut cidrs = Vec::with_capacity(2);
    if let Some(ipv4) = allowed_ipv4 {
        cidrs.push(format!("{ipv4}/32"));
    }
    if let Some(ipv6) = allowed_ipv6 {
        cidrs.push(format!("{ipv6}/128"));
    }
    cidrs
}

fn mock_token(allowed_ipv4: Option<&str>, allowed_ipv6: Option<&str>) -> String {
    tag_safe(&format!(
        "mock-wrapped-token-for-{}-and-{}",
        allowed_ipv4.unwrap_or(""),
        allowed_ipv6.unwrap_or("")
    ))
}

/// Vault-backed issuer writing AppRole secret-ids with response
/// wrapping.
pub struct VaultIssuer {
    http: reqwest::Client,
    addr: String,
    token: String,
}

#[derive(Deserialize)]
struct WrapResponse {
    wrap_info: Option<WrapInfo>,
}

#[derive(Deserialize)]
struct WrapInfo {
    token: String,
}

impl VaultIssuer {
    /// Configure from `VAULT_ADDR` and `VAULT_TOKEN`.
    pub fn from_env() -> Result<Self, IssueError> {
        let addr =
            std::env::var("VAULT_ADDR").map_err(|_| IssueError::MissingEnv("VAULT_ADDR"))?;
        let token =
            std::env::var("VAULT_TOKEN").map_err(|_| IssueError::MissingEnv("VAULT_TOKEN"))?;
        Ok(Self::new(addr, token))
    }

    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl SecretIssuer for VaultIssuer {
    async fn issue_wrapped_credential(
        &self,
        approle: &str,
        allowed_ipv4: Option<&str>,
        allowed_ipv6: Option<&str>,
        secret_ttl: Duration,
        wrap_ttl: Duration,
    ) -> Result<String, IssueError> {
        if allowed_ipv4.is_none() && allowed_ipv6.is_none() {
            return Err(IssueError::NoBindAddress);
        }

        // Exercised in environments with no Vault available: a
        // deterministic, tag-safe stand-in token.
        if approle == "mock" {
            return Ok(mock_token(allowed_ipv4, allowed_ipv6));
        }

        let cidrs = bind_cidrs(allowed_ipv4, allowed_ipv6);
        let url = format!("{}/v1/auth/approle/role/{approle}/secret-id", self.addr);
        let resp = self
            .http
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .header("X-Vault-Wrap-TTL", wrap_ttl.as_secs().to_string())
            .json(&json!({
                "cidr_list": &cidrs,
                "token_bound_cidrs": &cidrs,
                "num_uses": 1,
                "ttl": format!("{}s", secret_ttl.as_secs()),
            }))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(IssueError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let parsed: WrapResponse = serde_json::from_slice(&body)
            .map_err(|err| IssueError::Transport(err.to_string()))?;
        debug!(approle, cidrs = ?cidrs, "issued wrapped secret-id");
        parsed
            .wrap_info
            .map(|w| w.token)
            .ok_or(IssueError::NoWrapToken)
    }
}

/// Deterministic issuer for tests, emitting the same tokens as the
/// `mock` approle path.
#[derive(Default)]
pub struct MockIssuer;

#[async_trait]
impl SecretIssuer for MockIssuer {
    async fn issue_wrapped_credential(
        &self,
        _approle: &str,
        allowed_ipv4: Option<&str>,
        allowed_ipv6: Option<&str>,
        _secret_ttl: Duration,
        _wrap_ttl: Duration,
    ) -> Result<String, IssueError> {
        if allowed_ipv4.is_none() && allowed_ipv6.is_none() {
            return Err(IssueError::NoBindAddress);
        }
        Ok(mock_token(allowed_ipv4, allowed_ipv6))
    }
}

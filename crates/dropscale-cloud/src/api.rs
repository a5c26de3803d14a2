//! REST client for the provider API.
//!
//! Implements the capability traits against the DigitalOcean v2 HTTP
//! API. Only the endpoints the scaling core uses are covered.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::error::{CloudError, CloudResult};
use crate::traits::{
    CloudProvider, DropletActions, Droplets, ReservedIpv4Actions, ReservedIpv4s,
    ReservedIpv6Actions, ReservedIpv6s, Tags,
};
use crate::types::{
    Action, Droplet, DropletCreateRequest, DropletId, ListOptions, PageInfo, ReservedIpv4,
    ReservedIpv6, ResourceRef, Tag,
};

const DEFAULT_BASE: &str = "https://api.digitalocean.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Authenticated client for one provider account.
pub struct DropletApi {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl DropletApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base(token, DEFAULT_BASE)
    }

    /// Point the client at a different API root (test servers).
    pub fn with_base(token: impl Into<String>, base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base: base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
    }

    fn paged(&self, method: Method, path: &str, opts: ListOptions) -> RequestBuilder {
        let mut rb = self.request(method, path);
        if let Some(page) = opts.page {
            rb = rb.query(&[("page", page)]);
        }
        if let Some(per_page) = opts.per_page {
            rb = rb.query(&[("per_page", per_page)]);
        }
        rb
    }

    async fn send_json<T: DeserializeOwned>(&self, rb: RequestBuilder) -> CloudResult<T> {
        let body = self.send(rb).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn send_empty(&self, rb: RequestBuilder) -> CloudResult<()> {
        self.send(rb).await.map(|_| ())
    }

    async fn send(&self, rb: RequestBuilder) -> CloudResult<Vec<u8>> {
        let resp = rb.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(CloudError::Api {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        Ok(body.to_vec())
    }
}

/// Error body shape: `{"id": "...", "message": "..."}`.
#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

fn error_message(body: &[u8]) -> String {
    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(parsed) => parsed.message,
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

#[derive(Deserialize)]
struct Links {
    #[serde(default)]
    pages: Option<Pages>,
}

#[derive(Deserialize)]
struct Pages {
    #[serde(default)]
    next: Option<String>,
}

/// The API reports position via `links.pages`; a missing `next` link
/// marks the final page. The current page is the one we asked for.
fn page_info(opts: ListOptions, links: Option<&Links>) -> PageInfo {
    PageInfo {
        current: opts.page.unwrap_or(1),
        last: links
            .and_then(|l| l.pages.as_ref())
            .and_then(|p| p.next.as_ref())
            .is_none(),
    }
}

#[derive(Deserialize)]
struct DropletsPage {
    droplets: Vec<Droplet>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct ActionEnvelope {
    action: Action,
}

#[derive(Deserialize)]
struct ReservedIpv4Page {
    reserved_ips: Vec<ReservedIpv4>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
struct ReservedIpv4Envelope {
    reserved_ip: ReservedIpv4,
}

#[derive(Deserialize)]
struct ReservedIpv6Page {
    reserved_ipv6s: Vec<ReservedIpv6>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
struct ReservedIpv6Envelope {
    reserved_ipv6: ReservedIpv6,
}

#[derive(Deserialize)]
struct TagsPage {
    tags: Vec<Tag>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
struct TagEnvelope {
    tag: Tag,
}

#[async_trait]
impl Droplets for DropletApi {
    async fn list_by_tag(
        &self,
        tag: &str,
        opts: ListOptions,
    ) -> CloudResult<(Vec<Droplet>, PageInfo)> {
        let rb = self
            .paged(Method::GET, "/v2/droplets", opts)
            .query(&[("tag_name", tag)]);
        let page: DropletsPage = self.send_json(rb).await?;
        let info = page_info(opts, page.links.as_ref());
        Ok((page.droplets, info))
    }

    async fn create(&self, req: &DropletCreateRequest) -> CloudResult<Droplet> {
        let rb = self.request(Method::POST, "/v2/droplets").json(req);
        let env: DropletEnvelope = self.send_json(rb).await?;
        Ok(env.droplet)
    }

    async fn get(&self, id: DropletId) -> CloudResult<Droplet> {
        let rb = self.request(Method::GET, &format!("/v2/droplets/{id}"));
        let env: DropletEnvelope = self.send_json(rb).await?;
        Ok(env.droplet)
    }

    async fn delete(&self, id: DropletId) -> CloudResult<()> {
        let rb = self.request(Method::DELETE, &format!("/v2/droplets/{id}"));
        self.send_empty(rb).await
    }
}

#[async_trait]
impl DropletActions for DropletApi {
    async fn power_off(&self, id: DropletId) -> CloudResult<Action> {
        let rb = self
            .request(Method::POST, &format!("/v2/droplets/{id}/actions"))
            .json(&json!({ "type": "power_off" }));
        let env: ActionEnvelope = self.send_json(rb).await?;
        Ok(env.action)
    }
}

#[async_trait]
impl Tags for DropletApi {
    async fn list(&self, opts: ListOptions) -> CloudResult<(Vec<Tag>, PageInfo)> {
        let rb = self.paged(Method::GET, "/v2/tags", opts);
        let page: TagsPage = self.send_json(rb).await?;
        let info = page_info(opts, page.links.as_ref());
        Ok((page.tags, info))
    }

    async fn create(&self, name: &str) -> CloudResult<Tag> {
        let rb = self
            .request(Method::POST, "/v2/tags")
            .json(&json!({ "name": name }));
        let env: TagEnvelope = self.send_json(rb).await?;
        Ok(env.tag)
    }

    async fn tag_resources(&self, name: &str, resources: &[ResourceRef]) -> CloudResult<()> {
        let rb = self
            .request(Method::POST, &format!("/v2/tags/{name}/resources"))
            .json(&json!({ "resources": resources }));
        self.send_empty(rb).await
    }

    async fn untag_resources(&self, name: &str, resources: &[ResourceRef]) -> CloudResult<()> {
        let rb = self
            .request(Method::DELETE, &format!("/v2/tags/{name}/resources"))
            .json(&json!({ "resources": resources }));
        self.send_empty(rb).await
    }

    async fn delete(&self, name: &str) -> CloudResult<()> {
        let rb = self.request(Method::DELETE, &format!("/v2/tags/{name}"));
        self.send_empty(rb).await
    }
}

#[async_trait]
impl ReservedIpv4s for DropletApi {
    async fn list(&self, opts: ListOptions) -> CloudResult<(Vec<ReservedIpv4>, PageInfo)> {
        let rb = self.paged(Method::GET, "/v2/reserved_ips", opts);
        let page: ReservedIpv4Page = self.send_json(rb).await?;
        let info = page_info(opts, page.links.as_ref());
        Ok((page.reserved_ips, info))
    }

    async fn create(&self, region: &str) -> CloudResult<ReservedIpv4> {
        let rb = self
            .request(Method::POST, "/v2/reserved_ips")
            .json(&json!({ "region": region }));
        let env: ReservedIpv4Envelope = self.send_json(rb).await?;
        Ok(env.reserved_ip)
    }
}

#[async_trait]
impl ReservedIpv4Actions for DropletApi {
    async fn assign(&self, ip: &str, droplet_id: DropletId) -> CloudResult<Action> {
        let rb = self
            .request(Method::POST, &format!("/v2/reserved_ips/{ip}/actions"))
            .json(&json!({ "type": "assign", "droplet_id": droplet_id }));
        let env: ActionEnvelope = self.send_json(rb).await?;
        Ok(env.action)
    }
}

#[async_trait]
impl ReservedIpv6s for DropletApi {
    async fn list(&self, opts: ListOptions) -> CloudResult<(Vec<ReservedIpv6>, PageInfo)> {
        let rb = self.paged(Method::GET, "/v2/reserved_ipv6", opts);
        let page: ReservedIpv6Page = self.send_json(rb).await?;
        let info = page_info(opts, page.links.as_ref());
        Ok((page.reserved_ipv6s, info))
    }

    async fn create(&self, region: &str) -> CloudResult<ReservedIpv6> {
        let rb = self
            .request(Method::POST, "/v2/reserved_ipv6")
            .json(&json!({ "region_slug": region }));
        let env: ReservedIpv6Envelope = self.send_json(rb).await?;
        Ok(env.reserved_ipv6)
    }
}

#[async_trait]
impl ReservedIpv6Actions for DropletApi {
    async fn assign(&self, ip: &str, droplet_id: DropletId) -> CloudResult<Action> {
        let rb = self
            .request(Method::POST, &format!("/v2/reserved_ipv6/{ip}/actions"))
            .json(&json!({ "type": "assign", "droplet_id": droplet_id }));
        let env: ActionEnvelope = self.send_json(rb).await?;
        Ok(env.action)
    }
}

impl CloudProvider for DropletApi {
    fn droplets(&self) -> &dyn Droplets {
        self
    }

    fn droplet_actions(&self) -> &dyn DropletActions {
        self
    }

    fn tags(&self) -> &dyn Tags {
        self
    }

    fn reserved_ipv4s(&self) -> &dyn ReservedIpv4s {
        self
    }

    fn reserved_ipv4_actions(&self) -> &dyn ReservedIpv4Actions {
        self
    }

    fn reserved_ipv6s(&self) -> &dyn ReservedIpv6s {
        self
    }

    fn reserved_ipv6_actions(&self) -> &dyn ReservedIpv6Actions {
        self
    }
}

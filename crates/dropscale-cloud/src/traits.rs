//! Capability interfaces over the provider API.
//!
//! Each trait covers one narrow slice of the API so callers can depend
//! on exactly what they use and tests can fake each slice independently.
//! [`CloudProvider`] bundles them for components that need several.

use async_trait::async_trait;

use crate::error::CloudResult;
use crate::types::{
    Action, Droplet, DropletCreateRequest, DropletId, ListOptions, PageInfo, ReservedIpv4,
    ReservedIpv6, ResourceRef, Tag,
};

/// Droplet lifecycle operations.
#[async_trait]
pub trait Droplets: Send + Sync {
    async fn list_by_tag(
        &self,
        tag: &str,
        opts: ListOptions,
    ) -> CloudResult<(Vec<Droplet>, PageInfo)>;

    async fn create(&self, req: &DropletCreateRequest) -> CloudResult<Droplet>;

    async fn get(&self, id: DropletId) -> CloudResult<Droplet>;

    async fn delete(&self, id: DropletId) -> CloudResult<()>;
}

/// Droplet power actions.
#[async_trait]
pub trait DropletActions: Send + Sync {
    async fn power_off(&self, id: DropletId) -> CloudResult<Action>;
}

/// Tag management.
#[async_trait]
pub trait Tags: Send + Sync {
    async fn list(&self, opts: ListOptions) -> CloudResult<(Vec<Tag>, PageInfo)>;

    async fn create(&self, name: &str) -> CloudResult<Tag>;

    async fn tag_resources(&self, name: &str, resources: &[ResourceRef]) -> CloudResult<()>;

    async fn untag_resources(&self, name: &str, resources: &[ResourceRef]) -> CloudResult<()>;

    async fn delete(&self, name: &str) -> CloudResult<()>;
}

/// Reserved IPv4 address management.
#[async_trait]
pub trait ReservedIpv4s: Send + Sync {
    async fn list(&self, opts: ListOptions) -> CloudResult<(Vec<ReservedIpv4>, PageInfo)>;

    async fn create(&self, region: &str) -> CloudResult<ReservedIpv4>;
}

/// Reserved IPv4 address actions.
#[async_trait]
pub trait ReservedIpv4Actions: Send + Sync {
    async fn assign(&self, ip: &str, droplet_id: DropletId) -> CloudResult<Action>;
}

/// Reserved IPv6 address management.
#[async_trait]
pub trait ReservedIpv6s: Send + Sync {
    async fn list(&self, opts: ListOptions) -> CloudResult<(Vec<ReservedIpv6>, PageInfo)>;

    async fn create(&self, region: &str) -> CloudResult<ReservedIpv6>;
}

/// Reserved IPv6 address actions.
#[async_trait]
pub trait ReservedIpv6Actions: Send + Sync {
    async fn assign(&self, ip: &str, droplet_id: DropletId) -> CloudResult<Action>;
}

/// Access to every capability of one provider account.
///
/// Implemented by [`crate::api::DropletApi`] for production and
/// [`crate::fake::FakeCloud`] for tests.
pub trait CloudProvider: Send + Sync {
    fn droplets(&self) -> &dyn Droplets;
    fn droplet_actions(&self) -> &dyn DropletActions;
    fn tags(&self) -> &dyn Tags;
    fn reserved_ipv4s(&self) -> &dyn ReservedIpv4s;
    fn reserved_ipv4_actions(&self) -> &dyn ReservedIpv4Actions;
    fn reserved_ipv6s(&self) -> &dyn ReservedIpv6s;
    fn reserved_ipv6_actions(&self) -> &dyn ReservedIpv6Actions;
}

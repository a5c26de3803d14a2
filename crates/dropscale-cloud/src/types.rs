//! Wire types for the subset of the provider API this crate consumes.
//!
//! These mirror the provider's JSON representations closely enough to
//! deserialize its responses, while staying small: only the fields the
//! scaling core reads are modelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider-assigned droplet identifier.
pub type DropletId = u64;

/// Lifecycle status of a droplet as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropletStatus {
    New,
    Active,
    Off,
    /// Any status this crate does not model (e.g. `archive`).
    #[serde(other)]
    Unknown,
}

/// A virtual-machine worker at the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Droplet {
    pub id: DropletId,
    pub name: String,
    pub status: DropletStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub networks: Networks,
    #[serde(default)]
    pub user_data: Option<String>,
}

impl Droplet {
    /// Whether the droplet is serving (status `active`).
    pub fn is_active(&self) -> bool {
        self.status == DropletStatus::Active
    }
}

/// Network attachments of a droplet, split by address family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
    #[serde(default)]
    pub v6: Vec<NetworkV6>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkV4 {
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkV6 {
    pub ip_address: String,
}

/// Request body for droplet creation.
#[derive(Debug, Clone, Serialize)]
pub struct DropletCreateRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_uuid: Option<String>,
    pub image: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub ipv6: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<SshKeyRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

/// SSH key reference by fingerprint.
#[derive(Debug, Clone, Serialize)]
pub struct SshKeyRef {
    pub fingerprint: String,
}

/// A provider region, referenced by slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub slug: String,
}

/// A reserved IPv4 address, possibly assigned to a droplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservedIpv4 {
    pub ip: String,
    #[serde(default)]
    pub region: Option<Region>,
    #[serde(default)]
    pub droplet: Option<Droplet>,
}

impl ReservedIpv4 {
    pub fn is_assigned(&self) -> bool {
        self.droplet.is_some()
    }

    pub fn region_slug(&self) -> Option<&str> {
        self.region.as_ref().map(|r| r.slug.as_str())
    }
}

/// A reserved IPv6 address, possibly assigned to a droplet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservedIpv6 {
    pub ip: String,
    #[serde(default)]
    pub region_slug: Option<String>,
    #[serde(default)]
    pub droplet: Option<Droplet>,
}

impl ReservedIpv6 {
    pub fn is_assigned(&self) -> bool {
        self.droplet.is_some()
    }

    pub fn region_slug(&self) -> Option<&str> {
        self.region_slug.as_deref()
    }
}

/// A provider tag with its current resource attachment count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    #[serde(default)]
    pub resources: TagResourceCount,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TagResourceCount {
    #[serde(default)]
    pub count: u64,
}

/// A resource reference used when attaching or detaching tags.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceRef {
    pub resource_id: String,
    pub resource_type: String,
}

impl ResourceRef {
    /// Reference a droplet by id.
    pub fn droplet(id: DropletId) -> Self {
        Self {
            resource_id: id.to_string(),
            resource_type: "droplet".to_string(),
        }
    }
}

/// A long-running provider action (assign, power_off, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: u64,
    pub status: String,
}

/// Options for paged list endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// 1-based page to fetch; `None` means the first page.
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// Position of a returned page within the full listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// 1-based index of the page that was returned.
    pub current: u32,
    /// Whether this is the final page.
    pub last: bool,
}

impl PageInfo {
    /// A single-page result (everything fit in one response).
    pub fn single() -> Self {
        Self {
            current: 1,
            last: true,
        }
    }
}

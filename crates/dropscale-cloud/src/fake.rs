//! In-memory provider for tests.
//!
//! Implements every capability trait over a single mutable account
//! state. Freshly created droplets are immediately `active` with one
//! IPv4 (and, when requested, one IPv6) address attached, so callers
//! that poll for readiness or network metadata observe success without
//! simulating boot delays. A few knobs inject failures and shrink page
//! sizes to exercise the error and pagination paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{CloudError, CloudResult};
use crate::traits::{
    CloudProvider, DropletActions, Droplets, ReservedIpv4Actions, ReservedIpv4s,
    ReservedIpv6Actions, ReservedIpv6s, Tags,
};
use crate::types::{
    Action, Droplet, DropletCreateRequest, DropletId, DropletStatus, ListOptions, NetworkV4,
    NetworkV6, Networks, PageInfo, Region, ReservedIpv4, ReservedIpv6, ResourceRef, Tag,
    TagResourceCount,
};

#[derive(Default)]
struct FakeState {
    droplets: BTreeMap<DropletId, Droplet>,
    next_droplet_id: DropletId,
    reserved_v4: Vec<ReservedIpv4>,
    counter_v4: u32,
    reserved_v6: Vec<ReservedIpv6>,
    counter_v6: u32,
    tags: BTreeMap<String, BTreeSet<DropletId>>,
    droplets_per_page: usize,
    fail_droplet_creates: u32,
    assign_conflicts: u32,
    tag_conflicts: u32,
}

/// A fake provider account.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Cap droplet listings at `n` items per page.
    pub fn set_droplets_per_page(&self, n: usize) {
        self.state().droplets_per_page = n;
    }

    /// Make the next `n` droplet creations fail with HTTP 500.
    pub fn fail_next_droplet_creates(&self, n: u32) {
        self.state().fail_droplet_creates = n;
    }

    /// Make the next `n` reserved-address assignments fail with the
    /// provider's transient HTTP 422.
    pub fn inject_assign_conflicts(&self, n: u32) {
        self.state().assign_conflicts = n;
    }

    /// Make the next `n` tag attachments fail with the provider's
    /// transient HTTP 422.
    pub fn inject_tag_conflicts(&self, n: u32) {
        self.state().tag_conflicts = n;
    }

    /// Seed a droplet directly, bypassing the create path.
    pub fn insert_droplet(&self, droplet: Droplet) {
        let mut state = self.state();
        for tag in droplet.tags.clone() {
            state.tags.entry(tag).or_default().insert(droplet.id);
        }
        state.next_droplet_id = state.next_droplet_id.max(droplet.id);
        state.droplets.insert(droplet.id, droplet);
    }

    pub fn droplet(&self, id: DropletId) -> Option<Droplet> {
        self.state().droplets.get(&id).cloned()
    }

    pub fn droplets_with_tag(&self, tag: &str) -> Vec<Droplet> {
        self.state()
            .droplets
            .values()
            .filter(|d| d.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.state().tags.keys().cloned().collect()
    }

    /// The reserved IPv4 currently assigned to `id`, if any.
    pub fn reserved_v4_of(&self, id: DropletId) -> Option<String> {
        self.state()
            .reserved_v4
            .iter()
            .find(|r| r.droplet.as_ref().is_some_and(|d| d.id == id))
            .map(|r| r.ip.clone())
    }

    pub fn reserved_v6_of(&self, id: DropletId) -> Option<String> {
        self.state()
            .reserved_v6
            .iter()
            .find(|r| r.droplet.as_ref().is_some_and(|d| d.id == id))
            .map(|r| r.ip.clone())
    }
}

fn not_found(what: &str) -> CloudError {
    CloudError::Api {
        status: 404,
        message: format!("{what} not found"),
    }
}

fn paginate<T: Clone>(items: &[T], opts: ListOptions, per_page: usize) -> (Vec<T>, PageInfo) {
    let per_page = opts.per_page.map(|p| p as usize).unwrap_or(per_page).max(1);
    let page = opts.page.unwrap_or(1).max(1);
    let start = (page as usize - 1) * per_page;
    let end = (start + per_page).min(items.len());
    let slice = if start < items.len() {
        items[start..end].to_vec()
    } else {
        Vec::new()
    };
    (
        slice,
        PageInfo {
            current: page,
            last: end >= items.len(),
        },
    )
}

#[async_trait]
impl Droplets for FakeCloud {
    async fn list_by_tag(
        &self,
        tag: &str,
        opts: ListOptions,
    ) -> CloudResult<(Vec<Droplet>, PageInfo)> {
        let state = self.state();
        let matching: Vec<Droplet> = state
            .droplets
            .values()
            .filter(|d| d.tags.iter().any(|t| t == tag))
            .cloned()
            .collect();
        let per_page = if state.droplets_per_page == 0 {
            usize::MAX
        } else {
            state.droplets_per_page
        };
        Ok(paginate(&matching, opts, per_page))
    }

    async fn create(&self, req: &DropletCreateRequest) -> CloudResult<Droplet> {
        let mut state = self.state();
        if state.fail_droplet_creates > 0 {
            state.fail_droplet_creates -= 1;
            return Err(CloudError::Api {
                status: 500,
                message: "simulated droplet create failure".to_string(),
            });
        }

        state.next_droplet_id += 1;
        let id = state.next_droplet_id;
        let droplet = Droplet {
            id,
            name: req.name.clone(),
            status: DropletStatus::Active,
            tags: req.tags.clone(),
            created_at: Utc::now(),
            networks: Networks {
                v4: vec![NetworkV4 {
                    ip_address: format!("10.0.0.{id}"),
                }],
                v6: if req.ipv6 {
                    vec![NetworkV6 {
                        ip_address: format!("fe80::d:{id:x}"),
                    }]
                } else {
                    Vec::new()
                },
            },
            user_data: req.user_data.clone(),
        };
        for tag in &req.tags {
            state.tags.entry(tag.clone()).or_default().insert(id);
        }
        state.droplets.insert(id, droplet.clone());
        Ok(droplet)
    }

    async fn get(&self, id: DropletId) -> CloudResult<Droplet> {
        self.state()
            .droplets
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("droplet"))
    }

    async fn delete(&self, id: DropletId) -> CloudResult<()> {
        let mut state = self.state();
        if state.droplets.remove(&id).is_none() {
            return Err(not_found("droplet"));
        }
        for members in state.tags.values_mut() {
            members.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl DropletActions for FakeCloud {
    async fn power_off(&self, id: DropletId) -> CloudResult<Action> {
        let mut state = self.state();
        let droplet = state.droplets.get_mut(&id).ok_or_else(|| not_found("droplet"))?;
        droplet.status = DropletStatus::Off;
        Ok(Action {
            id,
            status: "completed".to_string(),
        })
    }
}

#[async_trait]
impl Tags for FakeCloud {
    async fn list(&self, _opts: ListOptions) -> CloudResult<(Vec<Tag>, PageInfo)> {
        let state = self.state();
        let tags = state
            .tags
            .iter()
            .map(|(name, members)| Tag {
                name: name.clone(),
                resources: TagResourceCount {
                    count: members.len() as u64,
                },
            })
            .collect();
        Ok((tags, PageInfo::single()))
    }

    async fn create(&self, name: &str) -> CloudResult<Tag> {
        self.state().tags.entry(name.to_string()).or_default();
        Ok(Tag {
            name: name.to_string(),
            resources: TagResourceCount::default(),
        })
    }

    async fn tag_resources(&self, name: &str, resources: &[ResourceRef]) -> CloudResult<()> {
        let mut state = self.state();
        if state.tag_conflicts > 0 {
            state.tag_conflicts -= 1;
            return Err(CloudError::Api {
                status: 422,
                message: "droplet has a pending event".to_string(),
            });
        }
        if !state.tags.contains_key(name) {
            return Err(not_found("tag"));
        }
        for resource in resources {
            let id: DropletId = resource
                .resource_id
                .parse()
                .map_err(|_| not_found("droplet"))?;
            if !state.droplets.contains_key(&id) {
                return Err(not_found("droplet"));
            }
            state.tags.get_mut(name).unwrap().insert(id);
            let droplet = state.droplets.get_mut(&id).unwrap();
            if !droplet.tags.iter().any(|t| t == name) {
                droplet.tags.push(name.to_string());
            }
        }
        Ok(())
    }

    async fn untag_resources(&self, name: &str, resources: &[ResourceRef]) -> CloudResult<()> {
        let mut state = self.state();
        if !state.tags.contains_key(name) {
            return Err(not_found("tag"));
        }
        for resource in resources {
            if let Ok(id) = resource.resource_id.parse::<DropletId>() {
                state.tags.get_mut(name).unwrap().remove(&id);
                if let Some(droplet) = state.droplets.get_mut(&id) {
                    droplet.tags.retain(|t| t != name);
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> CloudResult<()> {
        let mut state = self.state();
        if state.tags.remove(name).is_none() {
            return Err(not_found("tag"));
        }
        for droplet in state.droplets.values_mut() {
            droplet.tags.retain(|t| t != name);
        }
        Ok(())
    }
}

#[async_trait]
impl ReservedIpv4s for FakeCloud {
    async fn list(&self, _opts: ListOptions) -> CloudResult<(Vec<ReservedIpv4>, PageInfo)> {
        Ok((self.state().reserved_v4.clone(), PageInfo::single()))
    }

    async fn create(&self, region: &str) -> CloudResult<ReservedIpv4> {
        let mut state = self.state();
        state.counter_v4 += 1;
        let reservation = ReservedIpv4 {
            ip: format!("1.2.3.{}", state.counter_v4),
            region: Some(Region {
                slug: region.to_string(),
            }),
            droplet: None,
        };
        state.reserved_v4.push(reservation.clone());
        Ok(reservation)
    }
}

#[async_trait]
impl ReservedIpv4Actions for FakeCloud {
    async fn assign(&self, ip: &str, droplet_id: DropletId) -> CloudResult<Action> {
        let mut state = self.state();
        if state.assign_conflicts > 0 {
            state.assign_conflicts -= 1;
            return Err(CloudError::Api {
                status: 422,
                message: "droplet has a pending event".to_string(),
            });
        }
        if !state.droplets.contains_key(&droplet_id) {
            return Err(not_found("droplet"));
        }
        if state
            .reserved_v4
            .iter()
            .any(|r| r.droplet.as_ref().is_some_and(|d| d.id == droplet_id))
        {
            return Err(CloudError::Api {
                status: 409,
                message: "droplet already has a reserved IPv4 address".to_string(),
            });
        }
        let droplet = state.droplets.get(&droplet_id).cloned();
        let reservation = state
            .reserved_v4
            .iter_mut()
            .find(|r| r.ip == ip)
            .ok_or_else(|| not_found("reserved ip"))?;
        if reservation.droplet.is_some() {
            return Err(CloudError::Api {
                status: 409,
                message: format!("reserved ip {ip} is already assigned"),
            });
        }
        reservation.droplet = droplet;
        Ok(Action {
            id: droplet_id,
            status: "completed".to_string(),
        })
    }
}

#[async_trait]
impl ReservedIpv6s for FakeCloud {
    async fn list(&self, _opts: ListOptions) -> CloudResult<(Vec<ReservedIpv6>, PageInfo)> {
        Ok((self.state().reserved_v6.clone(), PageInfo::single()))
    }

    async fn create(&self, region: &str) -> CloudResult<ReservedIpv6> {
        let mut state = self.state();
        state.counter_v6 += 1;
        let reservation = ReservedIpv6 {
            ip: format!("fe80::{:x}", state.counter_v6),
            region_slug: Some(region.to_string()),
            droplet: None,
        };
        state.reserved_v6.push(reservation.clone());
        Ok(reservation)
    }
}

#[async_trait]
impl ReservedIpv6Actions for FakeCloud {
    async fn assign(&self, ip: &str, droplet_id: DropletId) -> CloudResult<Action> {
        let mut state = self.state();
        if state.assign_conflicts > 0 {
            state.assign_conflicts -= 1;
            return Err(CloudError::Api {
                status: 422,
                message: "droplet has a pending event".to_string(),
            });
        }
        if !state.droplets.contains_key(&droplet_id) {
            return Err(not_found("droplet"));
        }
        if state
            .reserved_v6
            .iter()
            .any(|r| r.droplet.as_ref().is_some_and(|d| d.id == droplet_id))
        {
            return Err(CloudError::Api {
                status: 409,
                message: "droplet already has a reserved IPv6 address".to_string(),
            });
        }
        let droplet = state.droplets.get(&droplet_id).cloned();
        let reservation = state
            .reserved_v6
            .iter_mut()
            .find(|r| r.ip == ip)
            .ok_or_else(|| not_found("reserved ip"))?;
        if reservation.droplet.is_some() {
            return Err(CloudError::Api {
                status: 409,
                message: format!("reserved ip {ip} is already assigned"),
            });
        }
        reservation.droplet = droplet;
        Ok(Action {
            id: droplet_id,
            status: "completed".to_string(),
        })
    }
}

impl CloudProvider for FakeCloud {
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

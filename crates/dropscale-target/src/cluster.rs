//! Cluster host contract.
//!
//! The scheduler that owns the worker pool (readiness checks, node
//! draining) is an external collaborator; the target invokes it
//! through this trait around every scale-in and status call.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

/// A cluster node selected for removal, identified by the name of the
/// droplet backing it.
#[derive(Debug, Clone)]
pub struct NodeResource {
    pub remote_resource_id: String,
}

/// Hooks into the cluster scheduler.
#[async_trait]
pub trait ClusterHost: Send + Sync {
    /// Whether the node pool is ready to be inspected at all.
    async fn is_pool_ready(&self, config: &HashMap<String, String>) -> anyhow::Result<bool>;

    /// Select and drain `count` nodes ahead of droplet deletion;
    /// returns the drained nodes.
    async fn run_pre_scale_in(
        &self,
        config: &HashMap<String, String>,
        count: usize,
    ) -> anyhow::Result<Vec<NodeResource>>;

    /// Finalize the removal of previously drained nodes.
    async fn run_post_scale_in(
        &self,
        config: &HashMap<String, String>,
        drained: &[NodeResource],
    ) -> anyhow::Result<()>;
}

/// Map a cluster node's attributes to the droplet name backing it.
///
/// Droplet names surface on nodes as the `unique.hostname` attribute.
pub fn node_remote_id(attributes: &HashMap<String, String>) -> anyhow::Result<String> {
    match attributes.get("unique.hostname") {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => anyhow::bail!("attribute \"unique.hostname\" not found"),
    }
}

/// Scripted cluster host for tests: fixed readiness, a fixed drain
/// list, and a record of post-hook invocations.
#[derive(Default)]
pub struct StaticClusterHost {
    ready: bool,
    drain_names: Mutex<Vec<String>>,
    post_calls: Mutex<Vec<Vec<String>>>,
}

impl StaticClusterHost {
    pub fn ready() -> Self {
        Self {
            ready: true,
            ..Self::default()
        }
    }

    pub fn not_ready() -> Self {
        Self::default()
    }

    /// Nodes the pre-hook reports as drained, in order.
    pub fn with_drain_names(self, names: Vec<String>) -> Self {
        self.set_drain_names(names);
        self
    }

    pub fn set_drain_names(&self, names: Vec<String>) {
        *self.drain_names.lock().unwrap() = names;
    }

    /// Droplet names passed to each post-hook call so far.
    pub fn post_calls(&self) -> Vec<Vec<String>> {
        self.post_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterHost for StaticClusterHost {
    async fn is_pool_ready(&self, _config: &HashMap<String, String>) -> anyhow::Result<bool> {
        Ok(self.ready)
    }

    async fn run_pre_scale_in(
        &self,
        _config: &HashMap<String, String>,
        count: usize,
    ) -> anyhow::Result<Vec<NodeResource>> {
        Ok(self
            .drain_names
            .lock()
            .unwrap()
            .iter()
            .take(count)
            .map(|name| NodeResource {
                remote_resource_id: name.clone(),
            })
            .collect())
    }

    async fn run_post_scale_in(
        &self,
        _config: &HashMap<String, String>,
        drained: &[NodeResource],
    ) -> anyhow::Result<()> {
        self.post_calls.lock().unwrap().push(
            drained
                .iter()
                .map(|n| n.remote_resource_id.clone())
                .collect(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_remote_id_reads_the_hostname_attribute() {
        let mut attributes = HashMap::new();
        attributes.insert("unique.hostname".to_string(), "pool-abc123".to_string());
        assert_eq!(node_remote_id(&attributes).unwrap(), "pool-abc123");
    }

    #[test]
    fn node_remote_id_rejects_missing_or_empty() {
        assert!(node_remote_id(&HashMap::new()).is_err());

        let mut attributes = HashMap::new();
        attributes.insert("unique.hostname".to_string(), String::new());
        assert!(node_remote_id(&attributes).is_err());
    }

    #[tokio::test]
    async fn static_host_drains_at_most_count_nodes() {
        let host = StaticClusterHost::ready()
            .with_drain_names(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        let drained = host.run_pre_scale_in(&HashMap::new(), 2).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].remote_resource_id, "a");
    }
}

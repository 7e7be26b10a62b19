//! Kubernetes API access used by the provider.
//!
//! The [`ClusterClient`] trait covers the handful of calls the provider makes
//! against the API server, so the lifecycle logic can run against
//! [`mock::MockCluster`] in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Node, NodeStatus, Pod, PodStatus};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use marketlet_core::PodKey;
use serde_json::json;
use tracing::debug;

use crate::error::{ProviderError, Result};

/// Field manager for server-side apply.
pub const FIELD_MANAGER: &str = "marketlet";

/// Cluster operations needed by the provider.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Pods bound to `node`.
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails.
    async fn list_node_pods(&self, node: &str) -> Result<Vec<Pod>>;

    /// Replace the status of a pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the patch fails.
    async fn patch_pod_status(&self, key: &PodKey, status: PodStatus) -> Result<()>;

    /// Merge annotations into a pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the patch fails.
    async fn annotate_pod(&self, key: &PodKey, annotations: BTreeMap<String, String>) -> Result<()>;

    /// Remove a pod immediately. A missing pod is success.
    ///
    /// # Errors
    ///
    /// Returns an error if deletion fails for another reason.
    async fn remove_pod(&self, key: &PodKey) -> Result<()>;

    /// Endpoints object of a Service, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;

    /// Create an Endpoints object.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if it already exists.
    async fn create_endpoints(&self, endpoints: &Endpoints) -> Result<()>;

    /// Replace an Endpoints object at the resource version it carries.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the object changed since it was read.
    async fn replace_endpoints(&self, endpoints: &Endpoints) -> Result<()>;

    /// Create or update the virtual node.
    ///
    /// # Errors
    ///
    /// Returns an error if the apply fails.
    async fn apply_node(&self, node: &Node) -> Result<()>;

    /// Replace the status of the virtual node.
    ///
    /// # Errors
    ///
    /// Returns an error if the patch fails.
    async fn patch_node_status(&self, name: &str, status: NodeStatus) -> Result<()>;
}

/// [`ClusterClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connect using the in-cluster or kubeconfig environment.
    ///
    /// # Errors
    ///
    /// Returns an error if no Kubernetes configuration can be inferred.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_client(Client::try_default().await?))
    }

    /// Wrap an existing client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// The underlying client, shared with the pod watcher.
    #[must_use]
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn endpoints(&self, namespace: &str) -> Api<Endpoints> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn conflict_or(err: kube::Error, what: impl FnOnce() -> String) -> ProviderError {
    match err {
        kube::Error::Api(e) if e.code == 409 => ProviderError::Conflict(what()),
        other => ProviderError::Kube(other),
    }
}

fn endpoints_name(endpoints: &Endpoints) -> Result<(&str, &str)> {
    let name = endpoints
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ProviderError::Config("endpoints without a name".to_string()))?;
    let namespace = endpoints.metadata.namespace.as_deref().unwrap_or("default");
    Ok((namespace, name))
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_node_pods(&self, node: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        Ok(api.list(&params).await?.items)
    }

    async fn patch_pod_status(&self, key: &PodKey, status: PodStatus) -> Result<()> {
        let patch = json!({ "status": status });
        self.pods(key.namespace())
            .patch_status(key.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn annotate_pod(&self, key: &PodKey, annotations: BTreeMap<String, String>) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.pods(key.namespace())
            .patch(key.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_pod(&self, key: &PodKey) -> Result<()> {
        match self
            .pods(key.namespace())
            .delete(key.name(), &DeleteParams::default().grace_period(0))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(pod = %key, "Pod already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        Ok(self.endpoints(namespace).get_opt(name).await?)
    }

    async fn create_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
        let (namespace, name) = endpoints_name(endpoints)?;
        self.endpoints(namespace)
            .create(&PostParams::default(), endpoints)
            .await
            .map_err(|e| conflict_or(e, || format!("endpoints {namespace}/{name} already exist")))?;
        Ok(())
    }

    async fn replace_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
        let (namespace, name) = endpoints_name(endpoints)?;
        self.endpoints(namespace)
            .replace(name, &PostParams::default(), endpoints)
            .await
            .map_err(|e| conflict_or(e, || format!("endpoints {namespace}/{name} changed")))?;
        Ok(())
    }

    async fn apply_node(&self, node: &Node) -> Result<()> {
        let name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ProviderError::Config("node without a name".to_string()))?;
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(node))
            .await?;
        Ok(())
    }

    async fn patch_node_status(&self, name: &str, status: NodeStatus) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// In-memory cluster for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::{BTreeMap, HashMap};

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Endpoints, Node, NodeStatus, Pod, PodStatus};
    use marketlet_core::PodKey;
    use parking_lot::Mutex;

    use super::{endpoints_name, ClusterClient};
    use crate::annotations::pod_key;
    use crate::error::{ProviderError, Result};

    /// Mock cluster that keeps pods, Endpoints and the node in memory.
    ///
    /// Endpoints carry a resource version; a replace at a stale version is a
    /// conflict, and further conflicts can be injected.
    #[derive(Debug, Default)]
    pub struct MockCluster {
        state: Mutex<State>,
    }

    #[derive(Debug, Default)]
    struct State {
        pods: BTreeMap<PodKey, Pod>,
        statuses: HashMap<PodKey, Vec<PodStatus>>,
        removed: Vec<PodKey>,
        endpoints: BTreeMap<(String, String), Endpoints>,
        version: u64,
        injected_conflicts: u32,
        endpoint_writes: u32,
        node: Option<Node>,
        node_status: Option<NodeStatus>,
    }

    impl MockCluster {
        /// Create an empty cluster.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add or replace a pod.
        pub fn add_pod(&self, pod: Pod) {
            if let Some(key) = pod_key(&pod) {
                self.state.lock().pods.insert(key, pod);
            }
        }

        /// Current copy of a pod.
        #[must_use]
        pub fn pod(&self, key: &PodKey) -> Option<Pod> {
            self.state.lock().pods.get(key).cloned()
        }

        /// Last status patched onto a pod.
        #[must_use]
        pub fn last_status(&self, key: &PodKey) -> Option<PodStatus> {
            self.state.lock().statuses.get(key).and_then(|s| s.last().cloned())
        }

        /// Pods removed through [`ClusterClient::remove_pod`].
        #[must_use]
        pub fn removed(&self) -> Vec<PodKey> {
            self.state.lock().removed.clone()
        }

        /// Current Endpoints object of a Service.
        #[must_use]
        pub fn endpoints(&self, namespace: &str, name: &str) -> Option<Endpoints> {
            self.state
                .lock()
                .endpoints
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Store an Endpoints object as if another controller wrote it.
        pub fn put_endpoints(&self, mut endpoints: Endpoints) {
            let mut state = self.state.lock();
            state.version += 1;
            endpoints.metadata.resource_version = Some(state.version.to_string());
            if let Ok((namespace, name)) = endpoints_name(&endpoints) {
                let key = (namespace.to_string(), name.to_string());
                state.endpoints.insert(key, endpoints);
            }
        }

        /// Fail the next `n` Endpoints writes with a conflict.
        pub fn inject_conflicts(&self, n: u32) {
            self.state.lock().injected_conflicts = n;
        }

        /// Endpoints writes attempted so far.
        #[must_use]
        pub fn endpoint_writes(&self) -> u32 {
            self.state.lock().endpoint_writes
        }

        /// The registered node.
        #[must_use]
        pub fn node(&self) -> Option<Node> {
            self.state.lock().node.clone()
        }

        /// The last node status.
        #[must_use]
        pub fn node_status(&self) -> Option<NodeStatus> {
            self.state.lock().node_status.clone()
        }
    }

    impl State {
        fn write_endpoints(&mut self, endpoints: &Endpoints, create: bool) -> Result<()> {
            self.endpoint_writes += 1;
            let (namespace, name) = endpoints_name(endpoints)?;
            let key = (namespace.to_string(), name.to_string());
            if self.injected_conflicts > 0 {
                self.injected_conflicts -= 1;
                return Err(ProviderError::Conflict(format!("endpoints {namespace}/{name} (injected)")));
            }
            match (create, self.endpoints.get(&key)) {
                (true, Some(_)) => {
                    return Err(ProviderError::Conflict(format!("endpoints {namespace}/{name} already exist")));
                }
                (false, None) => {
                    return Err(ProviderError::Config(format!("endpoints {namespace}/{name} not found")));
                }
                (false, Some(current))
                    if current.metadata.resource_version != endpoints.metadata.resource_version =>
                {
                    return Err(ProviderError::Conflict(format!("endpoints {namespace}/{name} changed")));
                }
                _ => {}
            }
            self.version += 1;
            let mut stored = endpoints.clone();
            stored.metadata.resource_version = Some(self.version.to_string());
            self.endpoints.insert(key, stored);
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterClient for MockCluster {
        async fn list_node_pods(&self, node: &str) -> Result<Vec<Pod>> {
            Ok(self
                .state
                .lock()
                .pods
                .values()
                .filter(|p| {
                    p.spec
                        .as_ref()
                        .and_then(|s| s.node_name.as_deref())
                        .is_none_or(|n| n == node)
                })
                .cloned()
                .collect())
        }

        async fn patch_pod_status(&self, key: &PodKey, status: PodStatus) -> Result<()> {
            let mut state = self.state.lock();
            if let Some(pod) = state.pods.get_mut(key) {
                pod.status = Some(status.clone());
            }
            state.statuses.entry(key.clone()).or_default().push(status);
            Ok(())
        }

        async fn annotate_pod(&self, key: &PodKey, annotations: BTreeMap<String, String>) -> Result<()> {
            let mut state = self.state.lock();
            let pod = state
                .pods
                .get_mut(key)
                .ok_or_else(|| ProviderError::PodNotFound(key.clone()))?;
            pod.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(annotations);
            Ok(())
        }

        async fn remove_pod(&self, key: &PodKey) -> Result<()> {
            let mut state = self.state.lock();
            state.pods.remove(key);
            state.removed.push(key.clone());
            Ok(())
        }

        async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
            Ok(self.endpoints(namespace, name))
        }

        async fn create_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
            self.state.lock().write_endpoints(endpoints, true)
        }

        async fn replace_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
            self.state.lock().write_endpoints(endpoints, false)
        }

        async fn apply_node(&self, node: &Node) -> Result<()> {
            self.state.lock().node = Some(node.clone());
            Ok(())
        }

        async fn patch_node_status(&self, _name: &str, status: NodeStatus) -> Result<()> {
            self.state.lock().node_status = Some(status);
            Ok(())
        }
    }
}

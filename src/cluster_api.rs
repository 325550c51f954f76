use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::debug;

/// The engine's seam to the cluster API server.
///
/// Everything the drain engine does over the network goes through this trait,
/// so the reconciliation and eviction logic can be exercised against a mock.
/// Errors are raw `kube::Error`s; callers classify them with `error_codes`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a node. `None` means the node does not exist (absorbed 404).
    async fn get_node(&self, name: &str) -> kube::Result<Option<Node>>;

    async fn list_nodes(&self) -> kube::Result<Vec<Node>>;

    /// Merge-patch a node. The patch body may carry `metadata.resourceVersion`
    /// so that a concurrent incompatible modification surfaces as a 409.
    async fn patch_node(&self, name: &str, patch: Value) -> kube::Result<Node>;

    /// All pods bound to the node, server-side filtered by the node-assignment
    /// field and an optional label selector.
    async fn list_pods_on_node(
        &self,
        node_name: &str,
        label_selector: Option<String>,
    ) -> kube::Result<Vec<Pod>>;

    /// Evict a pod through the eviction subresource so PodDisruptionBudgets
    /// are enforced server-side. Not-found is NOT absorbed here; the eviction
    /// engine distinguishes "already gone" from "failed".
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> kube::Result<()>;
}

#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_node(&self, name: &str) -> kube::Result<Option<Node>> {
        self.nodes().get_opt(name).await
    }

    async fn list_nodes(&self) -> kube::Result<Vec<Node>> {
        let nodes = self.nodes().list(&ListParams::default()).await?;
        Ok(nodes.items)
    }

    async fn patch_node(&self, name: &str, patch: Value) -> kube::Result<Node> {
        debug!(%name, ?patch, "patching node");
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }

    async fn list_pods_on_node(
        &self,
        node_name: &str,
        label_selector: Option<String>,
    ) -> kube::Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());

        let mut params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        if let Some(selector) = label_selector {
            params = params.labels(&selector);
        }

        let pods = api.list(&params).await?;
        Ok(pods.items)
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> kube::Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds,
                ..DeleteParams::default()
            }),
            post_options: PostParams::default(),
        };

        debug!(%namespace, %name, "evicting pod");
        api.evict(name, &params).await?;
        Ok(())
    }
}

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster_api::ClusterApi;
use crate::config::DrainSettings;
use crate::consts::MIRROR_POD_ANNOTATION_KEY;
use crate::error_codes::{
    is_404_not_found_error, is_410_expired_error, is_429_eviction_rejected_error,
};

/// Outcome of a successful drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub evicted: usize,
    pub skipped: usize,
}

/// A drain pass that could not evict everything. Carries the partial counts
/// so callers can still account for the evictions that did happen.
#[derive(Debug, Error)]
#[error("failed to evict {failed} pod(s) from node {node} ({evicted} evicted)")]
pub struct DrainError {
    pub node: String,
    pub evicted: usize,
    pub failed: usize,
    #[source]
    pub source: kube::Error,
}

/// Evicts pods off nodes through the eviction subresource, so that
/// PodDisruptionBudgets are enforced by the API server.
#[derive(Clone)]
pub struct Drainer {
    cluster: Arc<dyn ClusterApi>,
}

impl Drainer {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Mark the node unschedulable. Returns whether the node changed, so
    /// callers only count and report actual transitions.
    pub async fn cordon(&self, node: &Node) -> kube::Result<bool> {
        self.set_unschedulable(node, true).await
    }

    pub async fn uncordon(&self, node: &Node) -> kube::Result<bool> {
        self.set_unschedulable(node, false).await
    }

    async fn set_unschedulable(&self, node: &Node, unschedulable: bool) -> kube::Result<bool> {
        let current = node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false);
        if current == unschedulable {
            return Ok(false);
        }

        self.cluster
            .patch_node(
                &node.name_any(),
                json!({ "spec": { "unschedulable": unschedulable } }),
            )
            .await?;
        Ok(true)
    }

    /// Evict every drain candidate currently bound to the node, in listing
    /// order. Without `force` the pass aborts on the first failed eviction;
    /// with `force` it keeps going and reports an aggregate error carrying
    /// the first cause.
    pub async fn drain(
        &self,
        node: &Node,
        settings: &DrainSettings,
    ) -> Result<DrainSummary, DrainError> {
        let node_name = node.name_any();

        let pods = self
            .cluster
            .list_pods_on_node(
                &node_name,
                settings.pod_selector.clone().filter(|s| !s.is_empty()),
            )
            .await
            .map_err(|err| DrainError {
                node: node_name.clone(),
                evicted: 0,
                failed: 0,
                source: err,
            })?;

        let mut summary = DrainSummary::default();
        let mut failed = 0;
        let mut first_failure: Option<kube::Error> = None;

        for pod in &pods {
            if !is_drain_candidate(pod, settings) {
                summary.skipped += 1;
                continue;
            }

            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            let grace = settings.grace_period.as_secs().try_into().ok();

            let result = self.cluster.evict_pod(&namespace, &name, grace).await;
            match result {
                Ok(()) => {
                    info!(%namespace, %name, "pod evicted");
                    summary.evicted += 1;
                }
                Err(err) if is_404_not_found_error(&err) || is_410_expired_error(&err) => {
                    debug!(%namespace, %name, "pod is gone anyway");
                    summary.evicted += 1;
                }
                Err(err) => {
                    if is_429_eviction_rejected_error(&err) {
                        warn!(%namespace, %name, "eviction rejected by disruption budget");
                    } else {
                        warn!(%namespace, %name, ?err, "eviction failed");
                    }
                    failed += 1;
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                    if !settings.force {
                        break;
                    }
                }
            }
        }

        match first_failure {
            None => Ok(summary),
            Some(source) => Err(DrainError {
                node: node_name,
                evicted: summary.evicted,
                failed,
                source,
            }),
        }
    }
}

/// Whether a pod should be evicted during a drain pass.
pub fn is_drain_candidate(pod: &Pod, settings: &DrainSettings) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }

    // Static pods are bound to the node's kubelet; eviction cannot remove them.
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION_KEY) {
        return false;
    }

    if settings.ignore_daemon_sets && has_daemon_set_controller(pod) {
        return false;
    }

    if has_local_storage(pod) && !settings.allow_local_storage && !settings.force {
        return false;
    }

    true
}

fn has_daemon_set_controller(pod: &Pod) -> bool {
    pod.owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.kind == "DaemonSet")
}

fn has_local_storage(pod: &Pod) -> bool {
    let Some(volumes) = pod.spec.as_ref().and_then(|spec| spec.volumes.as_ref()) else {
        return false;
    };

    volumes
        .iter()
        .any(|volume| volume.empty_dir.is_some() || volume.host_path.is_some())
}

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::runtime::{controller, watcher, Controller};
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, error, info, span, trace, Level};

use crate::cluster_api::ClusterApi;
use crate::config::{DrainSettings, PolicyStore};
use crate::drain_state::{drain_marker_state, mark_drained, mark_draining, DrainMarkerState};
use crate::drainer::{DrainError, DrainSummary, Drainer};
use crate::eligibility::classify;
use crate::error_codes::{
    is_404_not_found_error, is_409_conflict_error, is_410_expired_error, is_transient_error,
};
use crate::instrumented;
use crate::metrics::Metrics;
use crate::report::AuditLog;
use crate::service_registry::ServiceRegistry;
use crate::shutdown::Shutdown;
use crate::spawn_service::spawn_service;

/// Everything a drain pass needs. Shared by the reconciler and the
/// management API, so both go through the same state machine.
pub struct DrainContext {
    pub cluster: Arc<dyn ClusterApi>,
    pub drainer: Drainer,
    pub policy: PolicyStore,
    pub metrics: Arc<Metrics>,
    pub audit: AuditLog,
}

impl DrainContext {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        policy: PolicyStore,
        metrics: Arc<Metrics>,
        audit: AuditLog,
    ) -> Self {
        Self {
            drainer: Drainer::new(Arc::clone(&cluster)),
            cluster,
            policy,
            metrics,
            audit,
        }
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Drain(#[from] DrainError),
}

const DEFAULT_RECONCILE_DURATION: Duration = Duration::from_secs(3600);
const CONFLICT_RECONCILE: Duration = Duration::from_secs(10);
const TRANSIENT_ERROR_RECONCILE: Duration = Duration::from_secs(5);

pub fn start_node_drain_controller(
    client: Client,
    context: Arc<DrainContext>,
    service_registry: &ServiceRegistry,
    shutdown: &Shutdown,
) -> eyre::Result<()> {
    let nodes: Api<Node> = Api::all(client);
    let controller = Controller::new(nodes, Config::default())
        .graceful_shutdown_on(shutdown.wait_shutdown_triggered());

    let signal = service_registry.register("node-drain-controller");
    spawn_service(shutdown, "node-drain-controller", {
        let shutdown = shutdown.clone();
        async move {
            signal.ready();
            controller
                .run(reconcile, error_policy, context)
                .take_until(shutdown.wait_shutdown_triggered())
                .for_each(log_reconcile_result)
                .await
        }
    })?;

    Ok(())
}

async fn reconcile(
    node: Arc<Node>,
    context: Arc<DrainContext>,
) -> Result<Action, ReconcileError> {
    let span = span!(Level::ERROR, "reconciler", node = %node.name_any());
    instrumented!(span, async move {
        // Work from a fresh read, not the (possibly stale) watch snapshot.
        let Some(node) = context.cluster.get_node(&node.name_any()).await? else {
            return Ok(Action::await_change());
        };

        let policy = context.policy.snapshot();

        match drain_marker_state(&node) {
            DrainMarkerState::Drained => Ok(Action::requeue(DEFAULT_RECONCILE_DURATION)),
            DrainMarkerState::Draining => {
                // A marker without a live pass means the previous process
                // died mid-drain. Re-run the pass; every step is idempotent.
                let classification = classify(&node, &policy);
                let reason = if classification.eligible {
                    classification.reason
                } else {
                    String::from("resuming interrupted drain")
                };

                context.audit.drain_resumed(&node, &reason);
                context.metrics.record_drain_resumed();
                run_drain_sequence(&context, node, &policy.drain_settings, &reason).await?;
                Ok(Action::requeue(DEFAULT_RECONCILE_DURATION))
            }
            DrainMarkerState::Idle => {
                let classification = classify(&node, &policy);
                if !classification.eligible {
                    trace!(reason = %classification.reason, "not eligible");
                    return Ok(Action::requeue(DEFAULT_RECONCILE_DURATION));
                }

                let reason = classification.reason;

                // Claiming the marker is the commit point; a concurrent
                // claim turns into a 409 here and we retry shortly.
                let node = mark_draining(context.cluster.as_ref(), &node).await?;
                context.audit.drain_started(&node, &reason);
                context.metrics.record_drain_started();

                run_drain_sequence(&context, node, &policy.drain_settings, &reason).await?;
                Ok(Action::requeue(DEFAULT_RECONCILE_DURATION))
            }
        }
    })
    .await
}

/// Cordon, evict, then flip the marker to drained. The caller has already
/// accounted for the drain being in progress.
async fn run_drain_sequence(
    context: &DrainContext,
    node: Node,
    settings: &DrainSettings,
    reason: &str,
) -> Result<DrainSummary, ReconcileError> {
    let started_at = std::time::Instant::now();
    let result = drain_node(context, &node, settings).await;
    context.metrics.record_drain_duration(started_at.elapsed());

    match result {
        Ok(summary) => {
            context.metrics.record_pods_evicted(summary.evicted as u64);

            mark_drained(context.cluster.as_ref(), &node, reason).await.map_err(|err| {
                context.metrics.record_drain_failed();
                err
            })?;

            context.metrics.record_drain_completed();
            context.audit.drain_completed(
                &node,
                &format!(
                    "evicted {} pod(s), skipped {} ({reason})",
                    summary.evicted, summary.skipped
                ),
            );
            Ok(summary)
        }
        Err(err) => {
            context.metrics.record_pods_evicted(err.evicted as u64);
            context.metrics.record_pods_failed_to_evict(err.failed as u64);
            context.metrics.record_drain_failed();
            context.audit.drain_failed(&node, &err.to_string());
            Err(err.into())
        }
    }
}

async fn drain_node(
    context: &DrainContext,
    node: &Node,
    settings: &DrainSettings,
) -> Result<DrainSummary, DrainError> {
    if !settings.skip_cordon {
        let changed = context
            .drainer
            .cordon(node)
            .await
            .map_err(|err| DrainError {
                node: node.name_any(),
                evicted: 0,
                failed: 0,
                source: err,
            })?;
        if changed {
            context.metrics.record_node_cordoned();
            context.audit.cordoned(node);
        }
    }

    context.drainer.drain(node, settings).await
}

fn error_policy(
    node: Arc<Node>,
    err: &ReconcileError,
    context: Arc<DrainContext>,
) -> Action {
    let span = span!(Level::ERROR, "reconciler::error_policy", node = %node.name_any());
    let _ = span.enter();

    if let ReconcileError::Kube(err) = err {
        if is_409_conflict_error(err) {
            return Action::requeue(CONFLICT_RECONCILE);
        }

        if is_transient_error(err) {
            let object_ref = ObjectRef::from_obj(node.as_ref());
            info!(%object_ref, ?err, "retry transient error");
            return Action::requeue(TRANSIENT_ERROR_RECONCILE);
        }
    }

    // A failed drain keeps its in-progress marker; the next attempt resumes.
    Action::requeue(context.policy.snapshot().retry_failed_after)
}

async fn log_reconcile_result(
    result: Result<(ObjectRef<Node>, Action), controller::Error<ReconcileError, watcher::Error>>,
) {
    let span = span!(Level::ERROR, "reconciler");
    instrumented!(span, async move {
        match result {
            Ok((object_ref, action)) => {
                trace!(%object_ref, ?action, "success");
            }
            Err(controller::Error::ReconcilerFailed(err, object_ref)) => match err {
                ReconcileError::Kube(err) if is_409_conflict_error(&err) => {
                    debug!(%object_ref, ?err, "conflict");
                }
                ReconcileError::Kube(err)
                    if is_404_not_found_error(&err) || is_410_expired_error(&err) =>
                {
                    // reconciler is late
                    debug!(%object_ref, ?err, "gone");
                }
                _ => error!(%object_ref, ?err, "error"),
            },
            Err(controller::Error::ObjectNotFound(object_ref)) => {
                // reconciler is late
                debug!(%object_ref, "gone");
            }
            Err(err) => {
                error!(?err, "error");
            }
        }
    })
    .await
}

#[derive(Error, Debug)]
pub enum ManualOpError {
    #[error("node {0} not found")]
    NotFound(String),
    #[error("node {0} is already being drained")]
    AlreadyDraining(String),
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Drain(#[from] DrainError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ManualDrainOutcome {
    Drained(DrainSummary),
    AlreadyDrained,
}

/// Drain a node on request, regardless of triggers. Runs the same sequence
/// as the reconciler and leaves the same markers behind.
pub async fn manual_drain(
    context: &DrainContext,
    name: &str,
) -> Result<ManualDrainOutcome, ManualOpError> {
    let node = get_node_or_not_found(context, name).await?;

    match drain_marker_state(&node) {
        DrainMarkerState::Drained => return Ok(ManualDrainOutcome::AlreadyDrained),
        DrainMarkerState::Draining => {
            return Err(ManualOpError::AlreadyDraining(name.to_string()))
        }
        DrainMarkerState::Idle => {}
    }

    let reason = "manual drain request";

    let node = match mark_draining(context.cluster.as_ref(), &node).await {
        Ok(node) => node,
        Err(err) => {
            // The reconciler (or another caller) claimed the node first.
            if is_409_conflict_error(&err) {
                return Err(ManualOpError::AlreadyDraining(name.to_string()));
            }
            return Err(err.into());
        }
    };

    context.audit.drain_started(&node, reason);
    context.metrics.record_drain_started();

    let settings = context.policy.snapshot().drain_settings.clone();
    let summary = run_drain_sequence(context, node, &settings, reason)
        .await
        .map_err(|err| match err {
            ReconcileError::Kube(err) => ManualOpError::Kube(err),
            ReconcileError::Drain(err) => ManualOpError::Drain(err),
        })?;

    Ok(ManualDrainOutcome::Drained(summary))
}

pub async fn manual_cordon(context: &DrainContext, name: &str) -> Result<bool, ManualOpError> {
    let node = get_node_or_not_found(context, name).await?;

    let changed = context.drainer.cordon(&node).await?;
    if changed {
        context.metrics.record_node_cordoned();
        context.audit.cordoned(&node);
    }
    Ok(changed)
}

pub async fn manual_uncordon(context: &DrainContext, name: &str) -> Result<bool, ManualOpError> {
    let node = get_node_or_not_found(context, name).await?;

    let changed = context.drainer.uncordon(&node).await?;
    if changed {
        context.metrics.record_node_uncordoned();
        context.audit.uncordoned(&node);
    }
    Ok(changed)
}

async fn get_node_or_not_found(context: &DrainContext, name: &str) -> Result<Node, ManualOpError> {
    context
        .cluster
        .get_node(name)
        .await?
        .ok_or_else(|| ManualOpError::NotFound(name.to_string()))
}

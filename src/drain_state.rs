use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::{json, Value};

use crate::cluster_api::ClusterApi;
use crate::consts::{
    DRAINED_ANNOTATION_KEY, DRAIN_COMPLETE_TIME_ANNOTATION_KEY, DRAIN_IN_PROGRESS_ANNOTATION_KEY,
    DRAIN_REASON_ANNOTATION_KEY, DRAIN_START_TIME_ANNOTATION_KEY,
};

/// Where a node is in its drain lifecycle, derived from annotations.
///
/// The annotations are the only durable record, so a restarted process
/// recovers the state of every node from its next watch snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainMarkerState {
    Idle,
    Draining,
    Drained,
}

pub fn drain_marker_state(node: &Node) -> DrainMarkerState {
    let annotations = node.annotations();

    // Key presence is the marker; the value is informational and may have
    // been edited by an operator. An interrupted pass may leave both markers
    // momentarily unset between patches, but never both set: the transition
    // patch clears one as it sets the other.
    if annotations.contains_key(DRAIN_IN_PROGRESS_ANNOTATION_KEY) {
        DrainMarkerState::Draining
    } else if annotations.contains_key(DRAINED_ANNOTATION_KEY) {
        DrainMarkerState::Drained
    } else {
        DrainMarkerState::Idle
    }
}

/// Merge patch claiming a node for draining.
///
/// Carries the observed `resourceVersion` so that a concurrent writer turns
/// this into a 409 instead of a silent double-claim.
pub fn draining_patch(node: &Node, now: DateTime<Utc>) -> Value {
    json!({
        "metadata": {
            "resourceVersion": node.resource_version(),
            "annotations": {
                DRAIN_IN_PROGRESS_ANNOTATION_KEY: "true",
                DRAIN_START_TIME_ANNOTATION_KEY: rfc3339(now),
            },
        },
    })
}

/// Merge patch completing a drain: clears the in-progress marker and sets the
/// drained marker in one request, so no observer sees both or neither.
pub fn drained_patch(now: DateTime<Utc>, reason: &str) -> Value {
    json!({
        "metadata": {
            "annotations": {
                DRAIN_IN_PROGRESS_ANNOTATION_KEY: null,
                DRAINED_ANNOTATION_KEY: "true",
                DRAIN_COMPLETE_TIME_ANNOTATION_KEY: rfc3339(now),
                DRAIN_REASON_ANNOTATION_KEY: reason,
            },
        },
    })
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub async fn mark_draining(cluster: &dyn ClusterApi, node: &Node) -> kube::Result<Node> {
    cluster
        .patch_node(&node.name_any(), draining_patch(node, Utc::now()))
        .await
}

pub async fn mark_drained(
    cluster: &dyn ClusterApi,
    node: &Node,
    reason: &str,
) -> kube::Result<Node> {
    cluster
        .patch_node(&node.name_any(), drained_patch(Utc::now(), reason))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::TimeZone;

    macro_rules! from_json {
        ($($json:tt)+) => {
            ::serde_json::from_value(::serde_json::json!($($json)+)).expect("Invalid json")
        };
    }

    fn node_with_annotations(annotations: serde_json::Value) -> Node {
        from_json!({
            "metadata": {
                "name": "node-1",
                "annotations": annotations,
            }
        })
    }

    #[test]
    fn bare_node_should_be_idle() {
        let node: Node = from_json!({ "metadata": { "name": "node-1" } });

        assert_eq!(drain_marker_state(&node), DrainMarkerState::Idle);
    }

    #[test]
    fn in_progress_marker_should_mean_draining() {
        let node = node_with_annotations(serde_json::json!({
            "node-drainer/drain-in-progress": "true",
        }));

        assert_eq!(drain_marker_state(&node), DrainMarkerState::Draining);
    }

    #[test]
    fn drained_marker_should_mean_drained() {
        let node = node_with_annotations(serde_json::json!({
            "node-drainer/drained": "true",
            "node-drainer/drain-reason": "trigger label maintenance=true",
        }));

        assert_eq!(drain_marker_state(&node), DrainMarkerState::Drained);
    }

    #[test]
    fn marker_presence_should_count_regardless_of_value() {
        // Operator-edited marker values must not reset the state machine.
        let node = node_with_annotations(serde_json::json!({
            "node-drainer/drain-in-progress": "yes",
        }));
        assert_eq!(drain_marker_state(&node), DrainMarkerState::Draining);

        let node = node_with_annotations(serde_json::json!({
            "node-drainer/drained": "false",
        }));
        assert_eq!(drain_marker_state(&node), DrainMarkerState::Drained);
    }

    #[test]
    fn in_progress_marker_should_win_over_drained_marker() {
        let node = node_with_annotations(serde_json::json!({
            "node-drainer/drain-in-progress": "true",
            "node-drainer/drained": "true",
        }));

        assert_eq!(drain_marker_state(&node), DrainMarkerState::Draining);
    }

    #[test]
    fn draining_patch_should_carry_resource_version_and_start_time() {
        let node: Node = from_json!({
            "metadata": {
                "name": "node-1",
                "resourceVersion": "12345",
            }
        });
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();

        let patch = draining_patch(&node, now);

        assert_eq!(patch["metadata"]["resourceVersion"], "12345");
        let annotations = &patch["metadata"]["annotations"];
        assert_eq!(annotations["node-drainer/drain-in-progress"], "true");
        assert_eq!(annotations["node-drainer/drain-start-time"], "2026-03-01T12:30:00Z");
    }

    #[test]
    fn drained_patch_should_clear_in_progress_and_set_drained() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 45, 30).unwrap();

        let patch = drained_patch(now, "condition MemoryPressure is True");

        let annotations = &patch["metadata"]["annotations"];
        // null in a merge patch removes the key
        assert!(annotations["node-drainer/drain-in-progress"].is_null());
        assert_eq!(annotations["node-drainer/drained"], "true");
        assert_eq!(annotations["node-drainer/drain-complete-time"], "2026-03-01T12:45:30Z");
        assert_eq!(
            annotations["node-drainer/drain-reason"],
            "condition MemoryPressure is True"
        );
    }
}

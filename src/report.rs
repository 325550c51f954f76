use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::Resource;
use tracing::{info, warn};

/// Publishes drain lifecycle events on the node objects.
///
/// Events are diagnostics only: publishing happens on a detached task and
/// failures are swallowed, so a slow or unavailable events API never blocks
/// or fails a drain transition. Tests run with the recorder disabled.
#[derive(Clone)]
pub struct AuditLog {
    recorder: Option<Recorder>,
}

impl AuditLog {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder: Some(recorder),
        }
    }

    pub fn disabled() -> Self {
        Self { recorder: None }
    }

    pub fn drain_started(&self, node: &Node, reason: &str) {
        info!(reason, "drain started");
        self.publish(node, EventType::Normal, "Draining", "DrainStarted", reason);
    }

    pub fn drain_resumed(&self, node: &Node, reason: &str) {
        info!(reason, "resuming interrupted drain");
        self.publish(node, EventType::Normal, "Draining", "DrainResumed", reason);
    }

    pub fn drain_completed(&self, node: &Node, note: &str) {
        info!(note, "drain completed");
        self.publish(node, EventType::Normal, "Draining", "DrainCompleted", note);
    }

    pub fn drain_failed(&self, node: &Node, note: &str) {
        warn!(note, "drain failed");
        self.publish(node, EventType::Warning, "Draining", "DrainFailed", note);
    }

    pub fn cordoned(&self, node: &Node) {
        info!("node cordoned");
        self.publish(
            node,
            EventType::Normal,
            "Cordoning",
            "Cordoned",
            "marked unschedulable",
        );
    }

    pub fn uncordoned(&self, node: &Node) {
        info!("node uncordoned");
        self.publish(
            node,
            EventType::Normal,
            "Cordoning",
            "Uncordoned",
            "marked schedulable",
        );
    }

    fn publish(&self, node: &Node, type_: EventType, action: &str, reason: &str, note: &str) {
        let Some(recorder) = &self.recorder else {
            return;
        };

        // max limit of the note is 1KB
        let note = if note.len() > 1024 {
            let mut boundary = 1024 - "...".len();
            loop {
                if note.is_char_boundary(boundary) {
                    break format!("{}...", &note[..boundary]);
                }

                boundary -= 1;
            }
        } else {
            note.to_string()
        };

        let event = Event {
            type_,
            action: action.to_string(),
            reason: reason.to_string(),
            note: Some(note),
            secondary: None,
        };

        let recorder = recorder.clone();
        let reference = node.object_ref(&());
        tokio::spawn(async move {
            // ignore the error of diagnostic events
            let _ = recorder.publish(&event, &reference).await;
        });
    }
}

pub const CONTROLLER_NAME: &str = "node-drainer";

pub const DRAIN_IN_PROGRESS_ANNOTATION_KEY: &str = "node-drainer/drain-in-progress";
pub const DRAINED_ANNOTATION_KEY: &str = "node-drainer/drained";
pub const DRAIN_START_TIME_ANNOTATION_KEY: &str = "node-drainer/drain-start-time";
pub const DRAIN_COMPLETE_TIME_ANNOTATION_KEY: &str = "node-drainer/drain-complete-time";
pub const DRAIN_REASON_ANNOTATION_KEY: &str = "node-drainer/drain-reason";

/// Set by the kubelet on static pods. Such pods cannot be evicted.
pub const MIRROR_POD_ANNOTATION_KEY: &str = "kubernetes.io/config.mirror";

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Process-wide drain counters, exposed as Prometheus text on `/metrics`.
///
/// Counters survive policy reloads but not restarts; durable drain state
/// lives in node annotations, not here.
#[derive(Debug, Default)]
pub struct Metrics {
    drain_started: AtomicU64,
    drain_completed: AtomicU64,
    drain_failed: AtomicU64,
    pods_evicted: AtomicU64,
    pods_failed_to_evict: AtomicU64,
    nodes_cordoned: AtomicU64,
    nodes_uncordoned: AtomicU64,
    active_drains: AtomicI64,
    drain_duration_millis: AtomicU64,
    drain_duration_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_drain_started(&self) {
        self.drain_started.fetch_add(1, Ordering::Relaxed);
        self.active_drains.fetch_add(1, Ordering::Relaxed);
    }

    /// A drain interrupted by a restart re-enters the in-progress gauge
    /// without counting as a newly started drain.
    pub fn record_drain_resumed(&self) {
        self.active_drains.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drain_completed(&self) {
        self.drain_completed.fetch_add(1, Ordering::Relaxed);
        self.active_drains.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_drain_failed(&self) {
        self.drain_failed.fetch_add(1, Ordering::Relaxed);
        self.active_drains.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_pods_evicted(&self, count: u64) {
        self.pods_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_pods_failed_to_evict(&self, count: u64) {
        self.pods_failed_to_evict.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_node_cordoned(&self) {
        self.nodes_cordoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_node_uncordoned(&self) {
        self.nodes_uncordoned.fetch_add(1, Ordering::Relaxed);
    }

    /// How long a drain pass took, successful or not.
    pub fn record_drain_duration(&self, duration: Duration) {
        self.drain_duration_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.drain_duration_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_drains(&self) -> i64 {
        self.active_drains.load(Ordering::Relaxed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();

        for (name, help, value) in [
            (
                "node_drainer_drain_started_total",
                "Drain operations started",
                self.drain_started.load(Ordering::Relaxed),
            ),
            (
                "node_drainer_drain_completed_total",
                "Drain operations completed successfully",
                self.drain_completed.load(Ordering::Relaxed),
            ),
            (
                "node_drainer_drain_failed_total",
                "Drain operations that ended in failure",
                self.drain_failed.load(Ordering::Relaxed),
            ),
            (
                "node_drainer_pods_evicted_total",
                "Pods evicted across all drain operations",
                self.pods_evicted.load(Ordering::Relaxed),
            ),
            (
                "node_drainer_pods_failed_to_evict_total",
                "Pod evictions that failed",
                self.pods_failed_to_evict.load(Ordering::Relaxed),
            ),
            (
                "node_drainer_nodes_cordoned_total",
                "Nodes marked unschedulable",
                self.nodes_cordoned.load(Ordering::Relaxed),
            ),
            (
                "node_drainer_nodes_uncordoned_total",
                "Nodes marked schedulable again",
                self.nodes_uncordoned.load(Ordering::Relaxed),
            ),
        ] {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        }

        let active = self.active_drains.load(Ordering::Relaxed);
        out.push_str(&format!(
            "# HELP node_drainer_active_drain_operations Drains currently in progress\n\
             # TYPE node_drainer_active_drain_operations gauge\n\
             node_drainer_active_drain_operations {active}\n"
        ));

        let duration_sum = self.drain_duration_millis.load(Ordering::Relaxed) as f64 / 1000.0;
        let duration_count = self.drain_duration_count.load(Ordering::Relaxed);
        out.push_str(&format!(
            "# HELP node_drainer_drain_duration_seconds Wall-clock time of drain passes\n\
             # TYPE node_drainer_drain_duration_seconds summary\n\
             node_drainer_drain_duration_seconds_sum {duration_sum}\n\
             node_drainer_drain_duration_seconds_count {duration_count}\n"
        ));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_should_expose_all_series() {
        let metrics = Metrics::new();
        metrics.record_drain_started();
        metrics.record_drain_started();
        metrics.record_drain_completed();
        metrics.record_drain_failed();
        metrics.record_pods_evicted(5);
        metrics.record_pods_failed_to_evict(1);
        metrics.record_node_cordoned();

        let text = metrics.render();

        assert!(text.contains("node_drainer_drain_started_total 2"));
        assert!(text.contains("node_drainer_drain_completed_total 1"));
        assert!(text.contains("node_drainer_drain_failed_total 1"));
        assert!(text.contains("node_drainer_pods_evicted_total 5"));
        assert!(text.contains("node_drainer_pods_failed_to_evict_total 1"));
        assert!(text.contains("node_drainer_nodes_cordoned_total 1"));
        assert!(text.contains("node_drainer_nodes_uncordoned_total 0"));
        assert!(text.contains("node_drainer_active_drain_operations 0"));
        assert!(text.contains("# TYPE node_drainer_drain_started_total counter"));
        assert!(text.contains("# TYPE node_drainer_active_drain_operations gauge"));
        assert!(text.contains("# TYPE node_drainer_drain_duration_seconds summary"));
    }

    #[test]
    fn drain_duration_should_accumulate_sum_and_count() {
        let metrics = Metrics::new();
        metrics.record_drain_duration(Duration::from_millis(1500));
        metrics.record_drain_duration(Duration::from_millis(500));

        let text = metrics.render();

        assert!(text.contains("node_drainer_drain_duration_seconds_sum 2"));
        assert!(text.contains("node_drainer_drain_duration_seconds_count 2"));
    }

    #[test]
    fn active_drains_should_track_started_minus_finished() {
        let metrics = Metrics::new();
        metrics.record_drain_started();
        metrics.record_drain_started();
        metrics.record_drain_completed();

        assert_eq!(metrics.active_drains(), 1);
    }
}

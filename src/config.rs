use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::Parser;
use debounced::debounced;
use eyre::{Context, Result};
use futures::StreamExt;
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::shutdown::Shutdown;
use crate::spawn_service::spawn_service;

/// Process arguments. The drain policy itself lives in the config file so it
/// can be hot-reloaded; everything here is fixed for the process lifetime.
#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Path to the drain policy file (YAML).
    #[arg(long, default_value = "/etc/node-drainer/config.yaml")]
    pub config: PathBuf,

    /// Bind address of the management API.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub api_bind: SocketAddr,
}

/// A label key with an optional value. An empty value means "key presence is
/// sufficient" and matches any value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct LabelRule {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ConditionRule {
    pub r#type: String,
    #[serde(default = "default_condition_status")]
    pub status: String,
}

fn default_condition_status() -> String {
    String::from("True")
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainSettings {
    /// Grace period passed to each eviction request.
    #[serde(deserialize_with = "humantime_duration")]
    pub grace_period: Duration,
    /// Keep evicting after a failure and report an aggregate error, instead
    /// of aborting the pass on the first failure. Also permits evicting pods
    /// with local storage.
    pub force: bool,
    /// Leave DaemonSet-managed pods alone; their controller ignores cordons.
    pub ignore_daemon_sets: bool,
    /// Permit evicting pods with emptyDir/hostPath volumes without `force`.
    pub allow_local_storage: bool,
    pub skip_cordon: bool,
    /// Optional label selector narrowing which pods are drained.
    pub pod_selector: Option<String>,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            force: false,
            ignore_daemon_sets: true,
            allow_local_storage: false,
            skip_cordon: false,
            pod_selector: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainPolicy {
    pub label_triggers: Vec<LabelRule>,
    pub exclude_labels: Vec<LabelRule>,
    pub node_conditions: Vec<ConditionRule>,
    pub drain_settings: DrainSettings,
    /// Backoff before a failed drain pass is retried.
    #[serde(deserialize_with = "humantime_duration")]
    pub retry_failed_after: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            label_triggers: Vec::new(),
            exclude_labels: Vec::new(),
            node_conditions: Vec::new(),
            drain_settings: DrainSettings::default(),
            retry_failed_after: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("{kind} rule #{index} has an empty label key")]
    EmptyRuleKey { kind: &'static str, index: usize },
    #[error("condition rule #{index} has an empty type")]
    EmptyConditionType { index: usize },
    #[error("condition rule #{index} has invalid status '{status}', expected True/False/Unknown")]
    InvalidConditionStatus { index: usize, status: String },
}

impl DrainPolicy {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let policy: DrainPolicy = serde_yaml::from_str(yaml).context("parsing drain policy")?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).context(format!("reading {path:?}"))?;
        Self::from_yaml(&yaml)
    }

    /// An invalid rule set is fatal at startup, and rejected on reload.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (kind, rules) in [
            ("trigger", &self.label_triggers),
            ("exclude", &self.exclude_labels),
        ] {
            for (index, rule) in rules.iter().enumerate() {
                if rule.key.is_empty() {
                    return Err(PolicyError::EmptyRuleKey { kind, index });
                }
            }
        }

        for (index, rule) in self.node_conditions.iter().enumerate() {
            if rule.r#type.is_empty() {
                return Err(PolicyError::EmptyConditionType { index });
            }
            if !matches!(rule.status.as_str(), "True" | "False" | "Unknown") {
                return Err(PolicyError::InvalidConditionStatus {
                    index,
                    status: rule.status.clone(),
                });
            }
        }

        Ok(())
    }
}

fn humantime_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let str = String::deserialize(de)?;
    humantime::parse_duration(&str).map_err(serde::de::Error::custom)
}

/// Shared handle to the current policy snapshot.
///
/// Reloads swap the `Arc`, never mutate in place, so an in-flight
/// reconciliation pass always sees one consistent snapshot.
#[derive(Clone)]
pub struct PolicyStore {
    current: Arc<RwLock<Arc<DrainPolicy>>>,
}

impl PolicyStore {
    pub fn new(policy: DrainPolicy) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::new(DrainPolicy::from_file(path)?))
    }

    pub fn snapshot(&self) -> Arc<DrainPolicy> {
        Arc::clone(&self.current.read().unwrap())
    }

    fn replace(&self, policy: DrainPolicy) {
        *self.current.write().unwrap() = Arc::new(policy);
    }
}

/// Watch the policy file and swap the snapshot on change. A reload that fails
/// to parse or validate keeps the previous snapshot.
pub fn start_policy_reload(
    store: &PolicyStore,
    path: &Path,
    shutdown: &Shutdown,
) -> Result<()> {
    let store = store.clone();
    let path = path.to_path_buf();

    let (watcher_tx, watcher_rx) = mpsc::channel(1);
    let mut watcher = notify::recommended_watcher(move |_| {
        let _ = watcher_tx.try_send(());
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    let changes = Box::pin(futures::stream::unfold(
        (watcher, watcher_rx),
        |(watcher, mut rx)| async move { rx.recv().await.map(|event| (event, (watcher, rx))) },
    ));
    let mut changes =
        debounced(changes, Duration::from_secs(1)).take_until(shutdown.wait_shutdown_triggered());

    spawn_service(shutdown, "policy-reload", async move {
        while changes.next().await.is_some() {
            match DrainPolicy::from_file(&path) {
                Ok(policy) => {
                    store.replace(policy);
                    info!(?path, "drain policy reloaded");
                }
                Err(err) => {
                    error!(?err, "reloading drain policy failed, keeping previous");
                }
            }
        }
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_full_policy() {
        let policy = DrainPolicy::from_yaml(
            r#"
            labelTriggers:
              - key: maintenance
                value: "true"
              - key: decommission
            excludeLabels:
              - key: node-drainer/exclude
            nodeConditions:
              - type: MemoryPressure
              - type: OutOfDisk
                status: "True"
            drainSettings:
              gracePeriod: 45s
              force: true
              ignoreDaemonSets: false
              allowLocalStorage: true
              skipCordon: true
              podSelector: "app=web"
            retryFailedAfter: 10m
            "#,
        )
        .unwrap();

        assert_eq!(policy.label_triggers.len(), 2);
        assert_eq!(policy.label_triggers[1].value, "", "missing value means any");
        assert_eq!(policy.exclude_labels.len(), 1);
        assert_eq!(policy.node_conditions[0].status, "True");
        assert_eq!(policy.drain_settings.grace_period, Duration::from_secs(45));
        assert!(policy.drain_settings.force);
        assert!(!policy.drain_settings.ignore_daemon_sets);
        assert!(policy.drain_settings.allow_local_storage);
        assert!(policy.drain_settings.skip_cordon);
        assert_eq!(policy.drain_settings.pod_selector.as_deref(), Some("app=web"));
        assert_eq!(policy.retry_failed_after, Duration::from_secs(600));
    }

    #[test]
    fn empty_file_should_yield_defaults() {
        let policy = DrainPolicy::from_yaml("{}").unwrap();

        assert!(policy.label_triggers.is_empty());
        assert_eq!(
            policy.drain_settings.grace_period,
            Duration::from_secs(30)
        );
        assert!(policy.drain_settings.ignore_daemon_sets);
        assert_eq!(policy.retry_failed_after, Duration::from_secs(300));
    }

    #[test]
    fn empty_trigger_key_should_be_rejected() {
        let result = DrainPolicy::from_yaml(
            r#"
            labelTriggers:
              - key: ""
                value: x
            "#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn invalid_condition_status_should_be_rejected() {
        let policy = DrainPolicy {
            node_conditions: vec![ConditionRule {
                r#type: String::from("Ready"),
                status: String::from("yes"),
            }],
            ..DrainPolicy::default()
        };

        assert_matches::assert_matches!(
            policy.validate(),
            Err(PolicyError::InvalidConditionStatus { index: 0, .. })
        );
    }

    #[test]
    fn bad_duration_should_be_rejected() {
        let result = DrainPolicy::from_yaml("retryFailedAfter: soon");

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn policy_file_change_should_swap_the_snapshot() {
        let dir = std::env::temp_dir().join(format!("node-drainer-reload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(&path, "{}").unwrap();

        let store = PolicyStore::load(&path).unwrap();
        let shutdown = Shutdown::new();
        start_policy_reload(&store, &path, &shutdown).unwrap();
        assert!(store.snapshot().label_triggers.is_empty());

        std::fs::write(&path, "labelTriggers:\n  - key: maintenance\n").unwrap();

        let mut swapped = false;
        for _ in 0..100 {
            if !store.snapshot().label_triggers.is_empty() {
                swapped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        shutdown.trigger_shutdown();
        assert!(swapped, "snapshot was not swapped after a file change");
    }

    #[test]
    fn policy_store_snapshot_should_swap_on_replace() {
        let store = PolicyStore::new(DrainPolicy::default());
        let before = store.snapshot();

        store.replace(DrainPolicy {
            label_triggers: vec![LabelRule {
                key: String::from("maintenance"),
                value: String::new(),
            }],
            ..DrainPolicy::default()
        });

        assert!(before.label_triggers.is_empty(), "old snapshot unchanged");
        assert_eq!(store.snapshot().label_triggers.len(), 1);
    }
}

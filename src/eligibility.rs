use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::config::{ConditionRule, DrainPolicy, LabelRule};

/// Only conditions reporting exactly this status trigger a drain.
const CONDITION_STATUS_TRUE: &str = "True";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub eligible: bool,
    pub reason: String,
}

impl Classification {
    fn eligible(reason: String) -> Self {
        Self {
            eligible: true,
            reason,
        }
    }

    fn ineligible(reason: String) -> Self {
        Self {
            eligible: false,
            reason,
        }
    }
}

/// Decide whether a node must be drained, and why.
///
/// Pure read of the node snapshot and the policy snapshot; no I/O, safe to
/// call concurrently. Exclude rules are evaluated first and are absolute:
/// they win over any trigger or condition, and this is the only place they
/// are enforced (the node watch itself is unfiltered).
pub fn classify(node: &Node, policy: &DrainPolicy) -> Classification {
    let labels = node.labels();

    for rule in &policy.exclude_labels {
        if let Some(value) = labels.get(&rule.key) {
            if label_rule_matches(rule, value) {
                return Classification::ineligible(format!("exclude label {} matched", rule.key));
            }
        }
    }

    for rule in &policy.label_triggers {
        if let Some(value) = labels.get(&rule.key) {
            if label_rule_matches(rule, value) {
                return Classification::eligible(format!("trigger label {}={}", rule.key, value));
            }
        }
    }

    if let Some(conditions) = node.status.as_ref().and_then(|s| s.conditions.as_ref()) {
        for rule in &policy.node_conditions {
            if conditions.iter().any(|c| condition_rule_matches(rule, c)) {
                return Classification::eligible(format!("condition {} is True", rule.r#type));
            }
        }
    }

    Classification::ineligible(String::from("no drain triggers found"))
}

fn label_rule_matches(rule: &LabelRule, node_value: &str) -> bool {
    rule.value.is_empty() || rule.value == node_value
}

fn condition_rule_matches(
    rule: &ConditionRule,
    condition: &k8s_openapi::api::core::v1::NodeCondition,
) -> bool {
    // Status comparison is case-exact; "Unknown"/"False" never trigger.
    condition.type_ == rule.r#type && condition.status == CONDITION_STATUS_TRUE
}

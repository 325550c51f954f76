mod api;
mod cluster_api;
mod config;
mod consts;
mod controllers;
mod drain_state;
mod drainer;
mod eligibility;
mod error_codes;
mod metrics;
mod report;
mod service_registry;
mod shutdown;
mod spawn_service;
mod utils;

pub use crate::api::start_api_server;
pub use crate::cluster_api::{ClusterApi, KubeClusterApi};
pub use crate::config::{start_policy_reload, Args, DrainPolicy, PolicyStore};
pub use crate::consts::CONTROLLER_NAME;
pub use crate::controllers::{start_node_drain_controller, DrainContext};
pub use crate::metrics::Metrics;
pub use crate::report::AuditLog;
pub use crate::service_registry::ServiceRegistry;
pub use crate::shutdown::Shutdown;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

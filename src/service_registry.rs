use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Tracks which long-running services have finished starting up.
/// `/readyz` reports ready once every registered service has signalled.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<Mutex<Vec<Arc<ServiceState>>>>,
}

impl ServiceRegistry {
    pub fn register(&self, name: &str) -> ServiceSignal {
        let state = Arc::new(ServiceState {
            name: name.to_string(),
            ready: AtomicBool::new(false),
        });

        self.services.lock().unwrap().push(Arc::clone(&state));
        debug!(%name, "Service registered");
        ServiceSignal { state }
    }

    pub fn is_ready(&self) -> bool {
        self.pending_services().is_empty()
    }

    pub fn pending_services(&self) -> Vec<String> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .filter(|service| !service.ready.load(Ordering::SeqCst))
            .map(|service| service.name.clone())
            .collect()
    }
}

pub struct ServiceSignal {
    state: Arc<ServiceState>,
}

impl ServiceSignal {
    pub fn ready(&self) {
        self.state.ready.store(true, Ordering::SeqCst);
        debug!(%self.state.name, "Service ready");
    }
}

struct ServiceState {
    name: String,
    ready: AtomicBool,
}

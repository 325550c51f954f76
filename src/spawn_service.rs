use std::future::Future;

use eyre::{Context, Result};
use tokio::task::{JoinError, JoinHandle};
use tokio::{select, spawn};
use tracing::{debug, error, span, warn, Instrument, Level};

use crate::shutdown::Shutdown;

#[derive(Debug)]
pub enum ServiceExit {
    GracefulShutdown,
    EarlyStop,
    Panic(JoinError),
}

/// Spawn a supervised long-running task.
///
/// A service that stops before shutdown was triggered, or panics, takes the
/// whole process down with it: a controller silently gone would otherwise
/// leave nodes stuck in Draining until someone notices.
pub fn spawn_service(
    shutdown: &Shutdown,
    name: impl Into<String>,
    future: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<ServiceExit>> {
    let shutdown = shutdown.clone();
    let service_name = name.into();

    let supervised = {
        let shutdown = shutdown.clone();
        async move {
            debug!("Service starting");
            let exit = match spawn(future).await {
                Ok(_) if shutdown.is_shutdown_triggered() => ServiceExit::GracefulShutdown,
                Ok(_) => {
                    shutdown.trigger_shutdown();
                    ServiceExit::EarlyStop
                }
                Err(err) => {
                    shutdown.trigger_shutdown();
                    ServiceExit::Panic(err)
                }
            };

            match &exit {
                ServiceExit::GracefulShutdown => debug!("Service gracefully shutdown"),
                ServiceExit::EarlyStop => error!("Service stopped early"),
                ServiceExit::Panic(err) => error!(%err, "Service panicked"),
            }
            exit
        }
    };

    let logged = {
        let shutdown = shutdown.clone();
        async move {
            let mut supervised = Box::pin(supervised);
            let slow_shutdown = async move {
                shutdown.wait_shutdown_triggered().await;
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            };

            select! {
                exit = &mut supervised => exit,
                _ = slow_shutdown => {
                    warn!("Service shutdown is taking some time");
                    supervised.await
                },
            }
        }
    };

    let instrumented = logged.instrument(span!(Level::ERROR, "service", "{}", service_name));

    // Holds shutdown completion open until the service has fully exited.
    let waited = shutdown
        .wrap_delay_shutdown(instrumented)
        .context(service_name)?;

    Ok(spawn(waited))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn graceful_shutdown_on_shutdown_request() {
        let shutdown = Shutdown::new();
        let handle = spawn_service(&shutdown, "test", {
            let shutdown = shutdown.clone();
            async move {
                shutdown.wait_shutdown_triggered().await;
                tokio::time::sleep(Duration::from_micros(500)).await;
            }
        })
        .unwrap();

        shutdown.trigger_shutdown();

        assert_matches!(handle.await, Ok(ServiceExit::GracefulShutdown));
    }

    #[tokio::test]
    async fn should_capture_early_stop() {
        let shutdown = Shutdown::new();
        let handle = spawn_service(&shutdown, "test", async move {
            tokio::time::sleep(Duration::from_micros(500)).await;
        })
        .unwrap();

        assert_matches!(handle.await, Ok(ServiceExit::EarlyStop));
    }

    #[tokio::test]
    async fn should_capture_panic() {
        let shutdown = Shutdown::new();
        let handle = spawn_service(&shutdown, "test", async move {
            tokio::time::sleep(Duration::from_micros(500)).await;
            panic!();
        })
        .unwrap();

        assert_matches!(handle.await, Ok(ServiceExit::Panic(_)));
    }

    #[tokio::test]
    async fn early_stop_should_trigger_graceful_shutdown_of_others() {
        let shutdown = Shutdown::new();
        let handle = spawn_service(&shutdown, "test", async move {
            tokio::time::sleep(Duration::from_micros(500)).await;
        })
        .unwrap();

        let other_handle = spawn_service(&shutdown, "other", {
            let shutdown = shutdown.clone();
            async move {
                shutdown.wait_shutdown_triggered().await;
                tokio::time::sleep(Duration::from_micros(500)).await;
            }
        })
        .unwrap();

        assert_matches!(handle.await, Ok(ServiceExit::EarlyStop));
        assert!(shutdown.is_shutdown_triggered());
        assert_matches!(other_handle.await, Ok(ServiceExit::GracefulShutdown));
    }
}

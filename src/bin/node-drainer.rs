use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::config::Frame;
use eyre::Result;
use kube::runtime::events::{Recorder, Reporter};
use tokio::select;
use tracing::{error, info, Level};
use tracing_error::ErrorLayer;
use tracing_subscriber::filter::FromEnvError;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::Directive, EnvFilter};

use node_drainer::{
    start_api_server, start_node_drain_controller, start_policy_reload, Args, AuditLog,
    DrainContext, KubeClusterApi, Metrics, PolicyStore, ServiceRegistry, Shutdown, CONTROLLER_NAME,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    init_tracing_subscriber()?;
    install_color_eyre()?;

    let shutdown = Shutdown::new();
    if let Err(err) = try_main(args, &shutdown).await {
        error!(?err, "Failed to start");
        shutdown.trigger_shutdown();
    }

    shutdown.wait_shutdown_triggered().await;

    select! {
        _ = shutdown.wait_shutdown_complete() => {},
        _ = tokio::time::sleep(Duration::from_secs(1)) => {
            info!("Waiting for graceful shutdown");
            shutdown.wait_shutdown_complete().await;
        }
    }

    info!("Bye!");
    Ok(ExitCode::from(1))
}

async fn try_main(args: Args, shutdown: &Shutdown) -> Result<()> {
    // An invalid policy at startup is fatal; a bad reload later keeps the
    // previous snapshot instead.
    let policy = PolicyStore::load(&args.config)?;
    start_policy_reload(&policy, &args.config, shutdown)?;

    let client = kube::Client::try_from(kube::Config::infer().await?)?;
    let cluster = KubeClusterApi::new(client.clone());
    let service_registry = ServiceRegistry::default();

    let reporter = Reporter {
        controller: String::from(CONTROLLER_NAME),
        instance: hostname::get().ok().and_then(|name| name.into_string().ok()),
    };
    let audit = AuditLog::new(Recorder::new(client.clone(), reporter));

    let context = Arc::new(DrainContext::new(
        Arc::new(cluster),
        policy,
        Arc::new(Metrics::new()),
        audit,
    ));

    info!("Starting");

    start_node_drain_controller(client, Arc::clone(&context), &service_registry, shutdown)?;
    start_api_server(args.api_bind, context, &service_registry, shutdown).await?;

    info!("Services started");
    loop {
        if service_registry.is_ready() {
            info!("Service ready");
            break;
        }

        select! {
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = shutdown.wait_shutdown_triggered() => {
                break
            },
        }
    }

    Ok(())
}

fn selfish_frame_filter(frames: &mut Vec<&Frame>) {
    frames.retain(|frame| {
        matches!(frame.name.as_ref(),
            Some(name) if name == "node_drainer"
            || name.starts_with("node_drainer::"))
    });
}

fn init_tracing_subscriber() -> Result<()> {
    tracing_subscriber::registry()
        .with({
            let layer = Layer::default();
            let filter = env_filter()?;
            layer.with_filter(filter)
        })
        .with({
            let layer = ErrorLayer::default();
            let filter = env_filter()?;
            layer.with_filter(filter)
        })
        .try_init()?;

    return Ok(());

    fn env_filter() -> Result<EnvFilter, FromEnvError> {
        EnvFilter::builder()
            .with_default_directive(Directive::from(Level::INFO))
            .from_env()
    }
}

fn install_color_eyre() -> Result<()> {
    color_eyre::config::HookBuilder::new()
        .capture_span_trace_by_default(true)
        .add_frame_filter(Box::new(selfish_frame_filter))
        .install()?;
    Ok(())
}

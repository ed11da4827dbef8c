//! Topology Orchestrator
//!
//! Runs the storage export control plane against in-memory device
//! controllers, seeded from an optional topology snapshot.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use topology_orchestrator::{
    ApiServer, ApiServerConfig, InMemoryDevices, InMemoryStore, NetworkConnectivity,
    Orchestrator, OrchestratorConfig, OrchestratorMetrics,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Topology Orchestrator - saga-driven storage export control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Orchestrator configuration file (YAML)
    #[arg(long, env = "ORCHESTRATOR_CONFIG")]
    config: Option<String>,

    /// Topology snapshot to seed the store with (YAML or JSON)
    #[arg(long, env = "TOPOLOGY_SEED")]
    seed: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("Starting Topology Orchestrator");
    info!("  Version: {}", topology_orchestrator::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Metrics: {}", args.metrics_addr);

    let config = match &args.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => OrchestratorConfig::default(),
    };

    let store = match &args.seed {
        Some(path) => {
            InMemoryStore::load(path).with_context(|| format!("loading topology seed {}", path))?
        }
        None => InMemoryStore::new(),
    };

    let devices = InMemoryDevices::new(store.clone());
    let orchestrator = Orchestrator::new(
        config,
        store,
        devices.device_set(),
        Arc::new(NetworkConnectivity),
    )
    .context("creating orchestrator")?;

    let metrics = orchestrator.metrics().clone();
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    let api_server = Arc::new(ApiServer::new(
        ApiServerConfig {
            rest_addr: args.api_addr,
        },
        orchestrator.clone(),
    ));

    let signal_server = api_server.clone();
    let signal_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_orchestrator.shutdown();
            signal_server.shutdown();
        }
    });

    api_server.run().await.context("running REST API")?;

    info!("Orchestrator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("tower_http=info".parse()?)
        .add_directive("axum=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, metrics: Arc<OrchestratorMetrics>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", content_type)
                                .body(Body::from(buffer)),
                            Err(e) => Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body(Body::from(e.to_string())),
                        },
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found")),
                    }
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("serving metrics")?;
    Ok(())
}

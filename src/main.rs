//! Node Disk Provisioner
//!
//! Per-node storage provisioner daemon. Bootstraps node identity from the
//! environment, loads runtime configuration from the operator ConfigMap,
//! brings the enabled backend subsystems up, and runs the event dispatch
//! loops alongside small health and metrics listeners.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_disk_provisioner::{
    dispatch, ClusterClient, Error, HostCommandRunner, NodeIdentity, OperatorConfig, Provisioner,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node Disk Provisioner - node-local LVM/iSCSI/NFS volume provisioning
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the operator ConfigMap
    #[arg(long, env = "NODE_DISK_CONFIGMAP", default_value = "node-disk-provisioner")]
    configmap: String,

    /// Namespace holding the operator ConfigMap
    #[arg(long, env = "NODE_DISK_NAMESPACE", default_value = "kube-system")]
    configmap_namespace: String,

    /// Kubernetes node name this instance serves
    #[arg(long, env = "NODE_DISK_NODE_NAME")]
    node_name: Option<String>,

    /// Address other nodes reach this node's exports on
    #[arg(long, env = "NODE_DISK_NODE_IP")]
    node_ip: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

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
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Node Disk Provisioner");
    info!("  Version: {}", node_disk_provisioner::VERSION);
    info!("  ConfigMap: {}/{}", args.configmap_namespace, args.configmap);

    let node = NodeIdentity {
        name: args
            .node_name
            .clone()
            .unwrap_or_else(|| args.node_ip.clone()),
        address: args.node_ip.clone(),
    };
    info!("  Node: {} ({})", node.name, node.address);

    // Connect to the control plane
    let client = kube::Client::try_default()
        .await
        .map_err(|e| Error::Configuration(format!("Failed to create Kubernetes client: {e}")))?;
    let cluster = ClusterClient::new(client.clone());

    // Load runtime configuration
    let configmap = cluster
        .get_config_map(&args.configmap_namespace, &args.configmap)
        .await?;
    let config = OperatorConfig::from_map(&configmap.data.unwrap_or_default(), node)?;
    info!("  Provisioner: {}", config.provisioner_name);
    info!("  Individual volumes: {}", config.individual_volumes_enabled());
    info!("  Shared volumes: {}", config.shared_volumes_enabled());
    info!("  Destructive actions: {}", config.destructive_actions);
    info!("  Import mode: {}", config.import_mode);

    // Build the reconciler and bring subsystems up
    let runner = Arc::new(HostCommandRunner);
    let mut provisioner = Provisioner::new(config, cluster, runner);
    provisioner.startup().await?;
    let provisioner = Arc::new(provisioner);
    info!("Provisioner initialized");

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!("Starting event dispatch");
    dispatch::run(provisioner, client).await?;

    info!("Provisioner shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
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
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

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
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {e}")))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {e}")))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {e}")))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {e}")))?;

    Ok(())
}

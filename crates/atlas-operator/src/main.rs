//! Atlas Kubernetes Operator
//!
//! Reconciles Group and DatabaseUser custom resources against the MongoDB
//! Atlas Admin API.

use anyhow::{Context, Result};
use atlas_operator::config::OperatorConfig;
use atlas_operator::controller;
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Atlas Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "atlas-operator")]
#[command(about = "Kubernetes operator for MongoDB Atlas resources")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health endpoint address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Name of the global Atlas credentials secret
    #[arg(long, env = "GLOBAL_SECRET_NAME", default_value = "mongodb-atlas-operator-api-key")]
    global_secret_name: String,

    /// Namespace holding the global credentials secret
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "mongodb-atlas-system")]
    operator_namespace: String,

    /// Atlas base URL
    #[arg(long, env = "ATLAS_DOMAIN", default_value = "https://cloud.mongodb.com/")]
    atlas_domain: String,

    /// Keep Atlas objects when their custom resource is deleted
    #[arg(long, env = "OBJECT_DELETION_PROTECTION", default_value = "true", action = clap::ArgAction::Set)]
    object_deletion_protection: bool,

    /// Refuse writes that remove Atlas state not declared in the spec
    #[arg(long, env = "SUBOBJECT_DELETION_PROTECTION", default_value = "true", action = clap::ArgAction::Set)]
    subobject_deletion_protection: bool,

    /// Record Atlas writes as events instead of executing them
    #[arg(long, env = "DRY_RUN", default_value = "false")]
    dry_run: bool,

    /// Concurrent reconciles per kind
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value = "4")]
    concurrency: u16,

    /// Timeout of every Atlas request in seconds
    #[arg(long, env = "ATLAS_REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// Drift check cadence of settled resources in seconds
    #[arg(long, env = "REAPPLY_PERIOD_SECS", default_value = "3600")]
    reapply_period_secs: u64,

    /// Pod name reported on events
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
            global_secret_name: self.global_secret_name.clone(),
            operator_namespace: self.operator_namespace.clone(),
            atlas_domain: self.atlas_domain.clone(),
            object_deletion_protection: self.object_deletion_protection,
            subobject_deletion_protection: self.subobject_deletion_protection,
            dry_run: self.dry_run,
            concurrency: self.concurrency,
            request_timeout_secs: self.request_timeout_secs,
            reapply_period_secs: self.reapply_period_secs,
            instance: self.pod_name.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;

    let config = args
        .operator_config()
        .validated()
        .context("Invalid operator configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        atlas_domain = %config.atlas_domain,
        "Starting Atlas Kubernetes Operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    controller::run(client, config)
        .await
        .context("Controller failed")?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health endpoint server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}

/// Print the CRD YAML of every kind for installation
fn print_crd() -> Result<()> {
    use atlas_operator::crd::{DatabaseUser, Group};
    use kube::CustomResourceExt;

    for crd in [Group::crd(), DatabaseUser::crd()] {
        let yaml = serde_yaml::to_string(&crd)?;
        println!("---\n{}", yaml);
    }

    Ok(())
}

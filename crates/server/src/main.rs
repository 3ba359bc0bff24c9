//! kilnd, the kiln CI server

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kiln_adapters::config::Config;
use kiln_adapters::{FileLogStore, PostgresJobStore, PostgresNumberGroup, PostgresTokenStore};
use kiln_application::{Service, ServiceConfig, ServiceSink};
use kiln_executor::Executor;
use kiln_ports::{JobStore, LogStore, NumberGroup, StatusReporter, TokenStore, WorkloadExecutor};
use kiln_proto::KilnServiceServer;

use kiln_server::grpc::KilnApi;
use kiln_server::plugins::PluginHost;
use kiln_server::providers::ProviderRegistry;
use kiln_server::reporter::LoggingStatusReporter;
use kiln_server::web;

#[derive(Parser, Debug)]
#[command(name = "kilnd", about = "Kubernetes-native CI for the impatient")]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/kiln/config.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = Config::load(&args.config)?;
    info!(config = %args.config.display(), "configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.storage.jobs_connection_string)
        .await?;

    let jobs = Arc::new(PostgresJobStore::new(pool.clone()));
    jobs.init_schema().await?;
    let tokens = Arc::new(PostgresTokenStore::new(pool.clone()));
    tokens.init_schema().await?;
    let groups = Arc::new(PostgresNumberGroup::new(pool));
    groups.init_schema().await?;

    let kube_client = build_kube_client(&config.kubeconfig).await?;
    let executor = Executor::new(
        kiln_executor::Config {
            namespace: config.namespace.clone(),
            prep_timeout: config.executor.preparation_timeout.into(),
            total_timeout: config.executor.total_timeout.into(),
            event_trace_log: config.executor.event_trace_log.clone(),
        },
        kube_client,
    )?;

    let logs: Arc<dyn LogStore> = Arc::new(FileLogStore::new(&config.storage.logs_path));
    let reporter: Arc<dyn StatusReporter> = Arc::new(LoggingStatusReporter);

    let service = Service::new(
        jobs.clone() as Arc<dyn JobStore>,
        logs,
        executor.clone() as Arc<dyn WorkloadExecutor>,
        reporter,
        ServiceConfig {
            base_url: config.base_url.clone(),
            workspace_node_path_prefix: config.workspace_node_path_prefix.clone(),
        },
    );

    executor.bind(Arc::new(ServiceSink(service.clone()))).await;
    executor.run();

    let content_dir = config.storage.logs_path.with_file_name("content");
    let providers = Arc::new(ProviderRegistry::new());
    let api = KilnApi::new(
        service,
        tokens as Arc<dyn TokenStore>,
        groups as Arc<dyn NumberGroup>,
        providers.clone(),
        content_dir.clone(),
        config.base_url.clone(),
    );
    let grpc_service = KilnServiceServer::new(api);

    let mut plugin_host = PluginHost::new(std::env::temp_dir().join("kiln-plugins"));
    plugin_host
        .start(&config.plugins, grpc_service.clone(), providers)
        .await?;

    let grpc_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.service.grpc_port));
    let web_addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.service.web_port));
    info!(%grpc_addr, %web_addr, "kiln is up");

    let grpc = tonic::transport::Server::builder()
        .add_service(grpc_service)
        .serve(grpc_addr);
    let web_listener = tokio::net::TcpListener::bind(web_addr).await?;
    let web = async move { axum::serve(web_listener, web::router(content_dir)).await };

    tokio::select! {
        result = grpc => result?,
        result = web => result?,
    }

    Ok(())
}

/// Builds the Kubernetes client: an explicit kubeconfig path when
/// configured, the default resolution (in-cluster or ~/.kube/config)
/// otherwise.
async fn build_kube_client(kubeconfig: &str) -> anyhow::Result<kube::Client> {
    if kubeconfig.is_empty() {
        return Ok(kube::Client::try_default().await?);
    }

    let kc = kube::config::Kubeconfig::read_from(kubeconfig)?;
    let config =
        kube::Config::from_custom_kubeconfig(kc, &kube::config::KubeConfigOptions::default())
            .await?;
    Ok(kube::Client::try_from(config)?)
}

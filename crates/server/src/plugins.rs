//! Plugin host
//!
//! Plugins are opaque child processes talking gRPC over Unix sockets.
//! Integration plugins get the kiln API served on a shared socket;
//! repository plugins listen on their own socket, which the host dials
//! and adapts into a repository provider.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tower::service_fn;
use tracing::{error, info, warn};

use kiln_adapters::config::{PluginRegistration, PluginType};
use kiln_proto::{KilnServiceServer, RepositoryPluginServiceClient};

use crate::grpc::KilnApi;
use crate::providers::{GrpcRepositoryProvider, ProviderRegistry};

/// Per-dial RPC timeout during the plugin handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay between handshake attempts; attempts are unbounded.
const HANDSHAKE_RETRY: Duration = Duration::from_secs(2);

pub struct PluginHost {
    sockets_dir: PathBuf,
    integration_socket: Option<PathBuf>,
}

impl PluginHost {
    pub fn new(sockets_dir: impl Into<PathBuf>) -> Self {
        PluginHost {
            sockets_dir: sockets_dir.into(),
            integration_socket: None,
        }
    }

    /// Starts all configured plugins. Plugin failures are logged; a dead
    /// plugin is not restarted.
    pub async fn start(
        &mut self,
        plugins: &[PluginRegistration],
        api: KilnServiceServer<KilnApi>,
        registry: Arc<ProviderRegistry>,
    ) -> anyhow::Result<()> {
        if plugins.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.sockets_dir).await?;

        for registration in plugins {
            if let Err(err) = self.start_plugin(registration, &api, &registry).await {
                anyhow::bail!("cannot start plugin {}: {err}", registration.name);
            }
        }
        Ok(())
    }

    async fn start_plugin(
        &mut self,
        registration: &PluginRegistration,
        api: &KilnServiceServer<KilnApi>,
        registry: &Arc<ProviderRegistry>,
    ) -> anyhow::Result<()> {
        let config_path = self
            .sockets_dir
            .join(format!("{}-config.yaml", registration.name));
        tokio::fs::write(&config_path, serde_yaml::to_string(&registration.config)?).await?;

        let mut sockets = Vec::new();
        for plugin_type in &registration.types {
            let socket = match plugin_type {
                PluginType::Integration => self.integration_socket(api).await?,
                PluginType::Repository => self
                    .repository_socket(registration, registry)
                    .await?,
            };
            sockets.push((plugin_type, socket));
        }

        let (program, args) = registration
            .command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("plugin command is empty"))?;
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .env("KILN_PLUGIN_CONFIG", &config_path)
            .kill_on_drop(true);
        for (plugin_type, socket) in &sockets {
            let var = match plugin_type {
                PluginType::Integration => "KILN_PLUGIN_SOCKET",
                PluginType::Repository => "KILN_PLUGIN_REPO_SOCKET",
            };
            command.env(var, socket);
        }

        let mut child = command.spawn()?;
        info!(plugin = %registration.name, "plugin started");

        let name = registration.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => warn!(plugin = %name, "plugin exited: {status}"),
                Err(err) => error!(plugin = %name, "cannot wait for plugin: {err}"),
            }
        });

        Ok(())
    }

    /// All integration plugins share one socket carrying the kiln API.
    async fn integration_socket(
        &mut self,
        api: &KilnServiceServer<KilnApi>,
    ) -> anyhow::Result<PathBuf> {
        if let Some(socket) = &self.integration_socket {
            return Ok(socket.clone());
        }

        let socket = self.sockets_dir.join("kiln-integration.sock");
        let _ = tokio::fs::remove_file(&socket).await;
        let listener = UnixListener::bind(&socket)?;
        let api = api.clone();
        tokio::spawn(async move {
            if let Err(err) = Server::builder()
                .add_service(api)
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await
            {
                error!("integration plugin listener failed: {err}");
            }
        });

        self.integration_socket = Some(socket.clone());
        Ok(socket)
    }

    /// Repository plugins listen themselves; the host dials the socket
    /// until the plugin answers, then registers the provider.
    async fn repository_socket(
        &self,
        registration: &PluginRegistration,
        registry: &Arc<ProviderRegistry>,
    ) -> anyhow::Result<PathBuf> {
        let host = registration
            .config
            .get("host")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("repository plugin config needs a host"))?
            .to_string();

        let socket = self
            .sockets_dir
            .join(format!("kiln-repo-{}.sock", registration.name));
        let _ = tokio::fs::remove_file(&socket).await;

        let registry = Arc::clone(registry);
        let plugin = registration.name.clone();
        let dial_socket = socket.clone();
        tokio::spawn(async move {
            let channel = dial_forever(dial_socket).await;
            registry.register(
                &host,
                Arc::new(GrpcRepositoryProvider::new(
                    RepositoryPluginServiceClient::new(channel),
                )),
            );
            info!(plugin = %plugin, host = %host, "repository provider registered");
        });

        Ok(socket)
    }
}

/// Dials a plugin socket until it answers.
async fn dial_forever(socket: PathBuf) -> Channel {
    loop {
        tokio::time::sleep(HANDSHAKE_RETRY).await;

        // the URI is ignored, the connector always yields the socket
        let endpoint = match Endpoint::try_from("http://[::]:50051") {
            Ok(endpoint) => endpoint.timeout(HANDSHAKE_TIMEOUT),
            Err(_) => continue,
        };
        let dial = socket.clone();
        match endpoint
            .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(dial.clone())))
            .await
        {
            Ok(channel) => return channel,
            Err(err) => {
                warn!(socket = %socket.display(), "plugin not answering yet: {err}");
            }
        }
    }
}

use anyhow::Context;
use petra_bridge::{
    BridgeEngine, BridgeHandle, Config, ConfigSource, MqttTransport, OpcUaTransport, YamlConfigSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "bridge.yaml";

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(format!("{}CONFIG", petra_bridge::config::ENV_PREFIX)).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string())
        .into()
}

fn load(path: &PathBuf) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("petra_bridge=info")),
        )
        .init();

    info!(
        version = petra_bridge::VERSION,
        git = petra_bridge::build_info::GIT_HASH,
        "petra-bridge starting"
    );

    let path = config_path();
    let config = load(&path)?;

    let yaml_source = config.bindings_file.clone().map(|file| Arc::new(YamlConfigSource::new(file)));
    let source: Arc<dyn ConfigSource> = match &yaml_source {
        Some(yaml) => yaml.clone(),
        None => config.config_source(),
    };
    let bindings = source.get_bindings().context("reading bindings")?;
    info!(
        endpoint = %config.source.endpoint_url,
        broker = %format!("{}:{}", config.sink.host, config.sink.port),
        bindings = bindings.len(),
        "Configuration loaded"
    );

    let handle = BridgeEngine::new(&config, OpcUaTransport::new(), MqttTransport::new())
        .start(bindings)
        .context("starting bridge")?;
    handle.attach_config_source(source.as_ref());

    let stop = CancellationToken::new();

    #[cfg(feature = "web")]
    if let Some(server_config) = &config.status_server {
        let server = petra_bridge::StatusServer::new(server_config, handle.clone())?;
        #[cfg(feature = "metrics")]
        let server = server.with_prometheus()?;
        let cancel = stop.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(cancel).await {
                error!(error = %e, "Status server stopped");
            }
        });
    }

    #[cfg(unix)]
    {
        let handle = handle.clone();
        let stop = stop.clone();
        tokio::spawn(async move { reload_on_hangup(path, yaml_source, handle, stop).await });
    }

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Received shutdown signal");

    stop.cancel();
    handle.shutdown().await;

    let counters = handle.status().counters;
    info!(
        received = counters.events_received,
        published = counters.published,
        dropped_stale = counters.dropped_stale,
        "petra-bridge stopped"
    );
    Ok(())
}

/// SIGHUP re-reads the bindings file, or the bindings section of the main file
#[cfg(unix)]
async fn reload_on_hangup(
    path: PathBuf,
    yaml_source: Option<Arc<YamlConfigSource>>,
    handle: BridgeHandle,
    stop: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP reload unavailable");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }
        info!("SIGHUP received, reloading bindings");
        match &yaml_source {
            Some(yaml) => {
                if let Err(e) = yaml.reload() {
                    error!(path = %yaml.path().display(), error = %e, "Bindings reload failed");
                }
            }
            None => match load(&path) {
                Ok(config) => {
                    if let Err(e) = handle.apply_bindings(config.bindings) {
                        error!(error = %e, "Rejected reloaded bindings");
                    }
                }
                Err(e) => error!(error = %e, "Configuration reload failed"),
            },
        }
    }
}

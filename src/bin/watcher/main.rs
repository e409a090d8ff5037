// System
use std::sync::Arc;

// Third Party
use kube::Client;
use tracing::info;

// Local
use resource_watch_rs::{
    utils::{init_tracing, wait_for_exit_signal},
    KubeSource, LogSink, Supervisor, WatcherConfig,
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing("resource_watch_rs", tracing::Level::INFO);
    let config = WatcherConfig::from_env()?;
    info!(
        "Watching {} in {:?} mode, timeout {:?}",
        config.target, config.mode, config.options.timeout_seconds
    );

    let client = Client::try_default().await?;
    let mut supervisor = Supervisor::new(Arc::new(KubeSource::new(&client)), Arc::new(LogSink));
    supervisor
        .start(config.mode, config.target, config.options)
        .await;

    let waited = wait_for_exit_signal().await;
    supervisor.stop();
    waited
}

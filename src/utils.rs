// Third Party
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over the defaults, which log `crate_name` at
/// `level` and everything else at warn.
pub fn init_tracing(crate_name: &str, level: tracing::Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{}={}", crate_name, level)));
    // A subscriber may already be installed, e.g. by a test harness.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Block until SIGINT or SIGTERM arrives.
pub async fn wait_for_exit_signal() -> Result<(), anyhow::Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let received = tokio::task::spawn_blocking(move || signals.forever().next()).await?;
    if let Some(signal) = received {
        info!("Received signal {}, shutting down", signal);
    }
    Ok(())
}

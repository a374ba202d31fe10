pub mod config;
pub mod control;
pub mod error;
pub mod forwarder;
pub mod identity;
pub mod notify;
pub mod orchestrator;
pub mod ppv2;

use std::path::Path;

/// Installs the panic hook and tracing subscriber, then runs the
/// orchestrator against `working_dir` until a shutdown signal arrives.
pub async fn run(working_dir: &Path) -> anyhow::Result<()> {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("panic in flowrelay: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowrelay=info".into()),
        )
        .init();

    orchestrator::run(working_dir).await
}

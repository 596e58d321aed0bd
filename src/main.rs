//! SIEM agent entrypoint: load config, start every unit, run until Ctrl+C or a
//! service stop, then flush and exit.

use siem_agent::{
    config::{AgentConfig, ENV_CONFIG_PATH},
    lifecycle::{Agent, AgentPorts},
    logging::StructuredLogger,
    registration::SystemInfo,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = std::env::var(ENV_CONFIG_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let config = AgentConfig::load_validated(&config_path)?;

    StructuredLogger::init(config.log.json, &config.log.level)?;
    info!(config = %config_path.display(), server = %config.server.url, "SIEM agent starting");

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        warn!(data_dir = %config.data_dir.display(), error = %e, "could not create data directory");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("siem-agent")
        .build()?;

    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();
        ctrlc::set_handler(move || on_signal.cancel())?;

        let ports = AgentPorts::platform(&config)?;
        let protected = config.protected_paths(&config_path);
        let system = tokio::task::spawn_blocking(SystemInfo::gather).await?;
        info!(hostname = %system.hostname, fqdn = %system.fqdn, os = %system.os_name, "host identified");

        let mut agent = Agent::new(config, ports, system, protected);
        agent.run_until(shutdown).await?;
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    })?;

    info!("SIEM agent exited");
    Ok(())
}

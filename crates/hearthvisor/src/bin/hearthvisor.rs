use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hearthvisor::telemetry::{LogFormat, init_tracing};
use hearthvisor::{
    Orchestrator, OrchestratorConfig, PortAvailabilityChecker, PortProfile, default_data_dir,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// hearthvisor CLI application
#[derive(Parser)]
#[command(name = "hearthvisor")]
#[command(about = "Launches, health-checks and supervises local backend services")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all services and supervise them until Ctrl-C
    Run {
        /// Path to the JSON service configuration
        #[arg(short, long)]
        config: PathBuf,
        /// Port profile (default, qa, dev); falls back to HEARTHVISOR_PORT_PROFILE
        #[arg(short, long)]
        profile: Option<PortProfile>,
        /// Directory for the instance lock and generated secrets
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Only run the port pre-flight check
    CheckPorts {
        /// Path to the JSON service configuration
        #[arg(short, long)]
        config: PathBuf,
        /// Port profile (default, qa, dev); falls back to HEARTHVISOR_PORT_PROFILE
        #[arg(short, long)]
        profile: Option<PortProfile>,
    },
}

fn load_config(path: &Path, profile: Option<PortProfile>) -> Result<OrchestratorConfig> {
    let config = OrchestratorConfig::from_path(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    let profile = profile.unwrap_or_else(PortProfile::from_env);
    Ok(config.with_port_profile(profile)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Run {
            config,
            profile,
            data_dir,
        } => {
            let mut config = load_config(&config, profile)?;
            let data_dir = data_dir
                .or_else(|| config.data_dir.clone())
                .unwrap_or_else(default_data_dir);
            config.data_dir = Some(data_dir);

            let orchestrator = Orchestrator::start(config).await?;
            match orchestrator
                .wait_until_running(orchestrator.startup_timeout())
                .await
            {
                Ok(()) => info!("All services are running"),
                Err(e) => warn!("Not every service is running: {e}"),
            }

            let report = orchestrator.status_api().get_system_health_report();
            println!("{}", serde_json::to_string_pretty(&report)?);

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received");

            let report = orchestrator.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                anyhow::bail!("Shutdown finished with errors");
            }
        }
        Commands::CheckPorts { config, profile } => {
            let config = load_config(&config, profile)?;
            PortAvailabilityChecker::default().check_all(&config.services)?;
            println!("All {} required ports are available", config.services.len());
        }
    }

    Ok(())
}

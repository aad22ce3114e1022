//! Switchyard host - main entry point.
//!
//! Loads the host configuration, starts the supervisor and background
//! services, then serves worker connections until Ctrl-C or a fatal crash.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use switchyard::ipc::IpcServer;
use switchyard::kernel::{CommandLauncher, Host};
use switchyard::HostConfig;

#[derive(Parser, Debug)]
#[command(name = "switchyard-host")]
#[command(about = "Switchyard host - message router and process supervisor", long_about = None)]
struct Cli {
    /// JSON configuration file (defaults plus SWITCHYARD_* overrides when absent)
    #[arg(short, long, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address for worker connections (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    print_schema: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.print_schema {
        println!("{}", serde_json::to_string_pretty(&HostConfig::json_schema())?);
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => HostConfig::from_file(path)?,
        None => HostConfig::from_env()?,
    };
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    switchyard::observability::init_tracing_from(&config.observability);

    let launcher = Arc::new(CommandLauncher::new(
        config.launcher.clone(),
        config.server.listen_addr.clone(),
    ));
    let host = Host::new(config, launcher)?;
    let server = IpcServer::new(
        host.router().clone(),
        Arc::clone(host.supervisor()),
        host.config().server.clone(),
    );
    // Bound before any worker is launched.
    let listener = server.bind().await?;
    host.start().await?;
    let shutdown = host.shutdown_token();

    tracing::info!(addr = %host.config().server.listen_addr, "switchyard host starting");

    tokio::select! {
        result = server.serve_on(listener) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "ipc server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
        _ = shutdown.cancelled() => {
            tracing::error!("fatal shutdown requested");
        }
    }

    server.shutdown();
    host.shutdown().await;
    Ok(())
}

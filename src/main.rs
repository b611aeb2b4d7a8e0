use std::path::Path;

use clap::Parser;
use cli::{Command, TunnelbarCli};
use config::TunnelbarConfig;
use supervisor::{Selection, Supervisor};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tunneling::{
    manager::TunnelManager,
    ports::LoopbackProbe,
    process::SshLauncher,
    tunnel::TunnelError,
};

mod cli;
mod config;
mod diff;
mod supervisor;
mod tunneling;

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> Result<(), TunnelError> {
    let cli = TunnelbarCli::parse();
    setup_logging(cli.verbose);
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_path()?,
    };

    match cli.command.unwrap_or(Command::Up { servers: Vec::new() }) {
        Command::Up { servers } => up(&config_path, Selection::from_names(servers)).await,
        Command::Check => {
            let config = config::load_config(&config_path)?;
            println!(
                "{}: {} servers, {} tunnels",
                config_path.display(),
                config.servers.len(),
                config.tunnel_specs().count()
            );
            Ok(())
        }
        Command::List => {
            print_config(&config::load_config(&config_path)?);
            Ok(())
        }
        Command::Init => {
            if config::ensure_config(&config_path)? {
                println!("{} already exists", config_path.display());
            } else {
                println!("created {}", config_path.display());
            }
            Ok(())
        }
        Command::Edit => {
            config::ensure_config(&config_path)?;
            open_in_editor(&config_path).await
        }
    }
}

/// RUST_LOG wins over `--verbose`
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn up(config_path: &Path, selection: Selection) -> Result<(), TunnelError> {
    if !config::ensure_config(config_path)? {
        tracing::info!("edit {:?} to add your servers, tunnelbar reloads it automatically", config_path);
    }
    // a broken file must not keep the supervisor from starting, a fixed
    // version is picked up by the next reload
    let config = config::load_config(config_path).unwrap_or_else(|e| {
        tracing::error!("{}", e);
        TunnelbarConfig::default()
    });
    for name in selection.unknown(&config) {
        tracing::warn!("no server named `{}` in {:?}", name, config_path);
    }

    let launcher = SshLauncher::new(config.settings.ssh_path.clone());
    tracing::debug!("using ssh at {:?}", launcher.program());
    let manager = TunnelManager::new(Box::new(launcher), Box::new(LoopbackProbe::new()));
    let mut supervisor = Supervisor::new(config_path.to_path_buf(), config, manager, selection);

    let started = supervisor.start_selected().await;
    tracing::info!(started, "tunnels started");
    supervisor.run().await
}

fn print_config(config: &TunnelbarConfig) {
    for (i, server) in config.servers.iter().enumerate() {
        if i > 0 {
            println!();
        }
        println!("{} ({})", server.name, server.host);
        for spec in server.tunnel_specs() {
            println!("  {spec}");
        }
    }
}

/// $VISUAL, then $EDITOR, then whatever the desktop opens .toml files with
async fn open_in_editor(path: &Path) -> Result<(), TunnelError> {
    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| {
            if cfg!(target_os = "macos") {
                "open".to_string()
            } else {
                "xdg-open".to_string()
            }
        });
    let status = tokio::process::Command::new(&editor)
        .arg(path)
        .status()
        .await?;
    if !status.success() {
        tracing::warn!("{} exited with {}", editor, status);
    }
    Ok(())
}

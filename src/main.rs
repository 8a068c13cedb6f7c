//! Hearth - supervisor for a locally hosted AI stack
//!
//! This is the main CLI entry point for Hearth.

use clap::{Parser, Subcommand};
use hearth::config::SettingsLoader;
use hearth::error::Result;
use hearth::manifest::ServiceDescriptor;
use hearth::runtime::{LogOptions, LogStream};
use hearth::sequencer::StackSnapshot;
use hearth::supervisor::{Project, StackStatus, Supervisor, VolumeReport};
use hearth::HearthError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Hearth - supervisor for a locally hosted AI stack
#[derive(Parser)]
#[command(name = "hearth")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Dependency-ordered startup and tunnel supervision for a local AI stack", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Project directory (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    project_dir: Option<PathBuf>,

    /// Manifest file (defaults to hearth.yaml in the project directory)
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the stack in dependency order
    Start {
        /// Return once every service settled instead of supervising
        #[arg(short, long)]
        detach: bool,
        /// Do not run the tunnel
        #[arg(long)]
        no_tunnel: bool,
    },

    /// Stop the stack, dependents first
    Stop,

    /// Show per-service state
    #[command(alias = "ps")]
    Status {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a service's logs
    Logs {
        /// Service name
        service: String,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
        /// Number of lines to show
        #[arg(short = 'n', long)]
        tail: Option<usize>,
    },

    /// Restart one service
    Restart {
        /// Service name
        service: String,
    },

    /// Validate and print the resolved configuration
    Config,

    /// Run only the tunnel against a running stack
    Tunnel,

    /// Manage volumes
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// List volumes
    #[command(name = "ls")]
    List,
    /// Archive a volume
    Backup {
        /// Volume name
        volume: String,
        /// Archive file or directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Replace a volume's contents from an archive
    Restore {
        /// Volume name
        volume: String,
        /// Archive to restore
        archive: PathBuf,
    },
    /// Delete a volume's data
    Wipe {
        /// Volume name
        volume: String,
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --debug
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{}", e.report());
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let project = Project::load(
        &project_dir,
        cli.file.as_deref(),
        SettingsLoader::new(&project_dir),
    )?;

    if let Commands::Config = cli.command {
        return print_config(&project);
    }

    let supervisor = Supervisor::new(project)?;
    let cancel = shutdown_token();

    match cli.command {
        Commands::Start { detach, no_tunnel } => {
            if detach {
                let snapshot = supervisor.start(&cancel).await?;
                print_services(&supervisor, &snapshot);
                println!("Started project {}", supervisor.project().name);
            } else {
                supervisor.run_attached(&cancel, !no_tunnel).await?;
            }
        }

        Commands::Stop => {
            supervisor.stop().await?;
            println!("Stopped project {}", supervisor.project().name);
        }

        Commands::Status { json } => {
            let status = supervisor.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&supervisor, &status);
            }
        }

        Commands::Logs {
            service,
            follow,
            tail,
        } => {
            let mut lines = supervisor
                .logs(&service, LogOptions { follow, tail })
                .await?;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.recv() => match line {
                        Some(line) => match line.stream {
                            LogStream::Stdout => println!("{} | {}", service, line.line),
                            LogStream::Stderr => eprintln!("{} | {}", service, line.line),
                        },
                        None => break,
                    }
                }
            }
        }

        Commands::Restart { service } => {
            supervisor.restart(&service, &cancel).await?;
            println!("Restarted {}", service);
        }

        Commands::Tunnel => {
            supervisor.run_tunnel(&cancel).await?;
        }

        Commands::Volume { command } => match command {
            VolumeCommands::List => {
                print_volumes(&supervisor.volume_list()?);
            }
            VolumeCommands::Backup { volume, output } => {
                let archive = supervisor.volume_backup(&volume, &output).await?;
                println!("{}", archive.display());
            }
            VolumeCommands::Restore { volume, archive } => {
                supervisor.volume_restore(&volume, &archive).await?;
                println!("Restored volume {}", volume);
            }
            VolumeCommands::Wipe { volume, yes } => {
                if !yes {
                    return Err(HearthError::Volume(format!(
                        "refusing to wipe '{}' without --yes",
                        volume
                    )));
                }
                supervisor.volume_wipe(&volume).await?;
                println!("Wiped volume {}", volume);
            }
        },

        Commands::Config => {}
    }

    Ok(())
}

/// Cancelled on Ctrl-C or SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown requested");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[derive(Serialize)]
struct ResolvedConfig<'a> {
    project: &'a str,
    manifest: &'a Path,
    data_dir: &'a Path,
    start_order: &'a [String],
    services: Vec<&'a ServiceDescriptor>,
    routes: BTreeMap<&'a str, &'a str>,
    warnings: &'a [String],
}

fn print_config(project: &Project) -> Result<()> {
    let resolved = ResolvedConfig {
        project: &project.name,
        manifest: &project.manifest_path,
        data_dir: project.data_dir(),
        start_order: project.registry.start_order(),
        services: project
            .registry
            .start_order()
            .iter()
            .filter_map(|name| project.registry.get(name).ok())
            .collect(),
        routes: project
            .tunnel
            .iter()
            .flat_map(|t| t.routes.iter())
            .map(|(host, target)| (host, target.url.as_str()))
            .collect(),
        warnings: &project.warnings,
    };
    print!("{}", serde_yaml::to_string(&resolved)?);
    Ok(())
}

fn print_services(supervisor: &Supervisor, snapshot: &StackSnapshot) {
    println!("{:<16} {:<10} {:<20} DETAIL", "SERVICE", "STATE", "SINCE");
    for name in supervisor.project().registry.start_order() {
        if let Some(status) = snapshot.services.get(name) {
            println!(
                "{:<16} {:<10} {:<20} {}",
                name,
                status.state.to_string(),
                status.since.format("%Y-%m-%d %H:%M:%S"),
                status.last_error.as_deref().unwrap_or("")
            );
        }
    }
}

fn print_status(supervisor: &Supervisor, status: &StackStatus) {
    print_services(supervisor, &status.stack);
    if let Some(tunnel) = &status.tunnel {
        println!();
        println!(
            "tunnel: {} ({} routes, {} attempts)",
            tunnel.state,
            tunnel.routes.len(),
            tunnel.attempts
        );
        if let Some(error) = &tunnel.last_error {
            println!("last error: {}", error);
        }
    }
}

fn print_volumes(volumes: &[VolumeReport]) {
    println!("{:<20} {:<16} {:<10} MOUNTPOINT", "VOLUME NAME", "OWNER", "SIZE");
    for volume in volumes {
        println!(
            "{:<20} {:<16} {:<10} {}",
            volume.name,
            if volume.owner.is_empty() { "-" } else { volume.owner.as_str() },
            volume.size.map(format_size).unwrap_or_else(|| "-".to_string()),
            volume
                .mountpoint
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(not created)".to_string())
        );
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

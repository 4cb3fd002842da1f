// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use iris::config::{Config, TeamsConfig};
use iris::events::EventBus;
use iris::orchestrator::Orchestrator;
use iris::pool::ProcessPool;
use iris::session::SessionManager;
use iris::store::SessionStore;

#[derive(Parser)]
#[command(name = "iris", version, about = "Supervisor and router for interactive agent processes.")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the supervisor until interrupted (default).
    Serve,
    /// Send one message to a team and print the reply.
    Tell {
        team: String,
        message: Vec<String>,
        #[arg(long, default_value = "cli")]
        from: String,
        /// Dispatch without waiting for the reply.
        #[arg(long)]
        r#async: bool,
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },
    /// Spawn (or confirm) a team's agent process.
    Wake {
        team: Option<String>,
        #[arg(long)]
        all: bool,
        /// Spawn concurrently in --all mode (resource-unstable).
        #[arg(long)]
        parallel: bool,
        #[arg(long, default_value = "cli")]
        from: String,
    },
    /// Terminate a team's agent process.
    Sleep {
        team: String,
        #[arg(long)]
        force: bool,
        #[arg(long, default_value = "cli")]
        from: String,
    },
    /// Check whether a team's agent process is live.
    IsAwake {
        team: String,
        #[arg(long, default_value = "cli")]
        from: String,
    },
    /// Show the session row and cache report for a pair.
    Report {
        team: String,
        #[arg(long, default_value = "cli")]
        from: String,
    },
    /// List configured teams with live process state.
    Teams,
    /// Print the name this workspace reports for itself.
    GetTeamName,
    /// Spawn a detached interactive agent branched off the conversation.
    Fork {
        team: String,
        #[arg(long, default_value = "cli")]
        from: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }
    init_tracing(&cli.config);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let result = match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    if let Some(port) = cli.config.http_port {
        // The command builder resolves the MCP callback port through this
        // variable; the flag is just its CLI spelling.
        std::env::set_var(iris::transport::command::HTTP_PORT_ENV, port.to_string());
    }
    let teams = Arc::new(TeamsConfig::load(&cli.config.config)?);
    let store = SessionStore::open(&cli.config.db_path()?).await?;
    let sessions = Arc::new(SessionManager::new(store));
    // Boot: no persisted session claims a running process until the pool
    // actually spawns one.
    sessions.reset_runtime_state().await?;

    let events = EventBus::new();
    let shutdown = CancellationToken::new();
    let pool = ProcessPool::new(teams.clone(), events.clone(), shutdown.clone());
    let orchestrator =
        Orchestrator::new(teams, sessions, pool, events, shutdown.clone());

    let code = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            serve(&cli.config, &orchestrator, shutdown.clone()).await?;
            0
        }
        Commands::Tell { team, message, from, r#async, timeout_secs } => {
            let message = message.join(" ");
            let result = orchestrator
                .tell(&from, &team, &message, !r#async, Duration::from_secs(timeout_secs))
                .await;
            print_json(&result)?;
            exit_code(result.success)
        }
        Commands::Wake { team, all, parallel, from } => match (team, all) {
            (_, true) => {
                let result = orchestrator.wake_all(&from, parallel).await;
                print_json(&result)?;
                exit_code(result.success)
            }
            (Some(team), false) => {
                let result = orchestrator.wake(&team, &from).await;
                print_json(&result)?;
                exit_code(result.error.is_none())
            }
            (None, false) => {
                eprintln!("error: a team name (or --all) is required");
                2
            }
        },
        Commands::Sleep { team, force, from } => {
            let result = orchestrator.sleep(&team, &from, force).await;
            print_json(&result)?;
            exit_code(result.success)
        }
        Commands::IsAwake { team, from } => {
            let result = orchestrator.is_awake(&team, &from).await;
            print_json(&result)?;
            0
        }
        Commands::Report { team, from } => {
            let result = orchestrator.report(&from, &team).await;
            print_json(&result)?;
            exit_code(result.success)
        }
        Commands::Teams => {
            let result = orchestrator.teams().await;
            print_json(&result)?;
            0
        }
        Commands::GetTeamName => {
            match orchestrator.team_name() {
                Some(name) => println!("{name}"),
                None => println!("cli"),
            }
            0
        }
        Commands::Fork { team, from } => {
            let result = orchestrator.fork(&team, &from).await;
            print_json(&result)?;
            exit_code(result.success)
        }
    };

    // One-shot commands still drain whatever they spawned.
    shutdown.cancel();
    orchestrator.shutdown().await;
    Ok(code)
}

/// Run until the first SIGINT/SIGTERM, then drain gracefully; a second
/// signal forces exit.
async fn serve(
    config: &Config,
    orchestrator: &Orchestrator,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if config.wake_on_boot {
        let result = orchestrator.wake_all("cli", false).await;
        if !result.success {
            warn!("wake-on-boot left some teams down");
        }
    }
    info!("iris supervisor ready");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    shutdown.cancel();
    let drain = orchestrator.shutdown();
    tokio::pin!(drain);
    tokio::select! {
        _ = &mut drain => info!("pool drained"),
        _ = sigterm.recv() => {
            warn!("received SIGTERM again, forcing exit");
            std::process::exit(130);
        }
        _ = sigint.recv() => {
            warn!("received SIGINT again, forcing exit");
            std::process::exit(130);
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> i32 {
    if success {
        0
    } else {
        1
    }
}

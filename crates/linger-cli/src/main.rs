//! linger: keep processes running and re-attach to them later.
//!
//! A thin client over `linger-server`: creates named sessions, lists them,
//! attaches (replay then live output), kills and removes them. The server is
//! started in the background on first use.

mod commands;
mod config;
mod daemon;
mod terminal;

use clap::{Parser, Subcommand};
use linger_client::LingerClient;
use linger_core::StatePaths;
use std::path::PathBuf;
use tracing::error;

use commands::attach::AttachArgs;
use commands::create::CreateArgs;

/// linger: persistent, re-attachable process sessions
#[derive(Parser)]
#[command(name = "linger", version, about = "Persistent, re-attachable process sessions")]
struct Cli {
    /// Server URL [default: from config, else http://127.0.0.1:7681]
    #[arg(long, global = true)]
    server: Option<String>,

    /// Session group
    #[arg(short, long, global = true)]
    group: Option<String>,

    /// Config file path [default: <state dir>/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new named session
    Create {
        /// Session name
        name: String,

        /// Working directory [default: current directory]
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Spawn mode: pty or pipes
        #[arg(long, default_value = "pty")]
        mode: String,

        /// Command and arguments [default: $SHELL]
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// List sessions
    #[command(alias = "ls")]
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Replay a session's output and follow it
    Attach {
        /// Session name or id
        name: String,

        /// Replay only the last N lines
        #[arg(short = 'n', long)]
        lines: Option<usize>,

        /// Replay only lines containing this text
        #[arg(short, long)]
        search: Option<String>,

        /// Do not forward keystrokes
        #[arg(long)]
        read_only: bool,
    },

    /// Stop a session's process, keeping its history
    Kill {
        /// Session name or id
        name: String,
    },

    /// Stop (if needed) and forget a session
    Rm {
        /// Session name or id
        name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("linger=debug,linger_cli=debug,linger_client=debug,linger_core=debug")
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("linger=warn,linger_cli=warn")
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let paths = StatePaths::default_location();
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("linger: {e:#}");
            std::process::exit(1);
        }
    };

    let ctx = commands::Context {
        client: LingerClient::new(cli.server.unwrap_or(cfg.client.url)),
        paths,
        group: cli.group.unwrap_or(cfg.client.group),
        auto_start: cfg.client.auto_start,
    };

    let result = match cli.command {
        Command::Create {
            name,
            cwd,
            mode,
            command,
        } => {
            commands::create::run(
                &ctx,
                CreateArgs {
                    name: &name,
                    command,
                    cwd: cwd.as_deref(),
                    mode: &mode,
                },
            )
            .await
            .map(|()| 0)
        }
        Command::List { json } => commands::list::run(&ctx, json).await.map(|()| 0),
        Command::Attach {
            name,
            lines,
            search,
            read_only,
        } => {
            commands::attach::run(
                &ctx,
                AttachArgs {
                    name: &name,
                    lines,
                    search,
                    read_only,
                },
            )
            .await
            .map(commands::attach::exit_status)
        }
        Command::Kill { name } => commands::kill::run_kill(&ctx, &name).await.map(|()| 0),
        Command::Rm { name } => commands::kill::run_remove(&ctx, &name).await.map(|()| 0),
    };

    match result {
        Ok(0) => {}
        Ok(status) => std::process::exit(status),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("linger: {e:#}");
            std::process::exit(1);
        }
    }
}

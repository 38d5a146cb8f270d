//! `linger create NAME [-- command...]`: start a new session.

use anyhow::{bail, Context as _, Result};
use linger_core::messages::CreatePtyRequest;
use linger_core::SpawnMode;
use std::path::Path;
use tracing::info;

use super::Context;
use crate::terminal;

pub struct CreateArgs<'a> {
    pub name: &'a str,
    pub command: Vec<String>,
    pub cwd: Option<&'a Path>,
    pub mode: &'a str,
}

pub fn parse_mode(mode: &str) -> Result<SpawnMode> {
    match mode {
        "pty" => Ok(SpawnMode::Pty),
        "pipes" => Ok(SpawnMode::Pipes),
        other => bail!("unknown mode '{other}' (expected pty or pipes)"),
    }
}

/// Command to run when none is given: the user's shell.
fn default_command() -> Vec<String> {
    vec![std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "sh".to_string())]
}

pub async fn run(ctx: &Context, args: CreateArgs<'_>) -> Result<()> {
    let mode = parse_mode(args.mode)?;
    if args.name.trim().is_empty() {
        bail!("session name must not be empty");
    }
    let command = if args.command.is_empty() {
        default_command()
    } else {
        args.command
    };
    let cwd = match args.cwd {
        Some(dir) => Some(dir.to_path_buf()),
        None => std::env::current_dir().ok(),
    };

    ctx.ensure_server().await?;

    let (cols, rows) = terminal::get_terminal_size();
    let req = CreatePtyRequest {
        cmd: command,
        cwd: cwd.map(|p| p.to_string_lossy().into_owned()),
        env: None,
        cols: Some(cols),
        rows: Some(rows),
        name: Some(args.name.to_string()),
        mode: Some(mode),
    };
    let created = ctx
        .client
        .create(&ctx.group, &req)
        .await
        .with_context(|| format!("failed to create session '{}'", args.name))?;

    info!(session_id = %created.pty_id, pid = created.pid, "session created");
    println!(
        "created {} (id {}, pid {})",
        args.name, created.pty_id, created.pid
    );
    println!("log: {}", created.log_file_path.display());
    Ok(())
}

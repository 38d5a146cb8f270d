//! `linger kill NAME` and `linger rm NAME`.
//!
//! `kill` stops the process but keeps the entry and its log so the output
//! can still be replayed. `rm` also deletes the entry.

use anyhow::{Context as _, Result};
use tracing::info;

use super::Context;

pub async fn run_kill(ctx: &Context, name: &str) -> Result<()> {
    ctx.ensure_server().await?;
    let entry = ctx.resolve(name).await?;
    let killed = ctx
        .client
        .kill(&ctx.group, &entry.session.id)
        .await
        .with_context(|| format!("failed to kill '{name}'"))?;
    if killed {
        info!(session_id = %entry.session.id, "killed");
        println!("killed {name}");
    } else {
        println!("{name} is not running");
    }
    Ok(())
}

pub async fn run_remove(ctx: &Context, name: &str) -> Result<()> {
    ctx.ensure_server().await?;
    let entry = ctx.resolve(name).await?;
    ctx.client
        .remove(&ctx.group, &entry.session.id)
        .await
        .with_context(|| format!("failed to remove '{name}'"))?;
    info!(session_id = %entry.session.id, "removed");
    println!("removed {name}");
    Ok(())
}

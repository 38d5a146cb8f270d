//! Starting `linger-server` on demand.
//!
//! The server is launched detached (own process group, no controlling
//! stdio) so it outlives the CLI invocation that started it. Its stderr goes
//! to `server.log` in the state directory.

use anyhow::{bail, Context, Result};
use linger_client::LingerClient;
use linger_core::StatePaths;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Make sure a server answers at the client's URL, starting one if allowed.
pub async fn ensure_server(client: &LingerClient, paths: &StatePaths, auto_start: bool) -> Result<()> {
    if client.health().await.is_ok() {
        return Ok(());
    }
    if !auto_start {
        bail!(
            "linger server not reachable at {} (auto_start is disabled)",
            client.base_url()
        );
    }

    let (host, port) = client
        .server_addr()
        .with_context(|| format!("cannot derive a listen address from {}", client.base_url()))?;
    spawn_server(&host, port, paths)?;

    let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
        if client.health().await.is_ok() {
            info!(url = %client.base_url(), "server started");
            return Ok(());
        }
    }
    bail!(
        "linger server did not come up at {}; see {}",
        client.base_url(),
        server_log(paths).display()
    )
}

/// Whether a server answers, without starting one.
pub async fn is_running(client: &LingerClient) -> bool {
    client.health().await.is_ok()
}

fn server_log(paths: &StatePaths) -> PathBuf {
    paths.root().join("server.log")
}

/// The server binary next to this executable, else whatever is on `PATH`.
fn server_binary() -> PathBuf {
    let name = format!("linger-server{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(&name))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

fn spawn_server(host: &str, port: u16, paths: &StatePaths) -> Result<()> {
    std::fs::create_dir_all(paths.root())
        .with_context(|| format!("failed to create {}", paths.root().display()))?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(server_log(paths))
        .context("failed to open server log")?;

    let binary = server_binary();
    debug!(binary = %binary.display(), host, port, "starting server");

    let mut cmd = Command::new(&binary);
    cmd.arg("--host")
        .arg(host)
        .arg("--port")
        .arg(port.to_string())
        .arg("--state-dir")
        .arg(paths.root())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd.spawn()
        .with_context(|| format!("failed to start {}", binary.display()))?;
    Ok(())
}

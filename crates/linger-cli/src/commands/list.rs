//! `linger list`: show sessions of the current group.
//!
//! Asks the server when one is running; otherwise reads the registry file
//! directly and probes liveness locally.

use anyhow::{Context as _, Result};
use linger_core::{now_ms, LivenessProbe, Registry, SessionEntry, SystemProbe};

use super::Context;
use crate::daemon;

pub async fn run(ctx: &Context, json: bool) -> Result<()> {
    let entries = if daemon::is_running(&ctx.client).await {
        ctx.client
            .list(&ctx.group)
            .await
            .context("failed to list sessions")?
    } else {
        list_local(ctx, &SystemProbe).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        print!("{}", render_table(&entries, now_ms()));
    }
    Ok(())
}

async fn list_local(ctx: &Context, probe: &dyn LivenessProbe) -> Result<Vec<SessionEntry>> {
    let registry = Registry::open(ctx.paths.registry_file());
    let sessions = registry
        .load()
        .await
        .with_context(|| format!("failed to read {}", registry.path().display()))?;
    Ok(sessions
        .into_iter()
        .filter(|s| s.group == ctx.group)
        .map(|session| {
            let alive = session.status == linger_core::SessionStatus::Running
                && probe.is_alive(session.pid, &session.command);
            SessionEntry { session, alive }
        })
        .collect())
}

fn render_table(entries: &[SessionEntry], now: u64) -> String {
    if entries.is_empty() {
        return "no sessions\n".to_string();
    }
    let mut rows = vec![[
        "NAME".to_string(),
        "ID".to_string(),
        "PID".to_string(),
        "STATUS".to_string(),
        "IDLE".to_string(),
        "COMMAND".to_string(),
    ]];
    for entry in entries {
        let s = &entry.session;
        let status = match (entry.alive, s.exit_code) {
            (true, _) => "running".to_string(),
            (false, Some(code)) => format!("{} ({code})", s.status),
            (false, None) if s.status == linger_core::SessionStatus::Running => "dead".to_string(),
            (false, None) => s.status.to_string(),
        };
        rows.push([
            s.name.clone(),
            s.id.clone(),
            s.pid.to_string(),
            status,
            format_idle(s.idle_ms(now)),
            s.command_line(),
        ]);
    }

    let mut widths = [0usize; 6];
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let mut out = String::new();
    for row in &rows {
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            if i + 1 == row.len() {
                line.push_str(cell);
            } else {
                line.push_str(&format!("{cell:<width$}  ", width = widths[i]));
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn format_idle(ms: u64) -> String {
    let secs = ms / 1000;
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linger_client::LingerClient;
    use linger_core::{Session, SessionStatus, SpawnMode, StatePaths};
    use tempfile::TempDir;

    struct DeadProbe;

    impl LivenessProbe for DeadProbe {
        fn is_alive(&self, _pid: u32, _command: &[String]) -> bool {
            false
        }
    }

    fn session(id: &str, name: &str, group: &str) -> Session {
        Session {
            id: id.into(),
            name: name.into(),
            group: group.into(),
            pid: 4242,
            command: vec!["echo".into(), "hello".into()],
            log_file_path: format!("/tmp/{name}.log").into(),
            created_at: 1_000,
            last_activity: 1_000,
            status: SessionStatus::Running,
            exit_code: None,
            cols: 80,
            rows: 24,
            mode: SpawnMode::Pty,
        }
    }

    #[test]
    fn idle_formatting() {
        assert_eq!(format_idle(5_000), "5s");
        assert_eq!(format_idle(120_000), "2m");
        assert_eq!(format_idle(7_200_000), "2h");
        assert_eq!(format_idle(172_800_000), "2d");
    }

    #[test]
    fn table_layout() {
        let mut exited = session("b2", "build", "default");
        exited.status = SessionStatus::Exited;
        exited.exit_code = Some(0);
        let entries = vec![
            SessionEntry {
                session: session("a1", "shell", "default"),
                alive: true,
            },
            SessionEntry {
                session: exited,
                alive: false,
            },
        ];
        let table = render_table(&entries, 61_000);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("NAME"));
        assert!(lines[1].contains("running") && lines[1].contains("1m"));
        assert!(lines[2].contains("exited (0)"));
        assert!(lines[2].ends_with("echo hello"));
        assert_eq!(render_table(&[], 0), "no sessions\n");
    }

    #[tokio::test]
    async fn local_listing_filters_group_and_probes() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        let registry = Registry::open(paths.registry_file());
        registry.append(session("a1", "shell", "default")).await.unwrap();
        registry.append(session("c1", "other", "elsewhere")).await.unwrap();

        let ctx = Context {
            client: LingerClient::new("http://127.0.0.1:9"),
            paths,
            group: "default".into(),
            auto_start: false,
        };
        let entries = list_local(&ctx, &DeadProbe).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session.name, "shell");
        assert!(!entries[0].alive);
    }
}

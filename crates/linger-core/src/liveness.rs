//! Is a recorded pid still the process we started?
//!
//! A registry entry can outlive its process, and pids get recycled, so the
//! probe checks both that the pid exists and that its command line still
//! matches the one recorded at spawn time. Zombies count as dead.

use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Platform check used by the registry to derive liveness at read time.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32, command: &[String]) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl LivenessProbe for SystemProbe {
    fn is_alive(&self, pid: u32, command: &[String]) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        if !pid_exists(pid) {
            return false;
        }
        match proc_state(pid) {
            Some(ProcInfo { zombie: true, .. }) => {
                debug!(pid, "process is a zombie");
                false
            }
            Some(ProcInfo { cmdline, .. }) => {
                let matches = command_matches(&cmdline, command);
                if !matches {
                    debug!(pid, ?cmdline, ?command, "pid reused by another command");
                }
                matches
            }
            // No procfs: existence is the best we can do.
            None => true,
        }
    }
}

#[cfg(unix)]
fn pid_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_exists(_pid: u32) -> bool {
    false
}

struct ProcInfo {
    zombie: bool,
    cmdline: Vec<String>,
}

fn proc_state(pid: u32) -> Option<ProcInfo> {
    let base = Path::new("/proc").join(pid.to_string());
    let stat = std::fs::read_to_string(base.join("stat")).ok()?;
    // The state field follows the parenthesised command name.
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next());
    let raw = std::fs::read(base.join("cmdline")).unwrap_or_default();
    let cmdline = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    Some(ProcInfo {
        zombie: state == Some('Z'),
        cmdline,
    })
}

/// Compare a live command line against the recorded argv by program name.
///
/// Only the program's file name is compared: login shells prefix `-`, and
/// interpreters rewrite argv[0] to an absolute path.
pub fn command_matches(cmdline: &[String], command: &[String]) -> bool {
    let Some(expected) = command.first().map(|c| program_name(c)) else {
        return true;
    };
    if cmdline.is_empty() {
        // Kernel threads and processes that cleared their argv.
        return false;
    }
    cmdline
        .iter()
        .take(2)
        .any(|arg| program_name(arg) == expected)
}

fn program_name(arg: &str) -> &str {
    let arg = arg.trim_start_matches('-');
    arg.rsplit('/').next().unwrap_or(arg)
}

/// Ask a process to terminate, escalate to a hard kill after `timeout`.
///
/// Returns `true` if the process is gone afterwards. Used for sessions that
/// no running supervisor owns.
#[cfg(unix)]
pub async fn terminate_pid(
    probe: &dyn LivenessProbe,
    pid: u32,
    command: &[String],
    timeout: Duration,
) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if !probe.is_alive(pid, command) {
        return true;
    }
    let target = Pid::from_raw(pid as i32);
    let _ = kill(target, Signal::SIGHUP);
    let _ = kill(target, Signal::SIGTERM);
    if wait_dead(probe, pid, command, timeout).await {
        return true;
    }
    debug!(pid, "process ignored SIGTERM, sending SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
    wait_dead(probe, pid, command, Duration::from_secs(1)).await
}

#[cfg(not(unix))]
pub async fn terminate_pid(
    probe: &dyn LivenessProbe,
    pid: u32,
    command: &[String],
    _timeout: Duration,
) -> bool {
    !probe.is_alive(pid, command)
}

async fn wait_dead(probe: &dyn LivenessProbe, pid: u32, command: &[String], timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !probe.is_alive(pid, command) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn matches_by_program_name() {
        assert!(command_matches(&argv(&["/bin/sleep", "10"]), &argv(&["sleep", "10"])));
        assert!(command_matches(&argv(&["-bash"]), &argv(&["bash"])));
        assert!(command_matches(
            &argv(&["/usr/bin/python3", "/opt/agent.py"]),
            &argv(&["/opt/agent.py"])
        ));
        assert!(!command_matches(&argv(&["nginx"]), &argv(&["sleep", "10"])));
        assert!(!command_matches(&[], &argv(&["sleep"])));
    }

    #[test]
    fn current_process_is_alive() {
        let pid = std::process::id();
        let cmdline: Vec<String> = std::env::args().collect();
        assert!(SystemProbe.is_alive(pid, &cmdline));
    }

    #[test]
    fn invalid_pids_are_dead() {
        assert!(!SystemProbe.is_alive(0, &argv(&["sh"])));
        assert!(!SystemProbe.is_alive(u32::MAX, &argv(&["sh"])));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reused_pid_with_other_command_is_dead() {
        let pid = std::process::id();
        assert!(!SystemProbe.is_alive(pid, &argv(&["definitely-not-this-binary"])));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_reaped_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let command = argv(&["sleep", "30"]);
        assert!(SystemProbe.is_alive(pid, &command));

        let waiter = tokio::spawn(async move { child.wait().await });
        assert!(terminate_pid(&SystemProbe, pid, &command, Duration::from_secs(2)).await);
        assert!(waiter.await.unwrap().is_ok());
    }
}

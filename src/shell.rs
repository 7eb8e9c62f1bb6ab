use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

static LOGIN_PATH: OnceLock<Option<String>> = OnceLock::new();

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_MARKER: &str = "AGENT_TERMINALS_PATH:";

/// Program used for ad-hoc shells when the config does not name one.
pub fn default_shell(configured: Option<&str>) -> String {
    if let Some(shell) = configured.filter(|s| !s.trim().is_empty()) {
        return shell.to_string();
    }
    if cfg!(windows) {
        return std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
    }
    match std::env::var("SHELL") {
        Ok(shell) if !shell.is_empty() => shell,
        _ if cfg!(target_os = "macos") => "/bin/zsh".to_string(),
        _ => "/bin/bash".to_string(),
    }
}

/// The user's login `PATH`, probed once per process.
///
/// Desktop launchers start the app with a minimal `PATH`, so agent CLIs
/// installed under the home directory would not resolve inside the PTY.
pub fn login_path() -> Option<&'static str> {
    LOGIN_PATH
        .get_or_init(|| {
            if cfg!(windows) {
                return None;
            }
            let shell = default_shell(None);
            let found: Vec<String> = [probe_login_shell(&shell), probe_rc_file(&shell)]
                .into_iter()
                .flatten()
                .collect();
            if found.is_empty() {
                warn!(shell = %shell, "No usable login PATH, keeping inherited PATH");
                return None;
            }
            let merged = merge_paths(&found);
            info!(path = %merged, "Resolved login PATH");
            Some(merged)
        })
        .as_deref()
}

/// `-lc` rather than `-lic`: interactive mode needs a TTY and prompt
/// plugins can hang without one.
fn probe_login_shell(shell: &str) -> Option<String> {
    let script = format!(r#"printf "{PROBE_MARKER}%s\n" "$PATH""#);
    let stdout = run_with_timeout(shell, &["-lc", &script])?;
    extract_path(&stdout)
}

fn probe_rc_file(shell: &str) -> Option<String> {
    let rc = match shell.rsplit('/').next().unwrap_or("") {
        "zsh" => "~/.zshrc",
        "bash" => "~/.bashrc",
        _ => return None,
    };
    let script =
        format!(r#"[ -f {rc} ] && . {rc} 2>/dev/null; printf "{PROBE_MARKER}%s\n" "$PATH""#);
    let stdout = run_with_timeout(shell, &["-c", &script])?;
    extract_path(&stdout)
}

fn extract_path(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(PROBE_MARKER))
        .filter(|p| !p.is_empty() && !is_minimal_path(p))
        .map(str::to_string)
}

fn run_with_timeout(program: &str, args: &[&str]) -> Option<String> {
    let mut child = std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| warn!(program = %program, err = %e, "Failed to spawn PATH probe"))
        .ok()?;

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) if start.elapsed() > PROBE_TIMEOUT => {
                warn!(program = %program, "PATH probe timed out");
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                warn!(program = %program, err = %e, "PATH probe wait failed");
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }

    let output = child.wait_with_output().ok()?;
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Only system directories, nothing a user installed.
fn is_minimal_path(path: &str) -> bool {
    let entries: Vec<&str> = path.split(':').collect();
    entries.len() <= 4
        && entries
            .iter()
            .all(|e| matches!(*e, "/usr/bin" | "/bin" | "/usr/sbin" | "/sbin"))
}

/// Joins PATH strings, keeping the first occurrence of each entry.
fn merge_paths(paths: &[String]) -> String {
    let mut seen = std::collections::HashSet::new();
    paths
        .iter()
        .flat_map(|p| p.split(':'))
        .filter(|entry| !entry.is_empty() && seen.insert(*entry))
        .collect::<Vec<_>>()
        .join(":")
}

use log::{debug, warn};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Check whether a program can be launched: explicit paths must point at a
/// file, bare names are looked up with `which`.
pub fn program_exists(program: &Path) -> bool {
    if program.components().count() > 1 {
        return program.is_file();
    }
    std::process::Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Run a one-shot command and return its stdout. Spawn failure, non-zero exit
/// and timeout are reported as an error message; the child is killed if the
/// deadline passes.
pub async fn run_with_timeout(program: &Path, args: &[String], timeout: Duration) -> Result<String, String> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", program.display(), e))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("{} failed: {}", program.display(), e)),
        Err(_) => return Err(format!("{} timed out after {:?}", program.display(), timeout)),
    };

    if !output.status.success() {
        return Err(format!("{} exited with {}", program.display(), output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Ask the child to exit with SIGTERM, wait up to `grace`, then kill it.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("Child already exited with {}", status);
        return;
    }

    send_sigterm(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Child exited with {} after SIGTERM", status),
        Ok(Err(e)) => warn!("Failed waiting for child: {}", e),
        Err(_) => {
            warn!("Child still alive {:?} after SIGTERM, killing it", grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill child: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` belongs to a child we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!("SIGTERM to pid {} failed: {}", pid, std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

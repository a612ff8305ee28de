use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_line;

/// Captured outcome of one child process. Every transport goes through this
/// shape so the executor never touches `std::process` directly.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Short human-readable failure text: stderr first, stdout next,
    /// exit code as a last resort.
    pub fn summary(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit code {}", self.exit_code)
    }
}

/// Run to completion with all output captured. No console interleaving.
pub fn output(cmd: &mut Command) -> Result<CmdOutput> {
    let out = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::msg(format!("failed to run command {:?}: {e}", cmd)))?;
    Ok(CmdOutput {
        exit_code: out.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

/// Run with line-buffered capture. Each sanitized output line is handed to
/// `on_line`; a set cancel flag kills the whole child process group.
/// Returns the exit code (spawn/wait problems are the only hard errors).
pub fn run_streaming(
    mut cmd: Command,
    cancel: &Arc<AtomicBool>,
    mut on_line: impl FnMut(&str),
) -> Result<i32> {
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::msg("cancelled"));
    }

    // Own process group so cancellation can take the whole subtree down.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        // Detached stdin: a transport reading from the controlling TTY would
        // suspend on SIGTTIN after the setpgid above.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("spawn failed: {e}")))?;
    let pgid = child.id();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (tx, rx) = mpsc::channel::<String>();
    if let Some(out) = stdout {
        let tx = tx.clone();
        std::thread::spawn(move || read_lines(out, tx));
    }
    if let Some(err) = stderr {
        let tx = tx.clone();
        std::thread::spawn(move || read_lines(err, tx));
    }
    drop(tx);

    let mut killed = false;
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(line) => {
                let line = sanitize_line(&line);
                if !line.is_empty() {
                    on_line(&line);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if !killed && cancel.load(Ordering::Relaxed) {
            kill_pgroup(pgid, false);
            kill_pgroup(pgid, true);
            killed = true;
        }
    }

    let status = child
        .wait()
        .map_err(|e| Error::msg(format!("wait failed: {e}")))?;
    if killed {
        return Err(Error::msg("cancelled"));
    }
    Ok(status.code().unwrap_or(-1))
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

fn read_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                let _ = tx.send(line);
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    let _ = tx.send(line);
                }
            }
        }
    }

    if !pending.is_empty() {
        let line = String::from_utf8_lossy(&pending).into_owned();
        let _ = tx.send(line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let out = output(&mut cmd).unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.summary(), "err");
    }

    #[test]
    fn streaming_collects_lines_in_order_per_stream() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'a\\nb\\n'");
        let cancel = Arc::new(AtomicBool::new(false));
        let mut lines = Vec::new();
        let code = run_streaming(cmd, &cancel, |l| lines.push(l.to_string())).unwrap();
        assert_eq!(code, 0);
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn pre_set_cancel_refuses_to_spawn() {
        let cancel = Arc::new(AtomicBool::new(true));
        let err = run_streaming(Command::new("true"), &cancel, |_| {}).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}

use std::collections::VecDeque;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::manifest::ResourceDescriptor;
use crate::process;
use crate::report::{FetchResult, FetchStatus, Reporter};
use crate::transport::{TransportPlan, USER_AGENT};

/// Per-run state threaded through every component call; replaces any notion
/// of global counters or process-wide environment toggling.
#[derive(Clone)]
pub struct RunContext {
    pub dry_run: bool,
    pub retry_bound: u32,
    pub cancel: Arc<AtomicBool>,
    pub reporter: Arc<Reporter>,
}

impl RunContext {
    pub fn new(dry_run: bool, retry_bound: u32, reporter: Arc<Reporter>) -> Self {
        Self {
            dry_run,
            retry_bound,
            cancel: Arc::new(AtomicBool::new(false)),
            reporter,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

const TAIL_LINES: usize = 40;

struct OutputTail {
    lines: VecDeque<String>,
}

impl OutputTail {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(TAIL_LINES),
        }
    }

    fn push(&mut self, line: &str) {
        while self.lines.len() >= TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Perform the fetch the prober already decided must happen. Transient
/// transport failures retry up to `retry_bound` with no backoff; a persisting
/// failure becomes a recorded result, never a propagated error.
pub fn execute(desc: &ResourceDescriptor, plan: &TransportPlan, ctx: &RunContext) -> FetchResult {
    let start = Instant::now();
    let max_attempts = 1 + ctx.retry_bound;
    let mut tail = OutputTail::new();
    let mut last_err = String::new();

    for attempt in 1..=max_attempts {
        match run_transport(plan, ctx, &mut tail) {
            Ok(()) => {
                return FetchResult {
                    name: desc.name.clone(),
                    kind: desc.kind().as_str(),
                    status: FetchStatus::Succeeded,
                    attempts: attempt,
                    error_detail: None,
                    duration_ms: start.elapsed().as_millis(),
                    note: None,
                };
            }
            Err(e) => {
                last_err = e.to_string();
                if ctx.cancelled() || attempt == max_attempts {
                    let captured = tail.render();
                    let detail = if captured.is_empty() {
                        last_err.clone()
                    } else {
                        format!("{last_err}\n{captured}")
                    };
                    return FetchResult {
                        name: desc.name.clone(),
                        kind: desc.kind().as_str(),
                        status: FetchStatus::Failed,
                        attempts: attempt,
                        error_detail: Some(detail),
                        duration_ms: start.elapsed().as_millis(),
                        note: None,
                    };
                }
            }
        }
    }

    // Loop always returns; retry_bound >= 0 guarantees one attempt.
    FetchResult {
        name: desc.name.clone(),
        kind: desc.kind().as_str(),
        status: FetchStatus::Failed,
        attempts: max_attempts,
        error_detail: Some(last_err),
        duration_ms: start.elapsed().as_millis(),
        note: None,
    }
}

fn run_transport(plan: &TransportPlan, ctx: &RunContext, tail: &mut OutputTail) -> Result<()> {
    match plan {
        TransportPlan::Aria2 {
            bin,
            url,
            dest,
            connections,
            chunk,
        } => {
            ensure_parent(dest)?;
            let dir = dest
                .parent()
                .ok_or_else(|| Error::msg(format!("no parent for {}", dest.display())))?;
            let file = dest
                .file_name()
                .ok_or_else(|| Error::msg(format!("no file name in {}", dest.display())))?;
            let mut cmd = Command::new(bin);
            cmd.arg(format!("-x{connections}"))
                .arg(format!("-s{connections}"))
                .arg(format!("-k{chunk}"))
                .arg("--auto-file-renaming=false")
                .arg("--allow-overwrite=true")
                .arg(format!("--user-agent={USER_AGENT}"))
                .arg("-d")
                .arg(dir)
                .arg("-o")
                .arg(file)
                .arg(url);
            run_checked(cmd, ctx, tail)
        }
        TransportPlan::Http { url, dest } => {
            ensure_parent(dest)?;
            http_download(url, dest, &ctx.cancel)
        }
        TransportPlan::GitClone {
            git,
            url,
            dest,
            commit,
        } => {
            ensure_parent(dest)?;
            let mut clone = Command::new(git);
            clone.arg("clone").arg(url).arg(dest);
            run_checked(clone, ctx, tail)?;
            if let Some(commit) = commit.as_deref().filter(|c| !c.is_empty()) {
                let mut checkout = Command::new(git);
                checkout.arg("-C").arg(dest).arg("checkout").arg(commit);
                run_checked(checkout, ctx, tail)?;
            }
            Ok(())
        }
        TransportPlan::Pip { pip, args, env } => {
            let mut cmd = Command::new(pip);
            cmd.args(args);
            // Build-flag overlay lives on the child only; the engine's own
            // environment is never touched.
            for (k, v) in env {
                cmd.env(k, v);
            }
            run_checked(cmd, ctx, tail)
        }
        TransportPlan::Install { argv } => {
            let (bin, rest) = argv
                .split_first()
                .ok_or_else(|| Error::msg("empty install command"))?;
            let mut cmd = Command::new(bin);
            cmd.args(rest);
            run_checked(cmd, ctx, tail)
        }
    }
}

fn run_checked(cmd: Command, ctx: &RunContext, tail: &mut OutputTail) -> Result<()> {
    let code = process::run_streaming(cmd, &ctx.cancel, |line| tail.push(line))?;
    if code != 0 {
        return Err(Error::msg(format!("transport exited with code {code}")));
    }
    Ok(())
}

fn ensure_parent(p: &Path) -> Result<()> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    Ok(())
}

const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Single-stream download with the same spoofed user-agent as the aria2
/// transport. A cancelled copy leaves the partial file in place; the prober's
/// size/checksum check reclassifies it as Absent on the next run.
fn http_download(url: &str, dest: &Path, cancel: &Arc<AtomicBool>) -> Result<()> {
    http_download_with(url, dest, cancel, HTTP_READ_TIMEOUT)
}

fn http_download_with(
    url: &str,
    dest: &Path,
    cancel: &Arc<AtomicBool>,
    read_timeout: Duration,
) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        return Err(Error::msg("cancelled"));
    }
    // No total timeout (large model downloads run for hours); the per-read
    // timeout bounds how long a stalled server can keep the copy loop away
    // from its cancel check.
    let client = reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(30))
        .timeout(None)
        .read_timeout(read_timeout)
        .build()
        .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
    let mut res = client
        .get(url)
        .send()
        .map_err(|e| Error::msg(format!("HTTP request failed: {e}")))?;
    if !res.status().is_success() {
        return Err(Error::msg(format!(
            "HTTP download failed with status {}",
            res.status()
        )));
    }

    let mut file = fs::File::create(dest)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::msg("cancelled"));
        }
        let n = res
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("HTTP body read failed: {e}")))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", dest.display())))?;
    }
    Ok(())
}

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStatus {
    /// Already present in an acceptable state; nothing was done.
    Skipped,
    Succeeded,
    Failed,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Skipped => "skipped",
            FetchStatus::Succeeded => "succeeded",
            FetchStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub name: String,
    pub kind: &'static str,
    pub status: FetchStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub ok: bool,
    pub results: Vec<FetchResult>,
}

impl RunReport {
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut skipped = 0;
        let mut succeeded = 0;
        let mut failed = 0;
        for r in &self.results {
            match r.status {
                FetchStatus::Skipped => skipped += 1,
                FetchStatus::Succeeded => succeeded += 1,
                FetchStatus::Failed => failed += 1,
            }
        }
        (skipped, succeeded, failed)
    }
}

struct ReporterState {
    report: RunReport,
    log: Option<fs::File>,
    finalized: bool,
}

/// Aggregates per-resource outcomes and mirrors formatted lines to console
/// and the persisted run log. Presentation only: nothing queries the
/// reporter for decisions.
pub struct Reporter {
    state: Mutex<ReporterState>,
    log_path: PathBuf,
    json_path: PathBuf,
}

impl Reporter {
    pub fn create(log_dir: &std::path::Path) -> Result<Self> {
        fs::create_dir_all(log_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", log_dir.display())))?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let log_path = log_dir.join(format!("provision-{stamp}.log"));
        let json_path = log_dir.join(format!("provision-{stamp}.json"));
        let log = fs::File::create(&log_path)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", log_path.display())))?;
        Ok(Self {
            state: Mutex::new(ReporterState {
                report: RunReport {
                    started_at: chrono::Local::now().to_rfc3339(),
                    finished_at: None,
                    ok: true,
                    results: Vec::new(),
                },
                log: Some(log),
                finalized: false,
            }),
            log_path,
            json_path,
        })
    }

    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    pub fn json_path(&self) -> &std::path::Path {
        &self.json_path
    }

    /// Mirror one timestamped line to console and log file.
    pub fn line(&self, text: &str) {
        let stamped = format!("[{}] {text}", chrono::Local::now().format("%H:%M:%S"));
        println!("{stamped}");
        if let Ok(mut s) = self.state.lock() {
            if let Some(log) = s.log.as_mut() {
                let _ = writeln!(log, "{stamped}");
            }
        }
    }

    pub fn record(&self, result: FetchResult) {
        let line = match result.status {
            FetchStatus::Skipped => match &result.note {
                Some(note) => format!("SKIP: {} ({note})", result.name),
                None => format!("SKIP: {}", result.name),
            },
            FetchStatus::Succeeded => format!(
                "OK: {} ({:.1}s)",
                result.name,
                result.duration_ms as f64 / 1000.0
            ),
            FetchStatus::Failed => format!(
                "FAIL: {} ({} attempts): {}",
                result.name,
                result.attempts,
                result
                    .error_detail
                    .as_deref()
                    .and_then(|d| d.lines().last())
                    .unwrap_or("unknown error")
            ),
        };
        self.line(&line);
        if let Ok(mut s) = self.state.lock() {
            if result.status == FetchStatus::Failed {
                s.report.ok = false;
            }
            s.report.results.push(result);
        }
    }

    /// Close out the run: summary line, JSON persistence, final report.
    /// Idempotent so a cancellation path and the normal exit can both call it.
    pub fn finalize(&self) -> Result<RunReport> {
        let report = {
            let Ok(mut s) = self.state.lock() else {
                return Err(Error::msg("reporter state poisoned"));
            };
            if s.finalized {
                return Ok(s.report.clone());
            }
            s.finalized = true;
            s.report.finished_at = Some(chrono::Local::now().to_rfc3339());
            s.report.clone()
        };

        let (skipped, succeeded, failed) = report.counts();
        self.line(&format!(
            "SUMMARY: {failed} failed / {} total ({skipped} skipped, {succeeded} succeeded)",
            report.results.len()
        ));

        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| Error::msg(format!("report encode error: {e}")))?;
        fs::write(&self.json_path, json).map_err(|e| {
            Error::msg(format!(
                "failed to write report {}: {e}",
                self.json_path.display()
            ))
        })?;

        if let Ok(mut s) = self.state.lock() {
            s.report.finished_at = report.finished_at.clone();
            s.log = None;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, status: FetchStatus) -> FetchResult {
        FetchResult {
            name: name.into(),
            kind: "data-file",
            status,
            attempts: 1,
            error_detail: (status == FetchStatus::Failed).then(|| "boom".into()),
            duration_ms: 10,
            note: None,
        }
    }

    #[test]
    fn summary_line_counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::create(dir.path()).unwrap();
        reporter.record(result("a", FetchStatus::Skipped));
        reporter.record(result("b", FetchStatus::Failed));
        reporter.record(result("c", FetchStatus::Succeeded));
        let report = reporter.finalize().unwrap();
        assert!(!report.ok);
        assert_eq!(report.counts(), (1, 1, 1));

        let log = fs::read_to_string(reporter.log_path()).unwrap();
        assert!(log.contains("1 failed / 3 total"), "log:\n{log}");
        assert!(log.contains("SKIP: a"));
        assert!(log.contains("FAIL: b"));
        assert!(log.contains("OK: c"));

        let json = fs::read_to_string(reporter.json_path()).unwrap();
        assert!(json.contains("\"status\": \"failed\""));
    }

    #[test]
    fn finalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = Reporter::create(dir.path()).unwrap();
        reporter.record(result("a", FetchStatus::Succeeded));
        let first = reporter.finalize().unwrap();
        let second = reporter.finalize().unwrap();
        assert_eq!(first.results.len(), second.results.len());
        let log = fs::read_to_string(reporter.log_path()).unwrap();
        assert_eq!(log.matches("SUMMARY:").count(), 1);
    }
}

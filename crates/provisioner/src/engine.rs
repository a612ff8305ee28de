use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::executor::{RunContext, execute};
use crate::manifest::{Manifest, ResourceDescriptor, ResourceKind, ResourceSource, Settings};
use crate::probe::{PresenceState, probe, reinstall_on_mismatch};
use crate::report::{FetchResult, FetchStatus, RunReport};
use crate::resolve::{FinalizeResult, finalize};
use crate::transport::{Environment, select};

/// Process a manifest in order: probe, select, execute, finalize, record.
/// Adjacent data-file descriptors may run through a bounded worker pool;
/// tool and python-package descriptors stay strictly sequential because they
/// mutate shared state (PATH visibility, one virtual environment).
pub fn run(manifest: &Manifest, env: &mut Environment, ctx: &RunContext) -> Result<RunReport> {
    let settings = &manifest.settings;
    let workers = effective_parallelism(settings);
    let resources = &manifest.resources;

    let mut i = 0;
    while i < resources.len() {
        if ctx.cancelled() {
            ctx.reporter.line("CANCELLED: stopping before remaining resources");
            break;
        }

        let desc = &resources[i];
        let parallelizable =
            desc.kind() == ResourceKind::DataFile && workers > 1 && !ctx.dry_run;
        if parallelizable {
            let mut j = i;
            while j < resources.len() && resources[j].kind() == ResourceKind::DataFile {
                j += 1;
            }
            let batch = &resources[i..j];
            if batch.len() == 1 {
                let result = process_one(desc, settings, env, ctx);
                ctx.reporter.record(result);
            } else {
                run_batch(batch, settings, env, ctx, workers)?;
            }
            i = j;
            continue;
        }

        let result = process_one(desc, settings, env, ctx);
        let succeeded = result.status == FetchStatus::Succeeded;
        ctx.reporter.record(result);
        if succeeded {
            if let ResourceSource::Tool(tool) = &desc.source {
                // A freshly installed tool (aria2 above all) must be visible
                // to the transport selection of every later descriptor.
                env.refresh_tool(&tool.bin);
            }
        }
        i += 1;
    }

    ctx.reporter.finalize()
}

fn effective_parallelism(settings: &Settings) -> usize {
    settings.max_parallel.clamp(1, num_cpus::get().max(1))
}

fn run_batch(
    batch: &[ResourceDescriptor],
    settings: &Settings,
    env: &Environment,
    ctx: &RunContext,
    workers: usize,
) -> Result<()> {
    let queue: Mutex<VecDeque<(usize, &ResourceDescriptor)>> =
        Mutex::new(batch.iter().enumerate().collect());
    let results: Mutex<Vec<Option<FetchResult>>> = Mutex::new(vec![None; batch.len()]);

    std::thread::scope(|s| {
        for _ in 0..workers.min(batch.len()) {
            s.spawn(|| {
                loop {
                    if ctx.cancelled() {
                        break;
                    }
                    let next = queue.lock().ok().and_then(|mut q| q.pop_front());
                    let Some((idx, desc)) = next else {
                        break;
                    };
                    let result = process_one(desc, settings, env, ctx);
                    if let Ok(mut slots) = results.lock() {
                        slots[idx] = Some(result);
                    }
                }
            });
        }
    });

    // Record in manifest order once the batch settles; the run report stays
    // an ordered list even though completion order varies.
    let results = results
        .into_inner()
        .map_err(|_| Error::msg("worker results poisoned"))?;
    for result in results.into_iter().flatten() {
        ctx.reporter.record(result);
    }
    Ok(())
}

/// One descriptor, start to finish. Every failure path ends in a recorded
/// result; nothing here aborts the run.
fn process_one(
    desc: &ResourceDescriptor,
    settings: &Settings,
    env: &Environment,
    ctx: &RunContext,
) -> FetchResult {
    let presence = match probe(desc, env) {
        Ok(p) => p,
        Err(e) => return failed(desc, format!("probe failed: {e}")),
    };

    match presence {
        PresenceState::PresentSatisfying => {
            return skipped(desc, "already present");
        }
        PresenceState::PresentVersionMismatch if !reinstall_on_mismatch(desc) => {
            return skipped(desc, "present, version differs (not pinned)");
        }
        _ => {}
    }

    let plan = match select(desc, env) {
        Ok(p) => p,
        Err(e) => return failed(desc, e.to_string()),
    };

    if ctx.dry_run {
        ctx.reporter
            .line(&format!("DRY-RUN: {} -> {}", desc.name, plan.describe()));
        return skipped(desc, "dry-run");
    }

    let mut result = execute(desc, &plan, ctx);
    if result.status == FetchStatus::Succeeded {
        match finalize(desc, settings, env) {
            FinalizeResult::Done | FinalizeResult::NothingToDo => {}
            FinalizeResult::Failed(detail) => {
                // Fetch status is preserved; the finalize problem rides along
                // as a note for the operator.
                result.note = Some(format!("finalize failed: {detail}"));
            }
        }
    }
    result
}

fn skipped(desc: &ResourceDescriptor, note: &str) -> FetchResult {
    FetchResult {
        name: desc.name.clone(),
        kind: desc.kind().as_str(),
        status: FetchStatus::Skipped,
        attempts: 0,
        error_detail: None,
        duration_ms: 0,
        note: Some(note.to_string()),
    }
}

fn failed(desc: &ResourceDescriptor, detail: String) -> FetchResult {
    FetchResult {
        name: desc.name.clone(),
        kind: desc.kind().as_str(),
        status: FetchStatus::Failed,
        attempts: 0,
        error_detail: Some(detail),
        duration_ms: 0,
        note: None,
    }
}

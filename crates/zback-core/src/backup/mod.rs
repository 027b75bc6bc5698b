pub mod planner;
pub(crate) mod scheduler;
pub(crate) mod splitter;
pub(crate) mod stage;

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{debug, info, warn};
use zback_types::snapshot::SnapshotInfo;

use crate::config::{FailurePolicy, JobOptions};
use crate::crypto::VolumeCipher;
use crate::error::{Result, ZbackError};
use crate::manifest::{utc_now_secs, JobInfo};
use crate::retry::retry_with_backoff;
use crate::storage::{open_destinations, Backend as _, Destination};
use crate::zfs;
use planner::SendPlan;
use scheduler::run_scheduler;
use splitter::{run_splitter, SlotBudget};
use stage::stage_volume;

/// Outcome of one backup job, for the exit summary.
#[derive(Debug)]
pub struct BackupSummary {
    pub volumes: u64,
    pub raw_bytes: u64,
    pub stored_bytes: u64,
    /// Destinations that confirmed every volume and received the manifest.
    pub committed: Vec<String>,
    /// Destinations that failed, with their post-retry error (only
    /// populated under `continue-others`).
    pub failed: Vec<(String, String)>,
}

/// Resolve a manual `send [-i from] dataset@to` invocation into a plan,
/// filling snapshot identities from the live system.
pub fn resolve_manual_plan(target: &str, from: Option<&str>) -> Result<SendPlan> {
    let to = SnapshotInfo::parse_target(target).map_err(ZbackError::InvalidInput)?;
    let to = zfs::resolve(&to)?;

    match from {
        None => Ok(SendPlan::Full { to }),
        Some(raw) => {
            let from = SnapshotInfo::parse(raw).map_err(ZbackError::InvalidInput)?;
            if from.dataset != to.dataset {
                return Err(ZbackError::InvalidInput(format!(
                    "incremental source '{raw}' is not on dataset '{}'",
                    to.dataset
                )));
            }
            let from = zfs::resolve(&from)?;
            Ok(SendPlan::Incremental { from, to })
        }
    }
}

/// Run a backup job against a live `zfs send`.
pub fn run(
    plan: &SendPlan,
    destinations_raw: &str,
    opts: &JobOptions,
    shutdown: &AtomicBool,
) -> Result<BackupSummary> {
    opts.validate()?;
    let destinations = open_destinations(destinations_raw, opts.request_timeout)?;

    let mut send = zfs::SendStream::spawn(plan.from(), plan.to())?;
    let source = send.take_stdout();
    // The send's exit status gates the commit: a stream truncated by a
    // failing `zfs send` must never get a manifest.
    run_job(source, plan, destinations, opts, shutdown, move || {
        send.finish()
    })
}

/// Run a backup job against an arbitrary send-stream reader.
///
/// The split is what makes the pipeline testable without a ZFS pool; the
/// production path feeds a `zfs send` stdout through here.
pub fn run_with_source(
    source: impl Read + Send,
    plan: &SendPlan,
    destinations: Vec<Destination>,
    opts: &JobOptions,
    shutdown: &AtomicBool,
) -> Result<BackupSummary> {
    run_job(source, plan, destinations, opts, shutdown, || Ok(()))
}

fn run_job(
    source: impl Read + Send,
    plan: &SendPlan,
    destinations: Vec<Destination>,
    opts: &JobOptions,
    shutdown: &AtomicBool,
    on_drained: impl FnOnce() -> Result<()>,
) -> Result<BackupSummary> {
    opts.validate()?;
    let cipher = VolumeCipher::for_backup(&opts.crypto)?;

    let to = plan.to();
    let mut job = JobInfo::new(
        &to.dataset,
        to.clone(),
        plan.from().cloned(),
        opts.compressor,
        opts.crypto.encrypt_to.clone(),
        opts.crypto.sign_from.clone(),
        opts.volume_size,
        utc_now_secs(),
    );
    let job_tag = format!(
        "zback-{}-{}",
        std::process::id(),
        job.started_at.timestamp_micros()
    );

    info!(
        "sending {} ({}) to {} destination(s)",
        to.full_name(),
        plan.from()
            .map(|f| format!("incremental from {}", f.full_name()))
            .unwrap_or_else(|| "full".to_string()),
        destinations.len(),
    );

    let result = run_pipeline(
        source,
        &mut job,
        &job_tag,
        &destinations,
        opts,
        cipher.as_ref(),
        shutdown,
    );

    // Scratch files are cleaned on every exit path; success leaves none
    // behind anyway.
    cleanup_job_files(&opts.working_dir, &job_tag);

    let dest_failures = result?;
    on_drained()?;

    // Commit point: the manifest is the last object written, and only to
    // destinations that confirmed every volume.
    job.finished_at = Some(utc_now_secs());
    let manifest_key = job.manifest_key(&opts.separator);
    let manifest_bytes = job.to_json()?;

    let mut committed = Vec::new();
    let mut failed: Vec<(String, String)> = Vec::new();
    for (dest, failure) in destinations.iter().zip(dest_failures) {
        match failure {
            Some(e) => failed.push((dest.uri.clone(), e.to_string())),
            None => {
                let op_name = format!("upload {manifest_key} to {}", dest.uri);
                let upload = retry_with_backoff(&opts.retry, &op_name, Some(shutdown), || {
                    let mut reader = Cursor::new(&manifest_bytes);
                    dest.backend.upload(
                        &manifest_key,
                        &mut reader,
                        manifest_bytes.len() as u64,
                        None,
                    )
                });
                match upload {
                    Ok(()) => committed.push(dest.uri.clone()),
                    Err(e) if opts.failure_policy == FailurePolicy::ContinueOthers => {
                        warn!("manifest upload to {} failed: {e}", dest.uri);
                        failed.push((dest.uri.clone(), e.to_string()));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    if committed.is_empty() {
        return Err(ZbackError::Other(
            "no destination accepted the manifest".into(),
        ));
    }

    let summary = BackupSummary {
        volumes: job.volumes.len() as u64,
        raw_bytes: job.volumes.iter().map(|v| v.raw_size).sum(),
        stored_bytes: job.volumes.iter().map(|v| v.stored_size).sum(),
        committed,
        failed,
    };
    info!(
        "backup of {} committed: {} volume(s), {} -> {} bytes",
        to.full_name(),
        summary.volumes,
        summary.raw_bytes,
        summary.stored_bytes,
    );
    Ok(summary)
}

/// The staged, back-pressured dataflow:
/// splitter → stage workers → upload scheduler.
fn run_pipeline(
    source: impl Read + Send,
    job: &mut JobInfo,
    job_tag: &str,
    destinations: &[Destination],
    opts: &JobOptions,
    cipher: Option<&VolumeCipher>,
    shutdown: &AtomicBool,
) -> Result<Vec<Option<ZbackError>>> {
    let budget = SlotBudget::new(opts.max_in_flight);
    let first_error: Mutex<Option<ZbackError>> = Mutex::new(None);

    let stage_workers = opts
        .max_in_flight
        .min(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
        )
        .max(1);

    let report = std::thread::scope(|s| {
        let (raw_tx, raw_rx) = crossbeam_channel::bounded(1);
        let (staged_tx, staged_rx) = crossbeam_channel::bounded(opts.max_in_flight);

        // --- Splitter ---
        let budget_ref = &budget;
        let first_error_ref = &first_error;
        s.spawn(move || {
            let result = run_splitter(
                source,
                &opts.working_dir,
                job_tag,
                opts.volume_size,
                budget_ref,
                raw_tx,
                shutdown,
            );
            if let Err(e) = result {
                record_error(first_error_ref, e, budget_ref, shutdown);
            }
        });

        // --- Stage workers ---
        for _ in 0..stage_workers {
            let raw_rx = raw_rx.clone();
            let staged_tx = staged_tx.clone();
            s.spawn(move || {
                for raw in raw_rx {
                    if shutdown.load(Ordering::Relaxed) {
                        let _ = std::fs::remove_file(&raw.path);
                        continue;
                    }
                    match stage_volume(raw, opts.compressor, cipher, &opts.working_dir, job_tag)
                    {
                        Ok(stagedvol) => {
                            if staged_tx.send(stagedvol).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            record_error(first_error_ref, e, budget_ref, shutdown);
                            return;
                        }
                    }
                }
            });
        }
        drop(raw_rx);
        drop(staged_tx);

        // --- Upload scheduler (this thread) ---
        let separator = opts.separator.clone();
        let job_for_keys = job.clone();
        run_scheduler(
            staged_rx,
            destinations,
            &move |index| job_for_keys.volume_key(&separator, index),
            opts,
            &budget,
            shutdown,
        )
    });

    // Stage/splitter errors surface first; the scheduler's own failure is
    // usually just the echo of the cancellation they triggered.
    if let Some(e) = first_error.lock().unwrap().take() {
        return Err(e);
    }
    let report = report?;

    job.volumes = report.volume_records;
    debug!("pipeline complete: {} volume(s)", job.volumes.len());
    Ok(report.dest_failures)
}

fn record_error(
    slot: &Mutex<Option<ZbackError>>,
    e: ZbackError,
    budget: &SlotBudget,
    shutdown: &AtomicBool,
) {
    // An Interrupted after someone already failed is an echo, not a cause.
    let mut slot = slot.lock().unwrap();
    if slot.is_none() && !matches!(e, ZbackError::Interrupted) {
        *slot = Some(e);
    }
    shutdown.store(true, Ordering::Relaxed);
    budget.poison();
}

/// Remove every scratch file of one job from the working directory.
fn cleanup_job_files(working_dir: &Path, job_tag: &str) {
    let Ok(entries) = std::fs::read_dir(working_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(job_tag)
        {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

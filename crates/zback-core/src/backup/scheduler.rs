use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::backup::splitter::SlotBudget;
use crate::backup::stage::StagedVolume;
use crate::config::{FailurePolicy, JobOptions};
use crate::error::{Result, ZbackError};
use crate::manifest::VolumeRecord;
use crate::retry::retry_with_backoff;
use crate::storage::{Backend as _, Destination};

/// One upload of one volume to one destination.
struct UploadTask {
    volume_index: u64,
    key: String,
    path: PathBuf,
    len: u64,
    md5: [u8; 16],
}

struct UploadOutcome {
    dest_index: usize,
    volume_index: u64,
    result: Result<()>,
}

/// In-flight bookkeeping for one volume: which destinations still owe an
/// acknowledgement, and where its payload lives until they all do.
struct VolumeState {
    path: PathBuf,
    remaining: HashSet<usize>,
}

/// What the scheduler hands back to the orchestrator.
#[derive(Debug)]
pub(crate) struct SchedulerReport {
    /// Per-volume manifest facts, ordered by index.
    pub volume_records: Vec<VolumeRecord>,
    /// Per-destination verdict. `None` means every volume was confirmed;
    /// `Some(e)` carries the post-retry failure (only under
    /// `continue-others`).
    pub dest_failures: Vec<Option<ZbackError>>,
}

/// Fan finalized volumes out to every destination with bounded per-backend
/// worker pools.
///
/// Uploads complete in any order. A volume's payload file is deleted, and
/// its back-pressure slot released, only once every still-active
/// destination has acknowledged it. Retries are absorbed here; only
/// post-retry verdicts influence the job outcome, per the failure policy.
pub(crate) fn run_scheduler(
    staged_rx: Receiver<StagedVolume>,
    destinations: &[Destination],
    key_for: &(dyn Fn(u64) -> String + Sync),
    opts: &JobOptions,
    budget: &SlotBudget,
    shutdown: &AtomicBool,
) -> Result<SchedulerReport> {
    let n_dests = destinations.len();
    let (results_tx, results_rx) = crossbeam_channel::unbounded::<UploadOutcome>();

    // Per-destination failure flags let queued tasks short-circuit once
    // their destination is already lost.
    let dest_down: Vec<Arc<AtomicBool>> = (0..n_dests)
        .map(|_| Arc::new(AtomicBool::new(false)))
        .collect();

    std::thread::scope(|s| {
        // --- Per-destination worker pools ---
        let mut task_txs: Vec<Option<Sender<UploadTask>>> = Vec::with_capacity(n_dests);
        for (dest_index, dest) in destinations.iter().enumerate() {
            let pool = dest.backend.max_parallel_uploads().min(opts.max_parallel).max(1);
            let (task_tx, task_rx) = crossbeam_channel::bounded::<UploadTask>(pool * 2);
            task_txs.push(Some(task_tx));

            for _ in 0..pool {
                let task_rx = task_rx.clone();
                let results_tx = results_tx.clone();
                let down = Arc::clone(&dest_down[dest_index]);
                let backend = Arc::clone(&dest.backend);
                let uri = dest.uri.clone();
                let retry = opts.retry.clone();
                s.spawn(move || {
                    for task in task_rx {
                        if down.load(Ordering::Relaxed) || shutdown.load(Ordering::Relaxed) {
                            // Destination already failed or job is stopping;
                            // report without attempting.
                            let _ = results_tx.send(UploadOutcome {
                                dest_index,
                                volume_index: task.volume_index,
                                result: Err(ZbackError::Interrupted),
                            });
                            continue;
                        }
                        let op_name = format!("upload {} to {uri}", task.key);
                        let md5 = backend.supports_md5().then_some(&task.md5);
                        let result =
                            retry_with_backoff(&retry, &op_name, Some(shutdown), || {
                                let mut reader = File::open(&task.path)?;
                                backend.upload(&task.key, &mut reader, task.len, md5)
                            });
                        if result.is_ok() {
                            debug!("confirmed {} at {uri}", task.key);
                        }
                        if results_tx
                            .send(UploadOutcome {
                                dest_index,
                                volume_index: task.volume_index,
                                result,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                });
            }
        }
        drop(results_tx);

        // --- Dispatcher / collector (this thread) ---
        let mut staged_rx = staged_rx;
        let mut staged_done = false;
        let mut volumes: HashMap<u64, VolumeState> = HashMap::new();
        let mut records: Vec<VolumeRecord> = Vec::new();
        let mut dest_failures: Vec<Option<ZbackError>> = (0..n_dests).map(|_| None).collect();
        let mut fatal: Option<ZbackError> = None;

        'pump: loop {
            crossbeam_channel::select! {
                recv(staged_rx) -> msg => match msg {
                    Ok(staged) => {
                        records.push(VolumeRecord {
                            index: staged.index,
                            raw_size: staged.raw_size,
                            stored_size: staged.digests.len,
                            md5: staged.digests.md5_hex(),
                            sha256: staged.digests.sha256_hex(),
                        });

                        let key = key_for(staged.index);
                        let active: HashSet<usize> = (0..n_dests)
                            .filter(|d| dest_failures[*d].is_none())
                            .collect();
                        if active.is_empty() {
                            fatal = Some(ZbackError::Other(
                                "all destinations have failed".into(),
                            ));
                            break 'pump;
                        }

                        volumes.insert(staged.index, VolumeState {
                            path: staged.path.clone(),
                            remaining: active.clone(),
                        });

                        for dest_index in active {
                            let task = UploadTask {
                                volume_index: staged.index,
                                key: key.clone(),
                                path: staged.path.clone(),
                                len: staged.digests.len,
                                md5: staged.digests.md5,
                            };
                            if let Some(tx) = &task_txs[dest_index] {
                                if tx.send(task).is_err() {
                                    fatal = Some(ZbackError::Interrupted);
                                    break 'pump;
                                }
                            }
                        }
                    }
                    Err(_) => {
                        staged_done = true;
                        staged_rx = crossbeam_channel::never();
                    }
                },
                recv(results_rx) -> msg => {
                    let Ok(outcome) = msg else { break 'pump };
                    match outcome.result {
                        Ok(()) => {
                            if let Some(state) = volumes.get_mut(&outcome.volume_index) {
                                state.remaining.remove(&outcome.dest_index);
                                if state.remaining.is_empty() {
                                    let state = volumes.remove(&outcome.volume_index).unwrap();
                                    let _ = std::fs::remove_file(&state.path);
                                    budget.release();
                                    debug!("released volume {}", outcome.volume_index);
                                }
                            }
                        }
                        Err(e) => {
                            let dest = &destinations[outcome.dest_index];
                            match opts.failure_policy {
                                FailurePolicy::FailFast => {
                                    warn!(
                                        "upload of volume {} to {} failed: {e}",
                                        outcome.volume_index, dest.uri
                                    );
                                    fatal = Some(e);
                                    break 'pump;
                                }
                                FailurePolicy::ContinueOthers => {
                                    if dest_failures[outcome.dest_index].is_none() {
                                        warn!(
                                            "destination {} failed, continuing with the others: {e}",
                                            dest.uri
                                        );
                                        dest_down[outcome.dest_index]
                                            .store(true, Ordering::Relaxed);
                                        task_txs[outcome.dest_index] = None;
                                        dest_failures[outcome.dest_index] = Some(e);
                                        drop_dest_from_volumes(
                                            &mut volumes,
                                            outcome.dest_index,
                                            budget,
                                        );
                                        if dest_failures.iter().all(Option::is_some) {
                                            fatal = Some(ZbackError::Other(
                                                "all destinations have failed".into(),
                                            ));
                                            break 'pump;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if shutdown.load(Ordering::Relaxed) && fatal.is_none() {
                fatal = Some(ZbackError::Interrupted);
                break 'pump;
            }
            if staged_done && volumes.is_empty() {
                break 'pump;
            }
        }

        // Stop feeding workers; poisoning the budget unblocks the splitter
        // if we are bailing early.
        for tx in task_txs.iter_mut() {
            *tx = None;
        }
        if fatal.is_some() {
            budget.poison();
            for down in &dest_down {
                down.store(true, Ordering::Relaxed);
            }
        }
        // Worker threads drain and exit as the scope closes.

        if let Some(e) = fatal {
            return Err(e);
        }

        records.sort_by_key(|r| r.index);
        let confirmed = records.len();
        info!("all {confirmed} volume(s) confirmed at every active destination");
        Ok(SchedulerReport {
            volume_records: records,
            dest_failures,
        })
    })
}

/// A destination is gone: forget it in every in-flight volume so payload
/// files do not wait for acknowledgements that will never come.
fn drop_dest_from_volumes(
    volumes: &mut HashMap<u64, VolumeState>,
    dest_index: usize,
    budget: &SlotBudget,
) {
    let done: Vec<u64> = volumes
        .iter_mut()
        .filter_map(|(idx, state)| {
            state.remaining.remove(&dest_index);
            state.remaining.is_empty().then_some(*idx)
        })
        .collect();
    for idx in done {
        if let Some(state) = volumes.remove(&idx) {
            let _ = std::fs::remove_file(&state.path);
            budget.release();
        }
    }
}

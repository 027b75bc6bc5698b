use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};
use zback_types::snapshot::SnapshotInfo;

use crate::backup::splitter::SlotBudget;
use crate::compress::reader_for_id;
use crate::config::JobOptions;
use crate::crypto::VolumeCipher;
use crate::digest::DigestWriter;
use crate::error::{Result, ZbackError};
use crate::list::collect_mirrored;
use crate::manifest::{JobInfo, VolumeRecord};
use crate::retry::retry_with_backoff;
use crate::storage::{open_destinations, Backend as _, Destination};
use crate::zfs::{self, ReceiveOptions};

/// What to restore and where.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// `dataset@snap` (exact) or bare `dataset` (`--auto`).
    pub source: String,
    /// Target dataset for `zfs receive`.
    pub target: String,
    /// Chain full + incrementals up to the newest manifest.
    pub auto: bool,
    /// `-i`: expected incremental parent, e.g. `tank/data@a`.
    pub incremental_from: Option<String>,
    pub receive: ReceiveOptions,
}

/// Outcome of a restore, for the exit summary.
#[derive(Debug)]
pub struct RestoreSummary {
    pub jobs: usize,
    pub volumes: u64,
    pub bytes_written: u64,
}

/// Restore into a live `zfs receive`, one invocation per chained manifest.
pub fn run(
    request: &RestoreRequest,
    destinations_raw: &str,
    opts: &JobOptions,
    shutdown: &AtomicBool,
) -> Result<RestoreSummary> {
    opts.validate()?;
    let destinations = open_destinations(destinations_raw, opts.request_timeout)?;

    let chain = plan_chain(request, &destinations, opts, shutdown)?;

    // `-i` only makes sense when its parent is already on the target.
    if let Some(raw_from) = &request.incremental_from {
        let from = SnapshotInfo::parse(raw_from).map_err(ZbackError::InvalidInput)?;
        if !zfs::target_has(&request.target, &from.name)? {
            return Err(ZbackError::InvalidInput(format!(
                "target '{}' does not have the incremental source '{raw_from}'",
                request.target
            )));
        }
    }

    let mut summary = RestoreSummary {
        jobs: chain.len(),
        volumes: 0,
        bytes_written: 0,
    };
    for job in &chain {
        info!(
            "restoring {} into {}",
            job.base_snapshot.full_name(),
            request.target
        );
        let cipher =
            VolumeCipher::for_restore(&opts.crypto, job.encrypted(), job.sign_from.as_deref())?;

        let mut receive = zfs::ReceiveSink::spawn(&request.target, &request.receive)?;
        let mut stdin = receive.take_stdin();
        let written = restore_job(
            job,
            &destinations,
            &mut stdin,
            opts,
            cipher.as_ref(),
            shutdown,
        )?;
        drop(stdin);
        receive.finish()?;

        summary.volumes += job.volumes.len() as u64;
        summary.bytes_written += written;
    }
    Ok(summary)
}

/// Resolve the ordered list of manifests to replay.
pub fn plan_chain(
    request: &RestoreRequest,
    destinations: &[Destination],
    opts: &JobOptions,
    shutdown: &AtomicBool,
) -> Result<Vec<JobInfo>> {
    let jobs = collect_mirrored(destinations, &opts.retry, Some(shutdown))?;

    if request.auto {
        let dataset = request.source.as_str();
        select_auto_chain(&jobs, dataset)
    } else {
        let target = SnapshotInfo::parse_target(&request.source)
            .map_err(ZbackError::InvalidInput)?;
        let from_name = match &request.incremental_from {
            Some(raw) => Some(
                SnapshotInfo::parse(raw)
                    .map_err(ZbackError::InvalidInput)?
                    .name,
            ),
            None => None,
        };
        let job = select_exact(&jobs, &target.dataset, &target.name, from_name.as_deref())?;
        Ok(vec![job])
    }
}

/// Pick the single manifest for `dataset@snap`, honoring an explicit `-i`.
fn select_exact(
    jobs: &[JobInfo],
    dataset: &str,
    snap: &str,
    from_name: Option<&str>,
) -> Result<JobInfo> {
    let candidates: Vec<&JobInfo> = jobs
        .iter()
        .filter(|j| j.volume_name == dataset && j.base_snapshot.name == snap)
        .collect();

    let selected = match from_name {
        Some(from) => candidates.iter().find(|j| {
            j.parent_snapshot
                .as_ref()
                .is_some_and(|p| p.name == from)
        }),
        None => candidates
            .iter()
            .find(|j| j.parent_snapshot.is_none())
            .or_else(|| candidates.first()),
    };

    selected.map(|j| (*j).clone()).ok_or_else(|| {
        ZbackError::NotFound(format!(
            "no manifest for {dataset}@{snap}{}",
            from_name
                .map(|f| format!(" with incremental source {f}"))
                .unwrap_or_default()
        ))
    })
}

/// Chain manifests full → incrementals, linked by snapshot GUID, ending at
/// the newest reachable snapshot.
fn select_auto_chain(jobs: &[JobInfo], dataset: &str) -> Result<Vec<JobInfo>> {
    let of_dataset: Vec<&JobInfo> = jobs.iter().filter(|j| j.volume_name == dataset).collect();
    if of_dataset.is_empty() {
        return Err(ZbackError::NotFound(format!(
            "no manifests for '{dataset}' at the destination"
        )));
    }

    let mut best: Vec<JobInfo> = Vec::new();
    for full in of_dataset.iter().filter(|j| j.parent_snapshot.is_none()) {
        let mut chain: Vec<JobInfo> = vec![(*full).clone()];
        // Chain length is bounded by the manifest count; a malformed
        // parent cycle must not loop forever.
        while chain.len() <= of_dataset.len() {
            let tip_guid = chain.last().unwrap().base_snapshot.guid;
            // Among incrementals continuing the tip, prefer the newest `to`.
            let next = of_dataset
                .iter()
                .filter(|j| {
                    j.parent_snapshot
                        .as_ref()
                        .is_some_and(|p| p.guid == tip_guid)
                })
                .max_by_key(|j| (j.base_snapshot.creation, j.base_snapshot.txg));
            match next {
                Some(job) => chain.push((*job).clone()),
                None => break,
            }
        }
        let newer = |c: &[JobInfo]| c.last().map(|j| j.base_snapshot.creation);
        if best.is_empty() || newer(&chain) > newer(&best) {
            best = chain;
        }
    }

    if best.is_empty() {
        return Err(ZbackError::NotFound(format!(
            "no full backup manifest for '{dataset}' to anchor the chain"
        )));
    }
    debug!(
        "restore chain for {dataset}: {}",
        best.iter()
            .map(|j| j.base_snapshot.name.clone())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    Ok(best)
}

/// Replay one manifest into `out`: parallel downloads, digest verification,
/// strict in-order reassembly through decrypt/verify and decompress.
///
/// A slot budget caps downloaded-but-not-yet-consumed volumes at
/// `max_in_flight`, so a fast network cannot fill the working directory
/// faster than `zfs receive` drains it.
///
/// Returns the number of raw stream bytes written to `out`.
pub fn restore_job(
    job: &JobInfo,
    destinations: &[Destination],
    out: &mut dyn Write,
    opts: &JobOptions,
    cipher: Option<&VolumeCipher>,
    shutdown: &AtomicBool,
) -> Result<u64> {
    let tag = format!("zback-restore-{}", std::process::id());
    let first_error: Mutex<Option<ZbackError>> = Mutex::new(None);
    let budget = SlotBudget::new(opts.max_in_flight);

    let written = std::thread::scope(|s| -> Result<u64> {
        let (task_tx, task_rx) =
            crossbeam_channel::bounded::<VolumeRecord>(opts.max_in_flight);
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<(u64, PathBuf)>();

        // --- Feeder ---
        // Slots are taken here, in volume order, before a task is handed to
        // any worker. Acquiring inside the workers instead could hand every
        // slot to later volumes and starve the one the reorder buffer needs
        // next.
        let records = job.volumes.clone();
        let feeder_budget = &budget;
        s.spawn(move || {
            for record in records {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if feeder_budget.acquire().is_err() {
                    return;
                }
                if task_tx.send(record).is_err() {
                    return;
                }
            }
        });

        // --- Download workers ---
        let workers = opts
            .max_parallel
            .min(destinations[0].backend.max_parallel_uploads())
            .max(1);
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            let first_error = &first_error;
            let budget = &budget;
            let tag = tag.clone();
            s.spawn(move || {
                for record in task_rx {
                    match fetch_volume(job, &record, destinations, opts, &tag, shutdown) {
                        Ok(path) => {
                            if done_tx.send((record.index, path)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let mut slot = first_error.lock().unwrap();
                            if slot.is_none() && !matches!(e, ZbackError::Interrupted) {
                                *slot = Some(e);
                            }
                            shutdown.store(true, Ordering::Relaxed);
                            budget.poison();
                            return;
                        }
                    }
                }
            });
        }
        drop(task_rx);
        drop(done_tx);

        // --- Ordered consumer (this thread) ---
        let result = consume_in_order(job, done_rx, out, cipher, shutdown, &budget);
        // Unblock any worker still waiting on a slot if we bailed early.
        if result.is_err() {
            budget.poison();
        }
        result
    });

    // Downloaded-but-unconsumed spills are removed on the error path.
    cleanup_restore_files(&opts.working_dir, &tag);

    if let Some(e) = first_error.lock().unwrap().take() {
        return Err(e);
    }
    written
}

/// Download one volume into a spill file, verifying its SHA-256 while the
/// bytes land. Mirrored destinations are tried in order; a digest mismatch
/// is transient and re-downloads until the shared retry budget runs out.
fn fetch_volume(
    job: &JobInfo,
    record: &VolumeRecord,
    destinations: &[Destination],
    opts: &JobOptions,
    tag: &str,
    shutdown: &AtomicBool,
) -> Result<PathBuf> {
    let key = job.volume_key(&opts.separator, record.index);
    let path = opts
        .working_dir
        .join(format!("{tag}.v{}.volume", record.index));

    retry_with_backoff(
        &opts.retry,
        &format!("download {key}"),
        Some(shutdown),
        || {
            let mut last_err: Option<ZbackError> = None;
            for dest in destinations {
                match try_fetch(dest, &key, record, &path) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!("download of {key} from {} failed: {e}", dest.uri);
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| ZbackError::NotFound(key.clone())))
        },
    )?;
    Ok(path)
}

fn try_fetch(
    dest: &Destination,
    key: &str,
    record: &VolumeRecord,
    path: &PathBuf,
) -> Result<()> {
    let mut reader = dest.backend.download(key)?;
    let file = File::create(path)?;
    let mut writer = DigestWriter::new(file);
    std::io::copy(&mut reader, &mut writer)?;
    let (file, digests) = writer.finalize()?;
    drop(file);

    if digests.len != record.stored_size || digests.sha256_hex() != record.sha256 {
        let _ = std::fs::remove_file(path);
        return Err(ZbackError::IntegrityFailure(format!(
            "volume {key}: digest mismatch (got {} bytes, sha256 {})",
            digests.len,
            digests.sha256_hex()
        )));
    }
    Ok(())
}

/// Reorder buffer: volumes may arrive in any order but are fed to the
/// stream sink strictly by index.
fn consume_in_order(
    job: &JobInfo,
    done_rx: Receiver<(u64, PathBuf)>,
    out: &mut dyn Write,
    cipher: Option<&VolumeCipher>,
    shutdown: &AtomicBool,
    budget: &SlotBudget,
) -> Result<u64> {
    let total = job.volumes.len() as u64;
    let mut next_expected: u64 = 0;
    let mut pending: BTreeMap<u64, PathBuf> = BTreeMap::new();
    let mut written: u64 = 0;

    for (index, path) in done_rx {
        if shutdown.load(Ordering::Relaxed) {
            return Err(ZbackError::Interrupted);
        }
        pending.insert(index, path);

        while let Some(path) = pending.remove(&next_expected) {
            written += emit_volume(job, &path, out, cipher)?;
            let _ = std::fs::remove_file(&path);
            budget.release();
            next_expected += 1;
        }
    }

    if next_expected != total {
        if shutdown.load(Ordering::Relaxed) {
            return Err(ZbackError::Interrupted);
        }
        return Err(ZbackError::Other(format!(
            "restore stopped early: {next_expected}/{total} volumes reassembled"
        )));
    }
    out.flush()?;
    Ok(written)
}

/// Reverse the stage chain for one volume: decrypt/verify, then decompress
/// into the sink.
fn emit_volume(
    job: &JobInfo,
    path: &PathBuf,
    out: &mut dyn Write,
    cipher: Option<&VolumeCipher>,
) -> Result<u64> {
    let source: Box<dyn Read + Send> = match cipher {
        None => Box::new(File::open(path)?),
        Some(cipher) => {
            let sealed = std::fs::read(path)?;
            Box::new(std::io::Cursor::new(cipher.open(&sealed)?))
        }
    };
    let mut decoder = reader_for_id(&job.compressor, source)?;
    Ok(std::io::copy(&mut decoder, out)?)
}

fn cleanup_restore_files(working_dir: &std::path::Path, tag: &str) {
    let Ok(entries) = std::fs::read_dir(working_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(tag) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

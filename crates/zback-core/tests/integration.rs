//! End-to-end pipeline tests against `file://` destinations, with the send
//! stream injected instead of a live `zfs send`.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use zback_core::backup::planner::{plan_increment, SendPlan};
use zback_core::backup::{run_with_source, BackupSummary};
use zback_core::compress::Compressor;
use zback_core::config::JobOptions;
use zback_core::error::{Result, ZbackError};
use zback_core::list::{collect_mirrored, group_jobs, ListFilters};
use zback_core::manifest::JobInfo;
use zback_core::restore::restore_job;
use zback_core::retry::RetryPolicy;
use zback_core::storage::{open_destination, Backend, Destination, ObjectInfo};
use zback_types::snapshot::SnapshotInfo;

fn snapshot(name: &str, guid: u64, txg: u64) -> SnapshotInfo {
    SnapshotInfo {
        dataset: "tank/data".into(),
        name: name.into(),
        guid,
        txg,
        creation: DateTime::<Utc>::from_timestamp(1_700_000_000 + txg as i64, 0).unwrap(),
        bookmark: false,
    }
}

fn test_opts(work: &Path) -> JobOptions {
    JobOptions {
        working_dir: work.to_path_buf(),
        separator: "+".into(),
        volume_size: 1024,
        compressor: Compressor::Zstd { level: 3 },
        retry: RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
        },
        ..Default::default()
    }
}

fn file_dest(dir: &Path) -> Destination {
    open_destination(
        &format!("file://{}", dir.display()),
        std::time::Duration::from_secs(60),
    )
    .unwrap()
}

fn pseudo_send_stream(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

fn backup(
    data: &[u8],
    plan: &SendPlan,
    dests: Vec<Destination>,
    opts: &JobOptions,
) -> Result<BackupSummary> {
    let shutdown = AtomicBool::new(false);
    run_with_source(std::io::Cursor::new(data.to_vec()), plan, dests, opts, &shutdown)
}

#[test]
fn backup_restore_round_trip_over_two_mirrors() {
    let work = tempfile::tempdir().unwrap();
    let store_a = tempfile::tempdir().unwrap();
    let store_b = tempfile::tempdir().unwrap();
    let opts = test_opts(work.path());

    let data = pseudo_send_stream(5000, 7);
    let plan = SendPlan::Full {
        to: snapshot("a", 11, 100),
    };
    let summary = backup(
        &data,
        &plan,
        vec![file_dest(store_a.path()), file_dest(store_b.path())],
        &opts,
    )
    .unwrap();
    assert_eq!(summary.volumes, 5);
    assert_eq!(summary.committed.len(), 2);

    // Invariant: volumes 0..N-1 present at every destination holding the
    // manifest, and the manifest is at least as new as every volume.
    for store in [&store_a, &store_b] {
        let dest = file_dest(store.path());
        let listed = dest.backend.list("").unwrap();
        let manifest = listed
            .iter()
            .find(|o| o.key.ends_with(".manifest"))
            .expect("manifest must be present");
        let volumes: Vec<&ObjectInfo> = listed
            .iter()
            .filter(|o| !o.key.ends_with(".manifest"))
            .collect();
        assert_eq!(volumes.len(), 5);
        for index in 0..5 {
            assert!(
                listed
                    .iter()
                    .any(|o| o.key == format!("tank/data++a+{index}.zst")),
                "volume {index} missing"
            );
        }
        for volume in volumes {
            assert!(manifest.modified >= volume.modified);
        }
    }

    // Restore from the mirrors reassembles the exact stream.
    let dests = vec![file_dest(store_a.path()), file_dest(store_b.path())];
    let jobs = collect_mirrored(&dests, &opts.retry, None).unwrap();
    assert_eq!(jobs.len(), 1);
    let mut sink = Vec::new();
    let shutdown = AtomicBool::new(false);
    restore_job(&jobs[0], &dests, &mut sink, &opts, None, &shutdown).unwrap();
    assert_eq!(sink, data);
}

#[test]
fn incremental_chain_lists_in_creation_order() {
    let work = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let opts = test_opts(work.path());

    let snap_a = snapshot("a", 11, 100);
    let snap_b = snapshot("b", 22, 200);
    let snap_c = snapshot("c", 33, 300);

    backup(
        &pseudo_send_stream(2000, 1),
        &SendPlan::Full { to: snap_a.clone() },
        vec![file_dest(store.path())],
        &opts,
    )
    .unwrap();
    backup(
        &pseudo_send_stream(1200, 2),
        &SendPlan::Incremental {
            from: snap_a.clone(),
            to: snap_b.clone(),
        },
        vec![file_dest(store.path())],
        &opts,
    )
    .unwrap();
    backup(
        &pseudo_send_stream(800, 3),
        &SendPlan::Incremental {
            from: snap_b.clone(),
            to: snap_c.clone(),
        },
        vec![file_dest(store.path())],
        &opts,
    )
    .unwrap();

    let dests = vec![file_dest(store.path())];
    let jobs = collect_mirrored(&dests, &opts.retry, None).unwrap();
    let grouped = group_jobs(jobs, &ListFilters::default()).unwrap();
    assert_eq!(grouped.len(), 1);
    let names: Vec<&str> = grouped["tank/data"]
        .iter()
        .map(|j| j.base_snapshot.name.as_str())
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    // Smart planning against this destination state is a NoOp when the
    // source has nothing newer.
    let local = vec![snap_a, snap_b, snap_c];
    let err = plan_increment("tank/data", &local, &grouped["tank/data"]).unwrap_err();
    assert!(err.is_no_op());

    // A new local snapshot flips the plan to an incremental from c.
    let mut with_d = local.clone();
    with_d.push(snapshot("d", 44, 400));
    let plan = plan_increment("tank/data", &with_d, &grouped["tank/data"]).unwrap();
    match plan {
        SendPlan::Incremental { from, to } => {
            assert_eq!(from.name, "c");
            assert_eq!(to.name, "d");
        }
        other => panic!("expected incremental, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Retry property: k transient failures < budget succeed, >= budget fail with
// exactly one error per destination.
// ---------------------------------------------------------------------------

/// Wraps a backend, failing the first `k` uploads with a transient error.
struct FlakyUploads {
    inner: Arc<dyn Backend>,
    failures_left: Mutex<u32>,
}

impl FlakyUploads {
    fn new(inner: Arc<dyn Backend>, k: u32) -> Self {
        Self {
            inner,
            failures_left: Mutex::new(k),
        }
    }
}

impl Backend for FlakyUploads {
    fn upload(
        &self,
        key: &str,
        reader: &mut dyn Read,
        len: u64,
        content_md5: Option<&[u8; 16]>,
    ) -> Result<()> {
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ZbackError::transient("injected outage"));
            }
        }
        self.inner.upload(key, reader, len, content_md5)
    }

    fn download(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        self.inner.download(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.inner.list(prefix)
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        self.inner.delete(keys)
    }
}

fn flaky_dest(dir: &Path, k: u32) -> (Arc<FlakyUploads>, Destination) {
    let inner = file_dest(dir);
    let flaky = Arc::new(FlakyUploads::new(inner.backend, k));
    let dest = Destination {
        uri: format!("flaky+file://{}", dir.display()),
        backend: flaky.clone(),
    };
    (flaky, dest)
}

#[test]
fn transient_outage_shorter_than_the_retry_budget_succeeds() {
    let work = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let opts = test_opts(work.path());

    let (_flaky, dest) = flaky_dest(store.path(), 2);
    let plan = SendPlan::Full {
        to: snapshot("a", 11, 100),
    };
    let summary = backup(&pseudo_send_stream(1500, 4), &plan, vec![dest], &opts).unwrap();
    assert_eq!(summary.volumes, 2);

    let dest = file_dest(store.path());
    let jobs = collect_mirrored(std::slice::from_ref(&dest), &opts.retry, None).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].volumes.len(), 2);
}

#[test]
fn outage_longer_than_the_retry_budget_fails_the_job() {
    let work = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let opts = test_opts(work.path());

    let (_flaky, dest) = flaky_dest(store.path(), 100);
    let plan = SendPlan::Full {
        to: snapshot("a", 11, 100),
    };
    let err = backup(&pseudo_send_stream(1500, 4), &plan, vec![dest], &opts).unwrap_err();
    assert!(err.is_transient());

    // No manifest committed.
    let dest = file_dest(store.path());
    assert!(
        !dest
            .backend
            .list("")
            .unwrap()
            .iter()
            .any(|o| o.key.ends_with(".manifest")),
        "failed job must not commit a manifest"
    );
}

#[test]
fn custom_separator_appears_in_keys_but_not_in_the_manifest() {
    let work = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let opts = test_opts(work.path()); // separator "+"

    let plan = SendPlan::Full {
        to: snapshot("a", 11, 100),
    };
    backup(
        &pseudo_send_stream(500, 9),
        &plan,
        vec![file_dest(store.path())],
        &opts,
    )
    .unwrap();

    let dest = file_dest(store.path());
    let mut manifest_bytes = Vec::new();
    dest.backend
        .download("tank/data++a.manifest")
        .unwrap()
        .read_to_end(&mut manifest_bytes)
        .unwrap();
    let info = JobInfo::from_slice(&manifest_bytes).unwrap();
    assert_eq!(info.volume_name, "tank/data");
    // Keys are rebuilt from the separator at restore time; the manifest
    // itself never embeds it.
    assert!(!String::from_utf8_lossy(&manifest_bytes).contains("tank/data++a"));
}

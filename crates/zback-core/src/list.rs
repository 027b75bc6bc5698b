use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Utc};
use globset::Glob;
use tracing::{debug, warn};

use crate::error::{Result, ZbackError};
use crate::manifest::{is_manifest_key, JobInfo};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::storage::{Backend as _, Destination};

/// Filters for the `list` operation.
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    /// Glob over the volume (dataset) name.
    pub volume_name: Option<String>,
    /// Only jobs whose `to` snapshot was created before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Only jobs whose `to` snapshot was created after this instant.
    pub after: Option<DateTime<Utc>>,
}

/// Download and parse every manifest at one destination.
///
/// Malformed manifest objects are skipped with a warning; one corrupt
/// object must not hide every other job from `list`. When two manifests
/// claim the same `to` snapshot with a different `from`, the newest by
/// mtime wins.
pub fn collect_manifests(
    dest: &Destination,
    retry: &RetryPolicy,
    shutdown: Option<&AtomicBool>,
) -> Result<Vec<JobInfo>> {
    let objects = retry_with_backoff(retry, &format!("list {}", dest.uri), shutdown, || {
        dest.backend.list("")
    })?;

    let mut manifests: Vec<(DateTime<Utc>, JobInfo)> = Vec::new();
    for obj in objects.into_iter().filter(|o| is_manifest_key(&o.key)) {
        let data = retry_with_backoff(retry, &format!("get {}", obj.key), shutdown, || {
            let mut reader = dest.backend.download(&obj.key)?;
            let mut buf = Vec::with_capacity(obj.size as usize);
            reader.read_to_end(&mut buf)?;
            Ok(buf)
        })?;
        match JobInfo::from_slice(&data) {
            Ok(info) => manifests.push((obj.modified, info)),
            Err(e) => warn!("skipping unreadable manifest '{}': {e}", obj.key),
        }
    }

    // Newest mtime wins among manifests claiming the same `to` snapshot.
    manifests.sort_by(|a, b| a.0.cmp(&b.0));
    let mut by_target: BTreeMap<(String, u64), JobInfo> = BTreeMap::new();
    for (_, info) in manifests {
        by_target.insert((info.volume_name.clone(), info.base_snapshot.guid), info);
    }

    let mut out: Vec<JobInfo> = by_target.into_values().collect();
    sort_jobs(&mut out);
    debug!("{}: {} manifest(s)", dest.uri, out.len());
    Ok(out)
}

/// Collect manifests across mirrored destinations, presenting duplicates as
/// one logical job after verifying their volume digests agree.
pub fn collect_mirrored(
    destinations: &[Destination],
    retry: &RetryPolicy,
    shutdown: Option<&AtomicBool>,
) -> Result<Vec<JobInfo>> {
    let mut merged: Vec<JobInfo> = Vec::new();
    for dest in destinations {
        for info in collect_manifests(dest, retry, shutdown)? {
            match merged.iter().find(|existing| existing.same_job(&info)) {
                Some(existing) => {
                    if !existing.digests_agree(&info) {
                        return Err(ZbackError::IntegrityFailure(format!(
                            "mirrored manifests disagree on volume digests for {}",
                            info.base_name("@")
                        )));
                    }
                }
                None => merged.push(info),
            }
        }
    }
    sort_jobs(&mut merged);
    Ok(merged)
}

fn sort_jobs(jobs: &mut [JobInfo]) {
    jobs.sort_by(|a, b| {
        a.volume_name
            .cmp(&b.volume_name)
            .then(a.base_snapshot.creation.cmp(&b.base_snapshot.creation))
            .then(a.base_snapshot.txg.cmp(&b.base_snapshot.txg))
    });
}

/// Apply filters and group jobs by volume name, ordered by `to` snapshot
/// creation within each group.
pub fn group_jobs(jobs: Vec<JobInfo>, filters: &ListFilters) -> Result<BTreeMap<String, Vec<JobInfo>>> {
    let matcher = match &filters.volume_name {
        Some(pattern) => Some(
            Glob::new(pattern)
                .map_err(|e| ZbackError::InvalidInput(format!("bad volume name glob: {e}")))?
                .compile_matcher(),
        ),
        None => None,
    };

    let mut grouped: BTreeMap<String, Vec<JobInfo>> = BTreeMap::new();
    for info in jobs {
        if let Some(ref m) = matcher {
            if !m.is_match(&info.volume_name) {
                continue;
            }
        }
        let created = info.base_snapshot.creation;
        if filters.before.is_some_and(|t| created >= t) {
            continue;
        }
        if filters.after.is_some_and(|t| created <= t) {
            continue;
        }
        grouped.entry(info.volume_name.clone()).or_default().push(info);
    }
    Ok(grouped)
}

/// The `list` operation: collect, filter, group, render to the injected
/// sink (plain text or JSON).
pub fn run(
    destinations: &[Destination],
    filters: &ListFilters,
    json: bool,
    out: &mut dyn Write,
    retry: &RetryPolicy,
    shutdown: Option<&AtomicBool>,
) -> Result<BTreeMap<String, Vec<JobInfo>>> {
    let jobs = collect_mirrored(destinations, retry, shutdown)?;
    let grouped = group_jobs(jobs, filters)?;

    if json {
        serde_json::to_writer(&mut *out, &grouped)?;
        writeln!(out)?;
    } else {
        for (volume, jobs) in &grouped {
            writeln!(out, "{volume}:")?;
            for info in jobs {
                let from = info
                    .parent_snapshot
                    .as_ref()
                    .map(|p| p.full_name())
                    .unwrap_or_else(|| "(full)".to_string());
                writeln!(
                    out,
                    "  {from} -> {}  volumes={}  created={}",
                    info.base_snapshot.full_name(),
                    info.volumes.len(),
                    info.base_snapshot.creation.format("%Y-%m-%dT%H:%M:%S"),
                )?;
            }
        }
    }

    Ok(grouped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::testutil::job;
    use chrono::Duration;

    fn sample_jobs() -> Vec<JobInfo> {
        vec![
            job("tank/data", None, "a", 1),
            job("tank/data", Some("a"), "b", 2),
            job("tank/data", Some("b"), "c", 3),
        ]
    }

    #[test]
    fn groups_in_creation_order() {
        let grouped = group_jobs(sample_jobs(), &ListFilters::default()).unwrap();
        assert_eq!(grouped.len(), 1);
        let names: Vec<&str> = grouped["tank/data"]
            .iter()
            .map(|j| j.base_snapshot.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn volume_name_glob_filters() {
        let exact = ListFilters {
            volume_name: Some("tank/data".into()),
            ..Default::default()
        };
        assert_eq!(group_jobs(sample_jobs(), &exact).unwrap().len(), 1);

        let glob = ListFilters {
            volume_name: Some("t*".into()),
            ..Default::default()
        };
        assert_eq!(group_jobs(sample_jobs(), &glob).unwrap().len(), 1);

        let miss = ListFilters {
            volume_name: Some("v*".into()),
            ..Default::default()
        };
        assert!(group_jobs(sample_jobs(), &miss).unwrap().is_empty());

        // A bare prefix is not a glob match.
        let prefix = ListFilters {
            volume_name: Some("tan".into()),
            ..Default::default()
        };
        assert!(group_jobs(sample_jobs(), &prefix).unwrap().is_empty());
    }

    #[test]
    fn time_filters_are_monotone() {
        let jobs = sample_jobs();
        let newest = jobs
            .iter()
            .map(|j| j.base_snapshot.creation)
            .max()
            .unwrap();

        let all = ListFilters {
            before: Some(newest + Duration::hours(1)),
            ..Default::default()
        };
        assert_eq!(group_jobs(jobs.clone(), &all).unwrap()["tank/data"].len(), 3);

        let none = ListFilters {
            before: Some(newest - Duration::hours(24)),
            ..Default::default()
        };
        assert!(group_jobs(jobs.clone(), &none).unwrap().is_empty());

        // after T1 ⊇ after T2 when T1 <= T2
        let t2 = newest;
        let t1 = newest - Duration::hours(24);
        let after_t1 = group_jobs(
            jobs.clone(),
            &ListFilters {
                after: Some(t1),
                ..Default::default()
            },
        )
        .unwrap();
        let after_t2 = group_jobs(
            jobs,
            &ListFilters {
                after: Some(t2),
                ..Default::default()
            },
        )
        .unwrap();
        let count = |g: &BTreeMap<String, Vec<JobInfo>>| {
            g.values().map(Vec::len).sum::<usize>()
        };
        assert!(count(&after_t1) >= count(&after_t2));
        assert_eq!(count(&after_t1), 3);
        assert_eq!(count(&after_t2), 0);
    }

    #[test]
    fn json_output_is_a_volume_keyed_map() {
        use crate::storage::Destination;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let backend =
            crate::storage::local_backend::LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        let dest = Destination {
            uri: format!("file://{}", dir.path().display()),
            backend: Arc::new(backend),
        };

        // Seed one manifest object.
        let info = job("tank/data", None, "a", 1);
        let bytes = info.to_json().unwrap();
        let mut cursor = std::io::Cursor::new(&bytes);
        dest.backend
            .upload(
                &info.manifest_key("+"),
                &mut cursor,
                bytes.len() as u64,
                None,
            )
            .unwrap();

        let mut out = Vec::new();
        let grouped = run(
            std::slice::from_ref(&dest),
            &ListFilters::default(),
            true,
            &mut out,
            &RetryPolicy::default(),
            None,
        )
        .unwrap();
        assert_eq!(grouped["tank/data"].len(), 1);

        let parsed: BTreeMap<String, Vec<JobInfo>> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["tank/data"][0].base_snapshot.name, "a");
    }

    #[test]
    fn mirrored_digest_disagreement_fails() {
        use crate::manifest::VolumeRecord;
        use crate::storage::Destination;
        use std::sync::Arc;

        let record = |sha: &str| VolumeRecord {
            index: 0,
            raw_size: 10,
            stored_size: 10,
            md5: "m".into(),
            sha256: sha.into(),
        };

        let seed = |sha: &str| -> (tempfile::TempDir, Destination) {
            let dir = tempfile::tempdir().unwrap();
            let backend = crate::storage::local_backend::LocalBackend::new(
                dir.path().to_str().unwrap(),
            )
            .unwrap();
            let dest = Destination {
                uri: format!("file://{}", dir.path().display()),
                backend: Arc::new(backend),
            };
            let mut info = job("tank/data", None, "a", 1);
            info.volumes.push(record(sha));
            let bytes = info.to_json().unwrap();
            let mut cursor = std::io::Cursor::new(&bytes);
            dest.backend
                .upload(&info.manifest_key("+"), &mut cursor, bytes.len() as u64, None)
                .unwrap();
            (dir, dest)
        };

        let (_d1, dest1) = seed("aaaa");
        let (_d2, dest2) = seed("bbbb");
        let dests = vec![dest1, dest2];
        let err = collect_mirrored(&dests, &RetryPolicy::default(), None).unwrap_err();
        assert!(matches!(err, ZbackError::IntegrityFailure(_)));
    }
}

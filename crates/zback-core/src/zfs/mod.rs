use std::io::Read;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use zback_types::snapshot::SnapshotInfo;

use crate::error::{Result, ZbackError};

/// List snapshots and bookmarks of one dataset, oldest first.
pub fn list_snapshots(dataset: &str) -> Result<Vec<SnapshotInfo>> {
    let output = Command::new("zfs")
        .args([
            "list", "-H", "-p", "-d", "1", "-t", "snapshot,bookmark", "-o",
            "name,guid,createtxg,creation", "-s", "createtxg", dataset,
        ])
        .output()
        .map_err(|e| ZbackError::SourceUnavailable(format!("cannot run zfs list: {e}")))?;

    if !output.status.success() {
        return Err(ZbackError::SourceUnavailable(format!(
            "zfs list {dataset} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_listing(&String::from_utf8_lossy(&output.stdout))
}

/// Resolve a parsed reference against the live system, filling in GUID,
/// txg and creation time.
pub fn resolve(reference: &SnapshotInfo) -> Result<SnapshotInfo> {
    let listed = list_snapshots(&reference.dataset)?;
    listed
        .into_iter()
        .find(|s| s.name == reference.name && s.bookmark == reference.bookmark)
        .ok_or_else(|| {
            ZbackError::SourceUnavailable(format!("{} does not exist", reference.full_name()))
        })
}

/// Whether `target` has a snapshot or bookmark with the given short name.
pub fn target_has(target_dataset: &str, name: &str) -> Result<bool> {
    match list_snapshots(target_dataset) {
        Ok(listed) => Ok(listed.iter().any(|s| s.name == name)),
        // A first full receive has no target dataset yet.
        Err(ZbackError::SourceUnavailable(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Parse `zfs list -H -p` tab-separated output.
///
/// Each line: `name<TAB>guid<TAB>createtxg<TAB>creation`, where name is
/// `dataset@snap` or `dataset#bookmark` and creation is Unix seconds.
pub fn parse_listing(text: &str) -> Result<Vec<SnapshotInfo>> {
    let mut out = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 4 {
            return Err(ZbackError::SourceUnavailable(format!(
                "unexpected zfs list line: '{line}'"
            )));
        }
        let mut info = SnapshotInfo::parse(fields[0])
            .map_err(ZbackError::SourceUnavailable)?;
        info.guid = fields[1]
            .parse()
            .map_err(|_| ZbackError::SourceUnavailable(format!("bad guid in '{line}'")))?;
        info.txg = fields[2]
            .parse()
            .map_err(|_| ZbackError::SourceUnavailable(format!("bad createtxg in '{line}'")))?;
        let secs: i64 = fields[3]
            .parse()
            .map_err(|_| ZbackError::SourceUnavailable(format!("bad creation in '{line}'")))?;
        info.creation = DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| {
            ZbackError::SourceUnavailable(format!("creation out of range in '{line}'"))
        })?;
        out.push(info);
    }
    Ok(out)
}

/// A running `zfs send`, its stdout exposed as the stream source.
///
/// The stream is not restartable; it is read exactly once by the splitter.
/// Dropping the handle kills and reaps the child, so an orchestrator bailing
/// with `?` never leaks the subprocess.
pub struct SendStream {
    child: Child,
    stdout: Option<ChildStdout>,
}

impl SendStream {
    pub fn spawn(from: Option<&SnapshotInfo>, to: &SnapshotInfo) -> Result<Self> {
        let mut cmd = Command::new("zfs");
        cmd.arg("send");
        if let Some(from) = from {
            cmd.arg("-i").arg(from.full_name());
        }
        cmd.arg(to.full_name());
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(?cmd, "spawning zfs send");
        let mut child = cmd.spawn().map_err(|e| {
            ZbackError::SourceUnavailable(format!("cannot spawn zfs send: {e}"))
        })?;
        let stdout = child.stdout.take();
        Ok(Self { child, stdout })
    }

    /// The send stream. Panics if taken twice (programming error).
    pub fn take_stdout(&mut self) -> ChildStdout {
        self.stdout.take().expect("send stream already taken")
    }

    /// Wait for the child and surface its stderr on failure. Called after
    /// the splitter has drained stdout to EOF.
    pub fn finish(mut self) -> Result<()> {
        let status = self.child.wait()?;
        if status.success() {
            return Ok(());
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        Err(ZbackError::SourceUnavailable(format!(
            "zfs send exited with {status}: {}",
            stderr.trim()
        )))
    }
}

impl Drop for SendStream {
    fn drop(&mut self) {
        // Normal completion reaps via finish(); this path only runs on error.
        if let Ok(None) = self.child.try_wait() {
            warn!("terminating zfs send");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Options forwarded to `zfs receive`.
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// `-F`: force rollback of the target.
    pub force: bool,
    /// `-o prop=value` pairs.
    pub properties: Vec<(String, String)>,
}

/// A running `zfs receive`, its stdin exposed as the stream sink.
pub struct ReceiveSink {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ReceiveSink {
    pub fn spawn(target: &str, opts: &ReceiveOptions) -> Result<Self> {
        let mut cmd = Command::new("zfs");
        cmd.arg("receive");
        if opts.force {
            cmd.arg("-F");
        }
        for (prop, value) in &opts.properties {
            cmd.arg("-o").arg(format!("{prop}={value}"));
        }
        cmd.arg(target);
        cmd.stdin(Stdio::piped()).stderr(Stdio::piped());

        debug!(?cmd, "spawning zfs receive");
        let mut child = cmd.spawn().map_err(|e| {
            ZbackError::SourceUnavailable(format!("cannot spawn zfs receive: {e}"))
        })?;
        let stdin = child.stdin.take();
        Ok(Self { child, stdin })
    }

    /// The receive sink. Panics if taken twice (programming error).
    pub fn take_stdin(&mut self) -> ChildStdin {
        self.stdin.take().expect("receive sink already taken")
    }

    /// Close stdin (if still held), wait, and surface stderr on failure.
    pub fn finish(mut self) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if status.success() {
            return Ok(());
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        Err(ZbackError::SourceUnavailable(format!(
            "zfs receive exited with {status}: {}",
            stderr.trim()
        )))
    }
}

impl Drop for ReceiveSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Ok(None) = self.child.try_wait() {
            warn!("terminating zfs receive");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

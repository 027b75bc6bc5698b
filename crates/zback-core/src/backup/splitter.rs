use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam_channel::Sender;
use tracing::debug;

use crate::error::{Result, ZbackError};

// ---------------------------------------------------------------------------
// SlotBudget: back-pressure on in-flight volumes
// ---------------------------------------------------------------------------

/// Counting semaphore over volume slots.
///
/// The splitter acquires one slot per volume before reading it off the send
/// stream; the upload scheduler releases the slot once every destination has
/// acknowledged the volume and its temp file is gone. This bounds the job's
/// scratch usage to `capacity × volume_size` and stalls the `zfs send`
/// process instead of spilling without limit.
pub(crate) struct SlotBudget {
    state: Mutex<SlotState>,
    freed: Condvar,
}

struct SlotState {
    available: usize,
    poisoned: bool,
}

impl SlotBudget {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SlotState {
                available: capacity,
                poisoned: false,
            }),
            freed: Condvar::new(),
        }
    }

    /// Block until a slot is free. Returns `Err` once poisoned.
    pub(crate) fn acquire(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.poisoned {
                return Err(ZbackError::Interrupted);
            }
            if st.available > 0 {
                st.available -= 1;
                return Ok(());
            }
            st = self.freed.wait(st).unwrap();
        }
    }

    pub(crate) fn release(&self) {
        let mut st = self.state.lock().unwrap();
        st.available += 1;
        self.freed.notify_all();
    }

    /// Wake all blocked acquirers with an error; used on job failure and
    /// cancellation so the splitter never blocks forever.
    pub(crate) fn poison(&self) {
        let mut st = self.state.lock().unwrap();
        st.poisoned = true;
        self.freed.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Splitter
// ---------------------------------------------------------------------------

/// A sealed chunk of the send stream, spilled to the working directory.
#[derive(Debug)]
pub(crate) struct RawVolume {
    pub index: u64,
    pub raw_size: u64,
    pub path: PathBuf,
}

/// Spill file name for volume `index` of job `job_tag`.
pub(crate) fn spill_path(working_dir: &Path, job_tag: &str, index: u64) -> PathBuf {
    working_dir.join(format!("{job_tag}.v{index}.spill"))
}

const READ_CHUNK: usize = 256 * 1024;

/// Read the unbounded send stream into numbered fixed-size volumes.
///
/// Volume order is strict: volume N is sealed and offered downstream before
/// volume N+1 is started. The stream itself is not restartable, which is why
/// every byte lands in a spill file before any transformation touches it.
/// Returns the number of volumes produced.
pub(crate) fn run_splitter(
    mut source: impl Read,
    working_dir: &Path,
    job_tag: &str,
    volume_size: u64,
    budget: &SlotBudget,
    out: Sender<RawVolume>,
    shutdown: &AtomicBool,
) -> Result<u64> {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut index: u64 = 0;
    let mut current: Option<(File, PathBuf, u64)> = None;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            if let Some((_, path, _)) = current.take() {
                let _ = std::fs::remove_file(path);
            }
            return Err(ZbackError::Interrupted);
        }

        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }

        let mut offset = 0;
        while offset < n {
            if current.is_none() {
                // New volume: take a slot first so back-pressure reaches
                // the producer before another spill file appears.
                budget.acquire()?;
                let path = spill_path(working_dir, job_tag, index);
                let file = File::create(&path)?;
                current = Some((file, path, 0));
            }
            let (file, _, written) = current.as_mut().unwrap();

            let room = (volume_size - *written) as usize;
            let take = room.min(n - offset);
            file.write_all(&buf[offset..offset + take])?;
            *written += take as u64;
            offset += take;

            if *written == volume_size {
                let (file, path, written) = current.take().unwrap();
                drop(file);
                seal(&out, index, written, path)?;
                index += 1;
            }
        }
    }

    // A short final volume is normal; an empty stream is not.
    if let Some((file, path, written)) = current.take() {
        drop(file);
        seal(&out, index, written, path)?;
        index += 1;
    }
    if index == 0 {
        return Err(ZbackError::SourceUnavailable(
            "send stream was empty".into(),
        ));
    }

    debug!("splitter produced {index} volume(s)");
    Ok(index)
}

fn seal(out: &Sender<RawVolume>, index: u64, raw_size: u64, path: PathBuf) -> Result<()> {
    debug!("sealed volume {index} ({raw_size} bytes)");
    out.send(RawVolume {
        index,
        raw_size,
        path,
    })
    .map_err(|_| ZbackError::Interrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn run_collect(data: &[u8], volume_size: u64, slots: usize) -> Vec<RawVolume> {
        let dir = tempfile::tempdir().unwrap();
        let budget = SlotBudget::new(slots);
        let shutdown = AtomicBool::new(false);
        let (tx, rx) = crossbeam_channel::unbounded();

        let count = run_splitter(
            std::io::Cursor::new(data.to_vec()),
            dir.path(),
            "test-job",
            volume_size,
            &budget,
            tx,
            &shutdown,
        )
        .unwrap();

        let volumes: Vec<RawVolume> = rx.into_iter().collect();
        assert_eq!(volumes.len() as u64, count);
        // Hold the tempdir until files were checked.
        for v in &volumes {
            assert!(v.path.exists(), "spill file for volume {} missing", v.index);
            budget.release();
        }
        std::mem::drop(dir);
        volumes
    }

    #[test]
    fn splits_into_ordered_fixed_volumes() {
        let data = vec![0xABu8; 1000];
        let volumes = run_collect(&data, 256, 8);
        assert_eq!(volumes.len(), 4);
        for (i, v) in volumes.iter().enumerate() {
            assert_eq!(v.index, i as u64);
        }
        assert_eq!(
            volumes.iter().map(|v| v.raw_size).collect::<Vec<_>>(),
            vec![256, 256, 256, 232]
        );
    }

    #[test]
    fn exact_multiple_produces_no_empty_tail() {
        let data = vec![1u8; 512];
        let volumes = run_collect(&data, 256, 8);
        assert_eq!(volumes.len(), 2);
        assert!(volumes.iter().all(|v| v.raw_size == 256));
    }

    #[test]
    fn single_short_volume() {
        let volumes = run_collect(b"tiny", 256, 8);
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].raw_size, 4);
    }

    #[test]
    fn spill_contents_concatenate_to_the_stream() {
        let data: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        let mut reassembled = Vec::new();
        let dir = tempfile::tempdir().unwrap();
        let budget = SlotBudget::new(8);
        let shutdown = AtomicBool::new(false);
        let (tx, rx) = crossbeam_channel::unbounded();
        run_splitter(
            std::io::Cursor::new(data.clone()),
            dir.path(),
            "test-job",
            256,
            &budget,
            tx,
            &shutdown,
        )
        .unwrap();
        for v in rx.into_iter() {
            reassembled.extend_from_slice(&std::fs::read(&v.path).unwrap());
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn empty_stream_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let budget = SlotBudget::new(2);
        let shutdown = AtomicBool::new(false);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = run_splitter(
            std::io::Cursor::new(Vec::new()),
            dir.path(),
            "test-job",
            256,
            &budget,
            tx,
            &shutdown,
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn shutdown_interrupts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let budget = SlotBudget::new(8);
        let shutdown = AtomicBool::new(true);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = run_splitter(
            std::io::Cursor::new(vec![0u8; 1024]),
            dir.path(),
            "test-job",
            256,
            &budget,
            tx,
            &shutdown,
        )
        .unwrap_err();
        assert!(matches!(err, ZbackError::Interrupted));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn budget_blocks_the_splitter_until_released() {
        use std::sync::Arc;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let budget = Arc::new(SlotBudget::new(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::unbounded();

        let dir_path = dir.path().to_path_buf();
        let budget2 = Arc::clone(&budget);
        let shutdown2 = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            run_splitter(
                std::io::Cursor::new(vec![0u8; 1024]),
                &dir_path,
                "test-job",
                256,
                &budget2,
                tx,
                &shutdown2,
            )
        });

        // With one slot, only the first volume can be in flight.
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.index, 0);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        // Releasing slots lets the splitter finish.
        for _ in 0..8 {
            budget.release();
        }
        let produced = handle.join().unwrap().unwrap();
        assert_eq!(produced, 4);
    }

    #[test]
    fn poisoned_budget_fails_the_splitter() {
        let dir = tempfile::tempdir().unwrap();
        let budget = SlotBudget::new(1);
        budget.acquire().unwrap();
        budget.poison();
        let shutdown = AtomicBool::new(false);
        let (tx, _rx) = crossbeam_channel::unbounded();
        let err = run_splitter(
            std::io::Cursor::new(vec![0u8; 1024]),
            dir.path(),
            "test-job",
            256,
            &budget,
            tx,
            &shutdown,
        )
        .unwrap_err();
        assert!(matches!(err, ZbackError::Interrupted));
    }
}

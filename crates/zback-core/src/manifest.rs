use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use zback_types::snapshot::SnapshotInfo;

use crate::compress::Compressor;
use crate::crypto::PGP_EXTENSION;
use crate::error::{Result, ZbackError};

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_SUFFIX: &str = ".manifest";

/// One uploaded chunk of the send stream.
///
/// Object keys are not stored here: they are rebuilt from the job identity,
/// the index and the configured separator, which must never leak into the
/// manifest itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub index: u64,
    /// Bytes of raw send stream in this volume.
    pub raw_size: u64,
    /// Bytes actually uploaded, after compression and encryption.
    pub stored_size: u64,
    /// MD5 of the uploaded payload (hex). What a backend with server-side
    /// verification echoes back.
    pub md5: String,
    /// SHA-256 of the uploaded payload (hex). End-to-end integrity record,
    /// independent of backend trust.
    pub sha256: String,
}

/// The complete description of one backup job: the manifest document.
///
/// Serialized as versioned JSON; the manifest object is the last object
/// written to a destination, so its presence is the commit marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub version: u32,
    /// Source dataset, e.g. `tank/data`.
    pub volume_name: String,
    /// The snapshot this job captured (the `to` side of the stream).
    pub base_snapshot: SnapshotInfo,
    /// Incremental parent (the `from` side); `None` for a full backup.
    #[serde(default)]
    pub parent_snapshot: Option<SnapshotInfo>,
    /// Compressor id (`gzip`, `zstd`, ...; `none` for identity).
    pub compressor: String,
    /// OpenPGP recipients volumes were encrypted to; empty when plaintext.
    #[serde(default)]
    pub encrypt_to: Vec<String>,
    /// OpenPGP identity volumes were signed by.
    #[serde(default)]
    pub sign_from: Option<String>,
    /// Volume size policy the splitter used, in bytes.
    pub volume_size: u64,
    pub volumes: Vec<VolumeRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInfo {
    pub fn new(
        dataset: &str,
        base: SnapshotInfo,
        parent: Option<SnapshotInfo>,
        compressor: Compressor,
        encrypt_to: Vec<String>,
        sign_from: Option<String>,
        volume_size: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            volume_name: dataset.to_string(),
            base_snapshot: base,
            parent_snapshot: parent,
            compressor: compressor.id().to_string(),
            encrypt_to,
            sign_from,
            volume_size,
            volumes: Vec::new(),
            started_at,
            finished_at: None,
        }
    }

    pub fn encrypted(&self) -> bool {
        !self.encrypt_to.is_empty()
    }

    pub fn signed(&self) -> bool {
        self.sign_from.is_some()
    }

    /// Extension shared by all volume objects of this job.
    pub fn extension(&self) -> String {
        let codec_ext = match self.compressor.as_str() {
            "none" => "",
            "gzip" => ".gz",
            "xz" => ".xz",
            "zstd" => ".zst",
            "lz4" => ".lz4",
            _ => "",
        };
        if self.encrypted() || self.signed() {
            format!("{codec_ext}{PGP_EXTENSION}")
        } else {
            codec_ext.to_string()
        }
    }

    /// Base object name: `volume|from|to` (separator configurable; `from`
    /// empty for a full backup).
    pub fn base_name(&self, separator: &str) -> String {
        let from = self
            .parent_snapshot
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or("");
        format!(
            "{}{separator}{from}{separator}{}",
            self.volume_name, self.base_snapshot.name
        )
    }

    pub fn manifest_key(&self, separator: &str) -> String {
        format!("{}{MANIFEST_SUFFIX}", self.base_name(separator))
    }

    pub fn volume_key(&self, separator: &str, index: u64) -> String {
        format!(
            "{}{separator}{index}{}",
            self.base_name(separator),
            self.extension()
        )
    }

    /// Same logical job: same source, same delta endpoints (by GUID).
    pub fn same_job(&self, other: &JobInfo) -> bool {
        self.volume_name == other.volume_name
            && self.base_snapshot.guid == other.base_snapshot.guid
            && self.parent_snapshot.as_ref().map(|p| p.guid)
                == other.parent_snapshot.as_ref().map(|p| p.guid)
    }

    /// Duplicate manifests must agree on every volume digest.
    pub fn digests_agree(&self, other: &JobInfo) -> bool {
        self.volumes.len() == other.volumes.len()
            && self
                .volumes
                .iter()
                .zip(&other.volumes)
                .all(|(a, b)| a.sha256 == b.sha256 && a.md5 == b.md5)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        // Peek at the version tag before trusting the rest of the shape.
        #[derive(Deserialize)]
        struct VersionProbe {
            version: u32,
        }
        let probe: VersionProbe = serde_json::from_slice(data)?;
        if probe.version != MANIFEST_VERSION {
            return Err(ZbackError::UnsupportedVersion(probe.version));
        }
        Ok(serde_json::from_slice(data)?)
    }
}

/// Whether an object key names a manifest.
pub fn is_manifest_key(key: &str) -> bool {
    key.ends_with(MANIFEST_SUFFIX)
}

/// Current time at the manifest's one-second resolution.
pub fn utc_now_secs() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(0).unwrap_or(now)
}

use std::path::PathBuf;
use std::time::Duration;

use crate::compress::Compressor;
use crate::error::{Result, ZbackError};
use crate::retry::RetryPolicy;

/// Default volume size: 200 MiB.
pub const DEFAULT_VOLUME_SIZE: u64 = 200 * 1024 * 1024;

/// Default number of volumes allowed in flight (splitter back-pressure).
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Default per-destination upload parallelism cap.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Default per-request backend timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Job-level outcome policy when one destination fails after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Abort the whole job on the first destination that fails permanently.
    #[default]
    FailFast,
    /// Finish the remaining destinations and report the failure in the
    /// exit summary. Failed destinations receive no manifest.
    ContinueOthers,
}

impl FailurePolicy {
    pub fn from_flag(raw: &str) -> Result<Self> {
        match raw {
            "fail-fast" => Ok(FailurePolicy::FailFast),
            "continue-others" => Ok(FailurePolicy::ContinueOthers),
            other => Err(ZbackError::InvalidInput(format!(
                "unknown failure policy '{other}' (expected fail-fast or continue-others)"
            ))),
        }
    }
}

/// OpenPGP keyring selection for a job.
#[derive(Debug, Clone, Default)]
pub struct CryptoOptions {
    pub public_keyring: Option<PathBuf>,
    pub secret_keyring: Option<PathBuf>,
    /// Recipients the volumes are encrypted to (public keys).
    pub encrypt_to: Vec<String>,
    /// Identity the volumes are signed by (secret key).
    pub sign_from: Option<String>,
}

impl CryptoOptions {
    pub fn enabled(&self) -> bool {
        !self.encrypt_to.is_empty() || self.sign_from.is_some()
    }
}

/// Everything a backup/restore/list run needs beyond its positional
/// arguments. The CLI layer populates this from flags; tests construct it
/// directly.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Scratch space for volume spill files.
    pub working_dir: PathBuf,
    /// Object-key separator. Appears only in object keys, never inside
    /// manifests. Some backends reserve `|` (Azurite, for one), so this is
    /// configurable.
    pub separator: String,
    pub volume_size: u64,
    pub max_in_flight: usize,
    /// Per-destination upload/download parallelism; each backend's own hint
    /// caps this further.
    pub max_parallel: usize,
    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    pub request_timeout: Duration,
    pub compressor: Compressor,
    pub crypto: CryptoOptions,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            working_dir: std::env::temp_dir(),
            separator: "|".to_string(),
            volume_size: DEFAULT_VOLUME_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_parallel: DEFAULT_MAX_PARALLEL,
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            compressor: Compressor::default(),
            crypto: CryptoOptions::default(),
        }
    }
}

impl JobOptions {
    /// Validate option combinations that must fail before any side effect.
    pub fn validate(&self) -> Result<()> {
        if self.separator.is_empty() {
            return Err(ZbackError::InvalidInput("separator must not be empty".into()));
        }
        if self.volume_size == 0 {
            return Err(ZbackError::InvalidInput("volume size must be non-zero".into()));
        }
        if self.max_in_flight == 0 || self.max_parallel == 0 {
            return Err(ZbackError::InvalidInput(
                "parallelism limits must be non-zero".into(),
            ));
        }
        if !self.crypto.encrypt_to.is_empty() && self.crypto.public_keyring.is_none() {
            return Err(ZbackError::InvalidInput(
                "--encrypt-to requires a public keyring".into(),
            ));
        }
        if self.crypto.sign_from.is_some() && self.crypto.secret_keyring.is_none() {
            return Err(ZbackError::InvalidInput(
                "--sign-from requires a secret keyring".into(),
            ));
        }
        Ok(())
    }
}

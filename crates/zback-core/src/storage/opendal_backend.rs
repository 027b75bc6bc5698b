use std::io::Read;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use opendal::{BlockingOperator, Operator};

use crate::error::{Result, ZbackError};
use crate::storage::{Backend, ObjectInfo};

/// Tokio runtime bridging async-implemented OpenDAL services into the
/// thread-based pipeline. Created lazily on first use.
static ASYNC_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to create tokio runtime for blocking storage layer")
});

/// Adapter over OpenDAL services: `azure://`, `gs://`, `b2://`, `ssh://`.
///
/// One adapter per scheme would add nothing; OpenDAL already normalizes
/// these SDKs behind a single operator; this type only wires credentials
/// from the environment and maps errors onto the shared taxonomy.
#[derive(Debug)]
pub struct OpendalBackend {
    op: BlockingOperator,
    label: &'static str,
    parallel: usize,
}

impl OpendalBackend {
    /// Azure Blob Storage. Credentials: `AZURE_ACCOUNT_NAME`,
    /// `AZURE_ACCOUNT_KEY`; `AZURE_CUSTOM_ENDPOINT` redirects to an
    /// emulator such as Azurite.
    pub fn azure(container: &str, prefix: &str) -> Result<Self> {
        let account_name = require_env("AZURE_ACCOUNT_NAME", "azure://")?;
        let account_key = require_env("AZURE_ACCOUNT_KEY", "azure://")?;

        let mut builder = opendal::services::Azblob::default()
            .container(container)
            .root(&rooted(prefix))
            .account_name(&account_name)
            .account_key(&account_key);
        if let Ok(endpoint) = std::env::var("AZURE_CUSTOM_ENDPOINT") {
            if !endpoint.is_empty() {
                builder = builder.endpoint(&endpoint);
            }
        }
        Self::finish(Operator::new(builder), "azure", 4)
    }

    /// Google Cloud Storage. Credentials resolve through
    /// `GOOGLE_APPLICATION_CREDENTIALS` (service account JSON).
    pub fn gcs(bucket: &str, prefix: &str) -> Result<Self> {
        let builder = opendal::services::Gcs::default()
            .bucket(bucket)
            .root(&rooted(prefix));
        Self::finish(Operator::new(builder), "gs", 4)
    }

    /// Backblaze B2. Credentials: `B2_ACCOUNT_ID`, `B2_ACCOUNT_KEY`,
    /// `B2_BUCKET_ID`.
    pub fn b2(bucket: &str, prefix: &str) -> Result<Self> {
        let key_id = require_env("B2_ACCOUNT_ID", "b2://")?;
        let key = require_env("B2_ACCOUNT_KEY", "b2://")?;
        let bucket_id = require_env("B2_BUCKET_ID", "b2://")?;

        let builder = opendal::services::B2::default()
            .bucket(bucket)
            .bucket_id(&bucket_id)
            .application_key_id(&key_id)
            .application_key(&key)
            .root(&rooted(prefix));
        Self::finish(Operator::new(builder), "b2", 2)
    }

    /// SFTP over `ssh://user@host[:port]/path`. Key auth only, via
    /// `ZBACK_SSH_KEY` (defaults to the agent / `~/.ssh` resolution the
    /// service performs itself).
    pub fn sftp(authority: &str, prefix: &str) -> Result<Self> {
        let (user, host) = match authority.split_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, authority),
        };

        let mut builder = opendal::services::Sftp::default()
            .endpoint(&format!("ssh://{host}"))
            .root(&format!("/{}", prefix.trim_matches('/')));
        if let Some(user) = user {
            builder = builder.user(user);
        }
        if let Ok(key) = std::env::var("ZBACK_SSH_KEY") {
            if !key.is_empty() {
                builder = builder.key(&key);
            }
        }
        Self::finish(Operator::new(builder), "ssh", 2)
    }

    fn finish<B: opendal::raw::Access>(
        op: std::result::Result<opendal::OperatorBuilder<B>, opendal::Error>,
        label: &'static str,
        parallel: usize,
    ) -> Result<Self> {
        let _guard = ASYNC_RUNTIME.enter();
        let op = op
            .map_err(|e| ZbackError::InvalidInput(format!("{label} backend init: {e}")))?
            .finish()
            .blocking();
        Ok(Self {
            op,
            label,
            parallel,
        })
    }

    fn classify(&self, op_name: &str, key: &str, e: opendal::Error) -> ZbackError {
        if e.kind() == opendal::ErrorKind::NotFound {
            return ZbackError::NotFound(key.to_string());
        }
        if e.kind() == opendal::ErrorKind::PermissionDenied {
            return ZbackError::AuthDenied(format!("{} {op_name} {key}: {e}", self.label));
        }
        if e.is_temporary() {
            ZbackError::transient(format!("{} {op_name} {key}: {e}", self.label))
        } else {
            ZbackError::permanent(format!("{} {op_name} {key}: {e}", self.label))
        }
    }
}

/// OpenDAL roots are absolute `/`-prefixed paths.
fn rooted(prefix: &str) -> String {
    format!("/{}", prefix.trim_matches('/'))
}

const COPY_CHUNK: usize = 8 * 1024 * 1024;

impl Backend for OpendalBackend {
    fn upload(
        &self,
        key: &str,
        reader: &mut dyn Read,
        _len: u64,
        _content_md5: Option<&[u8; 16]>,
    ) -> Result<()> {
        let _guard = ASYNC_RUNTIME.enter();
        let mut writer = self
            .op
            .writer(key)
            .map_err(|e| self.classify("PUT", key, e))?;

        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer
                .write(buf[..n].to_vec())
                .map_err(|e| self.classify("PUT", key, e))?;
        }
        writer.close().map_err(|e| self.classify("PUT", key, e))?;
        Ok(())
    }

    fn download(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let _guard = ASYNC_RUNTIME.enter();
        let buf = self
            .op
            .read(key)
            .map_err(|e| self.classify("GET", key, e))?;
        Ok(Box::new(std::io::Cursor::new(buf.to_vec())))
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let _guard = ASYNC_RUNTIME.enter();
        let entries = self
            .op
            .list_with(prefix)
            .recursive(true)
            .call()
            .map_err(|e| self.classify("LIST", prefix, e))?;

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = entry.path().to_string();
            if path.ends_with('/') {
                continue;
            }
            let meta = self
                .op
                .stat(&path)
                .map_err(|e| self.classify("STAT", &path, e))?;
            out.push(ObjectInfo {
                key: path,
                size: meta.content_length(),
                modified: meta
                    .last_modified()
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        let _guard = ASYNC_RUNTIME.enter();
        for key in keys {
            match self.op.delete(key) {
                Ok(()) => {}
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
                Err(e) => return Err(self.classify("DELETE", key, e)),
            }
        }
        Ok(())
    }

    fn max_parallel_uploads(&self) -> usize {
        self.parallel
    }
}

fn require_env(name: &str, scheme: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ZbackError::InvalidInput(format!(
            "{scheme} destinations require the {name} environment variable"
        ))),
    }
}

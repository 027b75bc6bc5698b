pub mod local_backend;
pub mod opendal_backend;
pub mod s3_backend;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{Result, ZbackError};

/// One listed object at a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Abstract object store holding volumes and manifests.
///
/// Keys are `/`-free apart from the dataset path embedded in them; the
/// configured prefix is applied by the adapter, not the caller. Contracts:
/// uploads return only after the object is durably committed, and replaying
/// an upload of the same key overwrites idempotently. Backends do not retry;
/// every error carries its classification and the callers' shared retry
/// policy decides.
pub trait Backend: Send + Sync {
    /// Stream one object up. `len` is known (volumes are staged on disk
    /// first); `content_md5` is passed to backends that verify server-side.
    fn upload(
        &self,
        key: &str,
        reader: &mut dyn Read,
        len: u64,
        content_md5: Option<&[u8; 16]>,
    ) -> Result<()>;

    /// Stream one object down. `NotFound` if the key does not exist.
    fn download(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// List objects under a key prefix.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Delete objects. Missing keys are not an error.
    fn delete(&self, keys: &[String]) -> Result<()>;

    /// Upper bound on useful concurrent uploads to this backend.
    fn max_parallel_uploads(&self) -> usize {
        4
    }

    /// Whether `content_md5` is verified server-side on upload.
    fn supports_md5(&self) -> bool {
        false
    }
}

/// A resolved destination: its original URI (for messages and manifests of
/// partial failure) plus the live adapter.
#[derive(Clone)]
pub struct Destination {
    pub uri: String,
    pub backend: Arc<dyn Backend>,
}

/// URI scheme selecting a backend adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Aws,
    Azure,
    Gcs,
    B2,
    File,
    Ssh,
}

/// Parsed `scheme://container[/prefix]` destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDestination {
    pub scheme: Scheme,
    /// Bucket / container name; for `file://` the root directory, for
    /// `ssh://` the `user@host[:port]` part.
    pub container: String,
    /// Key prefix under the container; empty for none.
    pub prefix: String,
}

/// Split a comma-separated destination list.
pub fn split_destinations(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse one destination URI.
pub fn parse_destination(raw: &str) -> Result<ParsedDestination> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ZbackError::InvalidInput(
            "destination must not be empty".into(),
        ));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| ZbackError::InvalidInput(format!("invalid destination '{trimmed}': {e}")))?;

    let scheme = match url.scheme() {
        "aws" | "s3" => Scheme::Aws,
        "azure" => Scheme::Azure,
        "gs" => Scheme::Gcs,
        "b2" => Scheme::B2,
        "file" => Scheme::File,
        "ssh" => Scheme::Ssh,
        other => {
            return Err(ZbackError::UnsupportedBackend(format!(
                "unsupported destination scheme: '{other}'"
            )))
        }
    };

    if scheme == Scheme::File {
        let path = url.path();
        if path.is_empty() || path == "/" {
            return Err(ZbackError::InvalidInput(
                "file:// destination has an empty path".into(),
            ));
        }
        return Ok(ParsedDestination {
            scheme,
            container: path.to_string(),
            prefix: String::new(),
        });
    }

    if scheme == Scheme::Ssh {
        let host = url.host_str().ok_or_else(|| {
            ZbackError::InvalidInput(format!("'{trimmed}' is missing a host"))
        })?;
        let mut container = String::new();
        if !url.username().is_empty() {
            container.push_str(url.username());
            container.push('@');
        }
        container.push_str(host);
        if let Some(port) = url.port() {
            container.push_str(&format!(":{port}"));
        }
        return Ok(ParsedDestination {
            scheme,
            container,
            prefix: url.path().trim_matches('/').to_string(),
        });
    }

    let container = url.host_str().ok_or_else(|| {
        ZbackError::InvalidInput(format!("'{trimmed}' is missing a bucket or container"))
    })?;

    Ok(ParsedDestination {
        scheme,
        container: container.to_string(),
        prefix: url.path().trim_matches('/').to_string(),
    })
}

/// Build the live adapter for one destination URI. Credentials come from
/// per-backend environment variables.
pub fn open_destination(raw: &str, request_timeout: Duration) -> Result<Destination> {
    let parsed = parse_destination(raw)?;
    let backend: Arc<dyn Backend> = match parsed.scheme {
        Scheme::File => Arc::new(local_backend::LocalBackend::new(&parsed.container)?),
        Scheme::Aws => Arc::new(s3_backend::S3Backend::from_env(
            &parsed.container,
            &parsed.prefix,
            request_timeout,
        )?),
        Scheme::Azure => Arc::new(opendal_backend::OpendalBackend::azure(
            &parsed.container,
            &parsed.prefix,
        )?),
        Scheme::Gcs => Arc::new(opendal_backend::OpendalBackend::gcs(
            &parsed.container,
            &parsed.prefix,
        )?),
        Scheme::B2 => Arc::new(opendal_backend::OpendalBackend::b2(
            &parsed.container,
            &parsed.prefix,
        )?),
        Scheme::Ssh => Arc::new(opendal_backend::OpendalBackend::sftp(
            &parsed.container,
            &parsed.prefix,
        )?),
    };
    Ok(Destination {
        uri: raw.trim().to_string(),
        backend,
    })
}

/// Open every destination in a comma-separated list, in order.
pub fn open_destinations(raw: &str, request_timeout: Duration) -> Result<Vec<Destination>> {
    let uris = split_destinations(raw);
    if uris.is_empty() {
        return Err(ZbackError::InvalidInput(
            "at least one destination is required".into(),
        ));
    }
    uris.into_iter()
        .map(|uri| open_destination(uri, request_timeout))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_aws_bucket() {
        let parsed = parse_destination("aws://my-bucket").unwrap();
        assert_eq!(
            parsed,
            ParsedDestination {
                scheme: Scheme::Aws,
                container: "my-bucket".into(),
                prefix: String::new(),
            }
        );
    }

    #[test]
    fn parse_aws_bucket_with_prefix() {
        let parsed = parse_destination("aws://my-bucket/backups/zfs").unwrap();
        assert_eq!(parsed.scheme, Scheme::Aws);
        assert_eq!(parsed.container, "my-bucket");
        assert_eq!(parsed.prefix, "backups/zfs");
    }

    #[test]
    fn parse_azure_and_gcs_and_b2() {
        assert_eq!(
            parse_destination("azure://container").unwrap().scheme,
            Scheme::Azure
        );
        assert_eq!(parse_destination("gs://bucket").unwrap().scheme, Scheme::Gcs);
        assert_eq!(parse_destination("b2://bucket").unwrap().scheme, Scheme::B2);
    }

    #[test]
    fn parse_file_path() {
        let parsed = parse_destination("file:///var/backups").unwrap();
        assert_eq!(parsed.scheme, Scheme::File);
        assert_eq!(parsed.container, "/var/backups");
    }

    #[test]
    fn parse_ssh_with_user_and_port() {
        let parsed = parse_destination("ssh://backup@nas.local:2222/pool/backups").unwrap();
        assert_eq!(parsed.scheme, Scheme::Ssh);
        assert_eq!(parsed.container, "backup@nas.local:2222");
        assert_eq!(parsed.prefix, "pool/backups");
    }

    #[test]
    fn parse_rejects_unknown_scheme_and_empty() {
        assert!(matches!(
            parse_destination("ftp://host/path").unwrap_err(),
            ZbackError::UnsupportedBackend(_)
        ));
        assert!(parse_destination("   ").is_err());
        assert!(parse_destination("file:///").is_err());
    }

    #[test]
    fn split_destination_lists() {
        assert_eq!(
            split_destinations("aws://b1,azure://c1"),
            vec!["aws://b1", "azure://c1"]
        );
        assert_eq!(split_destinations("aws://b1"), vec!["aws://b1"]);
        assert_eq!(split_destinations(" aws://b1 , "), vec!["aws://b1"]);
    }
}

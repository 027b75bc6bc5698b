use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a ZFS snapshot or bookmark.
///
/// The GUID is authoritative: it survives renames of both the dataset and
/// the snapshot. Names are kept for humans and for building `zfs` command
/// lines. `txg` is the creation transaction group, used as the sort key for
/// creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Pool-relative dataset path, e.g. `tank/data`.
    pub dataset: String,
    /// Short name after the `@` (snapshot) or `#` (bookmark).
    pub name: String,
    #[serde(default)]
    pub guid: u64,
    /// Creation transaction group.
    #[serde(default)]
    pub txg: u64,
    /// Creation time at one-second resolution.
    pub creation: DateTime<Utc>,
    /// Bookmarks may serve as an incremental source but never as a target.
    #[serde(default)]
    pub bookmark: bool,
}

impl SnapshotInfo {
    /// Parse a `dataset@snapshot` or `dataset#bookmark` reference.
    ///
    /// GUID, txg and creation time are unknown at parse time; they are
    /// filled in from `zfs list` output when the reference is resolved
    /// against a live system.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (sep_idx, bookmark) = match (raw.find('@'), raw.find('#')) {
            (Some(_), Some(_)) => {
                return Err(format!("'{raw}' contains both '@' and '#'"));
            }
            (Some(i), None) => (i, false),
            (None, Some(i)) => (i, true),
            (None, None) => {
                return Err(format!(
                    "'{raw}' is not a snapshot or bookmark reference (expected dataset@snap or dataset#bookmark)"
                ));
            }
        };

        let dataset = &raw[..sep_idx];
        let name = &raw[sep_idx + 1..];
        if dataset.is_empty() {
            return Err(format!("'{raw}' is missing the dataset part"));
        }
        if name.is_empty() {
            return Err(format!("'{raw}' is missing the snapshot name"));
        }

        Ok(SnapshotInfo {
            dataset: dataset.to_string(),
            name: name.to_string(),
            guid: 0,
            txg: 0,
            creation: DateTime::<Utc>::MIN_UTC,
            bookmark,
        })
    }

    /// Parse a reference that must be usable as a send/receive target.
    /// Bookmarks carry no data and are rejected here.
    pub fn parse_target(raw: &str) -> Result<Self, String> {
        let parsed = Self::parse(raw)?;
        if parsed.bookmark {
            return Err(format!(
                "'{raw}' is a bookmark; bookmarks cannot be a target, only an incremental source"
            ));
        }
        Ok(parsed)
    }

    /// Full `dataset@name` / `dataset#name` form for `zfs` command lines.
    pub fn full_name(&self) -> String {
        format!("{}{}{}", self.dataset, self.separator(), self.name)
    }

    fn separator(&self) -> char {
        if self.bookmark {
            '#'
        } else {
            '@'
        }
    }

    /// Same point-in-time image, regardless of names or snapshot/bookmark kind.
    pub fn same_guid(&self, other: &SnapshotInfo) -> bool {
        self.guid != 0 && self.guid == other.guid
    }
}

impl fmt::Display for SnapshotInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_snapshot() {
        let s = SnapshotInfo::parse("tank/data@a").unwrap();
        assert_eq!(s.dataset, "tank/data");
        assert_eq!(s.name, "a");
        assert!(!s.bookmark);
        assert_eq!(s.full_name(), "tank/data@a");
    }

    #[test]
    fn parse_bookmark() {
        let s = SnapshotInfo::parse("tank/data#a").unwrap();
        assert!(s.bookmark);
        assert_eq!(s.full_name(), "tank/data#a");
    }

    #[test]
    fn parse_rejects_bare_dataset() {
        assert!(SnapshotInfo::parse("tank/data").is_err());
    }

    #[test]
    fn parse_rejects_empty_parts() {
        assert!(SnapshotInfo::parse("@a").is_err());
        assert!(SnapshotInfo::parse("tank/data@").is_err());
    }

    #[test]
    fn parse_rejects_mixed_separators() {
        assert!(SnapshotInfo::parse("tank/data@a#b").is_err());
    }

    #[test]
    fn target_rejects_bookmark() {
        assert!(SnapshotInfo::parse_target("tank/data#a").is_err());
        assert!(SnapshotInfo::parse_target("tank/data@a").is_ok());
    }

    #[test]
    fn same_guid_requires_nonzero() {
        let mut a = SnapshotInfo::parse("tank/data@a").unwrap();
        let mut b = SnapshotInfo::parse("tank/data#a").unwrap();
        assert!(!a.same_guid(&b));
        a.guid = 42;
        b.guid = 42;
        assert!(a.same_guid(&b));
    }
}

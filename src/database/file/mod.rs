//! The on-disk database file.
//!
//! The whole database is serialized after every successful update cycle and
//! read back at startup. The format is versioned; a file that fails the
//! version check, fails to parse, or fails per-list checksum revalidation
//! is ignored wholesale, leaving the database empty and forcing a fresh
//! fetch.

use std::io;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util;

use super::Snapshot;

pub mod v1;

//----------- Spec -------------------------------------------------------------

/// A database file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "version")]
pub enum Spec {
    /// The version 1 format.
    V1(v1::Spec),
}

//--- Conversion

impl Spec {
    /// Parse into an in-memory snapshot, revalidating every list.
    pub fn parse(self) -> Result<Snapshot, String> {
        match self {
            Self::V1(spec) => spec.parse(),
        }
    }

    /// Build from an in-memory snapshot.
    pub fn build(snapshot: &Snapshot) -> Self {
        Self::V1(v1::Spec::build(snapshot))
    }
}

//----------- Loading and storing ----------------------------------------------

/// Load and validate the database file, if there is one.
pub fn load(path: &Utf8Path) -> Option<Snapshot> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!("could not read database file {path}: {err}");
            return None;
        }
    };
    let spec: Spec = match serde_json::from_slice(&data) {
        Ok(spec) => spec,
        Err(err) => {
            warn!("ignoring malformed database file {path}: {err}");
            return None;
        }
    };
    match spec.parse() {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!("ignoring invalid database file {path}: {err}");
            None
        }
    }
}

/// Atomically persist the database file.
pub fn store(path: &Utf8Path, snapshot: &Snapshot) -> io::Result<()> {
    let data = serde_json::to_vec(&Spec::build(snapshot)).map_err(io::Error::other)?;
    util::write_file(path, &data)
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use jiff::Timestamp;

    use crate::database::{PrefixSet, Snapshot, ThreatList};
    use crate::hash::{Checksum, HashPrefix};
    use crate::threat::ThreatType;

    use super::{load, store, Spec};

    fn sample_snapshot() -> Snapshot {
        let prefixes = vec![
            HashPrefix::new(Bytes::from_static(b"aaaa")).unwrap(),
            HashPrefix::new(Bytes::from_static(b"bbbbbbbb")).unwrap(),
        ];
        let mut checksum = Checksum::new();
        for prefix in &prefixes {
            checksum.update(prefix.as_bytes());
        }
        let mut lists = foldhash::HashMap::default();
        lists.insert(
            ThreatType::Malware,
            ThreatList {
                prefixes: PrefixSet::from_sorted(prefixes),
                version_token: Bytes::from_static(b"token"),
                checksum: Bytes::copy_from_slice(&checksum.finish()),
                last_update: Timestamp::UNIX_EPOCH,
                corrupt: false,
            },
        );
        Snapshot {
            lists,
            last_update: Some(Timestamp::UNIX_EPOCH),
        }
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("db.json")).unwrap();

        let snapshot = sample_snapshot();
        store(&path, &snapshot).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.last_update, snapshot.last_update);
        let list = &loaded.lists[&ThreatType::Malware];
        let original = &snapshot.lists[&ThreatType::Malware];
        assert_eq!(list.version_token, original.version_token);
        assert_eq!(list.checksum, original.checksum);
        assert_eq!(
            list.prefixes.iter().collect::<Vec<_>>(),
            original.prefixes.iter().collect::<Vec<_>>(),
        );
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("db.json")).unwrap();
        assert!(load(&path).is_none());
    }

    #[test]
    fn corrupted_checksum_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("db.json")).unwrap();

        let mut snapshot = sample_snapshot();
        let list = snapshot.lists.get_mut(&ThreatType::Malware).unwrap();
        list.checksum = Bytes::from_static(&[0; 32]);
        store(&path, &snapshot).unwrap();

        assert!(load(&path).is_none());
    }

    #[test]
    fn unknown_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("db.json")).unwrap();

        let mut value = serde_json::to_value(Spec::build(&sample_snapshot())).unwrap();
        value["version"] = "v9".into();
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        assert!(load(&path).is_none());
    }
}

//! Version 1 of the database file.

use bytes::Bytes;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;

use crate::database::{PrefixSet, Snapshot, ThreatList};
use crate::hash::{Checksum, HashPrefix, FULL_HASH_LEN, MIN_PREFIX_LEN};
use crate::threat::ThreatType;

//----------- Spec -------------------------------------------------------------

/// A database file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Spec {
    /// When the last successful full sync finished.
    pub updated: Timestamp,

    /// The per-list state.
    pub lists: Vec<ListSpec>,
}

/// The persisted state of one threat list.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ListSpec {
    /// The threat type identifying the list.
    pub threat_type: ThreatType,

    /// The opaque server token to echo on the next update.
    #[serde_as(as = "Base64")]
    pub version_token: Vec<u8>,

    /// SHA-256 over the concatenated prefix array.
    #[serde_as(as = "Base64")]
    pub checksum: Vec<u8>,

    /// When the list last updated successfully.
    pub last_update: Timestamp,

    /// The sorted prefix array.
    #[serde_as(as = "Vec<Base64>")]
    pub prefixes: Vec<Vec<u8>>,
}

//--- Conversion

impl Spec {
    /// Parse into an in-memory snapshot.
    ///
    /// Every list is revalidated: prefix lengths and ordering are checked
    /// and the checksum is recomputed. Any failure rejects the whole file.
    pub fn parse(self) -> Result<Snapshot, String> {
        let mut lists = foldhash::HashMap::default();
        for list in self.lists {
            let threat_type = list.threat_type;
            if threat_type == ThreatType::Unspecified {
                return Err("unrecognized threat type".to_string());
            }

            let mut checksum = Checksum::new();
            let mut prefixes = Vec::with_capacity(list.prefixes.len());
            for raw in list.prefixes {
                if !(MIN_PREFIX_LEN..=FULL_HASH_LEN).contains(&raw.len()) {
                    return Err(format!("{threat_type}: invalid prefix length {}", raw.len()));
                }
                checksum.update(&raw);
                prefixes.push(
                    HashPrefix::new(Bytes::from(raw)).expect("the length was validated"),
                );
            }
            if !prefixes.windows(2).all(|pair| pair[0] < pair[1]) {
                return Err(format!("{threat_type}: prefixes are not sorted"));
            }
            if checksum.finish() != *list.checksum {
                return Err(format!("{threat_type}: checksum mismatch"));
            }

            lists.insert(
                threat_type,
                ThreatList {
                    prefixes: PrefixSet::from_sorted(prefixes),
                    version_token: Bytes::from(list.version_token),
                    checksum: Bytes::from(list.checksum),
                    last_update: list.last_update,
                    corrupt: false,
                },
            );
        }

        Ok(Snapshot {
            lists,
            last_update: Some(self.updated),
        })
    }

    /// Build from an in-memory snapshot.
    ///
    /// Corrupt lists are left out; they hold nothing worth restarting from.
    pub fn build(snapshot: &Snapshot) -> Self {
        let mut lists: Vec<ListSpec> = snapshot
            .lists
            .iter()
            .filter(|(_, list)| !list.corrupt)
            .map(|(&threat_type, list)| ListSpec {
                threat_type,
                version_token: list.version_token.to_vec(),
                checksum: list.checksum.to_vec(),
                last_update: list.last_update,
                prefixes: list.prefixes.iter().map(|p| p.as_bytes().to_vec()).collect(),
            })
            .collect();
        lists.sort_by_key(|list| list.threat_type);

        Self {
            updated: snapshot.last_update.unwrap_or(Timestamp::UNIX_EPOCH),
            lists,
        }
    }
}

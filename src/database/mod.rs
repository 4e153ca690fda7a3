//! The local threat list database.
//!
//! The database holds, per subscribed threat list, a sorted array of hash
//! prefixes synchronized from the service through an incremental diff
//! protocol. Lookups run against an immutable snapshot published behind an
//! atomic pointer; the updater builds the successor on the side and swaps
//! it in, so readers never block the writer and never observe a partially
//! applied diff.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use jiff::Timestamp;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{
    Additions, Api, Constraints, ListUpdateRequest, ListUpdateResponse, Removals, ResponseType,
};
use crate::config::Config;
use crate::error::Error;
use crate::hash::{Checksum, FullHash, HashPrefix, FULL_HASH_LEN, MIN_PREFIX_LEN};
use crate::rice;
use crate::threat::ThreatType;

pub mod file;

//----------- Database ---------------------------------------------------------

/// The local blocklist of hash prefixes.
pub struct Database {
    /// The threat lists to keep synchronized.
    threat_lists: Vec<ThreatType>,

    /// The nominal interval between syncs.
    update_period: Duration,

    /// Size constraints echoed on every update request.
    constraints: Constraints,

    /// Where to persist the database, if anywhere.
    db_path: Option<camino::Utf8PathBuf>,

    /// The published snapshot.
    snapshot: ArcSwap<Snapshot>,

    /// Fires once the database first reaches a usable state.
    ready: watch::Sender<bool>,

    /// The deadline of the next scheduled update.
    next_update: Mutex<Option<Timestamp>>,

    /// How long the updater should wait before its first sync.
    initial_delay: Duration,
}

/// One immutable, atomically published view of every threat list.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    /// The per-list state.
    pub lists: foldhash::HashMap<ThreatType, ThreatList>,

    /// When the last successful full sync finished.
    pub last_update: Option<Timestamp>,
}

/// The state of a single threat list.
#[derive(Clone, Debug)]
pub(crate) struct ThreatList {
    /// The sorted prefix array.
    pub prefixes: PrefixSet,

    /// The opaque server token to echo on the next update.
    pub version_token: Bytes,

    /// SHA-256 over the concatenated prefix array.
    pub checksum: Bytes,

    /// When this list last updated successfully.
    pub last_update: Timestamp,

    /// Whether the list failed checksum validation.
    ///
    /// A corrupt list holds no prefixes and no version token, so the next
    /// update requests a full reset.
    pub corrupt: bool,
}

impl Database {
    /// Initialize the database, seeding from the configured file if its
    /// contents validate.
    pub fn new(config: &Config) -> Self {
        let mut snapshot = Snapshot::default();
        if let Some(path) = &config.db_path {
            if let Some(loaded) = file::load(path) {
                info!("loaded threat database from {path}");
                snapshot = loaded;
            }
        }

        let now = Timestamp::now();
        let age = snapshot
            .last_update
            .map(|at| Duration::try_from(now.duration_since(at)).unwrap_or_default());
        let initial_delay = match age {
            Some(age) => config.update_period.saturating_sub(age),
            None => Duration::ZERO,
        };
        let usable = age.is_some_and(|age| age <= 2 * config.update_period);

        Self {
            threat_lists: config.threat_lists.clone(),
            update_period: config.update_period,
            constraints: Constraints {
                max_diff_entries: config.max_diff_entries,
                max_database_entries: config.max_database_entries,
            },
            db_path: config.db_path.clone(),
            snapshot: ArcSwap::from_pointee(snapshot),
            ready: watch::Sender::new(usable),
            next_update: Mutex::new(None),
            initial_delay,
        }
    }

    /// Find the stored prefix matching a full hash.
    ///
    /// Returns the shortest matching prefix across all lists and the threat
    /// type of every list with a match. An empty type list means the hash
    /// is definitely on no subscribed list.
    pub fn lookup(&self, hash: &FullHash) -> (Option<HashPrefix>, Vec<ThreatType>) {
        let snapshot = self.snapshot.load();
        let mut matched: Option<HashPrefix> = None;
        let mut threat_types = Vec::new();
        for (&threat_type, list) in &snapshot.lists {
            if let Some(prefix) = list.prefixes.lookup(hash) {
                if matched.as_ref().is_none_or(|m| prefix.len() < m.len()) {
                    matched = Some(prefix.clone());
                }
                threat_types.push(threat_type);
            }
        }
        threat_types.sort();
        (matched, threat_types)
    }

    /// The health of the database.
    pub fn status(&self) -> Result<(), Error> {
        let snapshot = self.snapshot.load();
        if snapshot.lists.values().any(|list| list.corrupt) {
            return Err(Error::DatabaseCorrupt);
        }
        if self.is_stale(&snapshot, Timestamp::now()) {
            return Err(Error::DatabaseStale);
        }
        Ok(())
    }

    /// Subscribe to the readiness signal.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// How long the updater should wait before its first sync.
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// The time since the last successful sync, if there ever was one.
    pub fn since_last_update(&self) -> Option<Duration> {
        let snapshot = self.snapshot.load();
        let at = snapshot.last_update?;
        Some(Duration::try_from(Timestamp::now().duration_since(at)).unwrap_or_default())
    }

    /// Record the deadline of the next scheduled update.
    pub fn schedule_next(&self, deadline: Timestamp) {
        *self.next_update.lock().unwrap() = Some(deadline);
    }

    /// How far the updater is past its next deadline.
    ///
    /// Zero while the next update is still scheduled in the future.
    pub fn update_lag(&self, now: Timestamp) -> Duration {
        match *self.next_update.lock().unwrap() {
            Some(deadline) if now > deadline => {
                Duration::try_from(now.duration_since(deadline)).unwrap_or_default()
            }
            _ => Duration::ZERO,
        }
    }

    fn is_stale(&self, snapshot: &Snapshot, now: Timestamp) -> bool {
        match snapshot.last_update {
            Some(at) => {
                let age = Duration::try_from(now.duration_since(at)).unwrap_or_default();
                age > 2 * self.update_period
            }
            None => true,
        }
    }

    /// Run one full sync across all subscribed lists.
    ///
    /// Returns the delay the server recommends before the next sync (the
    /// update period when it makes no recommendation) and whether the sync
    /// succeeded. Every list is fetched before anything is applied, so a
    /// transport failure leaves the published snapshot untouched.
    pub async fn update(&self, api: &dyn Api) -> (Duration, bool) {
        let now = Timestamp::now();
        let current = self.snapshot.load_full();

        let mut responses = Vec::with_capacity(self.threat_lists.len());
        for &threat_type in &self.threat_lists {
            let version_token = current
                .lists
                .get(&threat_type)
                .map(|list| list.version_token.clone())
                .unwrap_or_default();
            let request = ListUpdateRequest {
                threat_type,
                version_token,
                constraints: self.constraints.clone(),
            };
            match api.list_update(request).await {
                Ok(response) => responses.push((threat_type, response)),
                Err(err) => {
                    warn!("fetching {threat_type} diff failed: {err}");
                    return (Duration::ZERO, false);
                }
            }
        }

        let mut lists = foldhash::HashMap::default();
        let mut next_diff: Option<Timestamp> = None;
        for (threat_type, response) in responses {
            let base = match response.response_type {
                ResponseType::Reset => PrefixSet::default(),
                ResponseType::Diff => current
                    .lists
                    .get(&threat_type)
                    .map(|list| list.prefixes.clone())
                    .unwrap_or_default(),
            };
            match apply_diff(&base, &response) {
                Ok(prefixes) => {
                    debug!(
                        "updated {threat_type}: {} prefixes ({:?})",
                        prefixes.len(),
                        response.response_type,
                    );
                    next_diff = next_diff.max(response.recommended_next_diff);
                    lists.insert(
                        threat_type,
                        ThreatList {
                            prefixes,
                            version_token: response.version_token,
                            checksum: response.checksum,
                            last_update: now,
                            corrupt: false,
                        },
                    );
                }
                Err(ApplyError::ChecksumMismatch) => {
                    warn!("checksum mismatch applying {threat_type} diff; purging the list");
                    self.mark_corrupt(&current, threat_type);
                    return (Duration::ZERO, false);
                }
                Err(err) => {
                    warn!("applying {threat_type} diff failed: {err}");
                    return (Duration::ZERO, false);
                }
            }
        }

        let snapshot = Arc::new(Snapshot {
            lists,
            last_update: Some(now),
        });
        self.snapshot.store(snapshot.clone());
        if let Some(path) = &self.db_path {
            if let Err(err) = file::store(path, &snapshot) {
                warn!("persisting threat database to {path} failed: {err}");
            }
        }
        self.ready.send_replace(true);

        let delay = next_diff
            .and_then(|at| Duration::try_from(at.duration_since(now)).ok())
            .unwrap_or(self.update_period);
        (delay, true)
    }

    /// Publish a snapshot with one list purged and flagged corrupt.
    ///
    /// The emptied version token makes the next update request a reset.
    fn mark_corrupt(&self, current: &Snapshot, threat_type: ThreatType) {
        let mut lists = current.lists.clone();
        lists.insert(
            threat_type,
            ThreatList {
                prefixes: PrefixSet::default(),
                version_token: Bytes::new(),
                checksum: Bytes::new(),
                last_update: Timestamp::now(),
                corrupt: true,
            },
        );
        self.snapshot.store(Arc::new(Snapshot {
            lists,
            last_update: current.last_update,
        }));
    }
}

//----------- PrefixSet --------------------------------------------------------

/// A sorted, immutable array of hash prefixes.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PrefixSet {
    prefixes: Arc<[HashPrefix]>,
}

impl PrefixSet {
    /// Wrap a strictly sorted prefix array.
    fn from_sorted(prefixes: Vec<HashPrefix>) -> Self {
        Self {
            prefixes: prefixes.into(),
        }
    }

    /// Find the stored prefix matching a full hash.
    ///
    /// Binary search for the largest stored prefix not exceeding the hash;
    /// it matches iff it is a prefix of the hash. The service keeps each
    /// list prefix-free (no stored prefix is a prefix of another), so the
    /// single probe is exact.
    pub fn lookup(&self, hash: &FullHash) -> Option<&HashPrefix> {
        let idx = self
            .prefixes
            .partition_point(|prefix| prefix.as_bytes() <= hash.as_bytes());
        let candidate = self.prefixes[..idx].last()?;
        hash.has_prefix(candidate).then_some(candidate)
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HashPrefix> {
        self.prefixes.iter()
    }
}

impl Default for PrefixSet {
    fn default() -> Self {
        Self::from_sorted(Vec::new())
    }
}

//----------- Diff application -------------------------------------------------

/// An error applying a list diff.
#[derive(Clone, Debug, PartialEq, Eq)]
enum ApplyError {
    /// Rice-compressed data failed to decode.
    Rice(rice::Error),

    /// A raw additions group declared an impossible prefix size.
    BadPrefixSize(usize),

    /// A removal index fell outside the old array, or repeated.
    BadRemovalIndex(usize),

    /// The merged array would contain a duplicate prefix.
    Duplicate(HashPrefix),

    /// The updated array does not hash to the server's checksum.
    ChecksumMismatch,
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rice(err) => write!(f, "decoding Rice data: {err}"),
            Self::BadPrefixSize(size) => write!(f, "invalid prefix size {size}"),
            Self::BadRemovalIndex(index) => write!(f, "invalid removal index {index}"),
            Self::Duplicate(prefix) => write!(f, "duplicate prefix {prefix}"),
            Self::ChecksumMismatch => f.write_str("checksum mismatch"),
        }
    }
}

impl From<rice::Error> for ApplyError {
    fn from(err: rice::Error) -> Self {
        Self::Rice(err)
    }
}

/// Apply one diff response to a base prefix array.
fn apply_diff(base: &PrefixSet, response: &ListUpdateResponse) -> Result<PrefixSet, ApplyError> {
    // Decode every additions group. Rice-compressed prefixes are 4-byte
    // little-endian integers sorted numerically, which is not lexicographic
    // byte order, so the combined additions always get re-sorted.
    let mut additions: Vec<HashPrefix> = Vec::new();
    for group in &response.additions {
        match group {
            Additions::Raw { prefix_size, data } => {
                if !(MIN_PREFIX_LEN..=FULL_HASH_LEN).contains(prefix_size)
                    || data.len() % prefix_size != 0
                {
                    return Err(ApplyError::BadPrefixSize(*prefix_size));
                }
                for start in (0..data.len()).step_by(*prefix_size) {
                    let bytes = data.slice(start..start + prefix_size);
                    additions
                        .push(HashPrefix::new(bytes).expect("the prefix size was validated"));
                }
            }
            Additions::Rice(deltas) => {
                let values = rice::decode(
                    deltas.first_value,
                    deltas.rice_parameter,
                    deltas.entry_count as usize,
                    &deltas.encoded_data,
                )?;
                for value in values {
                    let bytes = Bytes::copy_from_slice(&value.to_le_bytes());
                    additions
                        .push(HashPrefix::new(bytes).expect("4 bytes is a valid prefix length"));
                }
            }
        }
    }
    additions.sort();

    // Collect removal indices against the old array and delete, detecting
    // out-of-range and repeated indices.
    let mut indices: Vec<usize> = Vec::new();
    for group in &response.removals {
        match group {
            Removals::Raw(raw) => {
                indices.extend(raw.iter().map(|&index| index as usize));
            }
            Removals::Rice(deltas) => {
                let values = rice::decode(
                    deltas.first_value,
                    deltas.rice_parameter,
                    deltas.entry_count as usize,
                    &deltas.encoded_data,
                )?;
                indices.extend(values.into_iter().map(|value| value as usize));
            }
        }
    }
    let mut removed = vec![false; base.len()];
    for index in indices {
        if index >= base.len() || std::mem::replace(&mut removed[index], true) {
            return Err(ApplyError::BadRemovalIndex(index));
        }
    }

    // Ordered merge of the survivors with the additions.
    let mut merged = Vec::with_capacity(base.len() + additions.len());
    let mut additions = additions.into_iter().peekable();
    for (index, prefix) in base.iter().enumerate() {
        if removed[index] {
            continue;
        }
        while additions.peek().is_some_and(|add| add < prefix) {
            merged.push(additions.next().expect("peeked"));
        }
        if additions.peek() == Some(prefix) {
            return Err(ApplyError::Duplicate(prefix.clone()));
        }
        merged.push(prefix.clone());
    }
    merged.extend(additions);
    for pair in merged.windows(2) {
        if pair[0] >= pair[1] {
            return Err(ApplyError::Duplicate(pair[1].clone()));
        }
    }

    // The server's checksum covers the concatenation of the sorted array.
    let mut checksum = Checksum::new();
    for prefix in &merged {
        checksum.update(prefix.as_bytes());
    }
    if checksum.finish() != *response.checksum {
        return Err(ApplyError::ChecksumMismatch);
    }

    Ok(PrefixSet::from_sorted(merged))
}

//============ Tests ===========================================================

//! The decision cache.
//!
//! The database can only say a hash is *possibly* on a list; the service's
//! per-hash verdicts are what settle the question. This cache holds those
//! verdicts between lookups, bounded by the expiries the server attaches to
//! them: a positive verdict is authoritative per threat type until its
//! expiry, a negative verdict is authoritative for all types at once. The
//! cache is purged wholesale after every successful database update, since
//! prefix churn may change which verdicts are still meaningful.

use std::sync::Mutex;

use jiff::{SignedDuration, Timestamp};

use crate::api::HashSearchResponse;
use crate::hash::{FullHash, HashPrefix};
use crate::threat::ThreatType;

//----------- CacheResult ------------------------------------------------------

/// The outcome of a cache lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheResult {
    /// The hash has at least one unexpired positive verdict.
    PositiveHit,

    /// The server recently confirmed the hash is on no subscribed list.
    NegativeHit,

    /// The cache has nothing authoritative; ask the service.
    Miss,
}

//----------- Cache ------------------------------------------------------------

/// A cache of per-full-hash verdicts.
#[derive(Debug)]
pub struct Cache {
    /// Overrides every server-supplied expiry when set.
    fixed_ttl: Option<SignedDuration>,

    entries: Mutex<foldhash::HashMap<FullHash, Entry>>,
}

/// The cached verdicts for one full hash.
#[derive(Debug, Default)]
struct Entry {
    /// Positive verdicts, per threat type.
    positives: foldhash::HashMap<ThreatType, Timestamp>,

    /// Until when the hash may be treated as on no list at all.
    negative_expiry: Option<Timestamp>,
}

impl Cache {
    /// Construct an empty cache.
    pub fn new(fixed_ttl: Option<std::time::Duration>) -> Self {
        Self {
            fixed_ttl: fixed_ttl.map(|ttl| {
                SignedDuration::try_from(ttl).unwrap_or(SignedDuration::MAX)
            }),
            entries: Mutex::new(foldhash::HashMap::default()),
        }
    }

    /// Look up the cached verdicts for a full hash.
    ///
    /// On a [`CacheResult::PositiveHit`] the returned map holds every
    /// unexpired positive verdict. Entries whose contents have all expired
    /// are dropped on the way through.
    pub fn lookup(
        &self,
        hash: &FullHash,
        now: Timestamp,
    ) -> (foldhash::HashMap<ThreatType, Timestamp>, CacheResult) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get(hash) else {
            return (foldhash::HashMap::default(), CacheResult::Miss);
        };

        let positives: foldhash::HashMap<ThreatType, Timestamp> = entry
            .positives
            .iter()
            .filter(|(_, expiry)| now < **expiry)
            .map(|(tt, expiry)| (*tt, *expiry))
            .collect();
        if !positives.is_empty() {
            return (positives, CacheResult::PositiveHit);
        }
        if entry.negative_expiry.is_some_and(|expiry| now < expiry) {
            return (positives, CacheResult::NegativeHit);
        }

        entries.remove(hash);
        (positives, CacheResult::Miss)
    }

    /// Merge a hash search response into the cache.
    ///
    /// `queried` holds the full hashes the request was made for; each one
    /// that is covered by `prefix` but absent from the response's positives
    /// picks up the response's negative expiry.
    pub fn update(
        &self,
        prefix: &HashPrefix,
        queried: &[FullHash],
        response: &HashSearchResponse,
        now: Timestamp,
    ) {
        let mut entries = self.entries.lock().unwrap();

        for threat in &response.threats {
            let expiry = self.expiry(threat.expire_time, now);
            let entry = entries.entry(threat.hash.clone()).or_default();
            for &threat_type in &threat.threat_types {
                let slot = entry.positives.entry(threat_type).or_insert(expiry);
                *slot = expiry.max(*slot);
            }
        }

        let Some(negative) = response.negative_expire_time else {
            return;
        };
        let negative = self.expiry(negative, now);
        for hash in queried {
            if !hash.has_prefix(prefix) {
                continue;
            }
            if response.threats.iter().any(|threat| &threat.hash == hash) {
                continue;
            }
            entries.entry(hash.clone()).or_default().negative_expiry = Some(negative);
        }
    }

    /// Drop every entry.
    pub fn purge(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn expiry(&self, server: Timestamp, now: Timestamp) -> Timestamp {
        match self.fixed_ttl {
            Some(ttl) => now.saturating_add(ttl).unwrap_or(Timestamp::MAX),
            None => server,
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jiff::{SignedDuration, Timestamp};

    use crate::api::{HashSearchResponse, ThreatMatch};
    use crate::hash::FullHash;
    use crate::threat::ThreatType;

    use super::{Cache, CacheResult};

    fn hash(pattern: &str) -> FullHash {
        FullHash::from_pattern(pattern)
    }

    fn response(
        threats: Vec<(FullHash, ThreatType, Timestamp)>,
        negative: Option<Timestamp>,
    ) -> HashSearchResponse {
        HashSearchResponse {
            threats: threats
                .into_iter()
                .map(|(hash, threat_type, expire_time)| ThreatMatch {
                    hash,
                    threat_types: vec![threat_type],
                    expire_time,
                })
                .collect(),
            negative_expire_time: negative,
        }
    }

    #[test]
    fn positive_hit_until_expiry() {
        let cache = Cache::new(None);
        let now = Timestamp::now();
        let hash = hash("evil.test/");
        let expiry = now + SignedDuration::from_hours(1);

        cache.update(
            &hash.prefix(4),
            &[hash.clone()],
            &response(vec![(hash.clone(), ThreatType::Malware, expiry)], None),
            now,
        );

        let (positives, result) = cache.lookup(&hash, now);
        assert_eq!(result, CacheResult::PositiveHit);
        assert_eq!(positives.get(&ThreatType::Malware), Some(&expiry));

        // Expired entries fall through to a miss and are dropped.
        let later = expiry + SignedDuration::from_secs(1);
        let (positives, result) = cache.lookup(&hash, later);
        assert_eq!(result, CacheResult::Miss);
        assert!(positives.is_empty());
    }

    #[test]
    fn negative_hit_covers_all_types() {
        let cache = Cache::new(None);
        let now = Timestamp::now();
        let hash = hash("good.test/");
        let negative = now + SignedDuration::from_mins(10);

        cache.update(
            &hash.prefix(4),
            &[hash.clone()],
            &response(Vec::new(), Some(negative)),
            now,
        );

        let (_, result) = cache.lookup(&hash, now);
        assert_eq!(result, CacheResult::NegativeHit);

        let (_, result) = cache.lookup(&hash, negative + SignedDuration::from_secs(1));
        assert_eq!(result, CacheResult::Miss);
    }

    #[test]
    fn positive_takes_precedence_over_negative() {
        let cache = Cache::new(None);
        let now = Timestamp::now();
        let bad = hash("evil.test/");
        let expiry = now + SignedDuration::from_hours(1);

        // One response adjudicates the hash positive; a later query for the
        // same prefix leaves the positive authoritative.
        cache.update(
            &bad.prefix(4),
            &[bad.clone()],
            &response(vec![(bad.clone(), ThreatType::Malware, expiry)], None),
            now,
        );
        let (_, result) = cache.lookup(&bad, now);
        assert_eq!(result, CacheResult::PositiveHit);

        // Once the positive expires, a still-valid negative answers.
        let negative = expiry + SignedDuration::from_hours(1);
        cache.update(
            &bad.prefix(4),
            &[bad.clone()],
            &response(Vec::new(), Some(negative)),
            now,
        );
        let (_, result) = cache.lookup(&bad, expiry + SignedDuration::from_secs(1));
        assert_eq!(result, CacheResult::NegativeHit);
    }

    #[test]
    fn positive_expiry_only_extends() {
        let cache = Cache::new(None);
        let now = Timestamp::now();
        let hash = hash("evil.test/");
        let long = now + SignedDuration::from_hours(2);
        let short = now + SignedDuration::from_hours(1);

        for expiry in [long, short] {
            cache.update(
                &hash.prefix(4),
                &[hash.clone()],
                &response(vec![(hash.clone(), ThreatType::Malware, expiry)], None),
                now,
            );
        }

        let (positives, _) = cache.lookup(&hash, now);
        assert_eq!(positives.get(&ThreatType::Malware), Some(&long));
    }

    #[test]
    fn negative_only_for_covered_hashes() {
        let cache = Cache::new(None);
        let now = Timestamp::now();
        let queried = hash("good.test/");
        let other = hash("unrelated.test/");
        let negative = now + SignedDuration::from_mins(10);

        cache.update(
            &queried.prefix(4),
            &[queried.clone(), other.clone()],
            &response(Vec::new(), Some(negative)),
            now,
        );

        assert_eq!(cache.lookup(&queried, now).1, CacheResult::NegativeHit);
        assert_eq!(cache.lookup(&other, now).1, CacheResult::Miss);
    }

    #[test]
    fn fixed_ttl_overrides_server_expiries() {
        let cache = Cache::new(Some(Duration::from_secs(3600)));
        let now = Timestamp::now();
        let bad = hash("evil.test/");
        let good = hash("good.test/");
        // Server-supplied expiries in the past; the fixed TTL keeps both
        // polarities authoritative anyway.
        let expired = now - SignedDuration::from_hours(1);

        cache.update(
            &bad.prefix(4),
            &[bad.clone()],
            &response(vec![(bad.clone(), ThreatType::Malware, expired)], None),
            now,
        );
        cache.update(
            &good.prefix(4),
            &[good.clone()],
            &response(Vec::new(), Some(expired)),
            now,
        );

        assert_eq!(cache.lookup(&bad, now).1, CacheResult::PositiveHit);
        assert_eq!(cache.lookup(&good, now).1, CacheResult::NegativeHit);

        let later = now + SignedDuration::from_secs(3601);
        assert_eq!(cache.lookup(&bad, later).1, CacheResult::Miss);
        assert_eq!(cache.lookup(&good, later).1, CacheResult::Miss);
    }

    #[test]
    fn purge_drops_everything() {
        let cache = Cache::new(None);
        let now = Timestamp::now();
        let hash = hash("evil.test/");
        cache.update(
            &hash.prefix(4),
            &[hash.clone()],
            &response(
                vec![(hash.clone(), ThreatType::Malware, now + SignedDuration::from_hours(1))],
                None,
            ),
            now,
        );

        cache.purge();
        assert_eq!(cache.lookup(&hash, now).1, CacheResult::Miss);
    }
}

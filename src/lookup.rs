//! The lookup pipeline.
//!
//! Each batch of URLs runs through three tiers: the database rules out
//! hashes with no stored prefix, the cache answers hashes the service has
//! recently adjudicated, and only what remains is sent over the wire as a
//! privacy-preserving prefix query.

use std::sync::atomic::Ordering;

use jiff::Timestamp;
use tracing::debug;

use crate::cache::CacheResult;
use crate::client::Inner;
use crate::error::Error;
use crate::hash::{FullHash, HashPrefix};
use crate::threat::ThreatType;
use crate::urls;

//----------- UrlThreat --------------------------------------------------------

/// One threat hit for a looked-up URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlThreat {
    /// The canonical expression that matched, e.g. `evil.test/path`.
    pub pattern: String,

    /// The threat list the expression is on.
    pub threat_type: ThreatType,
}

/// A hash search queued for the service.
struct PendingSearch {
    /// The matched database prefix; the only URL-derived data that goes on
    /// the wire.
    prefix: HashPrefix,

    /// The lists the database could not rule out.
    threat_types: Vec<ThreatType>,

    /// The full hash awaiting a verdict.
    full_hash: FullHash,
}

/// Look up a batch of URLs.
///
/// The outer result mirrors `urls` one-to-one. On error the hits computed
/// so far are returned alongside it.
pub(crate) async fn lookup_urls(
    inner: &Inner,
    urls: &[&str],
) -> (Vec<Vec<UrlThreat>>, Option<Error>) {
    let mut threats: Vec<Vec<UrlThreat>> = vec![Vec::new(); urls.len()];

    // A corrupt database cannot rule anything out; a stale one still can,
    // and merely taints the result.
    let stale = match inner.db.status() {
        Ok(()) => None,
        Err(Error::DatabaseStale) => Some(Error::DatabaseStale),
        Err(err) => return (threats, Some(err)),
    };

    let now = Timestamp::now();
    let stats = &inner.stats;
    // Which input URLs produced each full hash, for attributing verdicts.
    let mut owners: foldhash::HashMap<FullHash, (String, Vec<usize>)> =
        foldhash::HashMap::default();
    let mut searches: Vec<PendingSearch> = Vec::new();
    let mut queued: foldhash::HashSet<FullHash> = foldhash::HashSet::default();

    for (index, url) in urls.iter().enumerate() {
        let hashes = match urls::generate_hashes(url) {
            Ok(hashes) => hashes,
            Err(err) => {
                // The caller's input is broken; this and every following
                // URL goes unanswered.
                stats
                    .queries_fail
                    .fetch_add((urls.len() - index) as u64, Ordering::Relaxed);
                return (threats, Some(err));
            }
        };

        for (hash, pattern) in hashes {
            let (matched, unsure) = inner.db.lookup(&hash);
            owners
                .entry(hash.clone())
                .or_insert_with(|| (pattern, Vec::new()))
                .1
                .push(index);
            if unsure.is_empty() {
                stats.queries_by_database.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let (positives, result) = inner.cache.lookup(&hash, now);
            match result {
                CacheResult::PositiveHit => {
                    stats.queries_by_cache.fetch_add(1, Ordering::Relaxed);
                    let (pattern, _) = &owners[&hash];
                    for threat_type in unsure {
                        if positives.contains_key(&threat_type) {
                            threats[index].push(UrlThreat {
                                pattern: pattern.clone(),
                                threat_type,
                            });
                        }
                    }
                }
                CacheResult::NegativeHit => {
                    stats.queries_by_cache.fetch_add(1, Ordering::Relaxed);
                }
                CacheResult::Miss => {
                    if queued.insert(hash.clone()) {
                        searches.push(PendingSearch {
                            prefix: matched
                                .expect("an unruled-out hash matched some stored prefix"),
                            threat_types: unsure,
                            full_hash: hash,
                        });
                    }
                }
            }
        }
    }

    // Everything left needs the service's verdict. Requests run one at a
    // time; the first transport failure abandons the rest.
    for (position, search) in searches.iter().enumerate() {
        let request = crate::api::HashSearchRequest {
            prefix: search.prefix.clone(),
            threat_types: search.threat_types.clone(),
        };
        let response = match inner.api.search_hashes(&request).await {
            Ok(response) => response,
            Err(err) => {
                stats
                    .queries_fail
                    .fetch_add((searches.len() - position) as u64, Ordering::Relaxed);
                return (threats, Some(err));
            }
        };
        stats.queries_by_api.fetch_add(1, Ordering::Relaxed);
        debug!(
            "hash search for {} returned {} threats",
            search.prefix,
            response.threats.len(),
        );

        inner.cache.update(
            &search.prefix,
            std::slice::from_ref(&search.full_hash),
            &response,
            now,
        );

        // A verdict names a full hash; every input URL that produced that
        // hash gets the hit, filtered to the subscribed lists.
        for threat in &response.threats {
            let Some((pattern, indices)) = owners.get(&threat.hash) else {
                continue;
            };
            for &threat_type in &threat.threat_types {
                if !inner.config.threat_lists.contains(&threat_type) {
                    continue;
                }
                for &index in indices {
                    threats[index].push(UrlThreat {
                        pattern: pattern.clone(),
                        threat_type,
                    });
                }
            }
        }
    }

    (threats, stale)
}

//! The background updater.
//!
//! A single long-lived task keeps the database synchronized: sleep, sync,
//! repeat. A successful sync purges the decision cache (after the new
//! snapshot is published) and reschedules at the server-recommended delay;
//! a failed sync backs off exponentially. The task exits when the client
//! signals shutdown or goes away entirely.

use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::client::Inner;

/// The first retry delay after a failed update.
const BACKOFF_BASE: Duration = Duration::from_secs(60);

/// The longest retry delay backoff may reach.
const BACKOFF_CAP: Duration = Duration::from_secs(24 * 60 * 60);

/// Run the update loop until shutdown.
pub(crate) async fn run(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut delay = inner.db.initial_delay();
    let mut backoff: Option<Duration> = None;

    loop {
        inner
            .db
            .schedule_next(Timestamp::now().saturating_add(delay).unwrap_or(Timestamp::MAX));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // A closed channel means the client was dropped without an
            // explicit close; either way the loop is done.
            _ = shutdown.changed() => return,
        }

        let (next, ok) = inner.db.update(inner.api.as_ref()).await;
        if ok {
            // Purging after publication means a racing lookup may check
            // stale verdicts against the new snapshot; the API path
            // re-validates them, so that costs a request, not correctness.
            inner.cache.purge();
            backoff = None;
            delay = next;
            debug!("threat database updated; next sync in {delay:?}");
        } else {
            let next = match backoff {
                Some(current) => BACKOFF_CAP.min(current * 2),
                None => BACKOFF_BASE,
            };
            backoff = Some(next);
            delay = next;
            match inner.db.since_last_update() {
                Some(age) => warn!(
                    "threat database update failed; last success {age:?} ago, \
                     retrying in {delay:?}",
                ),
                None => warn!("threat database update failed; retrying in {delay:?}"),
            }
        }
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use jiff::{SignedDuration, Timestamp};
    use tokio::sync::watch;
    use tokio::time::Instant;

    use crate::api::{
        Api, HashSearchRequest, HashSearchResponse, ListUpdateRequest, ListUpdateResponse,
        ResponseType,
    };
    use crate::cache::{Cache, CacheResult};
    use crate::client::{Counters, Inner};
    use crate::config::Config;
    use crate::database::Database;
    use crate::error::Error;
    use crate::hash::{Checksum, FullHash};
    use crate::threat::ThreatType;

    use super::run;

    /// Serves a scripted sequence of update outcomes and records when each
    /// attempt lands on the virtual clock.
    struct ScriptedApi {
        /// Whether each successive attempt succeeds; the last entry repeats.
        outcomes: Mutex<VecDeque<bool>>,

        attempts: Mutex<Vec<Instant>>,

        /// The diff served on a successful attempt: an empty reset.
        response: ListUpdateResponse,
    }

    impl ScriptedApi {
        fn new(outcomes: impl IntoIterator<Item = bool>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                attempts: Mutex::new(Vec::new()),
                response: ListUpdateResponse {
                    response_type: ResponseType::Reset,
                    additions: Vec::new(),
                    removals: Vec::new(),
                    version_token: Bytes::from_static(b"tok"),
                    checksum: Bytes::copy_from_slice(&Checksum::new().finish()),
                    recommended_next_diff: None,
                },
            }
        }

        /// The virtual time between consecutive attempts.
        fn gaps(&self) -> Vec<Duration> {
            let attempts = self.attempts.lock().unwrap();
            attempts.windows(2).map(|pair| pair[1] - pair[0]).collect()
        }

        fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Api for ScriptedApi {
        async fn list_update(
            &self,
            _request: ListUpdateRequest,
        ) -> Result<ListUpdateResponse, Error> {
            self.attempts.lock().unwrap().push(Instant::now());
            let ok = {
                let mut outcomes = self.outcomes.lock().unwrap();
                if outcomes.len() > 1 {
                    outcomes.pop_front().expect("the script is not empty")
                } else {
                    outcomes.front().copied().unwrap_or(false)
                }
            };
            if ok {
                Ok(self.response.clone())
            } else {
                Err(Error::ApiTransport("service down".to_string()))
            }
        }

        async fn search_hashes(
            &self,
            _request: &HashSearchRequest,
        ) -> Result<HashSearchResponse, Error> {
            Ok(HashSearchResponse::default())
        }
    }

    fn test_inner(api: Arc<ScriptedApi>) -> Arc<Inner> {
        let config = Config {
            api_key: "test-key".to_string(),
            threat_lists: vec![ThreatType::Malware],
            ..Config::default()
        };
        Arc::new(Inner {
            db: Database::new(&config),
            cache: Cache::new(None),
            config,
            api,
            stats: Counters::default(),
            closed: AtomicBool::new(false),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn failed_updates_back_off_to_the_cap() {
        let api = Arc::new(ScriptedApi::new([false]));
        let inner = test_inner(api.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let updater = tokio::spawn(run(inner, shutdown_rx));

        // Four virtual days cover the immediate initial attempt, every
        // doubling, and two retries at the cap.
        tokio::time::sleep(Duration::from_secs(4 * 24 * 60 * 60)).await;

        let want: Vec<Duration> = [
            60, 120, 240, 480, 960, 1920, 3840, 7680, 15360, 30720, 61440, 86400, 86400,
        ]
        .into_iter()
        .map(Duration::from_secs)
        .collect();
        assert_eq!(api.gaps(), want);

        shutdown.send(true).unwrap();
        updater.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_backoff_and_purges_the_cache() {
        let api = Arc::new(ScriptedApi::new([false, false, true, false]));
        let inner = test_inner(api.clone());

        // Seed a verdict that would stay authoritative for an hour; the
        // successful sync must drop it.
        let hash = FullHash::from_pattern("evil.test/");
        let now = Timestamp::now();
        inner.cache.update(
            &hash.prefix(4),
            std::slice::from_ref(&hash),
            &HashSearchResponse {
                threats: Vec::new(),
                negative_expire_time: Some(now + SignedDuration::from_hours(1)),
            },
            now,
        );
        assert_eq!(inner.cache.lookup(&hash, now).1, CacheResult::NegativeHit);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let updater = tokio::spawn(run(inner.clone(), shutdown_rx));

        // Two failures, the success, and two fresh failures all land well
        // inside forty virtual minutes.
        tokio::time::sleep(Duration::from_secs(2300)).await;

        // 60s then 120s of backoff, the update period after the success,
        // then backoff starting over from the base.
        let want: Vec<Duration> = [60, 120, 1800, 60, 120]
            .into_iter()
            .map(Duration::from_secs)
            .collect();
        assert_eq!(api.gaps(), want);

        assert_eq!(
            inner.cache.lookup(&hash, Timestamp::now()).1,
            CacheResult::Miss,
        );

        shutdown.send(true).unwrap();
        updater.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wakes_the_sleeping_loop() {
        let api = Arc::new(ScriptedApi::new([true]));
        let inner = test_inner(api.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let updater = tokio::spawn(run(inner, shutdown_rx));

        // Let the initial sync land; the loop then sleeps out the update
        // period.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.attempt_count(), 1);

        // The loop must exit without waiting out its timer: one virtual
        // second is nowhere near the thirty-minute update period.
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), updater)
            .await
            .expect("the updater exits on shutdown")
            .unwrap();
        assert_eq!(api.attempt_count(), 1);
    }
}

//! The Web Risk client facade.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jiff::Timestamp;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{Api, HttpApi};
use crate::cache::Cache;
use crate::config::Config;
use crate::database::Database;
use crate::error::Error;
use crate::lookup::{self, UrlThreat};
use crate::update;

//----------- Client -----------------------------------------------------------

/// A Web Risk URL threat lookup client.
///
/// The client maintains a local database of hash prefixes, synchronized in
/// the background, and a cache of the service's per-hash verdicts. Lookups
/// may run concurrently from any task; the database is read through atomic
/// snapshots and never blocks on the updater.
///
/// Dropping the client stops the background updater; [`Client::close`] does
/// the same but waits for it to finish.
pub struct Client {
    inner: Arc<Inner>,

    /// Signals the updater to stop.
    shutdown: watch::Sender<bool>,

    /// The updater task, taken by the close that joins it.
    updater: Mutex<Option<JoinHandle<()>>>,
}

/// The state shared between the client, its lookups, and the updater.
pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) db: Database,
    pub(crate) cache: Cache,
    pub(crate) api: Arc<dyn Api>,
    pub(crate) stats: Counters,
    pub(crate) closed: AtomicBool,
}

impl Client {
    /// Construct a client and start its background updater.
    ///
    /// The database is seeded from [`Config::db_path`] when the file there
    /// validates; otherwise the first sync starts immediately. Use
    /// [`Client::wait_until_ready`] to block until lookups have a usable
    /// database.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(mut config: Config) -> Result<Self, Error> {
        config.validate()?;
        let api = Arc::new(HttpApi::new(&config)?);
        Ok(Self::with_api(config, api))
    }

    /// Construct a client against an arbitrary [`Api`] implementation.
    ///
    /// The configuration must already be validated.
    pub(crate) fn with_api(config: Config, api: Arc<dyn Api>) -> Self {
        let inner = Arc::new(Inner {
            db: Database::new(&config),
            cache: Cache::new(config.fixed_cache_ttl),
            config,
            api,
            stats: Counters::default(),
            closed: AtomicBool::new(false),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let updater = tokio::spawn(update::run(inner.clone(), shutdown_rx));

        Self {
            inner,
            shutdown,
            updater: Mutex::new(Some(updater)),
        }
    }

    /// Look up a batch of URLs against the subscribed threat lists.
    ///
    /// The outer result mirrors `urls` one-to-one; each inner list holds
    /// every `(pattern, threat type)` hit for that URL, empty meaning the
    /// URL is clean. An error comes back alongside whatever results were
    /// computed before it: a malformed URL fails itself and everything
    /// after it, a transport failure abandons the outstanding service
    /// queries, and a stale database taints otherwise complete results.
    ///
    /// Cancellation is the caller's: drop the future, or bound it with
    /// [`tokio::time::timeout`].
    pub async fn lookup_urls<S: AsRef<str>>(
        &self,
        urls: &[S],
    ) -> (Vec<Vec<UrlThreat>>, Option<Error>) {
        if self.inner.closed.load(Ordering::Acquire) {
            return (vec![Vec::new(); urls.len()], Some(Error::Closed));
        }
        let urls: Vec<&str> = urls.iter().map(|url| url.as_ref()).collect();
        lookup::lookup_urls(&self.inner, &urls).await
    }

    /// A snapshot of the query counters, and the database's health.
    pub fn status(&self) -> (Stats, Result<(), Error>) {
        let stats = self
            .inner
            .stats
            .snapshot(self.inner.db.update_lag(Timestamp::now()));
        let status = if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            self.inner.db.status()
        };
        (stats, status)
    }

    /// Wait until the database has ever reached a usable state.
    ///
    /// Returns [`Error::Closed`] if the client closes first. Callers
    /// wanting a deadline wrap this in [`tokio::time::timeout`].
    pub async fn wait_until_ready(&self) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut ready = self.inner.db.ready();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *ready.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        return Err(Error::Closed);
                    }
                }
                _ = shutdown.changed() => return Err(Error::Closed),
            }
        }
    }

    /// Shut the client down.
    ///
    /// Signals the updater and waits for it to exit. Idempotent; lookups
    /// already in flight complete on their own, later ones return
    /// [`Error::Closed`].
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);
        let updater = self.updater.lock().unwrap().take();
        if let Some(updater) = updater {
            let _ = updater.await;
        }
    }
}

//----------- Stats ------------------------------------------------------------

/// The live query counters.
///
/// Lock-free and updated with relaxed ordering: each field is individually
/// consistent but a [`Stats`] snapshot is not a globally consistent tuple.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) queries_by_database: AtomicU64,
    pub(crate) queries_by_cache: AtomicU64,
    pub(crate) queries_by_api: AtomicU64,
    pub(crate) queries_fail: AtomicU64,
}

impl Counters {
    fn snapshot(&self, database_update_lag: Duration) -> Stats {
        Stats {
            queries_by_database: self.queries_by_database.load(Ordering::Relaxed),
            queries_by_cache: self.queries_by_cache.load(Ordering::Relaxed),
            queries_by_api: self.queries_by_api.load(Ordering::Relaxed),
            queries_fail: self.queries_fail.load(Ordering::Relaxed),
            database_update_lag,
        }
    }
}

/// A point-in-time snapshot of the client's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Queries settled by the local database ruling the hash out.
    pub queries_by_database: u64,

    /// Queries settled by a cached service verdict.
    pub queries_by_cache: u64,

    /// Queries that reached the service.
    pub queries_by_api: u64,

    /// Queries that failed.
    pub queries_fail: u64,

    /// How far the updater is past its next scheduled sync.
    pub database_update_lag: Duration,
}

//============ Tests ===========================================================

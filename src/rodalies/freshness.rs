use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::departures::{self, StopDepartures};
use super::error::{ParseError, Result, RodaliesError};
use super::fetcher::DatasetFetcher;
use super::gtfs::{self, GtfsIndex};

/// An index as it was loaded by one ingestion. Never mutated once published.
#[derive(Debug)]
pub struct Snapshot {
    pub index: GtfsIndex,
    pub loaded_at: DateTime<Utc>,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Empty,
    Loading,
    Ready,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: Freshness,
    pub stops: usize,
    pub stop_times: usize,
    pub loaded_at: Option<DateTime<Utc>>,
    pub generation: u64,
    pub ingestions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ingestion {
    /// Read the working directory, downloading only when the files are missing.
    LoadOrFetch,
    /// Always download a fresh archive before indexing.
    Refresh,
}

type Outcome = Option<Result<Arc<Snapshot>>>;

/// The ingestion currently running, if any. Its outcome is published once on
/// the channel, and the slot is cleared just before that.
struct InFlight {
    kind: Ingestion,
    outcome: watch::Receiver<Outcome>,
}

impl InFlight {
    /// Whether a caller asking for `wanted` can take this ingestion's outcome
    /// as its own. A refresh must not settle for a plain load.
    fn satisfies(&self, wanted: Ingestion) -> bool {
        self.kind == Ingestion::Refresh || wanted == Ingestion::LoadOrFetch
    }
}

enum Join {
    Share(watch::Receiver<Outcome>),
    WaitThenRetry(watch::Receiver<Outcome>),
}

struct Inner {
    data_dir: PathBuf,
    fetcher: Arc<dyn DatasetFetcher>,
    current: RwLock<Option<Arc<Snapshot>>>,
    in_flight: Mutex<Option<InFlight>>,
    attempts: AtomicU64,
}

/// Owns the Rodalies index and keeps it loaded.
///
/// Queries read whichever snapshot is current without waiting on ingestion.
/// Loading and refreshing are single-flight: callers arriving while an
/// ingestion runs wait for it and share its outcome. A failed ingestion never
/// replaces a snapshot that is already being served.
///
/// Each ingestion runs on its own task, so it completes even when the caller
/// that started it goes away.
///
/// There is no time-based staleness check; the feed only changes through
/// [`Rodalies::refresh`].
pub struct Rodalies {
    inner: Arc<Inner>,
}

impl Rodalies {
    pub fn new(data_dir: impl Into<PathBuf>, fetcher: Arc<dyn DatasetFetcher>) -> Self {
        Rodalies {
            inner: Arc::new(Inner {
                data_dir: data_dir.into(),
                fetcher,
                current: RwLock::new(None),
                in_flight: Mutex::new(None),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.snapshot()
    }

    pub fn state(&self) -> Freshness {
        if self.inner.in_flight().is_some() {
            Freshness::Loading
        } else if self.snapshot().is_some() {
            Freshness::Ready
        } else {
            Freshness::Empty
        }
    }

    /// Number of ingestions started since the process began.
    pub fn ingestions(&self) -> u64 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Status {
        let snapshot = self.snapshot();
        Status {
            state: self.state(),
            stops: snapshot.as_ref().map_or(0, |s| s.index.stop_count()),
            stop_times: snapshot.as_ref().map_or(0, |s| s.index.stop_time_count()),
            loaded_at: snapshot.as_ref().map(|s| s.loaded_at),
            generation: snapshot.as_ref().map_or(0, |s| s.generation),
            ingestions: self.ingestions(),
        }
    }

    /// Current snapshot, loading it first if nothing has been loaded yet.
    pub async fn ensure_ready(&self) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = self.snapshot() {
            return Ok(snapshot);
        }

        self.single_flight(Ingestion::LoadOrFetch)
            .await
            .map_err(|cause| match cause {
                RodaliesError::NotReady { .. } => cause,
                cause => RodaliesError::NotReady {
                    cause: Box::new(cause),
                },
            })
    }

    /// Downloads the feed again and swaps in the new index.
    /// On failure the previously served index stays in place.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        self.single_flight(Ingestion::Refresh).await
    }

    pub async fn next_departures(
        &self,
        stop_id: &str,
        reference_time: &str,
        limit: usize,
    ) -> Result<StopDepartures> {
        if !departures::is_service_time(reference_time) {
            return Err(RodaliesError::InvalidTime(reference_time.to_string()));
        }

        let snapshot = self.ensure_ready().await?;
        Ok(departures::next_departures(
            &snapshot.index,
            stop_id,
            reference_time,
            limit,
        ))
    }

    async fn single_flight(&self, kind: Ingestion) -> Result<Arc<Snapshot>> {
        loop {
            let join = {
                let mut in_flight = self.inner.in_flight();
                match in_flight.as_ref() {
                    Some(running) if running.satisfies(kind) => Join::Share(running.outcome.clone()),
                    Some(running) => Join::WaitThenRetry(running.outcome.clone()),
                    None => {
                        if kind == Ingestion::LoadOrFetch {
                            if let Some(snapshot) = self.snapshot() {
                                return Ok(snapshot);
                            }
                        }

                        let (publish, outcome) = watch::channel(None);
                        *in_flight = Some(InFlight {
                            kind,
                            outcome: outcome.clone(),
                        });
                        let attempt = self.inner.attempts.fetch_add(1, Ordering::AcqRel) + 1;
                        tokio::spawn(self.inner.clone().run(kind, attempt, publish));
                        Join::Share(outcome)
                    }
                }
            };

            match join {
                Join::Share(outcome) => {
                    return wait_for_outcome(outcome).await.unwrap_or_else(|| Err(abandoned()));
                }
                // Settled either way, the caller still needs its own attempt
                Join::WaitThenRetry(outcome) => {
                    if wait_for_outcome(outcome).await.is_none() {
                        return Err(abandoned());
                    }
                }
            }
        }
    }
}

/// `None` when the ingestion task went away without publishing.
async fn wait_for_outcome(mut outcome: watch::Receiver<Outcome>) -> Outcome {
    let published = outcome.wait_for(Option::is_some).await.ok()?;
    (*published).clone()
}

fn abandoned() -> RodaliesError {
    RodaliesError::Ingestion("ingestion task ended without a result".to_string())
}

impl Inner {
    fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, kind: Ingestion, attempt: u64, publish: watch::Sender<Outcome>) {
        info!("🔄 Rodalies ingestion #{} started ({:?})", attempt, kind);

        let data_dir = self.data_dir.clone();
        let fetcher = self.fetcher.clone();
        let loaded = tokio::task::spawn_blocking(move || ingest(kind, &data_dir, fetcher.as_ref()))
            .await
            .map_err(|e| RodaliesError::Ingestion(e.to_string()))
            .and_then(|loaded| loaded);

        let outcome = loaded.map(|index| {
            let snapshot = Arc::new(Snapshot {
                index,
                loaded_at: Utc::now(),
                generation: attempt,
            });
            *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
            snapshot
        });

        match &outcome {
            Ok(snapshot) => info!(
                "✓ Rodalies index ready: {} stops, {} stop times",
                snapshot.index.stop_count(),
                snapshot.index.stop_time_count()
            ),
            Err(e) if self.snapshot().is_some() => {
                warn!("⚠️  Rodalies ingestion #{} failed, keeping previous index: {}", attempt, e)
            }
            Err(e) => error!("❌ Rodalies ingestion #{} failed: {}", attempt, e),
        }

        *self.in_flight() = None;
        publish.send_replace(Some(outcome));
    }
}

fn ingest(kind: Ingestion, data_dir: &Path, fetcher: &dyn DatasetFetcher) -> Result<GtfsIndex> {
    if kind == Ingestion::Refresh {
        fetcher.fetch_and_install(data_dir)?;
        return Ok(gtfs::load(data_dir)?);
    }

    match gtfs::load(data_dir) {
        Err(ParseError::MissingFile { path }) => {
            info!("ℹ️  {} not found, downloading Rodalies GTFS", path.display());
            fetcher.fetch_and_install(data_dir)?;
            Ok(gtfs::load(data_dir)?)
        }
        loaded => Ok(loaded?),
    }
}

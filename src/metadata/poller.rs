// src/metadata/poller.rs
//! Fixed-interval metadata poller with a last-known-good slot.
//!
//! Readers get an `Arc<PollerSnapshot>` clone; the poll task swaps in a whole
//! new snapshot after every attempt, so a reader never sees `current` and
//! `last_error` from two different polls.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::normalize::{normalize, TalkerRecord};
use super::source::{HttpMetadataSource, MetadataSource, PollError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a reader may ask about the poller, captured at one instant.
#[derive(Debug, Clone, Default)]
pub struct PollerSnapshot {
    /// Last successfully normalized record; `None` until the first success.
    pub current: Option<Arc<TalkerRecord>>,
    /// Set when the most recent poll failed.
    pub last_error: Option<PollError>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

pub struct MetadataPoller {
    name: String,
    source: Option<Arc<dyn MetadataSource>>,
    slot: RwLock<Arc<PollerSnapshot>>,
}

impl MetadataPoller {
    /// Without a source the poller is permanently idle and never does I/O.
    pub fn new(name: impl Into<String>, source: Option<Arc<dyn MetadataSource>>) -> Self {
        let initial = match source {
            Some(_) => PollerSnapshot::default(),
            None => PollerSnapshot {
                current: Some(Arc::new(TalkerRecord::idle())),
                ..PollerSnapshot::default()
            },
        };
        Self {
            name: name.into(),
            source,
            slot: RwLock::new(Arc::new(initial)),
        }
    }

    /// HTTP-backed poller; an empty `metadata_url` yields the idle poller.
    pub fn from_url(
        name: impl Into<String>,
        metadata_url: &str,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        let url = metadata_url.trim();
        let source: Option<Arc<dyn MetadataSource>> = if url.is_empty() {
            None
        } else {
            Some(Arc::new(
                HttpMetadataSource::new(url, client).with_timeout(timeout),
            ))
        };
        Self::new(name, source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_idle_mode(&self) -> bool {
        self.source.is_none()
    }

    pub fn snapshot(&self) -> Arc<PollerSnapshot> {
        Arc::clone(&self.slot.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn current(&self) -> Option<Arc<TalkerRecord>> {
        self.snapshot().current.clone()
    }

    /// The record to display: current, or the idle default before any success.
    pub fn current_or_idle(&self) -> TalkerRecord {
        self.current()
            .map(|r| (*r).clone())
            .unwrap_or_else(TalkerRecord::idle)
    }

    pub fn last_error(&self) -> Option<PollError> {
        self.snapshot().last_error.clone()
    }

    fn publish(&self, update: impl FnOnce(&PollerSnapshot) -> PollerSnapshot) {
        let mut guard = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        let next = update(&guard);
        *guard = Arc::new(next);
    }

    /// One fetch + normalize + publish. On failure `current` is left alone.
    pub async fn poll_once(&self) -> Result<Arc<TalkerRecord>, PollError> {
        let Some(source) = &self.source else {
            return Ok(self
                .current()
                .unwrap_or_else(|| Arc::new(TalkerRecord::idle())));
        };

        counter!("metadata_polls_total").increment(1);
        let t0 = Instant::now();
        let result = source.fetch().await.map(|v| Arc::new(normalize(&v)));
        histogram!("metadata_poll_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        let now = Utc::now();
        match &result {
            Ok(record) => {
                let recovered = self.snapshot().consecutive_failures > 0;
                self.publish(|_| PollerSnapshot {
                    current: Some(Arc::clone(record)),
                    last_error: None,
                    last_success_at: Some(now),
                    last_attempt_at: Some(now),
                    consecutive_failures: 0,
                });
                if recovered {
                    info!(target: "poller", instance = %self.name, "metadata polling recovered");
                }
                trace!(target: "poller", instance = %self.name, talker = %record.talker, "metadata updated");
            }
            Err(e) => {
                counter!("metadata_poll_failures_total").increment(1);
                let mut failures = 0;
                self.publish(|prev| {
                    failures = prev.consecutive_failures.saturating_add(1);
                    PollerSnapshot {
                        current: prev.current.clone(),
                        last_error: Some(e.clone()),
                        last_success_at: prev.last_success_at,
                        last_attempt_at: Some(now),
                        consecutive_failures: failures,
                    }
                });
                if failures == 1 {
                    warn!(
                        target: "poller",
                        instance = %self.name,
                        url = %source.describe(),
                        error = %e,
                        "Unable to fetch metadata"
                    );
                } else {
                    debug!(target: "poller", instance = %self.name, error = %e, failures, "metadata still failing");
                }
            }
        }
        result
    }

    /// Poll once eagerly, then keep polling every `interval` on a spawned task.
    ///
    /// Polls run back to back on that task, so a slow fetch delays (and may
    /// skip) ticks instead of overlapping with the next one.
    pub async fn start(self: Arc<Self>, interval: Duration) -> PollerHandle {
        if self.is_idle_mode() {
            debug!(target: "poller", instance = %self.name, "no metadata url, staying idle");
            return PollerHandle {
                name: self.name.clone(),
                task: None,
            };
        }

        let _ = self.poll_once().await;

        let interval = interval.max(MIN_POLL_INTERVAL);
        let poller = Arc::clone(&self);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let _ = poller.poll_once().await;
            }
        });

        PollerHandle {
            name: self.name.clone(),
            task: Some(task),
        }
    }
}

/// Owns the poll timer. Stopping (or dropping) it cancels the timer and any
/// poll in flight.
#[derive(Debug)]
pub struct PollerHandle {
    name: String,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(target: "poller", instance = %self.name, "poller stopped");
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

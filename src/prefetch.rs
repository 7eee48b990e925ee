//! Background thumbnail prefetching
//!
//! A [`PrefetchScheduler`] owns at most one active plan. Each call to
//! [`PrefetchScheduler::schedule`] bumps a generation counter, which
//! invalidates the previous plan, and starts a task that works through the
//! new list in fixed-size batches. Between batches the task waits for an
//! idle point, or sleeps a short fallback delay when no idle signal exists.
//!
//! Fetches are best-effort: a failed prefetch is counted as a miss and the
//! plan moves on. Fetches already issued when a plan is superseded run to
//! completion; only the batches after them are suppressed.

use crate::config::PrefetchConfig;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::models::{MediaLocator, MediaResource};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Issues a single prefetch request
#[async_trait]
pub trait Prefetcher: Send + Sync {
    async fn prefetch(&self, locator: &MediaLocator) -> Result<()>;
}

/// Source of low-priority continuation points between batches
#[async_trait]
pub trait IdleScheduler: Send + Sync {
    /// Wait until the host is idle
    ///
    /// Returns `false` without waiting when no idle primitive exists, in
    /// which case the caller applies its fallback delay.
    async fn until_idle(&self) -> bool;
}

/// Host without an idle primitive
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdleSignal;

#[async_trait]
impl IdleScheduler for NoIdleSignal {
    async fn until_idle(&self) -> bool {
        false
    }
}

/// Treats a cooperative yield to the runtime as the idle point
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldIdle;

#[async_trait]
impl IdleScheduler for YieldIdle {
    async fn until_idle(&self) -> bool {
        tokio::task::yield_now().await;
        true
    }
}

/// Fetches thumbnails from the backend and discards the bytes
///
/// The backend renders thumbnails on first request and caches them, so a
/// completed GET is all a prefetch needs.
pub struct HttpPrefetcher {
    client: Client,
    upstream_base: String,
}

impl HttpPrefetcher {
    pub fn new(client: Client, upstream_base: impl Into<String>) -> Self {
        HttpPrefetcher {
            client,
            upstream_base: upstream_base.into(),
        }
    }
}

#[async_trait]
impl Prefetcher for HttpPrefetcher {
    async fn prefetch(&self, locator: &MediaLocator) -> Result<()> {
        let url = locator.upstream_url(&self.upstream_base)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::from_http_status(status.as_u16(), ""));
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            chunk.map_err(|e| RelayError::StreamError(e.to_string()))?;
        }
        Ok(())
    }
}

/// Body of a downstream prefetch request
///
/// All lists are optional. Locators are produced in the order performers,
/// media, items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchRequest {
    /// Performer ids whose thumbnails should be warmed
    #[serde(default)]
    pub performers: Vec<String>,
    /// Relative paths of standalone media files
    #[serde(default)]
    pub media: Vec<String>,
    /// Fully described resources, including archive entries
    #[serde(default)]
    pub items: Vec<MediaResource>,
    /// Thumbnail size overriding the configured defaults
    #[serde(default)]
    pub size: Option<u32>,
}

impl PrefetchRequest {
    pub fn into_locators(self, config: &PrefetchConfig) -> Vec<MediaLocator> {
        let performer_size = self.size.unwrap_or(config.performer_thumb_size);
        let archive_size = self.size.unwrap_or(config.archive_thumb_size);

        let performers = self
            .performers
            .into_iter()
            .filter(|id| !id.is_empty())
            .map(|id| MediaLocator::PerformerThumbnail {
                id,
                size: performer_size,
            });
        let media = self
            .media
            .into_iter()
            .filter(|rel_path| !rel_path.is_empty())
            .map(|rel_path| MediaLocator::Thumbnail { rel_path });
        let items = self
            .items
            .into_iter()
            .map(|item| item.thumbnail_locator(archive_size));

        performers.chain(media).chain(items).collect()
    }
}

/// Outcome of one plan as seen by its own task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanReport {
    pub generation: u64,
    pub batches_issued: usize,
    pub hits: usize,
    pub misses: usize,
    /// The plan stopped early because a newer one replaced it
    pub superseded: bool,
}

/// Returned by [`PrefetchScheduler::schedule`]
///
/// Dropping the handle does not stop the plan.
#[derive(Debug)]
pub struct PlanHandle {
    generation: u64,
    task: Option<JoinHandle<PlanReport>>,
}

impl PlanHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the plan task to end
    ///
    /// An empty plan finishes immediately with an empty report.
    pub async fn finished(self) -> PlanReport {
        let generation = self.generation;
        match self.task {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!("Prefetch plan {} task failed: {}", generation, e);
                PlanReport {
                    generation,
                    ..Default::default()
                }
            }),
            None => PlanReport {
                generation,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Default)]
struct PlanState {
    generation: u64,
    active: bool,
}

struct SchedulerInner {
    prefetcher: Arc<dyn Prefetcher>,
    idle: Arc<dyn IdleScheduler>,
    batch_size: usize,
    fallback_delay: Duration,
    metrics: Arc<RelayMetrics>,
    state: Mutex<PlanState>,
}

/// Runs at most one prefetch plan at a time
#[derive(Clone)]
pub struct PrefetchScheduler {
    inner: Arc<SchedulerInner>,
}

impl PrefetchScheduler {
    /// Create a new scheduler
    ///
    /// # Arguments
    /// * `prefetcher` - Performs the individual fetches
    /// * `idle` - Provides the continuation point between batches
    /// * `batch_size` - Fetches issued together per batch
    /// * `fallback_delay` - Pause between batches when `idle` has no signal
    /// * `metrics` - Shared metrics collector
    pub fn new(
        prefetcher: Arc<dyn Prefetcher>,
        idle: Arc<dyn IdleScheduler>,
        batch_size: usize,
        fallback_delay: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        PrefetchScheduler {
            inner: Arc::new(SchedulerInner {
                prefetcher,
                idle,
                batch_size: batch_size.max(1),
                fallback_delay,
                metrics,
                state: Mutex::new(PlanState::default()),
            }),
        }
    }

    /// Replace the active plan with one over `locators`
    ///
    /// The previous plan is invalidated before this returns, so none of its
    /// remaining batches will be issued. An empty list only cancels.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, locators: Vec<MediaLocator>) -> PlanHandle {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.active {
                debug!("Superseding prefetch plan {}", state.generation);
                self.inner.metrics.record_prefetch_superseded();
            }
            state.generation += 1;
            state.active = !locators.is_empty();
            state.generation
        };

        if locators.is_empty() {
            debug!("Prefetch plan {} is empty", generation);
            return PlanHandle {
                generation,
                task: None,
            };
        }

        self.inner.metrics.record_prefetch_plan();
        info!(
            "Starting prefetch plan {} with {} items in batches of {}",
            generation,
            locators.len(),
            self.inner.batch_size
        );

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(run_plan(inner, generation, locators));
        PlanHandle {
            generation,
            task: Some(task),
        }
    }

    /// Invalidate the active plan without starting another
    pub fn cancel(&self) {
        self.schedule(Vec::new());
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Whether the current plan still has batches to issue
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }
}

async fn run_plan(
    inner: Arc<SchedulerInner>,
    generation: u64,
    locators: Vec<MediaLocator>,
) -> PlanReport {
    let mut report = PlanReport {
        generation,
        ..Default::default()
    };
    let batches: Vec<Vec<MediaLocator>> = locators
        .chunks(inner.batch_size)
        .map(|batch| batch.to_vec())
        .collect();
    let batch_count = batches.len();

    for (index, batch) in batches.into_iter().enumerate() {
        // Checking and spawning under the lock keeps `schedule` from slipping
        // in between.
        let handles: Vec<_> = {
            let state = inner.state.lock();
            if state.generation != generation {
                debug!(
                    "Prefetch plan {} superseded after {} of {} batches",
                    generation, index, batch_count
                );
                report.superseded = true;
                return report;
            }

            inner.metrics.record_prefetch_batch();
            batch
                .into_iter()
                .map(|locator| {
                    let prefetcher = Arc::clone(&inner.prefetcher);
                    tokio::spawn(async move {
                        let result = prefetcher.prefetch(&locator).await;
                        (locator, result)
                    })
                })
                .collect()
        };
        report.batches_issued += 1;

        for handle in handles {
            match handle.await {
                Ok((_, Ok(()))) => {
                    report.hits += 1;
                    inner.metrics.record_prefetch(true);
                }
                Ok((locator, Err(e))) => {
                    debug!("Prefetch miss for {:?}: {}", locator, e);
                    report.misses += 1;
                    inner.metrics.record_prefetch(false);
                }
                Err(e) => {
                    warn!("Prefetch task failed: {}", e);
                    report.misses += 1;
                    inner.metrics.record_prefetch(false);
                }
            }
        }

        if index + 1 < batch_count && !inner.idle.until_idle().await {
            sleep(inner.fallback_delay).await;
        }
    }

    let mut state = inner.state.lock();
    if state.generation == generation {
        state.active = false;
    }
    debug!(
        "Prefetch plan {} finished: {} hits, {} misses",
        generation, report.hits, report.misses
    );
    report
}

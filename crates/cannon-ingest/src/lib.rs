//! Ingestion orchestration: one run walks the source index, filters by
//! novelty, persists new listings and fans matches out to subscribers.
//!
//! There is no mid-run checkpoint. A crash mid-run is safe because the
//! novelty check plus idempotent upserts make the next run convergent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cannon_core::{listing_id_from_url, matching_subscriptions, IngestionRunRecord};
use cannon_notify::{DispatchOutcome, Dispatcher, ListingNotifier, NotifyConfig};
use cannon_scrape::{CannonSource, ListingSource, DEFAULT_INDEX_URL};
use cannon_store::{AlertStore, FileStore, HttpClientConfig, PageFetcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "cannon-ingest";

/// Process-wide ingestion configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub index_url: String,
    pub store_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self {
            index_url: std::env::var("CANNON_INDEX_URL")
                .unwrap_or_else(|_| DEFAULT_INDEX_URL.to_string()),
            store_root: std::env::var("CANNON_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            user_agent: std::env::var("CANNON_USER_AGENT")
                .unwrap_or_else(|_| "cannon-alerts/0.1".to_string()),
            http_timeout_secs: std::env::var("CANNON_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("CANNON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("CANNON_INGEST_CRON")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
        }
    }
}

/// Per-run summary returned to the trigger and logged.
#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listings_processed: usize,
    pub notifications_sent: usize,
    pub notification_errors: usize,
    pub processed_listings: Vec<String>,
}

/// Fail-open novelty check: a store read failure is treated as "new" so
/// a flaky store never suppresses a real listing. The duplicate work
/// that can cause is absorbed by the idempotent upsert.
pub async fn is_new_listing(store: &dyn AlertStore, listing_url: &str) -> bool {
    let Some(listing_id) = listing_id_from_url(listing_url) else {
        warn!(listing_url, "no derivable listing id; skipping");
        return false;
    };
    match store.get_listing(&listing_id).await {
        Ok(Some(_)) => false,
        Ok(None) => true,
        Err(err) => {
            warn!(listing_url, error = %err, "novelty lookup failed; treating as new");
            true
        }
    }
}

/// On-demand trigger seam consumed by the HTTP surface.
#[async_trait]
pub trait IngestRunner: Send + Sync {
    async fn run(&self) -> Result<IngestRunSummary>;
}

pub struct IngestPipeline {
    store: Arc<dyn AlertStore>,
    source: Box<dyn ListingSource>,
    fetcher: PageFetcher,
    notifier: Box<dyn ListingNotifier>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn AlertStore>,
        source: Box<dyn ListingSource>,
        fetcher: PageFetcher,
        notifier: Box<dyn ListingNotifier>,
    ) -> Self {
        Self {
            store,
            source,
            fetcher,
            notifier,
        }
    }

    pub fn from_config(config: &IngestConfig, notify: &NotifyConfig) -> Result<Self> {
        let store = Arc::new(FileStore::new(config.store_root.clone()));
        let fetcher = PageFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let dispatcher = Dispatcher::from_config(notify)?;
        Ok(Self::new(
            store,
            Box::new(CannonSource::new(config.index_url.clone())),
            fetcher,
            Box::new(dispatcher),
        ))
    }

    pub fn store(&self) -> Arc<dyn AlertStore> {
        self.store.clone()
    }

    /// One ingestion pass. An unreachable index propagates to the
    /// trigger; every per-listing failure is logged and skipped so the
    /// rest of the batch still lands.
    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let candidate_urls = self
            .source
            .fetch_index(&self.fetcher)
            .await
            .context("fetching listing index")?;

        let mut processed_listings = Vec::new();
        let mut totals = DispatchOutcome::default();

        for listing_url in candidate_urls {
            if !is_new_listing(self.store.as_ref(), &listing_url).await {
                continue;
            }
            let listing_id = match listing_id_from_url(&listing_url) {
                Some(id) => id,
                None => continue,
            };

            let listing = match self.source.fetch_detail(&self.fetcher, &listing_url).await {
                Ok(listing) => listing,
                Err(err) => {
                    warn!(listing_url, error = %err, "detail fetch failed; skipping listing");
                    continue;
                }
            };
            processed_listings.push(listing_url.clone());

            if let Err(err) = self.store.put_listing(&listing_id, &listing).await {
                warn!(listing_url, error = %err, "persist failed; skipping notifications");
                continue;
            }

            let subscriptions = match self.store.active_subscriptions().await {
                Ok(subscriptions) => subscriptions,
                Err(err) => {
                    warn!(error = %err, "fetching active subscriptions failed");
                    Vec::new()
                }
            };
            let matched = matching_subscriptions(
                listing.bedroom_bucket,
                listing.price_bucket,
                &subscriptions,
            );
            if !matched.is_empty() {
                totals.absorb(self.notifier.notify(&listing, &matched).await);
            }
            info!(
                listing_id,
                matched = matched.len(),
                "ingested new listing"
            );
        }

        Ok(IngestRunSummary {
            started_at,
            finished_at: Utc::now(),
            listings_processed: processed_listings.len(),
            notifications_sent: totals.sent,
            notification_errors: totals.errors,
            processed_listings,
        })
    }

    /// Scheduled variant: run, then append the audit record. The audit
    /// write is best-effort and never fails the run.
    pub async fn run_and_record(&self) -> Result<IngestRunSummary> {
        let summary = self.run_once().await?;
        let record = IngestionRunRecord {
            timestamp: summary.finished_at,
            new_listings_count: summary.listings_processed,
            notifications_sent: summary.notifications_sent,
            notification_errors: summary.notification_errors,
            processed_listings: summary.processed_listings.clone(),
        };
        if let Err(err) = self.store.append_run(&record).await {
            warn!(error = %err, "failed to save run statistics");
        }
        Ok(summary)
    }
}

#[async_trait]
impl IngestRunner for IngestPipeline {
    async fn run(&self) -> Result<IngestRunSummary> {
        self.run_once().await
    }
}

/// Fixed-interval trigger. Run failures surface through the job's own
/// error logging; the next tick retries from scratch.
pub async fn build_scheduler(
    pipeline: Arc<IngestPipeline>,
    cron: &str,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_and_record().await {
                Ok(summary) => info!(
                    new = summary.listings_processed,
                    sent = summary.notifications_sent,
                    errors = summary.notification_errors,
                    "scheduled ingestion complete"
                ),
                Err(err) => error!(error = %err, "scheduled ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating ingestion job for cron {cron}"))?;
    scheduler.add(job).await.context("adding ingestion job")?;
    Ok(scheduler)
}

//! Document store abstraction + HTTP fetch utilities for cannon-alerts.
//!
//! Three collections back the alert service: `listings` keyed by the
//! derived listing id, `subscriptions` with generated ids, and the
//! append-only `ingestion_runs` audit trail.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cannon_core::{ChannelKind, IngestionRunRecord, Listing, Subscription};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cannon-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {collection}/{id}")]
    NotFound { collection: &'static str, id: String },
    #[error("io error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error in {context}: {source}")]
    Serde {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    fn serde(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serde {
            context: context.into(),
            source,
        }
    }
}

/// Collection-level operations the alert service needs from its store.
/// `active_subscriptions` applies the disabled filter itself so callers
/// never re-check staleness.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get_listing(&self, listing_id: &str) -> Result<Option<Listing>, StoreError>;

    /// Upsert by derived id. Writing the same id twice converges on the
    /// last write; there are never duplicate rows.
    async fn put_listing(&self, listing_id: &str, listing: &Listing) -> Result<(), StoreError>;

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Equality filter on channel type + destination, active or disabled.
    async fn subscriptions_for_destination(
        &self,
        kind: ChannelKind,
        destination: &str,
    ) -> Result<Vec<Subscription>, StoreError>;

    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, StoreError>;

    /// Stores the document with a generated id and returns the id.
    async fn add_subscription(&self, subscription: &Subscription) -> Result<String, StoreError>;

    /// Partial update of the disabled marker (`None` re-enables).
    async fn set_subscription_disabled(
        &self,
        id: &str,
        disabled: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn append_run(&self, record: &IngestionRunRecord) -> Result<(), StoreError>;

    async fn run_records(&self) -> Result<Vec<IngestionRunRecord>, StoreError>;
}

/// JSON-file-backed [`AlertStore`]: one document per file under a
/// collection directory, written via atomic temp-file rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

const LISTINGS: &str = "listings";
const SUBSCRIPTIONS: &str = "subscriptions";
const INGESTION_RUNS: &str = "ingestion_runs";

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.root.join(collection).join(format!("{id}.json"))
    }

    async fn read_document<T: DeserializeOwned>(
        &self,
        collection: &'static str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let path = self.document_path(collection, id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(format!("reading {}", path.display()), err)),
        };
        let doc = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::serde(format!("parsing {}", path.display()), err))?;
        Ok(Some(doc))
    }

    async fn write_document<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        doc: &T,
    ) -> Result<(), StoreError> {
        let path = self.document_path(collection, id);
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)
            .await
            .map_err(|err| StoreError::io(format!("creating {}", parent.display()), err))?;

        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|err| StoreError::serde(format!("serializing {}", path.display()), err))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| StoreError::io(format!("opening {}", temp_path.display()), err))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| StoreError::io(format!("writing {}", temp_path.display()), err))?;
        file.flush()
            .await
            .map_err(|err| StoreError::io(format!("flushing {}", temp_path.display()), err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(
                format!("renaming {} -> {}", temp_path.display(), path.display()),
                err,
            ));
        }
        Ok(())
    }

    async fn scan_collection<T: DeserializeOwned>(
        &self,
        collection: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let dir = self.root.join(collection);
        let mut reader = match fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(format!("reading {}", dir.display()), err)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| StoreError::io(format!("reading {}", dir.display()), err))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let id = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let bytes = fs::read(&path)
                .await
                .map_err(|err| StoreError::io(format!("reading {}", path.display()), err))?;
            match serde_json::from_slice::<T>(&bytes) {
                Ok(doc) => entries.push((id, doc)),
                Err(err) => {
                    // A malformed document must not take down the scan.
                    warn!(path = %path.display(), error = %err, "skipping unreadable document");
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[async_trait]
impl AlertStore for FileStore {
    async fn get_listing(&self, listing_id: &str) -> Result<Option<Listing>, StoreError> {
        self.read_document(LISTINGS, listing_id).await
    }

    async fn put_listing(&self, listing_id: &str, listing: &Listing) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut doc = listing.clone();
        doc.listing_id = Some(listing_id.to_string());
        doc.created_at = doc.created_at.or(Some(now));
        doc.updated_at = Some(now);
        self.write_document(LISTINGS, listing_id, &doc).await
    }

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let entries = self.scan_collection::<Subscription>(SUBSCRIPTIONS).await?;
        Ok(entries
            .into_iter()
            .map(|(id, mut sub)| {
                sub.id = Some(id);
                sub
            })
            .filter(Subscription::is_active)
            .collect())
    }

    async fn subscriptions_for_destination(
        &self,
        kind: ChannelKind,
        destination: &str,
    ) -> Result<Vec<Subscription>, StoreError> {
        let entries = self.scan_collection::<Subscription>(SUBSCRIPTIONS).await?;
        Ok(entries
            .into_iter()
            .map(|(id, mut sub)| {
                sub.id = Some(id);
                sub
            })
            .filter(|sub| sub.kind == kind && sub.destination() == Some(destination))
            .collect())
    }

    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>, StoreError> {
        let doc = self.read_document::<Subscription>(SUBSCRIPTIONS, id).await?;
        Ok(doc.map(|mut sub| {
            sub.id = Some(id.to_string());
            sub
        }))
    }

    async fn add_subscription(&self, subscription: &Subscription) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let mut doc = subscription.clone();
        doc.id = Some(id.clone());
        doc.created_at = doc.created_at.or(Some(Utc::now()));
        self.write_document(SUBSCRIPTIONS, &id, &doc).await?;
        Ok(id)
    }

    async fn set_subscription_disabled(
        &self,
        id: &str,
        disabled: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        // Partial field merge on the raw document: legacy docs may carry
        // fields the Subscription struct does not model, and a disable
        // or re-enable must not strip them.
        let mut doc: serde_json::Map<String, serde_json::Value> = self
            .read_document(SUBSCRIPTIONS, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: SUBSCRIPTIONS,
                id: id.to_string(),
            })?;
        let context = || format!("updating {SUBSCRIPTIONS}/{id}");
        doc.insert(
            "disabled".to_string(),
            serde_json::to_value(disabled).map_err(|err| StoreError::serde(context(), err))?,
        );
        doc.insert(
            "updatedAt".to_string(),
            serde_json::to_value(Utc::now()).map_err(|err| StoreError::serde(context(), err))?,
        );
        self.write_document(SUBSCRIPTIONS, id, &doc).await
    }

    async fn append_run(&self, record: &IngestionRunRecord) -> Result<(), StoreError> {
        let id = format!(
            "{}-{}",
            record.timestamp.format("%Y%m%dT%H%M%S"),
            Uuid::new_v4()
        );
        self.write_document(INGESTION_RUNS, &id, record).await
    }

    async fn run_records(&self) -> Result<Vec<IngestionRunRecord>, StoreError> {
        let entries = self
            .scan_collection::<IngestionRunRecord>(INGESTION_RUNS)
            .await?;
        Ok(entries.into_iter().map(|(_, record)| record).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded sequential retry: the delay doubles each attempt up to a
/// ceiling. Not jittered; attempts are capped so a run always terminates.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential page fetcher with a bounded per-call timeout and retry on
/// transient failures. One unreachable endpoint cannot stall a run
/// indefinitely.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_attempts
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_attempts
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

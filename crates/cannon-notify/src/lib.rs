//! Notification dispatch: templated email via the render service +
//! Mailgun, and Discord-style webhooks. Failures are per-subscription
//! and never abort the rest of a batch.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cannon_core::{
    readable_bedroom_summary, readable_price_summary, ChannelKind, Listing, Subscription,
};
use cannon_store::BackoffPolicy;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "cannon-notify";

const RENDER_ATTEMPTS: usize = 5;
const DESCRIPTION_CAP: usize = 200;
const EMBED_COLOR: u32 = 0xEAB308;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("subscription has no destination for its channel")]
    MissingDestination,
}

/// Process-wide notification configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub render_urls: Vec<String>,
    pub mailgun_domain: String,
    pub mailgun_api_key: String,
    pub unsubscribe_base_url: String,
    pub listings_overview_url: String,
    pub http_timeout_secs: u64,
}

impl NotifyConfig {
    pub fn from_env() -> Self {
        Self {
            render_urls: std::env::var("EMAIL_RENDER_URLS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            mailgun_domain: std::env::var("MAILGUN_DOMAIN").unwrap_or_default(),
            mailgun_api_key: std::env::var("MAILGUN_API_KEY").unwrap_or_default(),
            unsubscribe_base_url: std::env::var("UNSUBSCRIBE_BASE_URL")
                .unwrap_or_else(|_| "https://thecannonalerts.ca/unsubscribe".to_string()),
            listings_overview_url: std::env::var("LISTINGS_OVERVIEW_URL").unwrap_or_else(|_| {
                "https://thecannon.ca/housing/?wanted_forsale=forsale&sortby=date".to_string()
            }),
            http_timeout_secs: std::env::var("NOTIFY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        }
    }

    pub fn links(&self) -> LinkConfig {
        LinkConfig {
            unsubscribe_base_url: self.unsubscribe_base_url.clone(),
            listings_overview_url: self.listings_overview_url.clone(),
        }
    }
}

/// Outbound links embedded in notification payloads.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub unsubscribe_base_url: String,
    pub listings_overview_url: String,
}

impl LinkConfig {
    pub fn unsubscribe_url(&self, subscription_id: &str) -> String {
        format!(
            "{}?id={}",
            self.unsubscribe_base_url,
            urlencoding::encode(subscription_id)
        )
    }
}

/// Flat display-field mapping posted to the render service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailProps {
    pub price: String,
    pub bedrooms: String,
    pub address: String,
    pub description: String,
    pub cover_image_url: Option<String>,
    pub listing_url: String,
    pub subscription_bedrooms: String,
    pub subscription_price_range: String,
    pub posted_at_text: String,
    pub unsubscribe_url: String,
    pub listings_overview_url: String,
}

pub fn display_price(listing: &Listing) -> String {
    match &listing.price_string {
        Some(s) => s.clone(),
        None => match listing.price_int {
            Some(p) => format!("${p}"),
            None => "$Unknown".to_string(),
        },
    }
}

pub fn build_email_props(
    listing: &Listing,
    subscription: &Subscription,
    links: &LinkConfig,
) -> EmailProps {
    EmailProps {
        price: display_price(listing),
        bedrooms: listing.bedroom_bucket.readable().to_string(),
        address: listing
            .address
            .clone()
            .unwrap_or_else(|| "Address not available".to_string()),
        description: listing
            .description
            .clone()
            .unwrap_or_else(|| "No description available".to_string()),
        cover_image_url: listing.image_url.clone(),
        listing_url: listing.listing_url.clone(),
        subscription_bedrooms: readable_bedroom_summary(&subscription.bedroom_choices()),
        subscription_price_range: readable_price_summary(&subscription.price_choices()),
        posted_at_text: "Posted today".to_string(),
        unsubscribe_url: links.unsubscribe_url(subscription.id.as_deref().unwrap_or_default()),
        listings_overview_url: links.listings_overview_url.clone(),
    }
}

pub fn email_subject(listing: &Listing) -> String {
    let price = display_price(listing);
    let address = listing.address.as_deref().unwrap_or("New listing");
    format!("New TheCannon Match: {price} - {address}")
}

/// Caps a description for the webhook embed; anything over the cap is
/// cut and marked with an ellipsis.
pub fn truncate_description(description: &str) -> String {
    if description.chars().count() <= DESCRIPTION_CAP {
        return description.to_string();
    }
    let cut: String = description.chars().take(DESCRIPTION_CAP - 3).collect();
    format!("{cut}...")
}

/// Discord-style embed payload for webhook subscribers.
pub fn build_webhook_payload(
    listing: &Listing,
    subscription: &Subscription,
    links: &LinkConfig,
) -> JsonValue {
    let mut fields = vec![
        json!({
            "name": "Address",
            "value": listing.address.as_deref().unwrap_or("Unknown address"),
            "inline": true,
        }),
        json!({
            "name": "Price",
            "value": listing.price_string.as_deref().unwrap_or("Unknown price"),
            "inline": true,
        }),
        json!({
            "name": "Bedrooms",
            "value": listing.bedroom_count.as_deref().unwrap_or("Unknown"),
            "inline": true,
        }),
    ];

    if let Some(description) = &listing.description {
        fields.push(json!({
            "name": "Description",
            "value": truncate_description(description),
            "inline": false,
        }));
    }

    let unsubscribe = links.unsubscribe_url(subscription.id.as_deref().unwrap_or_default());
    fields.push(json!({
        "name": "Manage Subscription",
        "value": format!("[Unsubscribe from alerts]({unsubscribe})"),
        "inline": false,
    }));

    let mut embed = json!({
        "title": "New TheCannon Listing Match!",
        "description": "A new listing matches your criteria",
        "color": EMBED_COLOR,
        "fields": fields,
        "url": listing.listing_url,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Some(image_url) = &listing.image_url {
        embed["thumbnail"] = json!({ "url": image_url });
    }

    json!({ "embeds": [embed] })
}

/// Renders email markup; `None` means every attempt was exhausted and
/// no email should be sent.
#[async_trait]
pub trait EmailRenderer: Send + Sync {
    async fn render(&self, props: &EmailProps) -> Option<String>;
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, payload: &JsonValue) -> Result<(), NotifyError>;
}

/// Render-service client: each attempt round tries every configured
/// endpoint before backing off, up to [`RENDER_ATTEMPTS`] rounds.
pub struct HttpEmailRenderer {
    client: reqwest::Client,
    endpoints: Vec<String>,
    backoff: BackoffPolicy,
}

impl HttpEmailRenderer {
    pub fn new(client: reqwest::Client, endpoints: Vec<String>) -> Self {
        Self {
            client,
            endpoints,
            backoff: BackoffPolicy {
                max_attempts: RENDER_ATTEMPTS,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
            },
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl EmailRenderer for HttpEmailRenderer {
    async fn render(&self, props: &EmailProps) -> Option<String> {
        if self.endpoints.is_empty() {
            warn!("no render endpoints configured; cannot render emails");
            return None;
        }

        let attempts = self.backoff.max_attempts;
        for attempt in 0..attempts {
            for endpoint in &self.endpoints {
                match self.client.post(endpoint).json(props).send().await {
                    Ok(resp) if resp.status().is_success() => match resp.text().await {
                        Ok(html) => return Some(html),
                        Err(err) => {
                            warn!(endpoint, attempt, error = %err, "render body read failed");
                        }
                    },
                    Ok(resp) => {
                        warn!(
                            endpoint,
                            attempt,
                            status = resp.status().as_u16(),
                            "render endpoint returned non-success"
                        );
                    }
                    Err(err) => {
                        warn!(endpoint, attempt, error = %err, "render endpoint unreachable");
                    }
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }

        warn!("exhausted email render attempts; not sending email");
        None
    }
}

/// Mailgun messages API; success is a 200.
pub struct MailgunTransport {
    client: reqwest::Client,
    domain: String,
    api_key: String,
}

impl MailgunTransport {
    pub fn new(client: reqwest::Client, domain: String, api_key: String) -> Self {
        Self {
            client,
            domain,
            api_key,
        }
    }

    fn messages_url(&self) -> String {
        format!("https://api.mailgun.net/v3/{}/messages", self.domain)
    }
}

#[async_trait]
impl EmailTransport for MailgunTransport {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), NotifyError> {
        let url = self.messages_url();
        let from = format!("TheCannon Alerts <postmaster@{}>", self.domain);
        let form = [
            ("from", from.as_str()),
            ("to", to),
            ("subject", subject),
            ("html", html),
        ];
        let resp = self
            .client
            .post(&url)
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|source| NotifyError::Transport {
                url: url.clone(),
                source,
            })?;
        if resp.status().as_u16() == 200 {
            Ok(())
        } else {
            Err(NotifyError::UnexpectedStatus {
                status: resp.status().as_u16(),
                url,
            })
        }
    }
}

/// Unauthenticated POST of the embed payload; success is 204 No Content.
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn post(&self, url: &str, payload: &JsonValue) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|source| NotifyError::Transport {
                url: url.to_string(),
                source,
            })?;
        if resp.status().as_u16() == 204 {
            Ok(())
        } else {
            Err(NotifyError::UnexpectedStatus {
                status: resp.status().as_u16(),
                url: url.to_string(),
            })
        }
    }
}

/// Aggregated per-batch delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub sent: usize,
    pub errors: usize,
}

impl DispatchOutcome {
    pub fn absorb(&mut self, other: DispatchOutcome) {
        self.sent += other.sent;
        self.errors += other.errors;
    }
}

/// Batch dispatch seam consumed by the ingestion orchestrator.
#[async_trait]
pub trait ListingNotifier: Send + Sync {
    async fn notify(&self, listing: &Listing, matched: &[Subscription]) -> DispatchOutcome;
}

/// Routes each matched subscription to its channel transport. Unknown
/// channel types are skipped and count toward neither sent nor errors.
pub struct Dispatcher {
    renderer: Box<dyn EmailRenderer>,
    email: Box<dyn EmailTransport>,
    webhook: Box<dyn WebhookTransport>,
    links: LinkConfig,
}

impl Dispatcher {
    pub fn new(
        renderer: Box<dyn EmailRenderer>,
        email: Box<dyn EmailTransport>,
        webhook: Box<dyn WebhookTransport>,
        links: LinkConfig,
    ) -> Self {
        Self {
            renderer,
            email,
            webhook,
            links,
        }
    }

    pub fn from_config(config: &NotifyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("building notify http client")?;
        Ok(Self::new(
            Box::new(HttpEmailRenderer::new(
                client.clone(),
                config.render_urls.clone(),
            )),
            Box::new(MailgunTransport::new(
                client.clone(),
                config.mailgun_domain.clone(),
                config.mailgun_api_key.clone(),
            )),
            Box::new(HttpWebhookTransport::new(client)),
            config.links(),
        ))
    }

    async fn dispatch_email(&self, listing: &Listing, subscription: &Subscription) -> bool {
        let Some(to) = subscription.email.as_deref() else {
            warn!(subscription_id = ?subscription.id, "email subscription without address");
            return false;
        };
        let props = build_email_props(listing, subscription, &self.links);
        let Some(html) = self.renderer.render(&props).await else {
            warn!(to, "failed to render email template");
            return false;
        };
        let subject = email_subject(listing);
        match self.email.send(to, &subject, &html).await {
            Ok(()) => true,
            Err(err) => {
                warn!(to, error = %err, "email send failed");
                false
            }
        }
    }

    async fn dispatch_webhook(&self, listing: &Listing, subscription: &Subscription) -> bool {
        let Some(url) = subscription.webhook_url.as_deref() else {
            warn!(subscription_id = ?subscription.id, "webhook subscription without url");
            return false;
        };
        let payload = build_webhook_payload(listing, subscription, &self.links);
        match self.webhook.post(url, &payload).await {
            Ok(()) => true,
            Err(err) => {
                warn!(url, error = %err, "webhook post failed");
                false
            }
        }
    }
}

#[async_trait]
impl ListingNotifier for Dispatcher {
    async fn notify(&self, listing: &Listing, matched: &[Subscription]) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for subscription in matched {
            let delivered = match subscription.kind {
                ChannelKind::Email => self.dispatch_email(listing, subscription).await,
                ChannelKind::Webhook => self.dispatch_webhook(listing, subscription).await,
                ChannelKind::Unknown => continue,
            };
            if delivered {
                outcome.sent += 1;
            } else {
                outcome.errors += 1;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cannon_core::{BedroomBucket, BedroomChoice, PriceBucket, PriceChoice};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn listing() -> Listing {
        Listing {
            listing_url: "https://thecannon.ca/classifieds/ad-100/".to_string(),
            listing_id: Some("ad-100".to_string()),
            image_url: Some("https://thecannon.ca/img/ad-100.jpg".to_string()),
            address: Some("55 Gordon St, Guelph".to_string()),
            description: Some("Bright two bedroom close to campus.".to_string()),
            price_int: Some(1200),
            price_string: Some("$1,200 / month".to_string()),
            bedroom_count: Some("2 Bedrooms".to_string()),
            bedroom_bucket: BedroomBucket::B2,
            price_bucket: PriceBucket::P1000To1499,
            additional_details: Default::default(),
            created_at: None,
            updated_at: None,
        }
    }

    fn email_subscription() -> Subscription {
        Subscription {
            id: Some("sub-1".to_string()),
            kind: ChannelKind::Email,
            email: Some("subscriber@example.com".to_string()),
            webhook_url: None,
            bedroom_preferences: Some(vec![BedroomChoice::B1, BedroomChoice::B2]),
            bedroom_preference: None,
            price_preferences: Some(vec![PriceChoice::Any]),
            price_preference: None,
            disabled: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn webhook_subscription() -> Subscription {
        Subscription {
            id: Some("sub-2".to_string()),
            kind: ChannelKind::Webhook,
            email: None,
            webhook_url: Some("https://discord.example/hook".to_string()),
            bedroom_preferences: Some(vec![BedroomChoice::Any]),
            bedroom_preference: None,
            price_preferences: Some(vec![PriceChoice::Any]),
            price_preference: None,
            disabled: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn links() -> LinkConfig {
        LinkConfig {
            unsubscribe_base_url: "https://thecannonalerts.ca/unsubscribe".to_string(),
            listings_overview_url: "https://thecannon.ca/housing/".to_string(),
        }
    }

    struct FixedRenderer(Option<String>);

    #[async_trait]
    impl EmailRenderer for FixedRenderer {
        async fn render(&self, _props: &EmailProps) -> Option<String> {
            self.0.clone()
        }
    }

    struct CountingEmail {
        sent: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl EmailTransport for CountingEmail {
        async fn send(&self, _to: &str, _subject: &str, _html: &str) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::UnexpectedStatus {
                    status: 500,
                    url: "https://api.mailgun.example".to_string(),
                });
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingWebhook {
        posted: Arc<AtomicUsize>,
        status: u16,
    }

    #[async_trait]
    impl WebhookTransport for CountingWebhook {
        async fn post(&self, url: &str, _payload: &JsonValue) -> Result<(), NotifyError> {
            self.posted.fetch_add(1, Ordering::SeqCst);
            if self.status == 204 {
                Ok(())
            } else {
                Err(NotifyError::UnexpectedStatus {
                    status: self.status,
                    url: url.to_string(),
                })
            }
        }
    }

    fn dispatcher(
        render: Option<String>,
        email_fail: bool,
        webhook_status: u16,
    ) -> (Dispatcher, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        let posted = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            Box::new(FixedRenderer(render)),
            Box::new(CountingEmail {
                sent: sent.clone(),
                fail: email_fail,
            }),
            Box::new(CountingWebhook {
                posted: posted.clone(),
                status: webhook_status,
            }),
            links(),
        );
        (dispatcher, sent, posted)
    }

    #[test]
    fn email_props_summarize_preferences() {
        let props = build_email_props(&listing(), &email_subscription(), &links());
        assert_eq!(props.price, "$1,200 / month");
        assert_eq!(props.bedrooms, "2 bedrooms");
        assert_eq!(props.subscription_bedrooms, "1 bedroom, 2 bedrooms");
        assert_eq!(props.subscription_price_range, "Any price");
        assert_eq!(
            props.unsubscribe_url,
            "https://thecannonalerts.ca/unsubscribe?id=sub-1"
        );
    }

    #[test]
    fn email_props_fall_back_for_missing_fields() {
        let mut bare = listing();
        bare.price_string = None;
        bare.price_int = None;
        bare.address = None;
        bare.description = None;
        let props = build_email_props(&bare, &email_subscription(), &links());
        assert_eq!(props.price, "$Unknown");
        assert_eq!(props.address, "Address not available");
        assert_eq!(props.description, "No description available");
    }

    #[test]
    fn unsubscribe_link_percent_encodes_the_id() {
        let links = links();
        assert_eq!(
            links.unsubscribe_url("sub-1"),
            "https://thecannonalerts.ca/unsubscribe?id=sub-1"
        );
        assert_eq!(
            links.unsubscribe_url("odd/id 1"),
            "https://thecannonalerts.ca/unsubscribe?id=odd%2Fid%201"
        );
    }

    #[test]
    fn subject_includes_price_and_address() {
        assert_eq!(
            email_subject(&listing()),
            "New TheCannon Match: $1,200 / month - 55 Gordon St, Guelph"
        );
    }

    #[test]
    fn webhook_payload_shape() {
        let payload = build_webhook_payload(&listing(), &webhook_subscription(), &links());
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "New TheCannon Listing Match!");
        assert_eq!(embed["color"], EMBED_COLOR);
        assert_eq!(embed["url"], "https://thecannon.ca/classifieds/ad-100/");
        assert_eq!(
            embed["thumbnail"]["url"],
            "https://thecannon.ca/img/ad-100.jpg"
        );
        let fields = embed["fields"].as_array().expect("fields");
        assert_eq!(fields[0]["name"], "Address");
        assert_eq!(fields[1]["value"], "$1,200 / month");
        assert_eq!(fields[2]["name"], "Bedrooms");
        let manage = fields.last().expect("manage field");
        assert_eq!(manage["name"], "Manage Subscription");
        assert!(manage["value"]
            .as_str()
            .expect("link text")
            .contains("unsubscribe?id=sub-2"));
    }

    #[test]
    fn long_descriptions_truncate_with_ellipsis() {
        let long = "x".repeat(450);
        let truncated = truncate_description(&long);
        assert_eq!(truncated.chars().count(), 200);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_description("short"), "short");
    }

    #[tokio::test]
    async fn mixed_batch_counts_per_subscription() {
        let (dispatcher, sent, posted) = dispatcher(Some("<html/>".to_string()), false, 204);
        let outcome = dispatcher
            .notify(&listing(), &[email_subscription(), webhook_subscription()])
            .await;
        assert_eq!(outcome, DispatchOutcome { sent: 2, errors: 0 });
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(posted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn webhook_non_204_counts_as_error_not_abort() {
        let (dispatcher, sent, _posted) = dispatcher(Some("<html/>".to_string()), false, 400);
        let outcome = dispatcher
            .notify(&listing(), &[webhook_subscription(), email_subscription()])
            .await;
        assert_eq!(outcome, DispatchOutcome { sent: 1, errors: 1 });
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn render_exhaustion_means_no_email_sent() {
        let (dispatcher, sent, _posted) = dispatcher(None, false, 204);
        let outcome = dispatcher.notify(&listing(), &[email_subscription()]).await;
        assert_eq!(outcome, DispatchOutcome { sent: 0, errors: 1 });
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn email_transport_failure_counts_and_continues() {
        let (dispatcher, _sent, posted) = dispatcher(Some("<html/>".to_string()), true, 204);
        let outcome = dispatcher
            .notify(&listing(), &[email_subscription(), webhook_subscription()])
            .await;
        assert_eq!(outcome, DispatchOutcome { sent: 1, errors: 1 });
        assert_eq!(posted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_channel_is_skipped_silently() {
        let mut odd = email_subscription();
        odd.kind = ChannelKind::Unknown;
        let (dispatcher, _sent, _posted) = dispatcher(Some("<html/>".to_string()), false, 204);
        let outcome = dispatcher.notify(&listing(), &[odd]).await;
        assert_eq!(outcome, DispatchOutcome { sent: 0, errors: 0 });
    }

    #[tokio::test]
    async fn renderer_without_endpoints_degrades_to_none() {
        let renderer = HttpEmailRenderer::new(reqwest::Client::new(), Vec::new());
        let props = build_email_props(&listing(), &email_subscription(), &links());
        assert!(renderer.render(&props).await.is_none());
    }

    /// Minimal endpoint that answers every request with a 500 and counts
    /// the hits.
    async fn spawn_failing_endpoint() -> (String, Arc<AtomicUsize>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 500 Internal Server Error\r\n\
                          content-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
            }
        });
        (format!("http://{addr}/render"), hits)
    }

    #[tokio::test]
    async fn render_attempt_budget_bounds_requests_to_a_failing_endpoint() {
        let (endpoint, hits) = spawn_failing_endpoint().await;
        let renderer = HttpEmailRenderer::new(reqwest::Client::new(), vec![endpoint])
            .with_backoff(BackoffPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            });
        let props = build_email_props(&listing(), &email_subscription(), &links());
        assert!(renderer.render(&props).await.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

//! Axum HTTP surface: manual ingestion trigger, subscription signup,
//! unsubscribe and public stats.
//!
//! Validation messages and response shapes are part of the public
//! contract; the signup form and unsubscribe emails link straight here.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cannon_core::{BedroomChoice, ChannelKind, PriceChoice, Subscription};
use cannon_ingest::IngestRunner;
use cannon_store::AlertStore;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, warn};

pub const CRATE_NAME: &str = "cannon-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AlertStore>,
    pub runner: Arc<dyn IngestRunner>,
}

impl AppState {
    pub fn new(store: Arc<dyn AlertStore>, runner: Arc<dyn IngestRunner>) -> Self {
        Self { store, runner }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(ingest_handler))
        .route("/subscriptions", post(create_subscription_handler))
        .route("/unsubscribe", get(unsubscribe_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

pub async fn serve_from_env(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("CANNON_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn ingest_handler(State(state): State<AppState>) -> Response {
    match state.runner.run().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => {
            error!(error = %err, "manual ingestion failed");
            internal_error()
        }
    }
}

/// Signup payload. Preferences arrive as raw tokens so an unknown value
/// can be echoed back in the validation message instead of failing
/// deserialization.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSubscriptionRequest {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "webhookUrl", default)]
    pub webhook_url: Option<String>,
    #[serde(rename = "bedroomPreferences", default)]
    pub bedroom_preferences: Option<Vec<String>>,
    #[serde(rename = "bedroomPreference", default)]
    pub bedroom_preference: Option<String>,
    #[serde(rename = "pricePreferences", default)]
    pub price_preferences: Option<Vec<String>>,
    #[serde(rename = "pricePreference", default)]
    pub price_preference: Option<String>,
}

fn bedroom_tokens() -> String {
    BedroomChoice::ALL
        .iter()
        .map(|c| c.token())
        .collect::<Vec<_>>()
        .join(", ")
}

fn price_tokens() -> String {
    PriceChoice::ALL
        .iter()
        .map(|c| c.token())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Validates the signup payload and shapes it into a storable document.
/// Legacy single-value preferences are accepted but always stored in
/// the array format.
pub fn validate_subscription_request(
    request: &CreateSubscriptionRequest,
) -> Result<Subscription, String> {
    let Some(kind_token) = request.kind.as_deref() else {
        return Err("Missing required field: type".to_string());
    };
    let Some(kind) = ChannelKind::from_token(kind_token) else {
        return Err("Invalid type. Must be one of: EMAIL, WEBHOOK".to_string());
    };

    let email = request.email.as_deref().filter(|e| !e.is_empty());
    let webhook_url = request.webhook_url.as_deref().filter(|u| !u.is_empty());

    match kind {
        ChannelKind::Email => {
            let Some(email) = email else {
                return Err("Email is required when type is EMAIL".to_string());
            };
            if !email.contains('@') {
                return Err("Invalid email format".to_string());
            }
        }
        ChannelKind::Webhook => {
            let Some(url) = webhook_url else {
                return Err("webhookUrl is required when type is WEBHOOK".to_string());
            };
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Invalid webhook URL format".to_string());
            }
        }
        ChannelKind::Unknown => {
            return Err("Invalid type. Must be one of: EMAIL, WEBHOOK".to_string());
        }
    }

    let bedroom_choices = match &request.bedroom_preferences {
        Some(tokens) => {
            if tokens.is_empty() {
                return Err("bedroomPreferences must be a non-empty array".to_string());
            }
            let mut choices = Vec::with_capacity(tokens.len());
            for token in tokens {
                match BedroomChoice::from_token(token) {
                    Some(choice) => choices.push(choice),
                    None => {
                        return Err(format!(
                            "Invalid bedroom preference '{token}'. Must be one of: {}",
                            bedroom_tokens()
                        ));
                    }
                }
            }
            choices
        }
        None => {
            let token = request.bedroom_preference.as_deref().unwrap_or("ANY");
            match BedroomChoice::from_token(token) {
                Some(choice) => vec![choice],
                None => {
                    return Err(format!(
                        "Invalid bedroomPreference. Must be one of: {}",
                        bedroom_tokens()
                    ));
                }
            }
        }
    };

    let price_choices = match &request.price_preferences {
        Some(tokens) => {
            if tokens.is_empty() {
                return Err("pricePreferences must be a non-empty array".to_string());
            }
            let mut choices = Vec::with_capacity(tokens.len());
            for token in tokens {
                match PriceChoice::from_token(token) {
                    Some(choice) => choices.push(choice),
                    None => {
                        return Err(format!(
                            "Invalid price preference '{token}'. Must be one of: {}",
                            price_tokens()
                        ));
                    }
                }
            }
            choices
        }
        None => {
            let token = request.price_preference.as_deref().unwrap_or("ANY");
            match PriceChoice::from_token(token) {
                Some(choice) => vec![choice],
                None => {
                    return Err(format!(
                        "Invalid pricePreference. Must be one of: {}",
                        price_tokens()
                    ));
                }
            }
        }
    };

    Ok(Subscription {
        id: None,
        kind,
        email: email.map(str::to_string),
        webhook_url: webhook_url.map(str::to_string),
        bedroom_preferences: Some(bedroom_choices),
        bedroom_preference: None,
        price_preferences: Some(price_choices),
        price_preference: None,
        disabled: None,
        created_at: None,
        updated_at: None,
    })
}

/// Looks for a stored subscription with the same destination and the
/// same preference sets (order-insensitive). A lookup failure is
/// treated as no duplicate; the worst case is one extra document.
async fn find_existing_subscription(
    store: &dyn AlertStore,
    candidate: &Subscription,
) -> Option<Subscription> {
    let destination = candidate.destination()?;
    let existing = match store
        .subscriptions_for_destination(candidate.kind, destination)
        .await
    {
        Ok(existing) => existing,
        Err(err) => {
            warn!(error = %err, "duplicate-subscription lookup failed");
            return None;
        }
    };
    existing.into_iter().find(|sub| {
        sub.canonical_bedroom_choices() == candidate.canonical_bedroom_choices()
            && sub.canonical_price_choices() == candidate.canonical_price_choices()
    })
}

async fn create_subscription_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Response {
    let candidate = match validate_subscription_request(&request) {
        Ok(candidate) => candidate,
        Err(message) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
                .into_response();
        }
    };

    if let Some(existing) = find_existing_subscription(state.store.as_ref(), &candidate).await {
        let existing_id = existing.id.clone().unwrap_or_default();
        if existing.is_active() {
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "You already have an active subscription with these preferences",
                    "existing_subscription_id": existing_id,
                })),
            )
                .into_response();
        }
        return match state
            .store
            .set_subscription_disabled(&existing_id, None)
            .await
        {
            Ok(()) => Json(json!({
                "success": true,
                "subscriptionDocumentReference": existing_id,
                "message": "Your previous subscription has been re-enabled successfully",
            }))
            .into_response(),
            Err(err) => {
                error!(error = %err, "failed to re-enable subscription");
                internal_error()
            }
        };
    }

    match state.store.add_subscription(&candidate).await {
        Ok(id) => Json(json!({
            "success": true,
            "subscriptionDocumentReference": id,
            "message": "Subscription created successfully",
        }))
        .into_response(),
        Err(err) => {
            error!(error = %err, "failed to store subscription");
            internal_error()
        }
    }
}

#[derive(Debug, Deserialize)]
struct UnsubscribeQuery {
    id: Option<String>,
}

const UNSUBSCRIBED_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Unsubscribed - TheCannon Alerts</title>
    <style>
        body { font-family: Arial, sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; text-align: center; }
        .success { color: #28a745; }
    </style>
</head>
<body>
    <h1 class="success">Successfully Unsubscribed</h1>
    <p>You have been unsubscribed from TheCannon listing alerts.</p>
    <p>You will no longer receive notifications for new listings.</p>
    <p><a href="https://thecannon.ca/housing/?wanted_forsale=forsale&sortby=date">Browse current listings on TheCannon</a></p>
</body>
</html>
"#;

async fn unsubscribe_handler(
    State(state): State<AppState>,
    Query(query): Query<UnsubscribeQuery>,
) -> Response {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Subscription ID is required" })),
        )
            .into_response();
    };

    match state.store.get_subscription(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Subscription not found" })),
            )
                .into_response();
        }
        Err(err) => {
            error!(error = %err, "unsubscribe lookup failed");
            return internal_error();
        }
    }

    match state
        .store
        .set_subscription_disabled(&id, Some(Utc::now()))
        .await
    {
        Ok(()) => Html(UNSUBSCRIBED_PAGE).into_response(),
        Err(err) => {
            error!(error = %err, "failed to disable subscription");
            internal_error()
        }
    }
}

/// Unique active subscribers (emails case-insensitive, webhook URLs
/// exact) + lifetime notification count summed over the audit trail.
async fn stats_handler(State(state): State<AppState>) -> Response {
    let subscriptions = match state.store.active_subscriptions().await {
        Ok(subscriptions) => subscriptions,
        Err(err) => {
            error!(error = %err, "stats subscription query failed");
            return stats_error();
        }
    };

    let mut unique_emails = HashSet::new();
    let mut unique_webhooks = HashSet::new();
    for sub in &subscriptions {
        if let Some(email) = &sub.email {
            unique_emails.insert(email.to_lowercase());
        }
        if let Some(url) = &sub.webhook_url {
            unique_webhooks.insert(url.clone());
        }
    }

    let records = match state.store.run_records().await {
        Ok(records) => records,
        Err(err) => {
            error!(error = %err, "stats run-record query failed");
            return stats_error();
        }
    };
    let total_notifications_sent: usize = records.iter().map(|r| r.notifications_sent).sum();

    Json(json!({
        "total_subscribers": unique_emails.len() + unique_webhooks.len(),
        "total_notifications_sent": total_notifications_sent,
    }))
    .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}

fn stats_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Failed to fetch statistics" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use cannon_core::IngestionRunRecord;
    use cannon_ingest::IngestRunSummary;
    use cannon_store::FileStore;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::tempdir;
    use tower::ServiceExt;

    struct StubRunner {
        fail: bool,
    }

    #[async_trait]
    impl IngestRunner for StubRunner {
        async fn run(&self) -> anyhow::Result<IngestRunSummary> {
            if self.fail {
                anyhow::bail!("index unreachable");
            }
            Ok(IngestRunSummary {
                started_at: Utc::now(),
                finished_at: Utc::now(),
                listings_processed: 2,
                notifications_sent: 3,
                notification_errors: 0,
                processed_listings: vec!["https://thecannon.ca/classifieds/ad-1/".to_string()],
            })
        }
    }

    fn test_app(dir: &tempfile::TempDir, fail_runner: bool) -> (Router, Arc<FileStore>) {
        let store = Arc::new(FileStore::new(dir.path()));
        let state = AppState::new(store.clone(), Arc::new(StubRunner { fail: fail_runner }));
        (app(state), store)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn creates_email_subscription() {
        let dir = tempdir().unwrap();
        let (app, store) = test_app(&dir, false);

        let response = app
            .oneshot(post_json(
                "/subscriptions",
                json!({
                    "type": "EMAIL",
                    "email": "subscriber@example.com",
                    "bedroomPreferences": ["B2", "B3"],
                    "pricePreferences": ["ANY"],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Subscription created successfully");
        let id = body["subscriptionDocumentReference"].as_str().unwrap();

        let stored = store.get_subscription(id).await.unwrap().unwrap();
        assert_eq!(stored.kind, ChannelKind::Email);
        assert_eq!(
            stored.bedroom_choices(),
            vec![BedroomChoice::B2, BedroomChoice::B3]
        );
        assert!(stored.is_active());
    }

    #[tokio::test]
    async fn validation_errors_are_400_with_message() {
        let dir = tempdir().unwrap();
        let (app, _store) = test_app(&dir, false);

        let cases = [
            (json!({}), "Missing required field: type"),
            (
                json!({"type": "PIGEON"}),
                "Invalid type. Must be one of: EMAIL, WEBHOOK",
            ),
            (
                json!({"type": "EMAIL"}),
                "Email is required when type is EMAIL",
            ),
            (
                json!({"type": "EMAIL", "email": "not-an-email"}),
                "Invalid email format",
            ),
            (
                json!({"type": "WEBHOOK"}),
                "webhookUrl is required when type is WEBHOOK",
            ),
            (
                json!({"type": "WEBHOOK", "webhookUrl": "ftp://hook"}),
                "Invalid webhook URL format",
            ),
            (
                json!({"type": "EMAIL", "email": "a@b.com", "bedroomPreferences": []}),
                "bedroomPreferences must be a non-empty array",
            ),
            (
                json!({"type": "EMAIL", "email": "a@b.com", "bedroomPreferences": ["B9"]}),
                "Invalid bedroom preference 'B9'. Must be one of: ANY, B1, B2, B3, B4, B5_PLUS",
            ),
            (
                json!({"type": "EMAIL", "email": "a@b.com", "pricePreferences": ["P9"]}),
                "Invalid price preference 'P9'. Must be one of: ANY, P0_399, P400_699, P700_999, P1000_1499, P1500_PLUS",
            ),
            (
                json!({"type": "EMAIL", "email": "a@b.com", "pricePreference": "CHEAP"}),
                "Invalid pricePreference. Must be one of: ANY, P0_399, P400_699, P700_999, P1000_1499, P1500_PLUS",
            ),
        ];

        for (payload, expected) in cases {
            let response = app
                .clone()
                .oneshot(post_json("/subscriptions", payload.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{payload}");
            let body = json_body(response).await;
            assert_eq!(body["error"], expected);
        }
    }

    #[tokio::test]
    async fn legacy_single_values_are_stored_as_arrays() {
        let dir = tempdir().unwrap();
        let (app, store) = test_app(&dir, false);

        let response = app
            .oneshot(post_json(
                "/subscriptions",
                json!({
                    "type": "EMAIL",
                    "email": "legacy@example.com",
                    "bedroomPreference": "B1",
                    "pricePreference": "P400_699",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let id = body["subscriptionDocumentReference"].as_str().unwrap();

        let stored = store.get_subscription(id).await.unwrap().unwrap();
        assert_eq!(stored.bedroom_preferences, Some(vec![BedroomChoice::B1]));
        assert_eq!(stored.price_preferences, Some(vec![PriceChoice::P400To699]));
        assert!(stored.bedroom_preference.is_none());
    }

    #[tokio::test]
    async fn duplicate_active_subscription_conflicts_regardless_of_order() {
        let dir = tempdir().unwrap();
        let (app, _store) = test_app(&dir, false);

        let first = app
            .clone()
            .oneshot(post_json(
                "/subscriptions",
                json!({
                    "type": "EMAIL",
                    "email": "dup@example.com",
                    "bedroomPreferences": ["B1", "B2"],
                    "pricePreferences": ["P0_399", "P400_699"],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first_id = json_body(first).await["subscriptionDocumentReference"]
            .as_str()
            .unwrap()
            .to_string();

        // Same sets, different element order.
        let second = app
            .oneshot(post_json(
                "/subscriptions",
                json!({
                    "type": "EMAIL",
                    "email": "dup@example.com",
                    "bedroomPreferences": ["B2", "B1"],
                    "pricePreferences": ["P400_699", "P0_399"],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let body = json_body(second).await;
        assert_eq!(
            body["error"],
            "You already have an active subscription with these preferences"
        );
        assert_eq!(body["existing_subscription_id"], first_id.as_str());
    }

    #[tokio::test]
    async fn resubscribing_after_unsubscribe_reenables() {
        let dir = tempdir().unwrap();
        let (app, store) = test_app(&dir, false);

        let payload = json!({
            "type": "WEBHOOK",
            "webhookUrl": "https://discord.example/hook",
            "bedroomPreferences": ["ANY"],
            "pricePreferences": ["ANY"],
        });
        let created = app
            .clone()
            .oneshot(post_json("/subscriptions", payload.clone()))
            .await
            .unwrap();
        let id = json_body(created).await["subscriptionDocumentReference"]
            .as_str()
            .unwrap()
            .to_string();

        let unsubscribed = app
            .clone()
            .oneshot(get(&format!("/unsubscribe?id={id}")))
            .await
            .unwrap();
        assert_eq!(unsubscribed.status(), StatusCode::OK);
        assert!(!store.get_subscription(&id).await.unwrap().unwrap().is_active());

        let again = app
            .oneshot(post_json("/subscriptions", payload))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        let body = json_body(again).await;
        assert_eq!(
            body["message"],
            "Your previous subscription has been re-enabled successfully"
        );
        assert_eq!(body["subscriptionDocumentReference"], id.as_str());
        assert!(store.get_subscription(&id).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn unsubscribe_requires_a_known_id() {
        let dir = tempdir().unwrap();
        let (app, _store) = test_app(&dir, false);

        let missing = app.clone().oneshot(get("/unsubscribe")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(missing).await["error"],
            "Subscription ID is required"
        );

        let unknown = app
            .oneshot(get("/unsubscribe?id=does-not-exist"))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(unknown).await["error"], "Subscription not found");
    }

    #[tokio::test]
    async fn stats_count_unique_destinations_and_sum_notifications() {
        let dir = tempdir().unwrap();
        let (app, store) = test_app(&dir, false);

        let email_sub = |email: &str| Subscription {
            id: None,
            kind: ChannelKind::Email,
            email: Some(email.to_string()),
            webhook_url: None,
            bedroom_preferences: Some(vec![BedroomChoice::Any]),
            bedroom_preference: None,
            price_preferences: Some(vec![PriceChoice::Any]),
            price_preference: None,
            disabled: None,
            created_at: None,
            updated_at: None,
        };
        store.add_subscription(&email_sub("User@Example.com")).await.unwrap();
        store.add_subscription(&email_sub("user@example.com")).await.unwrap();
        let mut webhook = email_sub("ignored");
        webhook.kind = ChannelKind::Webhook;
        webhook.email = None;
        webhook.webhook_url = Some("https://discord.example/hook".to_string());
        store.add_subscription(&webhook).await.unwrap();
        let disabled_id = store
            .add_subscription(&email_sub("gone@example.com"))
            .await
            .unwrap();
        store
            .set_subscription_disabled(&disabled_id, Some(Utc::now()))
            .await
            .unwrap();

        for sent in [3usize, 4] {
            store
                .append_run(&IngestionRunRecord {
                    timestamp: Utc::now(),
                    new_listings_count: 1,
                    notifications_sent: sent,
                    notification_errors: 0,
                    processed_listings: vec![],
                })
                .await
                .unwrap();
        }

        let response = app.oneshot(get("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        // Case-insensitive email uniqueness: 1 email + 1 webhook.
        assert_eq!(body["total_subscribers"], 2);
        assert_eq!(body["total_notifications_sent"], 7);
    }

    #[tokio::test]
    async fn ingest_trigger_returns_summary_or_500() {
        let dir = tempdir().unwrap();
        let (app, _store) = test_app(&dir, false);
        let ok = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = json_body(ok).await;
        assert_eq!(body["listings_processed"], 2);
        assert_eq!(body["notifications_sent"], 3);

        let (app, _store) = test_app(&dir, true);
        let failed = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(failed).await["error"], "Internal server error");
    }
}

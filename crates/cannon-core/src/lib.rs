//! Core domain model for cannon-alerts: listings, attribute buckets,
//! subscription preferences and the matching rules between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cannon-core";

/// Coarse bedroom-count category derived from the raw listing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BedroomBucket {
    B1,
    B2,
    B3,
    B4,
    #[serde(rename = "B5_PLUS")]
    B5Plus,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl BedroomBucket {
    /// Buckets the first integer found in the raw bedroom text.
    /// Anything unparseable lands in `Unknown`; this never fails.
    pub fn from_text(text: Option<&str>) -> Self {
        let Some(text) = text else {
            return Self::Unknown;
        };
        match first_integer(text) {
            Some(1) => Self::B1,
            Some(2) => Self::B2,
            Some(3) => Self::B3,
            Some(4) => Self::B4,
            Some(n) if n >= 5 => Self::B5Plus,
            _ => Self::Unknown,
        }
    }

    pub fn readable(&self) -> &'static str {
        match self {
            Self::B1 => "1 bedroom",
            Self::B2 => "2 bedrooms",
            Self::B3 => "3 bedrooms",
            Self::B4 => "4 bedrooms",
            Self::B5Plus => "5+ bedrooms",
            Self::Unknown => "Unknown bedrooms",
        }
    }
}

/// Coarse monthly-price band. Band upper bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceBucket {
    #[serde(rename = "P0_399")]
    P0To399,
    #[serde(rename = "P400_699")]
    P400To699,
    #[serde(rename = "P700_999")]
    P700To999,
    #[serde(rename = "P1000_1499")]
    P1000To1499,
    #[serde(rename = "P1500_PLUS")]
    P1500Plus,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl PriceBucket {
    pub fn from_price(price: Option<i64>) -> Self {
        match price {
            None => Self::Unknown,
            Some(p) if p <= 0 => Self::Unknown,
            Some(p) if p <= 399 => Self::P0To399,
            Some(p) if p <= 699 => Self::P400To699,
            Some(p) if p <= 999 => Self::P700To999,
            Some(p) if p <= 1499 => Self::P1000To1499,
            Some(_) => Self::P1500Plus,
        }
    }

    pub fn readable(&self) -> &'static str {
        match self {
            Self::P0To399 => "$0-399",
            Self::P400To699 => "$400-699",
            Self::P700To999 => "$700-999",
            Self::P1000To1499 => "$1000-1499",
            Self::P1500Plus => "$1500+",
            Self::Unknown => "Any price",
        }
    }
}

fn first_integer(text: &str) -> Option<u64> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    // A digit run too long for u64 still means "a lot of bedrooms".
    Some(digits.parse().unwrap_or(u64::MAX))
}

/// Subscription preference token for the bedroom dimension.
///
/// `Unknown` is deliberately not representable here: a listing with an
/// unknown bedroom bucket can only reach subscribers who chose `Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BedroomChoice {
    #[serde(rename = "ANY")]
    Any,
    B1,
    B2,
    B3,
    B4,
    #[serde(rename = "B5_PLUS")]
    B5Plus,
}

impl BedroomChoice {
    pub const ALL: [Self; 6] = [
        Self::Any,
        Self::B1,
        Self::B2,
        Self::B3,
        Self::B4,
        Self::B5Plus,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Self::Any => "ANY",
            Self::B1 => "B1",
            Self::B2 => "B2",
            Self::B3 => "B3",
            Self::B4 => "B4",
            Self::B5Plus => "B5_PLUS",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.token() == token)
    }

    pub fn matches(&self, bucket: BedroomBucket) -> bool {
        match self {
            Self::Any => true,
            Self::B1 => bucket == BedroomBucket::B1,
            Self::B2 => bucket == BedroomBucket::B2,
            Self::B3 => bucket == BedroomBucket::B3,
            Self::B4 => bucket == BedroomBucket::B4,
            Self::B5Plus => bucket == BedroomBucket::B5Plus,
        }
    }

    pub fn readable(&self) -> &'static str {
        match self {
            Self::Any => "Any",
            Self::B1 => BedroomBucket::B1.readable(),
            Self::B2 => BedroomBucket::B2.readable(),
            Self::B3 => BedroomBucket::B3.readable(),
            Self::B4 => BedroomBucket::B4.readable(),
            Self::B5Plus => BedroomBucket::B5Plus.readable(),
        }
    }
}

/// Subscription preference token for the price dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriceChoice {
    #[serde(rename = "ANY")]
    Any,
    #[serde(rename = "P0_399")]
    P0To399,
    #[serde(rename = "P400_699")]
    P400To699,
    #[serde(rename = "P700_999")]
    P700To999,
    #[serde(rename = "P1000_1499")]
    P1000To1499,
    #[serde(rename = "P1500_PLUS")]
    P1500Plus,
}

impl PriceChoice {
    pub const ALL: [Self; 6] = [
        Self::Any,
        Self::P0To399,
        Self::P400To699,
        Self::P700To999,
        Self::P1000To1499,
        Self::P1500Plus,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Self::Any => "ANY",
            Self::P0To399 => "P0_399",
            Self::P400To699 => "P400_699",
            Self::P700To999 => "P700_999",
            Self::P1000To1499 => "P1000_1499",
            Self::P1500Plus => "P1500_PLUS",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.token() == token)
    }

    pub fn matches(&self, bucket: PriceBucket) -> bool {
        match self {
            Self::Any => true,
            Self::P0To399 => bucket == PriceBucket::P0To399,
            Self::P400To699 => bucket == PriceBucket::P400To699,
            Self::P700To999 => bucket == PriceBucket::P700To999,
            Self::P1000To1499 => bucket == PriceBucket::P1000To1499,
            Self::P1500Plus => bucket == PriceBucket::P1500Plus,
        }
    }

    pub fn readable(&self) -> &'static str {
        match self {
            Self::Any => "Any price",
            Self::P0To399 => PriceBucket::P0To399.readable(),
            Self::P400To699 => PriceBucket::P400To699.readable(),
            Self::P700To999 => PriceBucket::P700To999.readable(),
            Self::P1000To1499 => PriceBucket::P1000To1499.readable(),
            Self::P1500Plus => PriceBucket::P1500Plus.readable(),
        }
    }
}

/// Notification channel. Stored documents may carry values outside the
/// known set; those deserialize as `Unknown` and are skipped at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    #[serde(rename = "EMAIL")]
    Email,
    #[serde(rename = "WEBHOOK")]
    Webhook,
    #[serde(other)]
    Unknown,
}

impl ChannelKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "EMAIL" => Some(Self::Email),
            "WEBHOOK" => Some(Self::Webhook),
            _ => None,
        }
    }
}

/// Supplementary listing attributes pulled from the detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingDetails {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub date_available: Option<String>,
    #[serde(default)]
    pub shared: Option<String>,
    #[serde(default)]
    pub sublet: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// A scraped housing listing. The persisted form is keyed by
/// [`listing_id_from_url`]; re-persisting the same id is an idempotent
/// overwrite, never a duplicate row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_url: String,
    #[serde(default)]
    pub listing_id: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price_int: Option<i64>,
    #[serde(default)]
    pub price_string: Option<String>,
    #[serde(default)]
    pub bedroom_count: Option<String>,
    pub bedroom_bucket: BedroomBucket,
    pub price_bucket: PriceBucket,
    #[serde(default)]
    pub additional_details: ListingDetails,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Derives the stable listing identifier: the last non-empty path segment
/// of the source URL, ignoring any query string or fragment.
pub fn listing_id_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// A subscriber's alert profile. Field names mirror the stored document
/// schema; the single-value `bedroomPreference`/`pricePreference` fields
/// are the legacy format and stay readable forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "webhookUrl", default)]
    pub webhook_url: Option<String>,
    #[serde(rename = "bedroomPreferences", default)]
    pub bedroom_preferences: Option<Vec<BedroomChoice>>,
    #[serde(rename = "bedroomPreference", default, skip_serializing_if = "Option::is_none")]
    pub bedroom_preference: Option<BedroomChoice>,
    #[serde(rename = "pricePreferences", default)]
    pub price_preferences: Option<Vec<PriceChoice>>,
    #[serde(rename = "pricePreference", default, skip_serializing_if = "Option::is_none")]
    pub price_preference: Option<PriceChoice>,
    #[serde(default)]
    pub disabled: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt", default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.disabled.is_none()
    }

    /// Destination address for the subscription's channel.
    pub fn destination(&self) -> Option<&str> {
        match self.kind {
            ChannelKind::Email => self.email.as_deref(),
            ChannelKind::Webhook => self.webhook_url.as_deref(),
            ChannelKind::Unknown => None,
        }
    }

    pub fn bedroom_choices(&self) -> Vec<BedroomChoice> {
        normalize_bedroom_preferences(
            self.bedroom_preferences.as_deref(),
            self.bedroom_preference,
        )
    }

    pub fn price_choices(&self) -> Vec<PriceChoice> {
        normalize_price_preferences(self.price_preferences.as_deref(), self.price_preference)
    }

    /// Sorted preference arrays, the form used for duplicate detection.
    pub fn canonical_bedroom_choices(&self) -> Vec<BedroomChoice> {
        let mut choices = self.bedroom_choices();
        choices.sort();
        choices
    }

    pub fn canonical_price_choices(&self) -> Vec<PriceChoice> {
        let mut choices = self.price_choices();
        choices.sort();
        choices
    }

    pub fn matches(&self, bedroom_bucket: BedroomBucket, price_bucket: PriceBucket) -> bool {
        let bedroom_ok = self.bedroom_choices().iter().any(|c| c.matches(bedroom_bucket));
        let price_ok = self.price_choices().iter().any(|c| c.matches(price_bucket));
        bedroom_ok && price_ok
    }
}

/// The sole read path for bedroom preferences: an array field is used
/// verbatim, otherwise the legacy single value, defaulting to `ANY`.
pub fn normalize_bedroom_preferences(
    array: Option<&[BedroomChoice]>,
    legacy: Option<BedroomChoice>,
) -> Vec<BedroomChoice> {
    match array {
        Some(choices) => choices.to_vec(),
        None => vec![legacy.unwrap_or(BedroomChoice::Any)],
    }
}

/// The sole read path for price preferences; see [`normalize_bedroom_preferences`].
pub fn normalize_price_preferences(
    array: Option<&[PriceChoice]>,
    legacy: Option<PriceChoice>,
) -> Vec<PriceChoice> {
    match array {
        Some(choices) => choices.to_vec(),
        None => vec![legacy.unwrap_or(PriceChoice::Any)],
    }
}

/// Filters the active subscription set down to those whose preferences
/// intersect the listing's buckets, preserving input order. Staleness
/// filtering belongs to the store query, not here.
pub fn matching_subscriptions(
    bedroom_bucket: BedroomBucket,
    price_bucket: PriceBucket,
    subscriptions: &[Subscription],
) -> Vec<Subscription> {
    subscriptions
        .iter()
        .filter(|s| s.matches(bedroom_bucket, price_bucket))
        .cloned()
        .collect()
}

/// "Any" when the wildcard is present, otherwise the readable labels
/// comma-joined. Shown in rendered emails.
pub fn readable_bedroom_summary(choices: &[BedroomChoice]) -> String {
    if choices.contains(&BedroomChoice::Any) {
        return "Any".to_string();
    }
    choices
        .iter()
        .map(|c| c.readable())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn readable_price_summary(choices: &[PriceChoice]) -> String {
    if choices.contains(&PriceChoice::Any) {
        return "Any price".to_string();
    }
    choices
        .iter()
        .map(|c| c.readable())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Append-only audit entry written after each scheduled ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRunRecord {
    pub timestamp: DateTime<Utc>,
    pub new_listings_count: usize,
    pub notifications_sent: usize,
    pub notification_errors: usize,
    #[serde(default)]
    pub processed_listings: Vec<String>,
}

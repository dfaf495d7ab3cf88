//! Listing-source contract + the TheCannon classifieds HTML adapter.
//!
//! Extraction is nil-tolerant: a missing field on the page yields `None`
//! and the bucket derivation absorbs it as `UNKNOWN`. A markup schema
//! change on the source invalidates these selectors.

use async_trait::async_trait;
use cannon_core::{BedroomBucket, Listing, ListingDetails, PriceBucket};
use cannon_store::{FetchError, PageFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "cannon-scrape";

pub const DEFAULT_INDEX_URL: &str =
    "https://thecannon.ca/housing/?search=&search2=&wanted_forsale=forsale&sortby=date&viewmode=grid";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Read-only view of the listing source: a summary index page and one
/// detail page per listing.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Fetches the index and returns the detail-page URL of every
    /// listing summary, in page order.
    async fn fetch_index(&self, fetcher: &PageFetcher) -> Result<Vec<String>, SourceError>;

    /// Fetches one detail page and extracts the full listing, buckets
    /// included.
    async fn fetch_detail(&self, fetcher: &PageFetcher, url: &str)
        -> Result<Listing, SourceError>;
}

#[derive(Debug, Clone)]
pub struct CannonSource {
    index_url: String,
}

impl Default for CannonSource {
    fn default() -> Self {
        Self {
            index_url: DEFAULT_INDEX_URL.to_string(),
        }
    }
}

impl CannonSource {
    pub fn new(index_url: impl Into<String>) -> Self {
        Self {
            index_url: index_url.into(),
        }
    }
}

#[async_trait]
impl ListingSource for CannonSource {
    fn source_id(&self) -> &'static str {
        "thecannon"
    }

    async fn fetch_index(&self, fetcher: &PageFetcher) -> Result<Vec<String>, SourceError> {
        let html = fetcher.fetch_text(&self.index_url).await?;
        parse_index_urls(&html)
    }

    async fn fetch_detail(
        &self,
        fetcher: &PageFetcher,
        url: &str,
    ) -> Result<Listing, SourceError> {
        let html = fetcher.fetch_text(url).await?;
        parse_listing_detail(url, &html)
    }
}

fn selector(raw: &str) -> Result<Selector, SourceError> {
    Selector::parse(raw).map_err(|err| SourceError::Selector {
        selector: raw.to_string(),
        message: err.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, raw: &str) -> Result<Option<String>, SourceError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    document: &Html,
    raw: &str,
    attr: &str,
) -> Result<Option<String>, SourceError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn select_all_texts(document: &Html, raw: &str) -> Result<Vec<String>, SourceError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

/// The detail page lays out attributes as `<dt>Label</dt><dd>value</dd>`
/// pairs; this finds the `dd` following the `dt` with the given label.
fn dd_after_dt(document: &Html, label: &str) -> Result<Option<String>, SourceError> {
    let dt_sel = selector("dt")?;
    for dt in document.select(&dt_sel) {
        let text = dt.text().collect::<String>();
        if text.trim() != label {
            continue;
        }
        let dd = dt
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "dd");
        return Ok(dd.and_then(|el| text_or_none(el.text().collect::<String>())));
    }
    Ok(None)
}

/// Pulls the first `$1,234`-style amount out of a price label.
fn parse_price_amount(text: &str) -> Option<i64> {
    let mut digits = String::new();
    let mut started = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            started = true;
        } else if ch == ',' && started {
            continue;
        } else if started {
            break;
        }
    }
    digits.parse().ok()
}

/// Extracts every listing detail URL from the index page, in page order.
pub fn parse_index_urls(html: &str) -> Result<Vec<String>, SourceError> {
    let document = Html::parse_document(html);
    let item_sel = selector("li.housing-item h2 a")?;
    Ok(document
        .select(&item_sel)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| text_or_none(href.to_string()))
        .collect())
}

/// Extracts all listing fields from a detail page and derives the
/// matching buckets. Every field tolerates absence.
pub fn parse_listing_detail(url: &str, html: &str) -> Result<Listing, SourceError> {
    let document = Html::parse_document(html);

    let image_url = match select_first_attr(&document, r#"meta[property="og:image"]"#, "content")? {
        Some(content) => Some(content),
        None => select_first_attr(&document, ".masonry.lightbox-gallery li a", "href")?,
    };

    let address = select_first_text(&document, ".classified-details .row .md")?;

    let description = select_first_text(&document, ".classified-details .description")?
        .map(|text| text.replace("More Information", "").trim().to_string())
        .and_then(text_or_none);

    let price_string = select_first_text(&document, ".classified-details .row strong")?;
    let price_int = price_string.as_deref().and_then(parse_price_amount);

    let bedroom_count = dd_after_dt(&document, "Beds")?;

    let additional_details = ListingDetails {
        category: dd_after_dt(&document, "Category")?,
        date_available: dd_after_dt(&document, "Date Available")?,
        shared: dd_after_dt(&document, "Shared")?,
        sublet: dd_after_dt(&document, "Sublet")?,
        features: select_all_texts(&document, ".housing-features .tooltip")?,
    };

    if address.is_none() && price_string.is_none() && bedroom_count.is_none() {
        warn!(url, "detail page yielded no recognizable fields");
    }

    let bedroom_bucket = BedroomBucket::from_text(bedroom_count.as_deref());
    let price_bucket = PriceBucket::from_price(price_int);

    Ok(Listing {
        listing_url: url.to_string(),
        listing_id: None,
        image_url,
        address,
        description,
        price_int,
        price_string,
        bedroom_count,
        bedroom_bucket,
        price_bucket,
        additional_details,
        created_at: None,
        updated_at: None,
    })
}

//! External movie metadata sources: the IMDb scraper and a fixture-backed source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use letterbox_core::{name_key, MovieMetadata, DIRECTOR_PLACEHOLDER, SYNOPSIS_PLACEHOLDER};
use letterbox_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "letterbox-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.imdb.com";
pub const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
);

/// Why a metadata lookup produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ScrapeFailure {
    #[error("movie not found on the external site")]
    NotFound,
    #[error("detail page did not contain a title")]
    IncompleteData,
    #[error("timed out contacting the external site")]
    Timeout,
    #[error("error fetching movie data: {0}")]
    FetchError(String),
}

impl From<FetchError> for ScrapeFailure {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout { .. } => ScrapeFailure::Timeout,
            FetchError::NotFound { .. } => ScrapeFailure::NotFound,
            other => ScrapeFailure::FetchError(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Single best-effort lookup. No retries.
    async fn fetch(&self, movie_name: &str) -> Result<MovieMetadata, ScrapeFailure>;
}

/// One way of reading a raw value out of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    /// Trimmed text of the first matching element.
    Text(&'static str),
    /// Attribute of the first matching element.
    Attr(&'static str, &'static str),
    /// Four digits wrapped in parentheses inside the element text, e.g. `Heat (1995)`.
    ParenthesizedYear(&'static str),
}

pub const SEARCH_RESULT_CHAIN: &[Extractor] = &[
    Extractor::Attr(".find-title-result a", "href"),
    Extractor::Attr(".findResult .result_text a", "href"),
];

pub const TITLE_CHAIN: &[Extractor] = &[
    Extractor::Text(r#"[data-testid="hero__primary-text"]"#),
    Extractor::Text(r#"h1[data-testid="hero-title-block__title"]"#),
];

pub const SYNOPSIS_CHAIN: &[Extractor] = &[
    Extractor::Text(r#"[data-testid="plot-l"]"#),
    Extractor::Text(".plot_summary .summary_text"),
];

pub const POSTER_CHAIN: &[Extractor] = &[
    Extractor::Attr(".ipc-image", "src"),
    Extractor::Attr(".poster img", "src"),
];

pub const DIRECTOR_CHAIN: &[Extractor] = &[
    Extractor::Text(r#"a[href*="tt_ov_dr"]"#),
    Extractor::Text(".credit_summary_item a"),
];

pub const YEAR_CHAIN: &[Extractor] = &[
    Extractor::Text(r#"a[href*="releaseinfo"]"#),
    Extractor::ParenthesizedYear(".title_wrapper h1"),
];

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_selector(css: &str) -> Result<Selector, ScrapeFailure> {
    Selector::parse(css)
        .map_err(|e| ScrapeFailure::FetchError(format!("invalid selector {css}: {e}")))
}

fn parenthesized_year(text: &str) -> Option<String> {
    let chars = text.chars().collect::<Vec<_>>();
    chars.windows(6).find_map(|w| {
        let digits = &w[1..5];
        if w[0] == '(' && w[5] == ')' && digits.iter().all(|c| c.is_ascii_digit()) {
            Some(digits.iter().collect())
        } else {
            None
        }
    })
}

impl Extractor {
    pub fn extract(&self, document: &Html) -> Result<Option<String>, ScrapeFailure> {
        let raw = match self {
            Extractor::Text(css) => {
                let sel = parse_selector(css)?;
                document
                    .select(&sel)
                    .next()
                    .and_then(|n| text_or_none(&n.text().collect::<String>()))
            }
            Extractor::Attr(css, attr) => {
                let sel = parse_selector(css)?;
                document
                    .select(&sel)
                    .next()
                    .and_then(|n| n.value().attr(attr))
                    .and_then(text_or_none)
            }
            Extractor::ParenthesizedYear(css) => {
                let sel = parse_selector(css)?;
                document
                    .select(&sel)
                    .next()
                    .and_then(|n| parenthesized_year(&n.text().collect::<String>()))
            }
        };
        Ok(raw)
    }
}

/// Walks the chain and returns the first extractor value that `parse` accepts.
pub fn first_value<T>(
    document: &Html,
    chain: &[Extractor],
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ScrapeFailure> {
    for extractor in chain {
        if let Some(value) = extractor.extract(document)?.as_deref().and_then(&parse) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn as_text(value: &str) -> Option<String> {
    text_or_none(value)
}

/// Leading four-digit year of strings like `2010` or `1999–2003`.
pub fn parse_year(value: &str) -> Option<i32> {
    let digits = value
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.len() != 4 {
        return None;
    }
    digits.parse().ok()
}

/// Detail link of the first search result, if any.
pub fn parse_search_page(html: &str) -> Result<Option<String>, ScrapeFailure> {
    let document = Html::parse_document(html);
    first_value(&document, SEARCH_RESULT_CHAIN, as_text)
}

/// Normalizes a detail page into metadata. Only the title is mandatory.
pub fn parse_detail_page(html: &str) -> Result<MovieMetadata, ScrapeFailure> {
    let document = Html::parse_document(html);

    let Some(name) = first_value(&document, TITLE_CHAIN, as_text)? else {
        return Err(ScrapeFailure::IncompleteData);
    };
    let synopsis = first_value(&document, SYNOPSIS_CHAIN, as_text)?
        .unwrap_or_else(|| SYNOPSIS_PLACEHOLDER.to_string());
    let poster_url = first_value(&document, POSTER_CHAIN, as_text)?;
    let director = first_value(&document, DIRECTOR_CHAIN, as_text)?
        .unwrap_or_else(|| DIRECTOR_PLACEHOLDER.to_string());
    let release_year = first_value(&document, YEAR_CHAIN, parse_year)?;

    Ok(MovieMetadata {
        name,
        synopsis,
        poster_url,
        director,
        release_year,
    })
}

pub struct ImdbScraper {
    http: HttpFetcher,
    base_url: Url,
}

impl ImdbScraper {
    pub fn new(http: HttpFetcher, base_url: &str) -> Result<Self, AdapterError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| {
                AdapterError::Message(format!("invalid scraper base url {base_url}: {e}"))
            })?;
        Ok(Self { http, base_url })
    }

    pub fn search_url(&self, movie_name: &str) -> Result<Url, ScrapeFailure> {
        let mut url = self
            .base_url
            .join("/find")
            .map_err(|e| ScrapeFailure::FetchError(e.to_string()))?;
        url.query_pairs_mut().append_pair("q", movie_name);
        Ok(url)
    }
}

#[async_trait]
impl MetadataSource for ImdbScraper {
    fn source_id(&self) -> &'static str {
        "imdb"
    }

    async fn fetch(&self, movie_name: &str) -> Result<MovieMetadata, ScrapeFailure> {
        let movie_name = movie_name.trim();
        if movie_name.is_empty() {
            return Err(ScrapeFailure::NotFound);
        }
        info!(movie_name, "scraping movie metadata");

        let search_url = self.search_url(movie_name)?;
        let search = self.http.fetch(search_url.as_str()).await?;
        let Some(href) = parse_search_page(&search.text())? else {
            warn!(movie_name, "no search results");
            return Err(ScrapeFailure::NotFound);
        };

        let detail_url = self
            .base_url
            .join(&href)
            .map_err(|e| ScrapeFailure::FetchError(format!("bad detail link {href}: {e}")))?;
        info!(url = %detail_url, "fetching detail page");
        let detail = self.http.fetch(detail_url.as_str()).await?;
        let metadata = parse_detail_page(&detail.text())?;

        info!(title = %metadata.name, year = ?metadata.release_year, "metadata extracted");
        Ok(metadata)
    }
}

/// Serves canned lookups keyed by case-insensitive name. Unknown names are `NotFound`.
#[derive(Debug, Default)]
pub struct FixtureMetadataSource {
    entries: HashMap<String, Result<MovieMetadata, ScrapeFailure>>,
    calls: AtomicUsize,
}

impl FixtureMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_movie(mut self, query: &str, metadata: MovieMetadata) -> Self {
        self.entries.insert(name_key(query), Ok(metadata));
        self
    }

    pub fn with_failure(mut self, query: &str, failure: ScrapeFailure) -> Self {
        self.entries.insert(name_key(query), Err(failure));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for FixtureMetadataSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(&self, movie_name: &str) -> Result<MovieMetadata, ScrapeFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entries
            .get(&name_key(movie_name))
            .cloned()
            .unwrap_or(Err(ScrapeFailure::NotFound))
    }
}

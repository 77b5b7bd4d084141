//! Catalog persistence + HTTP fetch utilities for Letterbox.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use letterbox_core::{Movie, MovieReview, NewMovie, Review, User};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

mod memory;
mod postgres;

pub use memory::MemoryCatalogStore;
pub use postgres::{PgCatalogStore, MIGRATOR};

pub const CRATE_NAME: &str = "letterbox-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique or check constraint rejected the write.
    #[error("constraint violated: {0}")]
    Conflict(String),
    /// A foreign key pointed at a row that does not exist.
    #[error("missing referenced row: {0}")]
    MissingReference(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                // unique_violation, check_violation
                Some("23505") | Some("23514") => {
                    return StoreError::Conflict(db.message().to_string());
                }
                // foreign_key_violation
                Some("23503") => return StoreError::MissingReference(db.message().to_string()),
                _ => {}
            }
        }
        StoreError::Database(err)
    }
}

/// Insert-or-update request keyed on the (user, movie) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewUpsert {
    pub user_id: i64,
    pub movie_id: i64,
    pub rating: i16,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertedReview {
    pub review: Review,
    /// `false` when an existing review for the pair was overwritten.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MovieInsert {
    Created(Movie),
    /// A movie with the same case-insensitive name was already stored.
    Existing(Movie),
}

/// Durable record of users, movies and reviews.
///
/// Implementations serialize conflicting writes: concurrent upserts of the same
/// (user, movie) pair collapse into one row, and `recompute_average` for one
/// movie never interleaves with another recompute of the same movie.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_movies(&self) -> Result<Vec<Movie>, StoreError>;

    /// Case-insensitive substring match on the movie name, ordered by name.
    async fn search_movies(&self, query: &str) -> Result<Vec<Movie>, StoreError>;

    async fn get_movie(&self, movie_id: i64) -> Result<Option<Movie>, StoreError>;

    async fn find_movie_by_name(&self, name: &str) -> Result<Option<Movie>, StoreError>;

    /// Inserts the movie unless one with the same case-insensitive name exists.
    /// The lookup and insert are atomic with respect to other callers.
    async fn insert_movie_if_absent(&self, movie: &NewMovie) -> Result<MovieInsert, StoreError>;

    /// Reviews for a movie, newest first.
    async fn list_reviews(&self, movie_id: i64) -> Result<Vec<MovieReview>, StoreError>;

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError>;

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError>;

    async fn upsert_review(&self, review: &ReviewUpsert) -> Result<UpsertedReview, StoreError>;

    /// Writes `round(mean(rating), 2)` (or `0.0`) onto the movie and returns it.
    async fn recompute_average(&self, movie_id: i64) -> Result<f64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Responses larger than this are abandoned mid-read.
    pub max_body_bytes: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 4,
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("{url} not found")]
    NotFound { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("request failed: {0}")]
    Request(reqwest::Error),
}

pub fn classify_reqwest_error(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}

/// Single-attempt HTTP GET client. Failures are returned as-is; no retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    max_body_bytes: usize,
}

impl HttpFetcher {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_fetch", url);
        async {
            let mut resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| classify_reqwest_error(err, url))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            debug!(status = status.as_u16(), "response received");

            if status == StatusCode::NOT_FOUND {
                return Err(FetchError::NotFound { url: final_url });
            }
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let limit = self.max_body_bytes;
            let too_large = |url: &str| FetchError::TooLarge {
                url: url.to_string(),
                limit,
            };
            if resp.content_length().is_some_and(|len| len > limit as u64) {
                return Err(too_large(&final_url));
            }

            let mut body = Vec::new();
            while let Some(chunk) = resp
                .chunk()
                .await
                .map_err(|err| classify_reqwest_error(err, &final_url))?
            {
                if body.len() + chunk.len() > limit {
                    return Err(too_large(&final_url));
                }
                body.extend_from_slice(&chunk);
            }
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

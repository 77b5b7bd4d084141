//! Axum JSON API and live-update stream for Letterbox.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use letterbox_adapters::{ImdbScraper, MetadataSource, DEFAULT_BASE_URL, DEFAULT_USER_AGENT};
use letterbox_core::RatingInput;
use letterbox_services::{
    CatalogQueries, IngestStatus, IngestionService, NotificationBus, ReviewService,
};
use letterbox_storage::{
    CatalogStore, HttpClientConfig, HttpFetcher, MemoryCatalogStore, PgCatalogStore, StoreError,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

mod auth;
mod error;

pub use auth::{
    hash_password, hash_password_blocking, verify_password, verify_password_blocking, Actor,
    TokenIssuer, TokenRejection,
};
pub use error::{ApiError, ApiFailure};

pub const CRATE_NAME: &str = "letterbox-web";

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Only an explicit `development` relaxes error disclosure.
    fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("development") {
            Environment::Development
        } else {
            Environment::Production
        }
    }

    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

#[derive(Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub port: u16,
    pub environment: Environment,
    pub scraper_base_url: String,
    pub scraper_timeout: Duration,
    pub scraper_user_agent: String,
    pub event_bus_capacity: usize,
    pub db_max_connections: u32,
    /// Signing secret for bearer tokens. Unset means a per-process secret.
    pub jwt_secret: Option<String>,
    pub jwt_ttl: Duration,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("port", &self.port)
            .field("environment", &self.environment)
            .field("scraper_base_url", &self.scraper_base_url)
            .field("scraper_timeout", &self.scraper_timeout)
            .field("event_bus_capacity", &self.event_bus_capacity)
            .field("db_max_connections", &self.db_max_connections)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<set>"))
            .field("jwt_ttl", &self.jwt_ttl)
            .finish_non_exhaustive()
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup;
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            port: parsed(lookup, "LETTERBOX_PORT").unwrap_or(3001),
            environment: lookup("LETTERBOX_ENV")
                .map(|v| Environment::parse(&v))
                .unwrap_or(Environment::Production),
            scraper_base_url: lookup("SCRAPER_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            scraper_timeout: Duration::from_secs(
                parsed(lookup, "SCRAPER_TIMEOUT_SECS").unwrap_or(10),
            ),
            scraper_user_agent: lookup("SCRAPER_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            event_bus_capacity: parsed(lookup, "EVENT_BUS_CAPACITY").unwrap_or(100),
            db_max_connections: parsed(lookup, "DB_MAX_CONNECTIONS").unwrap_or(10),
            jwt_secret: lookup("JWT_SECRET").filter(|v| !v.trim().is_empty()),
            jwt_ttl: Duration::from_secs(parsed(lookup, "JWT_TTL_SECS").unwrap_or(86_400)),
        }
    }

    pub fn token_issuer(&self) -> TokenIssuer {
        let secret = match &self.jwt_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!("JWT_SECRET not set; tokens will not survive a restart");
                uuid::Uuid::new_v4().to_string()
            }
        };
        TokenIssuer::new(secret.as_bytes(), self.jwt_ttl)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
    pub queries: CatalogQueries,
    pub reviews: Arc<ReviewService>,
    pub ingestion: Arc<IngestionService>,
    pub bus: Arc<NotificationBus>,
    pub tokens: Arc<TokenIssuer>,
    pub environment: Environment,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        source: Arc<dyn MetadataSource>,
        bus: Arc<NotificationBus>,
        tokens: TokenIssuer,
        environment: Environment,
    ) -> Self {
        Self {
            queries: CatalogQueries::new(store.clone()),
            reviews: Arc::new(ReviewService::new(store.clone(), bus.clone())),
            ingestion: Arc::new(IngestionService::new(store.clone(), source, bus.clone())),
            store,
            bus,
            tokens: Arc::new(tokens),
            environment,
        }
    }

    fn reject(&self, err: impl Into<ApiError>) -> ApiFailure {
        ApiFailure {
            error: err.into(),
            expose_details: !self.environment.is_production(),
        }
    }
}

/// Success body: `{success: true, data, count?, query?, message?}`.
#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

impl<T: Serialize> Envelope<T> {
    fn new(data: T) -> Self {
        Self {
            success: true,
            data,
            count: None,
            query: None,
            message: None,
        }
    }

    fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    fn query(mut self, query: String) -> Self {
        self.query = Some(query);
        self
    }

    fn message(mut self, message: &'static str) -> Self {
        self.message = Some(message);
        self
    }

    fn respond(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

type ApiResult = Result<Response, ApiFailure>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/movies/all", get(list_movies_handler))
        .route("/api/movies/search/{query}", get(search_movies_handler))
        .route("/api/movies/scrape", post(scrape_movie_handler))
        .route("/api/movies/{movie_id}", get(movie_detail_handler))
        .route(
            "/api/movies/{movie_id}/reviews",
            get(list_reviews_handler).post(add_review_handler),
        )
        .route("/api/users/register", post(register_handler))
        .route("/api/users/login", post(login_handler))
        .route("/api/events", get(events_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Picks the PostgreSQL store when a database URL is configured.
pub async fn connect_store(config: &AppConfig) -> anyhow::Result<Arc<dyn CatalogStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgCatalogStore::connect(url, config.db_max_connections)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory catalog store");
            Ok(Arc::new(MemoryCatalogStore::new()))
        }
    }
}

pub fn build_scraper(config: &AppConfig) -> anyhow::Result<ImdbScraper> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.scraper_timeout,
        user_agent: Some(config.scraper_user_agent.clone()),
        ..Default::default()
    })?;
    ImdbScraper::new(http, &config.scraper_base_url).context("configuring scraper")
}

pub async fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let store = connect_store(config).await?;
    let scraper = build_scraper(config)?;
    let bus = Arc::new(NotificationBus::new(config.event_bus_capacity));
    Ok(AppState::new(
        store,
        Arc::new(scraper),
        bus,
        config.token_issuer(),
        config.environment,
    ))
}

/// Serves until ctrl-c, then shuts the bus down so live streams end.
pub async fn serve(config: &AppConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, environment = ?config.environment, "letterbox api listening");

    let bus = state.bus.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
            bus.shutdown();
        })
        .await?;
    Ok(())
}

async fn list_movies_handler(State(state): State<AppState>) -> ApiResult {
    let movies = state.queries.list_movies().await.map_err(|e| state.reject(e))?;
    Ok(Envelope::new(&movies).count(movies.len()).respond(StatusCode::OK))
}

async fn search_movies_handler(
    State(state): State<AppState>,
    Path(query): Path<String>,
) -> ApiResult {
    let results = state
        .queries
        .search_movies(&query)
        .await
        .map_err(|e| state.reject(e))?;
    let count = results.movies.len();
    Ok(Envelope::new(&results.movies)
        .count(count)
        .query(results.query.clone())
        .respond(StatusCode::OK))
}

async fn movie_detail_handler(
    State(state): State<AppState>,
    Path(movie_id): Path<String>,
) -> ApiResult {
    let movie = state
        .queries
        .get_movie(&movie_id)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Envelope::new(movie).respond(StatusCode::OK))
}

async fn list_reviews_handler(
    State(state): State<AppState>,
    Path(movie_id): Path<String>,
) -> ApiResult {
    let reviews = state
        .queries
        .list_reviews(&movie_id)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Envelope::new(&reviews).count(reviews.len()).respond(StatusCode::OK))
}

#[derive(Debug, Default, Deserialize)]
struct ReviewBody {
    rating: Option<serde_json::Value>,
    comment: Option<String>,
}

/// Unreadable bodies are treated as empty so the services report the first
/// failed precondition in their usual order.
fn body_or_default<T: Default>(body: Result<Json<T>, JsonRejection>) -> T {
    match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            debug!(error = %rejection, "request body ignored");
            T::default()
        }
    }
}

async fn add_review_handler(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Path(movie_id): Path<String>,
    body: Result<Json<ReviewBody>, JsonRejection>,
) -> ApiResult {
    let body = body_or_default(body);
    let rating = body
        .rating
        .and_then(|value| serde_json::from_value::<RatingInput>(value).ok());
    let outcome = state
        .reviews
        .upsert_review(actor, &movie_id, rating.as_ref(), body.comment.as_deref())
        .await
        .map_err(|e| state.reject(e))?;
    Ok(Envelope::new(outcome)
        .message("review saved")
        .respond(StatusCode::CREATED))
}

#[derive(Debug, Default, Deserialize)]
struct ScrapeBody {
    #[serde(rename = "movieName")]
    movie_name: Option<String>,
}

async fn scrape_movie_handler(
    State(state): State<AppState>,
    Actor(actor): Actor,
    body: Result<Json<ScrapeBody>, JsonRejection>,
) -> ApiResult {
    let body = body_or_default(body);
    let outcome = state
        .ingestion
        .ingest(body.movie_name.as_deref().unwrap_or_default(), actor)
        .await
        .map_err(|e| state.reject(e))?;
    Ok(match outcome.status {
        IngestStatus::Created => Envelope::new(outcome.movie)
            .message("movie added")
            .respond(StatusCode::CREATED),
        IngestStatus::AlreadyExists => Envelope::new(outcome.movie)
            .message("movie already exists")
            .respond(StatusCode::OK),
    })
}

#[derive(Debug, Default, Deserialize)]
struct CredentialsBody {
    username: Option<String>,
    password: Option<String>,
}

impl CredentialsBody {
    fn into_parts(self) -> Result<(String, String), ApiError> {
        let username = self.username.unwrap_or_default().trim().to_string();
        let password = self.password.unwrap_or_default();
        if username.is_empty() || password.is_empty() {
            return Err(ApiError::MissingCredentials);
        }
        Ok((username, password))
    }
}

async fn register_handler(
    State(state): State<AppState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> ApiResult {
    let (username, password) = body_or_default(body)
        .into_parts()
        .map_err(|e| state.reject(e))?;

    if state
        .store
        .find_user_by_username(&username)
        .await
        .map_err(|e| state.reject(e))?
        .is_some()
    {
        return Err(state.reject(ApiError::UsernameTaken));
    }

    let password_hash = hash_password_blocking(password)
        .await
        .map_err(|e| state.reject(e))?;
    let user = match state.store.insert_user(&username, &password_hash).await {
        Ok(user) => user,
        Err(StoreError::Conflict(_)) => return Err(state.reject(ApiError::UsernameTaken)),
        Err(err) => return Err(state.reject(err)),
    };
    info!(user_id = user.id, "user registered");
    Ok(Envelope::new(user)
        .message("user registered")
        .respond(StatusCode::CREATED))
}

#[derive(Debug, Serialize)]
struct LoginData {
    token: String,
    user: letterbox_core::User,
}

async fn login_handler(
    State(state): State<AppState>,
    body: Result<Json<CredentialsBody>, JsonRejection>,
) -> ApiResult {
    let (username, password) = body_or_default(body)
        .into_parts()
        .map_err(|e| state.reject(e))?;

    let user = state
        .store
        .find_user_by_username(&username)
        .await
        .map_err(|e| state.reject(e))?
        .ok_or_else(|| state.reject(ApiError::InvalidCredentials))?;
    if !verify_password_blocking(password, user.password_hash.clone()).await {
        return Err(state.reject(ApiError::InvalidCredentials));
    }

    let token = state.tokens.issue(user.id).map_err(|e| state.reject(e))?;
    debug!(user_id = user.id, ttl_secs = state.tokens.ttl().as_secs(), "token issued");
    Ok(Envelope::new(LoginData { token, user })
        .message("login successful")
        .respond(StatusCode::OK))
}

async fn events_handler(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiFailure> {
    let rx = state
        .bus
        .subscribe()
        .map_err(|_| state.reject(ApiError::EventsUnavailable))?;
    debug!(subscribers = state.bus.subscriber_count(), "live-update subscriber connected");

    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => match event.payload_json() {
                Ok(payload) => Some(Ok(Event::default()
                    .event(event.name())
                    .data(payload.to_string()))),
                Err(err) => {
                    warn!(event = event.name(), error = %err, "failed to encode live event");
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "live-update subscriber lagged");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("keep-alive")))
}

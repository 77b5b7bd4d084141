//! Catalog services: review upserts, rating aggregation, movie ingestion and
//! the live-update notification bus they publish to.

use std::sync::{Arc, RwLock};

use letterbox_adapters::{MetadataSource, ScrapeFailure};
use letterbox_core::{
    clamp_comment, sanitize_query, Movie, MovieReview, MovieSnapshot, NewMovie, RatingInput,
};
use letterbox_storage::{CatalogStore, MovieInsert, ReviewUpsert, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "letterbox-services";

pub const REVIEW_ADDED: &str = "review_added";
pub const MOVIE_ADDED: &str = "movie_added";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewAddedPayload {
    pub movie_id: i64,
    pub user_id: i64,
    pub rating: i16,
    pub comment: Option<String>,
    pub new_average_rating: f64,
    pub updated_movie: MovieSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieAddedPayload {
    pub movie: Movie,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    ReviewAdded(ReviewAddedPayload),
    MovieAdded(MovieAddedPayload),
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::ReviewAdded(_) => REVIEW_ADDED,
            LiveEvent::MovieAdded(_) => MOVIE_ADDED,
        }
    }

    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            LiveEvent::ReviewAdded(p) => serde_json::to_value(p),
            LiveEvent::MovieAdded(p) => serde_json::to_value(p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("notification bus is shut down")]
    Closed,
}

/// Best-effort, at-most-once fan-out of live events to connected subscribers.
///
/// Created at process start and shut down at process stop. Publishing never
/// blocks; lagging subscribers lose the oldest events.
#[derive(Debug)]
pub struct NotificationBus {
    sender: RwLock<Option<broadcast::Sender<LiveEvent>>>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        info!(capacity, "notification bus initialized");
        Self {
            sender: RwLock::new(Some(tx)),
        }
    }

    /// Returns how many subscribers the event was handed to. Zero subscribers is not an error.
    pub fn publish(&self, event: LiveEvent) -> Result<usize, BusError> {
        let guard = self.sender.read().unwrap_or_else(|e| e.into_inner());
        let tx = guard.as_ref().ok_or(BusError::Closed)?;
        let name = event.name();
        let delivered = tx.send(event).unwrap_or(0);
        debug!(event = name, delivered, "live event published");
        Ok(delivered)
    }

    pub fn subscribe(&self) -> Result<broadcast::Receiver<LiveEvent>, BusError> {
        let guard = self.sender.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|tx| tx.subscribe()).ok_or(BusError::Closed)
    }

    pub fn subscriber_count(&self) -> usize {
        let guard = self.sender.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|tx| tx.receiver_count()).unwrap_or(0)
    }

    /// Drops the sender so every subscriber stream ends. Later publishes fail with `Closed`.
    pub fn shutdown(&self) {
        let mut guard = self.sender.write().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            info!("notification bus shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

fn notify(bus: &NotificationBus, event: LiveEvent) {
    let name = event.name();
    if let Err(err) = bus.publish(event) {
        warn!(event = name, error = %err, "live notification dropped");
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("invalid movie id: {0}")]
    InvalidMovieId(String),
    #[error("movie {0} not found")]
    MovieNotFound(i64),
    #[error("rating must be an integer between 1 and 5")]
    InvalidRating,
    #[error("movie name is required")]
    MissingMovieName,
    #[error("search query must not be empty")]
    InvalidQuery,
    #[error("conflicting concurrent write: {0}")]
    ConstraintConflict(String),
    #[error(transparent)]
    Scrape(#[from] ScrapeFailure),
    #[error("storage failure: {0}")]
    Store(#[source] StoreError),
}

impl ServiceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Unauthenticated => "UNAUTHENTICATED",
            ServiceError::InvalidMovieId(_) => "INVALID_MOVIE_ID",
            ServiceError::MovieNotFound(_) => "MOVIE_NOT_FOUND",
            ServiceError::InvalidRating => "INVALID_RATING",
            ServiceError::MissingMovieName => "MISSING_MOVIE_NAME",
            ServiceError::InvalidQuery => "INVALID_QUERY",
            ServiceError::ConstraintConflict(_) => "CONSTRAINT_CONFLICT",
            ServiceError::Scrape(ScrapeFailure::NotFound) => "SCRAPE_NOT_FOUND",
            ServiceError::Scrape(ScrapeFailure::IncompleteData) => "SCRAPE_INCOMPLETE_DATA",
            ServiceError::Scrape(ScrapeFailure::FetchError(_)) => "SCRAPE_FETCH_ERROR",
            ServiceError::Scrape(ScrapeFailure::Timeout) => "SCRAPE_TIMEOUT",
            ServiceError::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ServiceError::ConstraintConflict(msg),
            other => ServiceError::Store(other),
        }
    }
}

/// Movie ids arrive as text and must be positive integers.
pub fn parse_movie_id(raw: &str) -> Result<i64, ServiceError> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ServiceError::InvalidMovieId(raw.to_string())),
    }
}

async fn authenticate(
    store: &dyn CatalogStore,
    actor_user_id: Option<i64>,
) -> Result<i64, ServiceError> {
    let Some(user_id) = actor_user_id else {
        return Err(ServiceError::Unauthenticated);
    };
    match store.get_user(user_id).await? {
        Some(user) => Ok(user.id),
        None => Err(ServiceError::Unauthenticated),
    }
}

/// Keeps `Movie.average_rating` equal to the rounded mean of its reviews.
#[derive(Clone)]
pub struct RatingAggregator {
    store: Arc<dyn CatalogStore>,
}

impl RatingAggregator {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn recompute(&self, movie_id: i64) -> Result<f64, StoreError> {
        let average = self.store.recompute_average(movie_id).await?;
        debug!(movie_id, average, "average rating recomputed");
        Ok(average)
    }
}

/// Read-side catalog operations with input validation.
#[derive(Clone)]
pub struct CatalogQueries {
    store: Arc<dyn CatalogStore>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub query: String,
    pub movies: Vec<Movie>,
}

impl CatalogQueries {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn list_movies(&self) -> Result<Vec<Movie>, ServiceError> {
        Ok(self.store.list_movies().await?)
    }

    pub async fn search_movies(&self, raw_query: &str) -> Result<SearchResults, ServiceError> {
        let query = sanitize_query(raw_query).ok_or(ServiceError::InvalidQuery)?;
        let movies = self.store.search_movies(&query).await?;
        debug!(query = %query, hits = movies.len(), "movie search");
        Ok(SearchResults { query, movies })
    }

    pub async fn get_movie(&self, raw_movie_id: &str) -> Result<Movie, ServiceError> {
        let movie_id = parse_movie_id(raw_movie_id)?;
        self.store
            .get_movie(movie_id)
            .await?
            .ok_or(ServiceError::MovieNotFound(movie_id))
    }

    pub async fn list_reviews(&self, raw_movie_id: &str) -> Result<Vec<MovieReview>, ServiceError> {
        let movie = self.get_movie(raw_movie_id).await?;
        Ok(self.store.list_reviews(movie.id).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutcome {
    pub review_id: i64,
    /// `false` when the actor's previous review for the movie was replaced.
    pub created: bool,
    pub movie: MovieSnapshot,
}

pub struct ReviewService {
    store: Arc<dyn CatalogStore>,
    aggregator: RatingAggregator,
    bus: Arc<NotificationBus>,
}

impl ReviewService {
    pub fn new(store: Arc<dyn CatalogStore>, bus: Arc<NotificationBus>) -> Self {
        Self {
            aggregator: RatingAggregator::new(store.clone()),
            store,
            bus,
        }
    }

    /// Validates, then writes the actor's single review for the movie and
    /// refreshes the movie's average. Validation failures never write.
    pub async fn upsert_review(
        &self,
        actor_user_id: Option<i64>,
        raw_movie_id: &str,
        rating: Option<&RatingInput>,
        comment: Option<&str>,
    ) -> Result<ReviewOutcome, ServiceError> {
        let user_id = authenticate(self.store.as_ref(), actor_user_id).await?;

        let movie_id = parse_movie_id(raw_movie_id)?;
        if self.store.get_movie(movie_id).await?.is_none() {
            return Err(ServiceError::MovieNotFound(movie_id));
        }

        let rating = rating
            .and_then(RatingInput::parse)
            .ok_or(ServiceError::InvalidRating)?;
        let comment = clamp_comment(comment);

        let written = self
            .store
            .upsert_review(&ReviewUpsert {
                user_id,
                movie_id,
                rating,
                comment: comment.clone(),
            })
            .await;

        let written = match written {
            Ok(written) => written,
            Err(StoreError::Conflict(msg)) => {
                // A competing writer may have committed; keep the average in step with it.
                if let Err(err) = self.aggregator.recompute(movie_id).await {
                    warn!(movie_id, error = %err, "recompute after conflict failed");
                }
                warn!(movie_id, user_id, conflict = %msg, "review upsert conflicted");
                return Err(ServiceError::ConstraintConflict(msg));
            }
            Err(StoreError::MissingReference(_)) => {
                return Err(ServiceError::MovieNotFound(movie_id));
            }
            Err(err) => return Err(err.into()),
        };

        let new_average = self.aggregator.recompute(movie_id).await?;
        let movie = self
            .store
            .get_movie(movie_id)
            .await?
            .ok_or(ServiceError::MovieNotFound(movie_id))?;
        let snapshot = MovieSnapshot::from(&movie);

        info!(
            movie_id,
            user_id,
            rating,
            review_id = written.review.id,
            created = written.created,
            new_average,
            "review saved"
        );

        notify(
            &self.bus,
            LiveEvent::ReviewAdded(ReviewAddedPayload {
                movie_id,
                user_id,
                rating,
                comment,
                new_average_rating: new_average,
                updated_movie: snapshot.clone(),
            }),
        );

        Ok(ReviewOutcome {
            review_id: written.review.id,
            created: written.created,
            movie: snapshot,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub status: IngestStatus,
    pub movie: Movie,
}

/// Scrape, de-duplicate by case-insensitive title, insert, announce.
pub struct IngestionService {
    store: Arc<dyn CatalogStore>,
    source: Arc<dyn MetadataSource>,
    bus: Arc<NotificationBus>,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        source: Arc<dyn MetadataSource>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self { store, source, bus }
    }

    pub async fn ingest(
        &self,
        movie_name: &str,
        requested_by: Option<i64>,
    ) -> Result<IngestOutcome, ServiceError> {
        let user_id = authenticate(self.store.as_ref(), requested_by).await?;

        let movie_name = movie_name.trim();
        if movie_name.is_empty() {
            return Err(ServiceError::MissingMovieName);
        }

        info!(movie_name, user_id, source = self.source.source_id(), "ingesting movie");
        let metadata = self.source.fetch(movie_name).await.map_err(|failure| {
            warn!(movie_name, error = %failure, "metadata fetch failed");
            ServiceError::Scrape(failure)
        })?;

        if let Some(existing) = self.store.find_movie_by_name(&metadata.name).await? {
            info!(movie_id = existing.id, name = %existing.name, "movie already in catalog");
            return Ok(IngestOutcome {
                status: IngestStatus::AlreadyExists,
                movie: existing,
            });
        }

        let movie = match self.store.insert_movie_if_absent(&NewMovie::from(metadata)).await? {
            MovieInsert::Created(movie) => movie,
            MovieInsert::Existing(existing) => {
                info!(movie_id = existing.id, "movie ingested concurrently by another request");
                return Ok(IngestOutcome {
                    status: IngestStatus::AlreadyExists,
                    movie: existing,
                });
            }
        };

        info!(movie_id = movie.id, name = %movie.name, "movie added to catalog");
        notify(
            &self.bus,
            LiveEvent::MovieAdded(MovieAddedPayload {
                movie: movie.clone(),
            }),
        );

        Ok(IngestOutcome {
            status: IngestStatus::Created,
            movie,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use letterbox_adapters::FixtureMetadataSource;
    use letterbox_core::{MovieMetadata, Review, User, MAX_COMMENT_CHARS};
    use letterbox_storage::{MemoryCatalogStore, UpsertedReview};

    struct Harness {
        store: Arc<MemoryCatalogStore>,
        bus: Arc<NotificationBus>,
        reviews: ReviewService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryCatalogStore::new());
        let bus = Arc::new(NotificationBus::new(64));
        let reviews = ReviewService::new(store.clone(), bus.clone());
        Harness { store, bus, reviews }
    }

    async fn seed_movie(store: &MemoryCatalogStore, name: &str) -> Movie {
        match store
            .insert_movie_if_absent(&NewMovie {
                name: name.to_string(),
                director: None,
                release_year: None,
                synopsis: None,
                poster_url: None,
            })
            .await
            .unwrap()
        {
            MovieInsert::Created(m) | MovieInsert::Existing(m) => m,
        }
    }

    async fn seed_user(store: &MemoryCatalogStore, name: &str) -> i64 {
        store.insert_user(name, "hash").await.unwrap().id
    }

    fn rating(v: i64) -> RatingInput {
        RatingInput::from(v)
    }

    fn matrix_metadata() -> MovieMetadata {
        MovieMetadata {
            name: "The Matrix".into(),
            synopsis: "A hacker learns the truth.".into(),
            poster_url: Some("https://img.example/matrix.jpg".into()),
            director: "Lana Wachowski".into(),
            release_year: Some(1999),
        }
    }

    fn expect_review_event(rx: &mut broadcast::Receiver<LiveEvent>) -> ReviewAddedPayload {
        match rx.try_recv().expect("event published") {
            LiveEvent::ReviewAdded(p) => p,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn end_to_end_rating_scenario() {
        let h = harness();
        let movie = seed_movie(&h.store, "Inception").await;
        let a = seed_user(&h.store, "a").await;
        let b = seed_user(&h.store, "b").await;
        let mut rx = h.bus.subscribe().unwrap();
        let id = movie.id.to_string();

        let out = h.reviews.upsert_review(Some(a), &id, Some(&rating(4)), None).await.unwrap();
        assert_eq!(out.movie.average_rating, 4.0);
        let event = expect_review_event(&mut rx);
        assert_eq!(event.new_average_rating, 4.0);
        assert_eq!(event.user_id, a);

        let out = h
            .reviews
            .upsert_review(Some(b), &id, Some(&rating(5)), Some("great"))
            .await
            .unwrap();
        assert_eq!(out.movie.average_rating, 4.5);
        let event = expect_review_event(&mut rx);
        assert_eq!(event.new_average_rating, 4.5);
        assert_eq!(event.comment.as_deref(), Some("great"));

        let out = h.reviews.upsert_review(Some(a), &id, Some(&rating(2)), None).await.unwrap();
        assert!(!out.created);
        assert_eq!(out.movie.average_rating, 3.5);
        assert_eq!(expect_review_event(&mut rx).new_average_rating, 3.5);
        assert_eq!(h.store.review_count(movie.id).await, 2);
    }

    #[tokio::test]
    async fn average_tracks_mean_over_distinct_users() {
        let h = harness();
        let movie = seed_movie(&h.store, "Heat").await;
        let ratings = [5, 3, 4, 1, 2, 5, 4];
        let mut last = 0.0;
        for (i, r) in ratings.iter().enumerate() {
            let user = seed_user(&h.store, &format!("u{i}")).await;
            last = h
                .reviews
                .upsert_review(Some(user), &movie.id.to_string(), Some(&rating(*r)), None)
                .await
                .unwrap()
                .movie
                .average_rating;
        }
        let expected: Vec<i16> = ratings.iter().map(|r| *r as i16).collect();
        assert_eq!(last, letterbox_core::average_rating(&expected));
        assert_eq!(last, 3.43);
    }

    #[tokio::test]
    async fn out_of_range_ratings_are_rejected_without_writes() {
        let h = harness();
        let movie = seed_movie(&h.store, "Heat").await;
        let user = seed_user(&h.store, "a").await;
        let id = movie.id.to_string();

        for bad in [rating(0), rating(6), RatingInput::Float(4.5), RatingInput::from("x")] {
            let err = h.reviews.upsert_review(Some(user), &id, Some(&bad), None).await.unwrap_err();
            assert!(matches!(err, ServiceError::InvalidRating), "{bad:?}");
        }
        let err = h.reviews.upsert_review(Some(user), &id, None, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRating));
        assert_eq!(h.store.review_count(movie.id).await, 0);
    }

    #[tokio::test]
    async fn preconditions_are_checked_in_order() {
        let h = harness();
        let movie = seed_movie(&h.store, "Heat").await;
        let user = seed_user(&h.store, "a").await;

        let err = h.reviews.upsert_review(None, "abc", Some(&rating(9)), None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthenticated));

        let err = h
            .reviews
            .upsert_review(Some(9999), &movie.id.to_string(), Some(&rating(3)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthenticated));

        for raw in ["abc", "0", "-3", "1.5", ""] {
            let err = h
                .reviews
                .upsert_review(Some(user), raw, Some(&rating(9)), None)
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidMovieId(_)), "{raw}");
        }

        let err = h
            .reviews
            .upsert_review(Some(user), "4242", Some(&rating(9)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::MovieNotFound(4242)));
        assert_eq!(err.code(), "MOVIE_NOT_FOUND");
    }

    #[tokio::test]
    async fn comment_is_clamped_not_rejected() {
        let h = harness();
        let movie = seed_movie(&h.store, "Heat").await;
        let user = seed_user(&h.store, "a").await;
        let long = format!("  {}  ", "x".repeat(MAX_COMMENT_CHARS + 10));

        h.reviews
            .upsert_review(Some(user), &movie.id.to_string(), Some(&rating(3)), Some(&long))
            .await
            .unwrap();
        let stored = h.store.list_reviews(movie.id).await.unwrap();
        assert_eq!(stored[0].comment.as_ref().unwrap().len(), MAX_COMMENT_CHARS);
        assert_eq!(stored[0].username, "a");
    }

    #[tokio::test]
    async fn concurrent_upserts_from_different_users_are_all_counted() {
        let h = harness();
        let movie = seed_movie(&h.store, "Heat").await;
        let reviews = Arc::new(h.reviews);
        let mut users = Vec::new();
        for i in 0..20 {
            users.push(seed_user(&h.store, &format!("u{i}")).await);
        }

        let mut handles = Vec::new();
        for (i, user) in users.iter().copied().enumerate() {
            let reviews = reviews.clone();
            let id = movie.id.to_string();
            handles.push(tokio::spawn(async move {
                let r = RatingInput::from((i % 5 + 1) as i64);
                reviews.upsert_review(Some(user), &id, Some(&r), None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.store.review_count(movie.id).await, 20);
        let stored = h.store.get_movie(movie.id).await.unwrap().unwrap();
        assert_eq!(stored.average_rating, 3.0);
    }

    #[tokio::test]
    async fn concurrent_upserts_from_same_user_collapse_to_one_row() {
        let h = harness();
        let movie = seed_movie(&h.store, "Heat").await;
        let user = seed_user(&h.store, "a").await;
        let reviews = Arc::new(h.reviews);

        let mut handles = Vec::new();
        for r in 1..=5i64 {
            let reviews = reviews.clone();
            let id = movie.id.to_string();
            handles.push(tokio::spawn(async move {
                reviews.upsert_review(Some(user), &id, Some(&RatingInput::from(r)), None).await
            }));
        }
        let mut review_ids = Vec::new();
        for handle in handles {
            review_ids.push(handle.await.unwrap().unwrap().review_id);
        }
        review_ids.dedup();
        assert_eq!(review_ids.len(), 1);
        assert_eq!(h.store.review_count(movie.id).await, 1);

        let stored = h.store.list_reviews(movie.id).await.unwrap();
        let movie = h.store.get_movie(movie.id).await.unwrap().unwrap();
        assert_eq!(movie.average_rating, f64::from(stored[0].rating));
    }

    #[tokio::test]
    async fn notification_failures_do_not_fail_the_write() {
        let h = harness();
        let movie = seed_movie(&h.store, "Heat").await;
        let user = seed_user(&h.store, "a").await;
        h.bus.shutdown();

        let out = h
            .reviews
            .upsert_review(Some(user), &movie.id.to_string(), Some(&rating(5)), None)
            .await
            .unwrap();
        assert_eq!(out.movie.average_rating, 5.0);
        assert_eq!(h.store.review_count(movie.id).await, 1);
    }

    /// Writes through, then reports a unique-constraint race.
    struct RacingStore {
        inner: MemoryCatalogStore,
    }

    #[async_trait]
    impl CatalogStore for RacingStore {
        async fn list_movies(&self) -> Result<Vec<Movie>, StoreError> {
            self.inner.list_movies().await
        }
        async fn search_movies(&self, query: &str) -> Result<Vec<Movie>, StoreError> {
            self.inner.search_movies(query).await
        }
        async fn get_movie(&self, movie_id: i64) -> Result<Option<Movie>, StoreError> {
            self.inner.get_movie(movie_id).await
        }
        async fn find_movie_by_name(&self, name: &str) -> Result<Option<Movie>, StoreError> {
            self.inner.find_movie_by_name(name).await
        }
        async fn insert_movie_if_absent(
            &self,
            movie: &NewMovie,
        ) -> Result<MovieInsert, StoreError> {
            self.inner.insert_movie_if_absent(movie).await
        }
        async fn list_reviews(&self, movie_id: i64) -> Result<Vec<MovieReview>, StoreError> {
            self.inner.list_reviews(movie_id).await
        }
        async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
            self.inner.get_user(user_id).await
        }
        async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
            self.inner.find_user_by_username(username).await
        }
        async fn insert_user(
            &self,
            username: &str,
            password_hash: &str,
        ) -> Result<User, StoreError> {
            self.inner.insert_user(username, password_hash).await
        }
        async fn upsert_review(&self, review: &ReviewUpsert) -> Result<UpsertedReview, StoreError> {
            let _: Review = self.inner.upsert_review(review).await?.review;
            Err(StoreError::Conflict("reviews_user_movie_key".into()))
        }
        async fn recompute_average(&self, movie_id: i64) -> Result<f64, StoreError> {
            self.inner.recompute_average(movie_id).await
        }
    }

    #[tokio::test]
    async fn constraint_conflict_is_distinct_and_leaves_average_fresh() {
        let store = Arc::new(RacingStore {
            inner: MemoryCatalogStore::new(),
        });
        let movie = seed_movie(&store.inner, "Heat").await;
        let user = seed_user(&store.inner, "a").await;
        let bus = Arc::new(NotificationBus::new(8));
        let mut rx = bus.subscribe().unwrap();
        let reviews = ReviewService::new(store.clone(), bus);

        let err = reviews
            .upsert_review(Some(user), &movie.id.to_string(), Some(&rating(4)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ConstraintConflict(_)));
        assert_eq!(err.code(), "CONSTRAINT_CONFLICT");
        assert_eq!(store.inner.get_movie(movie.id).await.unwrap().unwrap().average_rating, 4.0);
        assert!(rx.try_recv().is_err());
    }

    fn ingestion(
        store: Arc<MemoryCatalogStore>,
        source: Arc<FixtureMetadataSource>,
        bus: Arc<NotificationBus>,
    ) -> IngestionService {
        IngestionService::new(store, source, bus)
    }

    #[tokio::test]
    async fn ingest_is_idempotent_across_case_variations() {
        let store = Arc::new(MemoryCatalogStore::new());
        let user = seed_user(&store, "a").await;
        let source = Arc::new(
            FixtureMetadataSource::new()
                .with_movie("The Matrix", matrix_metadata())
                .with_movie("matrix 1999", matrix_metadata()),
        );
        let bus = Arc::new(NotificationBus::new(8));
        let mut rx = bus.subscribe().unwrap();
        let svc = ingestion(store.clone(), source.clone(), bus);

        let first = svc.ingest("The Matrix", Some(user)).await.unwrap();
        assert_eq!(first.status, IngestStatus::Created);
        assert_eq!(first.movie.average_rating, 0.0);
        assert_eq!(first.movie.release_year, Some(1999));

        let second = svc.ingest("the matrix", Some(user)).await.unwrap();
        assert_eq!(second.status, IngestStatus::AlreadyExists);
        assert_eq!(second.movie.id, first.movie.id);

        let third = svc.ingest("Matrix 1999", Some(user)).await.unwrap();
        assert_eq!(third.status, IngestStatus::AlreadyExists);

        assert_eq!(store.movie_count().await, 1);
        match rx.try_recv().unwrap() {
            LiveEvent::MovieAdded(p) => assert_eq!(p.movie.id, first.movie.id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn scrape_failures_leave_catalog_untouched() {
        let store = Arc::new(MemoryCatalogStore::new());
        let user = seed_user(&store, "a").await;
        let source = Arc::new(
            FixtureMetadataSource::new()
                .with_failure("Slow Movie", ScrapeFailure::Timeout)
                .with_failure("Broken", ScrapeFailure::IncompleteData),
        );
        let svc = ingestion(store.clone(), source, Arc::new(NotificationBus::new(8)));

        let err = svc.ingest("Unknown Film", Some(user)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Scrape(ScrapeFailure::NotFound)));
        assert_eq!(err.code(), "SCRAPE_NOT_FOUND");

        let err = svc.ingest("Slow Movie", Some(user)).await.unwrap_err();
        assert_eq!(err.code(), "SCRAPE_TIMEOUT");

        let err = svc.ingest("Broken", Some(user)).await.unwrap_err();
        assert_eq!(err.code(), "SCRAPE_INCOMPLETE_DATA");

        assert_eq!(store.movie_count().await, 0);
    }

    #[tokio::test]
    async fn blank_names_and_anonymous_callers_are_rejected_before_fetching() {
        let store = Arc::new(MemoryCatalogStore::new());
        let user = seed_user(&store, "a").await;
        let source =
            Arc::new(FixtureMetadataSource::new().with_movie("The Matrix", matrix_metadata()));
        let svc = ingestion(store.clone(), source.clone(), Arc::new(NotificationBus::new(8)));

        let err = svc.ingest("   ", Some(user)).await.unwrap_err();
        assert!(matches!(err, ServiceError::MissingMovieName));
        let err = svc.ingest("The Matrix", None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthenticated));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_ingestion_of_one_title_stores_one_row() {
        let store = Arc::new(MemoryCatalogStore::new());
        let user = seed_user(&store, "a").await;
        let source =
            Arc::new(FixtureMetadataSource::new().with_movie("The Matrix", matrix_metadata()));
        let svc = Arc::new(ingestion(store.clone(), source, Arc::new(NotificationBus::new(8))));

        let mut handles = Vec::new();
        for name in ["The Matrix", "the matrix", "THE MATRIX", "The Matrix "] {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move { svc.ingest(name, Some(user)).await }));
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().status == IngestStatus::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.movie_count().await, 1);
    }

    #[tokio::test]
    async fn bus_lifecycle() {
        let bus = NotificationBus::new(4);
        let event = LiveEvent::MovieAdded(MovieAddedPayload {
            movie: Movie {
                id: 1,
                name: "Heat".into(),
                director: None,
                release_year: None,
                synopsis: None,
                poster_url: None,
                average_rating: 0.0,
                created_at: chrono_now(),
            },
        });

        assert_eq!(bus.publish(event.clone()), Ok(0));

        let mut rx = bus.subscribe().unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish(event.clone()), Ok(1));
        assert_eq!(rx.recv().await.unwrap().name(), MOVIE_ADDED);

        bus.shutdown();
        assert!(bus.is_closed());
        assert_eq!(bus.publish(event), Err(BusError::Closed));
        assert!(bus.subscribe().is_err());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn review_payload_uses_camel_case_keys() {
        let payload = ReviewAddedPayload {
            movie_id: 1,
            user_id: 2,
            rating: 4,
            comment: None,
            new_average_rating: 4.0,
            updated_movie: MovieSnapshot {
                id: 1,
                name: "Inception".into(),
                director: None,
                release_year: Some(2010),
                poster_url: None,
                average_rating: 4.0,
            },
        };
        let json = LiveEvent::ReviewAdded(payload).payload_json().unwrap();
        assert_eq!(json["newAverageRating"], 4.0);
        assert_eq!(json["movieId"], 1);
        assert_eq!(json["updatedMovie"]["name"], "Inception");
        assert_eq!(json["updatedMovie"]["averageRating"], 4.0);
        assert_eq!(json["updatedMovie"]["releaseYear"], 2010);
        assert!(json["updatedMovie"].get("average_rating").is_none());
    }

    #[test]
    fn movie_added_payload_nests_camel_case_movie() {
        let movie = Movie {
            id: 3,
            name: "Heat".into(),
            director: Some("Michael Mann".into()),
            release_year: Some(1995),
            synopsis: None,
            poster_url: Some("https://img.example/heat.jpg".into()),
            average_rating: 0.0,
            created_at: chrono_now(),
        };
        let json = LiveEvent::MovieAdded(MovieAddedPayload { movie })
            .payload_json()
            .unwrap();
        assert_eq!(json["movie"]["posterUrl"], "https://img.example/heat.jpg");
        assert_eq!(json["movie"]["averageRating"], 0.0);
        assert!(json["movie"].get("created_at").is_none());
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

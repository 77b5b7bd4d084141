//! In-process catalog store. All operations run under one async mutex.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use letterbox_core::{
    average_rating, name_key, Movie, MovieReview, NewMovie, Review, User, MAX_RATING, MIN_RATING,
};
use tokio::sync::Mutex;

use crate::{CatalogStore, MovieInsert, ReviewUpsert, StoreError, UpsertedReview};

#[derive(Debug, Default)]
struct MemoryState {
    users: BTreeMap<i64, User>,
    movies: BTreeMap<i64, Movie>,
    /// Keyed by (user_id, movie_id); the key is the uniqueness constraint.
    reviews: BTreeMap<(i64, i64), Review>,
    next_user_id: i64,
    next_movie_id: i64,
    next_review_id: i64,
}

impl MemoryState {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }
}

#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn review_count(&self, movie_id: i64) -> usize {
        let state = self.state.lock().await;
        state
            .reviews
            .values()
            .filter(|r| r.movie_id == movie_id)
            .count()
    }

    pub async fn movie_count(&self) -> usize {
        self.state.lock().await.movies.len()
    }
}

fn sorted_by_name(mut movies: Vec<Movie>) -> Vec<Movie> {
    movies.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    movies
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn list_movies(&self) -> Result<Vec<Movie>, StoreError> {
        let state = self.state.lock().await;
        Ok(sorted_by_name(state.movies.values().cloned().collect()))
    }

    async fn search_movies(&self, query: &str) -> Result<Vec<Movie>, StoreError> {
        let needle = query.to_lowercase();
        let state = self.state.lock().await;
        Ok(sorted_by_name(
            state
                .movies
                .values()
                .filter(|m| m.name.to_lowercase().contains(&needle))
                .cloned()
                .collect(),
        ))
    }

    async fn get_movie(&self, movie_id: i64) -> Result<Option<Movie>, StoreError> {
        Ok(self.state.lock().await.movies.get(&movie_id).cloned())
    }

    async fn find_movie_by_name(&self, name: &str) -> Result<Option<Movie>, StoreError> {
        let key = name_key(name);
        let state = self.state.lock().await;
        Ok(state
            .movies
            .values()
            .find(|m| name_key(&m.name) == key)
            .cloned())
    }

    async fn insert_movie_if_absent(&self, movie: &NewMovie) -> Result<MovieInsert, StoreError> {
        let key = name_key(&movie.name);
        let mut state = self.state.lock().await;
        if let Some(existing) = state.movies.values().find(|m| name_key(&m.name) == key) {
            return Ok(MovieInsert::Existing(existing.clone()));
        }
        let id = MemoryState::next_id(&mut state.next_movie_id);
        let stored = Movie {
            id,
            name: movie.name.clone(),
            director: movie.director.clone(),
            release_year: movie.release_year,
            synopsis: movie.synopsis.clone(),
            poster_url: movie.poster_url.clone(),
            average_rating: 0.0,
            created_at: Utc::now(),
        };
        state.movies.insert(id, stored.clone());
        Ok(MovieInsert::Created(stored))
    }

    async fn list_reviews(&self, movie_id: i64) -> Result<Vec<MovieReview>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .reviews
            .values()
            .filter(|r| r.movie_id == movie_id)
            .map(|r| MovieReview {
                id: r.id,
                user_id: r.user_id,
                username: state
                    .users
                    .get(&r.user_id)
                    .map(|u| u.username.clone())
                    .unwrap_or_default(),
                rating: r.rating,
                comment: r.comment.clone(),
                updated_at: r.updated_at,
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|u| u.username == username) {
            return Err(StoreError::Conflict(format!(
                "username {username} already exists"
            )));
        }
        let id = MemoryState::next_id(&mut state.next_user_id);
        let user = User {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        state.users.insert(id, user.clone());
        Ok(user)
    }

    async fn upsert_review(&self, review: &ReviewUpsert) -> Result<UpsertedReview, StoreError> {
        if !(MIN_RATING..=MAX_RATING).contains(&review.rating) {
            return Err(StoreError::Conflict(format!(
                "rating {} outside {MIN_RATING}..={MAX_RATING}",
                review.rating
            )));
        }
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&review.user_id) {
            return Err(StoreError::MissingReference(format!("user {}", review.user_id)));
        }
        if !state.movies.contains_key(&review.movie_id) {
            return Err(StoreError::MissingReference(format!("movie {}", review.movie_id)));
        }

        let now = Utc::now();
        let key = (review.user_id, review.movie_id);
        if let Some(existing) = state.reviews.get_mut(&key) {
            existing.rating = review.rating;
            existing.comment = review.comment.clone();
            existing.updated_at = now;
            return Ok(UpsertedReview {
                review: existing.clone(),
                created: false,
            });
        }

        let id = MemoryState::next_id(&mut state.next_review_id);
        let stored = Review {
            id,
            user_id: review.user_id,
            movie_id: review.movie_id,
            rating: review.rating,
            comment: review.comment.clone(),
            updated_at: now,
        };
        state.reviews.insert(key, stored.clone());
        Ok(UpsertedReview {
            review: stored,
            created: true,
        })
    }

    async fn recompute_average(&self, movie_id: i64) -> Result<f64, StoreError> {
        let mut state = self.state.lock().await;
        let ratings = state
            .reviews
            .values()
            .filter(|r| r.movie_id == movie_id)
            .map(|r| r.rating)
            .collect::<Vec<_>>();
        let average = average_rating(&ratings);
        let movie = state
            .movies
            .get_mut(&movie_id)
            .ok_or_else(|| StoreError::MissingReference(format!("movie {movie_id}")))?;
        movie.average_rating = average;
        Ok(average)
    }
}

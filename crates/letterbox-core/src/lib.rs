//! Core catalog domain model: users, movies, reviews and rating arithmetic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "letterbox-core";

pub const MIN_RATING: i16 = 1;
pub const MAX_RATING: i16 = 5;
pub const MAX_COMMENT_CHARS: usize = 1000;
pub const MAX_SEARCH_QUERY_CHARS: usize = 100;

pub const SYNOPSIS_PLACEHOLDER: &str = "Sinopsis no disponible";
pub const DIRECTOR_PLACEHOLDER: &str = "Director no disponible";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Stored movie row. `average_rating` is derived from the movie's reviews and
/// only ever written by the rating aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub id: i64,
    pub name: String,
    pub director: Option<String>,
    pub release_year: Option<i32>,
    pub synopsis: Option<String>,
    pub poster_url: Option<String>,
    pub average_rating: f64,
    pub created_at: DateTime<Utc>,
}

/// Client-facing projection of a movie carried in responses and live events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieSnapshot {
    pub id: i64,
    pub name: String,
    pub director: Option<String>,
    pub release_year: Option<i32>,
    pub poster_url: Option<String>,
    pub average_rating: f64,
}

impl From<&Movie> for MovieSnapshot {
    fn from(movie: &Movie) -> Self {
        Self {
            id: movie.id,
            name: movie.name.clone(),
            director: movie.director.clone(),
            release_year: movie.release_year,
            poster_url: movie.poster_url.clone(),
            average_rating: movie.average_rating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: i64,
    pub user_id: i64,
    pub movie_id: i64,
    pub rating: i16,
    pub comment: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Review joined with its author's display name, as listed under a movie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieReview {
    pub id: i64,
    pub user_id: i64,
    pub username: String,
    pub rating: i16,
    pub comment: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized metadata handed from the scraper to ingestion. Optional text
/// fields already carry their placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovieMetadata {
    pub name: String,
    pub synopsis: String,
    pub poster_url: Option<String>,
    pub director: String,
    pub release_year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMovie {
    pub name: String,
    pub director: Option<String>,
    pub release_year: Option<i32>,
    pub synopsis: Option<String>,
    pub poster_url: Option<String>,
}

impl From<MovieMetadata> for NewMovie {
    fn from(meta: MovieMetadata) -> Self {
        Self {
            name: meta.name,
            director: Some(meta.director),
            release_year: meta.release_year,
            synopsis: Some(meta.synopsis),
            poster_url: meta.poster_url,
        }
    }
}

/// Rating as submitted by a client: a JSON integer or an integer string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RatingInput {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RatingInput {
    /// Returns the rating when it is a whole number in `MIN_RATING..=MAX_RATING`.
    pub fn parse(&self) -> Option<i16> {
        let value = match self {
            RatingInput::Integer(v) => *v,
            RatingInput::Float(_) => return None,
            RatingInput::Text(s) => s.trim().parse::<i64>().ok()?,
        };
        if (i64::from(MIN_RATING)..=i64::from(MAX_RATING)).contains(&value) {
            Some(value as i16)
        } else {
            None
        }
    }
}

impl From<i64> for RatingInput {
    fn from(value: i64) -> Self {
        RatingInput::Integer(value)
    }
}

impl From<&str> for RatingInput {
    fn from(value: &str) -> Self {
        RatingInput::Text(value.to_string())
    }
}

pub fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Mean of the ratings rounded to two decimals; `0.0` for an empty set.
pub fn average_rating(ratings: &[i16]) -> f64 {
    if ratings.is_empty() {
        return 0.0;
    }
    let sum: i64 = ratings.iter().map(|r| i64::from(*r)).sum();
    round_to_hundredths(sum as f64 / ratings.len() as f64)
}

/// Trims a comment and clamps it to `MAX_COMMENT_CHARS`; blank input becomes `None`.
pub fn clamp_comment(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_COMMENT_CHARS).collect())
}

/// Trims a search query and clamps it to `MAX_SEARCH_QUERY_CHARS`.
pub fn sanitize_query(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_SEARCH_QUERY_CHARS).collect())
}

/// Key used for case-insensitive title matching.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

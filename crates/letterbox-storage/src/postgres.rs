//! PostgreSQL catalog store backed by `sqlx`.

use async_trait::async_trait;
use letterbox_core::{Movie, MovieReview, NewMovie, Review, User};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::{CatalogStore, MovieInsert, ReviewUpsert, StoreError, UpsertedReview};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const BY_NAME: &str = "WHERE LOWER(TRIM(name)) = LOWER($1) ORDER BY id LIMIT 1";

const MOVIE_COLUMNS: &str =
    "id, name, director, release_year, synopsis, poster_url, average_rating, created_at";

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to catalog database");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("catalog migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn movie_from_row(row: &PgRow) -> Result<Movie, sqlx::Error> {
    Ok(Movie {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        director: row.try_get("director")?,
        release_year: row.try_get("release_year")?,
        synopsis: row.try_get("synopsis")?,
        poster_url: row.try_get("poster_url")?,
        average_rating: row.try_get("average_rating")?,
        created_at: row.try_get("created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

fn review_from_row(row: &PgRow) -> Result<Review, sqlx::Error> {
    Ok(Review {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        movie_id: row.try_get("movie_id")?,
        rating: row.try_get("rating")?,
        comment: row.try_get("comment")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Escapes LIKE wildcards so user input matches literally.
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn list_movies(&self) -> Result<Vec<Movie>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MOVIE_COLUMNS} FROM movies ORDER BY name ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(movie_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn search_movies(&self, query: &str) -> Result<Vec<Movie>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MOVIE_COLUMNS}
              FROM movies
             WHERE name ILIKE '%' || $1 || '%'
             ORDER BY name ASC, id ASC
            "#
        ))
        .bind(escape_like(query))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(movie_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_movie(&self, movie_id: i64) -> Result<Option<Movie>, StoreError> {
        let row = sqlx::query(&format!("SELECT {MOVIE_COLUMNS} FROM movies WHERE id = $1"))
            .bind(movie_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(movie_from_row).transpose()?)
    }

    async fn find_movie_by_name(&self, name: &str) -> Result<Option<Movie>, StoreError> {
        let row = sqlx::query(&format!("SELECT {MOVIE_COLUMNS} FROM movies {BY_NAME}"))
        .bind(name.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(movie_from_row).transpose()?)
    }

    async fn insert_movie_if_absent(&self, movie: &NewMovie) -> Result<MovieInsert, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent ingestions of the same title until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext(LOWER($1)))")
            .bind(movie.name.trim())
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(&format!("SELECT {MOVIE_COLUMNS} FROM movies {BY_NAME}"))
        .bind(movie.name.trim())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            tx.commit().await?;
            return Ok(MovieInsert::Existing(movie_from_row(&row)?));
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO movies (name, director, release_year, synopsis, poster_url, average_rating)
            VALUES ($1, $2, $3, $4, $5, 0.0)
            RETURNING {MOVIE_COLUMNS}
            "#
        ))
        .bind(&movie.name)
        .bind(&movie.director)
        .bind(movie.release_year)
        .bind(&movie.synopsis)
        .bind(&movie.poster_url)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let stored = movie_from_row(&row)?;
        debug!(movie_id = stored.id, name = %stored.name, "movie inserted");
        Ok(MovieInsert::Created(stored))
    }

    async fn list_reviews(&self, movie_id: i64) -> Result<Vec<MovieReview>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.user_id, u.username, r.rating, r.comment, r.updated_at
              FROM reviews r
              JOIN users u ON u.id = r.user_id
             WHERE r.movie_id = $1
             ORDER BY r.updated_at DESC, r.id DESC
            "#,
        )
        .bind(movie_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MovieReview {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                username: row.try_get("username")?,
                rating: row.try_get("rating")?,
                comment: row.try_get("comment")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(out)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, created_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<User, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (username, password_hash)
            VALUES ($1, $2)
            RETURNING id, username, password_hash, created_at
            "#,
        )
        .bind(username)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(user_from_row(&row)?)
    }

    async fn upsert_review(&self, review: &ReviewUpsert) -> Result<UpsertedReview, StoreError> {
        // xmax is zero only for a freshly inserted tuple.
        let row = sqlx::query(
            r#"
            INSERT INTO reviews (user_id, movie_id, rating, comment, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id, movie_id) DO UPDATE
               SET rating = EXCLUDED.rating,
                   comment = EXCLUDED.comment,
                   updated_at = NOW()
            RETURNING id, user_id, movie_id, rating, comment, updated_at, (xmax = 0) AS inserted
            "#,
        )
        .bind(review.user_id)
        .bind(review.movie_id)
        .bind(review.rating)
        .bind(&review.comment)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpsertedReview {
            review: review_from_row(&row)?,
            created: row.try_get("inserted")?,
        })
    }

    async fn recompute_average(&self, movie_id: i64) -> Result<f64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query("SELECT id FROM movies WHERE id = $1 FOR UPDATE")
            .bind(movie_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::MissingReference(format!("movie {movie_id}")));
        }

        // Runs after the row lock, so its snapshot includes every review
        // committed by writers that recomputed before us.
        let row = sqlx::query(
            r#"
            UPDATE movies
               SET average_rating = COALESCE(
                       (SELECT ROUND(AVG(rating)::numeric, 2)::float8
                          FROM reviews
                         WHERE movie_id = $1),
                       0.0)
             WHERE id = $1
            RETURNING average_rating
            "#,
        )
        .bind(movie_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(row.try_get("average_rating")?)
    }
}

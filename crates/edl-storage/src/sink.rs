//! Receivers for matched pairs.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use edl_core::{MatchedPair, Pass};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::info;

use crate::source_table::FixtureSourceTable;

#[async_trait]
pub trait MatchSink: Send + Sync {
    async fn create_schema(&self) -> Result<()>;

    /// Store one pass worth of pairs; returns how many match rows were new.
    async fn store(&self, pass: Pass, pairs: &[MatchedPair]) -> Result<usize>;
}

const CREATE_SCHEMA_SQL: [&str; 3] = [
    r#"
CREATE TABLE IF NOT EXISTS directory_matches (
    source_id      TEXT PRIMARY KEY REFERENCES source_establishments (id),
    directory_id   TEXT NOT NULL,
    name           TEXT,
    address        TEXT,
    city           TEXT,
    postal_code    TEXT,
    phone          TEXT,
    review_count   INTEGER,
    rating         DOUBLE PRECISION,
    match_pass     TEXT NOT NULL,
    matched_at     TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS directory_categories (
    directory_id   TEXT NOT NULL,
    category       TEXT NOT NULL,
    PRIMARY KEY (directory_id, category)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS directory_neighborhoods (
    directory_id   TEXT NOT NULL,
    neighborhood   TEXT NOT NULL,
    PRIMARY KEY (directory_id, neighborhood)
)
"#,
];

/// Writes matches to Postgres, expanding categories and neighborhoods into
/// their own rows. Uniqueness is left to the table constraints.
#[derive(Debug, Clone)]
pub struct PgMatchSink {
    pool: PgPool,
}

impl PgMatchSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MatchSink for PgMatchSink {
    async fn create_schema(&self) -> Result<()> {
        for statement in CREATE_SCHEMA_SQL {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("creating directory match tables")?;
        }
        Ok(())
    }

    async fn store(&self, pass: Pass, pairs: &[MatchedPair]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("opening match transaction")?;
        let mut inserted = 0usize;

        for pair in pairs {
            let candidate = &pair.candidate;
            let result = sqlx::query(
                r#"
                INSERT INTO directory_matches
                    (source_id, directory_id, name, address, city, postal_code, phone,
                     review_count, rating, match_pass)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (source_id) DO NOTHING
                "#,
            )
            .bind(&pair.source.id)
            .bind(&candidate.directory_id)
            .bind(&candidate.name)
            .bind(&candidate.address)
            .bind(&candidate.city)
            .bind(&candidate.postal_code)
            .bind(&candidate.phone)
            .bind(candidate.review_count.map(|n| n as i32))
            .bind(candidate.rating)
            .bind(pass.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting match for source {}", pair.source.id))?;
            inserted += result.rows_affected() as usize;

            for category in &candidate.categories {
                sqlx::query(
                    "INSERT INTO directory_categories (directory_id, category) VALUES ($1, $2) \
                     ON CONFLICT DO NOTHING",
                )
                .bind(&candidate.directory_id)
                .bind(category)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting category for {}", candidate.directory_id))?;
            }

            for neighborhood in &candidate.neighborhoods {
                sqlx::query(
                    "INSERT INTO directory_neighborhoods (directory_id, neighborhood) VALUES ($1, $2) \
                     ON CONFLICT DO NOTHING",
                )
                .bind(&candidate.directory_id)
                .bind(neighborhood)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting neighborhood for {}", candidate.directory_id))?;
            }
        }

        tx.commit().await.context("committing matches")?;
        info!(pass = pass.as_str(), pairs = pairs.len(), inserted, "stored directory matches");
        Ok(inserted)
    }
}

/// Sink for fixture runs: keeps pairs in memory and feeds matched ids back
/// into the fixture table so the address pass skips them.
#[derive(Debug)]
pub struct FixtureMatchSink {
    table: Arc<FixtureSourceTable>,
    stored: Mutex<Vec<(Pass, MatchedPair)>>,
}

impl FixtureMatchSink {
    pub fn new(table: Arc<FixtureSourceTable>) -> Self {
        Self {
            table,
            stored: Mutex::new(Vec::new()),
        }
    }

    pub async fn stored(&self) -> Vec<(Pass, MatchedPair)> {
        self.stored.lock().await.clone()
    }
}

#[async_trait]
impl MatchSink for FixtureMatchSink {
    async fn create_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn store(&self, pass: Pass, pairs: &[MatchedPair]) -> Result<usize> {
        let mut stored = self.stored.lock().await;
        let mut inserted = 0usize;
        for pair in pairs {
            if stored.iter().any(|(_, existing)| existing.source.id == pair.source.id) {
                continue;
            }
            stored.push((pass, pair.clone()));
            inserted += 1;
        }
        drop(stored);

        self.table
            .mark_matched(pairs.iter().map(|pair| pair.source.id.as_str()))
            .await;
        Ok(inserted)
    }
}

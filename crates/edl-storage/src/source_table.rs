//! Ordered, offset-paginated reads over the cleaned establishment table.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use edl_core::SourceRecord;
use serde::Deserialize;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SourceTableError {
    #[error("source table query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("fixture source table: {0}")]
    Fixture(String),
    #[error("window bound {0} is beyond what the database can address")]
    WindowOutOfRange(u64),
}

/// Which records a read may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceScope {
    /// Every record in the window.
    All,
    /// Records in the window whose id is not yet in the matched output.
    Unmatched,
}

/// A window `[offset, offset + limit)` of the table ordered by id ascending.
/// `limit: None` reads to the end of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceQuery {
    pub offset: u64,
    pub limit: Option<u64>,
    pub scope: SourceScope,
}

#[async_trait]
pub trait SourceTable: Send + Sync {
    async fn read(&self, query: SourceQuery) -> Result<Vec<SourceRecord>, SourceTableError>;
}

#[derive(Debug, Clone)]
pub struct PgSourceTable {
    pool: PgPool,
}

impl PgSourceTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const READ_WINDOW_SQL: &str = r#"
SELECT id, name, address, postal_code, phone
FROM source_establishments
ORDER BY id ASC
LIMIT $1 OFFSET $2
"#;

// The window is taken over the full table first, so the cursor keeps moving
// through the same id ranges in both passes.
const READ_UNMATCHED_WINDOW_SQL: &str = r#"
SELECT id, name, address, postal_code, phone
FROM source_establishments
WHERE id IN (
    (SELECT id FROM source_establishments ORDER BY id ASC LIMIT $1 OFFSET $2)
    EXCEPT
    (SELECT source_id FROM directory_matches)
)
ORDER BY id ASC
"#;

#[async_trait]
impl SourceTable for PgSourceTable {
    async fn read(&self, query: SourceQuery) -> Result<Vec<SourceRecord>, SourceTableError> {
        let sql = match query.scope {
            SourceScope::All => READ_WINDOW_SQL,
            SourceScope::Unmatched => READ_UNMATCHED_WINDOW_SQL,
        };
        let (limit, offset) = window_bounds(&query)?;
        // LIMIT NULL is LIMIT ALL in Postgres.
        let rows = sqlx::query(sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<SourceRecord, SourceTableError> {
                let id: String = row.try_get("id")?;
                let name: Option<String> = row.try_get("name")?;
                let address: Option<String> = row.try_get("address")?;
                let postal_code: Option<String> = row.try_get("postal_code")?;
                let phone: Option<String> = row.try_get("phone")?;
                Ok(SourceRecord::new(
                    id,
                    name.as_deref(),
                    address.as_deref(),
                    postal_code.as_deref(),
                    phone.as_deref(),
                ))
            })
            .collect()
    }
}

/// `(LIMIT, OFFSET)` as Postgres BIGINTs.
fn window_bounds(query: &SourceQuery) -> Result<(Option<i64>, i64), SourceTableError> {
    let to_bigint = |n: u64| i64::try_from(n).map_err(|_| SourceTableError::WindowOutOfRange(n));
    let limit = query.limit.map(to_bigint).transpose()?;
    Ok((limit, to_bigint(query.offset)?))
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureSourceRow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    postal_code: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

/// In-memory source table loaded from a JSON fixture. Tracks matched ids
/// itself so `SourceScope::Unmatched` behaves like the database set-difference.
#[derive(Debug)]
pub struct FixtureSourceTable {
    records: Vec<SourceRecord>,
    matched: Mutex<HashSet<String>>,
}

impl FixtureSourceTable {
    pub fn new(mut records: Vec<SourceRecord>) -> Self {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            records,
            matched: Mutex::new(HashSet::new()),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SourceTableError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| SourceTableError::Fixture(format!("reading {}: {err}", path.display())))?;
        let rows: Vec<FixtureSourceRow> = serde_json::from_str(&text)
            .map_err(|err| SourceTableError::Fixture(format!("parsing {}: {err}", path.display())))?;
        Ok(Self::new(
            rows.into_iter()
                .map(|row| {
                    SourceRecord::new(
                        row.id,
                        row.name.as_deref(),
                        row.address.as_deref(),
                        row.postal_code.as_deref(),
                        row.phone.as_deref(),
                    )
                })
                .collect(),
        ))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub async fn mark_matched<'a>(&self, ids: impl IntoIterator<Item = &'a str>) {
        let mut matched = self.matched.lock().await;
        matched.extend(ids.into_iter().map(str::to_string));
    }
}

#[async_trait]
impl SourceTable for FixtureSourceTable {
    async fn read(&self, query: SourceQuery) -> Result<Vec<SourceRecord>, SourceTableError> {
        let start = (query.offset as usize).min(self.records.len());
        let end = match query.limit {
            Some(limit) => start.saturating_add(limit as usize).min(self.records.len()),
            None => self.records.len(),
        };
        let window = &self.records[start..end];

        match query.scope {
            SourceScope::All => Ok(window.to_vec()),
            SourceScope::Unmatched => {
                let matched = self.matched.lock().await;
                Ok(window
                    .iter()
                    .filter(|record| !matched.contains(&record.id))
                    .cloned()
                    .collect())
            }
        }
    }
}

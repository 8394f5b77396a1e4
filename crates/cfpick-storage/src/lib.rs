//! Relational catalog storage (SQLite via sqlx), tag resolution, and the HTTP
//! fetcher the sync job leans on.

use std::str::FromStr;
use std::time::Duration;

use cfpick_core::{NewProblem, Problem, ProblemKey, Tag};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};

mod fetch;
mod tags;

pub use fetch::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryBudget};
pub use tags::TagResolver;

pub const CRATE_NAME: &str = "cfpick-storage";

/// Columns selected whenever a full [`Problem`] is read; pair with [`problem_from_row`].
pub const PROBLEM_COLUMNS: &str =
    "p.id, p.contest_id, p.problem_index, p.name, p.category, p.points, p.solved_count";

const CREATE_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS problems (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        contest_id    INTEGER NOT NULL,
        problem_index TEXT    NOT NULL,
        name          TEXT    NOT NULL,
        category      TEXT    NOT NULL,
        points        REAL,
        solved_count  INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS problems_contest_index_key ON problems (contest_id, problem_index)",
    "CREATE INDEX IF NOT EXISTS problems_points_idx ON problems (points)",
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS problem_tags (
        problem_id INTEGER NOT NULL REFERENCES problems (id) ON DELETE CASCADE,
        tag_id     INTEGER NOT NULL REFERENCES tags (id) ON DELETE CASCADE,
        PRIMARY KEY (problem_id, tag_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS problem_tags_tag_id_idx ON problem_tags (tag_id)",
];

// Association table first so no foreign key is left dangling mid-drop.
const DROP_STATEMENTS: &[&str] = &[
    "DROP TABLE IF EXISTS problem_tags",
    "DROP TABLE IF EXISTS problems",
    "DROP TABLE IF EXISTS tags",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{entity} `{key}` already exists")]
    Conflict { entity: &'static str, key: String },
    #[error("tag `{0}` could not be resolved after repeated conflicts")]
    TagUnresolved(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn problem_from_row(row: &SqliteRow) -> Result<Problem, sqlx::Error> {
    Ok(Problem {
        id: row.try_get("id")?,
        contest_id: row.try_get("contest_id")?,
        index: row.try_get("problem_index")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        points: row.try_get("points")?,
        solved_count: row.try_get("solved_count")?,
    })
}

pub fn tag_from_row(row: &SqliteRow) -> Result<Tag, sqlx::Error> {
    Ok(Tag {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
    })
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

/// Owner of the `problems`, `tags` and `problem_tags` tables.
///
/// Pool-level methods each take their own connection for the duration of one
/// call. Multi-statement work (the sync cycle) goes through [`CatalogStore::begin`]
/// and the `*_in` functions, which run on whatever connection or transaction
/// they are handed.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    tags: TagResolver,
}

impl CatalogStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with(StoreConfig::new(database_url)).await
    }

    pub async fn connect_with(config: StoreConfig) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);

        // Every connection to `:memory:` is its own database, so keep exactly one alive.
        let pool_options = if config.is_in_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self {
            pool,
            tags: TagResolver::default(),
        };
        store.ensure_schema().await?;
        info!(database_url = %config.database_url, "catalog store ready");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tag_resolver(&self) -> &TagResolver {
        &self.tags
    }

    pub async fn begin(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn ensure_schema(&self) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        ensure_schema_in(&mut conn).await
    }

    /// Destroys and recreates every catalog table in one transaction.
    pub async fn reset_schema(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        reset_schema_in(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn create_problem(&self, problem: &NewProblem) -> StoreResult<Problem> {
        let mut conn = self.pool.acquire().await?;
        create_problem_in(&mut conn, problem).await
    }

    /// Creates the problem and links it to `tags` (resolved get-or-create style)
    /// as one unit. Repeated tag names are linked once.
    pub async fn ingest_problem(&self, problem: &NewProblem, tags: &[String]) -> StoreResult<Problem> {
        let mut tx = self.pool.begin().await?;
        let created = create_problem_in(&mut tx, problem).await?;
        for name in tags {
            let tag = self.tags.get_or_create(&mut tx, name).await?;
            link_tag_in(&mut tx, created.id, tag.id).await?;
        }
        tx.commit().await?;
        Ok(created)
    }

    pub async fn get_problem(&self, contest_id: i64, index: &str) -> StoreResult<Option<Problem>> {
        let mut conn = self.pool.acquire().await?;
        get_problem_in(&mut conn, contest_id, index).await
    }

    pub async fn list_all_problems(&self) -> StoreResult<Vec<Problem>> {
        let rows = sqlx::query(&format!("SELECT {PROBLEM_COLUMNS} FROM problems p ORDER BY p.id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| problem_from_row(row).map_err(StoreError::from))
            .collect()
    }

    pub async fn count_problems(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM problems")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn list_tags(&self) -> StoreResult<Vec<Tag>> {
        let rows = sqlx::query("SELECT id, name FROM tags ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| tag_from_row(row).map_err(StoreError::from))
            .collect()
    }

    pub async fn tags_for_problem(&self, problem_id: i64) -> StoreResult<Vec<Tag>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.name
              FROM tags t
              JOIN problem_tags pt ON pt.tag_id = t.id
             WHERE pt.problem_id = ?
             ORDER BY t.name
            "#,
        )
        .bind(problem_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| tag_from_row(row).map_err(StoreError::from))
            .collect()
    }

    pub async fn resolve_tag(&self, name: &str) -> StoreResult<Tag> {
        let mut conn = self.pool.acquire().await?;
        self.tags.get_or_create(&mut conn, name).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn ensure_schema_in(conn: &mut SqliteConnection) -> StoreResult<()> {
    for statement in CREATE_STATEMENTS {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}

pub async fn reset_schema_in(conn: &mut SqliteConnection) -> StoreResult<()> {
    for statement in DROP_STATEMENTS {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    ensure_schema_in(conn).await?;
    debug!("catalog schema recreated");
    Ok(())
}

pub async fn create_problem_in(conn: &mut SqliteConnection, problem: &NewProblem) -> StoreResult<Problem> {
    let result = sqlx::query(
        r#"
        INSERT INTO problems (contest_id, problem_index, name, category, points, solved_count)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(problem.contest_id)
    .bind(&problem.index)
    .bind(&problem.name)
    .bind(&problem.category)
    .bind(problem.points)
    .bind(problem.solved_count)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(done) => Ok(Problem {
            id: done.last_insert_rowid(),
            contest_id: problem.contest_id,
            index: problem.index.clone(),
            name: problem.name.clone(),
            category: problem.category.clone(),
            points: problem.points,
            solved_count: problem.solved_count,
        }),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(StoreError::Conflict {
            entity: "problem",
            key: ProblemKey::new(problem.contest_id, problem.index.clone()).to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}

pub async fn get_problem_in(
    conn: &mut SqliteConnection,
    contest_id: i64,
    index: &str,
) -> StoreResult<Option<Problem>> {
    let row = sqlx::query(&format!(
        "SELECT {PROBLEM_COLUMNS} FROM problems p WHERE p.contest_id = ? AND p.problem_index = ?"
    ))
    .bind(contest_id)
    .bind(index)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref()
        .map(problem_from_row)
        .transpose()
        .map_err(StoreError::from)
}

/// Links a problem to a tag; linking the same pair twice is a no-op.
pub async fn link_tag_in(conn: &mut SqliteConnection, problem_id: i64, tag_id: i64) -> StoreResult<()> {
    sqlx::query("INSERT OR IGNORE INTO problem_tags (problem_id, tag_id) VALUES (?, ?)")
        .bind(problem_id)
        .bind(tag_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

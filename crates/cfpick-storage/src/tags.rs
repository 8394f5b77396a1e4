use cfpick_core::Tag;
use sqlx::sqlite::SqliteConnection;
use sqlx::Connection;
use tracing::debug;

use crate::{tag_from_row, StoreError, StoreResult};

/// Idempotent tag materialization on top of the unique index on `tags.name`.
///
/// An upfront lookup is not enough on its own: two resolvers can both miss and
/// race to insert. The insert therefore runs inside a savepoint, and a unique
/// violation rolls the savepoint back and re-reads the row the other writer
/// committed.
#[derive(Debug, Clone)]
pub struct TagResolver {
    max_attempts: usize,
}

impl Default for TagResolver {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl TagResolver {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Exact, case-sensitive lookup.
    pub async fn get_by_name(&self, conn: &mut SqliteConnection, name: &str) -> StoreResult<Option<Tag>> {
        let row = sqlx::query("SELECT id, name FROM tags WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(tag_from_row).transpose().map_err(StoreError::from)
    }

    /// Unconditional insert. An existing name comes back as [`StoreError::Conflict`].
    pub async fn create(&self, conn: &mut SqliteConnection, name: &str) -> StoreResult<Tag> {
        let result = sqlx::query("INSERT INTO tags (name) VALUES (?)")
            .bind(name)
            .execute(&mut *conn)
            .await;
        match result {
            Ok(done) => Ok(Tag {
                id: done.last_insert_rowid(),
                name: name.to_string(),
            }),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(StoreError::Conflict {
                entity: "tag",
                key: name.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_or_create(&self, conn: &mut SqliteConnection, name: &str) -> StoreResult<Tag> {
        if let Some(tag) = self.get_by_name(conn, name).await? {
            return Ok(tag);
        }
        self.create_or_refetch(conn, name).await
    }

    /// Insert path of [`TagResolver::get_or_create`]: a conflict means someone
    /// else created the tag first, so read theirs instead of failing.
    pub async fn create_or_refetch(&self, conn: &mut SqliteConnection, name: &str) -> StoreResult<Tag> {
        for attempt in 1..=self.max_attempts {
            let mut savepoint = conn.begin().await?;
            match self.create(&mut savepoint, name).await {
                Ok(tag) => {
                    savepoint.commit().await?;
                    return Ok(tag);
                }
                Err(StoreError::Conflict { .. }) => {
                    savepoint.rollback().await?;
                    debug!(tag = name, attempt, "tag already created elsewhere; re-reading");
                    if let Some(tag) = self.get_by_name(conn, name).await? {
                        return Ok(tag);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::TagUnresolved(name.to_string()))
    }
}

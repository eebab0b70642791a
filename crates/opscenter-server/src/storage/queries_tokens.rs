//! Registration token queries.

use opscenter_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::{DatabaseError, FleetDatabase};
use super::etag::token_etag;
use super::models::Token;

impl FleetDatabase {
    /// Create a new token.
    pub async fn create_token(
        &self,
        uuid: &str,
        uses_remaining: i64,
        expire_at: i64,
        description: &str,
    ) -> Result<Token, DatabaseError> {
        let now = unix_timestamp();
        let etag = token_etag(uses_remaining, expire_at, description);

        sqlx::query(
            "INSERT INTO tokens (uuid, uses_remaining, expire_at, description, etag, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid)
        .bind(uses_remaining)
        .bind(expire_at)
        .bind(description)
        .bind(&etag)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_token(uuid).await
    }

    /// Get a token by UUID.
    pub async fn get_token(&self, uuid: &str) -> Result<Token, DatabaseError> {
        sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Token {uuid}")))
    }

    /// List all tokens, oldest first.
    pub async fn list_tokens(&self) -> Result<Vec<Token>, DatabaseError> {
        let tokens = sqlx::query_as::<_, Token>("SELECT * FROM tokens ORDER BY created_at, uuid")
            .fetch_all(self.pool())
            .await?;
        Ok(tokens)
    }

    /// Replace a token's editable fields, optionally guarded by its etag.
    pub async fn update_token(
        &self,
        uuid: &str,
        uses_remaining: i64,
        expire_at: i64,
        description: &str,
        if_match: Option<&str>,
    ) -> Result<Token, DatabaseError> {
        let mut tx = self.begin_write().await?;

        let existing = sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Token {uuid}")))?;

        if if_match.is_some_and(|tag| tag != existing.etag) {
            return Err(DatabaseError::Conflict(format!("Token {uuid} was modified")));
        }

        let etag = token_etag(uses_remaining, expire_at, description);
        let result = sqlx::query(
            "UPDATE tokens SET uses_remaining = ?, expire_at = ?, description = ?, etag = ? \
             WHERE uuid = ? AND etag = ?",
        )
        .bind(uses_remaining)
        .bind(expire_at)
        .bind(description)
        .bind(&etag)
        .bind(uuid)
        .bind(&existing.etag)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(DatabaseError::Conflict(format!("Token {uuid} was modified")));
        }

        let updated = sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE uuid = ?")
            .bind(uuid)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(updated)
    }

    /// Delete a token.
    pub async fn delete_token(&self, uuid: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM tokens WHERE uuid = ?")
            .bind(uuid)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Consume one use of a token if it is still redeemable at `now`.
    pub async fn redeem_token(&self, uuid: &str, now: i64) -> Result<bool, DatabaseError> {
        let mut tx = self.begin_write().await?;
        let redeemed = redeem_in(&mut *tx, uuid, now).await?;
        tx.commit().await?;
        Ok(redeemed)
    }
}

/// Atomic check-and-decrement on an open connection or transaction.
///
/// The guard lives in the `UPDATE` itself, so concurrent redemptions of the
/// last use cannot both succeed.
pub(super) async fn redeem_in(
    conn: &mut SqliteConnection,
    uuid: &str,
    now: i64,
) -> Result<bool, DatabaseError> {
    let result = sqlx::query(
        "UPDATE tokens SET uses_remaining = uses_remaining - 1 \
         WHERE uuid = ? AND uses_remaining > 0 AND expire_at > ?",
    )
    .bind(uuid)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() != 1 {
        return Ok(false);
    }

    let token = sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE uuid = ?")
        .bind(uuid)
        .fetch_one(&mut *conn)
        .await?;

    sqlx::query("UPDATE tokens SET etag = ? WHERE uuid = ?")
        .bind(token_etag(
            token.uses_remaining,
            token.expire_at,
            &token.description,
        ))
        .bind(uuid)
        .execute(&mut *conn)
        .await?;

    Ok(true)
}

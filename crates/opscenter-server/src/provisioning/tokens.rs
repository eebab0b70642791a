//! Registration token lifecycle.

use opscenter_core::db::unix_timestamp;
use tracing::info;

use crate::config_store::ConfigStore;
use crate::error::{FleetError, FleetResult};
use crate::storage::{FleetDatabase, Token, TokenState};

/// Creates, edits and seeds invitation tokens.
#[derive(Clone)]
pub struct TokenLifecycle {
    db: FleetDatabase,
    config: ConfigStore,
}

impl TokenLifecycle {
    pub const fn new(db: FleetDatabase, config: ConfigStore) -> Self {
        Self { db, config }
    }

    pub async fn create(
        &self,
        uses_remaining: i64,
        expire_at: i64,
        description: &str,
    ) -> FleetResult<Token> {
        if uses_remaining < 0 {
            return Err(FleetError::InvalidArgument(
                "uses_remaining must not be negative".into(),
            ));
        }
        if expire_at <= unix_timestamp() {
            return Err(FleetError::InvalidArgument(
                "expire_at must be in the future".into(),
            ));
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        let token = self
            .db
            .create_token(&uuid, uses_remaining, expire_at, description)
            .await?;
        info!(token = %token.uuid, uses_remaining, "Token created");
        Ok(token)
    }

    /// Tokens, optionally restricted to one computed state.
    pub async fn list(&self, state: Option<TokenState>) -> FleetResult<Vec<Token>> {
        let now = unix_timestamp();
        let tokens = self.db.list_tokens().await?;
        Ok(match state {
            Some(state) => tokens
                .into_iter()
                .filter(|t| t.state_at(now) == state)
                .collect(),
            None => tokens,
        })
    }

    pub async fn get(&self, uuid: &str) -> FleetResult<Token> {
        Ok(self.db.get_token(uuid).await?)
    }

    /// Edit a token. Unlike `create`, a past `expire_at` is allowed.
    pub async fn update(
        &self,
        uuid: &str,
        uses_remaining: i64,
        expire_at: i64,
        description: &str,
        if_match: Option<&str>,
    ) -> FleetResult<Token> {
        if uses_remaining < 0 {
            return Err(FleetError::InvalidArgument(
                "uses_remaining must not be negative".into(),
            ));
        }
        let token = self
            .db
            .update_token(uuid, uses_remaining, expire_at, description, if_match)
            .await?;
        info!(token = %uuid, "Token updated");
        Ok(token)
    }

    pub async fn delete(&self, uuid: &str) -> FleetResult<()> {
        if !self.db.delete_token(uuid).await? {
            return Err(FleetError::NotFound(format!("Token {uuid}")));
        }
        info!(token = %uuid, "Token deleted");
        Ok(())
    }

    /// Single-use token living for the configured reset lifetime.
    pub async fn seed(&self, description: &str) -> FleetResult<Token> {
        let lifetime = self.config.snapshot().reset_token_lifetime_secs;
        self.create(1, unix_timestamp() + lifetime, description)
            .await
    }
}

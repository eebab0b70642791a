//! Server queries: registration, self-update, probe results and admin edits.

use opscenter_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::{DatabaseError, FleetDatabase};
use super::etag::server_etag;
use super::models::{NewServer, ProbedFacts, SelfUpdate, Server, ServerFilter, ServerStatus};
use super::queries_tokens::redeem_in;

const SELECT_SERVER_BY_NAME: &str = "SELECT * FROM servers WHERE name = ?";

impl FleetDatabase {
    /// Redeem `token` and insert a new `Pending` server in one transaction.
    ///
    /// Fails with `NotFound` if the token is not redeemable and `Conflict` if
    /// the name or certificate is already registered; in both cases no token
    /// use is consumed.
    pub async fn register_server(
        &self,
        token: &str,
        server: &NewServer<'_>,
        now: i64,
    ) -> Result<Server, DatabaseError> {
        let mut tx = self.begin_write().await?;

        if !redeem_in(&mut tx, token, now).await? {
            return Err(DatabaseError::NotFound(format!("Redeemable token {token}")));
        }

        let server_type = server.server_type.as_str();
        let etag = server_etag(
            server.name,
            None,
            server.connection_url,
            server_type,
            server.certificate_fingerprint,
        );

        sqlx::query(
            "INSERT INTO servers (name, cluster, server_type, connection_url, certificate, \
             certificate_fingerprint, status, etag, last_updated) \
             VALUES (?, NULL, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(server.name)
        .bind(server_type)
        .bind(server.connection_url)
        .bind(server.certificate)
        .bind(server.certificate_fingerprint)
        .bind(ServerStatus::Pending.as_str())
        .bind(&etag)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let created = fetch_server(&mut tx, server.name).await?;

        tx.commit().await?;

        Ok(created)
    }

    /// Get a server by name.
    pub async fn get_server(&self, name: &str) -> Result<Server, DatabaseError> {
        sqlx::query_as::<_, Server>(SELECT_SERVER_BY_NAME)
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Server {name}")))
    }

    /// Find the server registered with the given certificate fingerprint.
    pub async fn get_server_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Server>, DatabaseError> {
        let server = sqlx::query_as::<_, Server>(
            "SELECT * FROM servers WHERE certificate_fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(self.pool())
        .await?;

        Ok(server)
    }

    /// List servers matching every set filter field, ordered by name.
    pub async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<Server>, DatabaseError> {
        let status = filter.status.map(ServerStatus::as_str);
        let server_type = filter.server_type.map(|t| t.as_str());

        let servers = sqlx::query_as::<_, Server>(
            "SELECT * FROM servers \
             WHERE (? IS NULL OR cluster = ?) \
               AND (? IS NULL OR status = ?) \
               AND (? IS NULL OR server_type = ?) \
             ORDER BY name",
        )
        .bind(filter.cluster.as_deref())
        .bind(filter.cluster.as_deref())
        .bind(status)
        .bind(status)
        .bind(server_type)
        .bind(server_type)
        .fetch_all(self.pool())
        .await?;

        Ok(servers)
    }

    /// Apply a machine's self-reported changes. Never touches status or
    /// certificate.
    pub async fn update_server_self(
        &self,
        name: &str,
        update: &SelfUpdate<'_>,
    ) -> Result<Server, DatabaseError> {
        let mut tx = self.begin_write().await?;
        let existing = fetch_server(&mut tx, name).await?;

        let connection_url = update
            .connection_url
            .unwrap_or(&existing.connection_url);
        let etag = server_etag(
            &existing.name,
            existing.cluster.as_deref(),
            connection_url,
            &existing.server_type,
            &existing.certificate_fingerprint,
        );

        sqlx::query(
            "UPDATE servers SET connection_url = ?, hardware_data = ?, os_data = ?, \
             version_data = ?, etag = ?, last_updated = ? WHERE name = ?",
        )
        .bind(connection_url)
        .bind(update.hardware_data.unwrap_or(&existing.hardware_data))
        .bind(update.os_data.unwrap_or(&existing.os_data))
        .bind(update.version_data.unwrap_or(&existing.version_data))
        .bind(&etag)
        .bind(unix_timestamp())
        .bind(name)
        .execute(&mut *tx)
        .await?;

        let updated = fetch_server(&mut tx, name).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Change a server's connection URL, guarded by its etag.
    pub async fn update_server_connection_url(
        &self,
        name: &str,
        connection_url: &str,
        if_match: Option<&str>,
    ) -> Result<Server, DatabaseError> {
        let mut tx = self.begin_write().await?;
        let existing = fetch_server(&mut tx, name).await?;
        check_precondition(&existing, if_match)?;

        let etag = server_etag(
            &existing.name,
            existing.cluster.as_deref(),
            connection_url,
            &existing.server_type,
            &existing.certificate_fingerprint,
        );

        let result = sqlx::query(
            "UPDATE servers SET connection_url = ?, etag = ?, last_updated = ? \
             WHERE name = ? AND etag = ?",
        )
        .bind(connection_url)
        .bind(&etag)
        .bind(unix_timestamp())
        .bind(name)
        .bind(&existing.etag)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(modified(name));
        }

        let updated = fetch_server(&mut tx, name).await?;
        tx.commit().await?;
        Ok(updated)
    }

    /// Rename a server, guarded by its etag. Inventory rows follow the rename.
    pub async fn rename_server(
        &self,
        name: &str,
        new_name: &str,
        if_match: Option<&str>,
    ) -> Result<Server, DatabaseError> {
        let mut tx = self.begin_write().await?;
        let existing = fetch_server(&mut tx, name).await?;
        check_precondition(&existing, if_match)?;

        let taken: Option<(String,)> = sqlx::query_as("SELECT name FROM servers WHERE name = ?")
            .bind(new_name)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Err(DatabaseError::Conflict(format!("Server {new_name} already exists")));
        }

        let etag = server_etag(
            new_name,
            existing.cluster.as_deref(),
            &existing.connection_url,
            &existing.server_type,
            &existing.certificate_fingerprint,
        );

        let result = sqlx::query(
            "UPDATE servers SET name = ?, etag = ?, last_updated = ? WHERE name = ? AND etag = ?",
        )
        .bind(new_name)
        .bind(&etag)
        .bind(unix_timestamp())
        .bind(name)
        .bind(&existing.etag)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(modified(name));
        }

        sqlx::query("UPDATE inventory SET server = ? WHERE server = ?")
            .bind(new_name)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        let renamed = fetch_server(&mut tx, new_name).await?;
        tx.commit().await?;
        Ok(renamed)
    }

    /// Delete a server that is not part of any cluster, with its inventory.
    pub async fn delete_unclustered_server(&self, name: &str) -> Result<(), DatabaseError> {
        let mut tx = self.begin_write().await?;
        let existing = fetch_server(&mut tx, name).await?;

        if let Some(cluster) = &existing.cluster {
            return Err(DatabaseError::Conflict(format!(
                "Server {name} belongs to cluster {cluster}"
            )));
        }

        sqlx::query("DELETE FROM inventory WHERE server = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM servers WHERE name = ? AND cluster IS NULL")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record a successful probe: status becomes `Ready` and facts refresh.
    ///
    /// Returns `false` if the server no longer exists.
    pub async fn record_probe_success(
        &self,
        name: &str,
        facts: &ProbedFacts<'_>,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE servers SET status = ?, hardware_data = ?, os_data = ?, version_data = ?, \
             last_seen = ?, last_updated = ? WHERE name = ?",
        )
        .bind(ServerStatus::Ready.as_str())
        .bind(facts.hardware_data)
        .bind(facts.os_data)
        .bind(facts.version_data)
        .bind(now)
        .bind(now)
        .bind(name)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a failed probe. Only `Ready`/`Unreachable` servers move to
    /// `Unreachable`; a `Pending` server stays `Pending`.
    ///
    /// Returns `true` if the stored status changed.
    pub async fn record_probe_failure(&self, name: &str, now: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE servers SET status = ?, last_updated = ? WHERE name = ? AND status = ?",
        )
        .bind(ServerStatus::Unreachable.as_str())
        .bind(now)
        .bind(name)
        .bind(ServerStatus::Ready.as_str())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remember the hash of the configuration last pushed to a server.
    pub async fn set_server_config_hash(
        &self,
        name: &str,
        config_hash: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE servers SET config_hash = ? WHERE name = ?")
            .bind(config_hash)
            .bind(name)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

pub(super) async fn fetch_server(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Server, DatabaseError> {
    sqlx::query_as::<_, Server>(SELECT_SERVER_BY_NAME)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Server {name}")))
}

fn check_precondition(server: &Server, if_match: Option<&str>) -> Result<(), DatabaseError> {
    if if_match.is_some_and(|tag| tag != server.etag) {
        return Err(modified(&server.name));
    }
    Ok(())
}

fn modified(name: &str) -> DatabaseError {
    DatabaseError::Conflict(format!("Server {name} was modified"))
}

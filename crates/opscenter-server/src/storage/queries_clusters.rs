//! Cluster and artifact queries.
//!
//! Membership lives on `servers.cluster`; every operation that changes it
//! does so inside the same transaction as the cluster row it refers to.

use opscenter_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::{DatabaseError, FleetDatabase};
use super::etag::{cluster_etag, server_etag};
use super::models::{
    Artifact, ArtifactDetail, ArtifactFile, ArtifactFileInfo, Cluster, ClusterDetail,
    ClusterStatus, ClusterUpdate, NewArtifact, NewCluster, Server, ServerStatus,
};
use super::queries_servers::fetch_server;

const SELECT_CLUSTER_BY_NAME: &str = "SELECT * FROM clusters WHERE name = ?";

impl FleetDatabase {
    /// Insert a cluster and claim every member server atomically.
    ///
    /// Each member must still exist, be `Ready` and unclaimed at commit time;
    /// otherwise nothing is written and `Conflict` (or `NotFound`) is returned.
    pub async fn create_cluster(
        &self,
        cluster: &NewCluster<'_>,
        members: &[String],
    ) -> Result<ClusterDetail, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.begin_write().await?;

        let etag = cluster_etag(
            cluster.name,
            cluster.connection_url,
            cluster.channel,
            cluster.fingerprint,
            cluster.services_config,
            cluster.application_seed_config,
        );

        sqlx::query(
            "INSERT INTO clusters (name, connection_url, channel, certificate, fingerprint, \
             services_config, application_seed_config, status, etag, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cluster.name)
        .bind(cluster.connection_url)
        .bind(cluster.channel)
        .bind(cluster.certificate)
        .bind(cluster.fingerprint)
        .bind(cluster.services_config)
        .bind(cluster.application_seed_config)
        .bind(cluster.status.as_str())
        .bind(&etag)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for member in members {
            let server = fetch_server(&mut tx, member).await?;
            let etag = server_etag(
                &server.name,
                Some(cluster.name),
                &server.connection_url,
                &server.server_type,
                &server.certificate_fingerprint,
            );

            let claimed = sqlx::query(
                "UPDATE servers SET cluster = ?, etag = ?, last_updated = ? \
                 WHERE name = ? AND cluster IS NULL AND status = ?",
            )
            .bind(cluster.name)
            .bind(&etag)
            .bind(now)
            .bind(member)
            .bind(ServerStatus::Ready.as_str())
            .execute(&mut *tx)
            .await?;

            if claimed.rows_affected() != 1 {
                return Err(DatabaseError::Conflict(format!(
                    "Server {member} is no longer available for clustering"
                )));
            }
        }

        let detail = fetch_cluster_detail(&mut tx, cluster.name).await?;
        tx.commit().await?;
        Ok(detail)
    }

    /// Get a cluster by name.
    pub async fn get_cluster(&self, name: &str) -> Result<Cluster, DatabaseError> {
        sqlx::query_as::<_, Cluster>(SELECT_CLUSTER_BY_NAME)
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Cluster {name}")))
    }

    /// Get a cluster and its member names.
    pub async fn get_cluster_detail(&self, name: &str) -> Result<ClusterDetail, DatabaseError> {
        let mut conn = self.pool().acquire().await?;
        fetch_cluster_detail(&mut conn, name).await
    }

    /// List clusters, optionally filtered by status, ordered by name.
    pub async fn list_clusters(
        &self,
        status: Option<ClusterStatus>,
    ) -> Result<Vec<ClusterDetail>, DatabaseError> {
        let status = status.map(ClusterStatus::as_str);
        let clusters = sqlx::query_as::<_, Cluster>(
            "SELECT * FROM clusters WHERE (? IS NULL OR status = ?) ORDER BY name",
        )
        .bind(status)
        .bind(status)
        .fetch_all(self.pool())
        .await?;

        let memberships: Vec<(String, String)> = sqlx::query_as(
            "SELECT cluster, name FROM servers WHERE cluster IS NOT NULL ORDER BY name",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(clusters
            .into_iter()
            .map(|cluster| {
                let members = memberships
                    .iter()
                    .filter(|(c, _)| *c == cluster.name)
                    .map(|(_, name)| name.clone())
                    .collect();
                ClusterDetail { cluster, members }
            })
            .collect())
    }

    /// Edit a cluster's mutable fields, guarded by its etag.
    pub async fn update_cluster(
        &self,
        name: &str,
        update: &ClusterUpdate<'_>,
        if_match: Option<&str>,
    ) -> Result<ClusterDetail, DatabaseError> {
        let mut tx = self.begin_write().await?;
        let existing = fetch_cluster(&mut tx, name).await?;
        check_precondition(&existing, if_match)?;

        let connection_url = update
            .connection_url
            .unwrap_or(&existing.connection_url);
        let channel = update.channel.unwrap_or(&existing.channel);
        let services_config = update
            .services_config
            .unwrap_or(&existing.services_config);
        let application_seed_config = update
            .application_seed_config
            .unwrap_or(&existing.application_seed_config);

        let etag = cluster_etag(
            name,
            connection_url,
            channel,
            &existing.fingerprint,
            services_config,
            application_seed_config,
        );

        let result = sqlx::query(
            "UPDATE clusters SET connection_url = ?, channel = ?, services_config = ?, \
             application_seed_config = ?, etag = ?, last_updated = ? WHERE name = ? AND etag = ?",
        )
        .bind(connection_url)
        .bind(channel)
        .bind(services_config)
        .bind(application_seed_config)
        .bind(&etag)
        .bind(unix_timestamp())
        .bind(name)
        .bind(&existing.etag)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(modified(name));
        }

        let detail = fetch_cluster_detail(&mut tx, name).await?;
        tx.commit().await?;
        Ok(detail)
    }

    /// Replace a cluster's certificate and fingerprint, guarded by its etag.
    pub async fn update_cluster_certificate(
        &self,
        name: &str,
        certificate: &str,
        fingerprint: &str,
        if_match: Option<&str>,
    ) -> Result<ClusterDetail, DatabaseError> {
        let mut tx = self.begin_write().await?;
        let existing = fetch_cluster(&mut tx, name).await?;
        check_precondition(&existing, if_match)?;

        let etag = cluster_etag(
            name,
            &existing.connection_url,
            &existing.channel,
            fingerprint,
            &existing.services_config,
            &existing.application_seed_config,
        );

        let result = sqlx::query(
            "UPDATE clusters SET certificate = ?, fingerprint = ?, etag = ?, last_updated = ? \
             WHERE name = ? AND etag = ?",
        )
        .bind(certificate)
        .bind(fingerprint)
        .bind(&etag)
        .bind(unix_timestamp())
        .bind(name)
        .bind(&existing.etag)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(modified(name));
        }

        let detail = fetch_cluster_detail(&mut tx, name).await?;
        tx.commit().await?;
        Ok(detail)
    }

    /// Rename a cluster, moving member references, inventory and artifacts
    /// in the same transaction.
    pub async fn rename_cluster(
        &self,
        name: &str,
        new_name: &str,
        if_match: Option<&str>,
    ) -> Result<ClusterDetail, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.begin_write().await?;
        let existing = fetch_cluster(&mut tx, name).await?;
        check_precondition(&existing, if_match)?;

        let taken: Option<(String,)> = sqlx::query_as("SELECT name FROM clusters WHERE name = ?")
            .bind(new_name)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Err(DatabaseError::Conflict(format!(
                "Cluster {new_name} already exists"
            )));
        }

        let etag = cluster_etag(
            new_name,
            &existing.connection_url,
            &existing.channel,
            &existing.fingerprint,
            &existing.services_config,
            &existing.application_seed_config,
        );

        let result = sqlx::query(
            "UPDATE clusters SET name = ?, etag = ?, last_updated = ? WHERE name = ? AND etag = ?",
        )
        .bind(new_name)
        .bind(&etag)
        .bind(now)
        .bind(name)
        .bind(&existing.etag)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Err(modified(name));
        }

        let members = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE cluster = ?")
            .bind(name)
            .fetch_all(&mut *tx)
            .await?;
        for member in &members {
            let etag = server_etag(
                &member.name,
                Some(new_name),
                &member.connection_url,
                &member.server_type,
                &member.certificate_fingerprint,
            );
            sqlx::query("UPDATE servers SET cluster = ?, etag = ?, last_updated = ? WHERE name = ?")
                .bind(new_name)
                .bind(&etag)
                .bind(now)
                .bind(&member.name)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE inventory SET cluster = ? WHERE cluster = ?")
            .bind(new_name)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE artifacts SET cluster = ? WHERE cluster = ?")
            .bind(new_name)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        let detail = fetch_cluster_detail(&mut tx, new_name).await?;
        tx.commit().await?;
        Ok(detail)
    }

    /// Set a cluster's status (scheduler writes, last-write-wins).
    pub async fn set_cluster_status(
        &self,
        name: &str,
        status: ClusterStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE clusters SET status = ?, last_updated = ? WHERE name = ?")
            .bind(status.as_str())
            .bind(unix_timestamp())
            .bind(name)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a cluster that is `Pending`/`Unknown` and has no members.
    pub async fn delete_cluster_if_unused(&self, name: &str) -> Result<(), DatabaseError> {
        let mut tx = self.begin_write().await?;
        let existing = fetch_cluster(&mut tx, name).await?;

        if existing.status() == ClusterStatus::Ready {
            return Err(DatabaseError::Conflict(format!(
                "Cluster {name} is ready; use force deletion"
            )));
        }

        let (members,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM servers WHERE cluster = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        if members > 0 {
            return Err(DatabaseError::Conflict(format!(
                "Cluster {name} still has {members} member server(s)"
            )));
        }

        remove_cluster_rows(&mut tx, name).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove a cluster together with every server referencing it.
    ///
    /// Returns the removed servers so callers can act on the machines.
    pub async fn delete_cluster_with_members(
        &self,
        name: &str,
    ) -> Result<Vec<Server>, DatabaseError> {
        let mut tx = self.begin_write().await?;
        fetch_cluster(&mut tx, name).await?;

        let members =
            sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE cluster = ? ORDER BY name")
                .bind(name)
                .fetch_all(&mut *tx)
                .await?;

        for member in &members {
            sqlx::query("DELETE FROM inventory WHERE server = ?")
                .bind(&member.name)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM servers WHERE cluster = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        remove_cluster_rows(&mut tx, name).await?;
        tx.commit().await?;
        Ok(members)
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    /// Store an artifact, replacing any previous artifact of the same name.
    pub async fn replace_artifact(
        &self,
        cluster: &str,
        artifact: &NewArtifact,
    ) -> Result<(), DatabaseError> {
        let properties = serde_json::to_string(&artifact.properties)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let mut tx = self.begin_write().await?;
        ensure_cluster(&mut tx, cluster).await?;

        sqlx::query("DELETE FROM artifacts WHERE cluster = ? AND name = ?")
            .bind(cluster)
            .bind(&artifact.name)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO artifacts (cluster, name, description, properties, last_updated) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(cluster)
        .bind(&artifact.name)
        .bind(&artifact.description)
        .bind(&properties)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?;

        for file in &artifact.files {
            sqlx::query(
                "INSERT INTO artifact_files (cluster, artifact, name, mime_type, content) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(cluster)
            .bind(&artifact.name)
            .bind(&file.name)
            .bind(&file.mime_type)
            .bind(&file.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// List a cluster's artifacts with their file listings.
    pub async fn list_artifacts(&self, cluster: &str) -> Result<Vec<ArtifactDetail>, DatabaseError> {
        let artifacts =
            sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts WHERE cluster = ? ORDER BY name")
                .bind(cluster)
                .fetch_all(self.pool())
                .await?;

        let mut details = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let files = self.list_artifact_files(cluster, &artifact.name).await?;
            details.push(ArtifactDetail { artifact, files });
        }
        Ok(details)
    }

    /// Get one artifact with its file listing.
    pub async fn get_artifact(
        &self,
        cluster: &str,
        name: &str,
    ) -> Result<ArtifactDetail, DatabaseError> {
        let artifact = sqlx::query_as::<_, Artifact>(
            "SELECT * FROM artifacts WHERE cluster = ? AND name = ?",
        )
        .bind(cluster)
        .bind(name)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Artifact {cluster}/{name}")))?;

        let files = self.list_artifact_files(cluster, name).await?;
        Ok(ArtifactDetail { artifact, files })
    }

    /// Get one artifact file including its content.
    pub async fn get_artifact_file(
        &self,
        cluster: &str,
        artifact: &str,
        file: &str,
    ) -> Result<ArtifactFile, DatabaseError> {
        sqlx::query_as::<_, ArtifactFile>(
            "SELECT * FROM artifact_files WHERE cluster = ? AND artifact = ? AND name = ?",
        )
        .bind(cluster)
        .bind(artifact)
        .bind(file)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Artifact file {cluster}/{artifact}/{file}")))
    }

    async fn list_artifact_files(
        &self,
        cluster: &str,
        artifact: &str,
    ) -> Result<Vec<ArtifactFileInfo>, DatabaseError> {
        let files = sqlx::query_as::<_, ArtifactFileInfo>(
            "SELECT name, mime_type, length(content) AS size FROM artifact_files \
             WHERE cluster = ? AND artifact = ? ORDER BY name",
        )
        .bind(cluster)
        .bind(artifact)
        .fetch_all(self.pool())
        .await?;
        Ok(files)
    }
}

async fn fetch_cluster(conn: &mut SqliteConnection, name: &str) -> Result<Cluster, DatabaseError> {
    sqlx::query_as::<_, Cluster>(SELECT_CLUSTER_BY_NAME)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Cluster {name}")))
}

/// `NotFound` unless `name` is a cluster row visible to this transaction.
pub(super) async fn ensure_cluster(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<(), DatabaseError> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM clusters WHERE name = ?")
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    found
        .map(drop)
        .ok_or_else(|| DatabaseError::NotFound(format!("Cluster {name}")))
}

async fn fetch_cluster_detail(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<ClusterDetail, DatabaseError> {
    let cluster = fetch_cluster(conn, name).await?;
    let members: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM servers WHERE cluster = ? ORDER BY name")
            .bind(name)
            .fetch_all(&mut *conn)
            .await?;

    Ok(ClusterDetail {
        cluster,
        members: members.into_iter().map(|(n,)| n).collect(),
    })
}

/// Delete the cluster row and everything owned by it except servers.
async fn remove_cluster_rows(conn: &mut SqliteConnection, name: &str) -> Result<(), DatabaseError> {
    sqlx::query("DELETE FROM inventory WHERE cluster = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM artifacts WHERE cluster = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM clusters WHERE name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn check_precondition(cluster: &Cluster, if_match: Option<&str>) -> Result<(), DatabaseError> {
    if if_match.is_some_and(|tag| tag != cluster.etag) {
        return Err(modified(&cluster.name));
    }
    Ok(())
}

fn modified(name: &str) -> DatabaseError {
    DatabaseError::Conflict(format!("Cluster {name} was modified"))
}

//! Aggregated inventory projection queries.

use opscenter_core::db::unix_timestamp;

use super::db::{DatabaseError, FleetDatabase};
use super::models::{InventoryFilter, InventoryRecord, NewInventoryRecord};
use super::queries_clusters::ensure_cluster;

impl FleetDatabase {
    /// Replace every inventory row of `cluster` with `records`.
    ///
    /// Runs in one transaction, so readers see either the old or the new set.
    /// A cluster deleted or renamed since the fetch started gets no rows.
    pub async fn replace_inventory(
        &self,
        cluster: &str,
        records: &[NewInventoryRecord],
    ) -> Result<usize, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.begin_write().await?;
        ensure_cluster(&mut tx, cluster).await?;

        sqlx::query("DELETE FROM inventory WHERE cluster = ?")
            .bind(cluster)
            .execute(&mut *tx)
            .await?;

        for record in records {
            sqlx::query(
                "INSERT INTO inventory (cluster, server, project, kind, name, object, last_updated) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(cluster)
            .bind(record.server.as_deref())
            .bind(&record.project)
            .bind(&record.kind)
            .bind(&record.name)
            .bind(record.object.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(records.len())
    }

    /// Query inventory rows matching every set filter field.
    pub async fn list_inventory(
        &self,
        filter: &InventoryFilter,
    ) -> Result<Vec<InventoryRecord>, DatabaseError> {
        let name_pattern = filter
            .name_contains
            .as_deref()
            .map(|s| format!("%{}%", escape_like(s)));

        let records = sqlx::query_as::<_, InventoryRecord>(
            "SELECT * FROM inventory \
             WHERE (? IS NULL OR cluster = ?) \
               AND (? IS NULL OR server = ?) \
               AND (? IS NULL OR project = ?) \
               AND (? IS NULL OR kind = ?) \
               AND (? IS NULL OR name LIKE ? ESCAPE '\\') \
             ORDER BY cluster, kind, project, name",
        )
        .bind(filter.cluster.as_deref())
        .bind(filter.cluster.as_deref())
        .bind(filter.server.as_deref())
        .bind(filter.server.as_deref())
        .bind(filter.project.as_deref())
        .bind(filter.project.as_deref())
        .bind(filter.kind.as_deref())
        .bind(filter.kind.as_deref())
        .bind(name_pattern.as_deref())
        .bind(name_pattern.as_deref())
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

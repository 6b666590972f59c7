//! New node store (PostgreSQL) adapter.

mod tls;

pub use tls::SslMode;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::{types::ToSql, Config as PgConfig, NoTls};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TargetConfig;
use crate::core::{DestinationStore, Node, NodeKind};
use crate::error::{MigrateError, Result};
use crate::state::HarvestState;

/// Destination node store over a deadpool-postgres pool.
pub struct PgNodeStore {
    pool: Pool,
    schema: String,
    root_id: Uuid,
    upsert_sql: String,
}

impl PgNodeStore {
    /// Create the pool and check that a connection can be made.
    pub async fn connect(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = match SslMode::parse(&config.ssl_mode)?.connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => {
                warn!("PostgreSQL TLS is disabled; credentials are sent in plaintext");
                Manager::from_config(pg_config, NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns.max(1))
            .build()
            .map_err(|e| MigrateError::pool(e.to_string(), "creating PostgreSQL pool"))?;

        let store = Self::with_pool(pool, &config.schema, config.root_id);
        store.ping().await?;

        info!(
            "Connected to PostgreSQL: {}:{}/{} (schema={}, pool_size={})",
            config.host, config.port, config.database, config.schema, max_conns
        );
        Ok(store)
    }

    fn with_pool(pool: Pool, schema: &str, root_id: Uuid) -> Self {
        Self {
            pool,
            schema: schema.to_string(),
            root_id,
            upsert_sql: upsert_sql(schema),
        }
    }

    async fn get_client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "getting PostgreSQL connection"))
    }

    /// Create the schema and tables if they do not exist yet.
    pub async fn init_schema(&self) -> Result<()> {
        let client = self.get_client().await?;
        client.batch_execute(&schema_ddl(&self.schema)).await?;
        info!("schema \"{}\" ready", self.schema);
        Ok(())
    }
}

fn schema_ddl(schema: &str) -> String {
    format!(
        r#"
        CREATE SCHEMA IF NOT EXISTS "{s}";
        CREATE TABLE IF NOT EXISTS "{s}".node (
            id                  UUID PRIMARY KEY,
            parent_id           UUID NOT NULL,
            name                TEXT NOT NULL,
            node_type           TEXT NOT NULL,
            owner_id            TEXT,
            is_public           BOOLEAN NOT NULL,
            is_locked           BOOLEAN,
            read_only_groups    TEXT[] NOT NULL,
            read_write_groups   TEXT[] NOT NULL,
            properties          JSONB NOT NULL,
            inherit_permissions BOOLEAN,
            storage_id          TEXT,
            bytes_used          BIGINT,
            busy                BOOLEAN,
            link_target         TEXT,
            last_modified       TIMESTAMPTZ
        );
        CREATE INDEX IF NOT EXISTS node_parent_name ON "{s}".node (parent_id, name);
        CREATE TABLE IF NOT EXISTS "{s}".harvest_state (
            name                TEXT PRIMARY KEY,
            source              TEXT NOT NULL,
            cur_last_modified   TIMESTAMPTZ,
            cur_id              UUID,
            updated_at          TIMESTAMPTZ
        );
        "#,
        s = schema
    )
}

fn upsert_sql(schema: &str) -> String {
    format!(
        r#"INSERT INTO "{}".node (
            id, parent_id, name, node_type, owner_id, is_public, is_locked,
            read_only_groups, read_write_groups, properties,
            inherit_permissions, storage_id, bytes_used, busy, link_target, last_modified
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::text::jsonb, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (id) DO UPDATE SET
            parent_id = EXCLUDED.parent_id,
            name = EXCLUDED.name,
            node_type = EXCLUDED.node_type,
            owner_id = EXCLUDED.owner_id,
            is_public = EXCLUDED.is_public,
            is_locked = EXCLUDED.is_locked,
            read_only_groups = EXCLUDED.read_only_groups,
            read_write_groups = EXCLUDED.read_write_groups,
            properties = EXCLUDED.properties,
            inherit_permissions = EXCLUDED.inherit_permissions,
            storage_id = EXCLUDED.storage_id,
            bytes_used = EXCLUDED.bytes_used,
            busy = EXCLUDED.busy,
            link_target = EXCLUDED.link_target,
            last_modified = EXCLUDED.last_modified"#,
        schema
    )
}

#[async_trait]
impl DestinationStore for PgNodeStore {
    async fn put(&self, node: &Node) -> Result<()> {
        let node_type = node.node_type().code().to_string();
        let read_only: Vec<String> = node.read_only_groups.iter().map(|g| g.to_string()).collect();
        let read_write: Vec<String> = node.read_write_groups.iter().map(|g| g.to_string()).collect();
        let properties = serde_json::to_string(&node.properties)?;

        let (inherit, storage_id, bytes_used, busy, link_target) = match &node.kind {
            NodeKind::Container { inherit_permissions } => {
                (Some(*inherit_permissions), None, None, None, None)
            }
            NodeKind::Data {
                storage_id,
                bytes_used,
                busy,
            } => (None, Some(storage_id.as_str()), *bytes_used, Some(*busy), None),
            NodeKind::Link { target } => (None, None, None, None, Some(target.as_str())),
        };

        let params: [&(dyn ToSql + Sync); 16] = [
            &node.id,
            &node.parent_id,
            &node.name,
            &node_type,
            &node.owner_id,
            &node.is_public,
            &node.is_locked,
            &read_only,
            &read_write,
            &properties,
            &inherit,
            &storage_id,
            &bytes_used,
            &busy,
            &link_target,
            &node.last_modified,
        ];

        let client = self.get_client().await?;
        let stmt = client.prepare_cached(&self.upsert_sql).await?;
        client.execute(&stmt, &params).await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let client = self.get_client().await?;
        let sql = format!(r#"DELETE FROM "{}".node WHERE id = $1"#, self.schema);
        let n = client.execute(sql.as_str(), &[&id]).await?;
        debug!("delete {}: {} rows", id, n);
        Ok(())
    }

    fn root_id(&self) -> Uuid {
        self.root_id
    }

    async fn harvest_state(&self, name: &str, source: &str) -> Result<HarvestState> {
        let client = self.get_client().await?;
        let sql = format!(
            r#"SELECT source, cur_last_modified, cur_id, updated_at
               FROM "{}".harvest_state WHERE name = $1"#,
            self.schema
        );
        let row = client.query_opt(sql.as_str(), &[&name]).await?;
        Ok(match row {
            Some(row) => HarvestState {
                name: name.to_string(),
                source: row.try_get(0)?,
                cur_last_modified: row.try_get::<_, Option<DateTime<Utc>>>(1)?,
                cur_id: row.try_get::<_, Option<Uuid>>(2)?,
                updated_at: row.try_get::<_, Option<DateTime<Utc>>>(3)?,
            },
            None => HarvestState::new(name, source),
        })
    }

    async fn put_harvest_state(&self, state: &HarvestState) -> Result<()> {
        let client = self.get_client().await?;
        let sql = format!(
            r#"INSERT INTO "{}".harvest_state (name, source, cur_last_modified, cur_id, updated_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (name) DO UPDATE SET
                   source = EXCLUDED.source,
                   cur_last_modified = EXCLUDED.cur_last_modified,
                   cur_id = EXCLUDED.cur_id,
                   updated_at = EXCLUDED.updated_at"#,
            self.schema
        );
        client
            .execute(
                sql.as_str(),
                &[
                    &state.name,
                    &state.source,
                    &state.cur_last_modified,
                    &state.cur_id,
                    &state.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let client = self.get_client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_is_idempotent_and_schema_qualified() {
        let ddl = schema_ddl("vospace");
        assert!(ddl.contains(r#"CREATE SCHEMA IF NOT EXISTS "vospace""#));
        assert!(ddl.contains(r#"CREATE TABLE IF NOT EXISTS "vospace".node"#));
        assert!(ddl.contains(r#"CREATE TABLE IF NOT EXISTS "vospace".harvest_state"#));
        assert!(!ddl.contains("DROP"));
    }

    #[test]
    fn test_upsert_covers_every_column() {
        let sql = upsert_sql("vospace");
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE"));
        assert!(sql.contains("$16"));
        for col in ["parent_id", "properties", "link_target", "last_modified"] {
            assert!(sql.contains(&format!("{} = EXCLUDED.{}", col, col)));
        }
    }
}

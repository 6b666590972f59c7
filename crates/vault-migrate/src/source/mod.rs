//! Legacy node store (MSSQL) adapter.
//!
//! Reads the `Node`, `NodeProperty` and `DeletedNodeEvent` tables through a
//! bb8 pool of tiberius clients. The legacy group-read, group-write and
//! last-modified columns are surfaced as node properties so that the
//! translator handles them the same way as any other property.

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::core::node::{PROP_DATE, PROP_GROUPREAD, PROP_GROUPWRITE};
use crate::core::{
    node_id, ContainerRef, DeletedNodeEvent, DeletionLog, NodeType, PropertyCache, SourceKind,
    SourceNode, SourceProperty, SourceStore,
};
use crate::error::{MigrateError, Result};

const NODE_COLUMNS: &str = "nodeID, parentID, name, type, isPublic, isLocked, \
     CAST(ownerID AS NVARCHAR(256)), groupRead, groupWrite, lastModified, \
     contentLength, link, storageID";

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        if self.config.encrypt_enabled() {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Legacy node store over a pooled MSSQL connection.
pub struct MssqlNodeSource {
    pool: Pool<TiberiusConnectionManager>,
    root_uri: String,
}

impl MssqlNodeSource {
    /// Create the pool and check that a connection can be made.
    pub async fn connect(config: SourceConfig, max_size: u32) -> Result<Self> {
        let root_uri = config.root_uri.clone();
        let target = format!("{}:{}/{}", config.host, config.port, config.database);
        let manager = TiberiusConnectionManager::new(config);
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .min_idle(Some(1))
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), format!("creating MSSQL pool for {}", target)))?;

        let source = Self { pool, root_uri };
        source.ping().await?;

        info!("Connected to MSSQL: {} (pool_size={})", target, max_size);
        Ok(source)
    }

    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e.to_string(), "getting MSSQL connection"))
    }

    async fn query_nodes(&self, query: Query<'_>, parent: &ContainerRef) -> Result<Vec<SourceNode>> {
        let mut client = self.get_client().await?;
        let rows = query.query(&mut *client).await?.into_first_result().await?;
        rows.iter().map(|row| node_from_row(row, parent)).collect()
    }
}

fn node_from_row(row: &Row, parent: &ContainerRef) -> Result<SourceNode> {
    let row_id: i64 = required(row.try_get(0)?, "nodeID")?;
    let parent_row_id: Option<i64> = row.try_get(1)?;
    let name: &str = required(row.try_get(2)?, "name")?;
    let type_code: &str = required(row.try_get(3)?, "type")?;
    let path = parent.child_path(name);

    let kind = match type_code {
        "C" => SourceKind::Container,
        "D" => SourceKind::Data {
            storage_id: row
                .try_get::<&str, _>(12)?
                .map(str::to_string)
                .unwrap_or_else(|| row_id.to_string()),
            content_length: row.try_get(10)?,
        },
        "L" => SourceKind::Link {
            target: required(row.try_get::<&str, _>(11)?, "link")?.to_string(),
        },
        other => SourceKind::Other(other.to_string()),
    };

    let mut properties = Vec::new();
    if let Some(groups) = row.try_get::<&str, _>(7)?.filter(|g| !g.trim().is_empty()) {
        properties.push(SourceProperty::new(PROP_GROUPREAD, groups));
    }
    if let Some(groups) = row.try_get::<&str, _>(8)?.filter(|g| !g.trim().is_empty()) {
        properties.push(SourceProperty::new(PROP_GROUPWRITE, groups));
    }
    if let Some(ts) = row.try_get::<NaiveDateTime, _>(9)? {
        properties.push(SourceProperty::new(
            PROP_DATE,
            ts.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        ));
    }

    Ok(SourceNode {
        row_id,
        parent_row_id,
        name: name.to_string(),
        path,
        owner: row.try_get::<&str, _>(6)?.map(str::to_string),
        is_public: row.try_get(4)?.unwrap_or(false),
        is_locked: row.try_get(5)?.unwrap_or(false),
        kind,
        properties,
    })
}

fn required<T>(value: Option<T>, column: &str) -> Result<T> {
    value.ok_or_else(|| MigrateError::Store(format!("unexpected NULL in column {}", column)))
}

#[async_trait]
impl SourceStore for MssqlNodeSource {
    async fn root(&self) -> Result<ContainerRef> {
        Ok(ContainerRef::root(self.root_uri.clone()))
    }

    async fn children_page(
        &self,
        container: &ContainerRef,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SourceNode>> {
        let parent_filter = match container.row_id {
            Some(_) => "parentID = @P2",
            None => "parentID IS NULL",
        };
        let after_filter = match (container.row_id, after) {
            (_, None) => "",
            (Some(_), Some(_)) => " AND name >= @P3",
            (None, Some(_)) => " AND name >= @P2",
        };
        let sql = format!(
            "SELECT TOP (@P1) {} FROM Node WHERE {}{} ORDER BY name",
            NODE_COLUMNS, parent_filter, after_filter
        );
        debug!("children of {} after {:?}", container.path, after);

        let mut query = Query::new(sql);
        query.bind(limit as i64);
        if let Some(id) = container.row_id {
            query.bind(id);
        }
        if let Some(after) = after {
            query.bind(after.to_string());
        }
        self.query_nodes(query, container).await
    }

    async fn child(&self, container: &ContainerRef, name: &str) -> Result<Option<SourceNode>> {
        let sql = match container.row_id {
            Some(_) => format!("SELECT {} FROM Node WHERE name = @P1 AND parentID = @P2", NODE_COLUMNS),
            None => format!("SELECT {} FROM Node WHERE name = @P1 AND parentID IS NULL", NODE_COLUMNS),
        };
        let mut query = Query::new(sql);
        query.bind(name.to_string());
        if let Some(id) = container.row_id {
            query.bind(id);
        }
        Ok(self.query_nodes(query, container).await?.into_iter().next())
    }

    async fn properties(&self, node: &SourceNode) -> Result<Vec<SourceProperty>> {
        let mut query =
            Query::new("SELECT propertyURI, propertyValue FROM NodeProperty WHERE nodeID = @P1");
        query.bind(node.row_id);

        let mut client = self.get_client().await?;
        let rows = query.query(&mut *client).await?.into_first_result().await?;
        rows.iter()
            .map(|row| {
                Ok(SourceProperty::new(
                    required(row.try_get::<&str, _>(0)?, "propertyURI")?,
                    row.try_get::<&str, _>(1)?.unwrap_or_default(),
                ))
            })
            .collect()
    }

    async fn property_cache(&self) -> Result<PropertyCache> {
        info!("building NodeProperty cache ...");
        let mut client = self.get_client().await?;
        let rows = client
            .simple_query("SELECT nodeID, propertyURI, propertyValue FROM NodeProperty ORDER BY nodeID")
            .await?
            .into_first_result()
            .await?;

        let mut cache = PropertyCache::new();
        for row in &rows {
            let id: i64 = required(row.try_get(0)?, "nodeID")?;
            cache.entry(id).or_default().push(SourceProperty::new(
                required(row.try_get::<&str, _>(1)?, "propertyURI")?,
                row.try_get::<&str, _>(2)?.unwrap_or_default(),
            ));
        }
        info!(
            "NodeProperty cache: {} props for {} distinct nodes",
            rows.len(),
            cache.len()
        );
        Ok(cache)
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "mssql"
    }
}

#[async_trait]
impl DeletionLog for MssqlNodeSource {
    async fn deleted_events(
        &self,
        min_timestamp: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<DeletedNodeEvent>> {
        let filter = if min_timestamp.is_some() {
            " WHERE lastModified >= @P2"
        } else {
            ""
        };
        let sql = format!(
            "SELECT TOP (@P1) nodeID, nodeType, lastModified FROM DeletedNodeEvent{} \
             ORDER BY lastModified, nodeID",
            filter
        );
        let mut query = Query::new(sql);
        query.bind(limit as i64);
        if let Some(ts) = min_timestamp {
            query.bind(ts.naive_utc());
        }

        let mut client = self.get_client().await?;
        let rows = query.query(&mut *client).await?.into_first_result().await?;
        rows.iter()
            .map(|row| {
                let id: i64 = required(row.try_get(0)?, "nodeID")?;
                let code: &str = required(row.try_get(1)?, "nodeType")?;
                let node_type = code
                    .chars()
                    .next()
                    .and_then(NodeType::from_code)
                    .ok_or_else(|| {
                        MigrateError::Replay(format!("unexpected nodeType '{}' for node {}", code, id))
                    })?;
                let ts: NaiveDateTime = required(row.try_get(2)?, "lastModified")?;
                Ok(DeletedNodeEvent {
                    id: node_id(id),
                    node_type,
                    last_modified: Utc.from_utc_datetime(&ts),
                })
            })
            .collect()
    }
}

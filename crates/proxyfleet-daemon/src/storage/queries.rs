//! Database queries for the proxyfleet daemon.
//!
//! Traffic counters are only ever moved with atomic add-delta SQL
//! expressions; nothing here reads a counter into memory and writes it
//! back, so concurrent accounting jobs cannot lose updates.

use proxyfleet_core::db::{hour_bucket, unix_timestamp};
use proxyfleet_core::user::User;

use super::db::{Database, DatabaseError};
use super::models::{NodeRecord, NodeStatus, UserRow};

/// Pseudo node id used for the local engine in usage tables.
pub const LOCAL_NODE_ID: i64 = 0;

/// Fields for registering a new node.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub api_port: u16,
    pub certificate: String,
}

impl Database {
    // =========================================================================
    // Node queries
    // =========================================================================

    /// Register a new node, initially `connecting`.
    pub async fn create_node(&self, node: NewNode) -> Result<NodeRecord, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            r"
            INSERT INTO nodes (name, address, port, api_port, certificate, status, last_status_change)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&node.name)
        .bind(&node.address)
        .bind(i64::from(node.port))
        .bind(i64::from(node.api_port))
        .bind(&node.certificate)
        .bind(NodeStatus::Connecting.as_str())
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_node(result.last_insert_rowid()).await
    }

    /// Get a node by ID.
    pub async fn get_node(&self, id: i64) -> Result<NodeRecord, DatabaseError> {
        sqlx::query_as::<_, NodeRecord>("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Node {id}")))
    }

    /// List all nodes.
    pub async fn list_nodes(&self) -> Result<Vec<NodeRecord>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, NodeRecord>("SELECT * FROM nodes ORDER BY id")
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// List nodes that should be kept connected (everything not disabled).
    pub async fn list_enabled_nodes(&self) -> Result<Vec<NodeRecord>, DatabaseError> {
        Ok(sqlx::query_as::<_, NodeRecord>(
            "SELECT * FROM nodes WHERE status != ? ORDER BY id",
        )
        .bind(NodeStatus::Disabled.as_str())
        .fetch_all(self.pool())
        .await?)
    }

    /// Update a node's status, error message and reported engine version.
    ///
    /// This is the last write in every orchestration path, so the persisted
    /// row always reflects the most recently observed outcome.
    pub async fn update_node_status(
        &self,
        id: i64,
        status: NodeStatus,
        message: Option<&str>,
        engine_version: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            UPDATE nodes
            SET status = ?, message = ?, engine_version = COALESCE(?, engine_version),
                last_status_change = ?
            WHERE id = ?
            ",
        )
        .bind(status.as_str())
        .bind(message)
        .bind(engine_version)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Delete a node record.
    pub async fn delete_node(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // User queries
    // =========================================================================

    /// Insert a user. `proxies` and `excluded_inbounds` are serialized from
    /// the snapshot shape.
    pub async fn create_user(&self, user: &User) -> Result<i64, DatabaseError> {
        let proxies =
            serde_json::to_string(&user.proxies).map_err(|e| DatabaseError::Query(e.to_string()))?;
        let excluded = serde_json::to_string(&user.excluded_inbounds)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO users (username, status, proxies, excluded_inbounds) VALUES (?, ?, ?, ?)",
        )
        .bind(&user.username)
        .bind(user.status.as_str())
        .bind(proxies)
        .bind(excluded)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get a user snapshot by id.
    pub async fn get_user(&self, id: i64) -> Result<User, DatabaseError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))?;
        row.into_user()
            .map_err(|e| DatabaseError::Query(e.to_string()))
    }

    /// List users entitled to engine accounts (active or on hold), in a
    /// stable order so runtime-config construction is deterministic.
    pub async fn list_entitled_users(&self) -> Result<Vec<User>, DatabaseError> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE status IN ('active', 'on_hold') ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|r| r.into_user().map_err(|e| DatabaseError::Query(e.to_string())))
            .collect()
    }

    // =========================================================================
    // Usage accounting
    // =========================================================================

    /// Record a per-user traffic delta against a node (or the local engine
    /// with [`LOCAL_NODE_ID`]): lifetime counter, online timestamp, and the
    /// current hour bucket, all via atomic increments.
    pub async fn add_user_usage(
        &self,
        user_id: i64,
        node_id: i64,
        delta: i64,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query("UPDATE users SET used_traffic = used_traffic + ?, online_at = ? WHERE id = ?")
            .bind(delta)
            .bind(now)
            .bind(user_id)
            .execute(self.pool())
            .await?;

        sqlx::query(
            r"
            INSERT INTO user_usage (user_id, node_id, hour, used_traffic)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (user_id, node_id, hour)
            DO UPDATE SET used_traffic = used_traffic + excluded.used_traffic
            ",
        )
        .bind(user_id)
        .bind(node_id)
        .bind(hour_bucket(now))
        .bind(delta)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Record a node-level traffic delta: the node row's cumulative
    /// counters, the current hour bucket, and the system totals.
    pub async fn add_node_usage(
        &self,
        node_id: i64,
        uplink: i64,
        downlink: i64,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        if node_id != LOCAL_NODE_ID {
            sqlx::query("UPDATE nodes SET uplink = uplink + ?, downlink = downlink + ? WHERE id = ?")
                .bind(uplink)
                .bind(downlink)
                .bind(node_id)
                .execute(self.pool())
                .await?;
        }

        sqlx::query(
            r"
            INSERT INTO node_usage (node_id, hour, uplink, downlink)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (node_id, hour)
            DO UPDATE SET uplink = uplink + excluded.uplink,
                          downlink = downlink + excluded.downlink
            ",
        )
        .bind(node_id)
        .bind(hour_bucket(now))
        .bind(uplink)
        .bind(downlink)
        .execute(self.pool())
        .await?;

        sqlx::query("UPDATE system SET uplink = uplink + ?, downlink = downlink + ? WHERE id = 1")
            .bind(uplink)
            .bind(downlink)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// System-wide cumulative totals.
    pub async fn system_usage(&self) -> Result<(i64, i64), DatabaseError> {
        let row: (i64, i64) =
            sqlx::query_as("SELECT uplink, downlink FROM system WHERE id = 1")
                .fetch_one(self.pool())
                .await?;
        Ok(row)
    }

    /// Explicit admin action: zero every usage counter.
    pub async fn reset_usage(&self) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE system SET uplink = 0, downlink = 0 WHERE id = 1")
            .execute(self.pool())
            .await?;
        sqlx::query("UPDATE nodes SET uplink = 0, downlink = 0")
            .execute(self.pool())
            .await?;
        sqlx::query("UPDATE users SET used_traffic = 0")
            .execute(self.pool())
            .await?;
        sqlx::query("DELETE FROM node_usage").execute(self.pool()).await?;
        sqlx::query("DELETE FROM user_usage").execute(self.pool()).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use proxyfleet_core::user::{Protocol, ProxySettings, UserStatus};

    use super::*;

    fn node() -> NewNode {
        NewNode {
            name: "edge-1".into(),
            address: "203.0.113.10".into(),
            port: 62050,
            api_port: 62051,
            certificate: String::new(),
        }
    }

    fn user(username: &str, status: UserStatus) -> User {
        let mut proxies = BTreeMap::new();
        proxies.insert(
            Protocol::Vmess,
            ProxySettings {
                id: Some(uuid::Uuid::new_v4().to_string()),
                ..Default::default()
            },
        );
        User {
            id: 0,
            username: username.into(),
            status,
            proxies,
            excluded_inbounds: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn node_lifecycle() {
        let db = Database::open_in_memory().await.unwrap();
        let record = db.create_node(node()).await.unwrap();
        assert_eq!(record.node_status(), NodeStatus::Connecting);

        db.update_node_status(record.id, NodeStatus::Connected, None, Some("1.8.4"))
            .await
            .unwrap();
        let record = db.get_node(record.id).await.unwrap();
        assert_eq!(record.node_status(), NodeStatus::Connected);
        assert_eq!(record.engine_version.as_deref(), Some("1.8.4"));
        assert!(record.message.is_none());

        db.update_node_status(record.id, NodeStatus::Error, Some("unreachable"), None)
            .await
            .unwrap();
        let record = db.get_node(record.id).await.unwrap();
        assert_eq!(record.node_status(), NodeStatus::Error);
        assert_eq!(record.message.as_deref(), Some("unreachable"));
        // COALESCE keeps the last reported version
        assert_eq!(record.engine_version.as_deref(), Some("1.8.4"));

        db.delete_node(record.id).await.unwrap();
        assert!(matches!(
            db.get_node(record.id).await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn enabled_nodes_excludes_disabled() {
        let db = Database::open_in_memory().await.unwrap();
        let a = db.create_node(node()).await.unwrap();
        let b = db.create_node(node()).await.unwrap();
        db.update_node_status(b.id, NodeStatus::Disabled, None, None)
            .await
            .unwrap();

        let enabled = db.list_enabled_nodes().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, a.id);
    }

    #[tokio::test]
    async fn entitled_users_excludes_disabled_and_expired() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_user(&user("alice", UserStatus::Active)).await.unwrap();
        db.create_user(&user("bob", UserStatus::OnHold)).await.unwrap();
        db.create_user(&user("carol", UserStatus::Disabled)).await.unwrap();
        db.create_user(&user("dave", UserStatus::Expired)).await.unwrap();

        let entitled = db.list_entitled_users().await.unwrap();
        let names: Vec<_> = entitled.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn concurrent_node_deltas_sum_exactly() {
        let db = Database::open_in_memory().await.unwrap();
        let record = db.create_node(node()).await.unwrap();

        // Two accounting jobs racing on the same node must leave totals
        // increased by exactly the sum of their deltas.
        let db_a = db.clone();
        let db_b = db.clone();
        let id = record.id;
        let (a, b) = tokio::join!(
            tokio::spawn(async move { db_a.add_node_usage(id, 100, 50).await }),
            tokio::spawn(async move { db_b.add_node_usage(id, 10, 5).await }),
        );
        a.unwrap().unwrap();
        b.unwrap().unwrap();

        let record = db.get_node(id).await.unwrap();
        assert_eq!((record.uplink, record.downlink), (110, 55));
        assert_eq!(db.system_usage().await.unwrap(), (110, 55));
    }

    #[tokio::test]
    async fn user_usage_buckets_lazily_and_accumulates() {
        let db = Database::open_in_memory().await.unwrap();
        let id = db.create_user(&user("alice", UserStatus::Active)).await.unwrap();

        db.add_user_usage(id, LOCAL_NODE_ID, 500).await.unwrap();
        db.add_user_usage(id, LOCAL_NODE_ID, 250).await.unwrap();

        let user = db.get_user(id).await.unwrap();
        assert_eq!(user.username, "alice");

        let (rows, total): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(used_traffic), 0) FROM user_usage WHERE user_id = ?",
        )
        .bind(id)
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(total, 750);

        let lifetime: (i64,) = sqlx::query_as("SELECT used_traffic FROM users WHERE id = ?")
            .bind(id)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(lifetime.0, 750);
    }

    #[tokio::test]
    async fn reset_usage_zeroes_everything() {
        let db = Database::open_in_memory().await.unwrap();
        let record = db.create_node(node()).await.unwrap();
        let uid = db.create_user(&user("alice", UserStatus::Active)).await.unwrap();
        db.add_node_usage(record.id, 100, 50).await.unwrap();
        db.add_user_usage(uid, record.id, 75).await.unwrap();

        db.reset_usage().await.unwrap();

        assert_eq!(db.system_usage().await.unwrap(), (0, 0));
        let record = db.get_node(record.id).await.unwrap();
        assert_eq!((record.uplink, record.downlink), (0, 0));
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM user_usage")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}

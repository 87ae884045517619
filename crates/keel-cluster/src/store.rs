//! Node and join-token tables.
//!
//! Every election-relevant write is a conditional statement whose outcome is
//! decided by the shared engine: a claim that affects zero rows lost the round.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::backend::{Backend, Engine, Tx, UpsertSyntax, Value};
use keel_core::clock::from_unix;
use sqlx::any::AnyRow;
use sqlx::Row;
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::types::{NodeInfo, NodeStatus};

/// Table holding one row per node.
pub const NODES_TABLE: &str = "cluster_nodes";

/// Table holding hashed join tokens.
pub const TOKENS_TABLE: &str = "cluster_join_tokens";

const NODES_DDL: &str = "CREATE TABLE IF NOT EXISTS cluster_nodes (\
     node_id VARCHAR(64) PRIMARY KEY, \
     hostname VARCHAR(255) NOT NULL, \
     address VARCHAR(255), \
     port INTEGER, \
     version VARCHAR(64) NOT NULL, \
     is_primary INTEGER NOT NULL DEFAULT 0, \
     status VARCHAR(16) NOT NULL, \
     last_heartbeat BIGINT NOT NULL, \
     joined_at BIGINT NOT NULL, \
     metadata TEXT NOT NULL)";

const TOKENS_DDL: &str = "CREATE TABLE IF NOT EXISTS cluster_join_tokens (\
     token_hash VARCHAR(64) PRIMARY KEY, \
     created_by VARCHAR(64) NOT NULL, \
     created_at BIGINT NOT NULL, \
     expires_at BIGINT NOT NULL, \
     used_at BIGINT, \
     used_by VARCHAR(64))";

const NODE_COLUMNS: &str = "node_id, hostname, address, port, version, is_primary, status, \
                            last_heartbeat, joined_at, metadata";

/// Conditional claim: succeeds only when no other online node holds the flag.
///
/// The holder check reads through a derived table so engines that forbid
/// selecting from the update target accept it.
const CLAIM_SQL: &str = "UPDATE cluster_nodes SET is_primary = 1 \
     WHERE node_id = ? AND status = 'online' \
     AND NOT EXISTS (SELECT 1 FROM (\
         SELECT node_id FROM cluster_nodes \
         WHERE is_primary = 1 AND status = 'online' AND node_id <> ?\
     ) AS holders)";

/// Key of the transaction-scoped advisory lock serializing elections.
const ELECTION_LOCK_KEY: i64 = 0x6b65_656c;

/// SQL access to the cluster tables of the control dataset.
#[derive(Debug, Clone)]
pub struct NodeStore {
    backend: Arc<Backend>,
}

impl NodeStore {
    /// Create a store over the control dataset backend.
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Create the node and token tables when missing.
    ///
    /// Concurrent creators racing on the catalog are tolerated.
    pub async fn ensure_schema(&self) -> Result<()> {
        for ddl in [NODES_DDL, TOKENS_DDL] {
            if let Err(e) = self.backend.execute(ddl, &[]).await {
                if !(e.is_already_exists() || e.is_unique_violation()) {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Insert or refresh `node` as online, then claim primary in the same
    /// transaction if no online node holds it.
    ///
    /// Returns whether this node holds the primary flag afterwards.
    pub async fn register(&self, node: &NodeInfo, now: i64) -> Result<bool> {
        let attempt = async {
            let mut tx = self.backend.begin().await?;
            lock_for_election(&mut tx).await?;
            self.upsert_in(&mut tx, node, now).await?;
            let claimed = tx
                .execute(CLAIM_SQL, &[node.node_id.as_str().into(), node.node_id.as_str().into()])
                .await?;
            tx.commit().await?;
            Ok::<_, keel_core::Error>(claimed == 1)
        };

        match attempt.await {
            Ok(claimed) => Ok(claimed),
            Err(e) if e.is_serialization_failure() => {
                // Registration must still land; retry without claiming.
                debug!(node_id = %node.node_id, error = %e, "registration lost election race");
                let mut tx = self.backend.begin().await?;
                self.upsert_in(&mut tx, node, now).await?;
                tx.commit().await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert or refresh `node` as online without claiming.
    pub async fn upsert(&self, node: &NodeInfo, now: i64) -> Result<()> {
        let mut tx = self.backend.begin().await?;
        self.upsert_in(&mut tx, node, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_in(&self, tx: &mut Tx, node: &NodeInfo, now: i64) -> keel_core::Result<()> {
        let metadata = serde_json::to_string(&node.metadata)
            .map_err(|e| keel_core::Error::Decode(e.to_string()))?;

        let mut params = Vec::with_capacity(8);
        params.push(Value::from(node.node_id.as_str()));
        params.push(Value::from(node.hostname.as_str()));
        let address = bind_or_null(node.address.as_deref().map(Value::from), &mut params);
        let port = bind_or_null(node.port.map(Value::from), &mut params);
        params.push(Value::from(node.version.as_str()));
        params.push(Value::from(now));
        params.push(Value::from(now));
        params.push(Value::from(metadata));

        let insert = format!(
            "INSERT INTO cluster_nodes ({}) VALUES (?, ?, {}, {}, ?, 0, 'online', ?, ?, ?)",
            NODE_COLUMNS, address, port
        );
        let sql = match tx.dialect().upsert_syntax() {
            UpsertSyntax::OnConflict => format!(
                "{} ON CONFLICT (node_id) DO UPDATE SET \
                 hostname = excluded.hostname, address = excluded.address, \
                 port = excluded.port, version = excluded.version, is_primary = 0, \
                 status = 'online', last_heartbeat = excluded.last_heartbeat, \
                 joined_at = excluded.joined_at, metadata = excluded.metadata",
                insert
            ),
            UpsertSyntax::OnDuplicateKey => format!(
                "{} ON DUPLICATE KEY UPDATE \
                 hostname = VALUES(hostname), address = VALUES(address), \
                 port = VALUES(port), version = VALUES(version), is_primary = 0, \
                 status = 'online', last_heartbeat = VALUES(last_heartbeat), \
                 joined_at = VALUES(joined_at), metadata = VALUES(metadata)",
                insert
            ),
        };

        tx.execute(&sql, &params).await?;
        Ok(())
    }

    /// Refresh the heartbeat of an online or joining node.
    ///
    /// Returns false when the row is missing or was marked offline.
    pub async fn heartbeat(&self, node_id: &str, now: i64) -> Result<bool> {
        let affected = self
            .backend
            .execute(
                "UPDATE cluster_nodes SET last_heartbeat = ?, status = 'online' \
                 WHERE node_id = ? AND status IN ('online', 'joining')",
                &[now.into(), node_id.into()],
            )
            .await?;
        Ok(affected == 1)
    }

    /// Mark online nodes whose heartbeat is older than `stale_before` offline,
    /// clearing their primary flag. `keep` is never reaped.
    pub async fn reap(&self, stale_before: i64, keep: &str) -> Result<u64> {
        let affected = self
            .backend
            .execute(
                "UPDATE cluster_nodes SET status = 'offline', is_primary = 0 \
                 WHERE status IN ('online', 'joining') AND last_heartbeat < ? AND node_id <> ?",
                &[stale_before.into(), keep.into()],
            )
            .await?;
        Ok(affected)
    }

    /// The online primary, if any.
    pub async fn primary(&self) -> Result<Option<String>> {
        let row = self
            .backend
            .query_one(
                "SELECT node_id FROM cluster_nodes WHERE is_primary = 1 AND status = 'online' \
                 ORDER BY joined_at LIMIT 1",
                &[],
            )
            .await?;
        Ok(row.map(|r| r.try_get::<String, _>(0)).transpose()?)
    }

    /// Whether `node_id` is the committed online primary.
    pub async fn is_primary(&self, node_id: &str) -> Result<bool> {
        let count = self
            .backend
            .query_i64(
                "SELECT COUNT(*) FROM cluster_nodes \
                 WHERE node_id = ? AND is_primary = 1 AND status = 'online'",
                &[node_id.into()],
            )
            .await?;
        Ok(count > 0)
    }

    /// Try to become primary. Returns true only for the winner of the round.
    ///
    /// Losing a serialization race is reported as a lost round.
    pub async fn claim_primary(&self, node_id: &str) -> Result<bool> {
        let attempt = async {
            let mut tx = self.backend.begin().await?;
            lock_for_election(&mut tx).await?;
            let claimed = tx.execute(CLAIM_SQL, &[node_id.into(), node_id.into()]).await?;
            tx.commit().await?;
            Ok::<_, keel_core::Error>(claimed == 1)
        };

        match attempt.await {
            Ok(claimed) => Ok(claimed),
            Err(e) if e.is_serialization_failure() => {
                debug!(node_id = %node_id, error = %e, "election round lost to a concurrent writer");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move the primary flag from `from` to the longest-standing other online
    /// node and mark `from` as leaving, in one transaction.
    ///
    /// Returns the successor, or `None` without changing anything when no
    /// other node is online.
    pub async fn hand_off(&self, from: &str) -> Result<Option<String>> {
        let mut tx = self.backend.begin().await?;
        lock_for_election(&mut tx).await?;

        let successor = tx
            .query_one(
                "SELECT node_id FROM cluster_nodes WHERE status = 'online' AND node_id <> ? \
                 ORDER BY joined_at, node_id LIMIT 1",
                &[from.into()],
            )
            .await?;
        let Some(row) = successor else {
            tx.rollback().await?;
            return Ok(None);
        };
        let successor: String = row.try_get(0)?;

        tx.execute(
            "UPDATE cluster_nodes SET is_primary = 0, status = 'leaving' WHERE node_id = ?",
            &[from.into()],
        )
        .await?;
        tx.execute(
            "UPDATE cluster_nodes SET is_primary = 1 WHERE node_id = ?",
            &[successor.as_str().into()],
        )
        .await?;
        tx.commit().await?;

        Ok(Some(successor))
    }

    /// Set the status of a node, clearing its primary flag unless online.
    pub async fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<bool> {
        let sql = if status == NodeStatus::Online {
            "UPDATE cluster_nodes SET status = ? WHERE node_id = ?"
        } else {
            "UPDATE cluster_nodes SET status = ?, is_primary = 0 WHERE node_id = ?"
        };
        let affected = self
            .backend
            .execute(sql, &[status.as_str().into(), node_id.into()])
            .await?;
        Ok(affected == 1)
    }

    /// Every recorded node, longest-standing first.
    pub async fn list(&self) -> Result<Vec<NodeInfo>> {
        let rows = self
            .backend
            .query(
                &format!(
                    "SELECT {} FROM cluster_nodes ORDER BY joined_at, node_id",
                    NODE_COLUMNS
                ),
                &[],
            )
            .await?;
        rows.iter().map(decode_node).collect()
    }

    /// One node by id.
    pub async fn get(&self, node_id: &str) -> Result<Option<NodeInfo>> {
        let row = self
            .backend
            .query_one(
                &format!("SELECT {} FROM cluster_nodes WHERE node_id = ?", NODE_COLUMNS),
                &[node_id.into()],
            )
            .await?;
        row.as_ref().map(decode_node).transpose()
    }

    /// Store a token digest.
    pub async fn insert_token(
        &self,
        token_hash: &str,
        created_by: &str,
        now: i64,
        expires_at: i64,
    ) -> Result<()> {
        self.backend
            .execute(
                "INSERT INTO cluster_join_tokens (token_hash, created_by, created_at, expires_at) \
                 VALUES (?, ?, ?, ?)",
                &[token_hash.into(), created_by.into(), now.into(), expires_at.into()],
            )
            .await?;
        Ok(())
    }

    /// Mark an unused, unexpired token as used. Only one caller can succeed.
    pub async fn consume_token(&self, token_hash: &str, used_by: &str, now: i64) -> Result<bool> {
        let affected = self
            .backend
            .execute(
                "UPDATE cluster_join_tokens SET used_at = ?, used_by = ? \
                 WHERE token_hash = ? AND used_at IS NULL AND expires_at > ?",
                &[now.into(), used_by.into(), token_hash.into(), now.into()],
            )
            .await?;
        Ok(affected == 1)
    }

    /// Delete tokens that expired before `now`.
    pub async fn purge_expired_tokens(&self, now: i64) -> Result<u64> {
        let affected = self
            .backend
            .execute(
                "DELETE FROM cluster_join_tokens WHERE expires_at <= ?",
                &[now.into()],
            )
            .await?;
        Ok(affected)
    }
}

/// Serialize concurrent claimers inside `tx`.
///
/// PostgreSQL takes a transaction-scoped advisory lock, MySQL locks the node
/// rows and their gaps. SQLite serializes writers on its own.
async fn lock_for_election(tx: &mut Tx) -> keel_core::Result<()> {
    match tx.dialect().engine() {
        Engine::Postgres => {
            tx.execute(
                &format!("SELECT CAST(pg_advisory_xact_lock({}) AS TEXT)", ELECTION_LOCK_KEY),
                &[],
            )
            .await?;
        }
        Engine::MySql => {
            tx.execute("SELECT node_id FROM cluster_nodes FOR UPDATE", &[])
                .await?;
        }
        Engine::Sqlite => {}
    }
    Ok(())
}

/// Push `value` as a parameter and return its placeholder, or inline `NULL`.
///
/// Inlining keeps typed engines from inferring a text parameter for an
/// integer column.
fn bind_or_null(value: Option<Value>, params: &mut Vec<Value>) -> &'static str {
    match value {
        Some(value) => {
            params.push(value);
            "?"
        }
        None => "NULL",
    }
}

/// Read an integer column regardless of the engine's integer width.
fn int_column(row: &AnyRow, column: &str) -> std::result::Result<i64, sqlx::Error> {
    row.try_get::<i64, _>(column)
        .or_else(|_| row.try_get::<i32, _>(column).map(i64::from))
}

fn decode_node(row: &AnyRow) -> Result<NodeInfo> {
    let port = match row.try_get_raw("port").map(|raw| sqlx::ValueRef::is_null(&raw))? {
        true => None,
        false => {
            let port = int_column(row, "port")?;
            Some(u16::try_from(port).map_err(|_| {
                ClusterError::InvalidRecord(format!("port out of range: {}", port))
            })?)
        }
    };
    let metadata: String = row.try_get("metadata")?;
    let metadata: BTreeMap<String, String> = if metadata.trim().is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_str(&metadata)?
    };
    let status: String = row.try_get("status")?;

    Ok(NodeInfo {
        node_id: row.try_get("node_id")?,
        hostname: row.try_get("hostname")?,
        address: row.try_get::<Option<String>, _>("address")?,
        port,
        version: row.try_get("version")?,
        is_primary: int_column(row, "is_primary")? != 0,
        status: status.parse()?,
        last_heartbeat: from_unix(int_column(row, "last_heartbeat")?),
        joined_at: from_unix(int_column(row, "joined_at")?),
        metadata,
    })
}

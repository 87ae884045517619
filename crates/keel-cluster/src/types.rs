//! Core type definitions for cluster membership.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use keel_core::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Node identifier type.
pub type NodeId = String;

/// How this process takes part in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Single node, unconditionally primary, no shared storage.
    Standalone,
    /// Several nodes sharing a networked control dataset.
    Cluster,
}

impl ClusterMode {
    /// Mode implied by the control dataset's engine.
    pub fn for_engine(engine: Engine) -> Self {
        if engine.is_networked() {
            ClusterMode::Cluster
        } else {
            ClusterMode::Standalone
        }
    }
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMode::Standalone => write!(f, "standalone"),
            ClusterMode::Cluster => write!(f, "cluster"),
        }
    }
}

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Registering.
    Joining,
    /// Heartbeating and eligible for election.
    Online,
    /// Handing off before going offline.
    Leaving,
    /// Gone, either gracefully or reaped.
    Offline,
}

impl NodeStatus {
    /// Stored label.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Joining => "joining",
            NodeStatus::Online => "online",
            NodeStatus::Leaving => "leaving",
            NodeStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "joining" => Ok(NodeStatus::Joining),
            "online" => Ok(NodeStatus::Online),
            "leaving" => Ok(NodeStatus::Leaving),
            "offline" => Ok(NodeStatus::Offline),
            other => Err(ClusterError::InvalidRecord(format!(
                "unknown node status: {}",
                other
            ))),
        }
    }
}

/// A cluster node as recorded in shared storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Random identifier, stable for the process lifetime.
    pub node_id: NodeId,
    /// Hostname.
    pub hostname: String,
    /// Advertised address.
    pub address: Option<String>,
    /// Advertised port.
    pub port: Option<u16>,
    /// Software version.
    pub version: String,
    /// Whether the node holds the primary flag.
    pub is_primary: bool,
    /// Lifecycle status.
    pub status: NodeStatus,
    /// Last recorded heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// When the node (re-)joined.
    pub joined_at: DateTime<Utc>,
    /// Free-form labels.
    pub metadata: BTreeMap<String, String>,
}

impl NodeInfo {
    /// Whether this node is online and holds the primary flag.
    pub fn is_active_primary(&self) -> bool {
        self.is_primary && self.status == NodeStatus::Online
    }
}

//! Keel Cluster - Membership and primary election over a shared SQL dataset.
//!
//! Nodes sharing a networked control dataset coordinate through two tables:
//! - `cluster_nodes` - one lease row per node, refreshed by heartbeats
//! - `cluster_join_tokens` - hashed single-use join tokens
//!
//! Election is a conditional update that succeeds only when no other online
//! node holds the primary flag, so the engine's transaction isolation picks
//! exactly one winner. It is a best-effort lease, not a consensus protocol.
//!
//! # Usage
//!
//! ```ignore
//! use keel_cluster::{ClusterConfig, Membership};
//!
//! let membership = Membership::from_datasets(&datasets, ClusterConfig::default())?;
//! membership.start().await?;
//! if membership.is_primary() {
//!     // run primary-only work
//! }
//! membership.leave().await?;
//! ```

pub mod config;
pub mod error;
pub mod membership;
pub mod store;
pub mod token;
pub mod types;
mod worker;

pub use config::ClusterConfig;
pub use error::{ClusterError, Result};
pub use membership::Membership;
pub use store::NodeStore;
pub use token::JoinToken;
pub use types::{ClusterMode, NodeId, NodeInfo, NodeStatus};

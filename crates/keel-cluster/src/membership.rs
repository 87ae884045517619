//! Cluster membership and primary election.
//!
//! In cluster mode the node registers itself in the shared control dataset,
//! then two workers keep it there: a heartbeat that refreshes this node and
//! reaps silent peers, and an election check that claims the primary flag
//! when nobody online holds it. In standalone mode the node is primary from
//! `start` on and never touches shared storage.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use keel_core::clock::{from_unix, unix_now};
use keel_core::{Backend, DatasetManager};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::store::NodeStore;
use crate::token::{generate_token, hash_prefix, hash_token, JoinToken};
use crate::types::{ClusterMode, NodeId, NodeInfo, NodeStatus};
use crate::worker::spawn_periodic;

/// Mutable membership state. Never held across an await.
#[derive(Debug)]
struct MembershipState {
    started: bool,
    primary: bool,
    status: NodeStatus,
    joined_at: i64,
}

struct Inner {
    node_id: NodeId,
    mode: ClusterMode,
    config: ClusterConfig,
    store: NodeStore,
    state: RwLock<MembershipState>,
}

struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// This process's membership in the cluster.
pub struct Membership {
    inner: Arc<Inner>,
    workers: Mutex<Option<Workers>>,
}

impl Membership {
    /// Create a membership over the control dataset backend.
    pub fn new(control: Arc<Backend>, mode: ClusterMode, config: ClusterConfig) -> Self {
        let node_id = uuid::Uuid::new_v4().to_string();
        Self {
            inner: Arc::new(Inner {
                node_id,
                mode,
                config,
                store: NodeStore::new(control),
                state: RwLock::new(MembershipState {
                    started: false,
                    primary: false,
                    status: NodeStatus::Offline,
                    joined_at: unix_now(),
                }),
            }),
            workers: Mutex::new(None),
        }
    }

    /// Create a membership whose mode follows the control dataset's engine.
    pub fn from_datasets(datasets: &DatasetManager, config: ClusterConfig) -> Result<Self> {
        let control = datasets.control()?;
        let mode = ClusterMode::for_engine(control.engine());
        Ok(Self::new(control, mode, config))
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Standalone or cluster.
    pub fn mode(&self) -> ClusterMode {
        self.inner.mode
    }

    /// Whether this node currently believes it is primary.
    pub fn is_primary(&self) -> bool {
        self.inner.state.read().primary
    }

    /// Whether `start` has run and `stop` has not.
    pub fn is_started(&self) -> bool {
        self.inner.state.read().started
    }

    /// This node's lifecycle status.
    pub fn status(&self) -> NodeStatus {
        self.inner.state.read().status
    }

    /// Number of running background workers.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .as_ref()
            .map(|w| w.handles.len())
            .unwrap_or(0)
    }

    /// The node store, for administrative access.
    pub fn store(&self) -> &NodeStore {
        &self.inner.store
    }

    /// Join the cluster. Idempotent.
    ///
    /// Standalone nodes become primary immediately. Cluster nodes create the
    /// shared tables if needed, register (claiming primary when it is free)
    /// and start the heartbeat and election workers.
    pub async fn start(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }

        if self.inner.mode == ClusterMode::Standalone {
            let mut state = self.inner.state.write();
            state.started = true;
            state.primary = true;
            state.status = NodeStatus::Online;
            drop(state);
            info!(node_id = %self.inner.node_id, "standalone node started as primary");
            return Ok(());
        }

        self.inner.state.write().status = NodeStatus::Joining;

        let registered = async {
            self.inner
                .bounded("ensure schema", self.inner.store.ensure_schema())
                .await?;
            self.inner.register().await
        };
        let primary = match registered.await {
            Ok(primary) => primary,
            Err(e) => {
                self.inner.state.write().status = NodeStatus::Offline;
                return Err(e);
            }
        };

        {
            let mut state = self.inner.state.write();
            state.started = true;
            state.primary = primary;
            state.status = NodeStatus::Online;
        }

        let (shutdown, rx) = watch::channel(false);
        let heartbeat = {
            let inner = Arc::clone(&self.inner);
            spawn_periodic(
                "heartbeat",
                self.inner.config.heartbeat_interval(),
                rx.clone(),
                move || {
                    let inner = Arc::clone(&inner);
                    async move { inner.heartbeat().await }
                },
            )
        };
        let election = {
            let inner = Arc::clone(&self.inner);
            spawn_periodic(
                "election",
                self.inner.config.election_interval(),
                rx,
                move || {
                    let inner = Arc::clone(&inner);
                    async move { inner.run_election().await.map(|_| ()) }
                },
            )
        };
        *self.workers.lock() = Some(Workers {
            shutdown,
            handles: vec![heartbeat, election],
        });

        info!(
            node_id = %self.inner.node_id,
            hostname = %self.inner.config.hostname,
            primary,
            "cluster node started"
        );
        Ok(())
    }

    /// Stop the background workers and wait for them to exit. Idempotent and
    /// safe before `start`.
    ///
    /// The node row is left as is; use [`Membership::leave`] to go offline.
    pub async fn stop(&self) {
        let workers = self.workers.lock().take();
        if let Some(workers) = workers {
            let _ = workers.shutdown.send(true);
            for result in futures::future::join_all(workers.handles).await {
                if let Err(e) = result {
                    warn!(error = %e, "cluster worker panicked");
                }
            }
        }

        let was_started = {
            let mut state = self.inner.state.write();
            std::mem::replace(&mut state.started, false)
        };
        if was_started {
            info!(node_id = %self.inner.node_id, "cluster membership stopped");
        }
    }

    /// Leave the cluster gracefully.
    ///
    /// A primary first hands the flag to the longest-standing other online
    /// node; with no such node the call fails and nothing changes. Then the
    /// workers stop and the node is marked offline.
    pub async fn leave(&self) -> Result<()> {
        if self.inner.mode == ClusterMode::Standalone {
            return Err(ClusterError::Standalone("leave"));
        }
        if !self.is_started() {
            return Err(ClusterError::NotStarted);
        }

        let previous = std::mem::replace(&mut self.inner.state.write().status, NodeStatus::Leaving);

        let handed_off = async {
            if self.inner.store.is_primary(&self.inner.node_id).await? {
                match self
                    .inner
                    .bounded("hand off", self.inner.store.hand_off(&self.inner.node_id))
                    .await?
                {
                    Some(successor) => {
                        info!(node_id = %self.inner.node_id, successor = %successor, "primary handed off");
                        Ok(())
                    }
                    None => Err(ClusterError::NoSuccessor),
                }
            } else {
                self.inner
                    .bounded(
                        "mark leaving",
                        self.inner.store.set_status(&self.inner.node_id, NodeStatus::Leaving),
                    )
                    .await
                    .map(|_| ())
            }
        };
        if let Err(e) = handed_off.await {
            self.inner.state.write().status = previous;
            return Err(e);
        }
        self.inner.state.write().primary = false;

        self.stop().await;

        self.inner
            .bounded(
                "mark offline",
                self.inner.store.set_status(&self.inner.node_id, NodeStatus::Offline),
            )
            .await?;
        self.inner.state.write().status = NodeStatus::Offline;

        info!(node_id = %self.inner.node_id, "node left the cluster");
        Ok(())
    }

    /// Run one heartbeat sweep now.
    pub async fn heartbeat(&self) -> Result<()> {
        self.require_cluster("heartbeat")?;
        self.inner.heartbeat().await
    }

    /// Run one election check now. Returns whether this node is primary.
    pub async fn run_election(&self) -> Result<bool> {
        self.require_cluster("election")?;
        self.inner.run_election().await
    }

    /// Every known node. Standalone nodes report only themselves.
    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        match self.inner.mode {
            ClusterMode::Standalone => Ok(vec![self.local_node()]),
            ClusterMode::Cluster => self.inner.store.list().await,
        }
    }

    /// One node by id. Standalone nodes know only themselves.
    pub async fn get_node(&self, node_id: &str) -> Result<Option<NodeInfo>> {
        match self.inner.mode {
            ClusterMode::Standalone => Ok((node_id == self.inner.node_id).then(|| self.local_node())),
            ClusterMode::Cluster => self.inner.store.get(node_id).await,
        }
    }

    /// Issue a single-use join token valid for the configured lifetime.
    pub async fn generate_join_token(&self) -> Result<JoinToken> {
        self.require_cluster("join token generation")?;
        self.inner.store.ensure_schema().await?;

        let secret = generate_token();
        let digest = hash_token(&secret);
        let now = unix_now();
        let ttl = i64::try_from(self.inner.config.token_ttl_secs).unwrap_or(i64::MAX / 2);
        let expires_at = now.saturating_add(ttl);

        self.inner
            .store
            .insert_token(&digest, &self.inner.node_id, now, expires_at)
            .await?;

        info!(
            node_id = %self.inner.node_id,
            token = %hash_prefix(&digest),
            expires_at = %from_unix(expires_at),
            "join token issued"
        );
        Ok(JoinToken::new(secret, from_unix(expires_at)))
    }

    /// Consume a join token on behalf of `consumer`.
    ///
    /// Fails when the token is unknown, expired, or already used.
    pub async fn consume_join_token(&self, token: &str, consumer: &str) -> Result<()> {
        self.require_cluster("join token consumption")?;
        let digest = hash_token(token);
        if self
            .inner
            .store
            .consume_token(&digest, consumer, unix_now())
            .await?
        {
            info!(token = %hash_prefix(&digest), consumer = %consumer, "join token consumed");
            Ok(())
        } else {
            warn!(token = %hash_prefix(&digest), consumer = %consumer, "join token rejected");
            Err(ClusterError::InvalidToken)
        }
    }

    /// Delete expired join tokens. Returns how many were removed.
    pub async fn purge_expired_tokens(&self) -> Result<u64> {
        self.require_cluster("join token purge")?;
        self.inner.store.purge_expired_tokens(unix_now()).await
    }

    fn require_cluster(&self, operation: &'static str) -> Result<()> {
        match self.inner.mode {
            ClusterMode::Standalone => Err(ClusterError::Standalone(operation)),
            ClusterMode::Cluster => Ok(()),
        }
    }

    fn local_node(&self) -> NodeInfo {
        let state = self.inner.state.read();
        let config = &self.inner.config;
        NodeInfo {
            node_id: self.inner.node_id.clone(),
            hostname: config.hostname.clone(),
            address: config.address.clone(),
            port: config.port,
            version: config.version.clone(),
            is_primary: state.primary,
            status: state.status,
            last_heartbeat: Utc::now(),
            joined_at: from_unix(state.joined_at),
            metadata: config.metadata.clone(),
        }
    }
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("node_id", &self.inner.node_id)
            .field("mode", &self.inner.mode)
            .field("state", &*self.inner.state.read())
            .finish()
    }
}

impl Inner {
    /// Run `fut` under the per-call deadline.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let deadline = self.config.operation_timeout();
        tokio::time::timeout(deadline, fut).await.map_err(|_| {
            ClusterError::Timeout(format!(
                "{} exceeded {}ms",
                operation,
                deadline.as_millis()
            ))
        })?
    }

    fn node_record(&self) -> NodeInfo {
        let now = Utc::now();
        NodeInfo {
            node_id: self.node_id.clone(),
            hostname: self.config.hostname.clone(),
            address: self.config.address.clone(),
            port: self.config.port,
            version: self.config.version.clone(),
            is_primary: false,
            status: NodeStatus::Online,
            last_heartbeat: now,
            joined_at: now,
            metadata: self.config.metadata.clone(),
        }
    }

    async fn register(&self) -> Result<bool> {
        let now = unix_now();
        let primary = self
            .bounded("register", self.store.register(&self.node_record(), now))
            .await?;
        self.state.write().joined_at = now;
        if primary {
            info!(node_id = %self.node_id, "registered and claimed primary");
        } else {
            info!(node_id = %self.node_id, "registered");
        }
        Ok(primary)
    }

    fn is_leaving(&self) -> bool {
        matches!(
            self.state.read().status,
            NodeStatus::Leaving | NodeStatus::Offline
        )
    }

    /// Refresh this node, reap stale peers, and reconcile the primary flag.
    async fn heartbeat(&self) -> Result<()> {
        if self.is_leaving() {
            return Ok(());
        }

        let now = unix_now();
        let alive = self
            .bounded("heartbeat", self.store.heartbeat(&self.node_id, now))
            .await?;
        if !alive && !self.rejoin().await? {
            return Ok(());
        }

        let stale = i64::try_from(self.config.stale_threshold().as_secs()).unwrap_or(i64::MAX / 2);
        let reaped = self
            .bounded("reap", self.store.reap(now.saturating_sub(stale), &self.node_id))
            .await?;
        if reaped > 0 {
            info!(reaped, "stale nodes marked offline");
        }

        let committed = self
            .bounded("primary check", self.store.is_primary(&self.node_id))
            .await?;
        self.reconcile(committed);
        Ok(())
    }

    /// Re-register after this node's row vanished. Returns false without
    /// writing when a leave started while the heartbeat was in flight.
    async fn rejoin(&self) -> Result<bool> {
        if self.is_leaving() {
            return Ok(false);
        }
        warn!(node_id = %self.node_id, "node record missing or reaped, re-registering");
        self.register().await?;
        Ok(true)
    }

    /// Claim the primary flag if no online node holds it.
    async fn run_election(&self) -> Result<bool> {
        if self.is_leaving() {
            return Ok(false);
        }

        match self.bounded("primary lookup", self.store.primary()).await? {
            Some(holder) => {
                self.reconcile(holder == self.node_id);
            }
            None => {
                let won = self
                    .bounded("claim primary", self.store.claim_primary(&self.node_id))
                    .await?;
                if won {
                    info!(node_id = %self.node_id, "elected primary");
                    self.reconcile(true);
                }
            }
        }
        Ok(self.state.read().primary)
    }

    fn reconcile(&self, committed: bool) {
        let previous = std::mem::replace(&mut self.state.write().primary, committed);
        if previous && !committed {
            warn!(node_id = %self.node_id, "lost primary");
        } else if !previous && committed {
            info!(node_id = %self.node_id, "now primary");
        }
    }
}

//! Fleet orchestrator: converges the local engine and every remote node
//! with the persisted desired state.
//!
//! Mutating operations against one node serialize on that node's operation
//! lock; operations against different nodes run concurrently, and user
//! fan-out is bounded by a semaphore. Per-node failures during fan-out are
//! logged and never abort the other targets.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use proxyfleet_core::engine::{
    CONTROL_API_TAG, ConfigError, ConfigResolver, EngineConfig, synthesize_account,
};
use proxyfleet_core::user::User;
use proxyfleet_proto::v1::{AccountRequest, Stat};

use crate::engine::{
    ApiError, EngineApi, EngineError, EngineProcess, StatScope, parse_stat, user_id_of_email,
};
use crate::node::{ConnectPolicy, NodeError};
use crate::storage::{Database, DatabaseError, LOCAL_NODE_ID, NewNode, NodeRecord, NodeStatus};

use super::registry::NodeRegistry;

/// Concurrent peer operations allowed during one fan-out.
const FANOUT_LIMIT: usize = 8;

const USER_STATS_PATTERN: &str = "user>>>";
const INBOUND_STATS_PATTERN: &str = "inbound>>>";

/// Errors from orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Desired effect of one account request on one inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountOp {
    Add,
    Remove,
}

async fn apply_account_ops(
    api: &EngineApi,
    ops: &[(AccountOp, AccountRequest)],
) -> Result<(), ApiError> {
    for (op, request) in ops {
        match op {
            AccountOp::Add => api.add_account(request.clone()).await?,
            AccountOp::Remove => api.remove_account(request.clone()).await?,
        }
    }
    Ok(())
}

/// Control-plane brain: owns the storage handle, the local engine
/// supervisor, and the registry of remote nodes.
pub struct Orchestrator {
    db: Database,
    resolver: ConfigResolver,
    base_config: EngineConfig,
    engine: Arc<EngineProcess>,
    local_api: EngineApi,
    registry: NodeRegistry,
    fanout: Arc<Semaphore>,
}

impl Orchestrator {
    /// `base_config` must already be parsed, resolved and have the control
    /// plane injected.
    pub fn new(
        db: Database,
        resolver: ConfigResolver,
        base_config: EngineConfig,
        engine: Arc<EngineProcess>,
    ) -> Result<Self, ManagerError> {
        let local_api = EngineApi::local(resolver.api_port())?;
        Ok(Self {
            db,
            resolver,
            base_config,
            engine,
            local_api,
            registry: NodeRegistry::new(),
            fanout: Arc::new(Semaphore::new(FANOUT_LIMIT)),
        })
    }

    /// Override the node connect policy. Only meaningful before any node
    /// has been registered.
    #[must_use]
    pub fn with_connect_policy(mut self, policy: ConnectPolicy) -> Self {
        self.registry = NodeRegistry::with_policy(policy);
        self
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    pub const fn engine(&self) -> &Arc<EngineProcess> {
        &self.engine
    }

    /// Serialized runtime config for the current entitled-user snapshot.
    pub async fn runtime_config(&self) -> Result<String, ManagerError> {
        let users = self.db.list_entitled_users().await?;
        Ok(self.resolver.build_runtime_config(&self.base_config, &users)?)
    }

    // =========================================================================
    // Local engine
    // =========================================================================

    pub async fn start_local_engine(&self) -> Result<(), ManagerError> {
        let config = self.runtime_config().await?;
        self.engine.start(&config).await?;
        Ok(())
    }

    pub async fn restart_local_engine(&self) -> Result<(), ManagerError> {
        let config = self.runtime_config().await?;
        self.engine.restart(&config).await?;
        Ok(())
    }

    /// Stop the local engine; already stopped is not an error.
    pub async fn stop_local_engine(&self) -> Result<(), ManagerError> {
        match self.engine.stop().await {
            Ok(()) | Err(EngineError::NotRunning) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Restart the local engine if its child process has died.
    pub async fn ensure_local_engine(&self) -> Result<(), ManagerError> {
        if self.engine.is_alive().await {
            return Ok(());
        }
        warn!("Local engine is not running, restarting");
        self.restart_local_engine().await
    }

    // =========================================================================
    // User convergence
    // =========================================================================

    /// Per-inbound account operations realizing `user`'s desired state: an
    /// add wherever the user is entitled and credentialed for the inbound's
    /// protocol, a remove everywhere else (so demotions and exclusions
    /// converge with the same call).
    pub fn account_ops(&self, user: &User) -> Vec<(AccountOp, AccountRequest)> {
        let email = user.email();
        let mut ops = Vec::new();
        for profile in self.base_config.profiles() {
            let request = AccountRequest {
                inbound_tag: profile.tag.clone(),
                protocol: profile.protocol.as_str().to_owned(),
                email: email.clone(),
                account_json: String::new(),
            };
            let wanted = user.status.is_entitled() && !user.is_excluded_from(&profile.tag);
            match (wanted, user.proxies.get(&profile.protocol)) {
                (true, Some(settings)) => {
                    match synthesize_account(profile.protocol, settings, &email) {
                        Ok(account) => ops.push((
                            AccountOp::Add,
                            AccountRequest {
                                account_json: account.to_string(),
                                ..request
                            },
                        )),
                        Err(e) => {
                            warn!(user = %user.username, tag = %profile.tag, error = %e,
                                "Incomplete credentials, removing account instead");
                            ops.push((AccountOp::Remove, request));
                        }
                    }
                }
                _ => ops.push((AccountOp::Remove, request)),
            }
        }
        ops
    }

    /// Unconditional removal on every inbound, for user deletion.
    pub fn removal_ops(&self, user: &User) -> Vec<(AccountOp, AccountRequest)> {
        let email = user.email();
        self.base_config
            .profiles()
            .iter()
            .map(|profile| {
                (
                    AccountOp::Remove,
                    AccountRequest {
                        inbound_tag: profile.tag.clone(),
                        protocol: profile.protocol.as_str().to_owned(),
                        email: email.clone(),
                        account_json: String::new(),
                    },
                )
            })
            .collect()
    }

    /// Propagate a newly created user to every engine.
    pub async fn add_user(&self, user: &User) {
        self.sync_user(user).await;
    }

    /// Propagate a user edit (credentials, status, exclusions) to every
    /// engine. Same convergence as [`Self::add_user`]: the desired state is
    /// applied wholesale, so both calls are idempotent.
    pub async fn update_user(&self, user: &User) {
        self.sync_user(user).await;
    }

    /// Converge every engine with `user`'s current state.
    pub async fn sync_user(&self, user: &User) {
        self.fan_out_account_ops(&user.username, self.account_ops(user))
            .await;
    }

    /// Remove `user`'s accounts from every engine.
    pub async fn remove_user(&self, user: &User) {
        self.fan_out_account_ops(&user.username, self.removal_ops(user))
            .await;
    }

    async fn fan_out_account_ops(&self, username: &str, ops: Vec<(AccountOp, AccountRequest)>) {
        if self.engine.is_started() {
            if let Err(e) = apply_account_ops(&self.local_api, &ops).await {
                warn!(user = %username, error = %e, "Local engine account sync failed");
            }
        }

        let mut tasks = JoinSet::new();
        for entry in self.registry.entries().await {
            let peer = Arc::clone(&entry.peer);
            let ops = ops.clone();
            let semaphore = Arc::clone(&self.fanout);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result: Result<(), NodeError> = async {
                    let api = peer.engine_api().await?;
                    apply_account_ops(&api, &ops)
                        .await
                        .map_err(|e| NodeError::Connection(e.to_string()))
                }
                .await;
                (peer.name().to_owned(), result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(user = %username, node = %name, "Account ops applied");
                }
                Ok((name, Err(NodeError::NotStarted))) => {
                    debug!(node = %name, "Skipping account sync, remote engine not started");
                }
                Ok((name, Err(e))) => {
                    warn!(user = %username, node = %name, error = %e, "Account sync failed");
                }
                Err(e) => warn!(error = %e, "Account sync task panicked"),
            }
        }
    }

    // =========================================================================
    // Node lifecycle
    // =========================================================================

    /// Register a new node and attempt the first connection. The persisted
    /// record always exists afterwards, with status reflecting the outcome.
    pub async fn register_node(&self, node: NewNode) -> Result<NodeRecord, ManagerError> {
        let record = self.db.create_node(node).await?;
        self.connect_node(record.id).await?;
        Ok(self.db.get_node(record.id).await?)
    }

    /// Connect to a node and start its engine with the current runtime
    /// config. Connection and startup failures are persisted as the node's
    /// `error` status rather than returned; only storage failures bubble up.
    pub async fn connect_node(&self, node_id: i64) -> Result<(), ManagerError> {
        let record = self.db.get_node(node_id).await?;
        if record.node_status() == NodeStatus::Disabled {
            debug!(node = %record.name, "Skipping connect, node disabled");
            return Ok(());
        }
        let entry = self.registry.get_or_create(&record).await;
        let _guard = entry.op_lock.lock().await;

        self.db
            .update_node_status(node_id, NodeStatus::Connecting, None, None)
            .await?;

        let outcome: Result<String, ManagerError> = async {
            entry.peer.connect().await?;
            let config = self.runtime_config().await?;
            Ok(entry.peer.start(&config).await?)
        }
        .await;

        match outcome {
            Ok(version) => {
                info!(node = %record.name, version = %version, "Node connected and engine started");
                self.db
                    .update_node_status(node_id, NodeStatus::Connected, None, Some(&version))
                    .await?;
            }
            Err(e) => {
                warn!(node = %record.name, error = %e, "Node connect failed");
                self.db
                    .update_node_status(node_id, NodeStatus::Error, Some(&e.to_string()), None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Restart a node's engine with a fresh runtime config, reconnecting
    /// first if the channel is gone or dead.
    pub async fn restart_node(&self, node_id: i64) -> Result<(), ManagerError> {
        let record = self.db.get_node(node_id).await?;
        if record.node_status() == NodeStatus::Disabled {
            debug!(node = %record.name, "Skipping restart, node disabled");
            return Ok(());
        }
        let entry = self.registry.get_or_create(&record).await;
        let _guard = entry.op_lock.lock().await;

        self.db
            .update_node_status(node_id, NodeStatus::Connecting, None, None)
            .await?;

        let outcome: Result<String, ManagerError> = async {
            if !entry.peer.has_channel().await || !entry.peer.is_alive().await {
                entry.peer.connect().await?;
            }
            let config = self.runtime_config().await?;
            Ok(entry.peer.restart(&config).await?)
        }
        .await;

        match outcome {
            Ok(version) => {
                info!(node = %record.name, version = %version, "Node engine restarted");
                self.db
                    .update_node_status(node_id, NodeStatus::Connected, None, Some(&version))
                    .await?;
            }
            Err(e) => {
                warn!(node = %record.name, error = %e, "Node restart failed");
                self.db
                    .update_node_status(node_id, NodeStatus::Error, Some(&e.to_string()), None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove a node: best-effort remote engine stop, disconnect, evict
    /// from the registry, delete the record. Idempotent.
    pub async fn remove_node(&self, node_id: i64) -> Result<(), ManagerError> {
        if let Some(entry) = self.registry.remove(node_id).await {
            let _guard = entry.op_lock.lock().await;
            if let Err(e) = entry.peer.stop().await {
                debug!(node_id, error = %e, "Remote engine stop on removal failed");
            }
            entry.peer.disconnect().await;
        }
        self.db.delete_node(node_id).await?;
        Ok(())
    }

    /// Mark a node disabled and drop its live connection. The record stays.
    pub async fn disable_node(&self, node_id: i64) -> Result<(), ManagerError> {
        if let Some(entry) = self.registry.remove(node_id).await {
            let _guard = entry.op_lock.lock().await;
            if let Err(e) = entry.peer.stop().await {
                debug!(node_id, error = %e, "Remote engine stop on disable failed");
            }
            entry.peer.disconnect().await;
        }
        self.db
            .update_node_status(node_id, NodeStatus::Disabled, None, None)
            .await?;
        Ok(())
    }

    pub async fn enable_node(&self, node_id: i64) -> Result<(), ManagerError> {
        self.db
            .update_node_status(node_id, NodeStatus::Connecting, None, None)
            .await?;
        self.connect_node(node_id).await
    }

    /// Connect every persisted non-disabled node (startup path). Nodes are
    /// connected concurrently so one slow or half-open peer cannot delay
    /// the rest of the fleet.
    pub async fn connect_all(self: Arc<Self>) -> Result<(), ManagerError> {
        let records = self.db.list_enabled_nodes().await?;
        let mut tasks = JoinSet::new();
        for record in records {
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&self.fanout);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if let Err(e) = this.connect_node(record.id).await {
                    warn!(node_id = record.id, error = %e, "Initial node connect failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// One reconciliation sweep: reconnect nodes with no live channel,
    /// restart nodes whose channel is dead or whose engine stopped. Each
    /// node is reconciled in its own task, bounded by the fan-out
    /// semaphore, so a single unresponsive peer stalls only itself.
    pub async fn reconcile_nodes(self: Arc<Self>) -> Result<(), ManagerError> {
        let records = self.db.list_enabled_nodes().await?;
        let mut tasks = JoinSet::new();
        for record in records {
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&self.fanout);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                this.reconcile_node(record).await;
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    async fn reconcile_node(&self, record: NodeRecord) {
        let entry = self.registry.get(record.id).await;
        let needs_connect = match &entry {
            None => true,
            Some(entry) => {
                !entry.peer.matches_record(&record) || !entry.peer.has_channel().await
            }
        };
        if needs_connect {
            if let Err(e) = self.connect_node(record.id).await {
                warn!(node_id = record.id, error = %e, "Reconcile connect failed");
            }
            return;
        }
        // The entry exists and matches here.
        let Some(entry) = entry else { return };
        if !entry.peer.is_alive().await || !entry.peer.is_started() {
            if let Err(e) = self.restart_node(record.id).await {
                warn!(node_id = record.id, error = %e, "Reconcile restart failed");
            }
        }
    }

    // =========================================================================
    // Usage accounting
    // =========================================================================

    /// Sweep per-user traffic counters from every engine. Queries use
    /// read-and-reset, so each delta is observed at most once; a failed
    /// commit loses at most one interval and is logged.
    pub async fn collect_user_usage(self: Arc<Self>) -> Result<(), ManagerError> {
        if self.engine.is_started() {
            match self.local_api.query_stats(USER_STATS_PATTERN, true).await {
                Ok(stats) => self.record_user_stats(LOCAL_NODE_ID, &stats).await,
                Err(e) => debug!(error = %e, "Local user stats unavailable"),
            }
        }
        let mut failed = Vec::new();
        for (id, name, result) in self.query_peers(USER_STATS_PATTERN).await {
            match result {
                Ok(stats) => self.record_user_stats(id, &stats).await,
                Err(NodeError::NotStarted) => {
                    debug!(node = %name, "Skipping stats, remote engine not started");
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "User stats query failed");
                    failed.push(id);
                }
            }
        }
        self.restart_failed(failed).await;
        Ok(())
    }

    /// Sweep inbound-level traffic counters from every engine into node and
    /// system totals. The control-plane inbound is excluded.
    pub async fn collect_node_usage(self: Arc<Self>) -> Result<(), ManagerError> {
        if self.engine.is_started() {
            match self.local_api.query_stats(INBOUND_STATS_PATTERN, true).await {
                Ok(stats) => self.record_node_stats(LOCAL_NODE_ID, &stats).await,
                Err(e) => debug!(error = %e, "Local inbound stats unavailable"),
            }
        }
        let mut failed = Vec::new();
        for (id, name, result) in self.query_peers(INBOUND_STATS_PATTERN).await {
            match result {
                Ok(stats) => self.record_node_stats(id, &stats).await,
                Err(NodeError::NotStarted) => {
                    debug!(node = %name, "Skipping stats, remote engine not started");
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "Inbound stats query failed");
                    failed.push(id);
                }
            }
        }
        self.restart_failed(failed).await;
        Ok(())
    }

    async fn query_peers(
        &self,
        pattern: &'static str,
    ) -> Vec<(i64, String, Result<Vec<Stat>, NodeError>)> {
        let mut tasks = JoinSet::new();
        for entry in self.registry.entries().await {
            let peer = Arc::clone(&entry.peer);
            let semaphore = Arc::clone(&self.fanout);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result: Result<Vec<Stat>, NodeError> = async {
                    let api = peer.engine_api().await?;
                    api.query_stats(pattern, true)
                        .await
                        .map_err(|e| NodeError::Connection(e.to_string()))
                }
                .await;
                (peer.id(), peer.name().to_owned(), result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "Stats task panicked"),
            }
        }
        results
    }

    async fn record_user_stats(&self, node_id: i64, stats: &[Stat]) {
        for stat in stats {
            let Some(parsed) = parse_stat(&stat.name, stat.value) else {
                continue;
            };
            let StatScope::User(email) = parsed.scope else {
                continue;
            };
            let Some(user_id) = user_id_of_email(&email) else {
                debug!(%email, "Stat email without a user id, skipping");
                continue;
            };
            if parsed.value == 0 {
                continue;
            }
            if let Err(e) = self.db.add_user_usage(user_id, node_id, parsed.value).await {
                warn!(user_id, node_id, error = %e, "Dropped one usage interval");
            }
        }
    }

    async fn record_node_stats(&self, node_id: i64, stats: &[Stat]) {
        let mut uplink = 0_i64;
        let mut downlink = 0_i64;
        for stat in stats {
            let Some(parsed) = parse_stat(&stat.name, stat.value) else {
                continue;
            };
            let StatScope::Inbound(tag) = parsed.scope else {
                continue;
            };
            if tag == CONTROL_API_TAG {
                continue;
            }
            if parsed.uplink {
                uplink += parsed.value;
            } else {
                downlink += parsed.value;
            }
        }
        if uplink == 0 && downlink == 0 {
            return;
        }
        if let Err(e) = self.db.add_node_usage(node_id, uplink, downlink).await {
            warn!(node_id, error = %e, "Dropped one usage interval");
        }
    }

    async fn restart_failed(self: Arc<Self>, failed: Vec<i64>) {
        let mut tasks = JoinSet::new();
        for node_id in failed {
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&self.fanout);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if let Err(e) = this.restart_node(node_id).await {
                    warn!(node_id, error = %e, "Restart after stats failure failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}

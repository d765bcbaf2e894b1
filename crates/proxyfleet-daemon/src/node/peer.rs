//! In-memory handle to one remote node's control channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_stream::StreamExt;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info, warn};

use proxyfleet_proto::v1::node_control_service_client::NodeControlServiceClient;
use proxyfleet_proto::v1::{Empty, EngineConfigRequest, EngineStateKind};

use crate::engine::EngineApi;
use crate::storage::NodeRecord;

use super::{ConnectPolicy, NodeError, with_retries};

const DEFAULT_CONTROL_PORT: u16 = 62050;
const DEFAULT_API_PORT: u16 = 62051;

/// Deadline for engine start/restart, which waits on the remote engine's
/// own readiness check.
const ENGINE_OP_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for quick control RPCs (stop, version fetch).
const CONTROL_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote engine instance, mirrored over an authenticated RPC channel.
///
/// Connection fields are copied from the persisted record at construction;
/// the handle is owned by the registry and carries its own interior
/// synchronization. `started` tracks the remote engine's acknowledged
/// state and is also flipped by asynchronous state notifications.
pub struct PeerNode {
    id: i64,
    name: String,
    address: String,
    port: u16,
    api_port: u16,
    certificate: String,
    policy: ConnectPolicy,
    channel: RwLock<Option<Channel>>,
    started: Arc<AtomicBool>,
    /// Stats/account client against the node's api port, built lazily on
    /// first use and reused afterwards.
    engine_api: Mutex<Option<EngineApi>>,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PeerNode {
    pub fn from_record(record: &NodeRecord, policy: ConnectPolicy) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            address: record.address.clone(),
            port: u16::try_from(record.port).unwrap_or(DEFAULT_CONTROL_PORT),
            api_port: u16::try_from(record.api_port).unwrap_or(DEFAULT_API_PORT),
            certificate: record.certificate.clone(),
            policy,
            channel: RwLock::new(None),
            started: Arc::new(AtomicBool::new(false)),
            engine_api: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    pub const fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether a connection handle exists (it may still be dead; see
    /// [`Self::is_alive`]).
    pub async fn has_channel(&self) -> bool {
        self.channel.read().await.is_some()
    }

    /// Whether the stored connection parameters still match the record
    /// (an admin may have edited address/ports/certificate).
    pub fn matches_record(&self, record: &NodeRecord) -> bool {
        self.address == record.address
            && i64::from(self.port) == record.port
            && i64::from(self.api_port) == record.api_port
            && self.certificate == record.certificate
    }

    fn endpoint(&self, port: u16) -> Result<Endpoint, NodeError> {
        let scheme = if self.certificate.is_empty() {
            "http"
        } else {
            "https"
        };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}:{port}", self.address))
            .map_err(|e| NodeError::Connection(e.to_string()))?
            .connect_timeout(Duration::from_secs(5))
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10));

        if !self.certificate.is_empty() {
            let tls = ClientTlsConfig::new()
                .with_enabled_roots()
                .ca_certificate(Certificate::from_pem(self.certificate.clone()))
                .domain_name(self.address.clone());
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| NodeError::Connection(e.to_string()))?;
        }
        Ok(endpoint)
    }

    /// Establish the control channel: up to 3 immediate attempts, then a
    /// liveness ping to classify the apparently-open connection as
    /// actually alive. Also (re)starts the state-notification watcher.
    pub async fn connect(self: &Arc<Self>) -> Result<(), NodeError> {
        let endpoint = self.endpoint(self.port)?;
        let name = self.name.clone();

        // Bound every attempt: `connect_timeout` only covers the transport
        // dial, not a peer that accepts TCP and then never completes the
        // protocol handshake.
        let attempt_timeout = self.policy.attempt_timeout;
        let channel = with_retries(self.policy, |attempt| {
            let endpoint = endpoint.clone();
            let name = name.clone();
            async move {
                debug!(node = %name, attempt, "Connecting to node");
                match tokio::time::timeout(attempt_timeout, endpoint.connect()).await {
                    Ok(Ok(channel)) => Ok(channel),
                    Ok(Err(e)) => Err(NodeError::Connection(format!(
                        "{e}: {}",
                        error_chain(&e)
                    ))),
                    Err(_) => Err(NodeError::Connection(format!(
                        "handshake timed out after {attempt_timeout:?}"
                    ))),
                }
            }
        })
        .await?;

        let mut client = NodeControlServiceClient::new(channel.clone());
        let mut request = tonic::Request::new(Empty {});
        request.set_timeout(attempt_timeout);
        client
            .ping(request)
            .await
            .map_err(|e| NodeError::Connection(format!("ping failed: {e}")))?;

        *self.channel.write().await = Some(channel.clone());
        self.spawn_state_watcher(channel).await;
        info!(node = %self.name, "Node connected");
        Ok(())
    }

    /// Probe the existing channel with a short-deadline ping.
    pub async fn is_alive(&self) -> bool {
        let Some(channel) = self.channel.read().await.clone() else {
            return false;
        };
        let mut client = NodeControlServiceClient::new(channel);
        let mut request = tonic::Request::new(Empty {});
        request.set_timeout(Duration::from_secs(2));
        client.ping(request).await.is_ok()
    }

    async fn control(&self) -> Result<NodeControlServiceClient<Channel>, NodeError> {
        self.channel
            .read()
            .await
            .clone()
            .map(NodeControlServiceClient::new)
            .ok_or_else(|| NodeError::Connection("not connected".into()))
    }

    /// Start the remote engine with the given runtime config. Returns the
    /// reported engine version.
    pub async fn start(&self, config_json: &str) -> Result<String, NodeError> {
        let mut client = self.control().await?;
        let mut request = tonic::Request::new(EngineConfigRequest {
            config_json: config_json.to_owned(),
        });
        request.set_timeout(ENGINE_OP_TIMEOUT);
        let response = client.start_engine(request).await?.into_inner();
        self.started.store(response.started, Ordering::SeqCst);
        Ok(response.engine_version)
    }

    /// Restart the remote engine with a fresh runtime config.
    pub async fn restart(&self, config_json: &str) -> Result<String, NodeError> {
        let mut client = self.control().await?;
        let mut request = tonic::Request::new(EngineConfigRequest {
            config_json: config_json.to_owned(),
        });
        request.set_timeout(ENGINE_OP_TIMEOUT);
        let response = client.restart_engine(request).await?.into_inner();
        self.started.store(response.started, Ordering::SeqCst);
        Ok(response.engine_version)
    }

    /// Stop the remote engine.
    pub async fn stop(&self) -> Result<(), NodeError> {
        let mut client = self.control().await?;
        let mut request = tonic::Request::new(Empty {});
        request.set_timeout(CONTROL_RPC_TIMEOUT);
        client.stop_engine(request).await?;
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn fetch_version(&self) -> Result<String, NodeError> {
        let mut client = self.control().await?;
        let mut request = tonic::Request::new(Empty {});
        request.set_timeout(CONTROL_RPC_TIMEOUT);
        Ok(client.fetch_version(request).await?.into_inner().engine_version)
    }

    /// Stats/account client bound to the node's api port. Requires a
    /// connected node whose engine has confirmed it is running.
    pub async fn engine_api(&self) -> Result<EngineApi, NodeError> {
        if self.channel.read().await.is_none() {
            return Err(NodeError::Connection("not connected".into()));
        }
        if !self.is_started() {
            return Err(NodeError::NotStarted);
        }

        let mut slot = self.engine_api.lock().await;
        if let Some(api) = slot.as_ref() {
            return Ok(api.clone());
        }
        let endpoint = self.endpoint(self.api_port)?;
        let api = EngineApi::from_channel(endpoint.connect_lazy());
        *slot = Some(api.clone());
        Ok(api)
    }

    /// Drop the connection and stop watching state notifications.
    /// Best-effort and idempotent.
    pub async fn disconnect(&self) {
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.abort();
        }
        *self.channel.write().await = None;
        *self.engine_api.lock().await = None;
        self.started.store(false, Ordering::SeqCst);
        debug!(node = %self.name, "Node disconnected");
    }

    /// Watch the node's start/stop notification stream so status
    /// observation stays decoupled from command issuance.
    async fn spawn_state_watcher(&self, channel: Channel) {
        let started = Arc::clone(&self.started);
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut client = NodeControlServiceClient::new(channel);
            let mut stream = match client.subscribe_state(Empty {}).await {
                Ok(response) => response.into_inner(),
                Err(e) => {
                    debug!(node = %name, error = %e, "State subscription unavailable");
                    return;
                }
            };
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) if event.kind == EngineStateKind::Started as i32 => {
                        info!(node = %name, "Remote engine reported started");
                        started.store(true, Ordering::SeqCst);
                    }
                    Ok(event) if event.kind == EngineStateKind::Stopped as i32 => {
                        warn!(node = %name, "Remote engine reported stopped");
                        started.store(false, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(node = %name, error = %e, "State stream ended");
                        return;
                    }
                }
            }
        });

        if let Some(previous) = self.watcher.lock().await.replace(handle) {
            previous.abort();
        }
    }
}

/// Walk the `source()` chain of an error and join into a single string.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    if chain.is_empty() {
        String::from("(no further details)")
    } else {
        chain.join(" -> ")
    }
}

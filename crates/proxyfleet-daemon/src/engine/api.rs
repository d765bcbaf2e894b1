//! Client for the engine's loopback control API.
//!
//! Account add/remove calls treat "already exists" and "not found" replies
//! as convergence rather than failure; stats queries use read-and-reset
//! semantics so a counted delta is never observed twice.

use std::time::Duration;

use tonic::Code;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use proxyfleet_proto::v1::engine_control_service_client::EngineControlServiceClient;
use proxyfleet_proto::v1::{AccountRequest, Stat, StatsRequest};

/// Errors from engine control API calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("control API unreachable: {0}")]
    Connection(String),

    #[error("control API call failed: {0}")]
    Status(#[from] tonic::Status),
}

/// Client handle bound to one engine control endpoint.
///
/// The underlying channel is lazy: construction never touches the network,
/// and tonic reconnects transparently after engine restarts.
#[derive(Clone)]
pub struct EngineApi {
    client: EngineControlServiceClient<Channel>,
    rpc_timeout: Duration,
}

impl EngineApi {
    /// Client for the local engine's loopback control port.
    pub fn local(port: u16) -> Result<Self, ApiError> {
        Self::for_endpoint(&format!("http://127.0.0.1:{port}"))
    }

    /// Client for an arbitrary control endpoint (used for remote stats
    /// endpoints, which expose the same query shape).
    pub fn for_endpoint(url: &str) -> Result<Self, ApiError> {
        let endpoint = Endpoint::from_shared(url.to_owned())
            .map_err(|e| ApiError::Connection(e.to_string()))?
            .connect_timeout(Duration::from_secs(3));
        Ok(Self::from_channel(endpoint.connect_lazy()))
    }

    /// Wrap an already-established channel (remote peers reuse their
    /// control channel here).
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: EngineControlServiceClient::new(channel),
            rpc_timeout: Duration::from_secs(5),
        }
    }

    /// Add an account to an inbound. `AlreadyExists` means the engine has
    /// converged already and is suppressed.
    pub async fn add_account(&self, request: AccountRequest) -> Result<(), ApiError> {
        let mut client = self.client.clone();
        let mut request = tonic::Request::new(request);
        request.set_timeout(self.rpc_timeout);
        match client.add_account(request).await {
            Ok(_) => Ok(()),
            Err(status) if is_converged(status.code()) => {
                debug!(code = ?status.code(), "add_account already converged");
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    /// Remove an account from an inbound. `NotFound` means the engine has
    /// converged already and is suppressed.
    pub async fn remove_account(&self, request: AccountRequest) -> Result<(), ApiError> {
        let mut client = self.client.clone();
        let mut request = tonic::Request::new(request);
        request.set_timeout(self.rpc_timeout);
        match client.remove_account(request).await {
            Ok(_) => Ok(()),
            Err(status) if is_converged(status.code()) => {
                debug!(code = ?status.code(), "remove_account already converged");
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    /// Query traffic counters matching `pattern`, atomically resetting the
    /// matched counters when `reset` is set. Carries a short timeout so a
    /// stuck engine cannot stall an accounting sweep.
    pub async fn query_stats(&self, pattern: &str, reset: bool) -> Result<Vec<Stat>, ApiError> {
        let mut client = self.client.clone();
        let mut request = tonic::Request::new(StatsRequest {
            pattern: pattern.to_owned(),
            reset,
        });
        request.set_timeout(self.rpc_timeout);
        let response = client.query_stats(request).await?;
        Ok(response.into_inner().stats)
    }
}

/// Control-plane responses that signal the engine already matches the
/// desired state: duplicate adds, missing removals, or an engine build
/// without the handler wired up at all.
const fn is_converged(code: Code) -> bool {
    matches!(code, Code::AlreadyExists | Code::NotFound | Code::Unimplemented)
}

/// What a traffic counter is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatScope {
    /// Per-user counter; carries the account email (`{id}.{username}`).
    User(String),
    Inbound(String),
    Outbound(String),
}

/// One parsed traffic counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficStat {
    pub scope: StatScope,
    /// `true` for uplink, `false` for downlink.
    pub uplink: bool,
    pub value: i64,
}

/// Parse an engine stat name of the form
/// `scope>>>name>>>traffic>>>direction`. Non-traffic or malformed names
/// yield `None` and are skipped by accounting.
pub fn parse_stat(name: &str, value: i64) -> Option<TrafficStat> {
    let mut parts = name.split(">>>");
    let scope_kind = parts.next()?;
    let scope_name = parts.next()?;
    if parts.next()? != "traffic" {
        return None;
    }
    let uplink = match parts.next()? {
        "uplink" => true,
        "downlink" => false,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }

    let scope = match scope_kind {
        "user" => StatScope::User(scope_name.to_owned()),
        "inbound" => StatScope::Inbound(scope_name.to_owned()),
        "outbound" => StatScope::Outbound(scope_name.to_owned()),
        _ => return None,
    };
    Some(TrafficStat {
        scope,
        uplink,
        value,
    })
}

/// Extract the numeric user id from a stat email (`{id}.{username}`).
pub fn user_id_of_email(email: &str) -> Option<i64> {
    email.split('.').next()?.parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_traffic_stats() {
        let stat = parse_stat("user>>>7.alice>>>traffic>>>uplink", 1024).unwrap();
        assert_eq!(stat.scope, StatScope::User("7.alice".into()));
        assert!(stat.uplink);
        assert_eq!(stat.value, 1024);

        let stat = parse_stat("inbound>>>VMESS_TCP>>>traffic>>>downlink", 5).unwrap();
        assert_eq!(stat.scope, StatScope::Inbound("VMESS_TCP".into()));
        assert!(!stat.uplink);
    }

    #[test]
    fn rejects_malformed_stat_names() {
        assert!(parse_stat("user>>>7.alice>>>traffic", 1).is_none());
        assert!(parse_stat("user>>>7.alice>>>memory>>>uplink", 1).is_none());
        assert!(parse_stat("user>>>7.alice>>>traffic>>>sideways", 1).is_none());
        assert!(parse_stat("session>>>x>>>traffic>>>uplink", 1).is_none());
        assert!(parse_stat("user>>>a>>>traffic>>>uplink>>>extra", 1).is_none());
    }

    #[test]
    fn email_user_id() {
        assert_eq!(user_id_of_email("42.alice"), Some(42));
        assert_eq!(user_id_of_email("alice"), None);
    }

    #[test]
    fn convergence_codes() {
        assert!(is_converged(Code::AlreadyExists));
        assert!(is_converged(Code::NotFound));
        assert!(is_converged(Code::Unimplemented));
        assert!(!is_converged(Code::Unavailable));
        assert!(!is_converged(Code::Internal));
    }
}

//! Database models for the proxyfleet daemon.

use serde::{Deserialize, Serialize};

use proxyfleet_core::user::{User, UserStatus};

/// Persisted peer-node record. The durable source of truth for a node's
/// status; always written last in any orchestration path.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeRecord {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub port: i64,
    pub api_port: i64,
    /// PEM-encoded trust certificate for the node's control channel.
    /// Empty means a plaintext channel (tests, trusted networks).
    pub certificate: String,
    pub status: String,
    pub message: Option<String>,
    pub engine_version: Option<String>,
    pub uplink: i64,
    pub downlink: i64,
    pub last_status_change: i64,
}

impl NodeRecord {
    pub fn node_status(&self) -> NodeStatus {
        NodeStatus::parse(&self.status).unwrap_or(NodeStatus::Error)
    }
}

/// Node connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Connecting,
    Connected,
    Error,
    Disabled,
}

impl NodeStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connecting" => Some(Self::Connecting),
            "connected" => Some(Self::Connected),
            "error" => Some(Self::Error),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw user row; `proxies` and `excluded_inbounds` are stored as JSON.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub status: String,
    pub proxies: String,
    pub excluded_inbounds: String,
    pub used_traffic: i64,
    pub online_at: Option<i64>,
}

impl UserRow {
    /// Decode into the core user snapshot shape.
    pub fn into_user(self) -> Result<User, serde_json::Error> {
        Ok(User {
            id: self.id,
            username: self.username,
            status: UserStatus::parse(&self.status).unwrap_or(UserStatus::Disabled),
            proxies: serde_json::from_str(&self.proxies)?,
            excluded_inbounds: serde_json::from_str(&self.excluded_inbounds)?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn node_status_roundtrip() {
        for s in [
            NodeStatus::Connecting,
            NodeStatus::Connected,
            NodeStatus::Error,
            NodeStatus::Disabled,
        ] {
            assert_eq!(NodeStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(NodeStatus::parse("bogus"), None);
    }

    #[test]
    fn user_row_decodes_json_columns() {
        let row = UserRow {
            id: 3,
            username: "carol".into(),
            status: "active".into(),
            proxies: r#"{"vmess": {"id": "u"}}"#.into(),
            excluded_inbounds: r#"["WS"]"#.into(),
            used_traffic: 0,
            online_at: None,
        };
        let user = row.into_user().unwrap();
        assert_eq!(user.email(), "3.carol");
        assert!(user.is_excluded_from("WS"));
    }
}

//! User and per-protocol credential model.
//!
//! The Users table is the source of truth for the fleet's active account
//! set; this module carries the snapshot shape the control plane merges
//! into runtime configs and propagates to engines.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Proxy protocols an inbound (and a user credential) can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
}

impl Protocol {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
            Self::Shadowsocks => "shadowsocks",
        }
    }

    /// Parse an inbound's `protocol` field. Unknown protocols (e.g. the
    /// control API's loopback inbound) return `None` and are skipped when
    /// resolving user-facing inbounds.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vmess" => Some(Self::Vmess),
            "vless" => Some(Self::Vless),
            "trojan" => Some(Self::Trojan),
            "shadowsocks" => Some(Self::Shadowsocks),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    OnHold,
    Disabled,
    Limited,
    Expired,
}

impl UserStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::OnHold => "on_hold",
            Self::Disabled => "disabled",
            Self::Limited => "limited",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "on_hold" => Some(Self::OnHold),
            "disabled" => Some(Self::Disabled),
            "limited" => Some(Self::Limited),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Whether a user with this status belongs in engine configs.
    pub const fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::OnHold)
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Protocol-specific credential material for one user.
///
/// Which fields are populated depends on the protocol: `id` (a UUID) for
/// vmess/vless, `password` for trojan/shadowsocks, `flow` optionally for
/// vless, `method` (cipher) optionally for shadowsocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// A user snapshot as consumed by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub status: UserStatus,
    /// Credentials keyed by protocol. A user is entitled to every resolved
    /// inbound of each protocol they hold credentials for, minus exclusions.
    #[serde(default)]
    pub proxies: BTreeMap<Protocol, ProxySettings>,
    /// Inbound tags this user is explicitly excluded from.
    #[serde(default)]
    pub excluded_inbounds: BTreeSet<String>,
}

impl User {
    /// The engine-side account identity: `{id}.{username}`.
    ///
    /// Stat names and inbound client lists key on this, so it must be
    /// stable across restarts and unique across users.
    pub fn email(&self) -> String {
        format!("{}.{}", self.id, self.username)
    }

    /// Whether this user should be excluded from the given inbound tag.
    pub fn is_excluded_from(&self, tag: &str) -> bool {
        self.excluded_inbounds.contains(tag)
    }
}

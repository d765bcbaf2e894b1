//! Engine config parsing, validation and inbound resolution.

use std::collections::BTreeSet;

use serde_json::{Map, Value, json};

use crate::user::Protocol;

/// Reserved tag for the injected control-plane inbound. Its presence marks
/// a config that already carries the control API sections.
pub const CONTROL_API_TAG: &str = "control-api";

/// Errors from parsing or resolving an engine config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed engine config: {0}")]
    Malformed(String),

    #[error("missing `{0}` section")]
    MissingSection(&'static str),

    #[error("{section} entry at index {index} has no tag")]
    MissingTag { section: &'static str, index: usize },

    #[error("duplicate {section} tag `{tag}`")]
    DuplicateTag { section: &'static str, tag: String },

    #[error("inbound `{tag}`: `{field}` must be {expected}")]
    FieldShape {
        tag: String,
        field: &'static str,
        expected: &'static str,
    },

    #[error("inbound `{tag}` has no port and no fallback inbound is configured")]
    UnresolvedPort { tag: String },

    #[error("fallback inbound `{0}` not found")]
    MissingFallback(String),

    #[error("user `{email}` has no {field} configured for {protocol}")]
    MissingCredential {
        email: String,
        protocol: Protocol,
        field: &'static str,
    },
}

/// TLS mode of an inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Off,
    Tls,
    Reality,
}

impl TlsMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "none",
            Self::Tls => "tls",
            Self::Reality => "reality",
        }
    }
}

/// Resolved connection metadata for one user-facing inbound.
#[derive(Debug, Clone)]
pub struct InboundProfile {
    pub tag: String,
    pub protocol: Protocol,
    pub port: u16,
    pub network: String,
    pub tls: TlsMode,
    pub sni: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
}

/// A parsed engine configuration document.
///
/// The raw JSON document is kept verbatim (the engine's own schema is not
/// re-validated here); `inbounds` holds the resolved metadata for every
/// inbound speaking a user protocol. Read-only between regenerations of
/// the runtime config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(super) doc: Map<String, Value>,
    inbounds: Vec<InboundProfile>,
}

impl EngineConfig {
    /// Resolved profiles, in config order.
    pub fn profiles(&self) -> &[InboundProfile] {
        &self.inbounds
    }

    /// Resolved profiles for one protocol, in config order.
    pub fn profiles_for(&self, protocol: Protocol) -> impl Iterator<Item = &InboundProfile> {
        self.inbounds.iter().filter(move |p| p.protocol == protocol)
    }

    pub fn profile(&self, tag: &str) -> Option<&InboundProfile> {
        self.inbounds.iter().find(|p| p.tag == tag)
    }

    /// Serialize the (non-merged) document.
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        serde_json::to_string(&Value::Object(self.doc.clone()))
            .map_err(|e| ConfigError::Malformed(e.to_string()))
    }
}

/// Parses, resolves and merges engine configs.
///
/// `api_port` is the loopback port the injected control inbound listens on;
/// `fallback_tag` optionally designates the inbound that lends its port
/// (and TLS parameters) to inbounds configured without one.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    api_port: u16,
    fallback_tag: Option<String>,
}

impl ConfigResolver {
    pub const fn new(api_port: u16, fallback_tag: Option<String>) -> Self {
        Self {
            api_port,
            fallback_tag,
        }
    }

    pub const fn api_port(&self) -> u16 {
        self.api_port
    }

    /// Parse and validate a raw config document.
    ///
    /// Fails if `inbounds` or `outbounds` is absent, or any entry in either
    /// section has a missing or duplicated tag.
    pub fn parse(&self, raw: &str) -> Result<EngineConfig, ConfigError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        let Value::Object(doc) = value else {
            return Err(ConfigError::Malformed(
                "top-level value must be an object".into(),
            ));
        };

        for section in ["inbounds", "outbounds"] {
            let entries = doc
                .get(section)
                .and_then(Value::as_array)
                .ok_or(ConfigError::MissingSection(section))?;
            let mut seen = BTreeSet::new();
            for (index, entry) in entries.iter().enumerate() {
                let tag = entry
                    .as_object()
                    .and_then(|o| o.get("tag"))
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .ok_or(ConfigError::MissingTag { section, index })?;
                if !seen.insert(tag.to_owned()) {
                    return Err(ConfigError::DuplicateTag {
                        section,
                        tag: tag.to_owned(),
                    });
                }
            }
        }

        Ok(EngineConfig {
            doc,
            inbounds: Vec::new(),
        })
    }

    /// Resolve per-inbound connection metadata.
    ///
    /// Inbounds with a protocol outside the user protocols (e.g. the
    /// injected control inbound) are skipped. Fails on transport fields
    /// whose scalar-vs-list shape does not match the network's convention,
    /// and on inbounds whose port cannot be resolved directly or through
    /// the fallback inbound.
    pub fn resolve(&self, config: &mut EngineConfig) -> Result<(), ConfigError> {
        let inbounds = config
            .doc
            .get("inbounds")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let fallback = match &self.fallback_tag {
            Some(tag) => Some(
                inbounds
                    .iter()
                    .filter_map(Value::as_object)
                    .find(|o| o.get("tag").and_then(Value::as_str) == Some(tag.as_str()))
                    .ok_or_else(|| ConfigError::MissingFallback(tag.clone()))?,
            ),
            None => None,
        };

        let mut profiles = Vec::new();
        for inbound in &inbounds {
            let Some(obj) = inbound.as_object() else {
                continue;
            };
            let tag = obj
                .get("tag")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let Some(protocol) = obj
                .get("protocol")
                .and_then(Value::as_str)
                .and_then(Protocol::parse)
            else {
                continue;
            };

            let stream = obj.get("streamSettings").and_then(Value::as_object);
            let network = stream
                .and_then(|s| s.get("network"))
                .and_then(Value::as_str)
                .unwrap_or("tcp")
                .to_owned();

            let mut tls = security_of(stream);
            let mut sni = sni_of(&tag, stream, tls)?;
            let (host, path) = transport_fields(&tag, &network, stream)?;

            let port = match port_of(&tag, obj)? {
                Some(port) => port,
                None => {
                    let fallback =
                        fallback.ok_or_else(|| ConfigError::UnresolvedPort { tag: tag.clone() })?;
                    let fb_tag = fallback
                        .get("tag")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let port = port_of(fb_tag, fallback)?
                        .ok_or_else(|| ConfigError::UnresolvedPort { tag: fb_tag.into() })?;
                    // Borrow the fallback's TLS parameters when the inbound
                    // itself declares none.
                    if tls == TlsMode::Off {
                        let fb_stream = fallback.get("streamSettings").and_then(Value::as_object);
                        tls = security_of(fb_stream);
                        if sni.is_none() {
                            sni = sni_of(fb_tag, fb_stream, tls)?;
                        }
                    }
                    port
                }
            };

            profiles.push(InboundProfile {
                tag,
                protocol,
                port,
                network,
                tls,
                sni,
                host,
                path,
            });
        }

        config.inbounds = profiles;
        Ok(())
    }

    /// Idempotently add the control-plane sections to a config: a loopback
    /// control inbound (reserved tag), the api/stats/policy sections, and a
    /// routing rule steering the control inbound to the api handler.
    pub fn inject_control_plane(&self, config: &mut EngineConfig) {
        let already = config
            .doc
            .get("inbounds")
            .and_then(Value::as_array)
            .is_some_and(|arr| {
                arr.iter().any(|i| {
                    i.get("tag").and_then(Value::as_str) == Some(CONTROL_API_TAG)
                })
            });
        if already {
            return;
        }

        if let Some(arr) = config.doc.get_mut("inbounds").and_then(Value::as_array_mut) {
            arr.push(json!({
                "tag": CONTROL_API_TAG,
                "listen": "127.0.0.1",
                "port": self.api_port,
                "protocol": "dokodemo-door",
                "settings": { "address": "127.0.0.1" }
            }));
        }

        config.doc.insert(
            "api".into(),
            json!({ "tag": "api", "services": ["HandlerService", "StatsService"] }),
        );
        config.doc.insert("stats".into(), json!({}));
        config.doc.insert(
            "policy".into(),
            json!({
                "levels": { "0": { "statsUserUplink": true, "statsUserDownlink": true } },
                "system": {
                    "statsInboundUplink": true,
                    "statsInboundDownlink": true,
                    "statsOutboundUplink": true,
                    "statsOutboundDownlink": true
                }
            }),
        );

        let routing = config
            .doc
            .entry("routing")
            .or_insert_with(|| json!({ "rules": [] }));
        if let Some(routing) = routing.as_object_mut() {
            let rules = routing.entry("rules").or_insert_with(|| json!([]));
            if let Some(rules) = rules.as_array_mut() {
                rules.insert(
                    0,
                    json!({
                        "type": "field",
                        "inboundTag": [CONTROL_API_TAG],
                        "outboundTag": "api"
                    }),
                );
            }
        }
    }
}

fn security_of(stream: Option<&Map<String, Value>>) -> TlsMode {
    match stream
        .and_then(|s| s.get("security"))
        .and_then(Value::as_str)
    {
        Some("tls") => TlsMode::Tls,
        Some("reality") => TlsMode::Reality,
        _ => TlsMode::Off,
    }
}

fn sni_of(
    tag: &str,
    stream: Option<&Map<String, Value>>,
    tls: TlsMode,
) -> Result<Option<String>, ConfigError> {
    match tls {
        TlsMode::Off => Ok(None),
        TlsMode::Tls => {
            let settings = stream.and_then(|s| s.get("tlsSettings"));
            scalar_field(tag, settings, "serverName")
        }
        TlsMode::Reality => {
            // Reality advertises a list of server names; the first is used.
            let names = stream
                .and_then(|s| s.get("realitySettings"))
                .and_then(|r| r.get("serverNames"));
            first_of_list(tag, names, "serverNames")
        }
    }
}

/// Extract (host, path) according to the network's scalar-vs-list
/// convention: scalar for ws/grpc, list (first element) for tcp with an
/// HTTP header disguise.
fn transport_fields(
    tag: &str,
    network: &str,
    stream: Option<&Map<String, Value>>,
) -> Result<(Option<String>, Option<String>), ConfigError> {
    match network {
        "ws" => {
            let settings = stream.and_then(|s| s.get("wsSettings"));
            let path = scalar_field(tag, settings, "path")?;
            let host = scalar_field(tag, settings.and_then(|w| w.get("headers")), "Host")?;
            Ok((host, path))
        }
        "tcp" | "raw" => {
            let header = stream
                .and_then(|s| s.get("tcpSettings"))
                .and_then(|t| t.get("header"));
            if header.and_then(|h| h.get("type")).and_then(Value::as_str) != Some("http") {
                return Ok((None, None));
            }
            let request = header.and_then(|h| h.get("request"));
            let path = first_of_list(tag, request.and_then(|r| r.get("path")), "path")?;
            let host = first_of_list(
                tag,
                request.and_then(|r| r.get("headers")).and_then(|h| h.get("Host")),
                "Host",
            )?;
            Ok((host, path))
        }
        "grpc" => {
            let settings = stream.and_then(|s| s.get("grpcSettings"));
            let path = scalar_field(tag, settings, "serviceName")?;
            Ok((None, path))
        }
        _ => Ok((None, None)),
    }
}

fn scalar_field(
    tag: &str,
    container: Option<&Value>,
    field: &'static str,
) -> Result<Option<String>, ConfigError> {
    match container.and_then(|c| c.get(field)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ConfigError::FieldShape {
            tag: tag.into(),
            field,
            expected: "a string",
        }),
    }
}

fn first_of_list(
    tag: &str,
    value: Option<&Value>,
    field: &'static str,
) -> Result<Option<String>, ConfigError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(items.first().and_then(Value::as_str).map(str::to_owned)),
        Some(_) => Err(ConfigError::FieldShape {
            tag: tag.into(),
            field,
            expected: "a list",
        }),
    }
}

fn port_of(tag: &str, obj: &Map<String, Value>) -> Result<Option<u16>, ConfigError> {
    match obj.get("port") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::FieldShape {
                tag: tag.into(),
                field: "port",
                expected: "a port number",
            }),
        Some(Value::String(s)) => {
            s.parse::<u16>()
                .map(Some)
                .map_err(|_| ConfigError::FieldShape {
                    tag: tag.into(),
                    field: "port",
                    expected: "a port number",
                })
        }
        Some(_) => Err(ConfigError::FieldShape {
            tag: tag.into(),
            field: "port",
            expected: "a port number",
        }),
    }
}

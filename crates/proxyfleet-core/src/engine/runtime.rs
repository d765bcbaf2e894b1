//! Runtime config construction: merging the live user set into a deep copy
//! of the engine config.
//!
//! The runtime config is never persisted; it is rebuilt fresh from the
//! current user snapshot before every start/restart call.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::user::{Protocol, ProxySettings, User};

use super::config::{ConfigError, ConfigResolver, EngineConfig, InboundProfile};

/// Default shadowsocks cipher when the user's settings carry none.
const DEFAULT_SS_METHOD: &str = "chacha20-ietf-poly1305";

/// Synthesize the engine-native account object for one user on one
/// protocol. `email` is the account identity (`{id}.{username}`).
pub fn synthesize_account(
    protocol: Protocol,
    settings: &ProxySettings,
    email: &str,
) -> Result<Value, ConfigError> {
    let missing = |field: &'static str| ConfigError::MissingCredential {
        email: email.to_owned(),
        protocol,
        field,
    };

    Ok(match protocol {
        Protocol::Vmess => json!({
            "id": settings.id.as_deref().ok_or_else(|| missing("id"))?,
            "email": email,
        }),
        Protocol::Vless => json!({
            "id": settings.id.as_deref().ok_or_else(|| missing("id"))?,
            "flow": settings.flow.as_deref().unwrap_or_default(),
            "email": email,
        }),
        Protocol::Trojan => json!({
            "password": settings.password.as_deref().ok_or_else(|| missing("password"))?,
            "email": email,
        }),
        Protocol::Shadowsocks => json!({
            "password": settings.password.as_deref().ok_or_else(|| missing("password"))?,
            "method": settings.method.as_deref().unwrap_or(DEFAULT_SS_METHOD),
            "email": email,
        }),
    })
}

impl ConfigResolver {
    /// Build the runtime config: a deep copy of `config` with, per resolved
    /// inbound, the accounts of every entitled user appended to its client
    /// list.
    ///
    /// Deterministic: an identical `users` snapshot produces byte-identical
    /// output (users are merged in snapshot order, inbounds in config
    /// order, and the document's key order is canonical).
    pub fn build_runtime_config(
        &self,
        config: &EngineConfig,
        users: &[User],
    ) -> Result<String, ConfigError> {
        let profiles: HashMap<&str, &InboundProfile> = config
            .profiles()
            .iter()
            .map(|p| (p.tag.as_str(), p))
            .collect();

        let mut doc = config.doc.clone();
        if let Some(inbounds) = doc.get_mut("inbounds").and_then(Value::as_array_mut) {
            for inbound in inbounds.iter_mut() {
                let Some(obj) = inbound.as_object_mut() else {
                    continue;
                };
                let Some(tag) = obj.get("tag").and_then(Value::as_str).map(str::to_owned) else {
                    continue;
                };
                let Some(profile) = profiles.get(tag.as_str()) else {
                    continue;
                };

                let mut accounts = Vec::new();
                for user in users {
                    if !user.status.is_entitled() || user.is_excluded_from(&tag) {
                        continue;
                    }
                    let Some(settings) = user.proxies.get(&profile.protocol) else {
                        continue;
                    };
                    accounts.push(synthesize_account(
                        profile.protocol,
                        settings,
                        &user.email(),
                    )?);
                }
                if accounts.is_empty() {
                    continue;
                }

                let settings = obj.entry("settings").or_insert_with(|| json!({}));
                if let Some(settings) = settings.as_object_mut() {
                    let clients = settings.entry("clients").or_insert_with(|| json!([]));
                    if let Some(clients) = clients.as_array_mut() {
                        clients.extend(accounts);
                    }
                }
            }
        }

        serde_json::to_string(&Value::Object(doc)).map_err(|e| ConfigError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::user::UserStatus;

    const TWO_INBOUNDS: &str = r#"{
        "inbounds": [
            {"tag": "VMESS_TCP", "protocol": "vmess", "port": 10001,
             "settings": {"clients": []}},
            {"tag": "VLESS_WS", "protocol": "vless", "port": 10002,
             "streamSettings": {"network": "ws", "wsSettings": {"path": "/ws"}}}
        ],
        "outbounds": [{"tag": "direct", "protocol": "freedom"}]
    }"#;

    fn resolved_config() -> (ConfigResolver, EngineConfig) {
        let resolver = ConfigResolver::new(8080, None);
        let mut config = resolver.parse(TWO_INBOUNDS).unwrap();
        resolver.resolve(&mut config).unwrap();
        (resolver, config)
    }

    fn dual_protocol_user(status: UserStatus) -> User {
        let mut proxies = BTreeMap::new();
        proxies.insert(
            Protocol::Vmess,
            ProxySettings {
                id: Some("11111111-1111-1111-1111-111111111111".into()),
                ..Default::default()
            },
        );
        proxies.insert(
            Protocol::Vless,
            ProxySettings {
                id: Some("22222222-2222-2222-2222-222222222222".into()),
                ..Default::default()
            },
        );
        User {
            id: 7,
            username: "alice".into(),
            status,
            proxies,
            excluded_inbounds: BTreeSet::new(),
        }
    }

    fn clients_of<'a>(doc: &'a Value, tag: &str) -> &'a [Value] {
        doc["inbounds"]
            .as_array()
            .unwrap()
            .iter()
            .find(|i| i["tag"] == tag)
            .and_then(|i| i["settings"]["clients"].as_array())
            .map_or(&[], Vec::as_slice)
    }

    #[test]
    fn attaches_one_account_per_entitled_inbound() {
        let (resolver, config) = resolved_config();
        let users = vec![dual_protocol_user(UserStatus::Active)];
        let runtime = resolver.build_runtime_config(&config, &users).unwrap();
        let doc: Value = serde_json::from_str(&runtime).unwrap();

        let vmess = clients_of(&doc, "VMESS_TCP");
        assert_eq!(vmess.len(), 1);
        assert_eq!(vmess[0]["id"], "11111111-1111-1111-1111-111111111111");
        assert_eq!(vmess[0]["email"], "7.alice");

        let vless = clients_of(&doc, "VLESS_WS");
        assert_eq!(vless.len(), 1);
        assert_eq!(vless[0]["id"], "22222222-2222-2222-2222-222222222222");
    }

    #[test]
    fn disabled_user_gets_no_accounts() {
        let (resolver, config) = resolved_config();
        let users = vec![dual_protocol_user(UserStatus::Disabled)];
        let runtime = resolver.build_runtime_config(&config, &users).unwrap();
        let doc: Value = serde_json::from_str(&runtime).unwrap();

        assert!(clients_of(&doc, "VMESS_TCP").is_empty());
        assert!(clients_of(&doc, "VLESS_WS").is_empty());
    }

    #[test]
    fn excluded_inbound_is_skipped() {
        let (resolver, config) = resolved_config();
        let mut user = dual_protocol_user(UserStatus::Active);
        user.excluded_inbounds.insert("VLESS_WS".into());
        let runtime = resolver.build_runtime_config(&config, &[user]).unwrap();
        let doc: Value = serde_json::from_str(&runtime).unwrap();

        assert_eq!(clients_of(&doc, "VMESS_TCP").len(), 1);
        assert!(clients_of(&doc, "VLESS_WS").is_empty());
    }

    #[test]
    fn build_is_deterministic() {
        let (resolver, config) = resolved_config();
        let users = vec![
            dual_protocol_user(UserStatus::Active),
            User {
                id: 8,
                username: "bob".into(),
                status: UserStatus::OnHold,
                proxies: {
                    let mut m = BTreeMap::new();
                    m.insert(
                        Protocol::Vmess,
                        ProxySettings {
                            id: Some("33333333-3333-3333-3333-333333333333".into()),
                            ..Default::default()
                        },
                    );
                    m
                },
                excluded_inbounds: BTreeSet::new(),
            },
        ];
        let first = resolver.build_runtime_config(&config, &users).unwrap();
        let second = resolver.build_runtime_config(&config, &users).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn source_config_is_not_mutated() {
        let (resolver, config) = resolved_config();
        let before = config.to_json_string().unwrap();
        let users = vec![dual_protocol_user(UserStatus::Active)];
        resolver.build_runtime_config(&config, &users).unwrap();
        assert_eq!(config.to_json_string().unwrap(), before);
    }

    #[test]
    fn missing_credential_is_an_error() {
        let (resolver, config) = resolved_config();
        let mut user = dual_protocol_user(UserStatus::Active);
        user.proxies.insert(Protocol::Vmess, ProxySettings::default());
        assert!(matches!(
            resolver.build_runtime_config(&config, &[user]),
            Err(ConfigError::MissingCredential { field: "id", .. })
        ));
    }

    #[test]
    fn trojan_and_shadowsocks_accounts() {
        let email = "9.carol";
        let trojan = synthesize_account(
            Protocol::Trojan,
            &ProxySettings {
                password: Some("t-pass".into()),
                ..Default::default()
            },
            email,
        )
        .unwrap();
        assert_eq!(trojan["password"], "t-pass");
        assert_eq!(trojan["email"], email);

        let ss = synthesize_account(
            Protocol::Shadowsocks,
            &ProxySettings {
                password: Some("s-pass".into()),
                ..Default::default()
            },
            email,
        )
        .unwrap();
        assert_eq!(ss["method"], DEFAULT_SS_METHOD);
    }

    #[test]
    fn vless_flow_defaults_to_empty() {
        let account = synthesize_account(
            Protocol::Vless,
            &ProxySettings {
                id: Some("u".into()),
                ..Default::default()
            },
            "1.a",
        )
        .unwrap();
        assert_eq!(account["flow"], "");
    }
}

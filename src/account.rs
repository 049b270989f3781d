//! User, node, and inbound models consumed by the dispatcher, and the proxy account
//! payload derived from them at fan-out time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Proxy protocol a given inbound/account pair is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
}

/// Per-protocol settings a user carries, prior to being bound to a specific inbound.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySettings {
    /// XTLS/REALITY flow identifier, when the protocol and inbound both support it.
    pub flow: Option<String>,
    /// Protocol-specific id (uuid for vmess/vless, password for trojan/shadowsocks).
    pub id: String,
    /// Shadowsocks cipher method, if applicable.
    pub method: Option<String>,
}

/// Account lifecycle state carried on a [`UserView`] snapshot. Not consulted by fan-out: the
/// dispatcher acts on whatever `inbounds` it is handed regardless of status, matching the
/// reference system's manager, which leaves status enforcement to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Disabled,
    Limited,
    OnHold,
}

/// Read-only snapshot of a user at the moment an operation was enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub id: i64,
    pub username: String,
    pub status: UserStatus,
    /// Per-protocol settings this user carries.
    pub proxies: HashMap<ProxyType, ProxySettings>,
    /// Per-protocol list of inbound tags this user should be present on.
    pub inbounds: HashMap<ProxyType, Vec<String>>,
}

impl UserView {
    /// The identity string the remote engine keys accounts by: `"{id}.{username}"`.
    pub fn email(&self) -> String {
        format!("{}.{}", self.id, self.username)
    }

    /// All inbound tags this user is currently meant to be active on, across protocols.
    pub fn active_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.inbounds.values().flatten().cloned().collect();
        tags.sort();
        tags.dedup();
        tags
    }
}

/// Network transport an inbound listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Kcp,
    Ws,
    Grpc,
    Http,
    Quic,
}

/// TLS mode an inbound is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    None,
    Tls,
    Reality,
}

/// Parameters of one inbound, as known to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundInfo {
    pub network: Network,
    pub tls: TlsMode,
    /// e.g. `"http"`, `"none"` — only `"http"` disables XTLS flow.
    pub header_type: String,
    pub proxy_type: ProxyType,
}

/// Tag -> inbound parameters, as fetched from the main core at fan-out time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundCatalog {
    pub inbounds: HashMap<String, InboundInfo>,
}

impl InboundCatalog {
    pub fn get(&self, tag: &str) -> Option<&InboundInfo> {
        self.inbounds.get(tag)
    }

    pub fn tags(&self) -> Vec<String> {
        self.inbounds.keys().cloned().collect()
    }
}

/// A remote fleet member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub id: i64,
    pub name: String,
    pub address: String,
    /// Port used to fetch the node's TLS leaf certificate.
    pub rest_port: u16,
    /// Port the node's `HandlerService` gRPC endpoint listens on.
    pub rpc_port: u16,
}

/// Whether an inbound's transport/TLS combination supports XTLS flow.
fn supports_xtls(info: &InboundInfo) -> bool {
    matches!(info.network, Network::Tcp | Network::Kcp)
        && matches!(info.tls, TlsMode::Tls | TlsMode::Reality)
        && info.header_type.to_lowercase() != "http"
}

/// Proxy-specific account payload issued in an `AddUserOperation`.
#[derive(Debug, Clone, PartialEq)]
pub enum Account {
    Vmess { email: String, id: String, level: u32 },
    Vless { email: String, id: String, level: u32, flow: Option<String> },
    Trojan { email: String, password: String, level: u32, flow: Option<String> },
    Shadowsocks { email: String, password: String, level: u32, method: String },
}

/// Build the `Account` to send for `user` on `tag`, gating XTLS flow by the inbound's
/// transport/TLS combination.
pub fn build_account(user: &UserView, proxy_type: ProxyType, info: &InboundInfo, level: u32) -> Account {
    let email = user.email();
    let settings = user.proxies.get(&proxy_type).cloned().unwrap_or_default();
    let flow = if supports_xtls(info) { settings.flow.clone() } else { None };

    match proxy_type {
        ProxyType::Vmess => Account::Vmess { email, id: settings.id, level },
        ProxyType::Vless => Account::Vless { email, id: settings.id, level, flow },
        ProxyType::Trojan => Account::Trojan { email, password: settings.id, level, flow },
        ProxyType::Shadowsocks => Account::Shadowsocks {
            email,
            password: settings.id,
            level,
            method: settings.method.unwrap_or_else(|| "chacha20-ietf-poly1305".to_string()),
        },
    }
}

//! Registry RPC messages (length-prefixed CBOR, see `ucrelay_core::rpc`).

use crate::types::{Lookup, ProxyAdvert, ProxyRecord, PutOutcome};
use serde::{Deserialize, Serialize};
use ucrelay_core::{ProxyId, ServerId, WireError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryRequest {
    PutIfAbsent {
        server: ServerId,
        proxy: ProxyId,
        ttl_ms: u64,
    },
    CompareAndSwap {
        server: ServerId,
        expected: ProxyId,
        new: ProxyId,
        ttl_ms: u64,
    },
    Get {
        server: ServerId,
    },
    Refresh {
        server: ServerId,
        proxy: ProxyId,
        ttl_ms: u64,
    },
    RemoveIf {
        server: ServerId,
        proxy: ProxyId,
    },
    IncrementLoad {
        proxy: ProxyId,
    },
    DecrementLoad {
        proxy: ProxyId,
    },
    SetLoad {
        proxy: ProxyId,
        load: u64,
    },
    UpsertProxy {
        advert: ProxyAdvert,
        ttl_ms: u64,
    },
    GetProxy {
        proxy: ProxyId,
    },
    MarkUnhealthy {
        proxy: ProxyId,
    },
    ListHealthyProxies,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryResponse {
    Put(PutOutcome),
    Lookup(Lookup),
    /// Conditional mutations: whether the condition held.
    Applied(bool),
    Load(u64),
    Proxy(Option<ProxyRecord>),
    Proxies(Vec<ProxyRecord>),
    Done,
    Error(WireError),
}

impl RegistryResponse {
    /// Variant name, for "unexpected response" errors.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryResponse::Put(_) => "put",
            RegistryResponse::Lookup(_) => "lookup",
            RegistryResponse::Applied(_) => "applied",
            RegistryResponse::Load(_) => "load",
            RegistryResponse::Proxy(_) => "proxy",
            RegistryResponse::Proxies(_) => "proxies",
            RegistryResponse::Done => "done",
            RegistryResponse::Error(_) => "error",
        }
    }
}

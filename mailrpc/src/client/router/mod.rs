// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Server selection for calls that are not pinned to a server id.

pub mod consistent_hash;
mod crc32;
mod least_active;
mod random;
mod round_robin;
mod weighted;

pub use consistent_hash::{HashAlgorithm, HashRing};

use crate::config::ClientConfig;
use crate::error::RouteError;
use crate::message::RpcMessage;
use crate::registry::{RegistryObserver, ServerDescriptor};
use crate::ServerId;
use least_active::LeastActive;
use round_robin::RoundRobin;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use weighted::WeightedRoundRobin;

/// [`Route`] picks the server of a type that handles a message.
///
/// `pool` holds the online servers of `server_type` in registration order. `route_param` is the
/// session affinity key of the call, if the caller gave one. Implementations keeping per-server
/// state learn about registry mutations through [`RegistryObserver`].
pub trait Route: RegistryObserver {
    /// Returns the id of the chosen server.
    fn route(&self, server_type: &str, route_param: Option<&str>, msg: &RpcMessage, pool: &[ServerDescriptor]) -> Result<ServerId, RouteError>;
}

/// Built-in routing strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouterKind {
    /// Uniformly random.
    #[default]
    #[serde(rename = "rd", alias = "random")]
    Random,
    /// Each server in turn.
    #[serde(rename = "rr", alias = "roundRobin")]
    RoundRobin,
    /// Each server in turn, `weight` times per cycle.
    #[serde(rename = "wrr", alias = "weightRoundRobin")]
    WeightedRoundRobin,
    /// The server routed to least often.
    #[serde(rename = "la", alias = "leastActive")]
    LeastActive,
    /// The server owning the message key on a consistent hash ring.
    #[serde(rename = "ch", alias = "consistentHash")]
    ConsistentHash,
    /// CRC-32 of the route parameter modulo the pool size, random without one.
    #[serde(rename = "df", alias = "crc32")]
    Crc32,
}

/// Mutable routing state, created lazily per strategy and server type.
#[derive(Debug, Default)]
pub struct RouterState {
    round_robin: HashMap<String, RoundRobin>,
    weighted: HashMap<String, WeightedRoundRobin>,
    least_active: HashMap<String, LeastActive>,
    rings: HashMap<String, HashRing>,
}

/// [`Router`] implements every [`RouterKind`] over one shared [`RouterState`].
#[derive(Debug)]
pub struct Router {
    kind: RouterKind,
    replicas: usize,
    algorithm: HashAlgorithm,
    hash_field_index: Option<usize>,
    state: Mutex<RouterState>,
}

impl Default for Router {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl Router {
    /// Returns a router using `kind` with default hashing settings.
    pub fn new(kind: RouterKind) -> Self {
        Self::from_config(&ClientConfig::default().with_router(kind))
    }

    /// Returns a router configured by `router`, `replicas`, `algorithm` and `hash_field_index`.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            kind: config.router,
            replicas: config.replicas,
            algorithm: config.algorithm,
            hash_field_index: config.hash_field_index,
            state: Mutex::new(RouterState::default()),
        }
    }

    /// The default strategy of this router.
    pub fn kind(&self) -> RouterKind {
        self.kind
    }

    /// Routes with an explicit strategy instead of the default one.
    pub fn route_with(&self, kind: RouterKind, server_type: &str, route_param: Option<&str>, msg: &RpcMessage, pool: &[ServerDescriptor]) -> Result<ServerId, RouteError> {
        if pool.is_empty() {
            return Err(RouteError::NoServers(server_type.to_owned()));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match kind {
            RouterKind::Random => Ok(random::pick(pool)),
            RouterKind::Crc32 => Ok(crc32::pick(route_param, pool)),
            RouterKind::RoundRobin => Ok(state.round_robin.entry(server_type.to_owned()).or_default().pick(pool)),
            RouterKind::WeightedRoundRobin => state.weighted.entry(server_type.to_owned()).or_default().pick(server_type, pool),
            RouterKind::LeastActive => Ok(state.least_active.entry(server_type.to_owned()).or_default().pick(pool)),
            RouterKind::ConsistentHash => {
                let ring = state
                    .rings
                    .entry(server_type.to_owned())
                    .or_insert_with(|| HashRing::with_nodes(self.replicas, self.algorithm, pool.iter().map(|s| s.id.clone())));
                let key = self.hash_key(msg);
                ring.get_node(key.as_bytes()).cloned().ok_or_else(|| RouteError::NoServers(server_type.to_owned()))
            },
        }
    }

    /// The configured argument, or the whole message when that argument is missing or null.
    /// `0`, `""` and `false` are keys like any other value.
    fn hash_key(&self, msg: &RpcMessage) -> String {
        match self.hash_field_index.and_then(|i| msg.args.get(i)) {
            Some(Value::String(s)) => s.clone(),
            Some(v) if !v.is_null() => v.to_string(),
            _ => serde_json::to_string(msg).unwrap_or_else(|_| msg.route_name()),
        }
    }
}

impl RegistryObserver for Router {
    fn on_server_added(&self, server: &ServerDescriptor) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ring) = state.rings.get_mut(&server.server_type) {
            ring.add_node(server.id.clone());
        }
    }

    fn on_server_removed(&self, server: &ServerDescriptor) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ring) = state.rings.get_mut(&server.server_type) {
            ring.remove_node(&server.id);
        }
        if let Some(la) = state.least_active.get_mut(&server.server_type) {
            la.forget(&server.id);
        }
    }
}

impl Route for Router {
    fn route(&self, server_type: &str, route_param: Option<&str>, msg: &RpcMessage, pool: &[ServerDescriptor]) -> Result<ServerId, RouteError> {
        self.route_with(self.kind, server_type, route_param, msg, pool)
    }
}

// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! The table of remote servers a station may dispatch to.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Identifies a remote server, e.g. `connector-server-1`.
pub type ServerId = String;

/// [`ServerDescriptor`] describes one remote server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    /// Unique server id.
    pub id: ServerId,
    /// Host to connect to.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// Kind of server, e.g. `connector` or `chat`.
    pub server_type: String,
    /// Weight for weighted round robin. Servers without a weight are skipped by that strategy.
    #[serde(default)]
    pub weight: Option<u32>,
}

impl ServerDescriptor {
    /// Returns a descriptor without weight.
    pub fn new(id: impl Into<ServerId>, server_type: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            server_type: server_type.into(),
            weight: None,
        }
    }

    /// Sets the weighted round robin weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Gets notified about registry mutations, right after they are applied.
///
/// Routers keep derived state, like hash rings, current through this trait.
pub trait RegistryObserver: Send + Sync + 'static {
    /// A server was added or its descriptor replaced.
    fn on_server_added(&self, _server: &ServerDescriptor) {}
    /// A server was removed.
    fn on_server_removed(&self, _server: &ServerDescriptor) {}
}

/// The difference between two server lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryChange {
    /// The new list.
    pub all: Vec<ServerDescriptor>,
    /// Ids present only in the new list.
    pub added: Vec<ServerDescriptor>,
    /// Ids present only in the old list.
    pub removed: Vec<ServerDescriptor>,
}

impl RegistryChange {
    /// Whether anything was added or removed.
    pub fn is_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// [`diff_servers`] compares `prev` and `next` by server id only.
///
/// A descriptor whose id survives is neither added nor removed, even if its address or weight changed.
pub fn diff_servers(prev: &[ServerDescriptor], next: Vec<ServerDescriptor>) -> RegistryChange {
    let prev_set: HashSet<&str> = prev.iter().map(|s| s.id.as_str()).collect();
    let next_set: HashSet<&str> = next.iter().map(|s| s.id.as_str()).collect();

    let added = next.iter().filter(|s| !prev_set.contains(s.id.as_str())).cloned().collect();
    let removed = prev.iter().filter(|s| !next_set.contains(s.id.as_str())).cloned().collect();

    RegistryChange { all: next, added, removed }
}

/// [`Registry`] keeps descriptors, the per-type server lists and the online flags.
///
/// Per-type lists keep insertion order and never hold an id twice.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    servers: HashMap<ServerId, ServerDescriptor>,
    servers_map: HashMap<String, Vec<ServerId>>,
    onlines: HashMap<ServerId, bool>,
}

impl Registry {
    /// Returns an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `server` and marks it online. Returns the descriptor it replaced, if any.
    pub fn add(&mut self, server: ServerDescriptor) -> Option<ServerDescriptor> {
        let id = server.id.clone();
        let prev = self.servers.insert(id.clone(), server.clone());
        if let Some(prev) = &prev {
            if prev.server_type != server.server_type {
                self.unlist(&prev.server_type, &id);
            }
        }
        self.onlines.insert(id.clone(), true);
        let ids = self.servers_map.entry(server.server_type).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        prev
    }

    /// Deregisters a server. Returns its descriptor if it was known.
    pub fn remove(&mut self, id: &str) -> Option<ServerDescriptor> {
        self.onlines.remove(id);
        let server = self.servers.remove(id)?;
        self.unlist(&server.server_type, id);
        Some(server)
    }

    /// Replaces the whole table with `servers` and returns what changed.
    pub fn replace(&mut self, servers: Vec<ServerDescriptor>) -> RegistryChange {
        let prev: Vec<ServerDescriptor> = self.all();
        self.servers.clear();
        self.servers_map.clear();
        self.onlines.clear();
        for server in &servers {
            self.add(server.clone());
        }
        diff_servers(&prev, servers)
    }

    fn unlist(&mut self, server_type: &str, id: &str) {
        if let Some(ids) = self.servers_map.get_mut(server_type) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.servers_map.remove(server_type);
            }
        }
    }

    /// Looks up a descriptor.
    pub fn get(&self, id: &str) -> Option<&ServerDescriptor> {
        self.servers.get(id)
    }

    /// Whether the server is registered and online.
    pub fn is_online(&self, id: &str) -> bool {
        self.onlines.get(id).copied().unwrap_or(false)
    }

    /// Marks a registered server online or offline without deregistering it.
    pub fn set_online(&mut self, id: &str, online: bool) {
        if self.servers.contains_key(id) {
            self.onlines.insert(id.to_owned(), online);
        }
    }

    /// Ids of a server type, in registration order.
    pub fn ids_of(&self, server_type: &str) -> &[ServerId] {
        self.servers_map.get(server_type).map(Vec::as_slice).unwrap_or_default()
    }

    /// Online descriptors of a server type, in registration order.
    pub fn servers_of(&self, server_type: &str) -> Vec<ServerDescriptor> {
        self.ids_of(server_type)
            .iter()
            .filter(|id| self.is_online(id))
            .filter_map(|id| self.servers.get(id).cloned())
            .collect()
    }

    /// Every known server type.
    pub fn server_types(&self) -> impl Iterator<Item = &str> {
        self.servers_map.keys().map(String::as_str)
    }

    /// Every descriptor, grouped by type in registration order.
    pub fn all(&self) -> Vec<ServerDescriptor> {
        self.servers_map
            .values()
            .flat_map(|ids| ids.iter().filter_map(|id| self.servers.get(id).cloned()))
            .collect()
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether no server is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Remote service names known to a client.

use crate::message::RpcMessage;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

/// Name resolution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// No service with that name is registered for the namespace and server type.
    #[error("unknown service: {namespace}.{server_type}.{service}")]
    UnknownService {
        /// Namespace looked up.
        namespace: String,
        /// Server type looked up.
        server_type: String,
        /// Service looked up.
        service: String,
    },
    /// The service exists but does not expose the method.
    #[error("unknown method {method} of service {service}")]
    UnknownMethod {
        /// Service looked up.
        service: String,
        /// Method looked up.
        method: String,
    },
}

/// Service information.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    /// namespace, e.g. `sys` or `user`
    pub namespace: String,
    /// type of the servers exposing the service
    pub server_type: String,
    /// service name
    pub name: String,
    /// exposed method names
    pub methods: Vec<String>,
}

/// Service register.
pub trait ServiceRegister {
    /// register service
    fn register_service(&self, service_info: ServiceInfo);
}

/// Service lookup.
pub trait ServiceLookup {
    /// Checks that the service and method addressed by `msg` exist.
    fn lookup(&self, msg: &RpcMessage) -> Result<(), ServiceError>;
}

/// Both halves of a service registry.
pub trait ServiceRegistry: ServiceRegister + ServiceLookup + Send + Sync + 'static {}
impl<T> ServiceRegistry for T where T: ServiceRegister + ServiceLookup + Send + Sync + 'static {}

type Key = (String, String);

/// [`StaticServiceRegistry`] holds services registered in process.
#[derive(Debug, Default)]
pub struct StaticServiceRegistry {
    services: RwLock<HashMap<Key, HashMap<String, HashSet<String>>>>,
}

impl StaticServiceRegistry {
    /// Returns an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

impl From<Vec<ServiceInfo>> for StaticServiceRegistry {
    fn from(infos: Vec<ServiceInfo>) -> Self {
        let registry = Self::new();
        for info in infos {
            registry.register_service(info);
        }
        registry
    }
}

impl ServiceRegister for StaticServiceRegistry {
    fn register_service(&self, service_info: ServiceInfo) {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services
            .entry((service_info.namespace, service_info.server_type))
            .or_default()
            .entry(service_info.name)
            .or_default()
            .extend(service_info.methods);
    }
}

impl ServiceLookup for StaticServiceRegistry {
    fn lookup(&self, msg: &RpcMessage) -> Result<(), ServiceError> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        let methods = services
            .get(&(msg.namespace.clone(), msg.server_type.clone()))
            .and_then(|s| s.get(&msg.service))
            .ok_or_else(|| ServiceError::UnknownService {
                namespace: msg.namespace.clone(),
                server_type: msg.server_type.clone(),
                service: msg.service.clone(),
            })?;
        if methods.contains(&msg.method) {
            Ok(())
        } else {
            Err(ServiceError::UnknownMethod {
                service: msg.service.clone(),
                method: msg.method.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_service_registry() {
        let registry = StaticServiceRegistry::from(vec![ServiceInfo {
            namespace: "user".into(),
            server_type: "chat".into(),
            name: "chatRemote".into(),
            methods: vec!["add".into(), "kick".into()],
        }]);
        assert!(registry.lookup(&RpcMessage::new("user", "chat", "chatRemote", "add")).is_ok());
        assert_eq!(
            registry.lookup(&RpcMessage::new("user", "chat", "chatRemote", "leave")),
            Err(ServiceError::UnknownMethod {
                service: "chatRemote".into(),
                method: "leave".into()
            })
        );
        assert!(matches!(
            registry.lookup(&RpcMessage::new("sys", "chat", "chatRemote", "add")),
            Err(ServiceError::UnknownService { .. })
        ));
    }
}

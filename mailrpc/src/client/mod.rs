// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Provides a client that routes calls to remote servers through a mail station.

pub mod failure;
pub mod mailbox;
pub mod router;
pub mod station;

use crate::config::{ClientConfig, ConfigError};
use crate::error::{RouteError, RpcError, StationError};
use crate::message::{CallOptions, Response, RpcMessage};
use crate::registry::{RegistryObserver, ServerDescriptor};
use crate::service::{ServiceLookup, ServiceRegistry};
use crate::ServerId;
use futures::future::join_all;
use mailbox::MailboxFactory;
use router::{Route, Router};
use station::{ErrorHandler, Filter, MailStation, StationEvent};
use std::future::Future;
use std::sync::Arc;

/// [`RpcClient`] sends calls to servers picked by a [`Route`], or pinned by id.
pub struct RpcClient<F: MailboxFactory> {
    station: MailStation<F>,
    router: Arc<dyn Route>,
    services: Option<Arc<dyn ServiceRegistry>>,
}

impl<F: MailboxFactory> Clone for RpcClient<F> {
    fn clone(&self) -> Self {
        Self {
            station: self.station.clone(),
            router: self.router.clone(),
            services: self.services.clone(),
        }
    }
}

impl<F: MailboxFactory> RpcClient<F> {
    /// Returns a client routing with the strategy named by `config.router`.
    pub fn new(factory: F, config: ClientConfig) -> Result<Self, ConfigError> {
        let router = Router::from_config(&config);
        Self::with_router(factory, config, router)
    }

    /// Returns a client routing with a custom `router`.
    pub fn with_router<R: Route>(factory: F, config: ClientConfig, router: R) -> Result<Self, ConfigError> {
        config.validate()?;
        let station = MailStation::new(factory, config);
        let router = Arc::new(router);
        station.add_observer(router.clone() as Arc<dyn RegistryObserver>);
        Ok(Self {
            station,
            router,
            services: None,
        })
    }

    /// Rejects calls naming services or methods unknown to `services`.
    pub fn with_service_registry(mut self, services: Arc<dyn ServiceRegistry>) -> Self {
        self.services = Some(services);
        self
    }

    /// The underlying station.
    pub fn station(&self) -> &MailStation<F> {
        &self.station
    }

    /// Starts the station.
    pub async fn start(&self) -> Result<(), StationError> {
        self.station.start().await
    }

    /// Stops the station, see [`MailStation::stop`].
    pub fn stop(&self, force: bool) {
        self.station.stop(force)
    }

    /// Registers a server.
    pub fn add_server(&self, server: ServerDescriptor) {
        self.station.add_server(server)
    }

    /// Registers servers.
    pub fn add_servers(&self, servers: impl IntoIterator<Item = ServerDescriptor>) {
        self.station.add_servers(servers)
    }

    /// Deregisters a server.
    pub fn remove_server(&self, server_id: &str) {
        self.station.remove_server(server_id)
    }

    /// Deregisters servers.
    pub fn remove_servers<S: AsRef<str>>(&self, server_ids: impl IntoIterator<Item = S>) {
        self.station.remove_servers(server_ids)
    }

    /// Replaces every registered server.
    pub fn replace_servers(&self, servers: Vec<ServerDescriptor>) {
        self.station.replace_servers(servers)
    }

    /// Adds a before filter.
    pub fn before(&self, filter: Arc<dyn Filter>) {
        self.station.before(filter)
    }

    /// Adds an after filter.
    pub fn after(&self, filter: Arc<dyn Filter>) {
        self.station.after(filter)
    }

    /// Adds `filter` to both chains.
    pub fn filter(&self, filter: Arc<dyn Filter>) {
        self.station.before(filter.clone());
        self.station.after(filter);
    }

    /// Sets the filter error handler.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.station.set_error_handler(handler)
    }

    /// Subscribes to station events.
    pub fn subscribe(&self) -> async_broadcast::Receiver<StationEvent> {
        self.station.subscribe()
    }

    /// Picks the server for `msg`.
    pub fn route(&self, msg: &RpcMessage) -> Result<ServerId, RpcError> {
        self.route_by(None, msg)
    }

    /// Picks the server for `msg` with a session affinity key.
    pub fn route_by(&self, route_param: Option<&str>, msg: &RpcMessage) -> Result<ServerId, RpcError> {
        if let Some(services) = &self.services {
            services.lookup(msg)?;
        }
        let pool = self.station.servers_of(&msg.server_type);
        Ok(self.router.route(&msg.server_type, route_param, msg, &pool)?)
    }

    /// Sends `msg` to `server_id`, skipping the router.
    pub fn rpc_invoke(&self, server_id: impl Into<ServerId>, msg: RpcMessage) -> impl Future<Output = Result<Response, RpcError>> + Send + 'static {
        self.station.dispatch(server_id, msg, CallOptions::default())
    }

    /// Like [`RpcClient::rpc_invoke`] with per-call options.
    pub fn rpc_invoke_with(&self, server_id: impl Into<ServerId>, msg: RpcMessage, opts: CallOptions) -> impl Future<Output = Result<Response, RpcError>> + Send + 'static {
        self.station.dispatch(server_id, msg, opts)
    }

    /// Sends `msg` to the server chosen by the router.
    pub fn invoke(&self, msg: RpcMessage) -> impl Future<Output = Result<Response, RpcError>> + Send + 'static {
        self.invoke_with(msg, CallOptions::default())
    }

    /// Like [`RpcClient::invoke`] with per-call options. `opts.route_param` reaches the router.
    pub fn invoke_with(&self, msg: RpcMessage, opts: CallOptions) -> impl Future<Output = Result<Response, RpcError>> + Send + 'static {
        let routed = self
            .route_by(opts.route_param.as_deref(), &msg)
            .map(|server_id| self.station.dispatch(server_id, msg, opts));
        async move { routed?.await }
    }

    /// Sends `msg` to the server the router picks for `route_param`, usually a user id.
    pub fn invoke_with_route(&self, route_param: impl Into<String>, msg: RpcMessage) -> impl Future<Output = Result<Response, RpcError>> + Send + 'static {
        self.invoke_with(msg, CallOptions::default().with_route_param(route_param))
    }

    /// Sends `msg` to every online server of its type.
    ///
    /// Results come back in registration order.
    pub fn invoke_all(&self, msg: RpcMessage) -> impl Future<Output = Result<Vec<(ServerId, Result<Response, RpcError>)>, RpcError>> + Send + 'static {
        let calls = self.broadcast(msg);
        async move {
            let calls = calls?;
            let (ids, replies): (Vec<_>, Vec<_>) = calls.into_iter().unzip();
            Ok(ids.into_iter().zip(join_all(replies).await).collect())
        }
    }

    #[allow(clippy::type_complexity)]
    fn broadcast(&self, msg: RpcMessage) -> Result<Vec<(ServerId, impl Future<Output = Result<Response, RpcError>> + Send + 'static)>, RpcError> {
        if let Some(services) = &self.services {
            services.lookup(&msg)?;
        }
        let servers = self.station.servers_of(&msg.server_type);
        if servers.is_empty() {
            return Err(RouteError::NoServers(msg.server_type).into());
        }
        Ok(servers
            .into_iter()
            .map(|s| {
                let reply = self.station.dispatch(s.id.clone(), msg.clone(), CallOptions::default());
                (s.id, reply)
            })
            .collect())
    }
}

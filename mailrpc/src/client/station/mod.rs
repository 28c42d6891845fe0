// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! The mail station owns the server registry and one mailbox per server, connects lazily and
//! hands failed dispatches to the failure processor.

mod filter;

pub use filter::{ErrorHandler, Filter, Target};

use crate::client::failure::{FailureProcessor, Redispatch};
use crate::client::mailbox::{Mailbox, MailboxFactory};
use crate::config::ClientConfig;
use crate::error::{ErrorCode, MailboxError, RpcError, StationError};
use crate::message::{CallOptions, Response, RpcMessage};
use crate::registry::{Registry, RegistryObserver, ServerDescriptor};
use crate::ServerId;
use async_broadcast::{InactiveReceiver, Receiver, Sender};
use filter::{FilterChain, Stage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

const EVENT_CAPACITY: usize = 64;

/// Station lifecycle. Transitions only go forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Created, not started.
    Inited,
    /// Accepting dispatches.
    Started,
    /// Stopped.
    Closed,
}

/// Registry and mailbox notifications published by a station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    /// A server was registered.
    ServerAdded(ServerId),
    /// A server was deregistered.
    ServerRemoved(ServerId),
    /// The mailbox of a server closed.
    MailboxClosed(ServerId),
}

/// One dispatch on its way to a reply, retries included.
pub struct Call {
    /// Server the next attempt goes to.
    pub server_id: ServerId,
    /// The call.
    pub msg: RpcMessage,
    /// Per-call options.
    pub opts: CallOptions,
    /// Failsafe attempts so far.
    pub retries: u32,
    /// Failover servers not tried yet, set on the first failover.
    pub candidates: Option<Vec<ServerId>>,
    reply: oneshot::Sender<Result<Response, RpcError>>,
}

impl Call {
    /// Returns a call and the receiver of its result.
    pub fn new(server_id: ServerId, msg: RpcMessage, opts: CallOptions) -> (Self, oneshot::Receiver<Result<Response, RpcError>>) {
        let (reply, rx) = oneshot::channel();
        let call = Self {
            server_id,
            msg,
            opts,
            retries: 0,
            candidates: None,
            reply,
        };
        (call, rx)
    }

    /// Delivers the final result to the caller.
    pub fn resolve(self, result: Result<Response, RpcError>) {
        let _ = self.reply.send(result);
    }

    fn target(&self) -> Target {
        Target {
            server_id: self.server_id.clone(),
            msg: self.msg.clone(),
            opts: self.opts.clone(),
        }
    }

    fn retarget(&mut self, target: Target) {
        self.server_id = target.server_id;
        self.msg = target.msg;
        self.opts = target.opts;
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("server_id", &self.server_id)
            .field("route", &self.msg.route_name())
            .field("retries", &self.retries)
            .finish()
    }
}

struct StationState<M> {
    lifecycle: Lifecycle,
    registry: Registry,
    mailboxes: HashMap<ServerId, Arc<M>>,
    connecting: HashSet<ServerId>,
    pending: HashMap<ServerId, VecDeque<Call>>,
}

struct Inner<F: MailboxFactory> {
    factory: F,
    config: ClientConfig,
    failure: FailureProcessor,
    state: Mutex<StationState<F::Mailbox>>,
    befores: RwLock<FilterChain>,
    afters: RwLock<FilterChain>,
    error_handler: RwLock<Option<ErrorHandler>>,
    observers: RwLock<Vec<Arc<dyn RegistryObserver>>>,
    events: Sender<StationEvent>,
    events_rx: InactiveReceiver<StationEvent>,
}

/// [`MailStation`] dispatches calls to servers by id.
///
/// The first dispatch to a server creates its mailbox and connects it; calls arriving while it
/// connects wait in a bounded queue and are sent in submission order once connected. Cloning a
/// station yields another handle to the same station.
pub struct MailStation<F: MailboxFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: MailboxFactory> Clone for MailStation<F> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<F: MailboxFactory> MailStation<F> {
    /// Returns a station creating mailboxes with `factory`.
    pub fn new(factory: F, config: ClientConfig) -> Self {
        let (mut events, events_rx) = async_broadcast::broadcast(EVENT_CAPACITY);
        events.set_overflow(true);
        Self {
            inner: Arc::new(Inner {
                factory,
                failure: FailureProcessor::from_config(&config),
                config,
                state: Mutex::new(StationState {
                    lifecycle: Lifecycle::Inited,
                    registry: Registry::new(),
                    mailboxes: HashMap::new(),
                    connecting: HashSet::new(),
                    pending: HashMap::new(),
                }),
                befores: RwLock::new(FilterChain::default()),
                afters: RwLock::new(FilterChain::default()),
                error_handler: RwLock::new(None),
                observers: RwLock::new(Vec::new()),
                events,
                events_rx: events_rx.deactivate(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StationState<F::Mailbox>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The configuration the station was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    /// Starts accepting dispatches.
    pub async fn start(&self) -> Result<(), StationError> {
        {
            let mut state = self.lock();
            match state.lifecycle {
                Lifecycle::Inited => {},
                Lifecycle::Started => {
                    warn!("[MAILRPC] mail station has already started");
                    return Err(StationError::AlreadyStarted);
                },
                Lifecycle::Closed => return Err(StationError::Closed),
            }
            state.lifecycle = Lifecycle::Started;
        }
        tokio::task::yield_now().await;
        debug!("[MAILRPC] mail station started");
        Ok(())
    }

    /// Stops the station. With `force` every mailbox closes now, otherwise after `grace_timeout`.
    ///
    /// Outside a tokio runtime there is no timer for the grace period, so a graceful stop closes
    /// every mailbox at once.
    pub fn stop(&self, force: bool) {
        {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Started {
                warn!("[MAILRPC] mail station is not running now");
                return;
            }
            state.lifecycle = Lifecycle::Closed;
        }
        if force {
            self.close_all();
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[MAILRPC] no runtime to wait for the grace timeout, closing now: {e}");
                self.close_all();
                return;
            },
        };
        let station = self.clone();
        let grace = self.inner.config.grace_timeout;
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            station.close_all();
        });
    }

    fn close_all(&self) {
        let mailboxes: Vec<_> = self.lock().mailboxes.drain().map(|(_, m)| m).collect();
        debug!("[MAILRPC] closing {} mailboxes", mailboxes.len());
        for mailbox in mailboxes {
            mailbox.close();
        }
    }

    /// Registers a server and marks it online.
    ///
    /// Re-registering an id under another server type counts as leaving the old type. A changed
    /// address closes the current mailbox.
    pub fn add_server(&self, server: ServerDescriptor) {
        let (prev, stale) = {
            let mut state = self.lock();
            let prev = state.registry.add(server.clone());
            let moved = prev.as_ref().is_some_and(|p| p.address() != server.address());
            let stale = if moved { state.mailboxes.remove(&server.id) } else { None };
            (prev, stale)
        };
        if let Some(mailbox) = stale {
            mailbox.close();
        }
        if let Some(prev) = prev.filter(|p| p.server_type != server.server_type) {
            self.notify_removed(&prev);
        }
        self.notify_added(&server);
    }

    /// Batch version of [`MailStation::add_server`].
    pub fn add_servers(&self, servers: impl IntoIterator<Item = ServerDescriptor>) {
        for server in servers {
            self.add_server(server);
        }
    }

    /// Deregisters a server and closes its mailbox.
    pub fn remove_server(&self, server_id: &str) {
        let (server, mailbox) = {
            let mut state = self.lock();
            (state.registry.remove(server_id), state.mailboxes.remove(server_id))
        };
        if let Some(mailbox) = mailbox {
            mailbox.close();
        }
        match server {
            Some(server) => self.notify_removed(&server),
            None => warn!("[MAILRPC] remove unknown server: {server_id}"),
        }
    }

    /// Batch version of [`MailStation::remove_server`].
    pub fn remove_servers<S: AsRef<str>>(&self, server_ids: impl IntoIterator<Item = S>) {
        for id in server_ids {
            self.remove_server(id.as_ref());
        }
    }

    /// Replaces the whole registry. Mailboxes of servers that disappeared are closed.
    pub fn replace_servers(&self, servers: Vec<ServerDescriptor>) {
        let (change, mailboxes) = {
            let mut state = self.lock();
            let change = state.registry.replace(servers);
            let mailboxes: Vec<_> = change.removed.iter().filter_map(|s| state.mailboxes.remove(&s.id)).collect();
            (change, mailboxes)
        };
        for mailbox in mailboxes {
            mailbox.close();
        }
        for server in &change.removed {
            self.notify_removed(server);
        }
        for server in &change.added {
            self.notify_added(server);
        }
    }

    fn notify_added(&self, server: &ServerDescriptor) {
        for observer in self.observers() {
            observer.on_server_added(server);
        }
        let _ = self.inner.events.try_broadcast(StationEvent::ServerAdded(server.id.clone()));
    }

    fn notify_removed(&self, server: &ServerDescriptor) {
        for observer in self.observers() {
            observer.on_server_removed(server);
        }
        let _ = self.inner.events.try_broadcast(StationEvent::ServerRemoved(server.id.clone()));
    }

    fn observers(&self) -> Vec<Arc<dyn RegistryObserver>> {
        self.inner.observers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Subscribes `observer` to registry mutations.
    pub fn add_observer(&self, observer: Arc<dyn RegistryObserver>) {
        self.inner.observers.write().unwrap_or_else(|e| e.into_inner()).push(observer);
    }

    /// Subscribes to [`StationEvent`]s published from now on.
    pub fn subscribe(&self) -> Receiver<StationEvent> {
        self.inner.events_rx.activate_cloned()
    }

    /// Appends a filter run before every send.
    pub fn before(&self, filter: Arc<dyn Filter>) {
        self.inner.befores.write().unwrap_or_else(|e| e.into_inner()).push(filter);
    }

    /// Appends a filter run after every reply.
    pub fn after(&self, filter: Arc<dyn Filter>) {
        self.inner.afters.write().unwrap_or_else(|e| e.into_inner()).push(filter);
    }

    /// Receives filter errors instead of the log.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.inner.error_handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// The descriptor of a registered server.
    pub fn server(&self, server_id: &str) -> Option<ServerDescriptor> {
        self.lock().registry.get(server_id).cloned()
    }

    /// Online servers of a type, in registration order.
    pub fn servers_of(&self, server_type: &str) -> Vec<ServerDescriptor> {
        self.lock().registry.servers_of(server_type)
    }

    /// Whether a connected mailbox exists for the server.
    pub fn has_mailbox(&self, server_id: &str) -> bool {
        self.lock().mailboxes.contains_key(server_id)
    }

    /// Whether the server is mid-connect.
    pub fn is_connecting(&self, server_id: &str) -> bool {
        self.lock().connecting.contains(server_id)
    }

    /// Calls waiting for the server to connect.
    pub fn pending_len(&self, server_id: &str) -> usize {
        self.lock().pending.get(server_id).map_or(0, VecDeque::len)
    }

    /// Sends `msg` to `server_id`.
    ///
    /// The call is submitted before this returns, so calls dispatched one after another reach
    /// the server in that order. The returned future only waits for the result.
    pub fn dispatch(&self, server_id: impl Into<ServerId>, msg: RpcMessage, opts: CallOptions) -> impl Future<Output = Result<Response, RpcError>> + Send + 'static {
        let (call, rx) = Call::new(server_id.into(), msg, opts);
        self.submit(call);
        async move { rx.await.unwrap_or(Err(RpcError::Canceled)) }
    }

    /// Routes one attempt of `call`.
    pub fn submit(&self, call: Call) {
        let mut state = self.lock();
        if state.lifecycle != Lifecycle::Started {
            drop(state);
            error!("[MAILRPC] mail station is not running now");
            self.fail(ErrorCode::ServerNotStarted, call, None);
            return;
        }
        if state.connecting.contains(&call.server_id) {
            let rejected = self.enqueue(&mut state, call);
            drop(state);
            self.reject(rejected);
            return;
        }
        if state.mailboxes.contains_key(&call.server_id) {
            drop(state);
            self.deliver(call);
            return;
        }

        // lazy connect
        let server = state.registry.get(&call.server_id).filter(|s| state.registry.is_online(&s.id)).cloned();
        let Some(server) = server else {
            drop(state);
            error!("[MAILRPC] no such server or server is offline: {}", call.server_id);
            self.fail(ErrorCode::NoTargetServer, call, None);
            return;
        };
        let mailbox = Arc::new(self.inner.factory.create(&server, &self.inner.config));
        let closed = mailbox.watch_close();
        state.connecting.insert(server.id.clone());
        let rejected = self.enqueue(&mut state, call);
        drop(state);
        self.reject(rejected);

        debug!("[MAILRPC] connecting to {} at {}", server.id, server.address());
        let station = self.clone();
        tokio::spawn(async move {
            let result = mailbox.connect().await;
            station.on_connected(server.id, mailbox, closed, result);
        });
    }

    /// Queues a call behind the connect. Returns it back when the queue is full.
    fn enqueue(&self, state: &mut StationState<F::Mailbox>, call: Call) -> Option<Call> {
        let queue = state.pending.entry(call.server_id.clone()).or_default();
        if queue.len() >= self.inner.config.pending_size {
            warn!("[MAILRPC] mail station pending too much for: {}", call.server_id);
            return Some(call);
        }
        queue.push_back(call);
        None
    }

    fn reject(&self, rejected: Option<Call>) {
        if let Some(call) = rejected {
            let server_id = call.server_id.clone();
            call.resolve(Err(RpcError::PendingOverflow(server_id)));
        }
    }

    fn on_connected(&self, server_id: ServerId, mailbox: Arc<F::Mailbox>, closed: Option<Receiver<ServerId>>, result: Result<(), MailboxError>) {
        let mut state = self.lock();
        if let Err(e) = result {
            state.connecting.remove(&server_id);
            let pending = state.pending.remove(&server_id).unwrap_or_default();
            drop(state);
            error!("[MAILRPC] fail to connect to remote server {server_id}: {e}");
            let cause: Arc<str> = e.to_string().into();
            for call in pending {
                self.fail(ErrorCode::FailConnectServer, call, Some(cause.clone()));
            }
            return;
        }
        if state.lifecycle != Lifecycle::Started || !state.registry.is_online(&server_id) {
            state.connecting.remove(&server_id);
            let pending = state.pending.remove(&server_id).unwrap_or_default();
            drop(state);
            debug!("[MAILRPC] drop mailbox of {server_id} connected after it was no longer needed");
            mailbox.close();
            for call in pending {
                self.submit(call);
            }
            return;
        }
        state.mailboxes.insert(server_id.clone(), mailbox.clone());
        drop(state);

        if let Some(closed) = closed {
            tokio::spawn(watch_close(Arc::downgrade(&self.inner), server_id.clone(), Arc::downgrade(&mailbox), closed));
        }

        // Calls submitted during the replay keep queueing until the queue is drained.
        loop {
            let batch = {
                let mut state = self.lock();
                match state.pending.remove(&server_id) {
                    Some(batch) if !batch.is_empty() => batch,
                    _ => {
                        state.connecting.remove(&server_id);
                        break;
                    },
                }
            };
            for call in batch {
                self.deliver(call);
            }
        }
    }

    /// Runs the before filters, then hands the call to the mailbox of its (possibly rewritten) server.
    fn deliver(&self, mut call: Call) {
        let befores = self.inner.befores.read().unwrap_or_else(|e| e.into_inner()).clone();
        if !befores.is_empty() {
            match befores.run(Stage::Before, call.target()) {
                Ok(target) => call.retarget(target),
                Err((e, target)) => {
                    self.handle_filter_error(&e, &target);
                    self.fail(ErrorCode::FilterError, call, Some(e.to_string().into()));
                    return;
                },
            }
        }

        let mailbox = self.lock().mailboxes.get(&call.server_id).cloned();
        let Some(mailbox) = mailbox else {
            error!("[MAILRPC] could not find mailbox with id: {}", call.server_id);
            self.fail(ErrorCode::FailFindMailbox, call, None);
            return;
        };
        let reply = match mailbox.send(call.msg.clone(), &call.opts) {
            Ok(reply) => reply,
            Err(e) => {
                error!("[MAILRPC] fail to send message to {}: {e}", call.server_id);
                self.fail(ErrorCode::FailSendMessage, call, Some(e.to_string().into()));
                return;
            },
        };

        let station = self.clone();
        tokio::spawn(async move {
            match reply.await {
                Ok(Ok(resp)) => station.finish(call, resp),
                Ok(Err(e)) => {
                    error!("[MAILRPC] rpc to {} failed ({}): {e}", call.server_id, e.code());
                    station.fail(ErrorCode::FailSendMessage, call, Some(e.to_string().into()));
                },
                Err(_) => station.fail(ErrorCode::FailSendMessage, call, Some("reply dropped by mailbox".into())),
            }
        });
    }

    /// Runs the after filters and delivers the reply.
    fn finish(&self, call: Call, resp: Response) {
        let afters = self.inner.afters.read().unwrap_or_else(|e| e.into_inner()).clone();
        if !afters.is_empty() {
            if let Err((e, target)) = afters.run(Stage::After, call.target()) {
                self.handle_filter_error(&e, &target);
            }
        }
        call.resolve(Ok(resp));
    }

    fn handle_filter_error(&self, e: &crate::error::BoxError, target: &Target) {
        let handler = self.inner.error_handler.read().unwrap_or_else(|e| e.into_inner()).clone();
        match handler {
            Some(handler) => handler(e, target),
            None => error!("[MAILRPC] rpc filter error with serverId: {}, err: {e}", target.server_id),
        }
    }

    fn fail(&self, code: ErrorCode, call: Call, cause: Option<Arc<str>>) {
        self.inner.failure.process(self, code, call, cause);
    }
}

impl<F: MailboxFactory> Redispatch for MailStation<F> {
    fn redispatch(&self, call: Call) {
        self.submit(call);
    }

    fn candidates(&self, server_type: &str) -> Vec<ServerId> {
        self.servers_of(server_type).into_iter().map(|s| s.id).collect()
    }
}

/// Drops the mailbox from the station once it reports closing.
async fn watch_close<F: MailboxFactory>(station: Weak<Inner<F>>, server_id: ServerId, mailbox: Weak<F::Mailbox>, mut closed: Receiver<ServerId>) {
    let _ = closed.recv().await;
    let Some(inner) = station.upgrade() else {
        return;
    };
    let removed = {
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = state.mailboxes.get(&server_id).map(Arc::downgrade);
        if current.is_some_and(|current| current.ptr_eq(&mailbox)) {
            state.mailboxes.remove(&server_id);
            true
        } else {
            false
        }
    };
    if removed {
        debug!("[MAILRPC] mailbox of {server_id} closed");
    }
    let _ = inner.events.try_broadcast(StationEvent::MailboxClosed(server_id));
}

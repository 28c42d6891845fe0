// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Per-server connections used by the mail station.

pub mod blackhole;
pub mod inflight;
pub mod tcp;

pub use blackhole::{BlackholeFactory, BlackholeMailbox};
pub use inflight::Inflight;
pub use tcp::{TcpMailbox, TcpMailboxFactory};

use crate::config::ClientConfig;
use crate::error::MailboxError;
use crate::message::{CallOptions, Response, RpcMessage};
use crate::registry::ServerDescriptor;
use crate::ServerId;
use async_broadcast::Receiver;
use std::future::Future;
use tokio::sync::oneshot;

/// What a mailbox eventually delivers for one request.
pub type Reply = Result<Response, MailboxError>;

/// Resolves once the reply, timeout or disconnect of a request is known.
pub type ReplyReceiver = oneshot::Receiver<Reply>;

/// [`Mailbox`] is a connection to one remote server.
///
/// A mailbox goes `unconnected -> connected -> closed` and never back. Requests get ids that
/// grow monotonically per mailbox; each one resolves exactly once, with the reply, with
/// [`MailboxError::Timeout`] when its deadline passes, or with a disconnect error.
pub trait Mailbox: Send + Sync + 'static {
    /// The server this mailbox talks to.
    fn server_id(&self) -> &ServerId;

    /// Opens the transport. Fails with [`MailboxError::AlreadyConnected`] when called twice.
    fn connect(&self) -> impl Future<Output = Result<(), MailboxError>> + Send;

    /// Registers a request and hands it to the transport.
    ///
    /// Registration is synchronous, so requests submitted in order are written in order.
    fn send(&self, msg: RpcMessage, opts: &CallOptions) -> Result<ReplyReceiver, MailboxError>;

    /// Releases the transport and fails every outstanding request. Idempotent.
    fn close(&self);

    /// `watch_close` should return a [`async_broadcast::Receiver`] that yields the server id once
    /// the mailbox closes, whether by [`Mailbox::close`] or by a transport failure.
    fn watch_close(&self) -> Option<Receiver<ServerId>>;
}

/// [`MailboxFactory`] creates the mailbox of a server on first use.
pub trait MailboxFactory: Send + Sync + 'static {
    /// The mailbox type produced.
    type Mailbox: Mailbox;

    /// Creates an unconnected mailbox.
    fn create(&self, server: &ServerDescriptor, config: &ClientConfig) -> Self::Mailbox;
}

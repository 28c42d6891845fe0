// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! A mailbox that never connects.

use super::{Mailbox, MailboxFactory, ReplyReceiver};
use crate::config::ClientConfig;
use crate::error::MailboxError;
use crate::message::{CallOptions, RpcMessage};
use crate::registry::ServerDescriptor;
use crate::ServerId;
use async_broadcast::Receiver;
use std::future::Future;
use std::io;

/// [`BlackholeMailbox`] fails every connect and send.
///
/// Stands in for servers that must stay unreachable, e.g. while they are being drained.
#[derive(Debug, Clone)]
pub struct BlackholeMailbox {
    server_id: ServerId,
}

impl BlackholeMailbox {
    /// Returns a blackhole for `server_id`.
    pub fn new(server_id: impl Into<ServerId>) -> Self {
        Self { server_id: server_id.into() }
    }
}

impl Mailbox for BlackholeMailbox {
    fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    fn connect(&self) -> impl Future<Output = Result<(), MailboxError>> + Send {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, format!("blackhole mailbox of {}", self.server_id));
        async move { Err(err.into()) }
    }

    fn send(&self, _msg: RpcMessage, _opts: &CallOptions) -> Result<ReplyReceiver, MailboxError> {
        Err(MailboxError::NotConnected)
    }

    fn close(&self) {}

    fn watch_close(&self) -> Option<Receiver<ServerId>> {
        None
    }
}

/// Creates [`BlackholeMailbox`]es.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlackholeFactory;

impl MailboxFactory for BlackholeFactory {
    type Mailbox = BlackholeMailbox;

    fn create(&self, server: &ServerDescriptor, _config: &ClientConfig) -> BlackholeMailbox {
        BlackholeMailbox::new(server.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn never_connects() {
        let mailbox = BlackholeFactory.create(&ServerDescriptor::new("s1", "chat", "127.0.0.1", 1), &ClientConfig::default());
        assert_matches!(mailbox.connect().await, Err(MailboxError::Io(e)) if e.kind() == io::ErrorKind::ConnectionRefused);
        assert_matches!(mailbox.send(RpcMessage::new("sys", "chat", "r", "m"), &CallOptions::default()), Err(MailboxError::NotConnected));
        assert!(mailbox.watch_close().is_none());
    }
}

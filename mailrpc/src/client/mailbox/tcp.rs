// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Stream mailbox over TCP.
//!
//! Requests are written as JSON [`RequestEnvelope`]s inside composer frames; replies come back as
//! [`ResponseEnvelope`]s. With `buffer_msg` set, requests are queued and written as one JSON array
//! every `interval`.

use super::{Inflight, Mailbox, MailboxFactory, ReplyReceiver};
use crate::config::{ClientConfig, MIN_KEEPALIVE};
use crate::error::MailboxError;
use crate::message::{CallOptions, Packet, RequestEnvelope, ResponseEnvelope, RpcMessage};
use crate::registry::ServerDescriptor;
use crate::transport::{Composer, JsonCodec};
use crate::ServerId;
use async_broadcast::{InactiveReceiver, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

type Reader = FramedRead<OwnedReadHalf, JsonCodec<Packet<ResponseEnvelope>, ()>>;
type Writer = FramedWrite<OwnedWriteHalf, JsonCodec<(), Packet<RequestEnvelope>>>;

/// Transport settings of a [`TcpMailbox`].
#[derive(Debug, Clone)]
struct TcpConfig {
    timeout: Duration,
    buffer_msg: bool,
    interval: Duration,
    keepalive: Duration,
    pkg_size: Option<usize>,
}

impl From<&ClientConfig> for TcpConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            timeout: config.timeout,
            buffer_msg: config.buffer_msg,
            interval: config.interval,
            keepalive: config.keepalive,
            pkg_size: config.pkg_size,
        }
    }
}

enum Conn {
    Unconnected,
    Connecting,
    Connected {
        outbox: mpsc::UnboundedSender<RequestEnvelope>,
        tasks: Vec<JoinHandle<()>>,
    },
    Closed,
}

struct Shared {
    server: ServerDescriptor,
    config: TcpConfig,
    inflight: Arc<Inflight>,
    conn: Mutex<Conn>,
    close_tx: Sender<ServerId>,
    close_rx: InactiveReceiver<ServerId>,
}

impl Shared {
    fn conn(&self) -> std::sync::MutexGuard<'_, Conn> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves to `Closed` once: stops the tasks, fails every request, notifies watchers.
    fn shutdown(&self, err: MailboxError) {
        let prev = std::mem::replace(&mut *self.conn(), Conn::Closed);
        match prev {
            Conn::Closed => return,
            Conn::Connected { tasks, .. } => {
                for task in tasks {
                    task.abort();
                }
            },
            Conn::Unconnected | Conn::Connecting => {},
        }
        debug!("[MAILRPC] mailbox of {} closed: {err}", self.server.id);
        self.inflight.fail_all(err);
        let _ = self.close_tx.try_broadcast(self.server.id.clone());
    }
}

/// [`TcpMailbox`] is a [`Mailbox`] over one TCP connection.
pub struct TcpMailbox {
    shared: Arc<Shared>,
}

impl TcpMailbox {
    /// Returns an unconnected mailbox for `server`.
    pub fn new(server: ServerDescriptor, config: &ClientConfig) -> Self {
        let (mut close_tx, close_rx) = async_broadcast::broadcast(1);
        close_tx.set_overflow(true);
        Self {
            shared: Arc::new(Shared {
                server,
                config: TcpConfig::from(config),
                inflight: Arc::new(Inflight::new()),
                conn: Mutex::new(Conn::Unconnected),
                close_tx,
                close_rx: close_rx.deactivate(),
            }),
        }
    }

    /// Requests awaiting a reply.
    pub fn inflight(&self) -> usize {
        self.shared.inflight.len()
    }

    fn composer(&self) -> Composer {
        Composer::new().with_max_length(self.shared.config.pkg_size)
    }

    async fn open(&self) -> Result<TcpStream, MailboxError> {
        let stream = TcpStream::connect(self.shared.server.address()).await?;
        stream.set_nodelay(true)?;
        if let Some(idle) = keepalive_idle(self.shared.config.keepalive) {
            SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(stream)
    }

    async fn establish(&self) -> Result<(), MailboxError> {
        {
            let mut conn = self.shared.conn();
            match *conn {
                Conn::Unconnected => *conn = Conn::Connecting,
                Conn::Closed => return Err(MailboxError::Closed),
                _ => return Err(MailboxError::AlreadyConnected),
            }
        }
        let stream = match self.open().await {
            Ok(stream) => stream,
            Err(e) => {
                let mut conn = self.shared.conn();
                if let Conn::Connecting = *conn {
                    *conn = Conn::Unconnected;
                }
                return Err(e);
            },
        };
        let (read, write) = stream.into_split();
        let reader = FramedRead::new(read, JsonCodec::new(self.composer()));
        let writer = FramedWrite::new(write, JsonCodec::new(self.composer()));
        let (outbox, queue) = mpsc::unbounded_channel();

        let mut conn = self.shared.conn();
        if !matches!(*conn, Conn::Connecting) {
            return Err(MailboxError::Closed);
        }
        let tasks = vec![
            tokio::spawn(self.shared.inflight.clone().run_timer()),
            tokio::spawn(read_loop(self.shared.clone(), reader)),
            tokio::spawn(write_loop(self.shared.clone(), writer, queue)),
        ];
        *conn = Conn::Connected { outbox, tasks };
        debug!("[MAILRPC] mailbox connected to {} at {}", self.shared.server.id, self.shared.server.address());
        Ok(())
    }
}

impl Drop for TcpMailbox {
    fn drop(&mut self) {
        self.shared.shutdown(MailboxError::Closed);
    }
}

impl Mailbox for TcpMailbox {
    fn server_id(&self) -> &ServerId {
        &self.shared.server.id
    }

    fn connect(&self) -> impl Future<Output = Result<(), MailboxError>> + Send {
        self.establish()
    }

    fn send(&self, msg: RpcMessage, opts: &CallOptions) -> Result<ReplyReceiver, MailboxError> {
        let conn = self.shared.conn();
        let outbox = match &*conn {
            Conn::Connected { outbox, .. } => outbox,
            Conn::Closed => return Err(MailboxError::Closed),
            Conn::Unconnected | Conn::Connecting => return Err(MailboxError::NotConnected),
        };
        let (id, reply) = self.shared.inflight.register(opts.timeout.unwrap_or(self.shared.config.timeout))?;
        if outbox.send(RequestEnvelope { id, msg }).is_err() {
            self.shared.inflight.fail(id, MailboxError::Closed);
            return Err(MailboxError::Closed);
        }
        Ok(reply)
    }

    fn close(&self) {
        self.shared.shutdown(MailboxError::Disconnected(self.shared.server.id.clone()));
    }

    fn watch_close(&self) -> Option<Receiver<ServerId>> {
        Some(self.shared.close_rx.activate_cloned())
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: Reader) {
    let err = loop {
        match reader.next().await {
            Some(Ok(packet)) => {
                for envelope in packet.into_vec() {
                    if !shared.inflight.complete(envelope.id, envelope.resp) {
                        warn!("[MAILRPC] reply {} from {} matches no request", envelope.id, shared.server.id);
                    }
                }
            },
            Some(Err(e)) => {
                error!("[MAILRPC] mailbox of {} failed to read: {e}", shared.server.id);
                break MailboxError::Disconnected(shared.server.id.clone());
            },
            None => break MailboxError::Disconnected(shared.server.id.clone()),
        }
    };
    shared.shutdown(err);
}

async fn write_loop(shared: Arc<Shared>, mut writer: Writer, mut queue: mpsc::UnboundedReceiver<RequestEnvelope>) {
    let result = if shared.config.buffer_msg {
        write_buffered(&mut writer, &mut queue, shared.config.interval).await
    } else {
        write_each(&mut writer, &mut queue).await
    };
    if let Err(e) = result {
        error!("[MAILRPC] mailbox of {} failed to write: {e}", shared.server.id);
        shared.shutdown(e.into());
    }
}

async fn write_each(writer: &mut Writer, queue: &mut mpsc::UnboundedReceiver<RequestEnvelope>) -> std::io::Result<()> {
    while let Some(envelope) = queue.recv().await {
        writer.send(Packet::One(envelope)).await?;
    }
    Ok(())
}

async fn write_buffered(writer: &mut Writer, queue: &mut mpsc::UnboundedReceiver<RequestEnvelope>, interval: Duration) -> std::io::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut batch = Vec::new();
    loop {
        tokio::select! {
            envelope = queue.recv() => match envelope {
                Some(envelope) => batch.push(envelope),
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    writer.send(Packet::Batch(std::mem::take(&mut batch))).await?;
                }
            },
        }
    }
    if !batch.is_empty() {
        writer.send(Packet::Batch(batch)).await?;
    }
    Ok(())
}

/// The keepalive idle time to set on the socket. Zero means off; the socket option counts whole
/// seconds, so shorter values are raised to [`MIN_KEEPALIVE`].
fn keepalive_idle(keepalive: Duration) -> Option<Duration> {
    if keepalive.is_zero() {
        None
    } else {
        Some(keepalive.max(MIN_KEEPALIVE))
    }
}

/// Creates [`TcpMailbox`]es.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpMailboxFactory;

impl MailboxFactory for TcpMailboxFactory {
    type Mailbox = TcpMailbox;

    fn create(&self, server: &ServerDescriptor, config: &ClientConfig) -> TcpMailbox {
        TcpMailbox::new(server.clone(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::net::TcpListener;

    type ServerReader = FramedRead<OwnedReadHalf, JsonCodec<Packet<RequestEnvelope>, ()>>;
    type ServerWriter = FramedWrite<OwnedWriteHalf, JsonCodec<(), Packet<ResponseEnvelope>>>;

    async fn accept(listener: &TcpListener) -> (ServerReader, ServerWriter) {
        let (stream, _) = listener.accept().await.unwrap();
        let (r, w) = stream.into_split();
        (FramedRead::new(r, JsonCodec::default()), FramedWrite::new(w, JsonCodec::default()))
    }

    async fn listen() -> (TcpListener, ServerDescriptor) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, ServerDescriptor::new("chat-1", "chat", "127.0.0.1", port))
    }

    #[tokio::test]
    async fn request_and_reply() {
        let (listener, server) = listen().await;
        let mailbox = TcpMailbox::new(server, &ClientConfig::default());
        let (connected, (mut rx, mut tx)) = tokio::join!(mailbox.connect(), accept(&listener));
        connected.unwrap();
        assert_matches!(mailbox.connect().await, Err(MailboxError::AlreadyConnected));

        let reply = mailbox.send(RpcMessage::new("user", "chat", "chatRemote", "add").with_args(vec![json!("tom")]), &CallOptions::default()).unwrap();
        let request = rx.next().await.unwrap().unwrap().into_vec().remove(0);
        assert_eq!(request.id, 1);
        assert_eq!(request.msg.args, vec![json!("tom")]);

        tx.send(Packet::One(ResponseEnvelope { id: request.id, resp: Response::ok(vec![json!("ok")]) })).await.unwrap();
        assert_eq!(reply.await.unwrap().unwrap().values(), &[json!("ok")]);
    }

    #[tokio::test]
    async fn buffered_requests_arrive_as_one_batch() {
        let (listener, server) = listen().await;
        let config = ClientConfig::default().with_buffer_msg(true).with_interval(Duration::from_millis(20));
        let mailbox = TcpMailbox::new(server, &config);
        let (connected, (mut rx, _tx)) = tokio::join!(mailbox.connect(), accept(&listener));
        connected.unwrap();

        let msg = RpcMessage::new("user", "chat", "chatRemote", "add");
        let _a = mailbox.send(msg.clone(), &CallOptions::default()).unwrap();
        let _b = mailbox.send(msg, &CallOptions::default()).unwrap();
        let packet = rx.next().await.unwrap().unwrap();
        assert_matches!(&packet, Packet::Batch(items) if items.iter().map(|r| r.id).collect::<Vec<_>>() == vec![1, 2]);
    }

    #[tokio::test]
    async fn peer_disconnect_fails_outstanding_and_notifies() {
        let (listener, server) = listen().await;
        let mailbox = TcpMailbox::new(server, &ClientConfig::default());
        let mut closed = mailbox.watch_close().unwrap();
        let (connected, (rx, tx)) = tokio::join!(mailbox.connect(), accept(&listener));
        connected.unwrap();

        let reply = mailbox.send(RpcMessage::new("user", "chat", "chatRemote", "add"), &CallOptions::default()).unwrap();
        drop((rx, tx));
        assert_matches!(reply.await.unwrap(), Err(MailboxError::Disconnected(id)) if id == "chat-1");
        assert_eq!(closed.recv().await.unwrap(), "chat-1");
        assert_matches!(mailbox.send(RpcMessage::new("user", "chat", "chatRemote", "add"), &CallOptions::default()), Err(MailboxError::Closed));
    }

    #[tokio::test]
    async fn unreachable_server_can_retry_connect() {
        let (listener, server) = listen().await;
        drop(listener);
        let mailbox = TcpMailbox::new(server, &ClientConfig::default());
        assert_matches!(mailbox.connect().await, Err(MailboxError::Io(_)));
        assert_matches!(mailbox.send(RpcMessage::new("user", "chat", "r", "m"), &CallOptions::default()), Err(MailboxError::NotConnected));
    }

    #[test]
    fn keepalive_idle_is_whole_seconds_or_off() {
        assert_eq!(keepalive_idle(Duration::ZERO), None);
        assert_eq!(keepalive_idle(Duration::from_millis(500)), Some(Duration::from_secs(1)));
        assert_eq!(keepalive_idle(Duration::from_secs(10)), Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn short_or_disabled_keepalive_still_connects() {
        for keepalive in [Duration::ZERO, Duration::from_millis(500)] {
            let (listener, server) = listen().await;
            let mailbox = TcpMailbox::new(server, &ClientConfig::default().with_keepalive(keepalive));
            let (connected, _peer) = tokio::join!(mailbox.connect(), accept(&listener));
            assert!(connected.is_ok(), "keepalive {keepalive:?}: {connected:?}");
        }
    }

    #[tokio::test]
    async fn request_deadline_from_options() {
        let (listener, server) = listen().await;
        let mailbox = TcpMailbox::new(server, &ClientConfig::default());
        let (connected, _peer) = tokio::join!(mailbox.connect(), accept(&listener));
        connected.unwrap();
        let reply = mailbox
            .send(RpcMessage::new("user", "chat", "r", "m"), &CallOptions::default().with_timeout(Duration::from_millis(30)))
            .unwrap();
        assert_matches!(reply.await.unwrap(), Err(MailboxError::Timeout));
        assert_eq!(mailbox.inflight(), 0);
    }
}

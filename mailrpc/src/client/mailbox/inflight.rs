// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Requests awaiting a reply, with their deadlines.

use super::{Reply, ReplyReceiver};
use crate::error::MailboxError;
use crate::message::Response;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

struct Pending {
    deadline: Instant,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    pending: HashMap<u64, Pending>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    closed: bool,
}

enum Next {
    Closed,
    Idle,
    At(Instant),
}

/// [`Inflight`] maps request ids to reply senders.
///
/// Ids grow monotonically from 1. Deadlines live in one min-heap serviced by [`Inflight::run_timer`];
/// heap entries of requests that already completed are skipped when they surface.
#[derive(Default)]
pub struct Inflight {
    state: Mutex<State>,
    notify: Notify,
}

impl Inflight {
    /// Returns an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocates the next id and registers its reply, due after `timeout`.
    pub fn register(&self, timeout: Duration) -> Result<(u64, ReplyReceiver), MailboxError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            return Err(MailboxError::Closed);
        }
        state.next_id += 1;
        let id = state.next_id;
        let deadline = Instant::now() + timeout;
        let wake = state.deadlines.peek().map_or(true, |Reverse((first, _))| deadline < *first);
        state.pending.insert(id, Pending { deadline, reply: tx });
        state.deadlines.push(Reverse((deadline, id)));
        drop(state);
        if wake {
            self.notify.notify_one();
        }
        Ok((id, rx))
    }

    /// Delivers a reply. Returns false for an unknown or expired id.
    pub fn complete(&self, id: u64, resp: Response) -> bool {
        match self.lock().pending.remove(&id) {
            Some(p) => {
                let _ = p.reply.send(Ok(resp));
                true
            },
            None => false,
        }
    }

    /// Fails one request.
    pub fn fail(&self, id: u64, err: MailboxError) {
        if let Some(p) = self.lock().pending.remove(&id) {
            let _ = p.reply.send(Err(err));
        }
    }

    /// Fails every outstanding request and refuses new ones.
    pub fn fail_all(&self, err: MailboxError) {
        let pending = {
            let mut state = self.lock();
            state.closed = true;
            state.deadlines.clear();
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!("[MAILRPC] failing {} outstanding requests: {err}", pending.len());
        }
        for (_, p) in pending {
            let _ = p.reply.send(Err(err.clone()));
        }
        self.notify.notify_one();
    }

    /// Number of requests awaiting a reply.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether no request awaits a reply.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Times out every request due at `now` and reports when to look again.
    fn expire(&self, now: Instant) -> Next {
        let mut expired = Vec::new();
        let next = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.closed {
                return Next::Closed;
            }
            loop {
                match state.deadlines.peek() {
                    Some(Reverse((deadline, _))) if *deadline <= now => {
                        let Some(Reverse((_, id))) = state.deadlines.pop() else { break Next::Idle };
                        if let Some(p) = state.pending.remove(&id) {
                            if p.deadline <= now {
                                expired.push((id, p.reply));
                            } else {
                                state.pending.insert(id, p);
                            }
                        }
                    },
                    Some(Reverse((deadline, _))) => break Next::At(*deadline),
                    None => break Next::Idle,
                }
            }
        };
        for (id, reply) in expired {
            trace!("[MAILRPC] request {id} timed out");
            let _ = reply.send(Err(MailboxError::Timeout));
        }
        next
    }

    /// Expires requests as their deadlines pass, until [`Inflight::fail_all`] is called.
    pub async fn run_timer(self: Arc<Self>) {
        loop {
            match self.expire(Instant::now()) {
                Next::Closed => return,
                Next::Idle => self.notify.notified().await,
                Next::At(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {},
                        _ = self.notify.notified() => {},
                    }
                },
            }
        }
    }
}

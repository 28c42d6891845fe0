// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Before and after filters.

use crate::error::BoxError;
use crate::message::{CallOptions, RpcMessage};
use crate::ServerId;
use std::sync::Arc;

/// What a filter may inspect and rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Server the call goes to.
    pub server_id: ServerId,
    /// The call.
    pub msg: RpcMessage,
    /// Per-call options.
    pub opts: CallOptions,
}

/// [`Filter`] runs around every dispatch.
///
/// Returning `Ok` passes the (possibly rewritten) target to the next filter; returning `Err`
/// stops the chain.
///
/// Hooks are synchronous. `before` runs on the task that dispatches the call and `after` on the
/// task that receives the reply, so a hook must not block or wait on I/O. Work that needs to
/// await belongs before the dispatch, or in a task fed by the filter:
///
/// ```
/// use mailrpc::client::station::{Filter, Target};
/// use mailrpc::error::BoxError;
/// use mailrpc::{CallOptions, RpcMessage};
/// use tokio::sync::mpsc;
///
/// struct Audit(mpsc::UnboundedSender<String>);
///
/// impl Filter for Audit {
///     fn after(&self, target: Target) -> Result<Target, BoxError> {
///         self.0.send(target.msg.route_name())?;
///         Ok(target)
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), BoxError> {
/// let (tx, mut rx) = mpsc::unbounded_channel();
/// let audit = Audit(tx);
/// let target = Target {
///     server_id: "chat-1".into(),
///     msg: RpcMessage::new("user", "chat", "chatRemote", "add"),
///     opts: CallOptions::default(),
/// };
/// audit.after(target)?;
/// assert_eq!(rx.recv().await.as_deref(), Some("user.chatRemote.add"));
/// # Ok(())
/// # }
/// ```
pub trait Filter: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Runs before the message is handed to the mailbox. An error aborts the dispatch.
    fn before(&self, target: Target) -> Result<Target, BoxError> {
        Ok(target)
    }

    /// Runs after the reply arrived. An error is reported, the reply is still delivered.
    fn after(&self, target: Target) -> Result<Target, BoxError> {
        Ok(target)
    }
}

/// Called with filter errors, instead of logging them.
pub type ErrorHandler = Arc<dyn Fn(&BoxError, &Target) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Before,
    After,
}

/// An ordered list of filters.
#[derive(Clone, Default)]
pub(crate) struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub(crate) fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the filters in order. The error carries the target as it was when the chain stopped.
    pub(crate) fn run(&self, stage: Stage, mut target: Target) -> Result<Target, (BoxError, Target)> {
        for filter in &self.filters {
            let snapshot = target.clone();
            let result = match stage {
                Stage::Before => filter.before(target),
                Stage::After => filter.after(target),
            };
            target = match result {
                Ok(next) => next,
                Err(e) => {
                    tracing::debug!("[MAILRPC] {stage:?} filter {} stopped {}", filter.name(), snapshot.server_id);
                    return Err((e, snapshot));
                },
            };
        }
        Ok(target)
    }
}

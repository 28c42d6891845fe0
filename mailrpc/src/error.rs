// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Error types shared by the station, mailboxes and routers.

use crate::service::ServiceError;
use crate::ServerId;
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// A type-erased error, as returned by filters and error handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a dispatch failed. Selects the failure processor branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The station has not been started, or was stopped.
    ServerNotStarted,
    /// The target server is unknown or offline.
    NoTargetServer,
    /// The lazy connect to the target server failed.
    FailConnectServer,
    /// The mailbox disappeared between the filter chain and the send.
    FailFindMailbox,
    /// The mailbox rejected the send or the request failed in flight.
    FailSendMessage,
    /// A before filter aborted the dispatch.
    FilterError,
    /// The reply deadline passed.
    CallbackTimeout,
}

impl ErrorCode {
    /// The stable wire name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ServerNotStarted => "SERVER_NOT_STARTED",
            ErrorCode::NoTargetServer => "NO_TARGET_SERVER",
            ErrorCode::FailConnectServer => "FAIL_CONNECT_SERVER",
            ErrorCode::FailFindMailbox => "FAIL_FIND_MAILBOX",
            ErrorCode::FailSendMessage => "FAIL_SEND_MESSAGE",
            ErrorCode::FilterError => "FILTER_ERROR",
            ErrorCode::CallbackTimeout => "CALLBACK_TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by a [`Mailbox`](crate::client::mailbox::Mailbox).
///
/// Cloneable so that one transport failure can be delivered to every outstanding request.
#[derive(Error, Debug, Clone)]
pub enum MailboxError {
    /// The underlying transport failed.
    #[error("mailbox io error: {0}")]
    Io(Arc<io::Error>),
    /// No reply arrived before the request deadline.
    #[error("request timeout")]
    Timeout,
    /// The transport to the server went away while the request was in flight.
    #[error("disconnected from server {0}")]
    Disconnected(ServerId),
    /// `send` was called before `connect` succeeded.
    #[error("mailbox is not connected")]
    NotConnected,
    /// `send` was called after `close`.
    #[error("mailbox is closed")]
    Closed,
    /// `connect` was called twice.
    #[error("mailbox has already connected")]
    AlreadyConnected,
    /// The payload could not be encoded or decoded.
    #[error("mailbox codec error: {0}")]
    Codec(String),
}

impl MailboxError {
    /// The error code a station reports for this mailbox failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            MailboxError::Timeout => ErrorCode::CallbackTimeout,
            _ => ErrorCode::FailSendMessage,
        }
    }
}

impl From<io::Error> for MailboxError {
    fn from(e: io::Error) -> Self {
        MailboxError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for MailboxError {
    fn from(e: serde_json::Error) -> Self {
        MailboxError::Codec(e.to_string())
    }
}

/// Router failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No server is registered for the type.
    #[error("no servers available for server type: {0}")]
    NoServers(String),
    /// Weighted round robin found no server with a positive weight.
    #[error("no positive weight configured for server type: {0}")]
    InvalidWeight(String),
}

/// Station lifecycle misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StationError {
    /// `start` was called on a station that is not freshly created.
    #[error("mail station has already started")]
    AlreadyStarted,
    /// The station was stopped.
    #[error("mail station has been closed")]
    Closed,
}

/// The single error a caller of a dispatch receives.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// The failure processor gave up on the dispatch.
    #[error("rpc failed with {code} on server {server_id}{}", cause_suffix(.cause))]
    Failed {
        /// The failure branch that ended the dispatch.
        code: ErrorCode,
        /// The last server tried.
        server_id: ServerId,
        /// The mailbox or filter failure, when there was one.
        cause: Option<Arc<str>>,
    },
    /// The server could not be reached within the configured retries.
    #[error("rpc failed after {retries} retries on server {server_id}: {code}")]
    RetriesExhausted {
        /// The failure branch of the last attempt.
        code: ErrorCode,
        /// The server tried last.
        server_id: ServerId,
        /// Retries performed.
        retries: u32,
    },
    /// Failover ran out of candidates.
    #[error("rpc failed on every server of type {server_type}: {code}")]
    AllServersFailed {
        /// The failure branch of the last attempt.
        code: ErrorCode,
        /// The server type whose pool was exhausted.
        server_type: String,
    },
    /// The per-server pending queue was full while connecting.
    #[error("pending queue of server {0} is full")]
    PendingOverflow(ServerId),
    /// The router could not pick a server.
    #[error(transparent)]
    Route(#[from] RouteError),
    /// The message names no registered service or method.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// The station dropped the call without replying, e.g. on shutdown.
    #[error("rpc call was dropped by the mail station")]
    Canceled,
}

fn cause_suffix(cause: &Option<Arc<str>>) -> String {
    match cause {
        Some(c) => format!(": {c}"),
        None => String::new(),
    }
}

impl RpcError {
    /// The error code behind this failure, if it came out of the failure processor.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RpcError::Failed { code, .. } | RpcError::RetriesExhausted { code, .. } | RpcError::AllServersFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_display_carries_cause() {
        let err = RpcError::Failed {
            code: ErrorCode::FailSendMessage,
            server_id: "connector-1".into(),
            cause: Some("request timeout".into()),
        };
        assert_eq!(err.to_string(), "rpc failed with FAIL_SEND_MESSAGE on server connector-1: request timeout");
        assert_eq!(err.code(), Some(ErrorCode::FailSendMessage));
    }

    #[test]
    fn timeout_maps_to_callback_timeout() {
        assert_eq!(MailboxError::Timeout.code(), ErrorCode::CallbackTimeout);
        assert_eq!(MailboxError::Disconnected("a".into()).code(), ErrorCode::FailSendMessage);
    }
}

// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! RPC messages and the envelopes that carry them over a mailbox.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// An outgoing call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcMessage {
    /// Namespace of the remote service, e.g. `sys` or `user`.
    pub namespace: String,
    /// Type of the server expected to handle the call.
    pub server_type: String,
    /// Service name within the namespace.
    pub service: String,
    /// Method name within the service.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RpcMessage {
    /// Returns a message without arguments.
    pub fn new(namespace: impl Into<String>, server_type: impl Into<String>, service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            server_type: server_type.into(),
            service: service.into(),
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Sets the positional arguments.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// `namespace.service.method`
    pub fn route_name(&self) -> String {
        format!("{}.{}.{}", self.namespace, self.service, self.method)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Overrides the mailbox reply deadline for this call.
    pub timeout: Option<Duration>,
    /// Session affinity key handed to the router, usually a user id.
    pub route_param: Option<String>,
}

impl CallOptions {
    /// Sets the reply deadline for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the key routers use for session affinity.
    pub fn with_route_param(mut self, route_param: impl Into<String>) -> Self {
        self.route_param = Some(route_param.into());
        self
    }
}

/// The reply to a call: an error slot followed by the result values.
///
/// On the wire this is a JSON array `[error, value...]` where `error` is `null` on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response(pub Vec<Value>);

impl Response {
    /// A successful reply carrying `values`.
    pub fn ok(values: Vec<Value>) -> Self {
        let mut v = Vec::with_capacity(values.len() + 1);
        v.push(Value::Null);
        v.extend(values);
        Self(v)
    }

    /// A failed reply.
    pub fn err(error: Value) -> Self {
        Self(vec![error])
    }

    /// The application error, if the server reported one.
    pub fn error(&self) -> Option<&Value> {
        self.0.first().filter(|v| !v.is_null())
    }

    /// The result values after the error slot.
    pub fn values(&self) -> &[Value] {
        self.0.get(1..).unwrap_or_default()
    }

    /// Splits the reply into the result values or the application error.
    pub fn into_result(mut self) -> Result<Vec<Value>, Value> {
        if self.0.is_empty() {
            return Ok(Vec::new());
        }
        let error = self.0.remove(0);
        if error.is_null() {
            Ok(self.0)
        } else {
            Err(error)
        }
    }
}

/// A request as written to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Per-mailbox request id.
    pub id: u64,
    /// The call.
    pub msg: RpcMessage,
}

/// A reply as read from the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Id of the request being answered.
    pub id: u64,
    /// The reply.
    pub resp: Response,
}

/// One frame: a single envelope, or a batch when the sender buffers messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Packet<T> {
    /// A batch flushed by a buffering mailbox.
    Batch(Vec<T>),
    /// A single envelope.
    One(T),
}

impl<T> Packet<T> {
    /// Flattens the packet into its envelopes.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Packet::Batch(items) => items,
            Packet::One(item) => vec![item],
        }
    }
}

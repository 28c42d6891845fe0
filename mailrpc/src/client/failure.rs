// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! What happens to a call after a dispatch error.

use crate::client::station::Call;
use crate::config::ClientConfig;
use crate::error::{ErrorCode, RpcError};
use crate::ServerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Failure handling strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Report the failure to the caller at once.
    #[default]
    FailFast,
    /// Try the other servers of the same type, each at most once per call.
    FailOver,
    /// Retry the same server with a linear backoff, up to `retry_times`.
    FailSafe,
}

/// The station capabilities a failure processor needs to retry a call.
pub trait Redispatch: Clone + Send + Sync + 'static {
    /// Submits the call again, to `call.server_id`.
    fn redispatch(&self, call: Call);
    /// Online server ids of a type, in registration order.
    fn candidates(&self, server_type: &str) -> Vec<ServerId>;
}

/// [`FailureProcessor`] turns a dispatch error into a retry or a terminal error.
#[derive(Debug, Clone)]
pub struct FailureProcessor {
    mode: FailMode,
    retry_times: u32,
    retry_connect_time: Duration,
}

impl Default for FailureProcessor {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl FailureProcessor {
    /// Returns a processor for `mode` with default retry settings.
    pub fn new(mode: FailMode) -> Self {
        Self::from_config(&ClientConfig::default().with_fail_mode(mode))
    }

    /// Returns a processor configured by `fail_mode`, `retry_times` and `retry_connect_time`.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            mode: config.fail_mode,
            retry_times: config.retry_times,
            retry_connect_time: config.retry_connect_time,
        }
    }

    /// The configured mode.
    pub fn mode(&self) -> FailMode {
        self.mode
    }

    /// Handles one failed attempt of `call`.
    pub fn process<R: Redispatch>(&self, station: &R, code: ErrorCode, call: Call, cause: Option<Arc<str>>) {
        match self.mode {
            FailMode::FailFast => self.fail_fast(code, call, cause),
            FailMode::FailOver => self.fail_over(station, code, call),
            FailMode::FailSafe => self.fail_safe(station, code, call, cause),
        }
    }

    fn fail_fast(&self, code: ErrorCode, call: Call, cause: Option<Arc<str>>) {
        error!(
            "[MAILRPC] rpc failed with error, remote server: {}, route: {}, error code: {code}",
            call.server_id,
            call.msg.route_name()
        );
        let server_id = call.server_id.clone();
        call.resolve(Err(RpcError::Failed { code, server_id, cause }));
    }

    fn fail_over<R: Redispatch>(&self, station: &R, code: ErrorCode, mut call: Call) {
        let server_type = call.msg.server_type.clone();
        let mut candidates = match call.candidates.take() {
            Some(candidates) => candidates,
            None => station.candidates(&server_type),
        };
        candidates.retain(|id| id != &call.server_id);
        let Some(next) = candidates.first().cloned() else {
            error!("[MAILRPC] rpc failed with all this type of servers, with serverType: {server_type}");
            call.resolve(Err(RpcError::AllServersFailed { code, server_type }));
            return;
        };
        warn!("[MAILRPC] rpc to {} failed with {code}, failover to {next}", call.server_id);
        call.server_id = next;
        call.candidates = Some(candidates);
        station.redispatch(call);
    }

    fn fail_safe<R: Redispatch>(&self, station: &R, code: ErrorCode, mut call: Call, cause: Option<Arc<str>>) {
        call.retries += 1;
        match code {
            ErrorCode::FailConnectServer | ErrorCode::FailFindMailbox | ErrorCode::FailSendMessage if call.retries <= self.retry_times => {
                let delay = self.retry_connect_time * call.retries;
                warn!("[MAILRPC] rpc to {} failed with {code}, retry {} in {delay:?}", call.server_id, call.retries);
                let station = station.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    station.redispatch(call);
                });
            },
            ErrorCode::FailConnectServer | ErrorCode::FailFindMailbox | ErrorCode::FailSendMessage => {
                error!("[MAILRPC] rpc to {} failed with {code} after {} retries", call.server_id, self.retry_times);
                let server_id = call.server_id.clone();
                call.resolve(Err(RpcError::RetriesExhausted {
                    code,
                    server_id,
                    retries: self.retry_times,
                }));
            },
            _ => self.fail_fast(code, call, cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CallOptions, RpcMessage};
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        servers: Vec<ServerId>,
        redispatched: Arc<Mutex<Vec<(ServerId, u32)>>>,
    }

    impl Redispatch for Recorder {
        fn redispatch(&self, call: Call) {
            self.redispatched.lock().unwrap().push((call.server_id.clone(), call.retries));
        }

        fn candidates(&self, _server_type: &str) -> Vec<ServerId> {
            self.servers.clone()
        }
    }

    fn call(server_id: &str) -> (Call, tokio::sync::oneshot::Receiver<Result<crate::Response, RpcError>>) {
        Call::new(server_id.to_string(), RpcMessage::new("user", "chat", "chatRemote", "add"), CallOptions::default())
    }

    #[tokio::test]
    async fn fail_fast_reports_code() {
        let (c, rx) = call("chat-1");
        FailureProcessor::new(FailMode::FailFast).process(&Recorder::default(), ErrorCode::FailSendMessage, c, Some("boom".into()));
        assert_matches!(rx.await.unwrap(), Err(RpcError::Failed { code: ErrorCode::FailSendMessage, server_id, .. }) if server_id == "chat-1");
    }

    #[tokio::test]
    async fn fail_over_moves_to_next_candidate() {
        let station = Recorder {
            servers: vec!["chat-1".into(), "chat-2".into()],
            ..Default::default()
        };
        let (c, _rx) = call("chat-1");
        FailureProcessor::new(FailMode::FailOver).process(&station, ErrorCode::FailConnectServer, c, None);
        assert_eq!(station.redispatched.lock().unwrap().clone(), vec![("chat-2".to_string(), 0)]);
    }

    #[tokio::test]
    async fn fail_over_without_candidates_is_terminal() {
        let station = Recorder {
            servers: vec!["chat-1".into()],
            ..Default::default()
        };
        let (c, rx) = call("chat-1");
        FailureProcessor::new(FailMode::FailOver).process(&station, ErrorCode::FailSendMessage, c, None);
        assert_matches!(rx.await.unwrap(), Err(RpcError::AllServersFailed { server_type, .. }) if server_type == "chat");
    }

    #[tokio::test(start_paused = true)]
    async fn fail_safe_waits_linear_backoff() {
        let station = Recorder::default();
        let processor = FailureProcessor::from_config(&ClientConfig::default().with_fail_mode(FailMode::FailSafe).with_retry_connect_time(Duration::from_millis(100)));
        let (mut c, _rx) = call("chat-1");
        c.retries = 1;
        processor.process(&station, ErrorCode::FailSendMessage, c, None);

        tokio::time::sleep(Duration::from_millis(199)).await;
        assert!(station.redispatched.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(station.redispatched.lock().unwrap().clone(), vec![("chat-1".to_string(), 2)]);
    }

    #[tokio::test]
    async fn fail_safe_filter_error_is_terminal() {
        let station = Recorder::default();
        let (c, rx) = call("chat-1");
        FailureProcessor::new(FailMode::FailSafe).process(&station, ErrorCode::FilterError, c, None);
        assert_matches!(rx.await.unwrap(), Err(RpcError::Failed { code: ErrorCode::FilterError, .. }));
        assert!(station.redispatched.lock().unwrap().is_empty());
    }
}

// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! *Please note that this is not an official project.*
//!
//! mailrpc is the client side of a server-to-server RPC transport. Calls are addressed to a
//! server id, or routed over the servers of a type, and delivered through one lazily connected
//! mailbox per server.
//!
//! ## Usage
//!
//! ```no_run
//! use mailrpc::client::mailbox::TcpMailboxFactory;
//! use mailrpc::{ClientConfig, RpcClient, RpcMessage, ServerDescriptor};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = RpcClient::new(TcpMailboxFactory, ClientConfig::default())?;
//! client.add_server(ServerDescriptor::new("chat-1", "chat", "127.0.0.1", 3050));
//! client.start().await?;
//!
//! let msg = RpcMessage::new("user", "chat", "chatRemote", "add").with_args(vec!["room-1".into()]);
//! let resp = client.invoke(msg).await?;
//! println!("{:?}", resp.into_result());
//! # Ok(())
//! # }
//! ```
//!
//! The pieces:
//!
//! - [`client::station::MailStation`] owns the server registry and the mailboxes.
//! - [`client::mailbox::Mailbox`] is the per-server connection contract, with a TCP implementation.
//! - [`client::router`] picks servers: random, round robin, weighted, least active, consistent hash,
//!   crc32 of a route parameter.
//! - [`client::failure::FailureProcessor`] decides between failfast, failover and failsafe.
//! - [`transport::Composer`] frames payloads with a varint length prefix.

#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod registry;
pub mod service;
pub mod transport;

pub use client::failure::FailMode;
pub use client::router::{HashAlgorithm, RouterKind};
pub use client::station::{MailStation, StationEvent};
pub use client::RpcClient;
pub use config::ClientConfig;
pub use error::{ErrorCode, MailboxError, RpcError};
pub use message::{CallOptions, Response, RpcMessage};
pub use registry::{ServerDescriptor, ServerId};

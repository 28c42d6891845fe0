// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use mailrpc::client::mailbox::TcpMailboxFactory;
use mailrpc::{ClientConfig, RpcClient, RpcMessage, ServerDescriptor};
use serde_json::json;
use service::init_tracing;
use std::net::SocketAddr;

#[derive(Parser)]
struct Flags {
    /// Sets the server address to connect to.
    #[clap(long, default_value = "127.0.0.1:3050")]
    server_addr: SocketAddr,
    /// Sets the name to say hello to.
    #[clap(long, default_value = "mailrpc")]
    name: String,
    /// Loads the client configuration from a JSON file.
    #[clap(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Mailrpc Example Client")?;

    let config = match &flags.config {
        Some(path) => ClientConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ClientConfig::default(),
    };
    let client = RpcClient::new(TcpMailboxFactory, config)?;
    client.add_server(ServerDescriptor::new("chat-1", "chat", flags.server_addr.ip().to_string(), flags.server_addr.port()));
    client.start().await?;

    let hello = RpcMessage::new("user", "chat", "chatRemote", "add").with_args(vec![json!(flags.name)]);
    match client.invoke(hello).await?.into_result() {
        Ok(values) => tracing::info!("{values:?}"),
        Err(e) => tracing::warn!("remote error: {e}"),
    }

    let echoes = client.invoke_all(RpcMessage::new("user", "chat", "chatRemote", "echo").with_args(vec![json!(1), json!("two")])).await?;
    for (server_id, resp) in echoes {
        tracing::info!("{server_id}: {:?}", resp.map(|r| r.into_result()));
    }

    client.stop(true);
    Ok(())
}

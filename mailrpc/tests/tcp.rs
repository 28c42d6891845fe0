// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use mailrpc::client::mailbox::TcpMailboxFactory;
use mailrpc::message::{Packet, RequestEnvelope, ResponseEnvelope};
use mailrpc::transport::JsonCodec;
use mailrpc::{ClientConfig, ErrorCode, FailMode, Response, RpcClient, RpcError, RpcMessage, ServerDescriptor};
use serde_json::json;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

/// Answers every request with its route name followed by its arguments.
async fn serve(listener: TcpListener) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(echo(stream));
    }
}

async fn echo(stream: TcpStream) {
    let mut framed = Framed::new(stream, JsonCodec::<Packet<RequestEnvelope>, Packet<ResponseEnvelope>>::default());
    while let Some(Ok(packet)) = framed.next().await {
        let reply = |req: RequestEnvelope| {
            let mut values = vec![json!(req.msg.route_name())];
            values.extend(req.msg.args);
            ResponseEnvelope { id: req.id, resp: Response::ok(values) }
        };
        let out = match packet {
            Packet::One(req) => Packet::One(reply(req)),
            Packet::Batch(reqs) => Packet::Batch(reqs.into_iter().map(reply).collect()),
        };
        if framed.send(out).await.is_err() {
            return;
        }
    }
}

async fn echo_server(id: &str) -> anyhow::Result<ServerDescriptor> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(serve(listener));
    Ok(ServerDescriptor::new(id, "connector", "127.0.0.1", port))
}

fn entry(uid: &str) -> RpcMessage {
    RpcMessage::new("sys", "connector", "entryRemote", "entry").with_args(vec![json!(uid)])
}

#[tokio::test]
async fn invoke_over_tcp() -> anyhow::Result<()> {
    let client = RpcClient::new(TcpMailboxFactory, ClientConfig::default())?;
    client.add_server(echo_server("connector-1").await?);
    client.start().await?;

    let calls: Vec<_> = (0..10).map(|i| client.invoke(entry(&format!("u{i}")))).collect();
    for (i, call) in calls.into_iter().enumerate() {
        let values = call.await?.into_result().map_err(|e| anyhow::anyhow!("{e}"))?;
        assert_eq!(values, vec![json!("sys.connector.entryRemote.entry"), json!(format!("u{i}"))]);
    }
    client.stop(true);
    Ok(())
}

#[tokio::test]
async fn buffered_mailbox_over_tcp() -> anyhow::Result<()> {
    let config = ClientConfig::default().with_buffer_msg(true).with_interval(Duration::from_millis(10));
    let client = RpcClient::new(TcpMailboxFactory, config)?;
    client.add_server(echo_server("connector-1").await?);
    client.start().await?;

    let replies = futures::future::join_all((0..20).map(|i| client.rpc_invoke("connector-1", entry(&i.to_string())))).await;
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply?.values()[1], json!(i.to_string()));
    }
    Ok(())
}

#[tokio::test]
async fn unreachable_server_fails_over_to_a_live_one() -> anyhow::Result<()> {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        ServerDescriptor::new("connector-0", "connector", "127.0.0.1", listener.local_addr()?.port())
    };
    let client = RpcClient::new(TcpMailboxFactory, ClientConfig::default().with_fail_mode(FailMode::FailOver))?;
    client.add_servers([dead, echo_server("connector-1").await?]);
    client.start().await?;

    let resp = client.rpc_invoke("connector-0", entry("u1")).await?;
    assert_eq!(resp.values(), &[json!("sys.connector.entryRemote.entry"), json!("u1")]);
    Ok(())
}

#[tokio::test]
async fn unreachable_server_fails_fast() -> anyhow::Result<()> {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        ServerDescriptor::new("connector-0", "connector", "127.0.0.1", listener.local_addr()?.port())
    };
    let client = RpcClient::new(TcpMailboxFactory, ClientConfig::default())?;
    client.add_server(dead);
    client.start().await?;

    assert_matches!(
        client.rpc_invoke("connector-0", entry("u1")).await,
        Err(RpcError::Failed { code: ErrorCode::FailConnectServer, .. })
    );
    assert!(!client.station().has_mailbox("connector-0"));
    assert!(!client.station().is_connecting("connector-0"));
    Ok(())
}

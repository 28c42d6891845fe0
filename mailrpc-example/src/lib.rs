// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use futures::{SinkExt, StreamExt};
use mailrpc::message::{Packet, RequestEnvelope, ResponseEnvelope};
use mailrpc::transport::JsonCodec;
use mailrpc::{Response, RpcMessage};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes a tracing subscriber filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_tracing(service_name: &'static str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .try_init()?;
    tracing::info!("{service_name} started");
    Ok(())
}

/// The chat service: `chatRemote.add` greets, `chatRemote.echo` returns its arguments.
pub fn handle(msg: RpcMessage) -> Response {
    match (msg.service.as_str(), msg.method.as_str()) {
        ("chatRemote", "add") => {
            let name = msg.args.first().and_then(Value::as_str).unwrap_or("stranger");
            Response::ok(vec![json!(format!("Hello, {name}!"))])
        },
        ("chatRemote", "echo") => Response::ok(msg.args),
        _ => Response::err(json!(format!("unknown route: {}", msg.route_name()))),
    }
}

/// Serves mail station requests on `addr` until the listener fails.
pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = serve_conn(stream).await {
                tracing::warn!("connection from {peer} failed: {e}");
            }
        });
    }
}

async fn serve_conn(stream: TcpStream) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, JsonCodec::<Packet<RequestEnvelope>, Packet<ResponseEnvelope>>::default());
    while let Some(packet) = framed.next().await {
        let reply = |req: RequestEnvelope| ResponseEnvelope { id: req.id, resp: handle(req.msg) };
        let out = match packet? {
            Packet::One(req) => Packet::One(reply(req)),
            Packet::Batch(reqs) => Packet::Batch(reqs.into_iter().map(reply).collect()),
        };
        framed.send(out).await?;
    }
    Ok(())
}

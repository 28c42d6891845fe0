// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use service::{init_tracing, serve};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Parser)]
struct Flags {
    /// Sets the port number to listen on.
    #[clap(long)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    init_tracing("Mailrpc Example Server")?;
    serve(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), flags.port)).await
}

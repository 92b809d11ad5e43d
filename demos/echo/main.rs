use std::time::Duration;

use rpc_mamont::server::RpcServer;
use rpc_mamont::xdr::schema::{Descriptor, Value};

/// Program number for the demo echo service
const ECHO_PROGRAM: u32 = 200_000;
/// Port number on which the RPC server will listen
const HOSTPORT: u32 = 11111;

/// Demo RPC server using the rpc-mamont library. Registers a two-procedure
/// echo program: procedure 0 is the conventional NULL ping, procedure 1
/// returns its opaque argument unchanged.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    println!("Starting RPC echo server on 0.0.0.0:{HOSTPORT}");

    let mut server = RpcServer::bind(&format!("0.0.0.0:{HOSTPORT}")).await.unwrap();

    server.register(ECHO_PROGRAM, 1, 0, Descriptor::Void, Descriptor::Void, |_ctx, _call, _args| {
        Ok(Value::Void)
    });

    server.register(
        ECHO_PROGRAM,
        1,
        1,
        Descriptor::opaque_unbounded(),
        Descriptor::opaque_unbounded(),
        |_ctx, _call, args| Ok(args),
    );

    loop {
        server.cycle(Duration::from_secs(1)).await;
    }
}

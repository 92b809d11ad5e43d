//! The serving loop: one transport, one registry, one cycle at a time.

use std::io;
use std::time::Duration;

use tracing::{debug, error};

use crate::protocol::rpc::{self, CallContext, ProgramRegistry};
use crate::protocol::xdr::rpc::call_body;
use crate::protocol::xdr::schema::{Descriptor, Value};
use crate::tcp::TcpTransportServer;

/// An RPC server over record-marked TCP.
///
/// Register procedures before (or between) cycles, then call
/// [`RpcServer::cycle`] from your own loop. Each cycle services the
/// transport once and answers every complete call that arrived; per-call
/// failures become error replies or log lines, never a broken loop.
pub struct RpcServer {
    transport: TcpTransportServer,
    registry: ProgramRegistry,
    local_port: u16,
}

impl RpcServer {
    /// Binds the serving socket; `addr` takes the usual `ip:port` form and
    /// port 0 lets the OS pick.
    pub async fn bind(addr: &str) -> io::Result<RpcServer> {
        let transport = TcpTransportServer::bind(addr).await?;
        let local_port = transport.local_addr()?.port();
        Ok(RpcServer { transport, registry: ProgramRegistry::new(), local_port })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// Registers a procedure handler under `(program, version, procedure)`
    /// together with the descriptors used to decode its arguments and
    /// encode its result.
    pub fn register<H>(
        &mut self,
        program: u32,
        version: u32,
        procedure: u32,
        args: Descriptor,
        ret: Descriptor,
        handler: H,
    ) where
        H: Fn(&CallContext, &call_body, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.registry.register(program, version, procedure, args, ret, handler);
    }

    /// One round of serving: network I/O bounded by `timeout`, then
    /// dispatch of every message the transport completed.
    pub async fn cycle(&mut self, timeout: Duration) {
        self.transport.cycle(timeout).await;
        while let Some((connection, message)) = self.transport.pop_message() {
            let context = CallContext {
                local_port: self.local_port,
                client_addr: self
                    .transport
                    .peer_addr(connection)
                    .map(|addr| addr.to_string())
                    .unwrap_or_default(),
                ..CallContext::default()
            };
            match rpc::handle_message(&self.registry, &context, &message) {
                Ok(Some(reply)) => {
                    if !self.transport.push_message(connection, reply, true) {
                        debug!("Dropping reply to vanished connection {connection}");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(client = %context.client_addr, "failed to serialize reply: {e:#}");
                }
            }
        }
    }
}

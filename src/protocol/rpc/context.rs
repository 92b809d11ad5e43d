//! Per-call context handed to procedure handlers.

use crate::protocol::xdr;

/// Identity of one inbound call as seen by the server.
///
/// The credential is parsed when the call carries an `AUTH_UNIX` flavor so
/// handlers can inspect uid/gid information, but nothing here authorizes
/// or rejects the call.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    /// Port number on which the server is listening
    pub local_port: u16,

    /// Client's network address (IP:port) used for logging and request tracking
    pub client_addr: String,

    /// UNIX-style authentication credentials from the client, left at the
    /// default for every other flavor
    pub auth: xdr::rpc::auth_unix,
}

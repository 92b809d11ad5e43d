//! Turns one inbound message buffer into at most one reply buffer.
//!
//! The checks run in a fixed order and short-circuit at the first failure:
//! header decode, RPC version, program, program version, procedure,
//! argument decode, handler, result encode. Every reply echoes the call's
//! xid. Only an undecodable header or a non-CALL message produces no reply
//! at all.

use std::io::Cursor;

use tracing::{debug, warn};

use crate::protocol::rpc::{CallContext, ProgramRegistry};
use crate::protocol::xdr::rpc::{
    self, auth_flavor, auth_unix, call_body, rpc_body, rpc_msg, RPC_VERSION,
};
use crate::protocol::xdr::{deserialize, Serialize};

/// Dispatches a single RPC message and returns the encoded reply, or
/// `None` when the message must be dropped without an answer.
///
/// Failures inside the call (bad arguments, handler errors) are reported
/// to the peer through the standard accept statuses; the returned `Err` is
/// reserved for reply serialization itself going wrong.
pub fn handle_message(
    registry: &ProgramRegistry,
    context: &CallContext,
    message: &[u8],
) -> anyhow::Result<Option<Vec<u8>>> {
    let mut cursor = Cursor::new(message);
    let header = match deserialize::<rpc_msg>(&mut cursor) {
        Ok(header) => header,
        Err(e) => {
            warn!(client = %context.client_addr, "dropping undecodable rpc message: {e}");
            return Ok(None);
        }
    };

    let xid = header.xid;
    let call = match header.body {
        rpc_body::CALL(call) => call,
        rpc_body::REPLY(_) => {
            warn!(client = %context.client_addr, xid, "dropping unexpected reply message");
            return Ok(None);
        }
    };

    if call.rpcvers != RPC_VERSION {
        debug!(client = %context.client_addr, xid, rpcvers = call.rpcvers, "rpc version mismatch");
        return serialize_reply(&rpc::rpc_vers_mismatch_reply_message(xid)).map(Some);
    }

    if !registry.has_program(call.prog) {
        debug!(client = %context.client_addr, xid, prog = call.prog, "program unavailable");
        return serialize_reply(&rpc::prog_unavail_reply_message(xid)).map(Some);
    }

    if !registry.has_version(call.prog, call.vers) {
        // The program exists, so the bounds are known to be present.
        let (low, high) = registry.version_bounds(call.prog).unwrap_or((0, 0));
        debug!(
            client = %context.client_addr,
            xid, prog = call.prog, vers = call.vers, low, high,
            "program version mismatch"
        );
        return serialize_reply(&rpc::prog_mismatch_reply_message(xid, low, high)).map(Some);
    }

    let Some(entry) = registry.procedure(call.prog, call.vers, call.proc) else {
        debug!(
            client = %context.client_addr,
            xid, prog = call.prog, vers = call.vers, proc = call.proc,
            "procedure unavailable"
        );
        return serialize_reply(&rpc::proc_unavail_reply_message(xid)).map(Some);
    };

    let args = match entry.args().decode(&mut cursor) {
        Ok(args) => args,
        Err(e) => {
            debug!(
                client = %context.client_addr,
                xid, prog = call.prog, vers = call.vers, proc = call.proc,
                "argument decode failed: {e}"
            );
            return serialize_reply(&rpc::garbage_args_reply_message(xid)).map(Some);
        }
    };

    let context = call_context(context, &call);
    let result = match entry.handler.handle(&context, &call, args) {
        Ok(result) => result,
        Err(e) => {
            warn!(
                client = %context.client_addr,
                xid, prog = call.prog, vers = call.vers, proc = call.proc,
                "handler failed: {e:#}"
            );
            return serialize_reply(&rpc::system_err_reply_message(xid)).map(Some);
        }
    };

    // The result is encoded into a scratch buffer first so an encoding
    // failure can still be answered with SYSTEM_ERR instead of a reply
    // truncated mid-body.
    let mut result_bytes = Vec::new();
    if let Err(e) = entry.ret().encode(&result, &mut result_bytes) {
        warn!(
            client = %context.client_addr,
            xid, prog = call.prog, vers = call.vers, proc = call.proc,
            "result does not match its return shape: {e}"
        );
        return serialize_reply(&rpc::system_err_reply_message(xid)).map(Some);
    }

    let mut reply = serialize_reply(&rpc::success_reply_message(xid))?;
    reply.extend_from_slice(&result_bytes);
    Ok(Some(reply))
}

/// Builds the per-call context, parsing `AUTH_UNIX` credentials when
/// present. A malformed credential is ignored rather than rejected since
/// authentication is identification only here.
fn call_context(base: &CallContext, call: &call_body) -> CallContext {
    let mut context = base.clone();
    if call.cred.flavor == auth_flavor::AUTH_UNIX {
        let mut cursor = Cursor::new(call.cred.body.as_slice());
        match deserialize::<auth_unix>(&mut cursor) {
            Ok(auth) => context.auth = auth,
            Err(e) => {
                warn!(client = %context.client_addr, "ignoring malformed AUTH_UNIX credential: {e}");
            }
        }
    }
    context
}

fn serialize_reply(message: &rpc_msg) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    message.serialize(&mut buffer)?;
    Ok(buffer)
}

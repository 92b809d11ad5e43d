//! RPC (Remote Procedure Call) protocol engine as specified in RFC 5531
//! (previously RFC 1057).
//!
//! This module implements RPC version 2 dispatch:
//!
//! 1. A program registry built by explicit registration calls, mapping
//!    `program -> version -> procedure` to argument/result descriptors and
//!    a handler
//! 2. The strict short-circuit dispatch order producing the standardized
//!    error replies (RPC_MISMATCH, PROG_UNAVAIL, PROG_MISMATCH,
//!    PROC_UNAVAIL, GARBAGE_ARGS, SYSTEM_ERR)
//! 3. Authentication flavor identification (AUTH_UNIX credentials are
//!    parsed and exposed to handlers, not enforced)
//!
//! The engine consumes and produces whole message buffers; it never
//! touches a socket. Decode and handler failures are recovered here and
//! turned into replies so they can never abort the caller's cycle loop.

mod context;
mod dispatch;
mod registry;

pub use context::CallContext;
pub use dispatch::handle_message;
pub use registry::{Handler, ProcedureEntry, ProgramRegistry};

/// Upper bound on one reassembled RPC record; shared with the transport so
/// an oversized claim is refused before buffering.
pub const MAX_RPC_RECORD_LENGTH: usize = 8 * 1024 * 1024;

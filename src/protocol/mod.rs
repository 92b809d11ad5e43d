//! Protocol module implements the ONC RPC message layer as specified in
//! RFC 5531 and the XDR encoding it rides on as specified in RFC 4506.
//!
//! This module contains two components:
//!
//! - `xdr`: External Data Representation (XDR) for serialization and
//!   deserialization of data structures, both as traits for fixed wire
//!   shapes and as declarative descriptors for shapes registered at
//!   startup.
//!
//! - `rpc`: the call/reply protocol engine: the program registry mapping
//!   (program, version, procedure) triples to handlers and the dispatch
//!   algorithm that turns one inbound message buffer into at most one
//!   reply buffer.
//!
//! Neither component performs network I/O; the record-marked transport in
//! [`crate::tcp`] feeds them whole message buffers and carries their
//! replies.

pub mod rpc;
pub mod xdr;

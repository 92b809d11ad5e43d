//! RPC Mamont - an ONC RPC server and client toolkit in Rust
//!
//! This library implements the ONC RPC protocol stack for building remote
//! procedure call services over TCP:
//!
//! - XDR (External Data Representation) serialization, both as traits for
//!   fixed wire shapes and as runtime descriptors for procedure signatures
//!   registered at startup
//! - The RPC version 2 call/reply protocol with a program registry and
//!   the standardized error replies
//! - A record-marked TCP transport multiplexing many client connections
//!   from a single task, driven by an explicit cycle loop
//!
//! ## Main Components
//!
//! - `xdr`: encoding and decoding of XDR data, including the RPC message
//!   shapes and the descriptor/value schema layer.
//!
//! - `protocol::rpc`: the protocol engine that maps one inbound message
//!   buffer to at most one reply buffer through the program registry.
//!
//! - `tcp`: the record-marked transport (server and client sides).
//!
//! - `server`: [`server::RpcServer`] ties the three together into a
//!   register-then-cycle serving loop.
//!
//! ## Standards Compliance
//!
//! This implementation follows these RFCs:
//! - RFC 5531: RPC: Remote Procedure Call Protocol Specification Version 2 (obsoletes RFC 1831)
//! - RFC 4506: XDR: External Data Representation Standard (obsoletes RFC 1832)
//!
//! ## Usage
//!
//! Build a [`server::RpcServer`], register procedures with argument and
//! result descriptors, and drive `cycle` from your own loop.

pub mod protocol;
pub mod server;
pub mod tcp;

pub use protocol::xdr;

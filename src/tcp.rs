//! Record-marked TCP transport for RPC messages.
//!
//! This module implements the record marking standard from RFC 5531 §11:
//! each record travels as one or more fragments, every fragment preceded by
//! a 4-byte big-endian header whose low 31 bits carry the fragment length
//! and whose top bit marks the final fragment of the record.
//!
//! Both the server and client transports are pull-based: callers invoke
//! [`TcpTransportServer::cycle`] from their own loop, then drain completed
//! messages with `pop_message` and queue outbound ones with `push_message`.
//! One cycle performs at most one non-blocking read and write pass per
//! connection, so a single slow or hostile peer cannot stall the rest.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use anyhow::bail;
use futures::future::{select_all, FutureExt};
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::protocol::rpc::MAX_RPC_RECORD_LENGTH;

/// Identifies one accepted connection for the lifetime of the transport.
/// Ids are never reused, so a stale id simply misses.
pub type ConnectionId = u64;

/// Top bit of a record marking header: this fragment completes the record.
const LAST_FRAGMENT_FLAG: u32 = 1 << 31;

/// Low 31 bits of a record marking header: the fragment length.
const FRAGMENT_LENGTH_MASK: u32 = LAST_FRAGMENT_FLAG - 1;

/// Bytes pulled off a socket per read attempt.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Incremental decoder and encoder for record-marked byte streams.
///
/// Feed it raw socket bytes in arbitrary slices; it reassembles fragments
/// into complete records and hands them out in arrival order. Record
/// boundaries never depend on how the bytes were chunked in transit.
#[derive(Default)]
pub struct RecordCodec {
    /// Raw bytes not yet consumed by the fragment state machine
    buffer: Vec<u8>,
    /// Header already parsed: (fragment length, final flag), body pending
    pending: Option<(usize, bool)>,
    /// Fragments of the record currently being reassembled
    record: Vec<u8>,
    /// Completed records awaiting pickup
    messages: VecDeque<Vec<u8>>,
}

impl RecordCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes raw stream bytes, completing as many records as they allow.
    ///
    /// Fails when a record would exceed [`MAX_RPC_RECORD_LENGTH`]; the
    /// claimed length is checked before anything is buffered, so an
    /// adversarial header cannot force the allocation it advertises.
    pub fn feed(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.buffer.extend_from_slice(data);
        loop {
            match self.pending {
                None => {
                    if self.buffer.len() < 4 {
                        return Ok(());
                    }
                    let header = u32::from_be_bytes([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]);
                    let length = (header & FRAGMENT_LENGTH_MASK) as usize;
                    let is_final = header & LAST_FRAGMENT_FLAG != 0;
                    if self.record.len() + length > MAX_RPC_RECORD_LENGTH {
                        bail!(
                            "record length {} exceeds limit of {} bytes",
                            self.record.len() + length,
                            MAX_RPC_RECORD_LENGTH
                        );
                    }
                    self.buffer.drain(..4);
                    self.pending = Some((length, is_final));
                }
                Some((length, is_final)) => {
                    if self.buffer.len() < length {
                        return Ok(());
                    }
                    self.record.extend_from_slice(&self.buffer[..length]);
                    self.buffer.drain(..length);
                    self.pending = None;
                    if is_final {
                        self.messages.push_back(std::mem::take(&mut self.record));
                    }
                }
            }
        }
    }

    /// Next completed record, in arrival order.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        self.messages.pop_front()
    }

    pub fn has_messages(&self) -> bool {
        !self.messages.is_empty()
    }

    /// Appends `payload` to `out` as record-marked fragments. Payloads
    /// larger than one fragment can carry are split; `is_final` marks the
    /// last fragment so the peer knows the record is complete.
    pub fn frame(payload: &[u8], is_final: bool, out: &mut Vec<u8>) {
        let mut rest = payload;
        loop {
            let take = rest.len().min(FRAGMENT_LENGTH_MASK as usize);
            let (chunk, tail) = rest.split_at(take);
            let mut header = chunk.len() as u32;
            if is_final && tail.is_empty() {
                header |= LAST_FRAGMENT_FLAG;
            }
            out.extend_from_slice(&header.to_be_bytes());
            out.extend_from_slice(chunk);
            if tail.is_empty() {
                return;
            }
            rest = tail;
        }
    }
}

/// One accepted socket with its reassembly state and outbound queue.
struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    codec: RecordCodec,
    /// Payloads queued by `push_message`, not yet framed
    out_queue: VecDeque<(Vec<u8>, bool)>,
    /// Framed bytes partially written to the socket
    out_buffer: Vec<u8>,
    peer_closed: bool,
    close_requested: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Connection {
            stream,
            peer_addr,
            codec: RecordCodec::new(),
            out_queue: VecDeque::new(),
            out_buffer: Vec::new(),
            peer_closed: false,
            close_requested: false,
        }
    }

    fn has_outbound(&self) -> bool {
        !self.out_buffer.is_empty() || !self.out_queue.is_empty()
    }

    fn interest(&self) -> Interest {
        if self.has_outbound() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Connection is done once the peer hung up, or once a requested close
    /// has nothing left to flush.
    fn finished(&self) -> bool {
        self.peer_closed || (self.close_requested && !self.has_outbound())
    }

    /// One non-blocking read and write pass. `WouldBlock` is the normal
    /// idle outcome; a hard socket error is returned so the caller can
    /// drop the connection.
    fn service(&mut self) -> anyhow::Result<()> {
        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        match self.stream.try_read(&mut chunk) {
            Ok(0) => {
                self.peer_closed = true;
            }
            Ok(n) => {
                self.codec.feed(&chunk[..n])?;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        self.flush_outbound()?;
        Ok(())
    }

    fn flush_outbound(&mut self) -> anyhow::Result<()> {
        loop {
            if self.out_buffer.is_empty() {
                let Some((payload, is_final)) = self.out_queue.pop_front() else {
                    return Ok(());
                };
                RecordCodec::frame(&payload, is_final, &mut self.out_buffer);
            }
            match self.stream.try_write(&self.out_buffer) {
                Ok(n) => {
                    self.out_buffer.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Server side of the transport: accepts connections and multiplexes
/// record-marked messages across all of them from a single task.
pub struct TcpTransportServer {
    listener: TcpListener,
    connections: HashMap<ConnectionId, Connection>,
    next_connection_id: ConnectionId,
    /// Complete inbound messages across all connections, in completion order
    inbound: VecDeque<(ConnectionId, Vec<u8>)>,
}

impl TcpTransportServer {
    /// Binds the listening socket. Port 0 asks the OS for a free port;
    /// query it back with [`TcpTransportServer::local_addr`].
    pub async fn bind(addr: &str) -> io::Result<TcpTransportServer> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {:?}", listener.local_addr()?);
        Ok(TcpTransportServer {
            listener,
            connections: HashMap::new(),
            next_connection_id: 0,
            inbound: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn peer_addr(&self, connection: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&connection).map(|c| c.peer_addr)
    }

    /// Next complete inbound message, tagged with the connection that sent
    /// it. Returns `None` once this cycle's arrivals are drained.
    pub fn pop_message(&mut self) -> Option<(ConnectionId, Vec<u8>)> {
        self.inbound.pop_front()
    }

    /// Queues `message` toward a connection; `is_final` marks it as
    /// completing a record on the wire. Returns false when the connection
    /// is already gone, which callers may treat as a dropped reply.
    pub fn push_message(
        &mut self,
        connection: ConnectionId,
        message: Vec<u8>,
        is_final: bool,
    ) -> bool {
        match self.connections.get_mut(&connection) {
            Some(conn) if !conn.close_requested => {
                conn.out_queue.push_back((message, is_final));
                true
            }
            _ => false,
        }
    }

    /// Requests an orderly close: queued output is still flushed, then the
    /// socket is dropped on a later cycle.
    pub fn close(&mut self, connection: ConnectionId) -> bool {
        match self.connections.get_mut(&connection) {
            Some(conn) => {
                conn.close_requested = true;
                true
            }
            None => false,
        }
    }

    /// Runs one round of transport work: accept pending connections,
    /// service every socket once, and if nothing arrived, sleep until a
    /// socket becomes ready or `timeout` elapses. Never blocks longer than
    /// `timeout`; a zero timeout makes a pure poll.
    pub async fn cycle(&mut self, timeout: Duration) {
        self.accept_pass();
        self.io_pass();
        // Skip the wait entirely while messages are already queued so the
        // caller can process them without added latency.
        if self.inbound.is_empty() && !timeout.is_zero() {
            self.wait_ready(timeout).await;
            self.accept_pass();
            self.io_pass();
        }
    }

    fn accept_pass(&mut self) {
        loop {
            // Bind before matching so the accept future's borrow of the
            // listener ends before the connection map is touched.
            let accepted = self.listener.accept().now_or_never();
            match accepted {
                Some(Ok((stream, addr))) => self.install(stream, addr),
                Some(Err(e)) => {
                    warn!("Accept failed: {e}");
                    return;
                }
                None => return,
            }
        }
    }

    fn install(&mut self, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        info!("Accepting connection {id} from {addr}");
        self.connections.insert(id, Connection::new(stream, addr));
    }

    fn io_pass(&mut self) {
        let mut dead = Vec::new();
        for (&id, conn) in &mut self.connections {
            if let Err(e) = conn.service() {
                warn!("Dropping connection {id} from {}: {e}", conn.peer_addr);
                dead.push(id);
                continue;
            }
            while let Some(message) = conn.codec.next_message() {
                self.inbound.push_back((id, message));
            }
            if conn.finished() {
                debug!("Closing connection {id} from {}", conn.peer_addr);
                dead.push(id);
            }
        }
        for id in dead {
            self.connections.remove(&id);
        }
    }

    /// Sleeps until the listener or any connection becomes ready, bounded
    /// by `timeout`. An accepted socket is installed right away so the
    /// follow-up passes can service it.
    async fn wait_ready(&mut self, timeout: Duration) {
        let accepted = {
            let listener = &self.listener;
            let mut waiters: Vec<
                Pin<Box<dyn Future<Output = Option<io::Result<(TcpStream, SocketAddr)>>> + '_>>,
            > = Vec::with_capacity(self.connections.len() + 1);
            waiters.push(Box::pin(async move { Some(listener.accept().await) }));
            for conn in self.connections.values() {
                let stream = &conn.stream;
                let interest = conn.interest();
                waiters.push(Box::pin(async move {
                    let _ = stream.ready(interest).await;
                    None
                }));
            }
            match tokio::time::timeout(timeout, select_all(waiters)).await {
                Ok((first, _, _)) => first,
                Err(_) => None,
            }
        };
        match accepted {
            Some(Ok((stream, addr))) => self.install(stream, addr),
            Some(Err(e)) => warn!("Accept failed: {e}"),
            None => {}
        }
    }
}

/// Client side of the transport: one connection, same record marking and
/// the same pull-based cycle as the server.
pub struct TcpTransportClient {
    connection: Connection,
}

impl TcpTransportClient {
    pub async fn connect(addr: &str) -> io::Result<TcpTransportClient> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let peer_addr = stream.peer_addr()?;
        Ok(TcpTransportClient { connection: Connection::new(stream, peer_addr) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.connection.stream.local_addr()
    }

    /// True once the server has closed its side of the connection.
    pub fn is_closed(&self) -> bool {
        self.connection.peer_closed
    }

    pub fn pop_message(&mut self) -> Option<Vec<u8>> {
        self.connection.codec.next_message()
    }

    pub fn push_message(&mut self, message: Vec<u8>, is_final: bool) {
        self.connection.out_queue.push_back((message, is_final));
    }

    /// One round of transport work, blocking at most `timeout` for the
    /// socket to become ready when no message is already complete.
    pub async fn cycle(&mut self, timeout: Duration) -> anyhow::Result<()> {
        self.connection.service()?;
        if !self.connection.codec.has_messages() && !timeout.is_zero() && !self.is_closed() {
            let interest = self.connection.interest();
            let ready = self.connection.stream.ready(interest);
            let _ = tokio::time::timeout(timeout, ready).await;
            self.connection.service()?;
        }
        Ok(())
    }
}

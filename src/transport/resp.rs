/*!
 * RESP2 transport over TCP
 *
 * A deliberately small client: one request in flight per connection, the
 * handful of commands [`StoreConnection`] needs, and the connect-time handshake
 * (`AUTH`, `SELECT`, `CLIENT SETNAME`). Sentinel end-points are resolved with
 * `SENTINEL get-master-addr-by-name`; cluster end-points use the first node
 * that accepts a connection, without slot routing. TLS is not supported.
 */

use crate::config::timeout_for_command;
use crate::endpoint::{EndpointAddress, EndpointDescriptor, Topology};
use crate::error::{ConnectorError, StoreError};
use crate::transport::StoreConnection;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kvconnect_core_resilience::{ConnectionFactory, ResilienceError};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// A decoded reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

/// Append a command as an array of bulk strings
pub fn encode_command(args: &[&[u8]], buf: &mut BytesMut) {
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
}

/// Largest bulk string accepted, the server's own limit
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Largest element count accepted for one array
pub const MAX_ARRAY_LEN: usize = u32::MAX as usize;

/// Deepest array nesting accepted
pub const MAX_NESTING: usize = 32;

/// Read buffer growth per socket read
const READ_CHUNK: usize = 16 * 1024;

/// Result of one parse attempt
enum Frame {
    Complete(Reply, usize),
    /// Incomplete; the frame needs at least this many bytes in total
    Partial(usize),
}

/// Decode one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it used, or `None` when `buf`
/// does not hold a complete frame yet. Frames over [`MAX_BULK_LEN`],
/// [`MAX_ARRAY_LEN`] or [`MAX_NESTING`] are rejected as conversion errors.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, StoreError> {
    match parse_frame(buf, 0)? {
        Frame::Complete(reply, used) => Ok(Some((reply, used))),
        Frame::Partial(_) => Ok(None),
    }
}

fn parse_frame(buf: &[u8], depth: usize) -> Result<Frame, StoreError> {
    let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
        return Ok(Frame::Partial(buf.len() + 1));
    };
    if line_end == 0 {
        return Err(StoreError::Conversion("empty reply line".into()));
    }

    let line = &buf[1..line_end];
    let after = line_end + 2;
    match buf[0] {
        b'+' => Ok(Frame::Complete(Reply::Simple(utf8(line)?), after)),
        b'-' => Ok(Frame::Complete(Reply::Error(utf8(line)?), after)),
        b':' => Ok(Frame::Complete(Reply::Integer(parse_int(line)?), after)),
        b'$' => {
            let Some(len) = length(line, MAX_BULK_LEN, "bulk string")? else {
                return Ok(Frame::Complete(Reply::Bulk(None), after));
            };
            let end = after + len;
            if buf.len() < end + 2 {
                return Ok(Frame::Partial(end + 2));
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(StoreError::Conversion("bulk string is not terminated".into()));
            }
            let data = Bytes::copy_from_slice(&buf[after..end]);
            Ok(Frame::Complete(Reply::Bulk(Some(data)), end + 2))
        }
        b'*' => {
            let Some(count) = length(line, MAX_ARRAY_LEN, "array")? else {
                return Ok(Frame::Complete(Reply::Array(None), after));
            };
            if depth >= MAX_NESTING {
                return Err(StoreError::Conversion(format!(
                    "arrays nested deeper than {} levels",
                    MAX_NESTING
                )));
            }
            let mut items = Vec::with_capacity(count.min(1024));
            let mut pos = after;
            for _ in 0..count {
                match parse_frame(&buf[pos..], depth + 1)? {
                    Frame::Complete(item, used) => {
                        items.push(item);
                        pos += used;
                    }
                    Frame::Partial(needed) => return Ok(Frame::Partial(pos + needed)),
                }
            }
            Ok(Frame::Complete(Reply::Array(Some(items)), pos))
        }
        other => Err(StoreError::Conversion(format!(
            "unexpected reply type byte 0x{:02x}",
            other
        ))),
    }
}

/// Parse a length header; negative lengths are nulls
fn length(line: &[u8], limit: usize, what: &str) -> Result<Option<usize>, StoreError> {
    let len = parse_int(line)?;
    if len < 0 {
        return Ok(None);
    }
    match usize::try_from(len) {
        Ok(len) if len <= limit => Ok(Some(len)),
        _ => Err(StoreError::Conversion(format!(
            "{} of length {} exceeds the limit of {}",
            what, len, limit
        ))),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, StoreError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| StoreError::Conversion(format!("reply line is not UTF-8: {}", e)))
}

fn parse_int(bytes: &[u8]) -> Result<i64, StoreError> {
    let text = utf8(bytes)?;
    text.parse()
        .map_err(|_| StoreError::Conversion(format!("invalid integer in reply: {}", text)))
}

fn io_error(err: io::Error) -> StoreError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => StoreError::closed(),
        _ => StoreError::Remote(err.to_string()),
    }
}

fn unexpected_reply(command: &str, reply: &Reply) -> StoreError {
    StoreError::Conversion(format!("unexpected reply to {}: {:?}", command, reply))
}

/// One TCP connection speaking RESP2
pub struct RespConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    timeout: Duration,
    open: bool,
    peer: EndpointAddress,
}

impl RespConnection {
    /// Open a plain TCP connection without any handshake
    pub async fn connect(
        address: &EndpointAddress,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let connecting = TcpStream::connect((address.host(), address.port()));
        let stream = if connect_timeout.is_zero() {
            connecting.await
        } else {
            tokio::time::timeout(connect_timeout, connecting)
                .await
                .map_err(|_| StoreError::connect(address, "connect timed out"))?
        }
        .map_err(|e| StoreError::connect(address, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| StoreError::connect(address, e))?;

        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
            timeout: command_timeout,
            open: true,
            peer: address.clone(),
        })
    }

    /// Open a ready-to-use connection for `endpoint`
    pub async fn open(endpoint: &EndpointDescriptor) -> Result<Self, StoreError> {
        let candidates = match &endpoint.topology {
            Topology::Standalone(address) => vec![address.clone()],
            Topology::Sentinel {
                master_id,
                sentinels,
            } => vec![resolve_master(endpoint, master_id, sentinels).await?],
            Topology::Cluster(nodes) => nodes.clone(),
        };

        let mut last_error = None;
        for address in &candidates {
            match Self::connect(address, endpoint.connect_timeout, endpoint.command_timeout).await
            {
                Ok(mut conn) => {
                    conn.handshake(endpoint).await?;
                    debug!(peer = %address, "Opened RESP connection");
                    return Ok(conn);
                }
                Err(err) => {
                    debug!(peer = %address, error = %err, "Connect attempt failed");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::connect(endpoint, "no addresses to connect to")))
    }

    pub fn peer(&self) -> &EndpointAddress {
        &self.peer
    }

    async fn handshake(&mut self, endpoint: &EndpointDescriptor) -> Result<(), StoreError> {
        if let Some(credentials) = &endpoint.credentials {
            let password = credentials.password.as_bytes();
            let reply = match &credentials.username {
                Some(user) => {
                    self.command(&[b"AUTH".as_slice(), user.as_bytes(), password])
                        .await
                }
                None => self.command(&[b"AUTH".as_slice(), password]).await,
            };
            reply.map_err(|e| {
                StoreError::connect(&self.peer, format!("authentication failed: {}", e))
            })?;
        }

        if endpoint.database > 0 {
            let database = endpoint.database.to_string();
            self.command(&[b"SELECT".as_slice(), database.as_bytes()])
                .await
                .map_err(|e| {
                    StoreError::connect(
                        &self.peer,
                        format!("selecting database {} failed: {}", database, e),
                    )
                })?;
        }

        if let Err(e) = self
            .command(&[
                b"CLIENT".as_slice(),
                b"SETNAME".as_slice(),
                endpoint.client_name.as_bytes(),
            ])
            .await
        {
            warn!(peer = %self.peer, error = %e, "Failed to set client name");
        }

        Ok(())
    }

    /// Send one command and read its reply.
    ///
    /// Error replies become [`StoreError::CommandExecution`]. The connection
    /// counts as closed from the moment the request is written until its reply
    /// is read in full, so a timed-out, broken or dropped call leaves it
    /// closed with its stream position lost.
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Reply, StoreError> {
        if !self.open {
            return Err(StoreError::closed());
        }

        let name = String::from_utf8_lossy(args.first().copied().unwrap_or_default())
            .to_ascii_uppercase();
        let budget = timeout_for_command(self.timeout, &name);
        self.open = false;
        let outcome = if budget.is_zero() {
            self.round_trip(args).await
        } else {
            match tokio::time::timeout(budget, self.round_trip(args)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StoreError::timeout(name)),
            }
        };

        let reply = outcome?;
        self.open = true;
        match reply {
            Reply::Error(message) => Err(StoreError::CommandExecution(message)),
            reply => Ok(reply),
        }
    }

    async fn round_trip(&mut self, args: &[&[u8]]) -> Result<Reply, StoreError> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.stream
            .write_all(&self.write_buf)
            .await
            .map_err(io_error)?;

        // Bytes the pending frame needs before it is worth parsing again
        let mut needed = 0;
        loop {
            if self.read_buf.len() >= needed {
                match parse_frame(&self.read_buf, 0)? {
                    Frame::Complete(reply, used) => {
                        self.read_buf.advance(used);
                        return Ok(reply);
                    }
                    Frame::Partial(more) => needed = more,
                }
            }
            self.read_buf.reserve(READ_CHUNK);
            let read = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(io_error)?;
            if read == 0 {
                return Err(StoreError::closed());
            }
        }
    }
}

async fn resolve_master(
    endpoint: &EndpointDescriptor,
    master_id: &str,
    sentinels: &[EndpointAddress],
) -> Result<EndpointAddress, StoreError> {
    let mut last_error = None;
    for sentinel in sentinels {
        let mut conn =
            match RespConnection::connect(sentinel, endpoint.connect_timeout, endpoint.command_timeout)
                .await
            {
                Ok(conn) => conn,
                Err(err) => {
                    last_error = Some(err);
                    continue;
                }
            };

        let reply = conn
            .command(&[
                b"SENTINEL".as_slice(),
                b"get-master-addr-by-name".as_slice(),
                master_id.as_bytes(),
            ])
            .await;
        match reply {
            Ok(Reply::Array(Some(items))) if items.len() == 2 => {
                if let (Reply::Bulk(Some(host)), Reply::Bulk(Some(port))) = (&items[0], &items[1]) {
                    let host = utf8(host)?;
                    let port = utf8(port)?.parse::<u16>().map_err(|_| {
                        StoreError::Conversion(format!("invalid master port from {}", sentinel))
                    })?;
                    debug!(sentinel = %sentinel, master = %master_id, host = %host, port, "Resolved master");
                    return Ok(EndpointAddress::new(host, port));
                }
                last_error = Some(StoreError::Conversion(format!(
                    "malformed master address from {}",
                    sentinel
                )));
            }
            Ok(_) => {
                last_error = Some(StoreError::connect(
                    sentinel,
                    format!("sentinel does not know master {}", master_id),
                ));
            }
            Err(err) => last_error = Some(err),
        }
    }

    Err(last_error.unwrap_or_else(|| StoreError::connect(master_id, "no sentinels configured")))
}

#[async_trait::async_trait]
impl StoreConnection for RespConnection {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), StoreError> {
        self.timeout = timeout;
        Ok(())
    }

    async fn ping(&mut self) -> Result<bool, StoreError> {
        match self.command(&[b"PING".as_slice()]).await? {
            Reply::Simple(pong) => Ok(pong == "PONG"),
            _ => Ok(false),
        }
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        match self.command(&[b"GET".as_slice(), key]).await? {
            Reply::Bulk(value) => Ok(value),
            other => Err(unexpected_reply("GET", &other)),
        }
    }

    async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self.command(&[b"SET".as_slice(), key, value]).await? {
            Reply::Simple(_) => Ok(()),
            other => Err(unexpected_reply("SET", &other)),
        }
    }

    async fn del(&mut self, keys: &[&[u8]]) -> Result<u64, StoreError> {
        let mut args = Vec::with_capacity(keys.len() + 1);
        args.push(b"DEL".as_slice());
        args.extend_from_slice(keys);
        match self.command(&args).await? {
            Reply::Integer(count) => Ok(count.max(0) as u64),
            other => Err(unexpected_reply("DEL", &other)),
        }
    }

    async fn mget(&mut self, keys: &[&[u8]]) -> Result<Vec<Option<Bytes>>, StoreError> {
        let mut args = Vec::with_capacity(keys.len() + 1);
        args.push(b"MGET".as_slice());
        args.extend_from_slice(keys);
        match self.command(&args).await? {
            Reply::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(value) => Ok(value),
                    other => Err(unexpected_reply("MGET", &other)),
                })
                .collect(),
            other => Err(unexpected_reply("MGET", &other)),
        }
    }

    async fn keys(&mut self, pattern: &[u8]) -> Result<Vec<Bytes>, StoreError> {
        match self.command(&[b"KEYS".as_slice(), pattern]).await? {
            Reply::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(Some(key)) => Ok(key),
                    other => Err(unexpected_reply("KEYS", &other)),
                })
                .collect(),
            other => Err(unexpected_reply("KEYS", &other)),
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Pool factory opening [`RespConnection`]s to one end-point
pub struct RespFactory {
    endpoint: EndpointDescriptor,
}

impl RespFactory {
    pub fn new(endpoint: EndpointDescriptor) -> Result<Self, ConnectorError> {
        if endpoint.ssl || endpoint.starttls {
            return Err(ConnectorError::invalid_arguments(
                "TLS end-points are not supported by the RESP transport",
            ));
        }
        Ok(Self { endpoint })
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl ConnectionFactory<RespConnection> for RespFactory {
    async fn create(&self) -> Result<RespConnection, ResilienceError> {
        RespConnection::open(&self.endpoint)
            .await
            .map_err(ResilienceError::creation)
    }

    async fn is_healthy(&self, conn: &RespConnection) -> bool {
        conn.is_open()
    }
}

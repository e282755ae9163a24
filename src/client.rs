//! TCP glue for the ABX exchange protocol.
//!
//! Every request is two bytes, `[call_type, resend_seq]`:
//! - `[1, 0]` streams every packet, then the server closes the connection.
//! - `[2, seq]` asks for the single packet `seq`; the server answers with
//!   exactly one 17-byte frame.
//!
//! The resend sequence is a single byte, so only sequences `0..=255` can be
//! recovered. Anything above that is reported as
//! [`Error::SequenceOutOfRange`] and left as a gap.
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::{Frame, Frames};
use crate::reconcile::{reconcile, ReconcileStats, Recover, RecordSet};
use crate::record::{Record, RECORD_LEN};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;

/// Call type byte for "stream all packets".
pub const CALL_STREAM_ALL: u8 = 1;
/// Call type byte for "resend packet".
pub const CALL_RESEND: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    StreamAll,
    Resend(u8),
}

impl Request {
    /// Builds a resend request for `sequence`.
    ///
    /// # Errors
    /// Returns [`Error::SequenceOutOfRange`] if `sequence` does not fit in a byte.
    pub fn resend(sequence: i32) -> Result<Self> {
        u8::try_from(sequence)
            .map(Self::Resend)
            .map_err(|_| Error::SequenceOutOfRange(sequence))
    }

    pub fn encode(self) -> [u8; 2] {
        match self {
            Self::StreamAll => [CALL_STREAM_ALL, 0],
            Self::Resend(seq) => [CALL_RESEND, seq],
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Option<Duration>,
    /// Applied to every socket read; expiry surfaces as a transport error.
    pub read_timeout: Option<Duration>,
    /// Open a fresh recovery connection for every resend request.
    pub reconnect_each: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            connect_timeout: None,
            read_timeout: None,
            reconnect_each: false,
        }
    }
}

impl ClientConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opens byte streams to the exchange.
pub trait Connector {
    type Stream: Read + Write;

    /// # Errors
    /// Returns [`Error::Transport`] if no connection can be established.
    fn connect(&self) -> Result<Self::Stream>;

    /// `true` once the caller has torn the transport down.
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl<C: Connector + ?Sized> Connector for &C {
    type Stream = C::Stream;

    fn connect(&self) -> Result<Self::Stream> {
        (**self).connect()
    }

    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "client shut down")
}

/// Tears down every connection opened by the [`TcpConnector`]s sharing it.
///
/// Blocked reads on those connections fail with a transport error and no
/// further connections can be opened.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    cancelled: Arc<AtomicBool>,
    live: Arc<Mutex<Vec<Weak<TcpStream>>>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let live = std::mem::take(&mut *self.lock_live());
        for stream in live.iter().filter_map(Weak::upgrade) {
            // Already-closed sockets report NotConnected; nothing to do.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The list only holds weak handles, so a panic while it was locked
    /// cannot leave it inconsistent.
    fn lock_live(&self) -> MutexGuard<'_, Vec<Weak<TcpStream>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, stream: &Arc<TcpStream>) {
        let mut live = self.lock_live();
        if self.is_cancelled() {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        live.retain(|w| w.strong_count() > 0);
        live.push(Arc::downgrade(stream));
    }
}

/// A TCP connection whose clean close after [`ShutdownHandle::shutdown`] is
/// reported as an error instead of end-of-stream.
#[derive(Debug)]
pub struct AbxStream {
    inner: Arc<TcpStream>,
    shutdown: ShutdownHandle,
}

impl Read for AbxStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (&*self.inner).read(buf)?;
        if n == 0 && self.shutdown.is_cancelled() {
            return Err(aborted());
        }
        Ok(n)
    }
}

impl Write for AbxStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.inner).flush()
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: ClientConfig,
    shutdown: ShutdownHandle,
}

impl TcpConnector {
    pub fn new(config: ClientConfig, shutdown: ShutdownHandle) -> Self {
        Self { config, shutdown }
    }

    fn open(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.config.host.as_str(), self.config.port).to_socket_addrs()? {
            let attempt = match self.config.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses")
        }))
    }
}

impl Connector for TcpConnector {
    type Stream = AbxStream;

    fn connect(&self) -> Result<AbxStream> {
        let endpoint = self.config.endpoint();
        if self.shutdown.is_cancelled() {
            return Err(Error::transport(aborted(), format!("connecting to {endpoint}")));
        }
        let stream = self
            .open()
            .map_err(|e| Error::transport(e, format!("connecting to {endpoint}")))?;
        stream
            .set_read_timeout(self.config.read_timeout)
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|e| Error::transport(e, format!("configuring socket to {endpoint}")))?;
        debug!(%endpoint, "connected");
        let inner = Arc::new(stream);
        self.shutdown.register(&inner);
        Ok(AbxStream { inner, shutdown: self.shutdown.clone() })
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Counters from draining the primary stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub frames: usize,
    pub decoded: usize,
    pub malformed: usize,
    pub duplicates: usize,
}

impl fmt::Display for StreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} frames, {} decoded, {} malformed, {} duplicate",
            self.frames, self.decoded, self.malformed, self.duplicates
        )
    }
}

/// Sends the stream-all request and decodes everything until the server
/// closes the connection.
///
/// Malformed frames and repeated sequences are dropped and counted.
///
/// # Errors
/// Returns [`Error::Transport`] if the request cannot be written or a read fails.
pub fn stream_all<S: Read + Write>(mut stream: S) -> Result<(RecordSet, StreamStats)> {
    stream
        .write_all(&Request::StreamAll.encode())
        .and_then(|()| stream.flush())
        .map_err(|e| Error::transport(e, "sending stream-all request"))?;
    debug!("requested full packet stream");

    let mut set = RecordSet::new();
    let mut stats = StreamStats::default();
    for frame in Frames::new(&mut stream) {
        let frame = frame?;
        stats.frames += 1;
        match Record::decode(&frame) {
            Ok(record) => {
                debug!(?record, "parsed packet");
                let sequence = record.sequence;
                if set.insert(record) {
                    stats.decoded += 1;
                } else {
                    stats.duplicates += 1;
                    warn!(sequence, "duplicate packet in stream, keeping the first");
                }
            }
            Err(e) => {
                stats.malformed += 1;
                warn!(error = %e, "dropping packet");
            }
        }
    }
    info!(%stats, max = ?set.max_sequence(), "stream closed");
    Ok((set, stats))
}

/// Sends one resend request and reads back at most one frame.
///
/// Any failure on an established connection is scoped to this request.
fn exchange<S: Read + Write>(stream: &mut S, request: Request, sequence: i32) -> Result<Frame> {
    let mut frame = [0u8; RECORD_LEN];
    let mut received = 0;
    if let Err(e) = stream.write_all(&request.encode()).and_then(|()| stream.flush()) {
        warn!(sequence, error = %e, "resend request failed");
        return Err(Error::IncompleteRecovery { sequence, received });
    }
    while received < RECORD_LEN {
        match stream.read(&mut frame[received..]) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(sequence, received, error = %e, "resend response failed");
                break;
            }
        }
    }
    if received < RECORD_LEN {
        return Err(Error::IncompleteRecovery { sequence, received });
    }
    Ok(frame)
}

/// Recovery side of the protocol: one outstanding resend request at a time.
///
/// The connection is opened on first use and reused until a request fails,
/// after which the next request starts on a fresh connection.
pub struct RecoveryChannel<C: Connector> {
    connector: C,
    stream: Option<C::Stream>,
    reconnect_each: bool,
}

impl<C: Connector> RecoveryChannel<C> {
    pub fn new(connector: C, reconnect_each: bool) -> Self {
        Self { connector, stream: None, reconnect_each }
    }
}

impl<C: Connector> Recover for RecoveryChannel<C> {
    fn fetch_by_sequence(&mut self, sequence: i32) -> Result<Record> {
        let request = Request::resend(sequence)?;
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connector.connect()?,
        };
        let result = exchange(&mut stream, request, sequence);
        if self.connector.is_cancelled() {
            return Err(Error::transport(aborted(), format!("recovering sequence {sequence}")));
        }
        if result.is_ok() && !self.reconnect_each {
            self.stream = Some(stream);
        }
        Record::decode(&result?)
    }
}

/// Outcome of a full run.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub records: RecordSet,
    pub stream: StreamStats,
    pub reconcile: ReconcileStats,
}

/// Streams everything on one connection, then fills the gaps over another.
///
/// # Errors
/// Returns [`Error::Transport`] if the primary stream fails or a recovery
/// connection cannot be opened.
pub fn run<C: Connector>(connector: C, reconnect_each: bool) -> Result<Reconciled> {
    let primary = connector.connect()?;
    let (mut records, stream) = stream_all(primary)?;
    let mut recovery = RecoveryChannel::new(connector, reconnect_each);
    let reconcile = reconcile(&mut records, &mut recovery)?;
    Ok(Reconciled { records, stream, reconcile })
}

/// Client for one ABX endpoint.
pub struct AbxClient {
    config: ClientConfig,
    shutdown: ShutdownHandle,
}

impl AbxClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config, shutdown: ShutdownHandle::new() }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Handle that aborts an in-progress [`run`](Self::run) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn connector(&self) -> TcpConnector {
        TcpConnector::new(self.config.clone(), self.shutdown.clone())
    }

    /// # Errors
    /// See [`run`].
    pub fn run(&self) -> Result<Reconciled> {
        info!(endpoint = %self.config.endpoint(), "connecting to ABX exchange server");
        run(self.connector(), self.config.reconnect_each)
    }
}

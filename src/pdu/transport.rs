use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{lookup_host, TcpSocket, TcpStream, UnixStream};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::{pool, record_frame, PinnedBuf, DEFAULT_CEILING, HDR_SIZE, PDU_CHUNK};
use crate::error::{Error, Result};
use crate::options::HostSpec;

/// The byte stream under a framed connection: TCP to a collector
/// host, or a local-filesystem socket.
pub trait LinkIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkIo for T {}

/// A buffered stream socket carrying frames.
pub struct Link {
    io: BufReader<BufWriter<Box<dyn LinkIo>>>,
}

impl Link {
    fn new(io: Box<dyn LinkIo>) -> Link {
        Link {
            io: BufReader::new(BufWriter::new(io)),
        }
    }

    /// Open a connection to the collector named by `spec`.  Internet
    /// targets try every candidate port and every resolved address in
    /// turn before reporting the last failure.
    pub async fn connect(spec: &HostSpec) -> Result<Link> {
        match spec {
            HostSpec::Local { path } => {
                let stream = UnixStream::connect(path).await.map_err(Error::Connect)?;
                Ok(Link::from(stream))
            }
            HostSpec::Inet { host, ports } => {
                let mut last = None;
                for port in ports {
                    let addrs = match lookup_host((host.as_str(), *port)).await {
                        Ok(addrs) => addrs,
                        Err(e) => {
                            last = Some(e);
                            continue;
                        }
                    };
                    for addr in addrs {
                        let socket = if addr.is_ipv4() {
                            TcpSocket::new_v4()
                        } else {
                            TcpSocket::new_v6()
                        }
                        .map_err(Error::Connect)?;
                        socket.set_nodelay(true).map_err(Error::Connect)?;
                        match socket.connect(addr).await {
                            Ok(stream) => return Ok(Link::from(stream)),
                            Err(e) => last = Some(e),
                        }
                    }
                }
                Err(Error::Connect(last.unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("no usable address for host {}", host),
                    )
                })))
            }
        }
    }
}

impl From<TcpStream> for Link {
    fn from(s: TcpStream) -> Link {
        Link::new(Box::new(s))
    }
}

impl From<UnixStream> for Link {
    fn from(s: UnixStream) -> Link {
        Link::new(Box::new(s))
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Link")
    }
}

/// How long a receive may wait for the complete frame.  The deadline is
/// computed once up front, not per read call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Wait {
    Never,
    Default,
    For(Duration),
}

/// Whether the inbound frame length is bounded.  Servers apply
/// `Limited` to frames from untrusted peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeLimit {
    Any,
    Limited,
}

static CEILING: AtomicUsize = AtomicUsize::new(DEFAULT_CEILING);
static REQUEST_TIMEOUT_MILLIS: Mutex<Option<u64>> = Mutex::new(None);
static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Replace the ceiling applied in `SizeLimit::Limited` mode; returns
/// the previous value.
pub fn set_ceiling(bytes: usize) -> usize {
    CEILING.swap(bytes, Ordering::Relaxed)
}

/// The process-wide default request timeout, from
/// `PMCD_REQUEST_TIMEOUT` on first use, else 10 seconds.
pub fn request_timeout() -> Duration {
    let mut guard = REQUEST_TIMEOUT_MILLIS.lock();
    let millis = *guard.get_or_insert_with(|| {
        std::env::var("PMCD_REQUEST_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|t| *t >= 0.0)
            .map(|t| (t * 1000.0) as u64)
            .unwrap_or(10_000)
    });
    Duration::from_millis(millis)
}

pub fn set_request_timeout(timeout: Duration) {
    *REQUEST_TIMEOUT_MILLIS.lock() = Some(timeout.as_millis() as u64);
}

#[cfg(unix)]
fn ignore_sigpipe_once() {
    use std::sync::Once;
    static DONE: Once = Once::new();
    // The default action for a broken-pipe signal is process exit, so a
    // handler must be installed before the first write.  A handler the
    // user installed is put straight back.
    DONE.call_once(|| unsafe {
        let previous = libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        if previous != libc::SIG_DFL {
            libc::signal(libc::SIGPIPE, previous);
        }
    });
}

#[cfg(not(unix))]
fn ignore_sigpipe_once() {}

/// A received frame.  `buf` is the pinned pooled buffer holding the
/// whole frame; decoded structures that borrow from it keep a pin.
#[derive(Debug, Clone)]
pub struct Frame {
    pub typ: u32,
    pub from: u32,
    pub buf: PinnedBuf,
}

impl Frame {
    pub fn body(&self) -> &[u8] {
        &self.buf[HDR_SIZE..]
    }

    pub fn typed(&self) -> Option<super::PduType> {
        super::PduType::from_raw(self.typ)
    }
}

/// A framed connection.
#[derive(Debug)]
pub struct PduStream {
    link: Link,
    id: u64,
}

impl PduStream {
    pub fn new(link: Link) -> PduStream {
        PduStream {
            link,
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub async fn connect(spec: &HostSpec) -> Result<PduStream> {
        Ok(PduStream::new(Link::connect(spec).await?))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Transmit one pre-built frame (header included).
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        ignore_sigpipe_once();
        let typ = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        self.link.io.write_all(frame).await?;
        self.link.io.flush().await?;
        record_frame(self.id, true, typ, frame.len());
        debug!(link = self.id, typ = super::PduType::name(typ), len = frame.len(), "sent frame");
        Ok(())
    }

    /// Receive one frame into a pinned pooled buffer.
    ///
    /// Returns `Ok(None)` on clean close before any byte arrives.  In
    /// `Limited` mode frames beyond the ceiling are rejected without
    /// reading their bodies.
    pub async fn recv(&mut self, limit: SizeLimit, wait: Wait) -> Result<Option<Frame>> {
        let deadline = match wait {
            Wait::Never => None,
            Wait::Default => Some(Instant::now() + request_timeout()),
            Wait::For(d) => Some(Instant::now() + d),
        };

        let mut header = [0u8; HDR_SIZE];
        let mut have = 0usize;
        while have < HDR_SIZE {
            let n = self
                .read_some(&mut header[have..], deadline)
                .await?;
            if n == 0 {
                if have == 0 {
                    return Ok(None);
                }
                return Err(Error::Ipc("connection closed inside frame header"));
            }
            have += n;
        }

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len < HDR_SIZE {
            warn!(link = self.id, len, "frame header with impossible length");
            return Err(Error::Ipc("declared frame length below header size"));
        }
        if limit == SizeLimit::Limited && len > CEILING.load(Ordering::Relaxed) {
            warn!(link = self.id, len, "rejecting oversized inbound frame");
            return Err(Error::TooBig(len));
        }

        let raw_type = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if raw_type < 0 {
            return Err(Error::Ipc("negative frame type"));
        }
        let from = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        if len > pool::maxsize() {
            pool::grow_maxsize(len);
        }
        let mut buf = pool::acquire(pool::maxsize().max(len));
        buf.put_slice(&header);
        buf.resize(len, 0);
        let mut off = HDR_SIZE;
        while off < len {
            let n = self.read_some(&mut buf[off..len], deadline).await?;
            if n == 0 {
                return Err(Error::Ipc("connection closed inside frame body"));
            }
            off += n;
        }

        record_frame(self.id, false, raw_type as u32, len);
        debug!(
            link = self.id,
            typ = super::PduType::name(raw_type as u32),
            len,
            "received frame"
        );
        Ok(Some(Frame {
            typ: raw_type as u32,
            from,
            buf: PinnedBuf::new(buf),
        }))
    }

    async fn read_some(&mut self, out: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        match deadline {
            None => Ok(self.link.io.read(out).await?),
            Some(at) => match timeout_at(at, self.link.io.read(out)).await {
                Ok(res) => Ok(res?),
                Err(_) => Err(Error::Timeout),
            },
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.link.io.shutdown().await?;
        Ok(())
    }
}

/// Start a frame of the given type; the length word is fixed up by
/// [`seal`].
pub fn new_frame(typ: super::PduType, from: u32) -> BytesMut {
    let mut buf = pool::acquire(PDU_CHUNK);
    buf.put_u32(0);
    buf.put_u32(typ as u32);
    buf.put_u32(from);
    buf
}

/// Write the final length into a frame started by [`new_frame`].
pub fn seal(buf: &mut BytesMut) {
    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
}

/// Peek the declared length of a sealed frame.
pub fn frame_len(frame: &[u8]) -> usize {
    let mut b = &frame[0..4];
    b.get_u32() as usize
}

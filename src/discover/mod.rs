//! Service discovery: enumerate candidate (address, port) pairs and
//! probe them with short non-blocking connects from a bounded pool of
//! workers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

use crate::error::Result;

pub mod shell;
pub mod subnet;

pub use shell::shell_probe;
pub use subnet::subnet_probe;

/// Per-address connect timeout: 50 addresses per second per worker.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(20);

/// The worker bound tracks the fd-set capacity of the select-style
/// machinery; one slot is kept for the caller's own thread.
pub const FD_CAPACITY: usize = 1024;

const FD_WAIT: Duration = Duration::from_millis(100);
const FD_WAIT_TRIES: u32 = 50;

/// Shared controls for one discovery invocation.
#[derive(Clone)]
pub struct DiscoveryOptions {
    /// Observed between candidates; set to stop all workers.
    pub interrupted: Arc<AtomicBool>,
    /// Global deadline for the whole sweep.
    pub deadline: Option<Instant>,
    /// Resolve discovered addresses back to names where possible.
    pub resolve: bool,
    /// Upper bound on worker tasks; the effective bound is the lesser
    /// of this and the fd capacity less one.
    pub max_workers: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> DiscoveryOptions {
        DiscoveryOptions {
            interrupted: Arc::new(AtomicBool::new(false)),
            deadline: None,
            resolve: false,
            max_workers: FD_CAPACITY - 1,
        }
    }
}

/// A discovered service endpoint rendered as a URL.
pub fn service_url(service: &str, addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}://{}:{}", service, v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("{}://[{}]:{}", service, v6.ip(), v6.port()),
    }
}

pub(crate) struct ProbeContext {
    service: String,
    /// Candidate iteration; one lock for the cursor...
    targets: Mutex<Box<dyn Iterator<Item = SocketAddr> + Send>>,
    /// ...and a second for appending results.
    urls: Mutex<Vec<String>>,
    timeout: Duration,
    options: DiscoveryOptions,
}

impl ProbeContext {
    pub(crate) fn new(
        service: &str,
        targets: Box<dyn Iterator<Item = SocketAddr> + Send>,
        timeout_per_addr: Duration,
        options: DiscoveryOptions,
    ) -> Arc<ProbeContext> {
        Arc::new(ProbeContext {
            service: service.to_string(),
            targets: Mutex::new(targets),
            urls: Mutex::new(Vec::new()),
            timeout: timeout_per_addr,
            options,
        })
    }

    fn stopped(&self) -> bool {
        if self.options.interrupted.load(Ordering::Relaxed) {
            return true;
        }
        match self.options.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

/// Keep taking candidates until the iterator is exhausted, the
/// interrupt flag is observed, or the deadline passes.
async fn attempt_connections(ctx: Arc<ProbeContext>) {
    while !ctx.stopped() {
        let target = {
            let mut targets = ctx.targets.lock();
            targets.next()
        };
        let addr = match target {
            Some(addr) => addr,
            None => break,
        };

        // fd exhaustion backs off rather than aborting the sweep
        let mut connected = None;
        let mut attempt = 0;
        while attempt < FD_WAIT_TRIES {
            match timeout(ctx.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    connected = Some(stream);
                    break;
                }
                Ok(Err(e)) if is_fd_exhaustion(&e) => {
                    attempt += 1;
                    sleep(FD_WAIT).await;
                }
                // per-candidate failures are silently skipped
                Ok(Err(e)) => {
                    trace!(%addr, error = %e, "candidate refused");
                    break;
                }
                Err(_) => {
                    trace!(%addr, "candidate timed out");
                    break;
                }
            }
        }

        if let Some(stream) = connected {
            drop(stream);
            let url = service_url(&ctx.service, &addr);
            let mut urls = ctx.urls.lock();
            if !urls.contains(&url) {
                debug!(%url, "service discovered");
                urls.push(url);
            }
        }
    }
}

fn is_fd_exhaustion(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
        || e.kind() == std::io::ErrorKind::WouldBlock
}

/// Run the candidate sweep with a bounded worker pool; the calling
/// task participates as well.
pub(crate) async fn run_probe(ctx: Arc<ProbeContext>, candidates: usize) -> Result<Vec<String>> {
    let bound = ctx
        .options
        .max_workers
        .min(FD_CAPACITY - 1)
        .min(candidates.saturating_sub(1));
    let mut workers = Vec::with_capacity(bound);
    for _ in 0..bound {
        workers.push(tokio::spawn(attempt_connections(Arc::clone(&ctx))));
    }
    attempt_connections(Arc::clone(&ctx)).await;
    for worker in workers {
        let _ = worker.await;
    }
    let urls = std::mem::take(&mut *ctx.urls.lock());
    Ok(urls)
}

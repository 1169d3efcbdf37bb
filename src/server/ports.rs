//! The request-port manager: multi-family listening sockets for client
//! connections, with discovery advertisement and clean shutdown.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::task::Poll;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};

use super::{has_feature, set_feature, ServerFeature};
use crate::error::{Error, Result};

const BIND_TRIES: u32 = 4;
const BIND_RETRY: Duration = Duration::from_millis(250);

/// Listen on every local address.
pub const ANY: &str = "any";
/// Listen on loopback only.
pub const LOOPBACK: &str = "loopback";

/// Published-service advertisement; the publishing mechanism itself is
/// an external collaborator.
pub trait Advertise: Send + Sync {
    fn advertise(&self, spec: &str, port: u16) -> AdvertHandle;
    fn revoke(&self, handle: AdvertHandle);
}

#[derive(Debug, PartialEq, Eq)]
pub struct AdvertHandle(pub u64);

/// What to listen on.
#[derive(Clone, Debug, Default)]
pub struct PortConfig {
    /// Address specs: [`ANY`], [`LOOPBACK`] or explicit addresses.
    /// Empty means [`ANY`].
    pub addresses: Vec<String>,
    pub ports: Vec<u16>,
    /// Optional local-filesystem socket path.
    pub local_path: Option<PathBuf>,
    pub backlog: u32,
    /// Service name advertised via discovery, when that feature is on.
    pub service_spec: Option<String>,
}

struct ReqPort {
    address: String,
    port: u16,
    inet: Option<TcpListener>,
    ipv6: Option<TcpListener>,
    presence: Option<AdvertHandle>,
}

struct LocalPort {
    listener: UnixListener,
    path: PathBuf,
}

/// An accepted client connection.
pub enum Accepted {
    Tcp(TcpStream, SocketAddr),
    Local(UnixStream),
}

pub struct RequestPorts {
    entries: Vec<ReqPort>,
    local: Option<LocalPort>,
}

async fn open_socket(addr: IpAddr, port: u16, backlog: u32) -> Result<TcpListener> {
    let target = SocketAddr::new(addr, port);
    let mut last = None;
    // tolerate lingering sockets from a predecessor process
    for attempt in 0..BIND_TRIES {
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_keepalive(true)?;
        match socket.bind(target) {
            Ok(()) => return Ok(socket.listen(backlog)?),
            Err(e) => {
                debug!(%target, attempt, error = %e, "bind failed");
                last = Some(e);
                tokio::time::sleep(BIND_RETRY).await;
            }
        }
    }
    Err(Error::Connect(last.unwrap()))
}

fn families_for(spec: &str) -> Result<Vec<IpAddr>> {
    match spec {
        ANY => Ok(vec!["0.0.0.0".parse().unwrap(), "::".parse().unwrap()]),
        LOOPBACK => Ok(vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()]),
        explicit => explicit
            .parse::<IpAddr>()
            .map(|addr| vec![addr])
            .map_err(|_| Error::Config(format!("invalid listen address: {}", explicit))),
    }
}

impl RequestPorts {
    /// Open sockets for every (address, port) pair.  A single family
    /// failing is tolerated; a pair where no family opened is a hard
    /// error.
    pub async fn open(
        config: &PortConfig,
        advertiser: Option<&dyn Advertise>,
    ) -> Result<RequestPorts> {
        let addresses: Vec<String> = if config.addresses.is_empty() {
            vec![ANY.to_string()]
        } else {
            config.addresses.clone()
        };

        // duplicate ports are dropped, with a warning like any daemon
        // would log
        let mut ports: Vec<u16> = Vec::new();
        for port in &config.ports {
            if ports.contains(port) {
                warn!(port, "duplicate client request port ignored");
                continue;
            }
            ports.push(*port);
        }

        let mut entries = Vec::new();
        for address in &addresses {
            for port in &ports {
                let mut entry = ReqPort {
                    address: address.clone(),
                    port: *port,
                    inet: None,
                    ipv6: None,
                    presence: None,
                };
                let mut opened = 0usize;
                for addr in families_for(address)? {
                    match open_socket(addr, *port, config.backlog).await {
                        Ok(listener) => {
                            opened += 1;
                            if addr.is_ipv4() {
                                entry.inet = Some(listener);
                            } else {
                                entry.ipv6 = Some(listener);
                                set_feature(ServerFeature::Ipv6);
                            }
                        }
                        Err(e) => {
                            warn!(%addr, port, error = %e, "request socket failed to open")
                        }
                    }
                }
                if opened == 0 {
                    return Err(Error::Config(format!(
                        "can't open request port {}:{}",
                        address, port
                    )));
                }
                if let (Some(advertiser), Some(spec)) = (advertiser, &config.service_spec) {
                    if has_feature(ServerFeature::Discovery) {
                        entry.presence = Some(advertiser.advertise(spec, *port));
                    }
                }
                entries.push(entry);
            }
        }

        let local = match &config.local_path {
            None => None,
            Some(path) => {
                // a stale socket file blocks bind; remove it first
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                // connect fails on some kernels unless the path is rw
                // for all, and that must happen after bind
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
                }
                set_feature(ServerFeature::UnixDomain);
                Some(LocalPort {
                    listener,
                    path: path.clone(),
                })
            }
        };

        Ok(RequestPorts { entries, local })
    }

    pub fn num_ports(&self) -> usize {
        self.entries.len()
    }

    pub fn port_info(&self, index: usize) -> Option<(&str, u16)> {
        self.entries
            .get(index)
            .map(|e| (e.address.as_str(), e.port))
    }

    pub fn has_local(&self) -> bool {
        self.local.is_some()
    }

    /// Wait for the next client on any open socket.
    pub async fn accept(&self) -> Result<Accepted> {
        futures::future::poll_fn(|cx| {
            if let Some(local) = &self.local {
                if let Poll::Ready(res) = local.listener.poll_accept(cx) {
                    let (stream, _) = res?;
                    return Poll::Ready(Ok(Accepted::Local(stream)));
                }
            }
            for entry in &self.entries {
                for listener in [&entry.inet, &entry.ipv6].iter().filter_map(|l| l.as_ref()) {
                    if let Poll::Ready(res) = listener.poll_accept(cx) {
                        let (stream, peer) = res?;
                        return Poll::Ready(Ok(Accepted::Tcp(stream, peer)));
                    }
                }
            }
            Poll::Pending
        })
        .await
    }

    /// Revoke advertisements, close every socket, and unlink the
    /// local-filesystem socket if present.
    pub fn shutdown(mut self, advertiser: Option<&dyn Advertise>) {
        for mut entry in self.entries.drain(..) {
            if let (Some(advertiser), Some(handle)) = (advertiser, entry.presence.take()) {
                advertiser.revoke(handle);
            }
            entry.inet.take();
            entry.ipv6.take();
        }
        if let Some(local) = self.local.take() {
            drop(local.listener);
            if let Err(e) = std::fs::remove_file(&local.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %local.path.display(), error = %e, "can't unlink local socket");
                }
            }
        }
    }
}

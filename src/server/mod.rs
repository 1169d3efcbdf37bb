//! Server-side connection plane: request ports, the secure handshake,
//! and the advertised feature bitmap.

use std::sync::atomic::{AtomicU32, Ordering};

use fxhash::FxHashMap;

use crate::error::Result;
use crate::pdu::auth::Attr;

pub mod ports;
pub mod secure;

/// Features a server can advertise to clients and discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerFeature {
    Ipv6,
    Local,
    Discovery,
    Containers,
    CredsReqd,
    UnixDomain,
    CertReqd,
}

impl ServerFeature {
    fn bit(self) -> u32 {
        match self {
            ServerFeature::Ipv6 => 1 << 0,
            ServerFeature::Local => 1 << 1,
            ServerFeature::Discovery => 1 << 2,
            ServerFeature::Containers => 1 << 3,
            ServerFeature::CredsReqd => 1 << 4,
            ServerFeature::UnixDomain => 1 << 5,
            ServerFeature::CertReqd => 1 << 6,
        }
    }
}

static FEATURES: AtomicU32 = AtomicU32::new(0);

pub fn set_feature(feature: ServerFeature) {
    FEATURES.fetch_or(feature.bit(), Ordering::Relaxed);
}

pub fn clear_feature(feature: ServerFeature) {
    FEATURES.fetch_and(!feature.bit(), Ordering::Relaxed);
}

pub fn has_feature(feature: ServerFeature) -> bool {
    FEATURES.load(Ordering::Relaxed) & feature.bit() != 0
}

pub fn feature_bits() -> u32 {
    FEATURES.load(Ordering::Relaxed)
}

/// Reset the advertised feature set, for shutdown and tests.
pub fn reset_features() {
    FEATURES.store(0, Ordering::Relaxed);
}

/// Populate credential attributes from the kernel for a connection on
/// a local-filesystem socket, so that a creds-required client is
/// admitted without an authentication round-trip.
pub fn local_creds(
    stream: &tokio::net::UnixStream,
    attrs: &mut FxHashMap<Attr, String>,
) -> Result<()> {
    let cred = stream.peer_cred()?;
    attrs.insert(Attr::UserId, cred.uid().to_string());
    attrs.insert(Attr::GroupId, cred.gid().to_string());
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(pid) = cred.pid() {
        attrs.insert(Attr::ProcessId, pid.to_string());
    }
    Ok(())
}

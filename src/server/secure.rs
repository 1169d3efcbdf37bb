//! The post-accept secure handshake: an explicit state machine
//! negotiating encryption and authentication before the connection is
//! handed to the application frame loop.

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pdu::auth::{decode_auth, encode_auth, Attr};
use crate::pdu::{PduStream, PduType, SizeLimit, Wait};

/// Connection flag words sent in the first frame.
pub const FLAG_SECURE: u32 = 1 << 0;
pub const FLAG_COMPRESS: u32 = 1 << 1;
pub const FLAG_AUTH: u32 = 1 << 2;
pub const FLAG_CREDS_REQD: u32 = 1 << 3;
pub const FLAG_SECURE_ACK: u32 = 1 << 4;
pub const FLAG_CONTAINER: u32 = 1 << 6;
pub const FLAG_CERT_REQD: u32 = 1 << 7;

const KNOWN_FLAGS: u32 = FLAG_SECURE
    | FLAG_COMPRESS
    | FLAG_AUTH
    | FLAG_CREDS_REQD
    | FLAG_SECURE_ACK
    | FLAG_CONTAINER
    | FLAG_CERT_REQD;

/// Default authentication security-strength factor.
pub const DEFAULT_SECURITY_STRENGTH: u32 = 0;

/// States of the per-connection handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitFlags,
    MaybeUpgrade,
    CredsRequired,
    Auth,
    Admitted,
}

/// Events driving the handshake forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeEvent {
    Flags(u32),
    Upgraded,
    CredsKnown,
    CredsMissing,
    Authenticated,
}

/// The transition function.  Everything the state machine decides is
/// here; the driver below only performs the I/O each state demands.
pub fn transition(state: HandshakeState, event: HandshakeEvent) -> Result<HandshakeState> {
    use HandshakeEvent::*;
    use HandshakeState::*;
    let next = match (state, event) {
        (AwaitFlags, Flags(flags)) => {
            if flags & !KNOWN_FLAGS != 0 {
                return Err(Error::Ipc("unknown connection flags"));
            }
            if flags & FLAG_COMPRESS != 0 {
                return Err(Error::NotSupported("compression"));
            }
            if flags & FLAG_SECURE != 0 {
                MaybeUpgrade
            } else if flags & FLAG_CREDS_REQD != 0 {
                CredsRequired
            } else if flags & FLAG_AUTH != 0 {
                Auth
            } else {
                Admitted
            }
        }
        (MaybeUpgrade, Upgraded) => Admitted,
        (CredsRequired, CredsKnown) => Admitted,
        (CredsRequired, CredsMissing) => Auth,
        (Auth, Authenticated) => Admitted,
        _ => return Err(Error::Ipc("handshake event out of order")),
    };
    Ok(next)
}

/// One step of an authentication conversation.
pub enum AuthStep {
    Continue(Vec<u8>),
    Ok { username: String },
}

/// A pluggable challenge/response mechanism.
pub trait AuthMechanism: Send + Sync {
    fn name(&self) -> &'static str;
    fn begin(&self, initial: Option<&[u8]>) -> Result<Box<dyn AuthSession>>;
}

pub trait AuthSession: Send {
    fn step(&mut self, response: Option<&[u8]>) -> Result<AuthStep>;
}

/// The mechanisms a server offers, listed to the peer in preference
/// order.
#[derive(Default)]
pub struct MechanismRegistry {
    mechanisms: Vec<Box<dyn AuthMechanism>>,
}

impl MechanismRegistry {
    pub fn new() -> MechanismRegistry {
        MechanismRegistry::default()
    }

    pub fn add(&mut self, mechanism: Box<dyn AuthMechanism>) {
        self.mechanisms.push(mechanism);
    }

    pub fn list(&self) -> String {
        self.mechanisms
            .iter()
            .map(|m| m.name())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn find(&self, name: &str) -> Option<&dyn AuthMechanism> {
        self.mechanisms
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.is_empty()
    }
}

/// Hook for the encryption upgrade.  The default server carries no
/// cipher machinery; a connection demanding one is closed.
pub trait SecureUpgrade: Send + Sync {
    fn upgrade(&self, link: u64) -> Result<u32>;
}

struct NoUpgrade;

impl SecureUpgrade for NoUpgrade {
    fn upgrade(&self, _link: u64) -> Result<u32> {
        Err(Error::NotSupported("transport encryption"))
    }
}

static SETUP: Mutex<Option<SetupState>> = Mutex::new(None);

struct SetupState {
    certificates: Option<String>,
}

/// One-shot initialisation of server credentials; repeat calls are
/// no-ops, matching the once-only setup of the encryption library.
pub fn secure_server_setup(certificates: Option<&str>) {
    let mut guard = SETUP.lock();
    if guard.is_none() {
        *guard = Some(SetupState {
            certificates: certificates.map(|c| c.to_string()),
        });
    }
}

pub fn secure_server_teardown() {
    *SETUP.lock() = None;
}

pub fn secure_server_certificates() -> Option<String> {
    SETUP.lock().as_ref().and_then(|s| s.certificates.clone())
}

/// Run the server side of the handshake on a freshly accepted
/// connection carrying `flags` from its first frame.
///
/// On success the caller hands the stream to the application frame
/// loop; on error the caller closes the connection.
pub async fn server_handshake(
    stream: &mut PduStream,
    flags: u32,
    attrs: &mut FxHashMap<Attr, String>,
    mechanisms: &MechanismRegistry,
    upgrade: Option<&dyn SecureUpgrade>,
) -> Result<()> {
    let mut state = transition(HandshakeState::AwaitFlags, HandshakeEvent::Flags(flags))?;
    let mut ssf = DEFAULT_SECURITY_STRENGTH;

    if state == HandshakeState::MaybeUpgrade {
        let upgrade = upgrade.unwrap_or(&NoUpgrade);
        match upgrade.upgrade(stream.id()) {
            Ok(strength) => {
                ssf = strength;
                state = transition(state, HandshakeEvent::Upgraded)?;
            }
            Err(e) => {
                warn!(link = stream.id(), error = %e, "encryption upgrade failed");
                return Err(e);
            }
        }
    }

    if state == HandshakeState::CredsRequired {
        // peer credentials learned out-of-band (local sockets) satisfy
        // the requirement without a round-trip
        let event = if attrs.contains_key(&Attr::UserId) {
            HandshakeEvent::CredsKnown
        } else {
            HandshakeEvent::CredsMissing
        };
        state = transition(state, event)?;
    }

    if state == HandshakeState::Auth {
        auth_negotiation(stream, ssf, attrs, mechanisms).await?;
        state = transition(state, HandshakeEvent::Authenticated)?;
    }

    debug!(link = stream.id(), ?state, "handshake complete");
    debug_assert_eq!(state, HandshakeState::Admitted);
    Ok(())
}

/// List mechanisms, receive the chosen mechanism plus optional initial
/// response, then run the challenge/response loop to completion.
async fn auth_negotiation(
    stream: &mut PduStream,
    ssf: u32,
    attrs: &mut FxHashMap<Attr, String>,
    mechanisms: &MechanismRegistry,
) -> Result<()> {
    if mechanisms.is_empty() {
        return Err(Error::Auth("no mechanisms configured".to_string()));
    }
    debug!(link = stream.id(), ssf, "starting authentication");

    let list = mechanisms.list();
    stream.send(&encode_auth(0, list.as_bytes())?).await?;

    let frame = expect_auth(stream).await?;
    let payload = decode_auth(&frame)?;
    // "mechanism\0initial-response", the response optional
    let (name, initial) = match payload.iter().position(|b| *b == 0) {
        None => (payload, None),
        Some(pos) => (&payload[..pos], Some(&payload[pos + 1..])),
    };
    let name = std::str::from_utf8(name)
        .map_err(|_| Error::Auth("mechanism name is not utf-8".to_string()))?;
    let mechanism = mechanisms
        .find(name)
        .ok_or_else(|| Error::Auth(format!("unknown mechanism {}", name)))?;

    let mut session = mechanism.begin(initial.filter(|p| !p.is_empty()))?;
    let mut input: Option<Vec<u8>> = None;
    loop {
        match session.step(input.as_deref())? {
            AuthStep::Ok { username } => {
                attrs.insert(Attr::Username, username);
                return Ok(());
            }
            AuthStep::Continue(challenge) => {
                stream.send(&encode_auth(0, &challenge)?).await?;
                let frame = expect_auth(stream).await?;
                input = Some(decode_auth(&frame)?.to_vec());
            }
        }
    }
}

async fn expect_auth(stream: &mut PduStream) -> Result<crate::pdu::Frame> {
    let frame = stream
        .recv(SizeLimit::Limited, Wait::Default)
        .await?
        .ok_or(Error::Ipc("connection closed during authentication"))?;
    match frame.typed() {
        Some(PduType::Auth) => Ok(frame),
        Some(PduType::Error) => {
            let code = crate::pdu::desc::decode_error(&frame)?;
            Err(Error::from_code(code))
        }
        _ => Err(Error::Ipc("expected an authentication frame")),
    }
}

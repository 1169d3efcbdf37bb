//! Framed, versioned request/response messaging.
//!
//! Every frame is `len:u32be | type:u32be | from:u32be | body[len-12]`.
//! Inbound frames land in pooled, pin-counted buffers; see [`pool`].

use std::cell::Cell;

use parking_lot::Mutex;

pub mod auth;
pub mod creds;
pub mod desc;
pub mod idlist;
pub mod instance;
pub mod label;
pub mod pool;
pub mod profile;
pub mod result;
pub mod text;
pub mod transport;

pub use pool::PinnedBuf;
pub use transport::{Frame, PduStream, SizeLimit, Wait};

/// Size of the fixed frame header.
pub const HDR_SIZE: usize = 12;
/// Receive buffers are sized in multiples of this.
pub const PDU_CHUNK: usize = 1024;
/// Default inbound ceiling applied in `SizeLimit::Limited` mode.
pub const DEFAULT_CEILING: usize = PDU_CHUNK * 64;
/// Frame words are 4 bytes; variable-length fields pad up to this.
pub const WORD: usize = 4;
/// Ceiling on an authentication payload.
pub const LIMIT_AUTH_PDU: usize = 2048;
/// Ceiling on an attribute payload.
pub const LIMIT_ATTR_PDU: usize = 4096;

/// Typed frame identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PduType {
    Error = 0x7000,
    Result = 0x7001,
    Profile = 0x7002,
    Fetch = 0x7003,
    DescReq = 0x7004,
    Desc = 0x7005,
    InstanceReq = 0x7006,
    Instance = 0x7007,
    TextReq = 0x7008,
    Text = 0x7009,
    Creds = 0x700a,
    PmnsIds = 0x700b,
    DescIds = 0x700c,
    Auth = 0x700d,
    AuthAttr = 0x700e,
    LabelReq = 0x700f,
    Label = 0x7010,
}

const PDU_FIRST: u32 = 0x7000;
const PDU_LAST: u32 = 0x7010;

impl PduType {
    pub fn from_raw(raw: u32) -> Option<PduType> {
        if !(PDU_FIRST..=PDU_LAST).contains(&raw) {
            return None;
        }
        // safe: the range check above covers every discriminant
        Some(match raw {
            0x7000 => PduType::Error,
            0x7001 => PduType::Result,
            0x7002 => PduType::Profile,
            0x7003 => PduType::Fetch,
            0x7004 => PduType::DescReq,
            0x7005 => PduType::Desc,
            0x7006 => PduType::InstanceReq,
            0x7007 => PduType::Instance,
            0x7008 => PduType::TextReq,
            0x7009 => PduType::Text,
            0x700a => PduType::Creds,
            0x700b => PduType::PmnsIds,
            0x700c => PduType::DescIds,
            0x700d => PduType::Auth,
            0x700e => PduType::AuthAttr,
            0x700f => PduType::LabelReq,
            _ => PduType::Label,
        })
    }

    pub fn name(raw: u32) -> &'static str {
        match PduType::from_raw(raw) {
            Some(PduType::Error) => "ERROR",
            Some(PduType::Result) => "RESULT",
            Some(PduType::Profile) => "PROFILE",
            Some(PduType::Fetch) => "FETCH",
            Some(PduType::DescReq) => "DESC_REQ",
            Some(PduType::Desc) => "DESC",
            Some(PduType::InstanceReq) => "INSTANCE_REQ",
            Some(PduType::Instance) => "INSTANCE",
            Some(PduType::TextReq) => "TEXT_REQ",
            Some(PduType::Text) => "TEXT",
            Some(PduType::Creds) => "CREDS",
            Some(PduType::PmnsIds) => "PMNS_IDS",
            Some(PduType::DescIds) => "DESC_IDS",
            Some(PduType::Auth) => "AUTH",
            Some(PduType::AuthAttr) => "AUTH_ATTR",
            Some(PduType::LabelReq) => "LABEL_REQ",
            Some(PduType::Label) => "LABEL",
            None => "TYPE-?",
        }
    }
}

/// Bytes needed for `len` once padded out to a word boundary.
pub fn padded(len: usize) -> usize {
    (len + WORD - 1) & !(WORD - 1)
}

/// Write `bytes` followed by `~` fill up to the next word boundary.
pub fn put_padded<B: bytes::BufMut>(buf: &mut B, bytes: &[u8]) {
    buf.put_slice(bytes);
    for _ in bytes.len()..padded(bytes.len()) {
        buf.put_u8(b'~');
    }
}

/// One entry of the recent-frame trace ring.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceEntry {
    pub link: u64,
    pub xmit: bool,
    pub typ: u32,
    pub len: usize,
}

const NUMTRACE: usize = 8;

/// Send/receive instrumentation: per-type counters and a ring of the
/// most recent frames in either direction.
#[derive(Default)]
struct Instrumentation {
    sent: fxhash::FxHashMap<u32, u64>,
    received: fxhash::FxHashMap<u32, u64>,
    trace: Vec<TraceEntry>,
    trace_next: usize,
}

// Counter updates are cheap and rare enough for one process-wide lock;
// readers take the same lock.  maxsize lives lock-free in pool.rs.
static INSTRUMENTATION: Mutex<Option<Instrumentation>> = Mutex::new(None);

thread_local! {
    static LAST_LINK: Cell<u64> = Cell::new(0);
}

pub(crate) fn record_frame(link: u64, xmit: bool, typ: u32, len: usize) {
    let mut guard = INSTRUMENTATION.lock();
    let ins = guard.get_or_insert_with(Instrumentation::default);
    let counter = if xmit { &mut ins.sent } else { &mut ins.received };
    *counter.entry(typ).or_insert(0) += 1;
    let entry = TraceEntry {
        link,
        xmit,
        typ,
        len,
    };
    if ins.trace.len() < NUMTRACE {
        ins.trace.push(entry);
    } else {
        let slot = ins.trace_next % NUMTRACE;
        ins.trace[slot] = entry;
    }
    ins.trace_next += 1;
    LAST_LINK.with(|c| c.set(link));
}

/// Totals sent and received for one frame type.
pub fn frame_counts(typ: PduType) -> (u64, u64) {
    let mut guard = INSTRUMENTATION.lock();
    let ins = guard.get_or_insert_with(Instrumentation::default);
    let raw = typ as u32;
    (
        ins.sent.get(&raw).copied().unwrap_or(0),
        ins.received.get(&raw).copied().unwrap_or(0),
    )
}

/// The most recent frames, oldest first.
pub fn frame_trace() -> Vec<TraceEntry> {
    let mut guard = INSTRUMENTATION.lock();
    let ins = guard.get_or_insert_with(Instrumentation::default);
    if ins.trace.len() < NUMTRACE {
        ins.trace.clone()
    } else {
        let split = ins.trace_next % NUMTRACE;
        let mut out = ins.trace[split..].to_vec();
        out.extend_from_slice(&ins.trace[..split]);
        out
    }
}

/// The link most recently used by this thread for a send or receive.
pub fn last_link() -> u64 {
    LAST_LINK.with(|c| c.get())
}

/// Drop all instrumentation and pooled buffers.
pub fn teardown() {
    *INSTRUMENTATION.lock() = None;
    pool::teardown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(padded(0), 0);
        assert_eq!(padded(1), 4);
        assert_eq!(padded(4), 4);
        assert_eq!(padded(5), 8);
    }

    #[test]
    fn pad_fill_is_tilde() {
        let mut buf = Vec::new();
        put_padded(&mut buf, b"abcde");
        assert_eq!(&buf, b"abcde~~~");
    }

    #[test]
    fn type_names() {
        assert_eq!(PduType::name(PduType::Profile as u32), "PROFILE");
        assert_eq!(PduType::name(0x1234), "TYPE-?");
    }

    #[test]
    fn trace_ring_keeps_last_eight() {
        // other tests record frames too; filter on a private link id
        let link = 0xfeed_beef;
        for i in 0..11u32 {
            record_frame(link, true, 0x7000 + (i % 4), 1000 + i as usize);
        }
        let trace = frame_trace();
        assert!(trace.len() <= 8);
        let ours: Vec<&TraceEntry> = trace.iter().filter(|t| t.link == link).collect();
        assert!(!ours.is_empty());
        // the newest of our entries is the last one recorded
        assert_eq!(ours.last().unwrap().len, 1010);
        for pair in ours.windows(2) {
            assert!(pair[0].len < pair[1].len);
        }
    }
}

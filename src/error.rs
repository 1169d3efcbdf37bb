use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the protocol, the expression engine and the
/// archive metadata store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("connect: {0}")]
    Connect(io::Error),
    /// Framing or length/type mismatch on the wire, or a decoded record
    /// that does not satisfy its own declared sizes.
    #[error("ipc: {0}")]
    Ipc(&'static str),
    /// Inbound frame larger than the negotiated ceiling.
    #[error("frame of {0} bytes exceeds the receive ceiling")]
    TooBig(usize),
    #[error("timed out")]
    Timeout,
    /// Unit conversion between incompatible dimensions.
    #[error("impossible value conversion")]
    Conv,
    /// Operand or result type unsuitable for the operation.
    #[error("incompatible metric type")]
    BadType,
    /// Corrupt or short record in an archive file.
    #[error("corrupt archive record")]
    LogRec,
    #[error("unknown archive record type {0}")]
    RecordType(u32),
    #[error("metric type changed between archive records")]
    LogChangeType,
    #[error("metric semantics changed between archive records")]
    LogChangeSem,
    #[error("metric instance domain changed between archive records")]
    LogChangeIndom,
    #[error("metric units changed between archive records")]
    LogChangeUnits,
    #[error("unknown metric id")]
    NoSuchMetric,
    #[error("metric id not in archive")]
    NoSuchMetricLog,
    #[error("unknown instance domain")]
    NoSuchIndom,
    #[error("instance domain not in archive")]
    NoSuchIndomLog,
    #[error("unknown instance")]
    NoSuchInstance,
    #[error("instance not in archive")]
    NoSuchInstanceLog,
    #[error("no labels recorded")]
    NoLabels,
    #[error("no help text recorded")]
    NoHelpText,
    #[error("{0} is not supported")]
    NotSupported(&'static str),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("configuration: {0}")]
    Config(String),
    /// Error code received from a peer that does not map to a local kind.
    #[error("peer error code {0}")]
    Peer(i32),
}

// Wire codes for errors that cross the protocol or live in per-metric
// value-set status words.  Negative, like every status the peer sends.
const C_IPC: i32 = -12400;
const C_TOOBIG: i32 = -12401;
const C_TIMEOUT: i32 = -12402;
const C_CONV: i32 = -12403;
const C_TYPE: i32 = -12404;
const C_LOGREC: i32 = -12405;
const C_RECTYPE: i32 = -12406;
const C_CHANGETYPE: i32 = -12407;
const C_CHANGESEM: i32 = -12408;
const C_CHANGEINDOM: i32 = -12409;
const C_CHANGEUNITS: i32 = -12410;
const C_PMID: i32 = -12411;
const C_PMID_LOG: i32 = -12412;
const C_INDOM: i32 = -12413;
const C_INDOM_LOG: i32 = -12414;
const C_INST: i32 = -12415;
const C_INST_LOG: i32 = -12416;
const C_NOLABELS: i32 = -12417;
const C_NOTEXT: i32 = -12418;
const C_AUTH: i32 = -12419;

impl Error {
    /// Protocol status code for this error, for ERROR PDUs and the
    /// per-metric status slot of a fetch result.
    pub fn code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::Connect(_) | Error::Ipc(_) => C_IPC,
            Error::TooBig(_) => C_TOOBIG,
            Error::Timeout => C_TIMEOUT,
            Error::Conv => C_CONV,
            Error::BadType => C_TYPE,
            Error::LogRec => C_LOGREC,
            Error::RecordType(_) => C_RECTYPE,
            Error::LogChangeType => C_CHANGETYPE,
            Error::LogChangeSem => C_CHANGESEM,
            Error::LogChangeIndom => C_CHANGEINDOM,
            Error::LogChangeUnits => C_CHANGEUNITS,
            Error::NoSuchMetric => C_PMID,
            Error::NoSuchMetricLog => C_PMID_LOG,
            Error::NoSuchIndom => C_INDOM,
            Error::NoSuchIndomLog => C_INDOM_LOG,
            Error::NoSuchInstance => C_INST,
            Error::NoSuchInstanceLog => C_INST_LOG,
            Error::NoLabels => C_NOLABELS,
            Error::NoHelpText => C_NOTEXT,
            Error::Auth(_) => C_AUTH,
            Error::NotSupported(_) | Error::Config(_) => C_IPC,
            Error::Peer(code) => *code,
        }
    }

    /// Reverse of [`Error::code`], for codes received from a peer.
    pub fn from_code(code: i32) -> Error {
        match code {
            C_IPC => Error::Ipc("peer reported an ipc failure"),
            C_TOOBIG => Error::TooBig(0),
            C_TIMEOUT => Error::Timeout,
            C_CONV => Error::Conv,
            C_TYPE => Error::BadType,
            C_LOGREC => Error::LogRec,
            C_RECTYPE => Error::RecordType(0),
            C_CHANGETYPE => Error::LogChangeType,
            C_CHANGESEM => Error::LogChangeSem,
            C_CHANGEINDOM => Error::LogChangeIndom,
            C_CHANGEUNITS => Error::LogChangeUnits,
            C_PMID => Error::NoSuchMetric,
            C_PMID_LOG => Error::NoSuchMetricLog,
            C_INDOM => Error::NoSuchIndom,
            C_INDOM_LOG => Error::NoSuchIndomLog,
            C_INST => Error::NoSuchInstance,
            C_INST_LOG => Error::NoSuchInstanceLog,
            C_NOLABELS => Error::NoLabels,
            C_NOTEXT => Error::NoHelpText,
            C_AUTH => Error::Auth("peer reported an authentication failure".into()),
            other => Error::Peer(other),
        }
    }
}

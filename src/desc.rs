use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::ident::{IndomId, MetricId};
use crate::units::Units;

/// Value type of a metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricType {
    I32,
    U32,
    I64,
    U64,
    Float,
    Double,
    String,
    Aggregate,
    Event,
    NoSupport,
}

impl MetricType {
    pub fn as_raw(self) -> i32 {
        match self {
            MetricType::I32 => 0,
            MetricType::U32 => 1,
            MetricType::I64 => 2,
            MetricType::U64 => 3,
            MetricType::Float => 4,
            MetricType::Double => 5,
            MetricType::String => 6,
            MetricType::Aggregate => 7,
            MetricType::Event => 9,
            MetricType::NoSupport => -1,
        }
    }

    pub fn from_raw(raw: i32) -> Result<MetricType> {
        Ok(match raw {
            0 => MetricType::I32,
            1 => MetricType::U32,
            2 => MetricType::I64,
            3 => MetricType::U64,
            4 => MetricType::Float,
            5 => MetricType::Double,
            6 => MetricType::String,
            7 | 8 => MetricType::Aggregate,
            9 | 10 => MetricType::Event,
            -1 => MetricType::NoSupport,
            _ => return Err(Error::BadType),
        })
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            MetricType::I32
                | MetricType::U32
                | MetricType::I64
                | MetricType::U64
                | MetricType::Float
                | MetricType::Double
        )
    }

    /// Values of this type travel inside the value word of a fetch
    /// result; everything else is carried in a value block.
    pub fn is_insitu(self) -> bool {
        matches!(self, MetricType::I32 | MetricType::U32)
    }
}

/// Semantics of a metric's values over time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Semantics {
    Counter,
    Instant,
    Discrete,
}

impl Semantics {
    pub fn as_raw(self) -> i32 {
        match self {
            Semantics::Counter => 1,
            Semantics::Instant => 3,
            Semantics::Discrete => 4,
        }
    }

    pub fn from_raw(raw: i32) -> Result<Semantics> {
        Ok(match raw {
            1 => Semantics::Counter,
            3 => Semantics::Instant,
            4 => Semantics::Discrete,
            _ => return Err(Error::BadType),
        })
    }
}

/// Per-metric schema: identifier, value type, instance domain, semantics
/// and unit dimensions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Descriptor {
    pub pmid: MetricId,
    pub typ: MetricType,
    pub indom: IndomId,
    pub sem: Semantics,
    pub units: Units,
}

/// Encoded size of a descriptor on the wire and in archive records.
pub const DESC_WIRE_SIZE: usize = 20;

impl Descriptor {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.pmid.0);
        buf.put_i32(self.typ.as_raw());
        buf.put_u32(self.indom.0);
        buf.put_i32(self.sem.as_raw());
        buf.put_u32(self.units.pack());
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Descriptor> {
        if buf.remaining() < DESC_WIRE_SIZE {
            return Err(Error::Ipc("short descriptor"));
        }
        let pmid = MetricId(buf.get_u32());
        let typ = MetricType::from_raw(buf.get_i32())?;
        let indom = IndomId(buf.get_u32());
        let sem = Semantics::from_raw(buf.get_i32())?;
        let units = Units::unpack(buf.get_u32());
        Ok(Descriptor {
            pmid,
            typ,
            indom,
            sem,
            units,
        })
    }
}

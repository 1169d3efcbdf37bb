use std::convert::TryInto;

use bytes::{Buf, BufMut};

use crate::desc::MetricType;
use crate::error::{Error, Result};

/// A single metric value.  String, aggregate and event payloads own
/// their buffers.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Aggregate(Vec<u8>),
    Event(Vec<u8>),
}

/// Binary operators of the expression engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Leq,
    Eq,
    Geq,
    Gt,
    Neq,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Leq | BinOp::Eq | BinOp::Geq | BinOp::Gt | BinOp::Neq
        )
    }

    pub fn is_boolean(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

/// The fixed type-promotion table: signed and unsigned 32/64-bit widen
/// to the wider type, anything with a float widens to float, anything
/// with a double widens to double.
pub fn promote(a: MetricType, b: MetricType) -> Result<MetricType> {
    use MetricType::*;
    if !a.is_numeric() || !b.is_numeric() {
        return Err(Error::BadType);
    }
    let rank = |t: MetricType| match t {
        I32 => 0,
        U32 => 1,
        I64 => 2,
        U64 => 3,
        Float => 4,
        Double => 5,
        _ => unreachable!(),
    };
    let table: [[MetricType; 6]; 6] = [
        [I32, U32, I64, U64, Float, Double],
        [U32, U32, I64, U64, Float, Double],
        [I64, I64, I64, U64, Float, Double],
        [U64, U64, U64, U64, Float, Double],
        [Float, Float, Float, Float, Float, Double],
        [Double, Double, Double, Double, Double, Double],
    ];
    Ok(table[rank(a)][rank(b)])
}

impl Value {
    pub fn metric_type(&self) -> MetricType {
        match self {
            Value::I32(_) => MetricType::I32,
            Value::U32(_) => MetricType::U32,
            Value::I64(_) => MetricType::I64,
            Value::U64(_) => MetricType::U64,
            Value::Float(_) => MetricType::Float,
            Value::Double(_) => MetricType::Double,
            Value::String(_) => MetricType::String,
            Value::Aggregate(_) => MetricType::Aggregate,
            Value::Event(_) => MetricType::Event,
        }
    }

    pub fn zero(typ: MetricType) -> Result<Value> {
        Ok(match typ {
            MetricType::I32 => Value::I32(0),
            MetricType::U32 => Value::U32(0),
            MetricType::I64 => Value::I64(0),
            MetricType::U64 => Value::U64(0),
            MetricType::Float => Value::Float(0.0),
            MetricType::Double => Value::Double(0.0),
            _ => return Err(Error::BadType),
        })
    }

    pub fn as_f64(&self) -> Result<f64> {
        Ok(match self {
            Value::I32(v) => *v as f64,
            Value::U32(v) => *v as f64,
            Value::I64(v) => *v as f64,
            Value::U64(v) => *v as f64,
            Value::Float(v) => *v as f64,
            Value::Double(v) => *v,
            _ => return Err(Error::BadType),
        })
    }

    pub fn is_nonzero(&self) -> Result<bool> {
        Ok(match self {
            Value::I32(v) => *v != 0,
            Value::U32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            Value::U64(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Double(v) => *v != 0.0,
            _ => return Err(Error::BadType),
        })
    }

    /// Promote a numeric value to `typ` without changing magnitude.
    pub fn promote_to(&self, typ: MetricType) -> Result<Value> {
        Ok(match typ {
            MetricType::I32 | MetricType::U32 => self.clone(),
            MetricType::I64 => match self {
                Value::I32(v) => Value::I64(*v as i64),
                Value::U32(v) => Value::I64(*v as i64),
                other => other.clone(),
            },
            MetricType::U64 => match self {
                Value::I32(v) => Value::U64(*v as u64),
                Value::U32(v) => Value::U64(*v as u64),
                other => other.clone(),
            },
            MetricType::Float => match self {
                Value::I32(v) => Value::Float(*v as f32),
                Value::U32(v) => Value::Float(*v as f32),
                Value::I64(v) => Value::Float(*v as f32),
                Value::U64(v) => Value::Float(*v as f32),
                other => other.clone(),
            },
            MetricType::Double => Value::Double(self.as_f64()?),
            _ => return Err(Error::BadType),
        })
    }

    pub fn negate(&self) -> Result<Value> {
        Ok(match self {
            Value::I32(v) => Value::I32(-*v),
            Value::U32(v) => Value::I32(-(*v as i64 as i32)),
            Value::I64(v) => Value::I64(-*v),
            Value::U64(v) => Value::I64(-(*v as i64)),
            Value::Float(v) => Value::Float(-*v),
            Value::Double(v) => Value::Double(-*v),
            _ => return Err(Error::BadType),
        })
    }

    /// Boolean negation; the result is always an unsigned 32-bit flag.
    pub fn not(&self) -> Result<Value> {
        Ok(Value::U32(if self.is_nonzero()? { 0 } else { 1 }))
    }
}

/// `result = a <op> b` at the given result type.
///
/// Operands are promoted to the result type first.  When the result type
/// is Double, `lscale` and `rscale` carry the unit-rescale multipliers
/// for the left and right operands.  Division is only defined for double
/// results; division by zero yields 0, not an error.
pub fn bin_op(
    typ: MetricType,
    op: BinOp,
    a: &Value,
    lscale: f64,
    b: &Value,
    rscale: f64,
) -> Result<Value> {
    macro_rules! arith {
        ($l:expr, $r:expr, $wrap:path) => {
            match op {
                BinOp::Add => $wrap($l.wrapping_add($r)),
                BinOp::Sub => $wrap($l.wrapping_sub($r)),
                BinOp::Mul => $wrap($l.wrapping_mul($r)),
                BinOp::Div => return Err(Error::BadType),
                BinOp::Lt => $wrap(($l < $r) as _),
                BinOp::Leq => $wrap(($l <= $r) as _),
                BinOp::Eq => $wrap(($l == $r) as _),
                BinOp::Geq => $wrap(($l >= $r) as _),
                BinOp::Gt => $wrap(($l > $r) as _),
                BinOp::Neq => $wrap(($l != $r) as _),
                BinOp::And => $wrap(($l != 0 && $r != 0) as _),
                BinOp::Or => $wrap(($l != 0 || $r != 0) as _),
            }
        };
    }

    let res = match typ {
        MetricType::I32 => {
            let (l, r) = match (a.promote_to(typ)?, b.promote_to(typ)?) {
                (Value::I32(l), Value::I32(r)) => (l, r),
                _ => return Err(Error::BadType),
            };
            arith!(l, r, Value::I32)
        }
        MetricType::U32 => {
            let l = match a.promote_to(typ)? {
                Value::I32(v) => v as u32,
                Value::U32(v) => v,
                _ => return Err(Error::BadType),
            };
            let r = match b.promote_to(typ)? {
                Value::I32(v) => v as u32,
                Value::U32(v) => v,
                _ => return Err(Error::BadType),
            };
            arith!(l, r, Value::U32)
        }
        MetricType::I64 => {
            let (l, r) = match (a.promote_to(typ)?, b.promote_to(typ)?) {
                (Value::I64(l), Value::I64(r)) => (l, r),
                _ => return Err(Error::BadType),
            };
            arith!(l, r, Value::I64)
        }
        MetricType::U64 => {
            let l = match a.promote_to(typ)? {
                Value::I64(v) => v as u64,
                Value::U64(v) => v,
                _ => return Err(Error::BadType),
            };
            let r = match b.promote_to(typ)? {
                Value::I64(v) => v as u64,
                Value::U64(v) => v,
                _ => return Err(Error::BadType),
            };
            arith!(l, r, Value::U64)
        }
        MetricType::Float => {
            let l = match a.promote_to(typ)? {
                Value::Float(v) => v,
                _ => return Err(Error::BadType),
            };
            let r = match b.promote_to(typ)? {
                Value::Float(v) => v,
                _ => return Err(Error::BadType),
            };
            match op {
                BinOp::Add => Value::Float(l + r),
                BinOp::Sub => Value::Float(l - r),
                BinOp::Mul => Value::Float(l * r),
                BinOp::Div => return Err(Error::BadType),
                BinOp::Lt => Value::Float((l < r) as i32 as f32),
                BinOp::Leq => Value::Float((l <= r) as i32 as f32),
                BinOp::Eq => Value::Float((l == r) as i32 as f32),
                BinOp::Geq => Value::Float((l >= r) as i32 as f32),
                BinOp::Gt => Value::Float((l > r) as i32 as f32),
                BinOp::Neq => Value::Float((l != r) as i32 as f32),
                BinOp::And => Value::Float((l != 0.0 && r != 0.0) as i32 as f32),
                BinOp::Or => Value::Float((l != 0.0 || r != 0.0) as i32 as f32),
            }
        }
        MetricType::Double => {
            let l = a.as_f64()? * lscale;
            let r = b.as_f64()? * rscale;
            match op {
                BinOp::Add => Value::Double(l + r),
                BinOp::Sub => Value::Double(l - r),
                BinOp::Mul => Value::Double(l * r),
                BinOp::Div => {
                    if r == 0.0 {
                        Value::Double(0.0)
                    } else {
                        Value::Double(l / r)
                    }
                }
                BinOp::Lt => Value::Double((l < r) as i32 as f64),
                BinOp::Leq => Value::Double((l <= r) as i32 as f64),
                BinOp::Eq => Value::Double((l == r) as i32 as f64),
                BinOp::Geq => Value::Double((l >= r) as i32 as f64),
                BinOp::Gt => Value::Double((l > r) as i32 as f64),
                BinOp::Neq => Value::Double((l != r) as i32 as f64),
                BinOp::And => Value::Double((l != 0.0 && r != 0.0) as i32 as f64),
                BinOp::Or => Value::Double((l != 0.0 || r != 0.0) as i32 as f64),
            }
        }
        _ => return Err(Error::BadType),
    };
    Ok(res)
}

/// Comparison and boolean results are stored as unsigned 32-bit values
/// whatever type the comparison itself was performed at.
pub fn as_u32_flag(v: &Value) -> Value {
    let flag = match v {
        Value::I32(x) => *x as u32,
        Value::U32(x) => *x,
        Value::I64(x) => *x as u32,
        Value::U64(x) => *x as u32,
        Value::Float(x) => *x as u32,
        Value::Double(x) => *x as u32,
        _ => 0,
    };
    Value::U32(flag)
}

/// Non-insitu values travel as length-prefixed blocks: a 4-byte header
/// holding `vtype:8 | vlen:24` (vlen includes the header) followed by
/// the payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueBlock {
    pub typ: MetricType,
    pub payload: Vec<u8>,
}

pub const VAL_HDR_SIZE: usize = 4;
const VAL_LEN_MAX: usize = 0x00ff_ffff;

impl ValueBlock {
    pub fn wire_len(&self) -> usize {
        VAL_HDR_SIZE + self.payload.len()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let vlen = (self.wire_len().min(VAL_LEN_MAX)) as u32;
        let vtype = (self.typ.as_raw() as u32) & 0xff;
        buf.put_u32(vtype << 24 | vlen);
        buf.put_slice(&self.payload);
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<ValueBlock> {
        if buf.remaining() < VAL_HDR_SIZE {
            return Err(Error::Ipc("short value block"));
        }
        let word = buf.get_u32();
        let vlen = (word & 0x00ff_ffff) as usize;
        let vtype = ((word >> 24) & 0xff) as i8 as i32;
        if vlen < VAL_HDR_SIZE || vlen - VAL_HDR_SIZE > buf.remaining() {
            return Err(Error::Ipc("value block length exceeds frame"));
        }
        let typ = MetricType::from_raw(vtype)?;
        let mut payload = vec![0u8; vlen - VAL_HDR_SIZE];
        buf.copy_to_slice(&mut payload);
        Ok(ValueBlock { typ, payload })
    }

    /// Materialise a value into its block form.  Only non-insitu types
    /// have a block representation.
    pub fn from_value(value: &Value) -> Result<ValueBlock> {
        let (typ, payload) = match value {
            Value::I64(v) => (MetricType::I64, v.to_be_bytes().to_vec()),
            Value::U64(v) => (MetricType::U64, v.to_be_bytes().to_vec()),
            Value::Float(v) => (MetricType::Float, v.to_be_bytes().to_vec()),
            Value::Double(v) => (MetricType::Double, v.to_be_bytes().to_vec()),
            Value::String(s) => (MetricType::String, s.as_bytes().to_vec()),
            Value::Aggregate(b) => (MetricType::Aggregate, b.clone()),
            Value::Event(b) => (MetricType::Event, b.clone()),
            Value::I32(_) | Value::U32(_) => return Err(Error::BadType),
        };
        Ok(ValueBlock { typ, payload })
    }

    /// Interpret the payload at the block's declared type.  A payload of
    /// the wrong width for the type is a protocol error.
    pub fn to_value(&self) -> Result<Value> {
        fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N]> {
            payload
                .try_into()
                .map_err(|_| Error::Ipc("value block width does not match type"))
        }
        Ok(match self.typ {
            MetricType::I64 => Value::I64(i64::from_be_bytes(fixed(&self.payload)?)),
            MetricType::U64 => Value::U64(u64::from_be_bytes(fixed(&self.payload)?)),
            MetricType::Float => Value::Float(f32::from_be_bytes(fixed(&self.payload)?)),
            MetricType::Double => Value::Double(f64::from_be_bytes(fixed(&self.payload)?)),
            MetricType::String => Value::String(
                String::from_utf8(self.payload.clone())
                    .map_err(|_| Error::Ipc("string value is not utf-8"))?,
            ),
            MetricType::Aggregate => Value::Aggregate(self.payload.clone()),
            MetricType::Event => Value::Event(self.payload.clone()),
            _ => return Err(Error::BadType),
        })
    }
}

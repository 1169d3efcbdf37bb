use crate::desc::MetricType;
use crate::ident::{InstId, MetricId};
use crate::timestamp::Timestamp;
use crate::value::{Value, ValueBlock};

/// One instance's value inside a fetch result.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchValue {
    pub inst: InstId,
    pub value: WireValue,
}

/// How a value travelled: packed into the 32-bit value word, or in a
/// length-prefixed value block.
#[derive(Clone, Debug, PartialEq)]
pub enum WireValue {
    Insitu(i32),
    Block(ValueBlock),
}

impl WireValue {
    pub fn from_value(value: &Value) -> crate::error::Result<WireValue> {
        Ok(match value {
            Value::I32(v) => WireValue::Insitu(*v),
            Value::U32(v) => WireValue::Insitu(*v as i32),
            other => WireValue::Block(ValueBlock::from_value(other)?),
        })
    }

    /// Interpret this wire value at the descriptor-declared type.
    pub fn to_value(&self, typ: MetricType) -> crate::error::Result<Value> {
        match self {
            WireValue::Insitu(raw) => match typ {
                MetricType::I32 => Ok(Value::I32(*raw)),
                MetricType::U32 => Ok(Value::U32(*raw as u32)),
                // an insitu word where a block type was declared is a
                // mismatch between descriptor and result
                _ => Err(crate::error::Error::LogRec),
            },
            WireValue::Block(block) => {
                if block.typ != typ {
                    return Err(crate::error::Error::LogRec);
                }
                block.to_value()
            }
        }
    }
}

/// The values fetched for one metric: either a list of instance values
/// or a per-metric error status.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueSet {
    pub pmid: MetricId,
    pub values: Result<Vec<FetchValue>, i32>,
}

impl ValueSet {
    pub fn error(pmid: MetricId, code: i32) -> ValueSet {
        ValueSet {
            pmid,
            values: Err(code),
        }
    }

    pub fn num_values(&self) -> i32 {
        match &self.values {
            Ok(vals) => vals.len() as i32,
            Err(code) => *code,
        }
    }
}

/// A decoded fetch response.  Dropping the result releases any pinned
/// receive buffer it was decoded from; all values here own their
/// payloads.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchResult {
    pub timestamp: Timestamp,
    pub vsets: Vec<ValueSet>,
}

impl FetchResult {
    pub fn new(timestamp: Timestamp) -> FetchResult {
        FetchResult {
            timestamp,
            vsets: Vec::new(),
        }
    }

    pub fn lookup(&self, pmid: MetricId) -> Option<&ValueSet> {
        self.vsets.iter().find(|vs| vs.pmid == pmid)
    }
}

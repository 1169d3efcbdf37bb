use std::convert::TryFrom;

use bytes::{Buf, BufMut};
use fxhash::FxHashMap;
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::ident::InstId;

/// What a label set is attached to.  The values double as the on-disk
/// and on-wire type word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LabelTarget {
    Context,
    Domain,
    Indom,
    Cluster,
    Item,
    Instances,
}

impl LabelTarget {
    pub fn as_raw(self) -> u32 {
        match self {
            LabelTarget::Context => 1 << 0,
            LabelTarget::Domain => 1 << 1,
            LabelTarget::Indom => 1 << 2,
            LabelTarget::Cluster => 1 << 3,
            LabelTarget::Item => 1 << 4,
            LabelTarget::Instances => 1 << 5,
        }
    }

    pub fn from_raw(raw: u32) -> Result<LabelTarget> {
        // strip the compound/optional modifier bits
        Ok(match raw & 0x3f {
            0x01 => LabelTarget::Context,
            0x02 => LabelTarget::Domain,
            0x04 => LabelTarget::Indom,
            0x08 => LabelTarget::Cluster,
            0x10 => LabelTarget::Item,
            0x20 => LabelTarget::Instances,
            _ => return Err(Error::Ipc("unknown label target")),
        })
    }
}

/// An unordered name → JSON value map, optionally bound to one instance
/// of an instance domain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelSet {
    /// Instance the set applies to; None for non-instance targets.
    pub inst: Option<InstId>,
    pub labels: FxHashMap<String, Json>,
}

impl LabelSet {
    pub fn new(inst: Option<InstId>) -> LabelSet {
        LabelSet {
            inst,
            labels: FxHashMap::default(),
        }
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, value: Json) {
        self.labels.insert(name.into(), value);
    }

    /// Two label sets are equal iff the name → value multisets match.
    /// HashMap equality gives exactly that, plus the instance binding.
    pub fn same(&self, other: &LabelSet) -> bool {
        self.inst == other.inst && self.labels == other.labels
    }

    fn to_json(&self) -> Json {
        Json::Object(
            self.labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn from_json(inst: Option<InstId>, json: &Json) -> Result<LabelSet> {
        let map = json
            .as_object()
            .ok_or(Error::Ipc("label payload is not a JSON object"))?;
        let mut set = LabelSet::new(inst);
        for (k, v) in map {
            set.labels.insert(k.clone(), v.clone());
        }
        Ok(set)
    }
}

/// Encode a group of label sets: `nsets:i32` then per set
/// `inst:i32 | jsonlen:u32 | json`.
pub fn encode_label_sets<B: BufMut>(sets: &[LabelSet], buf: &mut B) {
    buf.put_i32(sets.len() as i32);
    for set in sets {
        buf.put_i32(set.inst.unwrap_or(crate::ident::INST_NULL));
        let json = set.to_json().to_string();
        buf.put_u32(json.len() as u32);
        buf.put_slice(json.as_bytes());
    }
}

pub fn decode_label_sets<B: Buf>(buf: &mut B, instances: bool) -> Result<Vec<LabelSet>> {
    if buf.remaining() < 4 {
        return Err(Error::Ipc("short label record"));
    }
    let nsets = buf.get_i32();
    if nsets < 0 || nsets as usize > buf.remaining() / 8 {
        return Err(Error::Ipc("label set count exceeds record"));
    }
    let mut sets = Vec::with_capacity(nsets as usize);
    for _ in 0..nsets {
        if buf.remaining() < 8 {
            return Err(Error::Ipc("short label set"));
        }
        let inst = buf.get_i32();
        let jsonlen = buf.get_u32() as usize;
        if jsonlen > buf.remaining() {
            return Err(Error::Ipc("label json exceeds record"));
        }
        let mut raw = vec![0u8; jsonlen];
        buf.copy_to_slice(&mut raw);
        let json: Json = serde_json::from_slice(&raw)
            .map_err(|_| Error::Ipc("label payload is not valid JSON"))?;
        let inst = if instances { Some(inst) } else { None };
        sets.push(LabelSet::from_json(inst, &json)?);
    }
    Ok(sets)
}

impl TryFrom<&str> for LabelSet {
    type Error = Error;

    fn try_from(json: &str) -> Result<LabelSet> {
        let parsed: Json =
            serde_json::from_str(json).map_err(|_| Error::Ipc("label payload is not valid JSON"))?;
        LabelSet::from_json(None, &parsed)
    }
}

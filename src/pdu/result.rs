//! RESULT frames carrying a fetch response.

use bytes::{Buf, BufMut, BytesMut};

use super::transport::{new_frame, seal, Frame};
use super::{padded, PduType};
use crate::error::{Error, Result};
use crate::ident::MetricId;
use crate::result::{FetchResult, FetchValue, ValueSet, WireValue};
use crate::timestamp::Timestamp;
use crate::value::{ValueBlock, VAL_HDR_SIZE};

/// Per-value-set format words.
const VAL_INSITU: i32 = 0;
const VAL_BLOCK: i32 = 1;

// body layout:
//   timestamp (legacy two words) | numpmid
//   per set: pmid | numval | [valfmt]
//   per value: inst | (insitu word  -or-  value block, word padded)

pub fn encode(from: u32, result: &FetchResult) -> BytesMut {
    let mut buf = new_frame(PduType::Result, from);
    result.timestamp.encode_legacy(&mut buf);
    buf.put_i32(result.vsets.len() as i32);
    for vset in &result.vsets {
        buf.put_u32(vset.pmid.0);
        match &vset.values {
            Err(code) => buf.put_i32(*code),
            Ok(values) => {
                buf.put_i32(values.len() as i32);
                let valfmt = match values.first() {
                    Some(FetchValue {
                        value: WireValue::Block(_),
                        ..
                    }) => VAL_BLOCK,
                    _ => VAL_INSITU,
                };
                buf.put_i32(valfmt);
                for value in values {
                    buf.put_i32(value.inst);
                    match &value.value {
                        WireValue::Insitu(word) => buf.put_i32(*word),
                        WireValue::Block(block) => {
                            block.encode(&mut buf);
                            for _ in block.wire_len()..padded(block.wire_len()) {
                                buf.put_u8(b'~');
                            }
                        }
                    }
                }
            }
        }
    }
    seal(&mut buf);
    buf
}

pub fn decode(frame: &Frame) -> Result<FetchResult> {
    let mut body = frame.body();
    if body.len() < 12 {
        return Err(Error::Ipc("result frame below minimum size"));
    }
    let timestamp = Timestamp::decode_legacy(&mut body)?;
    let numpmid = body.get_i32();
    if numpmid < 0 {
        return Err(Error::Ipc("negative metric count in result"));
    }
    let numpmid = numpmid as usize;
    if numpmid > body.remaining() / 8 {
        return Err(Error::Ipc("metric count exceeds result frame"));
    }

    let mut result = FetchResult::new(timestamp);
    for _ in 0..numpmid {
        if body.remaining() < 8 {
            return Err(Error::Ipc("truncated value set"));
        }
        let pmid = MetricId(body.get_u32());
        let numval = body.get_i32();
        if numval < 0 {
            result.vsets.push(ValueSet::error(pmid, numval));
            continue;
        }
        let numval = numval as usize;
        if body.remaining() < 4 {
            return Err(Error::Ipc("value set without format word"));
        }
        let valfmt = body.get_i32();
        if valfmt != VAL_INSITU && valfmt != VAL_BLOCK {
            return Err(Error::Ipc("unknown value format"));
        }
        if numval > body.remaining() / 8 {
            return Err(Error::Ipc("value count exceeds result frame"));
        }
        let mut values = Vec::with_capacity(numval);
        for _ in 0..numval {
            if body.remaining() < 8 {
                return Err(Error::Ipc("truncated value"));
            }
            let inst = body.get_i32();
            let value = if valfmt == VAL_INSITU {
                WireValue::Insitu(body.get_i32())
            } else {
                let block = ValueBlock::decode(&mut body)?;
                let pad = padded(block.wire_len()) - block.wire_len();
                if pad > body.remaining() {
                    return Err(Error::Ipc("value block padding exceeds frame"));
                }
                body.advance(pad);
                WireValue::Block(block)
            };
            values.push(FetchValue { inst, value });
        }
        result.vsets.push(ValueSet {
            pmid,
            values: Ok(values),
        });
    }
    if body.has_remaining() {
        return Err(Error::Ipc("trailing bytes after result"));
    }
    Ok(result)
}

/// Smallest encoding of one value block, for bounds arithmetic.
pub const MIN_BLOCK_SIZE: usize = VAL_HDR_SIZE;

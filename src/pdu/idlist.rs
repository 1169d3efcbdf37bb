//! PMNS_IDS / DESC_IDS metric-id lists and the FETCH request.

use bytes::{Buf, BufMut, BytesMut};

use super::transport::{new_frame, seal, Frame};
use super::PduType;
use crate::error::{Error, Result};
use crate::ident::MetricId;

/// DESC_IDS carries this in its status word instead of a real status.
const DESC_IDS_STS: i32 = -1;

pub fn encode_pmns_ids(from: u32, status: i32, ids: &[MetricId]) -> BytesMut {
    encode_idlist(PduType::PmnsIds, from, status, ids)
}

pub fn encode_desc_ids(from: u32, ids: &[MetricId]) -> BytesMut {
    encode_idlist(PduType::DescIds, from, DESC_IDS_STS, ids)
}

fn encode_idlist(typ: PduType, from: u32, status: i32, ids: &[MetricId]) -> BytesMut {
    let mut buf = new_frame(typ, from);
    buf.put_i32(status);
    buf.put_i32(ids.len() as i32);
    for id in ids {
        buf.put_u32(id.0);
    }
    seal(&mut buf);
    buf
}

pub fn decode_idlist(frame: &Frame) -> Result<(i32, Vec<MetricId>)> {
    let mut body = frame.body();
    if body.len() < 8 {
        return Err(Error::Ipc("id list below minimum size"));
    }
    let status = body.get_i32();
    let numids = body.get_i32();
    if numids <= 0 {
        return Err(Error::Ipc("id list count must be positive"));
    }
    let numids = numids as usize;
    if numids != body.remaining() / 4 || body.remaining() % 4 != 0 {
        return Err(Error::Ipc("id list length mismatch"));
    }
    let mut ids = Vec::with_capacity(numids);
    for _ in 0..numids {
        ids.push(MetricId(body.get_u32()));
    }
    Ok((status, ids))
}

pub fn decode_desc_ids(frame: &Frame) -> Result<Vec<MetricId>> {
    let (status, ids) = decode_idlist(frame)?;
    if status != DESC_IDS_STS {
        return Err(Error::Ipc("descriptor id list carries a status"));
    }
    Ok(ids)
}

/// FETCH: context slot plus the metric ids to sample.
pub fn encode_fetch(from: u32, ctxid: u32, ids: &[MetricId]) -> BytesMut {
    let mut buf = new_frame(PduType::Fetch, from);
    buf.put_u32(ctxid);
    // unused timestamp slot kept for protocol compatibility
    buf.put_u64(0);
    buf.put_i32(ids.len() as i32);
    for id in ids {
        buf.put_u32(id.0);
    }
    seal(&mut buf);
    buf
}

pub fn decode_fetch(frame: &Frame) -> Result<(u32, Vec<MetricId>)> {
    let mut body = frame.body();
    if body.len() < 16 {
        return Err(Error::Ipc("fetch frame below minimum size"));
    }
    let ctxid = body.get_u32();
    body.advance(8);
    let numids = body.get_i32();
    if numids <= 0 {
        return Err(Error::Ipc("fetch must name at least one metric"));
    }
    let numids = numids as usize;
    if numids != body.remaining() / 4 || body.remaining() % 4 != 0 {
        return Err(Error::Ipc("fetch id list length mismatch"));
    }
    let mut ids = Vec::with_capacity(numids);
    for _ in 0..numids {
        ids.push(MetricId(body.get_u32()));
    }
    Ok((ctxid, ids))
}

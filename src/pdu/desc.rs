//! DESC_REQ / DESC descriptor frames and the ERROR status frame.

use bytes::{Buf, BufMut, BytesMut};

use super::transport::{new_frame, seal, Frame};
use super::PduType;
use crate::desc::{Descriptor, DESC_WIRE_SIZE};
use crate::error::{Error, Result};
use crate::ident::MetricId;

pub fn encode_req(from: u32, pmid: MetricId) -> BytesMut {
    let mut buf = new_frame(PduType::DescReq, from);
    buf.put_u32(pmid.0);
    seal(&mut buf);
    buf
}

pub fn decode_req(frame: &Frame) -> Result<MetricId> {
    let mut body = frame.body();
    if body.len() != 4 {
        return Err(Error::Ipc("descriptor request size mismatch"));
    }
    Ok(MetricId(body.get_u32()))
}

pub fn encode_desc(from: u32, desc: &Descriptor) -> BytesMut {
    let mut buf = new_frame(PduType::Desc, from);
    desc.encode(&mut buf);
    seal(&mut buf);
    buf
}

pub fn decode_desc(frame: &Frame) -> Result<Descriptor> {
    let mut body = frame.body();
    if body.len() != DESC_WIRE_SIZE {
        return Err(Error::Ipc("descriptor frame size mismatch"));
    }
    Descriptor::decode(&mut body)
}

pub fn encode_error(from: u32, code: i32) -> BytesMut {
    let mut buf = new_frame(PduType::Error, from);
    buf.put_i32(code);
    seal(&mut buf);
    buf
}

pub fn decode_error(frame: &Frame) -> Result<i32> {
    let mut body = frame.body();
    if body.len() != 4 {
        return Err(Error::Ipc("error frame size mismatch"));
    }
    Ok(body.get_i32())
}

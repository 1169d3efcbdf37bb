//! INSTANCE_REQ and INSTANCE frames.

use bytes::{Buf, BufMut, BytesMut};

use super::transport::{new_frame, seal, Frame};
use super::{padded, put_padded, PduType};
use crate::error::{Error, Result};
use crate::ident::{IndomId, InstId, INST_NULL};

/// Request the instances of `indom`: all of them (`inst` null, no
/// name), one by id, or one by external name.
pub fn encode_req(from: u32, indom: IndomId, inst: Option<InstId>, name: Option<&str>) -> BytesMut {
    let mut buf = new_frame(PduType::InstanceReq, from);
    buf.put_u32(indom.0);
    // unused timestamp slot kept for protocol compatibility
    buf.put_u64(0);
    buf.put_i32(inst.unwrap_or(INST_NULL));
    match name {
        None => buf.put_i32(0),
        Some(name) => {
            buf.put_i32(name.len() as i32);
            put_padded(&mut buf, name.as_bytes());
        }
    }
    seal(&mut buf);
    buf
}

pub fn decode_req(frame: &Frame) -> Result<(IndomId, Option<InstId>, Option<String>)> {
    let mut body = frame.body();
    if body.len() < 20 {
        return Err(Error::Ipc("instance request below minimum size"));
    }
    let indom = IndomId(body.get_u32());
    body.advance(8);
    let inst = body.get_i32();
    let namelen = body.get_i32();
    if namelen < 0 {
        return Err(Error::Ipc("negative name length"));
    }
    let name = if namelen == 0 {
        None
    } else {
        let namelen = namelen as usize;
        if padded(namelen) > body.remaining() {
            return Err(Error::Ipc("instance name exceeds frame"));
        }
        let name = std::str::from_utf8(&body[..namelen])
            .map_err(|_| Error::Ipc("instance name is not utf-8"))?
            .to_string();
        body.advance(padded(namelen));
        Some(name)
    };
    if body.has_remaining() {
        return Err(Error::Ipc("trailing bytes after instance request"));
    }
    let inst = if inst == INST_NULL { None } else { Some(inst) };
    Ok((indom, inst, name))
}

/// The instances of one indom at one point in time.  `instances` and
/// `names` are `None` when the sender supplied no ids / no names.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceReply {
    pub indom: IndomId,
    pub count: usize,
    pub instances: Option<Vec<InstId>>,
    pub names: Option<Vec<String>>,
}

pub fn encode_reply(
    from: u32,
    indom: IndomId,
    instances: Option<&[InstId]>,
    names: Option<&[String]>,
) -> BytesMut {
    let count = instances
        .map(|i| i.len())
        .or_else(|| names.map(|n| n.len()))
        .unwrap_or(0);
    let mut buf = new_frame(PduType::Instance, from);
    buf.put_u32(indom.0);
    buf.put_i32(count as i32);
    for i in 0..count {
        match instances {
            Some(ids) => buf.put_i32(ids[i]),
            None => buf.put_i32(INST_NULL),
        }
        match names {
            Some(names) => {
                let name = names[i].as_bytes();
                buf.put_i32(name.len() as i32);
                put_padded(&mut buf, name);
            }
            None => buf.put_i32(0),
        }
    }
    seal(&mut buf);
    buf
}

/// Decode an INSTANCE frame.  If every id was null the instance column
/// is dropped; if every name was empty the name column is dropped.
pub fn decode_reply(frame: &Frame) -> Result<InstanceReply> {
    let mut body = frame.body();
    if body.len() < 8 {
        return Err(Error::Ipc("instance reply below minimum size"));
    }
    let indom = IndomId(body.get_u32());
    let count = body.get_i32();
    if count < 0 {
        return Err(Error::Ipc("negative instance count"));
    }
    let count = count as usize;
    if count > body.remaining() / 8 {
        return Err(Error::Ipc("instance count exceeds frame"));
    }

    let mut instances = Vec::with_capacity(count);
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        if body.remaining() < 8 {
            return Err(Error::Ipc("truncated instance entry"));
        }
        let inst = body.get_i32();
        let namelen = body.get_i32();
        if namelen < 0 {
            return Err(Error::Ipc("negative name length"));
        }
        let namelen = namelen as usize;
        if padded(namelen) > body.remaining() {
            return Err(Error::Ipc("instance name exceeds frame"));
        }
        let name = std::str::from_utf8(&body[..namelen])
            .map_err(|_| Error::Ipc("instance name is not utf-8"))?
            .to_string();
        body.advance(padded(namelen));
        instances.push(inst);
        names.push(name);
    }

    Ok(InstanceReply {
        indom,
        count,
        instances: if instances.iter().any(|i| *i != INST_NULL) {
            Some(instances)
        } else {
            None
        },
        names: if names.iter().any(|n| !n.is_empty()) {
            Some(names)
        } else {
            None
        },
    })
}

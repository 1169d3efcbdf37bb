//! TEXT_REQ and TEXT help-text frames.

use bytes::{Buf, BufMut, BytesMut};

use super::transport::{new_frame, seal, Frame};
use super::{padded, put_padded, PduType};
use crate::error::{Error, Result};

/// What kind of text is wanted, and what the identifier refers to.
/// These are or-able flags on the wire.
pub const TEXT_ONELINE: u32 = 1;
pub const TEXT_HELP: u32 = 2;
pub const TEXT_PMID: u32 = 4;
pub const TEXT_INDOM: u32 = 8;

pub fn encode_req(from: u32, ident: u32, kind: u32) -> BytesMut {
    let mut buf = new_frame(PduType::TextReq, from);
    buf.put_u32(ident);
    buf.put_u32(kind);
    seal(&mut buf);
    buf
}

pub fn decode_req(frame: &Frame) -> Result<(u32, u32)> {
    let mut body = frame.body();
    if body.len() != 8 {
        return Err(Error::Ipc("text request size mismatch"));
    }
    let ident = body.get_u32();
    let kind = body.get_u32();
    if kind & (TEXT_ONELINE | TEXT_HELP) == 0 || kind & (TEXT_PMID | TEXT_INDOM) == 0 {
        return Err(Error::Ipc("text request without a valid kind"));
    }
    Ok((ident, kind))
}

pub fn encode_reply(from: u32, ident: u32, text: &str) -> BytesMut {
    let mut buf = new_frame(PduType::Text, from);
    buf.put_u32(ident);
    buf.put_u32(text.len() as u32);
    put_padded(&mut buf, text.as_bytes());
    seal(&mut buf);
    buf
}

pub fn decode_reply(frame: &Frame) -> Result<(u32, String)> {
    let mut body = frame.body();
    if body.len() < 8 {
        return Err(Error::Ipc("text reply below minimum size"));
    }
    let ident = body.get_u32();
    let buflen = body.get_i32();
    if buflen < 0 {
        return Err(Error::Ipc("negative text length"));
    }
    let buflen = buflen as usize;
    if padded(buflen) != body.remaining() {
        return Err(Error::Ipc("text length mismatch"));
    }
    let text = std::str::from_utf8(&body[..buflen])
        .map_err(|_| Error::Ipc("help text is not utf-8"))?
        .to_string();
    Ok((ident, text))
}

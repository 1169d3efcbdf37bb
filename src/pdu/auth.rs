//! AUTH and AUTH_ATTR frames carrying opaque negotiation payloads.

use bytes::{Buf, BufMut, BytesMut};

use super::transport::{new_frame, seal, Frame};
use super::{PduType, LIMIT_ATTR_PDU, LIMIT_AUTH_PDU};
use crate::error::{Error, Result};

/// Connection attributes exchanged during the secure handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Attr {
    Username,
    UserId,
    GroupId,
    ProcessId,
    SecureSocket,
    Container,
}

impl Attr {
    pub fn as_raw(self) -> u32 {
        match self {
            Attr::Username => 1,
            Attr::UserId => 2,
            Attr::GroupId => 3,
            Attr::ProcessId => 4,
            Attr::SecureSocket => 5,
            Attr::Container => 6,
        }
    }

    pub fn from_raw(raw: u32) -> Result<Attr> {
        Ok(match raw {
            1 => Attr::Username,
            2 => Attr::UserId,
            3 => Attr::GroupId,
            4 => Attr::ProcessId,
            5 => Attr::SecureSocket,
            6 => Attr::Container,
            _ => return Err(Error::Ipc("unknown connection attribute")),
        })
    }
}

pub fn encode_auth(from: u32, payload: &[u8]) -> Result<BytesMut> {
    if payload.len() >= LIMIT_AUTH_PDU {
        return Err(Error::Ipc("authentication payload too large"));
    }
    let mut buf = new_frame(PduType::Auth, from);
    buf.put_slice(payload);
    seal(&mut buf);
    Ok(buf)
}

pub fn decode_auth(frame: &Frame) -> Result<&[u8]> {
    let body = frame.body();
    if body.len() >= LIMIT_AUTH_PDU {
        return Err(Error::Ipc("authentication payload too large"));
    }
    Ok(body)
}

pub fn encode_attr(from: u32, attr: Attr, value: &[u8]) -> Result<BytesMut> {
    if value.len() >= LIMIT_ATTR_PDU {
        return Err(Error::Ipc("attribute payload too large"));
    }
    let mut buf = new_frame(PduType::AuthAttr, from);
    buf.put_u32(attr.as_raw());
    buf.put_slice(value);
    seal(&mut buf);
    Ok(buf)
}

pub fn decode_attr(frame: &Frame) -> Result<(Attr, &[u8])> {
    let mut body = frame.body();
    if body.len() < 4 {
        return Err(Error::Ipc("attribute frame below minimum size"));
    }
    if body.len() - 4 >= LIMIT_ATTR_PDU {
        return Err(Error::Ipc("attribute payload too large"));
    }
    let attr = Attr::from_raw(body.get_u32())?;
    Ok((attr, &frame.body()[4..]))
}

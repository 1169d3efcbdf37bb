//! CREDS frames: a list of 4-byte credential records exchanged at
//! connection establishment.

use bytes::{Buf, BufMut, BytesMut};

use super::transport::{new_frame, seal, Frame};
use super::PduType;
use crate::error::{Error, Result};

/// One credential record: a tag byte and three value bytes.  The
/// version credential carries the protocol version and the feature
/// bits the sender supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credential {
    pub tag: u8,
    pub a: u8,
    pub b: u8,
    pub c: u8,
}

pub const CRED_VERSION: u8 = 1;

impl Credential {
    pub fn version(version: u8, features: u16) -> Credential {
        Credential {
            tag: CRED_VERSION,
            a: version,
            b: (features >> 8) as u8,
            c: features as u8,
        }
    }

    pub fn features(&self) -> u16 {
        (self.b as u16) << 8 | self.c as u16
    }

    fn pack(&self) -> u32 {
        (self.tag as u32) << 24 | (self.a as u32) << 16 | (self.b as u32) << 8 | self.c as u32
    }

    fn unpack(word: u32) -> Credential {
        Credential {
            tag: (word >> 24) as u8,
            a: (word >> 16) as u8,
            b: (word >> 8) as u8,
            c: word as u8,
        }
    }
}

pub fn encode(from: u32, creds: &[Credential]) -> BytesMut {
    let mut buf = new_frame(PduType::Creds, from);
    buf.put_i32(creds.len() as i32);
    for cred in creds {
        buf.put_u32(cred.pack());
    }
    seal(&mut buf);
    buf
}

pub fn decode(frame: &Frame) -> Result<Vec<Credential>> {
    let mut body = frame.body();
    if body.len() < 4 {
        return Err(Error::Ipc("credentials frame below minimum size"));
    }
    let count = body.get_i32();
    if count <= 0 {
        return Err(Error::Ipc("credentials count must be positive"));
    }
    let count = count as usize;
    if count != body.remaining() / 4 || body.remaining() % 4 != 0 {
        return Err(Error::Ipc("credentials length mismatch"));
    }
    let mut creds = Vec::with_capacity(count);
    for _ in 0..count {
        creds.push(Credential::unpack(body.get_u32()));
    }
    Ok(creds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PinnedBuf;

    fn to_frame(buf: BytesMut) -> Frame {
        let typ = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let from = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Frame {
            typ,
            from,
            buf: PinnedBuf::new(buf),
        }
    }

    #[test]
    fn round_trip() {
        let creds = vec![Credential::version(2, 0x00c5)];
        let buf = encode(1, &creds);
        let back = decode(&to_frame(buf)).unwrap();
        assert_eq!(back, creds);
        assert_eq!(back[0].features(), 0x00c5);
    }

    #[test]
    fn empty_is_rejected() {
        let buf = encode(1, &[]);
        assert!(decode(&to_frame(buf)).is_err());
    }
}

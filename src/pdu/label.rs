//! LABEL_REQ and LABEL frames.

use bytes::{Buf, BufMut, BytesMut};

use super::transport::{new_frame, seal, Frame};
use super::PduType;
use crate::error::{Error, Result};
use crate::labels::{decode_label_sets, encode_label_sets, LabelSet, LabelTarget};

pub fn encode_req(from: u32, ident: u32, target: LabelTarget) -> BytesMut {
    let mut buf = new_frame(PduType::LabelReq, from);
    buf.put_u32(ident);
    buf.put_u32(target.as_raw());
    seal(&mut buf);
    buf
}

pub fn decode_req(frame: &Frame) -> Result<(u32, LabelTarget)> {
    let mut body = frame.body();
    if body.len() != 8 {
        return Err(Error::Ipc("label request size mismatch"));
    }
    let ident = body.get_u32();
    let target = LabelTarget::from_raw(body.get_u32())?;
    Ok((ident, target))
}

pub fn encode_reply(from: u32, ident: u32, target: LabelTarget, sets: &[LabelSet]) -> BytesMut {
    let mut buf = new_frame(PduType::Label, from);
    buf.put_u32(ident);
    buf.put_u32(target.as_raw());
    encode_label_sets(sets, &mut buf);
    seal(&mut buf);
    buf
}

pub fn decode_reply(frame: &Frame) -> Result<(u32, LabelTarget, Vec<LabelSet>)> {
    let mut body = frame.body();
    if body.len() < 12 {
        return Err(Error::Ipc("label reply below minimum size"));
    }
    let ident = body.get_u32();
    let target = LabelTarget::from_raw(body.get_u32())?;
    let sets = decode_label_sets(&mut body, target == LabelTarget::Instances)?;
    if body.has_remaining() {
        return Err(Error::Ipc("trailing bytes after label reply"));
    }
    Ok((ident, target, sets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PinnedBuf;
    use serde_json::json;

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
    fn request_round_trip() {
        let buf = encode_req(1, 0x4000_0001, LabelTarget::Indom);
        let (ident, target) = decode_req(&to_frame(buf)).unwrap();
        assert_eq!(ident, 0x4000_0001);
        assert_eq!(target, LabelTarget::Indom);
    }

    #[test]
    fn reply_round_trip() {
        let mut set = LabelSet::new(Some(3));
        set.insert("device", json!("sda"));
        let buf = encode_reply(1, 7, LabelTarget::Instances, &[set.clone()]);
        let (ident, target, sets) = decode_reply(&to_frame(buf)).unwrap();
        assert_eq!(ident, 7);
        assert_eq!(target, LabelTarget::Instances);
        assert_eq!(sets.len(), 1);
        assert!(sets[0].same(&set));
    }
}

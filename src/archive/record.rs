//! On-disk metadata records.
//!
//! The file opens with a fixed-prefix label record, then a sequence of
//! `len:u32be | type:u32be | body | len:u32be` records; the trailing
//! length is a redundancy check.

use std::convert::TryInto;
use std::io::{Read, Write};

use bytes::{Buf, BufMut};

use crate::desc::Descriptor;
use crate::error::{Error, Result};
use crate::ident::{IndomId, InstId};
use crate::labels::{decode_label_sets, encode_label_sets, LabelSet, LabelTarget};
use crate::timestamp::Timestamp;

pub const TYPE_DESC: u32 = 1;
pub const TYPE_INDOM_V2: u32 = 2;
pub const TYPE_LABEL_V2: u32 = 3;
pub const TYPE_TEXT: u32 = 4;
pub const TYPE_INDOM: u32 = 5;
pub const TYPE_INDOM_DELTA: u32 = 6;
pub const TYPE_LABEL: u32 = 7;

const MAGIC: u32 = 0x5005_2600;
const HOSTNAME_MAX: usize = 64;
const TIMEZONE_MAX: usize = 40;

/// The fixed prefix identifying an archive metadata file.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveLabel {
    pub version: u8,
    pub pid: i32,
    pub start: Timestamp,
    pub hostname: String,
    pub timezone: String,
}

fn put_fixed(buf: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width - 1);
    buf.extend_from_slice(&bytes[..n]);
    buf.resize(buf.len() + width - n, 0);
}

fn get_fixed(body: &mut &[u8], width: usize) -> Result<String> {
    if body.remaining() < width {
        return Err(Error::LogRec);
    }
    let raw = &body[..width];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
    let s = std::str::from_utf8(&raw[..end])
        .map_err(|_| Error::LogRec)?
        .to_string();
    body.advance(width);
    Ok(s)
}

impl ArchiveLabel {
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut body = Vec::new();
        body.put_u32(MAGIC | self.version as u32);
        body.put_i32(self.pid);
        self.start.encode_hires(&mut body);
        put_fixed(&mut body, &self.hostname, HOSTNAME_MAX);
        put_fixed(&mut body, &self.timezone, TIMEZONE_MAX);
        write_framed(w, None, &body)
    }

    pub fn read<R: Read>(r: &mut R) -> Result<ArchiveLabel> {
        let (typ, body) = match read_framed(r)? {
            Some(rec) => rec,
            None => return Err(Error::LogRec),
        };
        // the label record carries the magic where other records carry
        // their type word
        if typ & !0xff != MAGIC {
            return Err(Error::LogRec);
        }
        let version = (typ & 0xff) as u8;
        if version != 2 && version != 3 {
            return Err(Error::LogRec);
        }
        let mut body = &body[..];
        if body.remaining() < 4 {
            return Err(Error::LogRec);
        }
        let pid = body.get_i32();
        let start = Timestamp::decode_hires(&mut body)?;
        let hostname = get_fixed(&mut body, HOSTNAME_MAX)?;
        let timezone = get_fixed(&mut body, TIMEZONE_MAX)?;
        Ok(ArchiveLabel {
            version,
            pid,
            start,
            hostname,
            timezone,
        })
    }
}

/// Write one framed record.  For the label record the magic word takes
/// the place of the type and is already part of `body`.
fn write_framed<W: Write>(w: &mut W, typ: Option<u32>, body: &[u8]) -> Result<()> {
    let extra = if typ.is_some() { 12 } else { 8 };
    let len = (body.len() + extra) as u32;
    w.write_all(&len.to_be_bytes())?;
    if let Some(typ) = typ {
        w.write_all(&typ.to_be_bytes())?;
    }
    w.write_all(body)?;
    w.write_all(&len.to_be_bytes())?;
    Ok(())
}

pub fn write_record<W: Write>(w: &mut W, typ: u32, body: &[u8]) -> Result<()> {
    write_framed(w, Some(typ), body)
}

/// Read one framed record; `None` at end of file.  A trailer that does
/// not match the header length ends the scan with an IPC error.
fn read_framed<R: Read>(r: &mut R) -> Result<Option<(u32, Vec<u8>)>> {
    let mut word = [0u8; 4];
    match r.read_exact(&mut word) {
        Ok(()) => {}
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(word) as usize;
    if len < 12 {
        return Err(Error::Ipc("archive record below minimum size"));
    }
    r.read_exact(&mut word)?;
    let typ = u32::from_be_bytes(word);
    let mut body = vec![0u8; len - 12];
    r.read_exact(&mut body)?;
    r.read_exact(&mut word)?;
    if u32::from_be_bytes(word) as usize != len {
        return Err(Error::Ipc("archive record trailer mismatch"));
    }
    Ok(Some((typ, body)))
}

pub fn read_record<R: Read>(r: &mut R) -> Result<Option<(u32, Vec<u8>)>> {
    read_framed(r)
}

// ---- typed record bodies ----

pub fn encode_desc_body(desc: &Descriptor, names: &[String]) -> Vec<u8> {
    let mut body = Vec::new();
    desc.encode(&mut body);
    body.put_i32(names.len() as i32);
    for name in names {
        body.put_u32(name.len() as u32);
        body.extend_from_slice(name.as_bytes());
    }
    body
}

pub fn decode_desc_body(body: &[u8]) -> Result<(Descriptor, Vec<String>)> {
    let mut body = body;
    let desc = Descriptor::decode(&mut body).map_err(|_| Error::LogRec)?;
    if body.remaining() < 4 {
        return Err(Error::LogRec);
    }
    let numnames = body.get_i32();
    if numnames < 0 || numnames as usize > body.remaining() / 4 {
        return Err(Error::LogRec);
    }
    let mut names = Vec::with_capacity(numnames as usize);
    for _ in 0..numnames {
        if body.remaining() < 4 {
            return Err(Error::LogRec);
        }
        let len = body.get_u32() as usize;
        if len > body.remaining() {
            return Err(Error::LogRec);
        }
        names.push(
            std::str::from_utf8(&body[..len])
                .map_err(|_| Error::LogRec)?
                .to_string(),
        );
        body.advance(len);
    }
    if body.has_remaining() {
        return Err(Error::LogRec);
    }
    Ok((desc, names))
}

/// Instance lists inside indom records.  A name of `None` appears only
/// in delta records and means "remove this instance".
#[derive(Clone, Debug, PartialEq)]
pub struct RawInstance {
    pub inst: InstId,
    pub name: Option<String>,
}

pub struct RawIndom {
    pub indom: IndomId,
    pub stamp: Timestamp,
    pub instances: Vec<RawInstance>,
}

pub fn encode_indom_body(raw: &RawIndom, typ: u32) -> Vec<u8> {
    let mut body = Vec::new();
    match typ {
        TYPE_INDOM_V2 => raw.stamp.encode_legacy(&mut body),
        _ => raw.stamp.encode_hires(&mut body),
    }
    body.put_u32(raw.indom.0);
    body.put_i32(raw.instances.len() as i32);
    for instance in &raw.instances {
        body.put_i32(instance.inst);
        match &instance.name {
            None => body.put_i32(-1),
            Some(name) => {
                body.put_i32(name.len() as i32);
                body.extend_from_slice(name.as_bytes());
            }
        }
    }
    body
}

pub fn decode_indom_body(body: &[u8], typ: u32) -> Result<RawIndom> {
    let mut body = body;
    let stamp = match typ {
        TYPE_INDOM_V2 => Timestamp::decode_legacy(&mut body).map_err(|_| Error::LogRec)?,
        _ => Timestamp::decode_hires(&mut body).map_err(|_| Error::LogRec)?,
    };
    if body.remaining() < 8 {
        return Err(Error::LogRec);
    }
    let indom = IndomId(body.get_u32());
    let numinst = body.get_i32();
    if numinst < 0 || numinst as usize > body.remaining() / 8 {
        return Err(Error::LogRec);
    }
    let mut instances = Vec::with_capacity(numinst as usize);
    for _ in 0..numinst {
        if body.remaining() < 8 {
            return Err(Error::LogRec);
        }
        let inst = body.get_i32();
        let namelen = body.get_i32();
        let name = if namelen < 0 {
            if typ != TYPE_INDOM_DELTA {
                return Err(Error::LogRec);
            }
            None
        } else {
            let namelen = namelen as usize;
            if namelen > body.remaining() {
                return Err(Error::LogRec);
            }
            let name = std::str::from_utf8(&body[..namelen])
                .map_err(|_| Error::LogRec)?
                .to_string();
            body.advance(namelen);
            Some(name)
        };
        instances.push(RawInstance { inst, name });
    }
    if body.has_remaining() {
        return Err(Error::LogRec);
    }
    Ok(RawIndom {
        indom,
        stamp,
        instances,
    })
}

pub struct RawLabelRecord {
    pub stamp: Timestamp,
    pub target: LabelTarget,
    pub ident: u32,
    pub sets: Vec<LabelSet>,
}

pub fn encode_label_body(raw: &RawLabelRecord, typ: u32) -> Vec<u8> {
    let mut body = Vec::new();
    match typ {
        TYPE_LABEL_V2 => raw.stamp.encode_legacy(&mut body),
        _ => raw.stamp.encode_hires(&mut body),
    }
    body.put_u32(raw.target.as_raw());
    body.put_u32(raw.ident);
    encode_label_sets(&raw.sets, &mut body);
    body
}

pub fn decode_label_body(body: &[u8], typ: u32) -> Result<RawLabelRecord> {
    let mut body = body;
    let stamp = match typ {
        TYPE_LABEL_V2 => Timestamp::decode_legacy(&mut body).map_err(|_| Error::LogRec)?,
        _ => Timestamp::decode_hires(&mut body).map_err(|_| Error::LogRec)?,
    };
    if body.remaining() < 8 {
        return Err(Error::LogRec);
    }
    let target = LabelTarget::from_raw(body.get_u32()).map_err(|_| Error::LogRec)?;
    let ident = body.get_u32();
    let sets = decode_label_sets(&mut body, target == LabelTarget::Instances)
        .map_err(|_| Error::LogRec)?;
    if body.has_remaining() {
        return Err(Error::LogRec);
    }
    Ok(RawLabelRecord {
        stamp,
        target,
        ident,
        sets,
    })
}

pub fn encode_text_body(kind: u32, ident: u32, text: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.put_u32(kind);
    body.put_u32(ident);
    body.extend_from_slice(text.as_bytes());
    body
}

pub fn decode_text_body(body: &[u8]) -> Result<(u32, u32, String)> {
    if body.len() < 8 {
        return Err(Error::LogRec);
    }
    let kind = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let ident = u32::from_be_bytes(body[4..8].try_into().unwrap());
    let text = std::str::from_utf8(&body[8..])
        .map_err(|_| Error::LogRec)?
        .to_string();
    Ok((kind, ident, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{MetricType, Semantics};
    use crate::ident::MetricId;
    use crate::units::Units;

    #[test]
    fn label_round_trip() {
        let label = ArchiveLabel {
            version: 3,
            pid: 1234,
            start: Timestamp::new(1700000000, 1),
            hostname: "collector.example.com".to_string(),
            timezone: "UTC".to_string(),
        };
        let mut out = Vec::new();
        label.write(&mut out).unwrap();
        let back = ArchiveLabel::read(&mut &out[..]).unwrap();
        assert_eq!(back, label);
    }

    #[test]
    fn framed_record_round_trip() {
        let mut out = Vec::new();
        write_record(&mut out, TYPE_TEXT, b"hello").unwrap();
        let (typ, body) = read_record(&mut &out[..]).unwrap().unwrap();
        assert_eq!(typ, TYPE_TEXT);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn trailer_mismatch_is_detected() {
        let mut out = Vec::new();
        write_record(&mut out, TYPE_TEXT, b"hello").unwrap();
        let end = out.len();
        out[end - 1] ^= 0xff;
        assert!(matches!(
            read_record(&mut &out[..]),
            Err(Error::Ipc(_))
        ));
    }

    #[test]
    fn desc_body_round_trip() {
        let desc = Descriptor {
            pmid: MetricId::new(60, 0, 4),
            typ: MetricType::Double,
            indom: IndomId::new(60, 1),
            sem: Semantics::Instant,
            units: Units::NONE,
        };
        let names = vec!["disk.dev.await".to_string(), "disk.dev.await2".to_string()];
        let body = encode_desc_body(&desc, &names);
        let (back, back_names) = decode_desc_body(&body).unwrap();
        assert_eq!(back, desc);
        assert_eq!(back_names, names);
    }

    #[test]
    fn indom_body_round_trip_both_timestamp_forms() {
        let raw = RawIndom {
            indom: IndomId::new(60, 1),
            stamp: Timestamp::new(1000, 123_000),
            instances: vec![
                RawInstance {
                    inst: 1,
                    name: Some("a".to_string()),
                },
                RawInstance {
                    inst: 2,
                    name: Some("b".to_string()),
                },
            ],
        };
        let body = encode_indom_body(&raw, TYPE_INDOM);
        let back = decode_indom_body(&body, TYPE_INDOM).unwrap();
        assert_eq!(back.stamp, raw.stamp);
        assert_eq!(back.instances, raw.instances);

        let body = encode_indom_body(&raw, TYPE_INDOM_V2);
        let back = decode_indom_body(&body, TYPE_INDOM_V2).unwrap();
        // legacy form: microsecond resolution, so nsec must survive
        // transcoding exactly as usec * 1000
        assert_eq!(back.stamp.nsec, 123_000);
        assert_eq!(back.instances, raw.instances);
    }

    #[test]
    fn null_name_only_valid_in_delta() {
        let raw = RawIndom {
            indom: IndomId::new(60, 1),
            stamp: Timestamp::new(1000, 0),
            instances: vec![RawInstance {
                inst: 2,
                name: None,
            }],
        };
        let body = encode_indom_body(&raw, TYPE_INDOM_DELTA);
        assert!(decode_indom_body(&body, TYPE_INDOM_DELTA).is_ok());
        assert!(decode_indom_body(&body, TYPE_INDOM).is_err());
    }
}

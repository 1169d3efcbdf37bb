//! PROFILE frames, sent ahead of a fetch to select instances.

use bytes::{Buf, BufMut, BytesMut};

use super::transport::{new_frame, seal, Frame};
use super::PduType;
use crate::error::{Error, Result};
use crate::ident::IndomId;
use crate::profile::{IndomProfile, Profile, ProfileState};

// body layout:
//   ctxid | g_state | numprof | pad
//   per entry: indom | state | numinst | pad
//   then all instance ids, entry by entry
const FIXED: usize = 16;
const ENTRY: usize = 16;

pub fn encode(from: u32, ctxid: u32, profile: &Profile) -> BytesMut {
    let mut buf = new_frame(PduType::Profile, from);
    buf.put_u32(ctxid);
    buf.put_i32(profile.state.as_raw());
    buf.put_i32(profile.entries.len() as i32);
    buf.put_u32(0);
    for entry in &profile.entries {
        buf.put_u32(entry.indom.0);
        buf.put_i32(entry.state.as_raw());
        buf.put_i32(entry.instances.len() as i32);
        buf.put_u32(0);
    }
    for entry in &profile.entries {
        for inst in &entry.instances {
            buf.put_i32(*inst);
        }
    }
    seal(&mut buf);
    buf
}

pub fn decode(frame: &Frame) -> Result<(u32, Profile)> {
    let mut body = frame.body();
    if body.len() < FIXED {
        return Err(Error::Ipc("profile frame below minimum size"));
    }
    let ctxid = body.get_u32();
    let state = ProfileState::from_raw(body.get_i32())?;
    let numprof = body.get_i32();
    body.advance(4);
    if numprof < 0 {
        return Err(Error::Ipc("negative profile count"));
    }
    let numprof = numprof as usize;
    if numprof > body.remaining() / ENTRY {
        return Err(Error::Ipc("profile count exceeds frame"));
    }

    let mut entries = Vec::with_capacity(numprof);
    let mut counts = Vec::with_capacity(numprof);
    for _ in 0..numprof {
        let indom = IndomId(body.get_u32());
        let state = ProfileState::from_raw(body.get_i32())?;
        let numinst = body.get_i32();
        body.advance(4);
        if numinst < 0 {
            return Err(Error::Ipc("negative instance count in profile"));
        }
        counts.push(numinst as usize);
        entries.push(IndomProfile {
            indom,
            state,
            instances: Vec::new(),
        });
    }
    for (entry, count) in entries.iter_mut().zip(counts) {
        if count > body.remaining() / 4 {
            return Err(Error::Ipc("profile instances exceed frame"));
        }
        entry.instances.reserve(count);
        for _ in 0..count {
            entry.instances.push(body.get_i32());
        }
    }
    if body.has_remaining() {
        return Err(Error::Ipc("trailing bytes after profile"));
    }
    Ok((ctxid, Profile { state, entries }))
}

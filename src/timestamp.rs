use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// A point in time as recorded in archives and result frames.
///
/// Two encodings exist on disk and on the wire: the legacy form with
/// 32-bit seconds and microseconds, and the current form carrying 64-bit
/// seconds split across two big-endian words plus a nanosecond word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

/// Bytes used by the legacy encoding.
pub const LEGACY_WIRE_SIZE: usize = 8;
/// Bytes used by the current encoding.
pub const HIRES_WIRE_SIZE: usize = 12;

impl Timestamp {
    pub fn new(sec: i64, nsec: u32) -> Timestamp {
        Timestamp { sec, nsec }
    }

    pub fn now() -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(_) => Timestamp::default(),
        }
    }

    /// Legacy on-disk/wire form: `sec:u32be | usec:u32be`.
    pub fn encode_legacy<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.sec as i32);
        buf.put_i32((self.nsec / 1000) as i32);
    }

    /// Transcoding is bit-exact with `nsec = usec * 1000`.
    pub fn decode_legacy<B: Buf>(buf: &mut B) -> Result<Timestamp> {
        if buf.remaining() < LEGACY_WIRE_SIZE {
            return Err(Error::Ipc("short timestamp"));
        }
        let sec = buf.get_i32() as i64;
        let usec = buf.get_i32();
        if !(0..1_000_000).contains(&usec) {
            return Err(Error::Ipc("timestamp microseconds out of range"));
        }
        Ok(Timestamp {
            sec,
            nsec: usec as u32 * 1000,
        })
    }

    /// Current form: the 64-bit seconds count is written most significant
    /// word first, then the nanosecond word, all big-endian.
    pub fn encode_hires<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32((self.sec >> 32) as u32);
        buf.put_u32(self.sec as u32);
        buf.put_u32(self.nsec);
    }

    pub fn decode_hires<B: Buf>(buf: &mut B) -> Result<Timestamp> {
        if buf.remaining() < HIRES_WIRE_SIZE {
            return Err(Error::Ipc("short timestamp"));
        }
        let hi = buf.get_u32() as u64;
        let lo = buf.get_u32() as u64;
        let nsec = buf.get_u32();
        if nsec >= 1_000_000_000 {
            return Err(Error::Ipc("timestamp nanoseconds out of range"));
        }
        Ok(Timestamp {
            sec: (hi << 32 | lo) as i64,
            nsec,
        })
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / 1e9
    }

    /// Seconds elapsed from `earlier` to `self`.
    pub fn seconds_since(&self, earlier: &Timestamp) -> f64 {
        self.as_secs_f64() - earlier.as_secs_f64()
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Timestamp) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Timestamp) -> Ordering {
        self.sec.cmp(&other.sec).then(self.nsec.cmp(&other.nsec))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_round_trip() {
        let ts = Timestamp::new(1700000000, 123_456_000);
        let mut buf = Vec::new();
        ts.encode_legacy(&mut buf);
        assert_eq!(buf.len(), LEGACY_WIRE_SIZE);
        assert_eq!(Timestamp::decode_legacy(&mut &buf[..]).unwrap(), ts);
    }

    #[test]
    fn legacy_truncates_to_microseconds() {
        let ts = Timestamp::new(10, 999);
        let mut buf = Vec::new();
        ts.encode_legacy(&mut buf);
        let back = Timestamp::decode_legacy(&mut &buf[..]).unwrap();
        assert_eq!(back.nsec, 0);
    }

    #[test]
    fn hires_round_trip_beyond_2038() {
        let ts = Timestamp::new(1 << 33, 999_999_999);
        let mut buf = Vec::new();
        ts.encode_hires(&mut buf);
        assert_eq!(buf.len(), HIRES_WIRE_SIZE);
        assert_eq!(Timestamp::decode_hires(&mut &buf[..]).unwrap(), ts);
    }

    #[test]
    fn hires_words_are_msb_first() {
        let ts = Timestamp::new(0x0102030405060708, 9);
        let mut buf = Vec::new();
        ts.encode_hires(&mut buf);
        assert_eq!(&buf[0..4], &[1, 2, 3, 4]);
        assert_eq!(&buf[4..8], &[5, 6, 7, 8]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 9]);
    }

    #[test]
    fn ordering() {
        let a = Timestamp::new(5, 0);
        let b = Timestamp::new(5, 1);
        let c = Timestamp::new(6, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn delta_in_seconds() {
        let a = Timestamp::new(10, 0);
        let b = Timestamp::new(12, 500_000_000);
        assert!((b.seconds_since(&a) - 2.5).abs() < 1e-9);
    }
}

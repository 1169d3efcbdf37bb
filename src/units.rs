use std::fmt;

use crate::error::{Error, Result};

/// Scale along the space axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpaceScale {
    Byte = 0,
    KByte = 1,
    MByte = 2,
    GByte = 3,
    TByte = 4,
}

/// Scale along the time axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeScale {
    NSec = 0,
    USec = 1,
    MSec = 2,
    Sec = 3,
    Min = 4,
    Hour = 5,
}

/// Dimensions and scales of a metric value across the space, time and
/// count axes.  `scale_count` is a power-of-ten exponent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Units {
    pub dim_space: i8,
    pub dim_time: i8,
    pub dim_count: i8,
    pub scale_space: u8,
    pub scale_time: u8,
    pub scale_count: i8,
}

impl Units {
    pub const NONE: Units = Units {
        dim_space: 0,
        dim_time: 0,
        dim_count: 0,
        scale_space: 0,
        scale_time: 0,
        scale_count: 0,
    };

    pub fn space(scale: SpaceScale) -> Units {
        Units {
            dim_space: 1,
            scale_space: scale as u8,
            ..Units::NONE
        }
    }

    pub fn time(scale: TimeScale) -> Units {
        Units {
            dim_time: 1,
            scale_time: scale as u8,
            ..Units::NONE
        }
    }

    pub fn count() -> Units {
        Units {
            dim_count: 1,
            ..Units::NONE
        }
    }

    pub fn is_dimensionless(&self) -> bool {
        self.dim_space == 0 && self.dim_time == 0 && self.dim_count == 0
    }

    pub fn same_dimensions(&self, other: &Units) -> bool {
        self.dim_space == other.dim_space
            && self.dim_time == other.dim_time
            && self.dim_count == other.dim_count
    }

    /// Packed 32-bit on-wire form: four-bit signed dimensions followed by
    /// four-bit scales, most significant nibble first, low byte unused.
    pub fn pack(&self) -> u32 {
        let nib = |v: i8| (v as u32) & 0xf;
        nib(self.dim_space) << 28
            | nib(self.dim_time) << 24
            | nib(self.dim_count) << 20
            | ((self.scale_space as u32) & 0xf) << 16
            | ((self.scale_time as u32) & 0xf) << 12
            | nib(self.scale_count) << 8
    }

    pub fn unpack(word: u32) -> Units {
        // sign-extend the four-bit dimension fields
        let sext = |v: u32| {
            let v = (v & 0xf) as i8;
            if v & 0x8 != 0 {
                v | !0xf
            } else {
                v
            }
        };
        Units {
            dim_space: sext(word >> 28),
            dim_time: sext(word >> 24),
            dim_count: sext(word >> 20),
            scale_space: ((word >> 16) & 0xf) as u8,
            scale_time: ((word >> 12) & 0xf) as u8,
            scale_count: sext(word >> 8),
        }
    }

    /// Multiplier taking a value in `self` units to `to` units.
    /// The dimensions must agree.
    pub fn scale_factor(&self, to: &Units) -> Result<f64> {
        if !self.same_dimensions(to) {
            return Err(Error::Conv);
        }
        let mut factor = 1.0f64;
        if self.dim_space != 0 {
            let per = 1024f64.powi(self.scale_space as i32 - to.scale_space as i32);
            factor *= per.powi(self.dim_space as i32);
        }
        if self.dim_time != 0 {
            let per = time_in_seconds(self.scale_time) / time_in_seconds(to.scale_time);
            factor *= per.powi(self.dim_time as i32);
        }
        if self.dim_count != 0 {
            let per = 10f64.powi(self.scale_count as i32 - to.scale_count as i32);
            factor *= per.powi(self.dim_count as i32);
        }
        Ok(factor)
    }

    /// Multiplier converting one unit of this time scale into seconds.
    /// Only meaningful when `dim_time` is non-zero.
    pub fn time_scale_to_seconds(&self) -> f64 {
        time_in_seconds(self.scale_time)
    }
}

fn time_in_seconds(scale: u8) -> f64 {
    match scale {
        0 => 1e-9,
        1 => 1e-6,
        2 => 1e-3,
        3 => 1.0,
        4 => 60.0,
        _ => 3600.0,
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        static SPACE: [&str; 5] = ["byte", "Kbyte", "Mbyte", "Gbyte", "Tbyte"];
        static TIME: [&str; 6] = ["nanosec", "microsec", "millisec", "sec", "min", "hour"];
        let mut wrote = false;
        let mut dim = |f: &mut fmt::Formatter, d: i8, name: &str| -> fmt::Result {
            if d != 0 {
                if wrote {
                    write!(f, " ")?;
                }
                wrote = true;
                if d == 1 {
                    write!(f, "{}", name)?;
                } else {
                    write!(f, "{}^{}", name, d)?;
                }
            }
            Ok(())
        };
        dim(f, self.dim_space, SPACE[(self.scale_space as usize).min(4)])?;
        dim(f, self.dim_time, TIME[(self.scale_time as usize).min(5)])?;
        dim(f, self.dim_count, "count")?;
        if !wrote {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Parse a unit specification of the form `Kbyte`, `count/sec` or
/// `byte/Kbyte` style numerator[/denominator] names, as accepted by the
/// rescale() operator of the expression language.
pub fn parse_units(spec: &str) -> Result<Units> {
    let mut units = Units::NONE;
    let mut parts = spec.splitn(2, '/');
    let numer = parts.next().unwrap_or("");
    apply_unit_name(&mut units, numer.trim(), 1)?;
    if let Some(denom) = parts.next() {
        apply_unit_name(&mut units, denom.trim(), -1)?;
    }
    Ok(units)
}

fn apply_unit_name(units: &mut Units, name: &str, dim: i8) -> Result<()> {
    let (scale_space, scale_time): (Option<u8>, Option<u8>) = match name {
        "byte" => (Some(0), None),
        "Kbyte" | "kbyte" => (Some(1), None),
        "Mbyte" | "mbyte" => (Some(2), None),
        "Gbyte" | "gbyte" => (Some(3), None),
        "Tbyte" | "tbyte" => (Some(4), None),
        "nanosec" | "nsec" => (None, Some(0)),
        "microsec" | "usec" => (None, Some(1)),
        "millisec" | "msec" => (None, Some(2)),
        "sec" | "second" => (None, Some(3)),
        "min" | "minute" => (None, Some(4)),
        "hour" => (None, Some(5)),
        "count" => {
            units.dim_count += dim;
            return Ok(());
        }
        "none" | "" => return Ok(()),
        _ => return Err(Error::Config(format!("unknown unit name: {}", name))),
    };
    if let Some(s) = scale_space {
        units.dim_space += dim;
        units.scale_space = s;
    }
    if let Some(s) = scale_time {
        units.dim_time += dim;
        units.scale_time = s;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trip() {
        let u = Units {
            dim_space: 1,
            dim_time: -1,
            dim_count: 0,
            scale_space: 1,
            scale_time: 3,
            scale_count: 0,
        };
        assert_eq!(Units::unpack(u.pack()), u);
    }

    #[test]
    fn pack_round_trip_negative_count() {
        let u = Units {
            dim_space: 0,
            dim_time: 0,
            dim_count: -2,
            scale_space: 0,
            scale_time: 0,
            scale_count: -3,
        };
        assert_eq!(Units::unpack(u.pack()), u);
    }

    #[test]
    fn byte_to_kbyte() {
        let from = Units::space(SpaceScale::Byte);
        let to = Units::space(SpaceScale::KByte);
        assert_eq!(from.scale_factor(&to).unwrap(), 1.0 / 1024.0);
    }

    #[test]
    fn msec_to_sec() {
        let from = Units::time(TimeScale::MSec);
        let to = Units::time(TimeScale::Sec);
        assert!((from.scale_factor(&to).unwrap() - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn dimension_mismatch_is_conv_error() {
        let from = Units::space(SpaceScale::Byte);
        let to = Units::time(TimeScale::Sec);
        assert!(matches!(from.scale_factor(&to), Err(Error::Conv)));
    }

    #[test]
    fn parse_rate_units() {
        let u = parse_units("Kbyte/sec").unwrap();
        assert_eq!(u.dim_space, 1);
        assert_eq!(u.dim_time, -1);
        assert_eq!(u.scale_space, 1);
        assert_eq!(u.scale_time, 3);
    }
}

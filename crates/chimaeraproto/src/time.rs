//! NTP-format time tags carried by bundles.
//!
//! A time tag is 32 bits of seconds since 1900-01-01 plus 32 bits of fraction.
//! The value `(0, 1)` is reserved and means "execute immediately".

use rosc::OscTime;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const FRACTION_SCALE: f64 = 4_294_967_296.0; // 2^32

/// The reserved "immediately" time tag.
pub const IMMEDIATE: OscTime = OscTime {
    seconds: 0,
    fractional: 1,
};

pub fn is_immediate(time: &OscTime) -> bool {
    time.seconds == IMMEDIATE.seconds && time.fractional == IMMEDIATE.fractional
}

/// Seconds since the NTP epoch as a float.
pub fn to_ntp_seconds(time: &OscTime) -> f64 {
    f64::from(time.seconds) + f64::from(time.fractional) / FRACTION_SCALE
}

/// Build a time tag from seconds since the NTP epoch.
pub fn from_ntp_seconds(seconds: f64) -> OscTime {
    let whole = seconds.floor();
    let frac = ((seconds - whole) * FRACTION_SCALE) as u32;
    OscTime {
        seconds: whole as u32,
        fractional: frac,
    }
}

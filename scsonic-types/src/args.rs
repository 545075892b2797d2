//! Closed argument sum for outgoing OSC messages.
//!
//! The facade accepts `OscArg` rather than `rosc::OscType` directly so the
//! promotion rules live at one boundary and callers get `From` impls for
//! plain Rust values.

use rosc::{OscTime, OscType};

/// A single OSC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    I32(i32),
    F32(f32),
    I64(i64),
    F64(f64),
    Str(String),
    Blob(Vec<u8>),
    /// NTP timetag as (seconds, fraction).
    TimeTag(u32, u32),
    Bool(bool),
}

impl OscArg {
    /// Promote to the codec's argument type.
    pub fn into_osc(self) -> OscType {
        match self {
            OscArg::I32(v) => OscType::Int(v),
            OscArg::F32(v) => OscType::Float(v),
            OscArg::I64(v) => OscType::Long(v),
            OscArg::F64(v) => OscType::Double(v),
            OscArg::Str(v) => OscType::String(v),
            OscArg::Blob(v) => OscType::Blob(v),
            OscArg::TimeTag(seconds, fractional) => OscType::Time(OscTime {
                seconds,
                fractional,
            }),
            OscArg::Bool(v) => OscType::Bool(v),
        }
    }
}

impl From<i32> for OscArg {
    fn from(v: i32) -> Self {
        OscArg::I32(v)
    }
}

impl From<u32> for OscArg {
    // u32 does not fit the OSC int32; promote to int64.
    fn from(v: u32) -> Self {
        OscArg::I64(v as i64)
    }
}

impl From<i64> for OscArg {
    fn from(v: i64) -> Self {
        OscArg::I64(v)
    }
}

impl From<f32> for OscArg {
    fn from(v: f32) -> Self {
        OscArg::F32(v)
    }
}

impl From<f64> for OscArg {
    fn from(v: f64) -> Self {
        OscArg::F64(v)
    }
}

impl From<&str> for OscArg {
    fn from(v: &str) -> Self {
        OscArg::Str(v.to_string())
    }
}

impl From<String> for OscArg {
    fn from(v: String) -> Self {
        OscArg::Str(v)
    }
}

impl From<Vec<u8>> for OscArg {
    fn from(v: Vec<u8>) -> Self {
        OscArg::Blob(v)
    }
}

impl From<bool> for OscArg {
    fn from(v: bool) -> Self {
        OscArg::Bool(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_preserves_values() {
        assert_eq!(OscArg::from(3).into_osc(), OscType::Int(3));
        assert_eq!(OscArg::from(0.5f32).into_osc(), OscType::Float(0.5));
        assert_eq!(
            OscArg::from("freq").into_osc(),
            OscType::String("freq".into())
        );
        assert_eq!(OscArg::from(true).into_osc(), OscType::Bool(true));
    }

    #[test]
    fn u32_promotes_to_long() {
        assert_eq!(OscArg::from(u32::MAX).into_osc(), OscType::Long(4294967295));
    }

    #[test]
    fn timetag_maps_to_osc_time() {
        match OscArg::TimeTag(10, 20).into_osc() {
            OscType::Time(t) => {
                assert_eq!(t.seconds, 10);
                assert_eq!(t.fractional, 20);
            }
            other => panic!("expected Time, got {:?}", other),
        }
    }
}

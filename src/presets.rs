//! The closed table of ventilation presets the MVS unit understands.
//!
//! Preset names map bijectively onto the mode byte carried by 22F1 command
//! telegrams; the same byte comes back in 31D9 fan-state reports. Mode bytes
//! the catalog does not recognize are surfaced as `None` rather than being
//! mapped onto some default.

use num_traits::FromPrimitive as _;
use strum::VariantNames as _;

use crate::payloads::{Code, Error as PayloadError};

#[derive(thiserror::Error, Debug)]
#[error("`{0}` is not a known preset mode")]
pub struct UnknownPreset(pub String);

/// Declaration order is the order presented to users when picking a mode;
/// the discriminant is the on-wire mode byte.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Debug,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::VariantNames,
    num_derive::FromPrimitive,
)]
#[repr(u8)]
pub enum Preset {
    Auto = 0x04,
    Low = 0x01,
    Medium = 0x02,
    High = 0x03,
    Away = 0x00,
}

impl serde::Serialize for Preset {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Mode byte divisor carried in the third 22F1 payload byte. The MVS remotes
/// always report their speed out of four steps.
const MODE_SCALE: u8 = 0x04;

/// Fault bit within the 31D9 flags byte.
const FAULT_BIT: u8 = 0x80;

impl Preset {
    /// The selectable preset names, in display order.
    pub fn names() -> &'static [&'static str] {
        Self::VARIANTS
    }

    pub fn from_name(name: &str) -> Result<Self, UnknownPreset> {
        name.parse().map_err(|_| UnknownPreset(name.to_string()))
    }

    pub fn mode_byte(self) -> u8 {
        self as u8
    }

    pub fn from_mode_byte(byte: u8) -> Option<Self> {
        Self::from_u8(byte)
    }

    /// The 22F1 payload that commands this preset.
    pub fn command_payload(self) -> [u8; 3] {
        [0x00, self.mode_byte(), MODE_SCALE]
    }
}

/// Extract the preset and the fault flag from a 31D9 fan-state payload.
///
/// The flags byte and the mode byte are independent fields of the same
/// telegram; a payload too short to carry both is malformed rather than a
/// best-effort guess.
pub fn decode_fan_state(raw: &[u8]) -> Result<(Option<Preset>, bool), PayloadError> {
    let [_, flags, mode, ..] = raw else {
        return Err(PayloadError::Malformed {
            code: Code::FanState,
            expected: 3,
            actual: raw.len(),
        });
    };
    Ok((Preset::from_mode_byte(*mode), flags & FAULT_BIT != 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_in_display_order() {
        assert_eq!(Preset::names(), ["Auto", "Low", "Medium", "High", "Away"]);
    }

    #[test]
    fn name_to_mode_byte_is_bijective() {
        for name in Preset::names() {
            let preset = Preset::from_name(name).unwrap();
            assert_eq!(Preset::from_mode_byte(preset.mode_byte()), Some(preset));
            assert_eq!(preset.to_string(), *name);
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = Preset::from_name("Turbo").unwrap_err();
        assert_eq!(err.to_string(), "`Turbo` is not a known preset mode");
    }

    #[test]
    fn fan_state_with_fault() {
        let (preset, has_fault) = decode_fan_state(&[0x00, 0x80, 0x01]).unwrap();
        assert_eq!(preset, Some(Preset::Low));
        assert!(has_fault);
    }

    #[test]
    fn fan_state_without_fault() {
        let (preset, has_fault) = decode_fan_state(&[0x00, 0x00, 0x04]).unwrap();
        assert_eq!(preset, Some(Preset::Auto));
        assert!(!has_fault);
    }

    #[test]
    fn unrecognized_mode_byte_is_not_defaulted() {
        let (preset, has_fault) = decode_fan_state(&[0x00, 0x00, 0x7F]).unwrap();
        assert_eq!(preset, None);
        assert!(!has_fault);
    }

    #[test]
    fn short_fan_state_is_malformed() {
        assert!(matches!(
            decode_fan_state(&[0x00, 0x80]),
            Err(PayloadError::Malformed { expected: 3, actual: 2, .. })
        ));
    }
}

//! Decoding and encoding of the telegram payloads this crate understands.
//!
//! Everything here is pure: a code plus payload bytes in, a typed value (or
//! a conformant outbound [`Frame`]) out, so the codec tests run against
//! literal byte fixtures without a broker.
//!
//! Byte layouts were reverse-documented from telegrams captured off an
//! MVS-15 installation. Fields with a defined "no data" sentinel decode to
//! `None`; any other out-of-range value passes through unclamped so
//! consumers can spot anomalies.

use num_traits::FromPrimitive as _;

use crate::frame::{Frame, Verb};
use crate::gateway::DeviceAddressSet;
use crate::presets::{self, Preset};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{code} payload needs at least {expected} bytes but only {actual} arrived")]
    Malformed { code: Code, expected: usize, actual: usize },
    #[error("no encoding rule for {code} with the requested intent")]
    UnsupportedIntent { code: Code },
}

/// The telegram codes this crate understands, with the wire code as the
/// discriminant. Codes outside this set are ignored upstream, never an
/// error.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, num_derive::FromPrimitive,
)]
#[repr(u16)]
pub enum Code {
    /// CO2 level report from the sensor unit.
    Co2Level = 0x1298,
    /// Relative humidity report.
    RelativeHumidity = 0x12A0,
    /// Fan state report: current preset plus the fault flag.
    FanState = 0x31D9,
    /// Ventilation demand percentage.
    VentDemand = 0x31E0,
    /// Preset-mode command, as sent by (or impersonating) a remote.
    FanMode = 0x22F1,
    /// Device identification exchange, used for the setup handshake.
    DeviceInfo = 0x10E0,
}

impl Code {
    pub fn from_raw(raw: u16) -> Option<Self> {
        Self::from_u16(raw)
    }

    /// Minimum payload length that still carries every field we read.
    fn expected_len(self) -> usize {
        match self {
            Code::Co2Level => 3,
            Code::RelativeHumidity => 2,
            Code::FanState => 3,
            Code::VentDemand => 3,
            Code::FanMode => 3,
            Code::DeviceInfo => 20,
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}", *self as u16)
    }
}

impl serde::Serialize for Code {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// "No data" sentinel for 16-bit measurements; everything at or above it
/// reads as absent.
const UNAVAILABLE_U16: u16 = 0x7FFF;
/// "No data" sentinel for single-byte percentage fields.
const UNAVAILABLE_U8: u8 = 0xEF;
/// ASCII description offset within a 10E0 reply payload.
const DEVICE_INFO_TEXT_OFFSET: usize = 19;

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub enum Payload {
    Co2Level { ppm: Option<u16> },
    RelativeHumidity { percent: Option<u8> },
    FanState { preset: Option<Preset>, has_fault: bool },
    VentDemand { percent: Option<u8> },
    FanMode { preset: Option<Preset> },
    DeviceInfo { description: String },
}

impl Payload {
    pub fn code(&self) -> Code {
        match self {
            Payload::Co2Level { .. } => Code::Co2Level,
            Payload::RelativeHumidity { .. } => Code::RelativeHumidity,
            Payload::FanState { .. } => Code::FanState,
            Payload::VentDemand { .. } => Code::VentDemand,
            Payload::FanMode { .. } => Code::FanMode,
            Payload::DeviceInfo { .. } => Code::DeviceInfo,
        }
    }
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn opt<T: std::fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map(T::to_string).unwrap_or_else(|| "n/a".to_string())
        }
        match self {
            Payload::Co2Level { ppm } => write!(f, "CO2 {} ppm", opt(ppm)),
            Payload::RelativeHumidity { percent } => {
                write!(f, "relative humidity {}%", opt(percent))
            }
            Payload::FanState { preset, has_fault } => write!(
                f,
                "fan {}{}",
                preset.map(|p| p.to_string()).unwrap_or_else(|| "Unknown".to_string()),
                if *has_fault { " (fault)" } else { "" },
            ),
            Payload::VentDemand { percent } => write!(f, "vent demand {}%", opt(percent)),
            Payload::FanMode { preset } => write!(
                f,
                "mode command {}",
                preset.map(|p| p.to_string()).unwrap_or_else(|| "Unknown".to_string()),
            ),
            Payload::DeviceInfo { description } => write!(f, "device `{description}`"),
        }
    }
}

/// Decode the payload bytes of a telegram with a known code.
pub fn decode(code: Code, raw: &[u8]) -> Result<Payload, Error> {
    let expected = code.expected_len();
    if raw.len() < expected {
        return Err(Error::Malformed { code, expected, actual: raw.len() });
    }
    Ok(match code {
        Code::Co2Level => {
            let ppm = u16::from_be_bytes([raw[1], raw[2]]);
            Payload::Co2Level { ppm: (ppm < UNAVAILABLE_U16).then_some(ppm) }
        }
        Code::RelativeHumidity => Payload::RelativeHumidity {
            percent: (raw[1] != UNAVAILABLE_U8).then_some(raw[1]),
        },
        Code::FanState => {
            let (preset, has_fault) = presets::decode_fan_state(raw)?;
            Payload::FanState { preset, has_fault }
        }
        Code::VentDemand => Payload::VentDemand {
            // Doubled scale: 0xC8 is 100%.
            percent: (raw[2] != UNAVAILABLE_U8).then_some(raw[2] / 2),
        },
        Code::FanMode => Payload::FanMode { preset: Preset::from_mode_byte(raw[1]) },
        Code::DeviceInfo => {
            let text = &raw[DEVICE_INFO_TEXT_OFFSET..];
            let text = text.split(|b| *b == 0x00).next().unwrap_or(text);
            Payload::DeviceInfo { description: String::from_utf8_lossy(text).into_owned() }
        }
    })
}

/// Commands this crate can put on the wire.
#[derive(Clone, Copy, Debug)]
pub enum CommandIntent {
    /// Switch the unit to a preset, impersonating the paired remote.
    SetPreset(Preset),
    /// Ask the unit to identify itself. Sent once at gateway startup.
    Identify,
}

/// Build a fully framed outbound telegram for a code/intent pair.
///
/// Sources and destinations come from the installation's address set: preset
/// commands are sent as the remote, identification requests as the gateway.
pub fn encode_command(
    code: Code,
    intent: CommandIntent,
    addresses: &DeviceAddressSet,
) -> Result<Frame, Error> {
    match (code, intent) {
        (Code::FanMode, CommandIntent::SetPreset(preset)) => Ok(Frame::command(
            Verb::Inform,
            addresses.remote,
            addresses.fan,
            Code::FanMode as u16,
            preset.command_payload().to_vec(),
        )),
        (Code::DeviceInfo, CommandIntent::Identify) => Ok(Frame::command(
            Verb::Request,
            addresses.gateway,
            addresses.fan,
            Code::DeviceInfo as u16,
            vec![0x00],
        )),
        (code, _) => Err(Error::UnsupportedIntent { code }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DeviceId;

    fn addresses() -> DeviceAddressSet {
        DeviceAddressSet {
            gateway: "18:013393".parse::<DeviceId>().unwrap(),
            remote: "29:162275".parse::<DeviceId>().unwrap(),
            fan: "32:155617".parse::<DeviceId>().unwrap(),
            co2_sensor: "37:168270".parse::<DeviceId>().unwrap(),
        }
    }

    #[test]
    fn co2_level() {
        let payload = decode(Code::Co2Level, &[0x00, 0x03, 0x16]).unwrap();
        assert_eq!(payload, Payload::Co2Level { ppm: Some(790) });
    }

    #[test]
    fn co2_sentinel_is_absent_not_zero() {
        let payload = decode(Code::Co2Level, &[0x00, 0x7F, 0xFF]).unwrap();
        assert_eq!(payload, Payload::Co2Level { ppm: None });
    }

    #[test]
    fn humidity_and_its_sentinel() {
        let payload = decode(Code::RelativeHumidity, &[0x00, 0x2D]).unwrap();
        assert_eq!(payload, Payload::RelativeHumidity { percent: Some(45) });
        let payload = decode(Code::RelativeHumidity, &[0x00, 0xEF]).unwrap();
        assert_eq!(payload, Payload::RelativeHumidity { percent: None });
    }

    #[test]
    fn out_of_range_humidity_is_not_clamped() {
        let payload = decode(Code::RelativeHumidity, &[0x00, 0x65]).unwrap();
        assert_eq!(payload, Payload::RelativeHumidity { percent: Some(101) });
    }

    #[test]
    fn vent_demand_uses_doubled_scale() {
        let payload = decode(Code::VentDemand, &[0x00, 0x00, 0xC8]).unwrap();
        assert_eq!(payload, Payload::VentDemand { percent: Some(100) });
        let payload = decode(Code::VentDemand, &[0x00, 0x00, 0xEF]).unwrap();
        assert_eq!(payload, Payload::VentDemand { percent: None });
    }

    #[test]
    fn preset_commands_decode_back_to_the_same_preset() {
        for name in Preset::names() {
            let preset = Preset::from_name(name).unwrap();
            let frame =
                encode_command(Code::FanMode, CommandIntent::SetPreset(preset), &addresses())
                    .unwrap();
            assert_eq!(frame.src(), Some(addresses().remote));
            assert_eq!(frame.dst(), Some(addresses().fan));
            let decoded = decode(Code::FanMode, &frame.payload).unwrap();
            assert_eq!(decoded, Payload::FanMode { preset: Some(preset) });
        }
    }

    #[test]
    fn identify_command() {
        let frame =
            encode_command(Code::DeviceInfo, CommandIntent::Identify, &addresses()).unwrap();
        assert_eq!(frame.verb, Verb::Request);
        assert_eq!(frame.src(), Some(addresses().gateway));
        assert_eq!(frame.payload, [0x00]);
    }

    #[test]
    fn mismatched_code_and_intent_is_unsupported() {
        assert!(matches!(
            encode_command(Code::Co2Level, CommandIntent::Identify, &addresses()),
            Err(Error::UnsupportedIntent { code: Code::Co2Level }),
        ));
    }

    #[test]
    fn device_info_description() {
        let mut raw = vec![0x00; DEVICE_INFO_TEXT_OFFSET];
        raw.extend(b"MVS-15RH");
        raw.extend([0x00, 0x00]);
        let payload = decode(Code::DeviceInfo, &raw).unwrap();
        assert_eq!(payload, Payload::DeviceInfo { description: "MVS-15RH".to_string() });
    }

    #[test]
    fn truncated_payloads_never_panic() {
        let codes = [
            Code::Co2Level,
            Code::RelativeHumidity,
            Code::FanState,
            Code::VentDemand,
            Code::FanMode,
            Code::DeviceInfo,
        ];
        for code in codes {
            for len in 0..code.expected_len() {
                let raw = vec![0u8; len];
                assert!(
                    matches!(decode(code, &raw), Err(Error::Malformed { .. })),
                    "{code} with {len} bytes must be malformed",
                );
            }
        }
    }
}

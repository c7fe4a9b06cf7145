//! Text form of RAMSES II telegrams as relayed by the RAMSES ESP gateway.
//!
//! The gateway publishes one telegram per MQTT message in the evofw3 text
//! format: an optional RSSI, a verb, a sequence slot, three device address
//! slots, the 4-hex-digit code, a 3-digit payload length and the payload in
//! hexadecimal, optionally followed by a 2-hex-digit trailing checksum.

use std::str::FromStr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame ends before the {0} field")]
    Truncated(&'static str),
    #[error("`{0}` is not a known verb")]
    UnknownVerb(String),
    #[error("`{0}` is not a valid device address")]
    BadAddress(String),
    #[error("`{0}` is not a valid sequence number")]
    BadSequence(String),
    #[error("`{0}` is not a valid 4-digit hexadecimal code")]
    BadCode(String),
    #[error("`{0}` is not a valid payload length")]
    BadLength(String),
    #[error("payload is not valid hexadecimal")]
    BadPayloadHex(#[source] hex::FromHexError),
    #[error("length field declares {declared} bytes but the payload has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch (frame carries {carried:02X}, computed {computed:02X})")]
    ChecksumMismatch { carried: u8, computed: u8 },
    #[error("unexpected trailing data after the frame")]
    TrailingData,
}

/// A RAMSES device address, `CC:DDDDDD` on the wire.
///
/// The class identifies the device kind (18 = gateway, 29 = remote,
/// 32 = ventilation unit, 37 = CO2 sensor) and the device number is unique
/// per installation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct DeviceId {
    pub class: u8,
    pub device: u32,
}

/// The null address slot, `--:------`.
const NULL_ADDRESS: &str = "--:------";

impl FromStr for DeviceId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        let bad = || Error::BadAddress(s.to_string());
        let (class, device) = s.split_once(':').ok_or_else(bad)?;
        if class.len() != 2 || device.len() != 6 {
            return Err(bad());
        }
        let class = class.parse::<u8>().map_err(|_| bad())?;
        let device = device.parse::<u32>().map_err(|_| bad())?;
        Ok(Self { class, device })
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:06}", self.class, self.device)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display, strum::EnumString)]
pub enum Verb {
    /// Unsolicited report or broadcast.
    #[strum(serialize = "I")]
    Inform,
    /// Request for data.
    #[strum(serialize = "RQ")]
    Request,
    /// Reply to a request.
    #[strum(serialize = "RP")]
    Reply,
    /// Write a setting.
    #[strum(serialize = "W")]
    Write,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Signal strength reported by the gateway. Present on received frames
    /// only.
    pub rssi: Option<u8>,
    pub verb: Verb,
    pub seq: Option<u8>,
    pub addresses: [Option<DeviceId>; 3],
    /// Raw protocol code. Codes this crate does not understand still parse.
    pub code: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn command(verb: Verb, src: DeviceId, dst: DeviceId, code: u16, payload: Vec<u8>) -> Self {
        Self {
            rssi: None,
            verb,
            seq: None,
            addresses: [Some(src), Some(dst), None],
            code,
            payload,
        }
    }

    /// The transmitting device. Broadcast frames repeat the transmitter in
    /// the third address slot and leave the first one null.
    pub fn src(&self) -> Option<DeviceId> {
        self.addresses[0].or(self.addresses[2])
    }

    pub fn dst(&self) -> Option<DeviceId> {
        self.addresses[1]
    }

    /// Two's complement of the sum over code, length and payload bytes, so
    /// that a whole frame sums to zero modulo 256.
    fn checksum(code: u16, payload: &[u8]) -> u8 {
        let mut sum = code.to_be_bytes().into_iter().fold(0u8, u8::wrapping_add);
        sum = sum.wrapping_add(payload.len() as u8);
        sum = payload.iter().fold(sum, |acc, b| acc.wrapping_add(*b));
        sum.wrapping_neg()
    }

    pub fn parse(line: &str) -> Result<Self, Error> {
        let mut tokens = line.split_ascii_whitespace();
        let mut verb_token = tokens.next().ok_or(Error::Truncated("verb"))?;
        let rssi = match verb_token.parse::<u8>() {
            Ok(rssi) => {
                verb_token = tokens.next().ok_or(Error::Truncated("verb"))?;
                Some(rssi)
            }
            Err(_) => None,
        };
        let verb = verb_token
            .parse::<Verb>()
            .map_err(|_| Error::UnknownVerb(verb_token.to_string()))?;
        let seq_token = tokens.next().ok_or(Error::Truncated("sequence"))?;
        let seq = match seq_token {
            "---" => None,
            other => Some(other.parse::<u8>().map_err(|_| Error::BadSequence(other.to_string()))?),
        };
        let mut addresses = [None; 3];
        for slot in addresses.iter_mut() {
            let token = tokens.next().ok_or(Error::Truncated("address"))?;
            if token != NULL_ADDRESS {
                *slot = Some(token.parse::<DeviceId>()?);
            }
        }
        let code_token = tokens.next().ok_or(Error::Truncated("code"))?;
        if code_token.len() != 4 {
            return Err(Error::BadCode(code_token.to_string()));
        }
        let code = u16::from_str_radix(code_token, 16)
            .map_err(|_| Error::BadCode(code_token.to_string()))?;
        let length_token = tokens.next().ok_or(Error::Truncated("length"))?;
        let declared = length_token
            .parse::<usize>()
            .map_err(|_| Error::BadLength(length_token.to_string()))?;
        let payload_token = tokens.next().ok_or(Error::Truncated("payload"))?;
        let payload = hex::decode(payload_token).map_err(Error::BadPayloadHex)?;
        if payload.len() != declared {
            return Err(Error::LengthMismatch { declared, actual: payload.len() });
        }
        if let Some(checksum_token) = tokens.next() {
            let carried = u8::from_str_radix(checksum_token, 16)
                .map_err(|_| Error::TrailingData)?;
            let computed = Self::checksum(code, &payload);
            if carried != computed {
                return Err(Error::ChecksumMismatch { carried, computed });
            }
        }
        if tokens.next().is_some() {
            return Err(Error::TrailingData);
        }
        Ok(Self { rssi, verb, seq, addresses, code, payload })
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(rssi) = self.rssi {
            write!(f, "{:03} ", rssi)?;
        }
        write!(f, "{:>2} ", self.verb)?;
        match self.seq {
            None => f.write_str("---")?,
            Some(seq) => write!(f, "{:03}", seq)?,
        }
        for address in &self.addresses {
            match address {
                None => write!(f, " {}", NULL_ADDRESS)?,
                Some(id) => write!(f, " {}", id)?,
            }
        }
        write!(
            f,
            " {:04X} {:03} {} {:02X}",
            self.code,
            self.payload.len(),
            hex::encode_upper(&self.payload),
            Self::checksum(self.code, &self.payload),
        )
    }
}

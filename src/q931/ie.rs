//! Q.931 information elements.
//!
//! Only the elements the gateway interprets get typed accessors; everything
//! else is carried opaquely so proxied messages survive unchanged.

use crate::config::Variant;
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const BEARER_CAPABILITY: u8 = 0x04;
pub const CAUSE: u8 = 0x08;
pub const CALL_STATE: u8 = 0x14;
pub const CHANNEL_ID: u8 = 0x18;
pub const PROGRESS_INDICATOR: u8 = 0x1E;
pub const CALLING_PARTY_NUMBER: u8 = 0x6C;
pub const CALLED_PARTY_NUMBER: u8 = 0x70;
/// Single-octet element marking the end of overlap digits.
pub const SENDING_COMPLETE: u8 = 0xA1;

/// Progress description 8: in-band information or pattern available.
pub const PROGRESS_INBAND_INFO: u8 = 8;

/// One information element, single-octet or TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ie {
    Single(u8),
    Tlv { tag: u8, value: Bytes },
}

impl Ie {
    pub fn tag(&self) -> u8 {
        match self {
            Ie::Single(octet) => *octet,
            Ie::Tlv { tag, .. } => *tag,
        }
    }

    pub fn value(&self) -> &[u8] {
        match self {
            Ie::Single(_) => &[],
            Ie::Tlv { value, .. } => value,
        }
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Ie::Single(octet) => buf.put_u8(*octet),
            Ie::Tlv { tag, value } => {
                buf.put_u8(*tag);
                buf.put_u8(value.len() as u8);
                buf.put(value.clone());
            }
        }
    }

    // -- builders ---------------------------------------------------------

    pub fn bearer_capability_speech(variant: Variant) -> Ie {
        let layer1 = match variant {
            Variant::Ansi => 0xA2, // G.711 mu-law
            Variant::Itu | Variant::Etsi => 0xA3, // G.711 A-law
        };
        Ie::Tlv {
            tag: BEARER_CAPABILITY,
            value: Bytes::from(vec![0x80, 0x90, layer1]),
        }
    }

    pub fn cause(value: u8) -> Ie {
        Ie::Tlv {
            tag: CAUSE,
            value: Bytes::from(vec![0x80, 0x80 | (value & 0x7F)]),
        }
    }

    pub fn call_state(state: u8) -> Ie {
        Ie::Tlv {
            tag: CALL_STATE,
            value: Bytes::from(vec![state & 0x3F]),
        }
    }

    /// Exclusive B-channel selection on a primary rate interface.
    pub fn channel_id(channel: u8) -> Ie {
        Ie::Tlv {
            tag: CHANNEL_ID,
            value: Bytes::from(vec![0xA9, 0x83, 0x80 | (channel & 0x7F)]),
        }
    }

    pub fn progress_indicator(description: u8) -> Ie {
        Ie::Tlv {
            tag: PROGRESS_INDICATOR,
            value: Bytes::from(vec![0x82, 0x80 | (description & 0x7F)]),
        }
    }

    pub fn calling_party_number(number: &PartyNumber) -> Ie {
        Ie::Tlv {
            tag: CALLING_PARTY_NUMBER,
            value: number.encode(),
        }
    }

    pub fn called_party_number(number: &PartyNumber) -> Ie {
        Ie::Tlv {
            tag: CALLED_PARTY_NUMBER,
            value: number.encode(),
        }
    }

    pub fn sending_complete() -> Ie {
        Ie::Single(SENDING_COMPLETE)
    }

    // -- accessors --------------------------------------------------------

    pub fn as_party_number(&self) -> Option<PartyNumber> {
        PartyNumber::decode(self.value())
    }

    pub fn as_cause(&self) -> Option<Cause> {
        Cause::decode(self.value())
    }

    pub fn as_bearer_capability(&self) -> Option<BearerCapability> {
        BearerCapability::decode(self.value())
    }

    pub fn as_progress_description(&self) -> Option<u8> {
        let value = self.value();
        if value.len() < 2 {
            return None;
        }
        Some(value[value.len() - 1] & 0x7F)
    }

    pub fn as_channel(&self) -> Option<u8> {
        let value = self.value();
        if value.len() < 3 {
            return None;
        }
        Some(value[value.len() - 1] & 0x7F)
    }

    pub fn as_call_state(&self) -> Option<u8> {
        self.value().first().map(|octet| octet & 0x3F)
    }
}

pub(crate) fn parse_ies(mut octets: &[u8]) -> Result<Vec<Ie>> {
    let mut ies = Vec::new();
    while let Some(&first) = octets.first() {
        if first & 0x80 != 0 {
            ies.push(Ie::Single(first));
            octets = &octets[1..];
            continue;
        }
        if octets.len() < 2 {
            return Err(Error::Q931CodecError("truncated information element".to_string()));
        }
        let len = octets[1] as usize;
        if octets.len() < 2 + len {
            return Err(Error::Q931CodecError(format!(
                "information element 0x{:02x} overruns message",
                first
            )));
        }
        ies.push(Ie::Tlv {
            tag: first,
            value: Bytes::copy_from_slice(&octets[2..2 + len]),
        });
        octets = &octets[2 + len..];
    }
    Ok(ies)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeOfNumber {
    Unknown,
    International,
    National,
    Subscriber,
    Other(u8),
}

impl TypeOfNumber {
    fn code(&self) -> u8 {
        match self {
            TypeOfNumber::Unknown => 0,
            TypeOfNumber::International => 1,
            TypeOfNumber::National => 2,
            TypeOfNumber::Subscriber => 4,
            TypeOfNumber::Other(code) => *code & 0x07,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => TypeOfNumber::Unknown,
            1 => TypeOfNumber::International,
            2 => TypeOfNumber::National,
            4 => TypeOfNumber::Subscriber,
            other => TypeOfNumber::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberingPlan {
    Unknown,
    Isdn,
    Private,
    Other(u8),
}

impl NumberingPlan {
    fn code(&self) -> u8 {
        match self {
            NumberingPlan::Unknown => 0,
            NumberingPlan::Isdn => 1,
            NumberingPlan::Private => 9,
            NumberingPlan::Other(code) => *code & 0x0F,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => NumberingPlan::Unknown,
            1 => NumberingPlan::Isdn,
            9 => NumberingPlan::Private,
            other => NumberingPlan::Other(other),
        }
    }
}

/// Calling or called party number with its address attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyNumber {
    pub ton: TypeOfNumber,
    pub plan: NumberingPlan,
    pub digits: String,
}

impl PartyNumber {
    pub fn new(ton: TypeOfNumber, plan: NumberingPlan, digits: &str) -> Self {
        PartyNumber {
            ton,
            plan,
            digits: digits.to_string(),
        }
    }

    pub fn national(digits: &str) -> Self {
        PartyNumber::new(TypeOfNumber::National, NumberingPlan::Isdn, digits)
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.digits.len());
        buf.put_u8(0x80 | (self.ton.code() << 4) | self.plan.code());
        buf.put(self.digits.as_bytes());
        buf.freeze()
    }

    fn decode(value: &[u8]) -> Option<PartyNumber> {
        let first = *value.first()?;
        // Octet 3a (presentation/screening) follows when the extension bit
        // is clear.
        let digits_at = if first & 0x80 != 0 { 1 } else { 2 };
        if value.len() < digits_at {
            return None;
        }
        let digits = std::str::from_utf8(&value[digits_at..]).ok()?;
        Some(PartyNumber {
            ton: TypeOfNumber::from_code((first >> 4) & 0x07),
            plan: NumberingPlan::from_code(first & 0x0F),
            digits: digits.to_string(),
        })
    }
}

/// Q.850 cause with its raw diagnostics, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cause {
    pub value: u8,
    pub diagnostics: Bytes,
}

impl Cause {
    fn decode(value: &[u8]) -> Option<Cause> {
        let first = *value.first()?;
        // Recommendation octet present when the extension bit is clear.
        let cause_at = if first & 0x80 != 0 { 1 } else { 2 };
        let cause_octet = *value.get(cause_at)?;
        Some(Cause {
            value: cause_octet & 0x7F,
            diagnostics: Bytes::copy_from_slice(value.get(cause_at + 1..).unwrap_or(&[])),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCapability {
    Speech,
    UnrestrictedDigital,
    Audio3k1,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    MuLaw,
    ALaw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerCapability {
    pub transfer: TransferCapability,
    pub law: Option<G711Law>,
}

impl BearerCapability {
    pub fn is_voice(&self) -> bool {
        matches!(
            self.transfer,
            TransferCapability::Speech | TransferCapability::Audio3k1
        )
    }

    fn decode(value: &[u8]) -> Option<BearerCapability> {
        let transfer = match value.first()? & 0x1F {
            0x00 => TransferCapability::Speech,
            0x08 => TransferCapability::UnrestrictedDigital,
            0x10 => TransferCapability::Audio3k1,
            other => TransferCapability::Other(other),
        };
        let law = value.get(2).and_then(|octet| match octet & 0x1F {
            0x02 => Some(G711Law::MuLaw),
            0x03 => Some(G711Law::ALaw),
            _ => None,
        });
        Some(BearerCapability { transfer, law })
    }
}

//! Q.931 message codec.
//!
//! Messages are `[discriminator][call reference][message type][IEs...]`.
//! The IE parser keeps every element it does not understand and the encoder
//! re-emits elements in their original order, so proxied messages survive
//! byte-for-byte.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub mod ie;
pub use ie::{Cause, Ie, NumberingPlan, PartyNumber, TypeOfNumber};

/// Q.931 protocol discriminator.
pub const PROTOCOL_DISCRIMINATOR: u8 = 0x08;

/// Call reference: up to two value octets on PRI, flag bit distinguishing
/// the originating side. The dummy reference (length 0) is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallRef {
    pub value: u16,
    /// Set on messages sent *to* the side that allocated the reference.
    pub flag: bool,
    /// Encoded length in octets (0, 1 or 2).
    pub len: u8,
}

impl CallRef {
    pub fn new(value: u16) -> Self {
        CallRef {
            value,
            flag: false,
            len: 2,
        }
    }

    pub fn dummy() -> Self {
        CallRef {
            value: 0,
            flag: false,
            len: 0,
        }
    }

    /// The same reference as seen from the other side of the interface.
    pub fn mirrored(&self) -> Self {
        CallRef {
            value: self.value,
            flag: !self.flag,
            len: self.len,
        }
    }
}

impl std::fmt::Display for CallRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "0x{:04x}{}",
            self.value,
            if self.flag { "/r" } else { "/o" }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Alerting,
    CallProceeding,
    Progress,
    Setup,
    SetupAck,
    Connect,
    ConnectAck,
    Disconnect,
    Release,
    ReleaseComplete,
    Information,
    Notify,
    Status,
    StatusEnquiry,
    Other(u8),
}

impl MessageType {
    pub fn code(&self) -> u8 {
        match self {
            MessageType::Alerting => 0x01,
            MessageType::CallProceeding => 0x02,
            MessageType::Progress => 0x03,
            MessageType::Setup => 0x05,
            MessageType::SetupAck => 0x0D,
            MessageType::Connect => 0x07,
            MessageType::ConnectAck => 0x0F,
            MessageType::Disconnect => 0x45,
            MessageType::Release => 0x4D,
            MessageType::ReleaseComplete => 0x5A,
            MessageType::Information => 0x7B,
            MessageType::Notify => 0x6E,
            MessageType::Status => 0x7D,
            MessageType::StatusEnquiry => 0x75,
            MessageType::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => MessageType::Alerting,
            0x02 => MessageType::CallProceeding,
            0x03 => MessageType::Progress,
            0x05 => MessageType::Setup,
            0x0D => MessageType::SetupAck,
            0x07 => MessageType::Connect,
            0x0F => MessageType::ConnectAck,
            0x45 => MessageType::Disconnect,
            0x4D => MessageType::Release,
            0x5A => MessageType::ReleaseComplete,
            0x7B => MessageType::Information,
            0x6E => MessageType::Notify,
            0x7D => MessageType::Status,
            0x75 => MessageType::StatusEnquiry,
            other => MessageType::Other(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Other(code) => write!(f, "Other(0x{:02x})", code),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Q931Message {
    pub call_ref: CallRef,
    pub message_type: MessageType,
    pub ies: Vec<Ie>,
}

impl Q931Message {
    pub fn new(call_ref: CallRef, message_type: MessageType) -> Self {
        Q931Message {
            call_ref,
            message_type,
            ies: Vec::new(),
        }
    }

    pub fn with_ie(mut self, ie: Ie) -> Self {
        self.ies.push(ie);
        self
    }

    pub fn decode(octets: &[u8]) -> Result<Q931Message> {
        if octets.len() < 3 {
            return Err(Error::Q931CodecError("message too short".to_string()));
        }
        if octets[0] != PROTOCOL_DISCRIMINATOR {
            return Err(Error::Q931CodecError(format!(
                "unexpected protocol discriminator 0x{:02x}",
                octets[0]
            )));
        }

        let ref_len = (octets[1] & 0x0F) as usize;
        if ref_len > 2 {
            return Err(Error::Q931CodecError(format!(
                "call reference length {} unsupported",
                ref_len
            )));
        }
        if octets.len() < 3 + ref_len {
            return Err(Error::Q931CodecError("truncated call reference".to_string()));
        }

        let call_ref = if ref_len == 0 {
            CallRef::dummy()
        } else {
            let flag = octets[2] & 0x80 != 0;
            let mut value = (octets[2] & 0x7F) as u16;
            if ref_len == 2 {
                value = (value << 8) | octets[3] as u16;
            }
            CallRef {
                value,
                flag,
                len: ref_len as u8,
            }
        };

        let mt_index = 2 + ref_len;
        let message_type = MessageType::from_code(octets[mt_index]);
        let ies = ie::parse_ies(&octets[mt_index + 1..])?;

        Ok(Q931Message {
            call_ref,
            message_type,
            ies,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.ies.len() * 8);
        buf.put_u8(PROTOCOL_DISCRIMINATOR);
        buf.put_u8(self.call_ref.len & 0x0F);
        match self.call_ref.len {
            0 => {}
            1 => {
                let flag = if self.call_ref.flag { 0x80 } else { 0x00 };
                buf.put_u8(flag | (self.call_ref.value as u8 & 0x7F));
            }
            _ => {
                let flag = if self.call_ref.flag { 0x80 } else { 0x00 };
                buf.put_u8(flag | ((self.call_ref.value >> 8) as u8 & 0x7F));
                buf.put_u8(self.call_ref.value as u8);
            }
        }
        buf.put_u8(self.message_type.code());
        for ie in &self.ies {
            ie.encode_into(&mut buf);
        }
        buf.freeze()
    }

    pub fn find_ie(&self, tag: u8) -> Option<&Ie> {
        self.ies.iter().find(|ie| ie.tag() == tag)
    }

    pub fn calling_number(&self) -> Option<PartyNumber> {
        self.find_ie(ie::CALLING_PARTY_NUMBER)
            .and_then(Ie::as_party_number)
    }

    pub fn called_number(&self) -> Option<PartyNumber> {
        self.find_ie(ie::CALLED_PARTY_NUMBER)
            .and_then(Ie::as_party_number)
    }

    pub fn cause(&self) -> Option<Cause> {
        self.find_ie(ie::CAUSE).and_then(Ie::as_cause)
    }

    pub fn bearer_capability(&self) -> Option<ie::BearerCapability> {
        self.find_ie(ie::BEARER_CAPABILITY)
            .and_then(Ie::as_bearer_capability)
    }

    pub fn progress_indicator(&self) -> Option<u8> {
        self.find_ie(ie::PROGRESS_INDICATOR)
            .and_then(Ie::as_progress_description)
    }

    pub fn channel(&self) -> Option<u8> {
        self.find_ie(ie::CHANNEL_ID).and_then(Ie::as_channel)
    }

    pub fn sending_complete(&self) -> bool {
        self.ies
            .iter()
            .any(|ie| matches!(ie, Ie::Single(octet) if *octet == ie::SENDING_COMPLETE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Variant;

    #[test]
    fn test_setup_round_trip() {
        let msg = Q931Message::new(CallRef::new(0x1234), MessageType::Setup)
            .with_ie(Ie::bearer_capability_speech(Variant::Itu))
            .with_ie(Ie::channel_id(1))
            .with_ie(Ie::calling_party_number(&PartyNumber::national("5551001")))
            .with_ie(Ie::called_party_number(&PartyNumber::national("5551002")));

        let octets = msg.encode();
        assert_eq!(octets[0], PROTOCOL_DISCRIMINATOR);
        assert_eq!(octets[1], 2);
        assert_eq!(&octets[2..4], &[0x12, 0x34]);
        assert_eq!(octets[4], 0x05);

        let decoded = Q931Message::decode(&octets).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.encode(), octets);
        assert_eq!(decoded.calling_number().unwrap().digits, "5551001");
        assert_eq!(decoded.called_number().unwrap().digits, "5551002");
    }

    #[test]
    fn test_call_ref_flag_round_trip() {
        let mut call_ref = CallRef::new(0x0042);
        call_ref.flag = true;
        let msg = Q931Message::new(call_ref, MessageType::Connect);
        let decoded = Q931Message::decode(&msg.encode()).unwrap();
        assert!(decoded.call_ref.flag);
        assert_eq!(decoded.call_ref.value, 0x0042);
        assert_eq!(decoded.call_ref.mirrored().flag, false);
    }

    #[test]
    fn test_dummy_call_ref() {
        let msg = Q931Message::new(CallRef::dummy(), MessageType::Information);
        let octets = msg.encode();
        assert_eq!(octets[1], 0);
        let decoded = Q931Message::decode(&octets).unwrap();
        assert_eq!(decoded.call_ref.len, 0);
    }

    #[test]
    fn test_unknown_ies_preserved_in_order() {
        // 0x7F is not an IE the gateway interprets; 0xA1 is single-octet.
        let msg = Q931Message::new(CallRef::new(9), MessageType::Setup)
            .with_ie(Ie::Tlv {
                tag: 0x7F,
                value: Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]),
            })
            .with_ie(Ie::Single(ie::SENDING_COMPLETE))
            .with_ie(Ie::called_party_number(&PartyNumber::national("12")));

        let octets = msg.encode();
        let decoded = Q931Message::decode(&octets).unwrap();
        assert_eq!(decoded.ies, msg.ies);
        assert_eq!(decoded.encode(), octets);
        assert!(decoded.sending_complete());
    }

    #[test]
    fn test_unknown_message_type_round_trips() {
        let msg = Q931Message::new(CallRef::new(1), MessageType::Other(0x64));
        let decoded = Q931Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.message_type, MessageType::Other(0x64));
    }

    #[test]
    fn test_rejects_bad_discriminator() {
        assert!(Q931Message::decode(&[0x09, 0x02, 0x00, 0x01, 0x05]).is_err());
    }

    #[test]
    fn test_rejects_truncated_message() {
        assert!(Q931Message::decode(&[0x08, 0x02]).is_err());
        assert!(Q931Message::decode(&[0x08, 0x02, 0x00]).is_err());
    }

    #[test]
    fn test_cause_ie_round_trip() {
        let msg = Q931Message::new(CallRef::new(7), MessageType::Disconnect)
            .with_ie(Ie::cause(16));
        let decoded = Q931Message::decode(&msg.encode()).unwrap();
        let cause = decoded.cause().unwrap();
        assert_eq!(cause.value, 16);
    }
}

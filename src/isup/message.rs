//! ISUP message codec (Q.767 subset).
//!
//! Layout: `[CIC 2, little-endian, 14 bits][message type 1][mandatory fixed]
//! [pointers][mandatory variable][optional part]`. Optional parameters are
//! kept as raw TLVs so they transit the gateway unchanged.

use super::{Cic, CIC_MASK};
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const MT_IAM: u8 = 0x01;
pub const MT_ACM: u8 = 0x06;
pub const MT_CON: u8 = 0x07;
pub const MT_ANM: u8 = 0x09;
pub const MT_REL: u8 = 0x0C;
pub const MT_RLC: u8 = 0x10;
pub const MT_CPG: u8 = 0x2C;
pub const MT_CFN: u8 = 0x2F;

/// Optional parameter: calling party number.
pub const PARAM_CALLING_NUMBER: u8 = 0x0A;

/// CPG event indicator: in-band information available.
pub const CPG_EVENT_INBAND: u8 = 0x03;

/// Raw optional parameter, preserved across translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsupParam {
    pub tag: u8,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsupMessage {
    Iam {
        cic: Cic,
        called: String,
        calling: Option<String>,
        optional: Vec<IsupParam>,
    },
    Acm {
        cic: Cic,
        backward_indicators: u16,
    },
    Cpg {
        cic: Cic,
        event: u8,
    },
    Anm {
        cic: Cic,
    },
    Con {
        cic: Cic,
    },
    Rel {
        cic: Cic,
        cause: u8,
        optional: Vec<IsupParam>,
    },
    Rlc {
        cic: Cic,
    },
    /// Confusion: the answer to a message we could not act on.
    Cfn {
        cic: Cic,
        cause: u8,
    },
    Other {
        cic: Cic,
        message_type: u8,
        body: Bytes,
    },
}

impl IsupMessage {
    pub fn cic(&self) -> Cic {
        match self {
            IsupMessage::Iam { cic, .. }
            | IsupMessage::Acm { cic, .. }
            | IsupMessage::Cpg { cic, .. }
            | IsupMessage::Anm { cic }
            | IsupMessage::Con { cic }
            | IsupMessage::Rel { cic, .. }
            | IsupMessage::Rlc { cic }
            | IsupMessage::Cfn { cic, .. }
            | IsupMessage::Other { cic, .. } => *cic,
        }
    }

    pub fn message_type(&self) -> u8 {
        match self {
            IsupMessage::Iam { .. } => MT_IAM,
            IsupMessage::Acm { .. } => MT_ACM,
            IsupMessage::Cpg { .. } => MT_CPG,
            IsupMessage::Anm { .. } => MT_ANM,
            IsupMessage::Con { .. } => MT_CON,
            IsupMessage::Rel { .. } => MT_REL,
            IsupMessage::Rlc { .. } => MT_RLC,
            IsupMessage::Cfn { .. } => MT_CFN,
            IsupMessage::Other { message_type, .. } => *message_type,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u16_le(self.cic() & CIC_MASK);
        buf.put_u8(self.message_type());

        match self {
            IsupMessage::Iam {
                called,
                calling,
                optional,
                ..
            } => {
                // Nature of connection, forward call indicators, calling
                // party's category, transmission medium (3.1 kHz audio).
                buf.put_u8(0x00);
                buf.put_u16(0x6000);
                buf.put_u8(0x0A);
                buf.put_u8(0x03);

                let called_param = encode_number(called, 0x03, 0x10);
                // Pointer to the called party number, then to the optional
                // part; both measured from their own octet.
                buf.put_u8(2);
                let mut optional = optional.clone();
                if let Some(calling) = calling {
                    if !optional.iter().any(|p| p.tag == PARAM_CALLING_NUMBER) {
                        optional.insert(
                            0,
                            IsupParam {
                                tag: PARAM_CALLING_NUMBER,
                                value: encode_number(calling, 0x03, 0x11),
                            },
                        );
                    }
                }
                if optional.is_empty() {
                    buf.put_u8(0);
                } else {
                    buf.put_u8(1 + 1 + called_param.len() as u8);
                }
                buf.put_u8(called_param.len() as u8);
                buf.put(called_param);
                put_optional(&mut buf, &optional);
            }
            IsupMessage::Acm {
                backward_indicators,
                ..
            } => {
                buf.put_u16(*backward_indicators);
                buf.put_u8(0); // no optional part
            }
            IsupMessage::Cpg { event, .. } => {
                buf.put_u8(*event);
                buf.put_u8(0);
            }
            IsupMessage::Anm { .. } | IsupMessage::Con { .. } => {
                buf.put_u8(0);
            }
            IsupMessage::Rel {
                cause, optional, ..
            } => {
                let cause_param = [0x85u8, 0x80 | (cause & 0x7F)];
                buf.put_u8(2);
                if optional.is_empty() {
                    buf.put_u8(0);
                } else {
                    buf.put_u8(1 + 1 + cause_param.len() as u8);
                }
                buf.put_u8(cause_param.len() as u8);
                buf.put_slice(&cause_param);
                put_optional(&mut buf, optional);
            }
            IsupMessage::Rlc { .. } => {}
            IsupMessage::Cfn { cause, .. } => {
                let cause_param = [0x85u8, 0x80 | (cause & 0x7F)];
                buf.put_u8(2);
                buf.put_u8(0);
                buf.put_u8(cause_param.len() as u8);
                buf.put_slice(&cause_param);
            }
            IsupMessage::Other { body, .. } => {
                buf.put(body.clone());
            }
        }
        buf.freeze()
    }

    pub fn decode(octets: &[u8]) -> Result<IsupMessage> {
        if octets.len() < 3 {
            return Err(Error::Error("ISUP message too short".to_string()));
        }
        let cic = u16::from_le_bytes([octets[0], octets[1]]) & CIC_MASK;
        let message_type = octets[2];
        let body = &octets[3..];

        let err = |what: &str| Error::IsupError(what.to_string(), cic);

        match message_type {
            MT_IAM => {
                if body.len() < 7 {
                    return Err(err("truncated IAM"));
                }
                let ptr_called = body[5] as usize;
                let called_at = 5 + ptr_called;
                let called_len = *body.get(called_at).ok_or_else(|| err("bad IAM pointer"))? as usize;
                let called_data = body
                    .get(called_at + 1..called_at + 1 + called_len)
                    .ok_or_else(|| err("truncated called number"))?;
                let called = decode_number(called_data).ok_or_else(|| err("bad called number"))?;

                let ptr_optional = body[6] as usize;
                let optional = if ptr_optional == 0 {
                    Vec::new()
                } else {
                    parse_optional(body.get(6 + ptr_optional..).unwrap_or(&[]))
                };
                let calling = optional
                    .iter()
                    .find(|p| p.tag == PARAM_CALLING_NUMBER)
                    .and_then(|p| decode_number(&p.value));

                Ok(IsupMessage::Iam {
                    cic,
                    called,
                    calling,
                    optional,
                })
            }
            MT_ACM => {
                if body.len() < 2 {
                    return Err(err("truncated ACM"));
                }
                Ok(IsupMessage::Acm {
                    cic,
                    backward_indicators: u16::from_be_bytes([body[0], body[1]]),
                })
            }
            MT_CPG => {
                let event = *body.first().ok_or_else(|| err("truncated CPG"))?;
                Ok(IsupMessage::Cpg { cic, event })
            }
            MT_ANM => Ok(IsupMessage::Anm { cic }),
            MT_CON => Ok(IsupMessage::Con { cic }),
            MT_REL | MT_CFN => {
                if body.len() < 2 {
                    return Err(err("truncated REL"));
                }
                let ptr_cause = body[0] as usize;
                let cause_at = ptr_cause;
                let cause_len = *body.get(cause_at).ok_or_else(|| err("bad cause pointer"))? as usize;
                let cause_data = body
                    .get(cause_at + 1..cause_at + 1 + cause_len)
                    .ok_or_else(|| err("truncated cause"))?;
                let cause = cause_data
                    .get(1)
                    .map(|octet| octet & 0x7F)
                    .ok_or_else(|| err("cause value missing"))?;

                if message_type == MT_CFN {
                    return Ok(IsupMessage::Cfn { cic, cause });
                }
                let ptr_optional = body[1] as usize;
                let optional = if ptr_optional == 0 {
                    Vec::new()
                } else {
                    parse_optional(body.get(1 + ptr_optional..).unwrap_or(&[]))
                };
                Ok(IsupMessage::Rel {
                    cic,
                    cause,
                    optional,
                })
            }
            MT_RLC => Ok(IsupMessage::Rlc { cic }),
            other => Ok(IsupMessage::Other {
                cic,
                message_type: other,
                body: Bytes::copy_from_slice(body),
            }),
        }
    }
}

fn put_optional(buf: &mut BytesMut, optional: &[IsupParam]) {
    if optional.is_empty() {
        return;
    }
    for param in optional {
        buf.put_u8(param.tag);
        buf.put_u8(param.value.len() as u8);
        buf.put(param.value.clone());
    }
    buf.put_u8(0x00); // end of optional parameters
}

fn parse_optional(mut octets: &[u8]) -> Vec<IsupParam> {
    let mut params = Vec::new();
    while octets.len() >= 2 && octets[0] != 0x00 {
        let tag = octets[0];
        let len = octets[1] as usize;
        if octets.len() < 2 + len {
            break;
        }
        params.push(IsupParam {
            tag,
            value: Bytes::copy_from_slice(&octets[2..2 + len]),
        });
        octets = &octets[2 + len..];
    }
    params
}

/// Address signals packed BCD, low nibble first; O/E bit marks odd counts.
fn encode_number(digits: &str, nature: u8, plan_octet: u8) -> Bytes {
    let signals: Vec<u8> = digits.bytes().filter_map(|b| match b {
        b'0'..=b'9' => Some(b - b'0'),
        _ => None,
    }).collect();

    let odd = signals.len() % 2 == 1;
    let mut buf = BytesMut::with_capacity(2 + signals.len() / 2 + 1);
    buf.put_u8(if odd { 0x80 | nature } else { nature });
    buf.put_u8(plan_octet);
    for pair in signals.chunks(2) {
        let low = pair[0];
        let high = pair.get(1).copied().unwrap_or(0);
        buf.put_u8((high << 4) | low);
    }
    buf.freeze()
}

fn decode_number(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let odd = data[0] & 0x80 != 0;
    let mut digits = String::new();
    for (i, octet) in data[2..].iter().enumerate() {
        digits.push(char::from(b'0' + (octet & 0x0F)));
        let last = i == data.len() - 3;
        if !(last && odd) {
            digits.push(char::from(b'0' + (octet >> 4)));
        }
    }
    Some(digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iam_round_trip() {
        let msg = IsupMessage::Iam {
            cic: 42,
            called: "5551002".to_string(),
            calling: Some("5551001".to_string()),
            optional: Vec::new(),
        };
        let octets = msg.encode();
        assert_eq!(u16::from_le_bytes([octets[0], octets[1]]), 42);
        assert_eq!(octets[2], MT_IAM);

        match IsupMessage::decode(&octets).unwrap() {
            IsupMessage::Iam {
                cic,
                called,
                calling,
                ..
            } => {
                assert_eq!(cic, 42);
                assert_eq!(called, "5551002");
                assert_eq!(calling.as_deref(), Some("5551001"));
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_iam_even_digit_count() {
        let msg = IsupMessage::Iam {
            cic: 1,
            called: "12345678".to_string(),
            calling: None,
            optional: Vec::new(),
        };
        match IsupMessage::decode(&msg.encode()).unwrap() {
            IsupMessage::Iam { called, .. } => assert_eq!(called, "12345678"),
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_rel_carries_cause() {
        let msg = IsupMessage::Rel {
            cic: 7,
            cause: 17,
            optional: Vec::new(),
        };
        match IsupMessage::decode(&msg.encode()).unwrap() {
            IsupMessage::Rel { cic, cause, .. } => {
                assert_eq!(cic, 7);
                assert_eq!(cause, 17);
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_optional_params_preserved() {
        let param = IsupParam {
            tag: 0x3F,
            value: Bytes::from_static(&[0x01, 0x02, 0x03]),
        };
        let msg = IsupMessage::Rel {
            cic: 9,
            cause: 16,
            optional: vec![param.clone()],
        };
        match IsupMessage::decode(&msg.encode()).unwrap() {
            IsupMessage::Rel { optional, .. } => assert_eq!(optional, vec![param]),
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_cic_masked_to_14_bits() {
        let msg = IsupMessage::Rlc { cic: 0x3FFF };
        let decoded = IsupMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.cic(), 0x3FFF);
    }

    #[test]
    fn test_unknown_type_preserved() {
        let octets = [0x07, 0x00, 0x55, 0xAA, 0xBB];
        match IsupMessage::decode(&octets).unwrap() {
            IsupMessage::Other {
                cic,
                message_type,
                body,
            } => {
                assert_eq!(cic, 7);
                assert_eq!(message_type, 0x55);
                assert_eq!(body.as_ref(), &[0xAA, 0xBB]);
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn test_rejects_truncated() {
        assert!(IsupMessage::decode(&[0x01]).is_err());
        assert!(IsupMessage::decode(&[0x01, 0x00, MT_IAM, 0x00]).is_err());
    }
}

//! Minimal SDP for G.711 trunk calls.
//!
//! The gateway negotiates exactly what a TDM trunk can carry: PCMU/PCMA,
//! telephone-event for DTMF, and clearmode for unrestricted digital calls.
//! Anything richer is a media collaborator's problem.

use crate::config::Variant;
use crate::q931::ie::{BearerCapability, G711Law, TransferCapability};
use std::fmt::Write;
use std::net::IpAddr;

pub const PT_PCMU: u8 = 0;
pub const PT_PCMA: u8 = 8;
pub const PT_CLEARMODE: u8 = 97;
pub const PT_TELEPHONE_EVENT: u8 = 101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn attribute(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub addr: IpAddr,
    pub port: u16,
    pub payloads: Vec<u8>,
    pub direction: Direction,
}

impl MediaDescription {
    /// Offer for a trunk call with the given bearer capability. Speech and
    /// 3.1 kHz audio get G.711 (preferred law first) plus telephone-event;
    /// unrestricted digital gets clearmode.
    pub fn offer(
        addr: IpAddr,
        port: u16,
        bearer: Option<&BearerCapability>,
        variant: Variant,
    ) -> MediaDescription {
        let unrestricted = bearer
            .map(|b| b.transfer == TransferCapability::UnrestrictedDigital)
            .unwrap_or(false);
        if unrestricted {
            return MediaDescription {
                addr,
                port,
                payloads: vec![PT_CLEARMODE],
                direction: Direction::SendRecv,
            };
        }

        let law = bearer.and_then(|b| b.law).unwrap_or(match variant {
            Variant::Ansi => G711Law::MuLaw,
            Variant::Itu | Variant::Etsi => G711Law::ALaw,
        });
        let payloads = match law {
            G711Law::ALaw => vec![PT_PCMA, PT_PCMU, PT_TELEPHONE_EVENT],
            G711Law::MuLaw => vec![PT_PCMU, PT_PCMA, PT_TELEPHONE_EVENT],
        };
        MediaDescription {
            addr,
            port,
            payloads,
            direction: Direction::SendRecv,
        }
    }

    /// Answer to a parsed offer: intersect with what the trunk supports,
    /// keeping the offerer's preference order.
    pub fn answer(&self, offer: &MediaDescription) -> MediaDescription {
        let payloads: Vec<u8> = offer
            .payloads
            .iter()
            .copied()
            .filter(|pt| self.payloads.contains(pt))
            .collect();
        MediaDescription {
            addr: self.addr,
            port: self.port,
            payloads: if payloads.is_empty() {
                self.payloads.clone()
            } else {
                payloads
            },
            direction: self.direction,
        }
    }

    pub fn render(&self, session_id: u64) -> String {
        let mut out = String::with_capacity(256);
        let _ = writeln!(out, "v=0");
        let _ = writeln!(
            out,
            "o=- {} {} IN IP4 {}",
            session_id, session_id, self.addr
        );
        let _ = writeln!(out, "s=-");
        let _ = writeln!(out, "c=IN IP4 {}", self.addr);
        let _ = writeln!(out, "t=0 0");
        let payload_list = self
            .payloads
            .iter()
            .map(|pt| pt.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(out, "m=audio {} RTP/AVP {}", self.port, payload_list);
        for pt in &self.payloads {
            match *pt {
                PT_PCMU => {
                    let _ = writeln!(out, "a=rtpmap:0 PCMU/8000");
                }
                PT_PCMA => {
                    let _ = writeln!(out, "a=rtpmap:8 PCMA/8000");
                }
                PT_CLEARMODE => {
                    let _ = writeln!(out, "a=rtpmap:97 CLEARMODE/8000");
                }
                PT_TELEPHONE_EVENT => {
                    let _ = writeln!(out, "a=rtpmap:101 telephone-event/8000");
                    let _ = writeln!(out, "a=fmtp:101 0-15");
                }
                _ => {}
            }
        }
        let _ = writeln!(out, "a={}", self.direction.attribute());
        out.replace('\n', "\r\n")
    }

    pub fn parse(body: &[u8]) -> Option<MediaDescription> {
        let text = std::str::from_utf8(body).ok()?;
        let mut addr: Option<IpAddr> = None;
        let mut port: Option<u16> = None;
        let mut payloads: Vec<u8> = Vec::new();
        let mut direction = Direction::SendRecv;

        for line in text.lines() {
            let line = line.trim_end();
            if let Some(rest) = line.strip_prefix("c=") {
                // c=IN IP4 <addr>
                if let Some(value) = rest.split_whitespace().nth(2) {
                    addr = value.parse().ok();
                }
            } else if let Some(rest) = line.strip_prefix("m=audio ") {
                let mut fields = rest.split_whitespace();
                port = fields.next().and_then(|p| p.parse().ok());
                // skip the transport token, the rest are payload types
                payloads = fields
                    .skip(1)
                    .filter_map(|pt| pt.parse().ok())
                    .collect();
            } else if let Some(rest) = line.strip_prefix("a=") {
                match rest {
                    "sendrecv" => direction = Direction::SendRecv,
                    "sendonly" => direction = Direction::SendOnly,
                    "recvonly" => direction = Direction::RecvOnly,
                    "inactive" => direction = Direction::Inactive,
                    _ => {}
                }
            }
        }

        Some(MediaDescription {
            addr: addr?,
            port: port?,
            payloads,
            direction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn media_addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))
    }

    #[test]
    fn test_itu_speech_offer_prefers_alaw() {
        let offer = MediaDescription::offer(media_addr(), 10000, None, Variant::Itu);
        assert_eq!(offer.payloads, vec![PT_PCMA, PT_PCMU, PT_TELEPHONE_EVENT]);
    }

    #[test]
    fn test_ansi_speech_offer_prefers_mulaw() {
        let offer = MediaDescription::offer(media_addr(), 10000, None, Variant::Ansi);
        assert_eq!(offer.payloads, vec![PT_PCMU, PT_PCMA, PT_TELEPHONE_EVENT]);
    }

    #[test]
    fn test_render_parse_round_trip() {
        let offer = MediaDescription::offer(media_addr(), 10002, None, Variant::Itu);
        let body = offer.render(17);
        assert!(body.contains("m=audio 10002 RTP/AVP 8 0 101"));
        assert!(body.contains("a=rtpmap:101 telephone-event/8000"));

        let parsed = MediaDescription::parse(body.as_bytes()).unwrap();
        assert_eq!(parsed, offer);
    }

    #[test]
    fn test_answer_intersects_with_offer_order() {
        let local = MediaDescription::offer(media_addr(), 10004, None, Variant::Itu);
        let remote = MediaDescription {
            addr: media_addr(),
            port: 40000,
            payloads: vec![PT_PCMU, 18, PT_TELEPHONE_EVENT],
            direction: Direction::SendRecv,
        };
        let answer = local.answer(&remote);
        assert_eq!(answer.payloads, vec![PT_PCMU, PT_TELEPHONE_EVENT]);
        assert_eq!(answer.port, 10004);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MediaDescription::parse(b"not sdp at all").is_none());
        assert!(MediaDescription::parse(&[0xFF, 0xFE]).is_none());
    }

    #[test]
    fn test_clearmode_for_unrestricted_digital() {
        let bearer = BearerCapability {
            transfer: TransferCapability::UnrestrictedDigital,
            law: None,
        };
        let offer = MediaDescription::offer(media_addr(), 10000, Some(&bearer), Variant::Itu);
        assert_eq!(offer.payloads, vec![PT_CLEARMODE]);
    }
}

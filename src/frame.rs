//! LAPD (Q.921) frame codec.
//!
//! Pure functions between octets and [`Frame`] values. The data-link engine
//! owns all sequencing and retransmission; this module only packs and
//! unpacks the address/control fields and the FCS.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error as ThisError;

/// Maximum information field length (N201).
pub const N201: usize = 260;

/// SAPI carrying call-control (Q.931) traffic.
pub const SAPI_CALL_CONTROL: u8 = 0;
/// SAPI carrying TEI management; forwarded unchanged by the engine.
pub const SAPI_TEI_MANAGEMENT: u8 = 63;

const MIN_FRAME_LEN: usize = 5; // address(2) + control(1) + fcs(2)

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short")]
    TooShort,
    #[error("bad address field")]
    BadAddress,
    #[error("bad control field")]
    BadControl,
    #[error("FCS mismatch")]
    BadFcs,
    #[error("information field exceeds N201")]
    InfoTooLong,
}

/// LAPD address field: SAPI, command/response bit, TEI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub sapi: u8,
    pub command: bool,
    pub tei: u8,
}

impl Address {
    pub fn new(sapi: u8, command: bool, tei: u8) -> Self {
        Address { sapi, command, tei }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisoryKind {
    Rr,
    Rnr,
    Rej,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnnumberedKind {
    Sabme,
    Dm,
    Ui,
    Disc,
    Ua,
    Frmr,
    Xid,
}

/// Control field. I and S frames carry two octets on the wire, U one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Info { ns: u8, nr: u8, poll: bool },
    Supervisory { kind: SupervisoryKind, nr: u8, pf: bool },
    Unnumbered { kind: UnnumberedKind, pf: bool },
}

impl Control {
    pub fn nr(&self) -> Option<u8> {
        match self {
            Control::Info { nr, .. } | Control::Supervisory { nr, .. } => Some(*nr),
            Control::Unnumbered { .. } => None,
        }
    }

    pub fn poll_final(&self) -> bool {
        match self {
            Control::Info { poll, .. } => *poll,
            Control::Supervisory { pf, .. } | Control::Unnumbered { pf, .. } => *pf,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: Address,
    pub control: Control,
    pub info: Bytes,
}

impl Frame {
    pub fn new(address: Address, control: Control) -> Self {
        Frame {
            address,
            control,
            info: Bytes::new(),
        }
    }

    pub fn with_info(address: Address, control: Control, info: Bytes) -> Self {
        Frame {
            address,
            control,
            info,
        }
    }

    pub fn decode(octets: &[u8]) -> std::result::Result<Frame, FrameError> {
        if octets.len() < MIN_FRAME_LEN {
            return Err(FrameError::TooShort);
        }

        let (body, fcs_bytes) = octets.split_at(octets.len() - 2);
        let wire_fcs = u16::from_le_bytes([fcs_bytes[0], fcs_bytes[1]]);
        if fcs16(body) != wire_fcs {
            return Err(FrameError::BadFcs);
        }

        // EA0 must be clear on the first address octet, EA1 set on the second.
        if body[0] & 0x01 != 0 || body[1] & 0x01 != 1 {
            return Err(FrameError::BadAddress);
        }
        let address = Address {
            sapi: body[0] >> 2,
            command: body[0] & 0x02 != 0,
            tei: body[1] >> 1,
        };

        let c0 = body[2];
        let (control, info_start) = if c0 & 0x01 == 0 {
            if body.len() < 4 {
                return Err(FrameError::TooShort);
            }
            let c1 = body[3];
            (
                Control::Info {
                    ns: c0 >> 1,
                    nr: c1 >> 1,
                    poll: c1 & 0x01 != 0,
                },
                4,
            )
        } else if c0 & 0x03 == 0x01 {
            if body.len() < 4 {
                return Err(FrameError::TooShort);
            }
            let kind = match c0 {
                0x01 => SupervisoryKind::Rr,
                0x05 => SupervisoryKind::Rnr,
                0x09 => SupervisoryKind::Rej,
                _ => return Err(FrameError::BadControl),
            };
            let c1 = body[3];
            (
                Control::Supervisory {
                    kind,
                    nr: c1 >> 1,
                    pf: c1 & 0x01 != 0,
                },
                4,
            )
        } else {
            let kind = match c0 & !0x10 {
                0x6F => UnnumberedKind::Sabme,
                0x0F => UnnumberedKind::Dm,
                0x03 => UnnumberedKind::Ui,
                0x43 => UnnumberedKind::Disc,
                0x63 => UnnumberedKind::Ua,
                0x87 => UnnumberedKind::Frmr,
                0xAF => UnnumberedKind::Xid,
                _ => return Err(FrameError::BadControl),
            };
            (
                Control::Unnumbered {
                    kind,
                    pf: c0 & 0x10 != 0,
                },
                3,
            )
        };

        Ok(Frame {
            address,
            control,
            info: Bytes::copy_from_slice(&body[info_start..]),
        })
    }

    pub fn encode(&self) -> std::result::Result<Bytes, FrameError> {
        if self.info.len() > N201 {
            return Err(FrameError::InfoTooLong);
        }
        let mut buf = BytesMut::with_capacity(6 + self.info.len());

        buf.put_u8((self.address.sapi << 2) | if self.address.command { 0x02 } else { 0x00 });
        buf.put_u8((self.address.tei << 1) | 0x01);

        match self.control {
            Control::Info { ns, nr, poll } => {
                buf.put_u8((ns & 0x7F) << 1);
                buf.put_u8(((nr & 0x7F) << 1) | poll as u8);
            }
            Control::Supervisory { kind, nr, pf } => {
                buf.put_u8(match kind {
                    SupervisoryKind::Rr => 0x01,
                    SupervisoryKind::Rnr => 0x05,
                    SupervisoryKind::Rej => 0x09,
                });
                buf.put_u8(((nr & 0x7F) << 1) | pf as u8);
            }
            Control::Unnumbered { kind, pf } => {
                let base = match kind {
                    UnnumberedKind::Sabme => 0x6F,
                    UnnumberedKind::Dm => 0x0F,
                    UnnumberedKind::Ui => 0x03,
                    UnnumberedKind::Disc => 0x43,
                    UnnumberedKind::Ua => 0x63,
                    UnnumberedKind::Frmr => 0x87,
                    UnnumberedKind::Xid => 0xAF,
                };
                buf.put_u8(base | if pf { 0x10 } else { 0x00 });
            }
        }

        buf.put(self.info.clone());
        let fcs = fcs16(&buf);
        buf.put_u16_le(fcs);
        Ok(buf.freeze())
    }
}

/// FCS-16 per ISO/IEC 13239: polynomial 0x1021 (reflected 0x8408),
/// init 0xFFFF, final complement, transmitted LSB first.
pub fn fcs16(data: &[u8]) -> u16 {
    let mut fcs: u16 = 0xFFFF;
    for &octet in data {
        fcs ^= octet as u16;
        for _ in 0..8 {
            if fcs & 1 != 0 {
                fcs = (fcs >> 1) ^ 0x8408;
            } else {
                fcs >>= 1;
            }
        }
    }
    !fcs
}

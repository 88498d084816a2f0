//! ISUP call handling over a SIGTRAN feed.
//!
//! The SIGTRAN collaborator delivers whole ISUP messages; MTP transport is
//! not this crate's concern. This module owns the CIC pool, the per-circuit
//! state machines and glare resolution.

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod cic;
pub mod circuit;
pub mod message;

pub use cic::CicPool;
pub use circuit::{CircuitState, IsupHandler};
pub use message::{IsupMessage, IsupParam};

/// Circuit identification code, 14 bits.
pub type Cic = u16;

pub const CIC_MASK: u16 = 0x3FFF;

pub type IsupSender = UnboundedSender<IsupMessage>;
pub type IsupReceiver = UnboundedReceiver<IsupMessage>;
pub type IsupEventSender = UnboundedSender<IsupEvent>;
pub type IsupEventReceiver = UnboundedReceiver<IsupEvent>;

/// Events surfaced to the translator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsupEvent {
    IncomingCall {
        cic: Cic,
        calling: Option<String>,
        called: String,
        /// The IAM as received, for SIP-T tunneling.
        raw: bytes::Bytes,
    },
    /// ACM or CPG; `inband` when the backward indicators announce media.
    Progress {
        cic: Cic,
        inband: bool,
    },
    Answered {
        cic: Cic,
    },
    /// Peer released the call; RLC is sent automatically.
    Released {
        cic: Cic,
        cause: u8,
    },
    /// The circuit returned to the pool.
    CircuitFreed {
        cic: Cic,
    },
    /// Dual seizure resolved; on a lost glare the original call must be
    /// re-originated on a fresh circuit.
    GlareLost {
        cic: Cic,
        calling: Option<String>,
        called: String,
    },
    UnknownMessage {
        cic: Cic,
        message_type: u8,
    },
}

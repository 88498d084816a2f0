use crate::frame::Frame;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod engine;
pub use engine::LapdEngine;

#[cfg(test)]
mod tests;

pub const DEFAULT_T200: Duration = Duration::from_millis(1000);
pub const DEFAULT_T203: Duration = Duration::from_millis(10000);
pub const DEFAULT_N200: u8 = 3;
pub const DEFAULT_WINDOW: u8 = 7;

/// Sequence numbers are mod 128 (extended operation, the only mode PRI uses).
pub const SEQ_MODULO: u8 = 128;

pub type LapdInputSender = UnboundedSender<LapdInput>;
pub type LapdInputReceiver = UnboundedReceiver<LapdInput>;
pub type LapdEventSender = UnboundedSender<LapdEvent>;
pub type LapdEventReceiver = UnboundedReceiver<LapdEvent>;

/// Data-link endpoint state, Q.921 subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapdState {
    Down,
    AwaitingEstablishment,
    Established,
    Releasing,
}

impl std::fmt::Display for LapdState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LapdState::Down => write!(f, "Down"),
            LapdState::AwaitingEstablishment => write!(f, "AwaitingEstablishment"),
            LapdState::Established => write!(f, "Established"),
            LapdState::Releasing => write!(f, "Releasing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapdErrorKind {
    EstablishmentFailed,
    LinkLost,
    PeerRejected,
}

/// Everything that drives an engine arrives on one queue, timers included.
#[derive(Debug)]
pub enum LapdInput {
    /// Raw D-channel octets from the TDM link.
    Wire(Bytes),
    Command(LapdCommand),
    Timer(LapdTimer),
}

#[derive(Debug, Clone)]
pub enum LapdCommand {
    /// Begin establishment (SABME).
    Start,
    /// Orderly release (DISC).
    Stop,
    /// Queue an I-frame payload for in-sequence delivery.
    Transmit(Bytes),
    /// Send a supervisory RR(P=1) poll; used by NFAS heartbeat supervision.
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapdTimer {
    T200,
    T203,
}

/// Events surfaced to the engine owner (call control for FAS, the NFAS
/// manager for grouped spans).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LapdEvent {
    Established,
    Released,
    /// In-sequence I-frame payload, delivered in ascending N(S) order.
    Data(Bytes),
    /// SAPI 63 (TEI management) frame, forwarded unchanged.
    Management(Frame),
    Error(LapdErrorKind),
}

#[derive(Debug, Clone)]
pub struct LapdConfig {
    pub sapi: u8,
    pub tei: u8,
    /// Connection endpoint suffix distinguishing NFAS members on one TEI.
    pub ces: u8,
    /// Network side sends commands with C/R=1, the user side with C/R=0.
    pub network_side: bool,
    pub t200: Duration,
    pub t203: Duration,
    pub n200: u8,
    pub window: u8,
}

impl Default for LapdConfig {
    fn default() -> Self {
        Self {
            sapi: 0,
            tei: 0,
            ces: 0,
            network_side: false,
            t200: DEFAULT_T200,
            t203: DEFAULT_T203,
            n200: DEFAULT_N200,
            window: DEFAULT_WINDOW,
        }
    }
}

/// `(a - b) mod 128`, the distance from `b` forward to `a`.
pub(crate) fn seq_sub(a: u8, b: u8) -> u8 {
    a.wrapping_sub(b) & (SEQ_MODULO - 1)
}

pub(crate) fn seq_inc(seq: u8) -> u8 {
    (seq + 1) & (SEQ_MODULO - 1)
}

/// True when `seq` lies in the window `[start, end)` mod 128.
pub(crate) fn seq_in_window(seq: u8, start: u8, end: u8) -> bool {
    seq_sub(seq, start) < seq_sub(end, start)
}

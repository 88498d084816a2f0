//! NFAS span group management.
//!
//! One logical D-channel over several physical spans: the primary carries
//! signaling, backups stay armed, and the group supervisor fails over when
//! the active span dies or stops answering heartbeats.

use crate::lapd::LapdInputSender;
use crate::tdm::SpanId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod group;
pub use group::NfasGroup;

#[cfg(test)]
mod tests;

pub type NfasEventSender = UnboundedSender<NfasEvent>;
pub type NfasEventReceiver = UnboundedReceiver<NfasEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Inactive,
    Active,
    Switching,
}

impl std::fmt::Display for GroupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    LinkError,
    LinkReleased,
    HeartbeatLoss,
    Forced,
}

impl std::fmt::Display for SwitchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Events the group surfaces to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NfasEvent {
    /// The group came up on its first span.
    GroupActive { span: SpanId },
    SwitchoverCompleted {
        from: SpanId,
        to: SpanId,
        reason: SwitchReason,
    },
    GroupInactive { reason: SwitchReason },
    /// The replay queue overflowed during a switchover.
    QueueOverflow { dropped: usize },
    /// Q.931 payload from the active span.
    Data(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NfasTimer {
    Heartbeat,
    /// Switchover establishment watchdog for the current candidate.
    Watchdog,
}

/// Handle to one member engine, owned by the group.
pub struct SpanMember {
    pub span_id: SpanId,
    pub input_tx: LapdInputSender,
}

/// Group counters, snapshotted for operational events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfasStats {
    pub switchover_count: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_lost: u64,
    pub calls_handled: u64,
    pub last_switchover: Option<DateTime<Utc>>,
}

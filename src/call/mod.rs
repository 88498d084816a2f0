use crate::q931::{
    ie::{BearerCapability, PartyNumber},
    CallRef, Q931Message,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod control;
pub mod machine;
pub use control::CallControl;
pub use machine::CallMachine;

#[cfg(test)]
mod tests;

pub type CallEventSender = UnboundedSender<CallEvent>;
pub type CallEventReceiver = UnboundedReceiver<CallEvent>;
pub type Q931Sender = UnboundedSender<Q931Message>;
pub type Q931Receiver = UnboundedReceiver<Q931Message>;

/// Q.931 §5 call states, numeric values per the standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Null,
    CallInitiated,
    OverlapSending,
    OutgoingCallProceeding,
    CallDelivered,
    CallPresent,
    CallReceived,
    ConnectRequest,
    IncomingCallProceeding,
    Active,
    DisconnectRequest,
    DisconnectIndication,
    ReleaseRequest,
    OverlapReceiving,
}

impl CallState {
    pub fn code(&self) -> u8 {
        match self {
            CallState::Null => 0,
            CallState::CallInitiated => 1,
            CallState::OverlapSending => 2,
            CallState::OutgoingCallProceeding => 3,
            CallState::CallDelivered => 4,
            CallState::CallPresent => 6,
            CallState::CallReceived => 7,
            CallState::ConnectRequest => 8,
            CallState::IncomingCallProceeding => 9,
            CallState::Active => 10,
            CallState::DisconnectRequest => 11,
            CallState::DisconnectIndication => 12,
            CallState::ReleaseRequest => 19,
            CallState::OverlapReceiving => 25,
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Call timers, Q.931 table 9-1 subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTimer {
    /// Alerting supervision.
    T301,
    /// Overlap receiving inter-digit timeout.
    T302,
    /// SETUP acknowledgement.
    T303,
    /// DISCONNECT acknowledgement.
    T305,
    /// RELEASE acknowledgement, one retry.
    T308,
    /// CALL PROCEEDING to next response.
    T310,
}

/// Events the call layer surfaces to the translator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// A complete inbound SETUP (overlap digits already accumulated).
    SetupIndication {
        call_ref: CallRef,
        calling: Option<PartyNumber>,
        called: Option<PartyNumber>,
        bearer: Option<BearerCapability>,
        channel: Option<u8>,
    },
    Proceeding {
        call_ref: CallRef,
        progress: Option<u8>,
    },
    Alerting {
        call_ref: CallRef,
        progress: Option<u8>,
    },
    Connected {
        call_ref: CallRef,
    },
    /// The call is clearing; `cause` is Q.850.
    Disconnected {
        call_ref: CallRef,
        cause: u8,
    },
    /// The call reference is gone.
    Released {
        call_ref: CallRef,
        cause: u8,
    },
}

impl CallEvent {
    pub fn call_ref(&self) -> &CallRef {
        match self {
            CallEvent::SetupIndication { call_ref, .. }
            | CallEvent::Proceeding { call_ref, .. }
            | CallEvent::Alerting { call_ref, .. }
            | CallEvent::Connected { call_ref }
            | CallEvent::Disconnected { call_ref, .. }
            | CallEvent::Released { call_ref, .. } => call_ref,
        }
    }
}

/// Commands the translator drives the call layer with (SIP → TDM direction).
#[derive(Debug, Clone)]
pub enum CallCommand {
    Originate {
        calling: Option<PartyNumber>,
        called: PartyNumber,
        channel: Option<u8>,
    },
    Proceed {
        call_ref: CallRef,
    },
    Alert {
        call_ref: CallRef,
        inband: bool,
    },
    Answer {
        call_ref: CallRef,
    },
    Disconnect {
        call_ref: CallRef,
        cause: u8,
    },
}

use super::{CallState, CallTimer};
use crate::q931::{
    ie::{BearerCapability, PartyNumber},
    CallRef,
};
use crate::timer::TimerId;
use tracing::debug;

/// Per-call record owned by [`super::CallControl`].
///
/// The machine holds state and timer handles; all message I/O and the
/// transition logic live in the control layer so a call never owns a
/// channel back into its layer.
pub struct CallMachine {
    pub call_ref: CallRef,
    /// True when this side sent the SETUP.
    pub originating: bool,
    pub state: CallState,
    pub calling: Option<PartyNumber>,
    pub called: Option<PartyNumber>,
    pub bearer: Option<BearerCapability>,
    pub channel: Option<u8>,
    /// Digits accumulated during overlap receiving.
    pub overlap_digits: String,
    pub last_cause: Option<u8>,
    pub(super) release_retried: bool,
    pub(super) timers: Vec<(CallTimer, TimerId)>,
}

impl CallMachine {
    pub fn new(call_ref: CallRef, originating: bool) -> Self {
        CallMachine {
            call_ref,
            originating,
            state: CallState::Null,
            calling: None,
            called: None,
            bearer: None,
            channel: None,
            overlap_digits: String::new(),
            last_cause: None,
            release_retried: false,
            timers: Vec::new(),
        }
    }

    pub(super) fn transition(&mut self, state: CallState) {
        if self.state != state {
            debug!(call_ref = %self.call_ref, "call {} -> {}", self.state, state);
            self.state = state;
        }
    }

    pub(super) fn remember_timer(&mut self, timer: CallTimer, id: TimerId) {
        self.timers.retain(|(kind, _)| *kind != timer);
        self.timers.push((timer, id));
    }

    pub(super) fn take_timer(&mut self, timer: CallTimer) -> Option<TimerId> {
        let index = self.timers.iter().position(|(kind, _)| *kind == timer)?;
        Some(self.timers.swap_remove(index).1)
    }

    pub(super) fn take_all_timers(&mut self) -> Vec<TimerId> {
        self.timers.drain(..).map(|(_, id)| id).collect()
    }

    pub fn is_clearing(&self) -> bool {
        matches!(
            self.state,
            CallState::DisconnectRequest
                | CallState::DisconnectIndication
                | CallState::ReleaseRequest
        )
    }
}

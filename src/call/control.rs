use super::{
    CallCommand, CallEvent, CallEventSender, CallMachine, CallState, CallTimer, Q931Sender,
};
use crate::config::Variant;
use crate::q850;
use crate::q931::{ie, ie::Ie, CallRef, MessageType, Q931Message};
use crate::timer::TimerWheel;
use crate::{Error, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub(super) const T301: Duration = Duration::from_secs(180);
pub(super) const T302: Duration = Duration::from_secs(15);
pub(super) const T303: Duration = Duration::from_secs(4);
pub(super) const T305: Duration = Duration::from_secs(30);
pub(super) const T308: Duration = Duration::from_secs(4);
pub(super) const T310: Duration = Duration::from_secs(10);

/// Q.931 call control for one D-channel endpoint.
///
/// Owns every [`CallMachine`] on the endpoint, which is what makes call
/// references unique within the D-channel scope. Messages leave through
/// `q931_tx` (toward the LAPD engine or NFAS group) and events through
/// `event_tx` (toward the translator).
pub struct CallControl {
    endpoint: String,
    variant: Variant,
    calls: HashMap<u16, CallMachine>,
    next_ref: u16,
    timers: TimerWheel<(u16, CallTimer)>,
    q931_tx: Q931Sender,
    event_tx: CallEventSender,
}

impl CallControl {
    pub fn new(
        endpoint: String,
        variant: Variant,
        q931_tx: Q931Sender,
        event_tx: CallEventSender,
    ) -> Self {
        CallControl {
            endpoint,
            variant,
            calls: HashMap::new(),
            next_ref: 1,
            timers: TimerWheel::new(),
            q931_tx,
            event_tx,
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn call_state(&self, call_ref: &CallRef) -> Option<CallState> {
        self.calls.get(&call_ref.value).map(|call| call.state)
    }

    /// Drain due timers; call from the owning task loop.
    pub fn poll_timers(&mut self, now: Instant) {
        for (value, timer) in self.timers.expire(now) {
            self.on_timer(value, timer);
        }
    }

    pub fn handle_command(&mut self, command: CallCommand) {
        let result = match command {
            CallCommand::Originate {
                calling,
                called,
                channel,
            } => self.originate(calling, called, channel).map(|_| ()),
            CallCommand::Proceed { call_ref } => self.proceed(&call_ref),
            CallCommand::Alert { call_ref, inband } => self.alert(&call_ref, inband),
            CallCommand::Answer { call_ref } => self.answer(&call_ref),
            CallCommand::Disconnect { call_ref, cause } => self.disconnect(&call_ref, cause),
        };
        if let Err(e) = result {
            warn!(endpoint = %self.endpoint, "command failed: {}", e);
        }
    }

    /// Send a SETUP and create the originating call.
    pub fn originate(
        &mut self,
        calling: Option<ie::PartyNumber>,
        called: ie::PartyNumber,
        channel: Option<u8>,
    ) -> Result<CallRef> {
        let value = self.allocate_ref()?;
        let call_ref = CallRef::new(value);

        let mut setup = Q931Message::new(call_ref, MessageType::Setup)
            .with_ie(Ie::bearer_capability_speech(self.variant));
        if let Some(channel) = channel {
            setup = setup.with_ie(Ie::channel_id(channel));
        }
        if let Some(ref calling) = calling {
            setup = setup.with_ie(Ie::calling_party_number(calling));
        }
        setup = setup
            .with_ie(Ie::called_party_number(&called))
            .with_ie(Ie::sending_complete());

        let mut call = CallMachine::new(call_ref, true);
        call.calling = calling;
        call.called = Some(called);
        call.channel = channel;
        call.transition(CallState::CallInitiated);
        self.start_timer(&mut call, CallTimer::T303, T303);
        self.calls.insert(value, call);

        self.send(setup);
        info!(endpoint = %self.endpoint, %call_ref, "originated call");
        Ok(call_ref)
    }

    fn proceed(&mut self, call_ref: &CallRef) -> Result<()> {
        let mut call = self.take_call(call_ref)?;
        match call.state {
            CallState::CallPresent | CallState::OverlapReceiving => {
                self.cancel_timer(&mut call, CallTimer::T302);
                call.transition(CallState::IncomingCallProceeding);
                self.send(self.response(&call, MessageType::CallProceeding));
            }
            state => warn!(%call_ref, %state, "PROCEED ignored"),
        }
        self.put_call(call);
        Ok(())
    }

    fn alert(&mut self, call_ref: &CallRef, inband: bool) -> Result<()> {
        let mut call = self.take_call(call_ref)?;
        match call.state {
            CallState::CallPresent
            | CallState::OverlapReceiving
            | CallState::IncomingCallProceeding => {
                self.cancel_timer(&mut call, CallTimer::T302);
                call.transition(CallState::CallReceived);
                let mut alerting = self.response(&call, MessageType::Alerting);
                if inband {
                    alerting = alerting.with_ie(Ie::progress_indicator(ie::PROGRESS_INBAND_INFO));
                }
                self.send(alerting);
            }
            state => warn!(%call_ref, %state, "ALERT ignored"),
        }
        self.put_call(call);
        Ok(())
    }

    fn answer(&mut self, call_ref: &CallRef) -> Result<()> {
        let mut call = self.take_call(call_ref)?;
        match call.state {
            CallState::CallPresent
            | CallState::IncomingCallProceeding
            | CallState::CallReceived => {
                call.transition(CallState::ConnectRequest);
                self.send(self.response(&call, MessageType::Connect));
            }
            state => warn!(%call_ref, %state, "ANSWER ignored"),
        }
        self.put_call(call);
        Ok(())
    }

    /// Start clearing with the given Q.850 cause.
    pub fn disconnect(&mut self, call_ref: &CallRef, cause: u8) -> Result<()> {
        let mut call = self.take_call(call_ref)?;
        if call.is_clearing() {
            self.put_call(call);
            return Ok(());
        }
        self.clear_timers(&mut call);
        call.last_cause = Some(cause);

        if call.state == CallState::CallInitiated || call.state == CallState::CallPresent {
            // Nothing committed yet on this side: a single RELEASE COMPLETE
            // both rejects and frees the reference.
            let msg = self
                .response(&call, MessageType::ReleaseComplete)
                .with_ie(Ie::cause(cause));
            self.send(msg);
            self.destroy(call, cause);
            return Ok(());
        }

        call.transition(CallState::DisconnectRequest);
        let msg = self
            .response(&call, MessageType::Disconnect)
            .with_ie(Ie::cause(cause));
        self.send(msg);
        self.start_timer(&mut call, CallTimer::T305, T305);
        self.put_call(call);
        Ok(())
    }

    /// Clear every call on the endpoint without signaling (the link is gone).
    pub fn clear_all(&mut self, cause: u8) {
        let values: Vec<u16> = self.calls.keys().copied().collect();
        for value in values {
            if let Some(mut call) = self.calls.remove(&value) {
                self.clear_timers(&mut call);
                self.emit(CallEvent::Released {
                    call_ref: call.call_ref,
                    cause,
                });
            }
        }
        info!(endpoint = %self.endpoint, cause, "cleared all calls");
    }

    // -- inbound messages -------------------------------------------------

    pub fn on_message(&mut self, msg: Q931Message) {
        match msg.message_type {
            MessageType::Setup => self.on_setup(msg),
            MessageType::SetupAck => self.on_known_call(msg, Self::on_setup_ack),
            MessageType::Information => self.on_known_call(msg, Self::on_information),
            MessageType::CallProceeding => self.on_known_call(msg, Self::on_proceeding),
            MessageType::Progress => self.on_known_call(msg, Self::on_progress),
            MessageType::Alerting => self.on_known_call(msg, Self::on_alerting),
            MessageType::Connect => self.on_known_call(msg, Self::on_connect),
            MessageType::ConnectAck => self.on_known_call(msg, Self::on_connect_ack),
            MessageType::Disconnect => self.on_known_call(msg, Self::on_disconnect),
            MessageType::Release => self.on_release(msg),
            MessageType::ReleaseComplete => self.on_release_complete(msg),
            MessageType::Status => self.on_known_call(msg, Self::on_status),
            MessageType::StatusEnquiry => self.on_status_enquiry(msg),
            MessageType::Notify => {}
            MessageType::Other(code) => {
                debug!(endpoint = %self.endpoint, code, "unknown message type");
                if let Some(call) = self.calls.get(&msg.call_ref.value) {
                    let status = self
                        .response(call, MessageType::Status)
                        .with_ie(Ie::cause(q850::MESSAGE_TYPE_NONEXISTENT))
                        .with_ie(Ie::call_state(call.state.code()));
                    self.send(status);
                }
            }
        }
    }

    fn on_setup(&mut self, msg: Q931Message) {
        let value = msg.call_ref.value;

        if let Some(existing) = self.calls.get(&value) {
            if existing.originating {
                // Call-reference collision: the non-originator of the
                // in-progress call rejects the new SETUP.
                warn!(endpoint = %self.endpoint, call_ref = %msg.call_ref, "call reference collision");
                let reject = Q931Message::new(msg.call_ref.mirrored(), MessageType::ReleaseComplete)
                    .with_ie(Ie::cause(q850::INVALID_CALL_REFERENCE));
                self.send(reject);
            }
            return;
        }

        if msg.bearer_capability().is_none() {
            let reject = Q931Message::new(msg.call_ref.mirrored(), MessageType::ReleaseComplete)
                .with_ie(Ie::cause(q850::MANDATORY_IE_MISSING));
            self.send(reject);
            return;
        }

        // B-channel glare against one of our unanswered originations.
        if let Some(channel) = msg.channel() {
            if let Some(loser) = self.resolve_glare(channel, &msg.call_ref) {
                if loser == msg.call_ref.value {
                    let reject =
                        Q931Message::new(msg.call_ref.mirrored(), MessageType::ReleaseComplete)
                            .with_ie(Ie::cause(q850::REQUESTED_CHANNEL_UNAVAILABLE));
                    self.send(reject);
                    return;
                }
            }
        }

        let mut call = CallMachine::new(msg.call_ref, false);
        call.calling = msg.calling_number();
        call.called = msg.called_number();
        call.bearer = msg.bearer_capability();
        call.channel = msg.channel();

        let complete = call.called.as_ref().is_some_and(|n| !n.digits.is_empty());
        if complete || msg.sending_complete() {
            call.transition(CallState::CallPresent);
            let event = CallEvent::SetupIndication {
                call_ref: call.call_ref,
                calling: call.calling.clone(),
                called: call.called.clone(),
                bearer: call.bearer.clone(),
                channel: call.channel,
            };
            self.calls.insert(value, call);
            self.emit(event);
        } else {
            call.transition(CallState::OverlapReceiving);
            if let Some(ref called) = call.called {
                call.overlap_digits = called.digits.clone();
            }
            self.send(self.response(&call, MessageType::SetupAck));
            self.start_timer(&mut call, CallTimer::T302, T302);
            self.calls.insert(value, call);
        }
    }

    fn on_setup_ack(&mut self, call: &mut CallMachine, _msg: Q931Message) {
        if call.state == CallState::CallInitiated {
            self.cancel_timer(call, CallTimer::T303);
            call.transition(CallState::OverlapSending);
        }
    }

    fn on_information(&mut self, call: &mut CallMachine, msg: Q931Message) {
        if call.state != CallState::OverlapReceiving {
            return;
        }
        if let Some(number) = msg.called_number() {
            call.overlap_digits.push_str(&number.digits);
        }
        if msg.sending_complete() {
            self.cancel_timer(call, CallTimer::T302);
            self.complete_overlap(call);
        } else {
            self.restart_timer(call, CallTimer::T302, T302);
        }
    }

    fn complete_overlap(&mut self, call: &mut CallMachine) {
        call.called = Some(ie::PartyNumber::new(
            ie::TypeOfNumber::Unknown,
            ie::NumberingPlan::Isdn,
            &call.overlap_digits,
        ));
        call.transition(CallState::CallPresent);
        self.emit(CallEvent::SetupIndication {
            call_ref: call.call_ref,
            calling: call.calling.clone(),
            called: call.called.clone(),
            bearer: call.bearer.clone(),
            channel: call.channel,
        });
    }

    fn on_proceeding(&mut self, call: &mut CallMachine, msg: Q931Message) {
        if call.state == CallState::CallInitiated || call.state == CallState::OverlapSending {
            self.cancel_timer(call, CallTimer::T303);
            call.transition(CallState::OutgoingCallProceeding);
            self.start_timer(call, CallTimer::T310, T310);
            self.emit(CallEvent::Proceeding {
                call_ref: call.call_ref,
                progress: msg.progress_indicator(),
            });
        }
    }

    fn on_progress(&mut self, call: &mut CallMachine, msg: Q931Message) {
        self.emit(CallEvent::Proceeding {
            call_ref: call.call_ref,
            progress: msg.progress_indicator(),
        });
    }

    fn on_alerting(&mut self, call: &mut CallMachine, msg: Q931Message) {
        match call.state {
            CallState::CallInitiated
            | CallState::OverlapSending
            | CallState::OutgoingCallProceeding => {
                self.cancel_timer(call, CallTimer::T303);
                self.cancel_timer(call, CallTimer::T310);
                call.transition(CallState::CallDelivered);
                self.start_timer(call, CallTimer::T301, T301);
                self.emit(CallEvent::Alerting {
                    call_ref: call.call_ref,
                    progress: msg.progress_indicator(),
                });
            }
            _ => {}
        }
    }

    fn on_connect(&mut self, call: &mut CallMachine, _msg: Q931Message) {
        match call.state {
            CallState::CallInitiated
            | CallState::OverlapSending
            | CallState::OutgoingCallProceeding
            | CallState::CallDelivered => {
                self.clear_timers(call);
                call.transition(CallState::Active);
                self.send(self.response(call, MessageType::ConnectAck));
                self.emit(CallEvent::Connected {
                    call_ref: call.call_ref,
                });
            }
            _ => {}
        }
    }

    fn on_connect_ack(&mut self, call: &mut CallMachine, _msg: Q931Message) {
        if call.state == CallState::ConnectRequest {
            call.transition(CallState::Active);
            self.emit(CallEvent::Connected {
                call_ref: call.call_ref,
            });
        }
    }

    fn on_disconnect(&mut self, call: &mut CallMachine, msg: Q931Message) {
        let cause = msg
            .cause()
            .map(|c| c.value)
            .unwrap_or(q850::NORMAL_UNSPECIFIED);
        self.clear_timers(call);
        call.last_cause = Some(cause);
        call.transition(CallState::DisconnectIndication);
        self.emit(CallEvent::Disconnected {
            call_ref: call.call_ref,
            cause,
        });
        // Continue clearing without waiting for upper-layer confirmation.
        call.transition(CallState::ReleaseRequest);
        self.send(
            self.response(call, MessageType::Release)
                .with_ie(Ie::cause(cause)),
        );
        self.start_timer(call, CallTimer::T308, T308);
    }

    fn on_release(&mut self, msg: Q931Message) {
        let value = msg.call_ref.value;
        match self.calls.remove(&value) {
            Some(mut call) => {
                let cause = msg
                    .cause()
                    .map(|c| c.value)
                    .or(call.last_cause)
                    .unwrap_or(q850::NORMAL_CLEARING);
                self.clear_timers(&mut call);
                self.send(self.response(&call, MessageType::ReleaseComplete));
                self.destroy(call, cause);
            }
            None => {
                let reply = Q931Message::new(msg.call_ref.mirrored(), MessageType::ReleaseComplete)
                    .with_ie(Ie::cause(q850::INVALID_CALL_REFERENCE));
                self.send(reply);
            }
        }
    }

    fn on_release_complete(&mut self, msg: Q931Message) {
        if let Some(mut call) = self.calls.remove(&msg.call_ref.value) {
            let cause = msg
                .cause()
                .map(|c| c.value)
                .or(call.last_cause)
                .unwrap_or(q850::NORMAL_CLEARING);
            self.clear_timers(&mut call);
            self.destroy(call, cause);
        }
    }

    fn on_status(&mut self, call: &mut CallMachine, msg: Q931Message) {
        let reported = msg
            .find_ie(ie::CALL_STATE)
            .and_then(Ie::as_call_state)
            .unwrap_or(0);
        if reported == call.state.code() {
            return; // compatible, silently accepted
        }
        warn!(
            endpoint = %self.endpoint,
            call_ref = %call.call_ref,
            reported,
            actual = call.state.code(),
            "STATUS reports incompatible state"
        );
        if reported == 0 {
            // Peer has no such call: free ours without further signaling.
            self.clear_timers(call);
            call.last_cause = Some(q850::MESSAGE_NOT_COMPATIBLE_WITH_STATE);
            call.transition(CallState::Null);
            return;
        }
        self.clear_timers(call);
        call.last_cause = Some(q850::MESSAGE_NOT_COMPATIBLE_WITH_STATE);
        call.transition(CallState::ReleaseRequest);
        self.send(
            self.response(call, MessageType::Release)
                .with_ie(Ie::cause(q850::MESSAGE_NOT_COMPATIBLE_WITH_STATE)),
        );
        self.start_timer(call, CallTimer::T308, T308);
    }

    fn on_status_enquiry(&mut self, msg: Q931Message) {
        let state = self
            .calls
            .get(&msg.call_ref.value)
            .map(|call| call.state.code())
            .unwrap_or(0);
        let status = Q931Message::new(msg.call_ref.mirrored(), MessageType::Status)
            .with_ie(Ie::cause(q850::RESPONSE_TO_STATUS_ENQUIRY))
            .with_ie(Ie::call_state(state));
        self.send(status);
    }

    // -- timers -----------------------------------------------------------

    fn on_timer(&mut self, value: u16, timer: CallTimer) {
        let mut call = match self.calls.remove(&value) {
            Some(call) => call,
            None => return,
        };
        call.timers.retain(|(kind, _)| *kind != timer);
        debug!(endpoint = %self.endpoint, call_ref = %call.call_ref, "{:?} expired", timer);

        match timer {
            CallTimer::T301 => {
                if call.state == CallState::CallDelivered {
                    self.local_clear(&mut call, q850::NO_ANSWER);
                }
            }
            CallTimer::T302 => {
                if call.state == CallState::OverlapReceiving {
                    if call.overlap_digits.is_empty() {
                        let reject = self
                            .response(&call, MessageType::ReleaseComplete)
                            .with_ie(Ie::cause(q850::INVALID_NUMBER_FORMAT));
                        self.send(reject);
                        self.destroy(call, q850::INVALID_NUMBER_FORMAT);
                        return;
                    }
                    self.complete_overlap(&mut call);
                }
            }
            CallTimer::T303 => {
                if call.state == CallState::CallInitiated {
                    self.send(
                        self.response(&call, MessageType::ReleaseComplete)
                            .with_ie(Ie::cause(q850::RECOVERY_ON_TIMER_EXPIRY)),
                    );
                    self.destroy(call, q850::RECOVERY_ON_TIMER_EXPIRY);
                    return;
                }
            }
            CallTimer::T305 => {
                if call.state == CallState::DisconnectRequest {
                    let cause = call.last_cause.unwrap_or(q850::NORMAL_CLEARING);
                    call.transition(CallState::ReleaseRequest);
                    self.send(
                        self.response(&call, MessageType::Release)
                            .with_ie(Ie::cause(cause)),
                    );
                    self.start_timer(&mut call, CallTimer::T308, T308);
                }
            }
            CallTimer::T308 => {
                if call.state == CallState::ReleaseRequest {
                    if !call.release_retried {
                        call.release_retried = true;
                        let cause = call.last_cause.unwrap_or(q850::NORMAL_CLEARING);
                        self.send(
                            self.response(&call, MessageType::Release)
                                .with_ie(Ie::cause(cause)),
                        );
                        self.start_timer(&mut call, CallTimer::T308, T308);
                    } else {
                        // Peer never acknowledged: free the reference anyway.
                        let cause = call.last_cause.unwrap_or(q850::RECOVERY_ON_TIMER_EXPIRY);
                        self.destroy(call, cause);
                        return;
                    }
                }
            }
            CallTimer::T310 => {
                if call.state == CallState::OutgoingCallProceeding {
                    self.local_clear(&mut call, q850::RECOVERY_ON_TIMER_EXPIRY);
                }
            }
        }
        self.calls.insert(value, call);
    }

    /// Timer-driven clearing: DISCONNECT with the given cause.
    fn local_clear(&mut self, call: &mut CallMachine, cause: u8) {
        self.clear_timers(call);
        call.last_cause = Some(cause);
        call.transition(CallState::DisconnectRequest);
        self.send(
            self.response(call, MessageType::Disconnect)
                .with_ie(Ie::cause(cause)),
        );
        self.start_timer(call, CallTimer::T305, T305);
        self.emit(CallEvent::Disconnected {
            call_ref: call.call_ref,
            cause,
        });
    }

    // -- helpers ----------------------------------------------------------

    /// Glare: returns the losing reference value when `incoming` collides on
    /// `channel` with an origination of ours. Larger reference wins.
    fn resolve_glare(&mut self, channel: u8, incoming: &CallRef) -> Option<u16> {
        let ours = self.calls.values().find_map(|call| {
            (call.originating
                && call.channel == Some(channel)
                && matches!(
                    call.state,
                    CallState::CallInitiated | CallState::OutgoingCallProceeding
                ))
            .then_some(call.call_ref.value)
        })?;

        if incoming.value > ours {
            warn!(endpoint = %self.endpoint, channel, "glare lost, clearing own origination");
            let mut call = match self.calls.remove(&ours) {
                Some(call) => call,
                None => return None,
            };
            self.clear_timers(&mut call);
            call.last_cause = Some(q850::REQUESTED_CHANNEL_UNAVAILABLE);
            call.transition(CallState::ReleaseRequest);
            self.send(
                self.response(&call, MessageType::Release)
                    .with_ie(Ie::cause(q850::REQUESTED_CHANNEL_UNAVAILABLE)),
            );
            self.start_timer(&mut call, CallTimer::T308, T308);
            self.emit(CallEvent::Disconnected {
                call_ref: call.call_ref,
                cause: q850::REQUESTED_CHANNEL_UNAVAILABLE,
            });
            self.calls.insert(ours, call);
            Some(ours)
        } else {
            Some(incoming.value)
        }
    }

    fn on_known_call(
        &mut self,
        msg: Q931Message,
        handler: fn(&mut Self, &mut CallMachine, Q931Message),
    ) {
        let value = msg.call_ref.value;
        match self.calls.remove(&value) {
            Some(mut call) => {
                handler(self, &mut call, msg);
                if call.state == CallState::Null {
                    let cause = call.last_cause.unwrap_or(q850::NORMAL_CLEARING);
                    self.destroy(call, cause);
                } else {
                    self.calls.insert(value, call);
                }
            }
            None => {
                debug!(endpoint = %self.endpoint, call_ref = %msg.call_ref, "message for unknown call");
                let reply = Q931Message::new(msg.call_ref.mirrored(), MessageType::ReleaseComplete)
                    .with_ie(Ie::cause(q850::INVALID_CALL_REFERENCE));
                self.send(reply);
            }
        }
    }

    fn take_call(&mut self, call_ref: &CallRef) -> Result<CallMachine> {
        self.calls
            .remove(&call_ref.value)
            .ok_or_else(|| Error::CallError("unknown call".to_string(), *call_ref))
    }

    fn put_call(&mut self, call: CallMachine) {
        self.calls.insert(call.call_ref.value, call);
    }

    fn destroy(&mut self, mut call: CallMachine, cause: u8) {
        self.clear_timers(&mut call);
        info!(endpoint = %self.endpoint, call_ref = %call.call_ref, cause, "call released");
        self.emit(CallEvent::Released {
            call_ref: call.call_ref,
            cause,
        });
    }

    /// Message addressed to the peer for this call: the reference flag is
    /// set on messages sent toward the side that allocated it.
    fn response(&self, call: &CallMachine, message_type: MessageType) -> Q931Message {
        let mut call_ref = call.call_ref;
        call_ref.flag = !call.originating;
        Q931Message::new(call_ref, message_type)
    }

    fn allocate_ref(&mut self) -> Result<u16> {
        for _ in 0..0x7FFF {
            let value = self.next_ref;
            self.next_ref = if self.next_ref >= 0x7FFF {
                1
            } else {
                self.next_ref + 1
            };
            if !self.calls.contains_key(&value) {
                return Ok(value);
            }
        }
        Err(Error::Error("call reference space exhausted".to_string()))
    }

    fn start_timer(&mut self, call: &mut CallMachine, timer: CallTimer, after: Duration) {
        let id = self.timers.schedule(after, (call.call_ref.value, timer));
        call.remember_timer(timer, id);
    }

    fn restart_timer(&mut self, call: &mut CallMachine, timer: CallTimer, after: Duration) {
        self.cancel_timer(call, timer);
        self.start_timer(call, timer, after);
    }

    fn cancel_timer(&mut self, call: &mut CallMachine, timer: CallTimer) {
        if let Some(id) = call.take_timer(timer) {
            self.timers.cancel(id);
        }
    }

    fn clear_timers(&mut self, call: &mut CallMachine) {
        for id in call.take_all_timers() {
            self.timers.cancel(id);
        }
    }

    fn send(&self, msg: Q931Message) {
        if self.q931_tx.send(msg).is_err() {
            debug!(endpoint = %self.endpoint, "Q.931 sink closed");
        }
    }

    fn emit(&self, event: CallEvent) {
        if self.event_tx.send(event).is_err() {
            debug!(endpoint = %self.endpoint, "call event receiver gone");
        }
    }
}

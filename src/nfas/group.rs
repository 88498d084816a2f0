use super::{
    GroupState, NfasEvent, NfasEventSender, NfasStats, NfasTimer, SpanMember, SwitchReason,
};
use crate::config::{HeartbeatMode, NfasConfig};
use crate::lapd::{LapdCommand, LapdErrorKind, LapdEvent, LapdInput};
use crate::q931::{CallRef, MessageType, Q931Message};
use crate::tdm::SpanId;
use crate::timer::TimerWheel;
use crate::{Error, Result};
use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberState {
    Down,
    Establishing,
    Established,
    Failed,
}

struct Member {
    handle: SpanMember,
    state: MemberState,
}

/// Supervisor for one NFAS group.
///
/// The group owns a handle to every member engine and is itself driven by
/// the gateway task: engine events, Q.931 traffic and timer polls all come
/// through synchronous methods.
pub struct NfasGroup {
    group_id: u32,
    config: NfasConfig,
    members: Vec<Member>,
    state: GroupState,
    active: Option<SpanId>,
    /// The span that was active when the current switchover began.
    last_active: Option<SpanId>,
    /// Candidate currently establishing during start/switchover.
    establishing: Option<SpanId>,
    switch_reason: SwitchReason,
    switch_rounds: u32,
    heartbeat_failures: u32,
    replay: VecDeque<Bytes>,
    dropped: usize,
    timers: TimerWheel<NfasTimer>,
    stats: NfasStats,
    event_tx: NfasEventSender,
}

impl NfasGroup {
    pub fn new(
        group_id: u32,
        config: NfasConfig,
        members: Vec<SpanMember>,
        event_tx: NfasEventSender,
    ) -> Self {
        NfasGroup {
            group_id,
            config,
            members: members
                .into_iter()
                .map(|handle| Member {
                    handle,
                    state: MemberState::Down,
                })
                .collect(),
            state: GroupState::Inactive,
            active: None,
            last_active: None,
            establishing: None,
            switch_reason: SwitchReason::Forced,
            switch_rounds: 0,
            heartbeat_failures: 0,
            replay: VecDeque::new(),
            dropped: 0,
            timers: TimerWheel::new(),
            stats: NfasStats::default(),
            event_tx,
        }
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn active_span(&self) -> Option<SpanId> {
        self.active
    }

    pub fn stats(&self) -> NfasStats {
        self.stats.clone()
    }

    pub fn note_call_handled(&mut self) {
        self.stats.calls_handled += 1;
    }

    /// Bring the group up on the primary span.
    pub fn start(&mut self) -> Result<()> {
        if self.members.is_empty() {
            return Err(Error::NfasError(
                "group has no spans".to_string(),
                self.group_id,
            ));
        }
        let primary = self.members[0].handle.span_id;
        info!(group = self.group_id, primary, "starting NFAS group");
        self.establish_candidate(primary);
        Ok(())
    }

    /// Operator-requested switchover, optionally to a named span.
    pub fn force_switchover(&mut self, target: Option<SpanId>) {
        if self.state == GroupState::Switching {
            return;
        }
        if let Some(active) = self.active {
            if Some(active) == target {
                return;
            }
        }
        if let Some(target) = target {
            // Fail everything except the requested span so iteration
            // lands on it.
            for member in &mut self.members {
                if member.handle.span_id != target {
                    member.state = MemberState::Failed;
                }
            }
        }
        self.begin_switchover(SwitchReason::Forced);
    }

    /// Queue or transmit an encoded Q.931 message on the logical D-channel.
    pub fn send(&mut self, payload: Bytes) {
        match self.state {
            GroupState::Active => {
                if let Some(active) = self.active {
                    self.dispatch(active, LapdCommand::Transmit(payload));
                }
            }
            GroupState::Switching | GroupState::Inactive => {
                if self.replay.len() >= self.config.replay_queue_depth {
                    self.replay.pop_front();
                    self.dropped += 1;
                    self.emit(NfasEvent::QueueOverflow {
                        dropped: self.dropped,
                    });
                }
                self.replay.push_back(payload);
            }
        }
    }

    pub fn on_engine_event(&mut self, span: SpanId, event: LapdEvent) {
        match event {
            LapdEvent::Established => self.on_member_established(span),
            LapdEvent::Data(payload) => {
                if self.active == Some(span) {
                    self.emit(NfasEvent::Data(payload));
                } else {
                    debug!(group = self.group_id, span, "data from non-active span dropped");
                }
            }
            LapdEvent::Released => self.on_member_failed(span, SwitchReason::LinkReleased),
            LapdEvent::Error(kind) => {
                let reason = match kind {
                    LapdErrorKind::EstablishmentFailed => SwitchReason::LinkError,
                    LapdErrorKind::LinkLost | LapdErrorKind::PeerRejected => {
                        SwitchReason::LinkError
                    }
                };
                self.on_member_failed(span, reason);
            }
            LapdEvent::Management(_) => {}
        }
    }

    pub fn poll_timers(&mut self, now: Instant) {
        for timer in self.timers.expire(now) {
            match timer {
                NfasTimer::Heartbeat => self.on_heartbeat(),
                NfasTimer::Watchdog => self.on_watchdog(),
            }
        }
    }

    // -- member transitions ----------------------------------------------

    fn on_member_established(&mut self, span: SpanId) {
        self.set_member_state(span, MemberState::Established);
        if self.establishing != Some(span) {
            debug!(group = self.group_id, span, "backup span established");
            return;
        }
        self.establishing = None;
        self.timers = TimerWheel::new();
        let previous = self.active.take().or_else(|| self.last_active.take());
        self.active = Some(span);
        self.switch_rounds = 0;
        self.heartbeat_failures = 0;

        match previous {
            Some(from) if from != span => {
                self.stats.switchover_count += 1;
                self.stats.last_switchover = Some(Utc::now());
                info!(group = self.group_id, from, to = span, "switchover complete");
                self.set_state(GroupState::Active);
                self.emit(NfasEvent::SwitchoverCompleted {
                    from,
                    to: span,
                    reason: self.switch_reason,
                });
            }
            _ => {
                info!(group = self.group_id, span, "group active");
                self.set_state(GroupState::Active);
                self.emit(NfasEvent::GroupActive { span });
            }
        }
        self.flush_replay(span);
        self.schedule_heartbeat();
    }

    fn on_member_failed(&mut self, span: SpanId, reason: SwitchReason) {
        self.set_member_state(span, MemberState::Failed);
        let was_active = self.active == Some(span);
        let was_candidate = self.establishing == Some(span);
        if !was_active && !was_candidate {
            debug!(group = self.group_id, span, "backup span failed");
            return;
        }
        warn!(group = self.group_id, span, %reason, "active span failed");
        if was_candidate && self.state == GroupState::Switching {
            // The candidate died before establishing: move on directly.
            self.establishing = None;
            self.try_next_candidate();
            return;
        }
        self.begin_switchover(reason);
    }

    // -- switchover ------------------------------------------------------

    fn begin_switchover(&mut self, reason: SwitchReason) {
        if self.state == GroupState::Switching {
            return;
        }
        if let Some(active) = self.active.take() {
            self.last_active = Some(active);
            self.set_member_state(active, MemberState::Failed);
            self.dispatch(active, LapdCommand::Stop);
        }
        self.switch_reason = reason;
        self.switch_rounds = 0;
        self.set_state(GroupState::Switching);
        self.try_next_candidate();
    }

    /// Walk the configured span order for a live candidate; a full round
    /// with none resets the failure marks until the attempt limit is hit.
    fn try_next_candidate(&mut self) {
        loop {
            let candidate = self
                .members
                .iter()
                .find(|m| m.state != MemberState::Failed)
                .map(|m| m.handle.span_id);

            match candidate {
                Some(span) => {
                    self.establish_candidate(span);
                    return;
                }
                None => {
                    self.switch_rounds += 1;
                    if self.switch_rounds >= self.config.max_switchover_attempts {
                        warn!(group = self.group_id, "all spans failed, group inactive");
                        self.set_state(GroupState::Inactive);
                        self.establishing = None;
                        self.emit(NfasEvent::GroupInactive {
                            reason: self.switch_reason,
                        });
                        return;
                    }
                    debug!(
                        group = self.group_id,
                        round = self.switch_rounds,
                        "retrying all spans"
                    );
                    for member in &mut self.members {
                        member.state = MemberState::Down;
                    }
                }
            }
        }
    }

    fn establish_candidate(&mut self, span: SpanId) {
        debug!(group = self.group_id, span, "establishing candidate span");
        self.set_member_state(span, MemberState::Establishing);
        self.establishing = Some(span);
        self.dispatch(span, LapdCommand::Start);
        self.timers.schedule(
            Duration::from_millis(self.config.switchover_timeout_ms),
            NfasTimer::Watchdog,
        );
    }

    fn on_watchdog(&mut self) {
        let candidate = match self.establishing.take() {
            Some(span) => span,
            None => return,
        };
        warn!(group = self.group_id, span = candidate, "candidate failed to establish");
        self.set_member_state(candidate, MemberState::Failed);
        self.dispatch(candidate, LapdCommand::Stop);
        if self.state == GroupState::Inactive {
            // Initial start: treat like a switchover round so backups get
            // their chance.
            self.set_state(GroupState::Switching);
            self.switch_reason = SwitchReason::LinkError;
        }
        self.try_next_candidate();
    }

    // -- heartbeat -------------------------------------------------------

    fn on_heartbeat(&mut self) {
        if self.state != GroupState::Active {
            return;
        }
        let active = match self.active {
            Some(span) => span,
            None => return,
        };
        let healthy = self
            .members
            .iter()
            .any(|m| m.handle.span_id == active && m.state == MemberState::Established);

        if healthy {
            self.stats.heartbeats_sent += 1;
            self.heartbeat_failures = 0;
            match self.config.heartbeat_mode {
                HeartbeatMode::LinkPoll => self.dispatch(active, LapdCommand::Poll),
                HeartbeatMode::StatusEnquiry => {
                    let enquiry =
                        Q931Message::new(CallRef::dummy(), MessageType::StatusEnquiry).encode();
                    self.dispatch(active, LapdCommand::Transmit(enquiry));
                }
            }
            self.schedule_heartbeat();
        } else {
            self.stats.heartbeats_lost += 1;
            self.heartbeat_failures += 1;
            warn!(
                group = self.group_id,
                failures = self.heartbeat_failures,
                "heartbeat dispatch failed"
            );
            if self.heartbeat_failures >= self.config.heartbeat_loss_threshold {
                self.begin_switchover(SwitchReason::HeartbeatLoss);
            } else {
                self.schedule_heartbeat();
            }
        }
    }

    fn schedule_heartbeat(&mut self) {
        self.timers.schedule(
            Duration::from_millis(self.config.heartbeat_interval_ms),
            NfasTimer::Heartbeat,
        );
    }

    // -- plumbing --------------------------------------------------------

    fn flush_replay(&mut self, span: SpanId) {
        if self.replay.is_empty() {
            return;
        }
        info!(
            group = self.group_id,
            span,
            queued = self.replay.len(),
            "replaying queued messages"
        );
        while let Some(payload) = self.replay.pop_front() {
            self.dispatch(span, LapdCommand::Transmit(payload));
        }
        self.dropped = 0;
    }

    fn dispatch(&self, span: SpanId, command: LapdCommand) {
        if let Some(member) = self.members.iter().find(|m| m.handle.span_id == span) {
            if member
                .handle
                .input_tx
                .send(LapdInput::Command(command))
                .is_err()
            {
                warn!(group = self.group_id, span, "engine input channel closed");
            }
        }
    }

    fn set_member_state(&mut self, span: SpanId, state: MemberState) {
        if let Some(member) = self.members.iter_mut().find(|m| m.handle.span_id == span) {
            member.state = state;
        }
    }

    fn set_state(&mut self, state: GroupState) {
        if self.state != state {
            debug!(group = self.group_id, "group {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn emit(&self, event: NfasEvent) {
        if self.event_tx.send(event).is_err() {
            debug!(group = self.group_id, "event receiver gone");
        }
    }
}

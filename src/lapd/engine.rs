use super::{
    seq_in_window, seq_inc, seq_sub, LapdCommand, LapdConfig, LapdErrorKind, LapdEvent,
    LapdEventSender, LapdInput, LapdInputReceiver, LapdState, LapdTimer,
};
use crate::frame::{
    Address, Control, Frame, SupervisoryKind, UnnumberedKind, SAPI_TEI_MANAGEMENT,
};
use crate::tdm::SpanId;
use crate::timer::{TimerId, TimerWheel};
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const TIMER_INTERVAL: Duration = Duration::from_millis(20);

/// One data-link endpoint on one D-channel.
///
/// The engine is a single-task entity: frames, commands and timer firings
/// all arrive on one queue and are handled in order. Encoded frames leave
/// through `wire_tx` toward the TDM link; protocol events leave through
/// `event_tx` toward the owner.
pub struct LapdEngine {
    pub span_id: SpanId,
    pub(crate) config: LapdConfig,
    pub(crate) state: LapdState,

    v_s: u8,
    v_r: u8,
    v_a: u8,
    retry: u8,
    peer_busy: bool,

    /// Unacknowledged I-frames, exactly the sequence numbers [V(A), V(S)).
    retransmit_queue: VecDeque<(u8, Bytes)>,
    /// Payloads held back by the transmit window or a down link.
    pending: VecDeque<Bytes>,

    timers: TimerWheel<LapdTimer>,
    t200_id: Option<TimerId>,
    t203_id: Option<TimerId>,

    wire_tx: UnboundedSender<Bytes>,
    event_tx: LapdEventSender,
}

impl LapdEngine {
    pub fn new(
        span_id: SpanId,
        config: LapdConfig,
        wire_tx: UnboundedSender<Bytes>,
        event_tx: LapdEventSender,
    ) -> Self {
        LapdEngine {
            span_id,
            config,
            state: LapdState::Down,
            v_s: 0,
            v_r: 0,
            v_a: 0,
            retry: 0,
            peer_busy: false,
            retransmit_queue: VecDeque::new(),
            pending: VecDeque::new(),
            timers: TimerWheel::new(),
            t200_id: None,
            t203_id: None,
            wire_tx,
            event_tx,
        }
    }

    pub fn state(&self) -> LapdState {
        self.state
    }

    /// Outstanding (sent, unacknowledged) I-frame count.
    pub fn outstanding(&self) -> u8 {
        seq_sub(self.v_s, self.v_a)
    }

    #[cfg(test)]
    pub(crate) fn sequence_vars(&self) -> (u8, u8, u8) {
        (self.v_s, self.v_r, self.v_a)
    }

    #[cfg(test)]
    pub(crate) fn retransmit_sequence_numbers(&self) -> Vec<u8> {
        self.retransmit_queue.iter().map(|(ns, _)| *ns).collect()
    }

    pub async fn run(mut self, mut input_rx: LapdInputReceiver, cancel_token: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!(span = self.span_id, "engine cancelled");
                    break;
                }
                input = input_rx.recv() => {
                    match input {
                        Some(input) => self.handle_input(input),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(TIMER_INTERVAL) => {
                    for timer in self.timers.expire(Instant::now()) {
                        self.on_timer(timer);
                    }
                }
            }
        }
    }

    pub fn handle_input(&mut self, input: LapdInput) {
        match input {
            LapdInput::Wire(octets) => self.on_wire(&octets),
            LapdInput::Command(command) => self.on_command(command),
            LapdInput::Timer(timer) => self.on_timer(timer),
        }
    }

    pub fn on_command(&mut self, command: LapdCommand) {
        match command {
            LapdCommand::Start => self.start(),
            LapdCommand::Stop => self.stop(),
            LapdCommand::Transmit(payload) => self.transmit(payload),
            LapdCommand::Poll => self.poll_peer(),
        }
    }

    fn start(&mut self) {
        match self.state {
            LapdState::Down => {
                self.retry = 0;
                self.send_unnumbered(UnnumberedKind::Sabme, true, true);
                self.restart_t200();
                self.transition(LapdState::AwaitingEstablishment);
            }
            _ => debug!(span = self.span_id, state = %self.state, "start ignored"),
        }
    }

    fn stop(&mut self) {
        match self.state {
            LapdState::Established | LapdState::AwaitingEstablishment => {
                self.retry = 0;
                self.send_unnumbered(UnnumberedKind::Disc, true, true);
                self.restart_t200();
                self.cancel_t203();
                self.transition(LapdState::Releasing);
            }
            LapdState::Down | LapdState::Releasing => {}
        }
    }

    fn transmit(&mut self, payload: Bytes) {
        if self.state != LapdState::Established
            || self.peer_busy
            || self.outstanding() >= self.config.window
        {
            self.pending.push_back(payload);
            return;
        }
        self.send_i_frame(payload);
    }

    fn poll_peer(&mut self) {
        if self.state == LapdState::Established {
            self.send_supervisory(SupervisoryKind::Rr, true, true);
        }
    }

    pub fn on_wire(&mut self, octets: &[u8]) {
        let frame = match Frame::decode(octets) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(span = self.span_id, "dropping frame: {}", e);
                return;
            }
        };

        if frame.address.sapi == SAPI_TEI_MANAGEMENT {
            self.emit(LapdEvent::Management(frame));
            return;
        }
        if frame.address.sapi != self.config.sapi || frame.address.tei != self.config.tei {
            trace!(
                span = self.span_id,
                sapi = frame.address.sapi,
                tei = frame.address.tei,
                "frame for another endpoint"
            );
            return;
        }

        // The peer's command bit is the inverse of ours.
        let is_command = frame.address.command != self.config.network_side;
        match frame.control {
            Control::Unnumbered { kind, pf } => self.on_unnumbered(kind, pf),
            Control::Supervisory { kind, nr, pf } => self.on_supervisory(kind, nr, pf, is_command),
            Control::Info { ns, nr, poll } => self.on_info(frame.info, ns, nr, poll),
        }
    }

    fn on_unnumbered(&mut self, kind: UnnumberedKind, pf: bool) {
        match (self.state, kind) {
            (LapdState::AwaitingEstablishment, UnnumberedKind::Ua) => {
                self.cancel_t200();
                self.reset_sequencing();
                self.restart_t203();
                self.transition(LapdState::Established);
                self.emit(LapdEvent::Established);
                self.flush_pending();
            }
            (LapdState::AwaitingEstablishment, UnnumberedKind::Dm) => {
                self.retry += 1;
                if self.retry >= self.config.n200 {
                    self.link_failed(LapdErrorKind::EstablishmentFailed);
                } else {
                    self.send_unnumbered(UnnumberedKind::Sabme, true, true);
                    self.restart_t200();
                }
            }
            // Crossed SABMEs: both sides answer UA and come up.
            (LapdState::AwaitingEstablishment, UnnumberedKind::Sabme) => {
                self.send_unnumbered(UnnumberedKind::Ua, false, pf);
                self.cancel_t200();
                self.reset_sequencing();
                self.restart_t203();
                self.transition(LapdState::Established);
                self.emit(LapdEvent::Established);
                self.flush_pending();
            }
            (LapdState::Down, UnnumberedKind::Sabme) => {
                self.send_unnumbered(UnnumberedKind::Ua, false, pf);
                self.reset_sequencing();
                self.restart_t203();
                self.transition(LapdState::Established);
                self.emit(LapdEvent::Established);
            }
            (LapdState::Established, UnnumberedKind::Sabme) => {
                debug!(span = self.span_id, "peer re-established link");
                self.send_unnumbered(UnnumberedKind::Ua, false, pf);
                self.reset_sequencing();
                self.cancel_t200();
                self.restart_t203();
            }
            (LapdState::Established, UnnumberedKind::Disc) => {
                self.send_unnumbered(UnnumberedKind::Ua, false, pf);
                self.link_down();
                self.emit(LapdEvent::Released);
            }
            (LapdState::Established, UnnumberedKind::Frmr) => {
                self.link_failed(LapdErrorKind::PeerRejected);
            }
            (LapdState::Established, UnnumberedKind::Dm) => {
                self.link_failed(LapdErrorKind::LinkLost);
            }
            (LapdState::Releasing, UnnumberedKind::Ua | UnnumberedKind::Dm) => {
                self.link_down();
                self.emit(LapdEvent::Released);
            }
            (LapdState::Down, UnnumberedKind::Disc) => {
                self.send_unnumbered(UnnumberedKind::Dm, false, pf);
            }
            _ => trace!(
                span = self.span_id,
                state = %self.state,
                "ignoring {:?}", kind
            ),
        }
    }

    fn on_supervisory(&mut self, kind: SupervisoryKind, nr: u8, pf: bool, is_command: bool) {
        if self.state != LapdState::Established {
            return;
        }
        match kind {
            SupervisoryKind::Rr => {
                self.peer_busy = false;
                self.update_ack(nr);
                if is_command && pf {
                    self.send_supervisory(SupervisoryKind::Rr, false, true);
                }
                self.flush_pending();
            }
            SupervisoryKind::Rnr => {
                self.peer_busy = true;
                self.update_ack(nr);
            }
            SupervisoryKind::Rej => {
                self.peer_busy = false;
                self.update_ack(nr);
                self.retransmit_from(nr);
            }
        }
    }

    fn on_info(&mut self, payload: Bytes, ns: u8, nr: u8, poll: bool) {
        if self.state != LapdState::Established {
            return;
        }
        self.update_ack(nr);

        if ns == self.v_r {
            self.v_r = seq_inc(self.v_r);
            self.emit(LapdEvent::Data(payload));
            self.send_supervisory(SupervisoryKind::Rr, false, poll);
        } else {
            trace!(
                span = self.span_id,
                ns,
                expected = self.v_r,
                "out-of-sequence I-frame"
            );
            self.send_supervisory(SupervisoryKind::Rej, false, poll);
        }
    }

    pub fn on_timer(&mut self, timer: LapdTimer) {
        match timer {
            LapdTimer::T200 => self.on_t200_expiry(),
            LapdTimer::T203 => self.on_t203_expiry(),
        }
    }

    fn on_t200_expiry(&mut self) {
        self.t200_id = None;
        match self.state {
            LapdState::AwaitingEstablishment => {
                self.retry += 1;
                if self.retry >= self.config.n200 {
                    self.link_failed(LapdErrorKind::EstablishmentFailed);
                } else {
                    self.send_unnumbered(UnnumberedKind::Sabme, true, true);
                    self.restart_t200();
                }
            }
            LapdState::Releasing => {
                self.retry += 1;
                if self.retry >= self.config.n200 {
                    self.link_down();
                    self.emit(LapdEvent::Released);
                } else {
                    self.send_unnumbered(UnnumberedKind::Disc, true, true);
                    self.restart_t200();
                }
            }
            LapdState::Established => {
                if self.retransmit_queue.is_empty() {
                    return;
                }
                self.retry += 1;
                if self.retry >= self.config.n200 {
                    self.link_failed(LapdErrorKind::LinkLost);
                    return;
                }
                if let Some((ns, payload)) = self.retransmit_queue.front().cloned() {
                    debug!(span = self.span_id, ns, retry = self.retry, "T200 retransmit");
                    self.send_raw_i_frame(ns, payload, true);
                }
                self.restart_t200();
            }
            LapdState::Down => {}
        }
    }

    fn on_t203_expiry(&mut self) {
        self.t203_id = None;
        if self.state == LapdState::Established {
            self.send_supervisory(SupervisoryKind::Rr, true, true);
            self.restart_t203();
        }
    }

    /// Process an acknowledgement N(R), releasing acked I-frames.
    fn update_ack(&mut self, nr: u8) {
        if seq_sub(nr, self.v_a) > seq_sub(self.v_s, self.v_a) {
            warn!(
                span = self.span_id,
                nr,
                va = self.v_a,
                vs = self.v_s,
                "N(R) outside ack window, ignored"
            );
            return;
        }
        if nr == self.v_a {
            return;
        }
        while let Some((ns, _)) = self.retransmit_queue.front() {
            if seq_in_window(*ns, self.v_a, nr) {
                self.retransmit_queue.pop_front();
            } else {
                break;
            }
        }
        self.v_a = nr;
        self.retry = 0;
        if self.v_a == self.v_s {
            self.cancel_t200();
            self.restart_t203();
        } else {
            self.restart_t200();
        }
    }

    fn retransmit_from(&mut self, nr: u8) {
        let to_resend: Vec<(u8, Bytes)> = self
            .retransmit_queue
            .iter()
            .filter(|(ns, _)| seq_in_window(*ns, nr, self.v_s))
            .cloned()
            .collect();
        for (ns, payload) in to_resend {
            self.send_raw_i_frame(ns, payload, false);
        }
        if !self.retransmit_queue.is_empty() {
            self.restart_t200();
        }
    }

    fn flush_pending(&mut self) {
        while self.state == LapdState::Established
            && !self.peer_busy
            && self.outstanding() < self.config.window
        {
            match self.pending.pop_front() {
                Some(payload) => self.send_i_frame(payload),
                None => break,
            }
        }
    }

    fn send_i_frame(&mut self, payload: Bytes) {
        let ns = self.v_s;
        self.v_s = seq_inc(self.v_s);
        self.retransmit_queue.push_back((ns, payload.clone()));
        self.send_raw_i_frame(ns, payload, false);
        if self.t200_id.is_none() {
            self.restart_t200();
        }
        self.cancel_t203();
    }

    fn send_raw_i_frame(&mut self, ns: u8, payload: Bytes, poll: bool) {
        let frame = Frame::with_info(
            self.address(true),
            Control::Info {
                ns,
                nr: self.v_r,
                poll,
            },
            payload,
        );
        self.send_frame(&frame);
    }

    fn send_supervisory(&mut self, kind: SupervisoryKind, command: bool, pf: bool) {
        let frame = Frame::new(
            self.address(command),
            Control::Supervisory {
                kind,
                nr: self.v_r,
                pf,
            },
        );
        self.send_frame(&frame);
    }

    fn send_unnumbered(&mut self, kind: UnnumberedKind, command: bool, pf: bool) {
        let frame = Frame::new(self.address(command), Control::Unnumbered { kind, pf });
        self.send_frame(&frame);
    }

    fn address(&self, command: bool) -> Address {
        // C/R bit: network side commands carry 1, user side commands 0.
        let bit = if command {
            self.config.network_side
        } else {
            !self.config.network_side
        };
        Address::new(self.config.sapi, bit, self.config.tei)
    }

    fn send_frame(&mut self, frame: &Frame) {
        match frame.encode() {
            Ok(octets) => {
                trace!(span = self.span_id, len = octets.len(), "tx frame");
                if self.wire_tx.send(octets).is_err() {
                    debug!(span = self.span_id, "wire sink closed");
                }
            }
            Err(e) => warn!(span = self.span_id, "frame encode failed: {}", e),
        }
    }

    fn reset_sequencing(&mut self) {
        self.v_s = 0;
        self.v_r = 0;
        self.v_a = 0;
        self.retry = 0;
        self.peer_busy = false;
        self.retransmit_queue.clear();
    }

    fn link_failed(&mut self, kind: LapdErrorKind) {
        self.link_down();
        self.emit(LapdEvent::Error(kind));
    }

    fn link_down(&mut self) {
        self.cancel_t200();
        self.cancel_t203();
        self.retransmit_queue.clear();
        self.transition(LapdState::Down);
    }

    fn transition(&mut self, state: LapdState) {
        if self.state != state {
            debug!(span = self.span_id, "link {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn emit(&mut self, event: LapdEvent) {
        if self.event_tx.send(event).is_err() {
            debug!(span = self.span_id, "event receiver gone");
        }
    }

    fn restart_t200(&mut self) {
        if let Some(id) = self.t200_id.take() {
            self.timers.cancel(id);
        }
        self.t200_id = Some(self.timers.schedule(self.config.t200, LapdTimer::T200));
    }

    fn cancel_t200(&mut self) {
        if let Some(id) = self.t200_id.take() {
            self.timers.cancel(id);
        }
    }

    fn restart_t203(&mut self) {
        if let Some(id) = self.t203_id.take() {
            self.timers.cancel(id);
        }
        self.t203_id = Some(self.timers.schedule(self.config.t203, LapdTimer::T203));
    }

    fn cancel_t203(&mut self) {
        if let Some(id) = self.t203_id.take() {
            self.timers.cancel(id);
        }
    }
}

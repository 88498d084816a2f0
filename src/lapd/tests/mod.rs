use super::engine::LapdEngine;
use super::{LapdConfig, LapdEvent, LapdEventReceiver};
use crate::frame::{Address, Control, Frame, UnnumberedKind};
use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

mod test_engine;

/// Engine under test plus the wire and event drains.
pub(super) struct TestLink {
    pub engine: LapdEngine,
    pub wire_rx: UnboundedReceiver<Bytes>,
    pub event_rx: LapdEventReceiver,
}

pub(super) fn create_test_engine() -> TestLink {
    let (wire_tx, wire_rx) = unbounded_channel();
    let (event_tx, event_rx) = unbounded_channel();
    let engine = LapdEngine::new(1, LapdConfig::default(), wire_tx, event_tx);
    TestLink {
        engine,
        wire_rx,
        event_rx,
    }
}

impl TestLink {
    /// Feed a frame as the peer (the network side of a user-side engine).
    pub fn feed(&mut self, control: Control) {
        self.feed_frame(Frame::new(peer_address(control_is_command(&control)), control));
    }

    pub fn feed_frame(&mut self, frame: Frame) {
        let octets = frame.encode().unwrap();
        self.engine.on_wire(&octets);
    }

    pub fn feed_info(&mut self, ns: u8, nr: u8, payload: &[u8]) {
        let frame = Frame::with_info(
            peer_address(true),
            Control::Info {
                ns,
                nr,
                poll: false,
            },
            Bytes::copy_from_slice(payload),
        );
        self.feed_frame(frame);
    }

    /// Next frame the engine put on the wire.
    pub fn sent(&mut self) -> Option<Frame> {
        self.wire_rx
            .try_recv()
            .ok()
            .map(|octets| Frame::decode(&octets).unwrap())
    }

    pub fn drain_sent(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.sent() {
            frames.push(frame);
        }
        frames
    }

    pub fn event(&mut self) -> Option<LapdEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn drain_events(&mut self) -> Vec<LapdEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.event() {
            events.push(event);
        }
        events
    }

    /// Drive the engine through SABME/UA establishment and clear the drains.
    pub fn establish(&mut self) {
        self.engine.on_command(super::LapdCommand::Start);
        self.feed(Control::Unnumbered {
            kind: UnnumberedKind::Ua,
            pf: true,
        });
        assert_eq!(self.engine.state(), super::LapdState::Established);
        self.drain_sent();
        self.drain_events();
    }
}

/// Peer is the network side: its commands carry C/R=1, responses C/R=0.
fn peer_address(command: bool) -> Address {
    Address::new(0, command, 0)
}

fn control_is_command(control: &Control) -> bool {
    // UA/DM are responses; everything else we feed as a command.
    !matches!(
        control,
        Control::Unnumbered {
            kind: UnnumberedKind::Ua | UnnumberedKind::Dm | UnnumberedKind::Frmr,
            ..
        }
    )
}

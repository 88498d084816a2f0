use super::group::NfasGroup;
use super::{NfasEvent, NfasEventReceiver, SpanMember};
use crate::config::NfasConfig;
use crate::lapd::{LapdCommand, LapdInput};
use crate::tdm::SpanId;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

mod test_group;

pub(super) struct TestGroup {
    pub group: NfasGroup,
    pub event_rx: NfasEventReceiver,
    pub inputs: Vec<(SpanId, UnboundedReceiver<LapdInput>)>,
}

pub(super) fn create_test_group(spans: &[SpanId], config: NfasConfig) -> TestGroup {
    let (event_tx, event_rx) = unbounded_channel();
    let mut members = Vec::new();
    let mut inputs = Vec::new();
    for &span_id in spans {
        let (input_tx, input_rx) = unbounded_channel();
        members.push(SpanMember { span_id, input_tx });
        inputs.push((span_id, input_rx));
    }
    TestGroup {
        group: NfasGroup::new(1, config, members, event_tx),
        event_rx,
        inputs,
    }
}

impl TestGroup {
    pub fn event(&mut self) -> Option<NfasEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn drain_events(&mut self) -> Vec<NfasEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.event() {
            events.push(event);
        }
        events
    }

    /// Commands delivered to the given span's engine.
    pub fn commands(&mut self, span: SpanId) -> Vec<LapdCommand> {
        let rx = self
            .inputs
            .iter_mut()
            .find(|(id, _)| *id == span)
            .map(|(_, rx)| rx)
            .expect("unknown span");
        let mut commands = Vec::new();
        while let Ok(input) = rx.try_recv() {
            if let LapdInput::Command(command) = input {
                commands.push(command);
            }
        }
        commands
    }
}

use super::control::CallControl;
use super::{CallEvent, CallEventReceiver, Q931Receiver};
use crate::config::Variant;
use crate::q931::{ie::Ie, ie::PartyNumber, CallRef, MessageType, Q931Message};
use tokio::sync::mpsc::unbounded_channel;


pub(super) struct TestEndpoint {
    pub control: CallControl,
    pub q931_rx: Q931Receiver,
    pub event_rx: CallEventReceiver,
}

pub(super) fn create_test_endpoint() -> TestEndpoint {
    let (q931_tx, q931_rx) = unbounded_channel();
    let (event_tx, event_rx) = unbounded_channel();
    let control = CallControl::new("span-1".to_string(), Variant::Itu, q931_tx, event_tx);
    TestEndpoint {
        control,
        q931_rx,
        event_rx,
    }
}

impl TestEndpoint {
    pub fn sent(&mut self) -> Option<Q931Message> {
        self.q931_rx.try_recv().ok()
    }

    pub fn drain_sent(&mut self) -> Vec<Q931Message> {
        let mut msgs = Vec::new();
        while let Some(msg) = self.sent() {
            msgs.push(msg);
        }
        msgs
    }

    pub fn event(&mut self) -> Option<CallEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.event() {
            events.push(event);
        }
        events
    }
}

/// An en-bloc SETUP as the network peer would send it.
pub(super) fn inbound_setup(value: u16, calling: &str, called: &str) -> Q931Message {
    Q931Message::new(CallRef::new(value), MessageType::Setup)
        .with_ie(Ie::bearer_capability_speech(Variant::Itu))
        .with_ie(Ie::channel_id(1))
        .with_ie(Ie::calling_party_number(&PartyNumber::national(calling)))
        .with_ie(Ie::called_party_number(&PartyNumber::national(called)))
        .with_ie(Ie::sending_complete())
}

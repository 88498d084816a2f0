//! End-to-end gateway tests over an in-memory TDM link.
//!
//! The test plays the network side of the D-channel by hand: it answers
//! SABME with UA, exchanges I-frames, and checks what comes out on the SIP
//! side.

use std::time::Duration;

use bytes::Bytes;
use tdmgate::config::GatewayConfig;
use tdmgate::frame::{Address, Control, Frame, SupervisoryKind, UnnumberedKind};
use tdmgate::q931::{ie::Ie, ie::PartyNumber, CallRef, MessageType, Q931Message};
use tdmgate::tdm::{ChannelLink, TdmConnection, TdmEvent, TdmEventReceiver};
use tdmgate::GatewayBuilder;
use tokio::spawn;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const D_CHANNEL: u16 = 16;

/// The network-side half of one established LAPD link.
struct PeerLink {
    link: ChannelLink,
    events: TdmEventReceiver,
    v_s: u8,
    v_r: u8,
}

impl PeerLink {
    async fn recv_frame(&mut self) -> Frame {
        loop {
            let event = timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for TDM frame")
                .expect("TDM link closed");
            if let TdmEvent::Frame { channel, payload } = event {
                assert_eq!(channel, D_CHANNEL);
                return Frame::decode(&payload).expect("well-formed LAPD frame");
            }
        }
    }

    async fn send_frame(&self, frame: Frame) {
        self.link
            .send(D_CHANNEL, frame.encode().unwrap())
            .await
            .unwrap();
    }

    /// Network side: commands carry C/R=1.
    fn address(command: bool) -> Address {
        Address::new(0, command, 0)
    }

    /// Wait for SABME and answer UA.
    async fn establish(&mut self) {
        loop {
            let frame = self.recv_frame().await;
            if let Control::Unnumbered {
                kind: UnnumberedKind::Sabme,
                ..
            } = frame.control
            {
                self.send_frame(Frame::new(
                    Self::address(false),
                    Control::Unnumbered {
                        kind: UnnumberedKind::Ua,
                        pf: true,
                    },
                ))
                .await;
                return;
            }
        }
    }

    /// Send a Q.931 message in an I-frame and bump the sequence state.
    async fn send_q931(&mut self, msg: &Q931Message) {
        let frame = Frame::with_info(
            Self::address(true),
            Control::Info {
                ns: self.v_s,
                nr: self.v_r,
                poll: false,
            },
            msg.encode(),
        );
        self.v_s = (self.v_s + 1) % 128;
        self.send_frame(frame).await;
    }

    /// Wait for the next I-frame, acknowledge it, and decode the payload.
    async fn recv_q931(&mut self) -> Q931Message {
        loop {
            let frame = self.recv_frame().await;
            match frame.control {
                Control::Info { ns, .. } => {
                    self.v_r = (ns + 1) % 128;
                    self.send_frame(Frame::new(
                        Self::address(true),
                        Control::Supervisory {
                            kind: SupervisoryKind::Rr,
                            nr: self.v_r,
                            pf: false,
                        },
                    ))
                    .await;
                    return Q931Message::decode(&frame.info).expect("well-formed Q.931");
                }
                _ => continue,
            }
        }
    }

    /// Acknowledge messages until one of the given type arrives.
    async fn expect_q931(&mut self, expected: MessageType) -> Q931Message {
        loop {
            let msg = self.recv_q931().await;
            if msg.message_type == expected {
                return msg;
            }
        }
    }
}

struct TestGateway {
    peer: PeerLink,
    sip_out: tokio::sync::mpsc::UnboundedReceiver<rsip::SipMessage>,
    sip_in: tokio::sync::mpsc::UnboundedSender<rsip::SipMessage>,
    events: tokio::sync::mpsc::UnboundedReceiver<tdmgate::gateway::GatewayEvent>,
    cancel_token: CancellationToken,
}

async fn start_test_gateway() -> TestGateway {
    let (gw_link, peer_link) = ChannelLink::pair();
    let peer_events = peer_link.take_events().unwrap();

    let mut config = GatewayConfig::default();
    config.tdm.spans[0].d_channel = D_CHANNEL;
    config.sip.domain = "gw.test".to_string();

    let cancel_token = CancellationToken::new();
    let mut gateway = GatewayBuilder::new()
        .config(config)
        .tdm_connection(TdmConnection::Channel(gw_link))
        .cancel_token(cancel_token.clone())
        .build()
        .await
        .expect("gateway builds");

    let sip_out = gateway.take_sip_outgoing().unwrap();
    let sip_in = gateway.sip_ingress();
    let events = gateway.take_events().unwrap();
    spawn(async move {
        gateway.serve().await.ok();
    });

    TestGateway {
        peer: PeerLink {
            link: peer_link,
            events: peer_events,
            v_s: 0,
            v_r: 0,
        },
        sip_out,
        sip_in,
        events,
        cancel_token,
    }
}

async fn next_sip(tg: &mut TestGateway) -> rsip::SipMessage {
    timeout(Duration::from_secs(5), tg.sip_out.recv())
        .await
        .expect("timed out waiting for SIP message")
        .expect("SIP channel closed")
}

fn setup_message() -> Q931Message {
    Q931Message::new(CallRef::new(0x1234), MessageType::Setup)
        .with_ie(Ie::bearer_capability_speech(tdmgate::config::Variant::Itu))
        .with_ie(Ie::channel_id(1))
        .with_ie(Ie::calling_party_number(&PartyNumber::national("5551001")))
        .with_ie(Ie::called_party_number(&PartyNumber::national("5551002")))
        .with_ie(Ie::sending_complete())
}

#[tokio::test]
async fn test_link_establishment() {
    let mut tg = start_test_gateway().await;
    tg.peer.establish().await;
    tg.cancel_token.cancel();
}

#[tokio::test]
async fn test_inbound_pri_call_becomes_invite() {
    use rsip::prelude::{HeadersExt, ToTypedHeader};

    let mut tg = start_test_gateway().await;
    tg.peer.establish().await;

    tg.peer.send_q931(&setup_message()).await;

    let invite = match next_sip(&mut tg).await {
        rsip::SipMessage::Request(request) => request,
        other => panic!("expected INVITE, got {:?}", other),
    };
    assert_eq!(invite.method, rsip::Method::Invite);

    let from = invite.from_header().unwrap().typed().unwrap();
    assert_eq!(from.uri.auth.as_ref().unwrap().user, "5551001");
    let to = invite.to_header().unwrap().typed().unwrap();
    assert_eq!(to.uri.auth.as_ref().unwrap().user, "5551002");

    let sdp = String::from_utf8(invite.body.clone()).unwrap();
    assert!(sdp.contains("m=audio"), "INVITE carries an SDP offer");
    assert!(sdp.contains("RTP/AVP 8 0 101"), "G.711 + DTMF payloads");

    tg.cancel_token.cancel();
}

#[tokio::test]
async fn test_sip_answer_connects_tdm_call() {
    let mut tg = start_test_gateway().await;
    tg.peer.establish().await;
    tg.peer.send_q931(&setup_message()).await;

    let invite = match next_sip(&mut tg).await {
        rsip::SipMessage::Request(request) => request,
        other => panic!("expected INVITE, got {:?}", other),
    };

    // Far end rings, then answers.
    let ringing = rsip::Response {
        status_code: rsip::StatusCode::try_from(180).unwrap(),
        version: rsip::Version::V2,
        headers: invite.headers.clone(),
        body: vec![],
    };
    tg.sip_in
        .send(rsip::SipMessage::Response(ringing))
        .unwrap();
    tg.peer.expect_q931(MessageType::Alerting).await;

    let ok = rsip::Response {
        status_code: rsip::StatusCode::try_from(200).unwrap(),
        version: rsip::Version::V2,
        headers: invite.headers.clone(),
        body: vec![],
    };
    tg.sip_in.send(rsip::SipMessage::Response(ok)).unwrap();
    tg.peer.expect_q931(MessageType::Connect).await;

    tg.cancel_token.cancel();
}

#[tokio::test]
async fn test_sip_bye_clears_tdm_call_with_record() {
    use rsip::prelude::HeadersExt;

    let mut tg = start_test_gateway().await;
    tg.peer.establish().await;
    tg.peer.send_q931(&setup_message()).await;

    let invite = match next_sip(&mut tg).await {
        rsip::SipMessage::Request(request) => request,
        other => panic!("expected INVITE, got {:?}", other),
    };
    let call_id = invite.call_id_header().unwrap().to_string();

    // Answer, then hang up from the SIP side.
    let ok = rsip::Response {
        status_code: rsip::StatusCode::try_from(200).unwrap(),
        version: rsip::Version::V2,
        headers: invite.headers.clone(),
        body: vec![],
    };
    tg.sip_in.send(rsip::SipMessage::Response(ok)).unwrap();
    tg.peer.expect_q931(MessageType::Connect).await;
    tg.peer
        .send_q931(&Q931Message::new(
            CallRef {
                value: 0x1234,
                flag: true,
                len: 2,
            },
            MessageType::ConnectAck,
        ))
        .await;
    // Let the ACK propagate through the engine before hanging up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bye = rsip::Request {
        method: rsip::Method::Bye,
        uri: invite.uri.clone(),
        headers: invite.headers.clone(),
        version: rsip::Version::V2,
        body: vec![],
    };
    tg.sip_in.send(rsip::SipMessage::Request(bye)).unwrap();

    // The TDM side is cleared...
    tg.peer.expect_q931(MessageType::Disconnect).await;

    // ...the BYE is answered...
    let bye_ok = loop {
        match next_sip(&mut tg).await {
            rsip::SipMessage::Response(response) => break response,
            _ => continue,
        }
    };
    assert_eq!(bye_ok.status_code, rsip::StatusCode::try_from(200).unwrap());

    // ...and a usage record is emitted for the call.
    let record = loop {
        let event = timeout(Duration::from_secs(5), tg.events.recv())
            .await
            .expect("timed out waiting for gateway event")
            .expect("event channel closed");
        if let tdmgate::gateway::GatewayEvent::CallEnded(record) = event {
            break record;
        }
    };
    assert_eq!(record.sip_call_id, call_id);
    assert_eq!(record.calling.as_deref(), Some("5551001"));
    assert_eq!(record.called.as_deref(), Some("5551002"));
    assert!(record.answered_at.is_some());

    tg.cancel_token.cancel();
}

#[tokio::test]
async fn test_rejected_invite_releases_tdm_resources() {
    let mut tg = start_test_gateway().await;
    tg.peer.establish().await;
    tg.peer.send_q931(&setup_message()).await;

    let invite = match next_sip(&mut tg).await {
        rsip::SipMessage::Request(request) => request,
        other => panic!("expected INVITE, got {:?}", other),
    };

    // Busy here: the TDM call clears with cause 17.
    let busy = rsip::Response {
        status_code: rsip::StatusCode::try_from(486).unwrap(),
        version: rsip::Version::V2,
        headers: invite.headers.clone(),
        body: vec![],
    };
    tg.sip_in.send(rsip::SipMessage::Response(busy)).unwrap();

    let clearing = tg.peer.expect_q931(MessageType::Disconnect).await;
    assert_eq!(clearing.cause().unwrap().value, 17);

    tg.cancel_token.cancel();
}

#[tokio::test]
async fn test_frame_with_bad_fcs_is_ignored() {
    let mut tg = start_test_gateway().await;
    tg.peer.establish().await;

    // Corrupt octets on the D-channel must not take the link down.
    tg.peer
        .link
        .send(D_CHANNEL, Bytes::from_static(&[0x02, 0x01, 0x7F, 0x00, 0x00]))
        .await
        .unwrap();

    tg.peer.send_q931(&setup_message()).await;
    match next_sip(&mut tg).await {
        rsip::SipMessage::Request(request) => {
            assert_eq!(request.method, rsip::Method::Invite)
        }
        other => panic!("expected INVITE, got {:?}", other),
    }

    tg.cancel_token.cancel();
}

//! LAPD engine state machine tests: establishment, sequencing,
//! retransmission and window behaviour.

use super::create_test_engine;
use crate::frame::{Control, SupervisoryKind, UnnumberedKind};
use crate::lapd::{LapdCommand, LapdErrorKind, LapdEvent, LapdState, LapdTimer};
use bytes::Bytes;

#[test]
fn test_establishment_handshake() {
    let mut link = create_test_engine();

    link.engine.on_command(LapdCommand::Start);
    assert_eq!(link.engine.state(), LapdState::AwaitingEstablishment);
    let sabme = link.sent().expect("SABME on the wire");
    assert_eq!(
        sabme.control,
        Control::Unnumbered {
            kind: UnnumberedKind::Sabme,
            pf: true
        }
    );

    link.feed(Control::Unnumbered {
        kind: UnnumberedKind::Ua,
        pf: true,
    });
    assert_eq!(link.engine.state(), LapdState::Established);
    assert_eq!(link.event(), Some(LapdEvent::Established));
    assert_eq!(link.engine.sequence_vars(), (0, 0, 0));
}

#[test]
fn test_establishment_fails_after_n200_retries() {
    let mut link = create_test_engine();
    link.engine.on_command(LapdCommand::Start);
    link.drain_sent();

    // First two expiries retransmit SABME, the third gives up.
    link.engine.on_timer(LapdTimer::T200);
    link.engine.on_timer(LapdTimer::T200);
    assert_eq!(link.engine.state(), LapdState::AwaitingEstablishment);
    assert_eq!(link.drain_sent().len(), 2);

    link.engine.on_timer(LapdTimer::T200);
    assert_eq!(link.engine.state(), LapdState::Down);
    assert_eq!(
        link.event(),
        Some(LapdEvent::Error(LapdErrorKind::EstablishmentFailed))
    );
}

#[test]
fn test_in_sequence_delivery_and_ack() {
    let mut link = create_test_engine();
    link.establish();

    link.feed_info(0, 0, &[0x08, 0x01, 0x05]);
    assert_eq!(
        link.event(),
        Some(LapdEvent::Data(Bytes::from_static(&[0x08, 0x01, 0x05])))
    );
    let ack = link.sent().expect("RR acknowledgement");
    assert_eq!(
        ack.control,
        Control::Supervisory {
            kind: SupervisoryKind::Rr,
            nr: 1,
            pf: false
        }
    );
    assert_eq!(link.engine.sequence_vars(), (0, 1, 0));
}

#[test]
fn test_out_of_sequence_frame_draws_rej() {
    let mut link = create_test_engine();
    link.establish();

    link.feed_info(2, 0, b"skip");
    assert!(link.event().is_none(), "payload must not be delivered");
    let rej = link.sent().expect("REJ on the wire");
    assert_eq!(
        rej.control,
        Control::Supervisory {
            kind: SupervisoryKind::Rej,
            nr: 0,
            pf: false
        }
    );
}

#[test]
fn test_retransmit_queue_tracks_unacked_window() {
    let mut link = create_test_engine();
    link.establish();

    for i in 0..3u8 {
        link.engine
            .on_command(LapdCommand::Transmit(Bytes::from(vec![i])));
    }
    assert_eq!(link.engine.sequence_vars(), (3, 0, 0));
    assert_eq!(link.engine.retransmit_sequence_numbers(), vec![0, 1, 2]);
    link.drain_sent();

    // Peer acknowledges N(S)=0 and 1.
    link.feed(Control::Supervisory {
        kind: SupervisoryKind::Rr,
        nr: 2,
        pf: false,
    });
    assert_eq!(link.engine.sequence_vars(), (3, 0, 2));
    assert_eq!(link.engine.retransmit_sequence_numbers(), vec![2]);
}

#[test]
fn test_t200_retransmission_until_link_lost() {
    let mut link = create_test_engine();
    link.establish();

    for i in 0..3u8 {
        link.engine
            .on_command(LapdCommand::Transmit(Bytes::from(vec![i])));
    }
    link.feed(Control::Supervisory {
        kind: SupervisoryKind::Rr,
        nr: 2,
        pf: false,
    });
    link.drain_sent();

    // retry=0: the single unacked frame is retransmitted.
    link.engine.on_timer(LapdTimer::T200);
    let resent = link.sent().expect("retransmission");
    assert_eq!(
        resent.control,
        Control::Info {
            ns: 2,
            nr: 0,
            poll: true
        }
    );
    assert_eq!(resent.info, Bytes::from(vec![2u8]));

    link.engine.on_timer(LapdTimer::T200);
    assert_eq!(link.engine.state(), LapdState::Established);

    // Third consecutive expiry exhausts N200.
    link.engine.on_timer(LapdTimer::T200);
    assert_eq!(link.engine.state(), LapdState::Down);
    assert_eq!(
        link.drain_events(),
        vec![LapdEvent::Error(LapdErrorKind::LinkLost)]
    );
}

#[test]
fn test_transmit_window_blocks_at_k() {
    let mut link = create_test_engine();
    link.establish();

    for i in 0..9u8 {
        link.engine
            .on_command(LapdCommand::Transmit(Bytes::from(vec![i])));
    }
    // k=7: two payloads are held back.
    assert_eq!(link.engine.outstanding(), 7);
    assert_eq!(link.drain_sent().len(), 7);

    link.feed(Control::Supervisory {
        kind: SupervisoryKind::Rr,
        nr: 2,
        pf: false,
    });
    // Acknowledging two frames releases the two pending payloads.
    assert_eq!(link.engine.outstanding(), 7);
    let flushed = link.drain_sent();
    assert_eq!(flushed.len(), 2);
    assert_eq!(
        flushed[0].control,
        Control::Info {
            ns: 7,
            nr: 0,
            poll: false
        }
    );
}

#[test]
fn test_peer_busy_suspends_transmission() {
    let mut link = create_test_engine();
    link.establish();

    link.feed(Control::Supervisory {
        kind: SupervisoryKind::Rnr,
        nr: 0,
        pf: false,
    });
    link.engine
        .on_command(LapdCommand::Transmit(Bytes::from_static(b"held")));
    assert!(link.sent().is_none(), "RNR must suspend I transmission");

    link.feed(Control::Supervisory {
        kind: SupervisoryKind::Rr,
        nr: 0,
        pf: false,
    });
    let frame = link.sent().expect("flushed after RR");
    assert_eq!(frame.info, Bytes::from_static(b"held"));
}

#[test]
fn test_rej_triggers_retransmission() {
    let mut link = create_test_engine();
    link.establish();

    for i in 0..3u8 {
        link.engine
            .on_command(LapdCommand::Transmit(Bytes::from(vec![i])));
    }
    link.drain_sent();

    link.feed(Control::Supervisory {
        kind: SupervisoryKind::Rej,
        nr: 1,
        pf: false,
    });
    let resent = link.drain_sent();
    assert_eq!(resent.len(), 2);
    assert_eq!(resent[0].info, Bytes::from(vec![1u8]));
    assert_eq!(resent[1].info, Bytes::from(vec![2u8]));
    assert_eq!(link.engine.sequence_vars(), (3, 0, 1));
}

#[test]
fn test_sequence_wrap_at_mod_128() {
    let mut link = create_test_engine();
    link.establish();

    for i in 0..130u16 {
        link.engine
            .on_command(LapdCommand::Transmit(Bytes::from(vec![i as u8])));
        let sent = link.sent().expect("I-frame sent");
        let expected_ns = (i % 128) as u8;
        assert_eq!(
            sent.control,
            Control::Info {
                ns: expected_ns,
                nr: 0,
                poll: false
            }
        );
        // Ack each frame immediately so the window never closes.
        link.feed(Control::Supervisory {
            kind: SupervisoryKind::Rr,
            nr: (expected_ns + 1) % 128,
            pf: false,
        });
    }
    let (v_s, _, v_a) = link.engine.sequence_vars();
    assert_eq!(v_s, 2);
    assert_eq!(v_a, 2);
    assert!(link.engine.retransmit_sequence_numbers().is_empty());
}

#[test]
fn test_disc_releases_link() {
    let mut link = create_test_engine();
    link.establish();

    link.feed(Control::Unnumbered {
        kind: UnnumberedKind::Disc,
        pf: true,
    });
    assert_eq!(link.engine.state(), LapdState::Down);
    let ua = link.sent().expect("UA response");
    assert_eq!(
        ua.control,
        Control::Unnumbered {
            kind: UnnumberedKind::Ua,
            pf: true
        }
    );
    assert_eq!(link.event(), Some(LapdEvent::Released));
}

#[test]
fn test_t203_idle_poll() {
    let mut link = create_test_engine();
    link.establish();

    link.engine.on_timer(LapdTimer::T203);
    let poll = link.sent().expect("supervisory poll");
    assert_eq!(
        poll.control,
        Control::Supervisory {
            kind: SupervisoryKind::Rr,
            nr: 0,
            pf: true
        }
    );
}

#[test]
fn test_poll_command_for_heartbeat() {
    let mut link = create_test_engine();
    link.establish();

    link.engine.on_command(LapdCommand::Poll);
    let poll = link.sent().expect("RR(P=1)");
    assert!(poll.control.poll_final());

    // Peer answers RR(F=1); nothing further is sent.
    link.feed_frame(crate::frame::Frame::new(
        crate::frame::Address::new(0, false, 0),
        Control::Supervisory {
            kind: SupervisoryKind::Rr,
            nr: 0,
            pf: true,
        },
    ));
    assert!(link.sent().is_none());
}

#[test]
fn test_tei_management_forwarded() {
    let mut link = create_test_engine();
    link.establish();

    let frame = crate::frame::Frame::new(
        crate::frame::Address::new(crate::frame::SAPI_TEI_MANAGEMENT, true, 127),
        Control::Unnumbered {
            kind: UnnumberedKind::Ui,
            pf: false,
        },
    );
    link.feed_frame(frame.clone());
    assert_eq!(link.event(), Some(LapdEvent::Management(frame)));
}

#[test]
fn test_rr_command_with_poll_gets_final() {
    let mut link = create_test_engine();
    link.establish();

    link.feed(Control::Supervisory {
        kind: SupervisoryKind::Rr,
        nr: 0,
        pf: true,
    });
    let reply = link.sent().expect("RR(F=1) reply");
    assert_eq!(
        reply.control,
        Control::Supervisory {
            kind: SupervisoryKind::Rr,
            nr: 0,
            pf: true
        }
    );
}

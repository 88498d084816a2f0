//! NFAS group supervision tests: election, heartbeat, switchover and the
//! replay queue.

use super::create_test_group;
use crate::config::{HeartbeatMode, NfasConfig};
use crate::lapd::{LapdCommand, LapdErrorKind, LapdEvent};
use crate::nfas::{GroupState, NfasEvent, SwitchReason};
use crate::q931::{MessageType, Q931Message};
use bytes::Bytes;
use std::time::{Duration, Instant};

fn test_config() -> NfasConfig {
    NfasConfig {
        enabled: true,
        ..NfasConfig::default()
    }
}

#[test]
fn test_empty_group_rejects_start() {
    let mut tg = create_test_group(&[], test_config());
    assert!(tg.group.start().is_err());
}

#[test]
fn test_primary_election_on_start() {
    let mut tg = create_test_group(&[1, 2, 3], test_config());
    tg.group.start().unwrap();
    assert_eq!(tg.group.state(), GroupState::Inactive);
    assert!(matches!(tg.commands(1)[..], [LapdCommand::Start]));
    assert!(tg.commands(2).is_empty(), "backups stay armed");

    tg.group.on_engine_event(1, LapdEvent::Established);
    assert_eq!(tg.group.state(), GroupState::Active);
    assert_eq!(tg.group.active_span(), Some(1));
    assert_eq!(tg.event(), Some(NfasEvent::GroupActive { span: 1 }));
}

#[test]
fn test_switchover_on_link_loss() {
    let mut tg = create_test_group(&[1, 2, 3], test_config());
    tg.group.start().unwrap();
    tg.group.on_engine_event(1, LapdEvent::Established);
    tg.drain_events();
    tg.commands(1);

    tg.group
        .on_engine_event(1, LapdEvent::Error(LapdErrorKind::LinkLost));
    assert_eq!(tg.group.state(), GroupState::Switching);
    assert!(matches!(tg.commands(2)[..], [LapdCommand::Start]));

    // Traffic during the switchover is queued, not lost.
    let enquiry = Q931Message::new(
        crate::q931::CallRef::dummy(),
        MessageType::StatusEnquiry,
    )
    .encode();
    tg.group.send(enquiry.clone());

    tg.group.on_engine_event(2, LapdEvent::Established);
    assert_eq!(tg.group.state(), GroupState::Active);
    assert_eq!(tg.group.active_span(), Some(2));
    assert_eq!(
        tg.event(),
        Some(NfasEvent::SwitchoverCompleted {
            from: 1,
            to: 2,
            reason: SwitchReason::LinkError
        })
    );
    assert_eq!(tg.group.stats().switchover_count, 1);

    // The queued message went out on the new active span.
    let replayed = tg.commands(2);
    assert!(replayed
        .iter()
        .any(|c| matches!(c, LapdCommand::Transmit(payload) if *payload == enquiry)));
}

#[test]
fn test_replay_queue_overflow_drops_oldest() {
    let mut config = test_config();
    config.replay_queue_depth = 2;
    let mut tg = create_test_group(&[1, 2], config);
    tg.group.start().unwrap();
    tg.group.on_engine_event(1, LapdEvent::Established);
    tg.group.on_engine_event(1, LapdEvent::Released);
    tg.drain_events();

    for i in 0..3u8 {
        tg.group.send(Bytes::from(vec![i]));
    }
    assert_eq!(tg.event(), Some(NfasEvent::QueueOverflow { dropped: 1 }));

    tg.group.on_engine_event(2, LapdEvent::Established);
    let replayed: Vec<Bytes> = tg
        .commands(2)
        .into_iter()
        .filter_map(|c| match c {
            LapdCommand::Transmit(payload) => Some(payload),
            _ => None,
        })
        .collect();
    // Message 0 was dropped; 1 and 2 survived in order.
    assert_eq!(replayed, vec![Bytes::from(vec![1u8]), Bytes::from(vec![2u8])]);
}

#[test]
fn test_heartbeat_link_poll() {
    let mut tg = create_test_group(&[1, 2], test_config());
    tg.group.start().unwrap();
    tg.group.on_engine_event(1, LapdEvent::Established);
    tg.commands(1);

    tg.group.poll_timers(Instant::now() + Duration::from_millis(1100));
    assert!(matches!(tg.commands(1)[..], [LapdCommand::Poll]));
    assert_eq!(tg.group.stats().heartbeats_sent, 1);
}

#[test]
fn test_heartbeat_status_enquiry_mode() {
    let mut config = test_config();
    config.heartbeat_mode = HeartbeatMode::StatusEnquiry;
    let mut tg = create_test_group(&[1, 2], config);
    tg.group.start().unwrap();
    tg.group.on_engine_event(1, LapdEvent::Established);
    tg.commands(1);

    tg.group.poll_timers(Instant::now() + Duration::from_millis(1100));
    let commands = tg.commands(1);
    match &commands[..] {
        [LapdCommand::Transmit(payload)] => {
            let msg = Q931Message::decode(payload).unwrap();
            assert_eq!(msg.message_type, MessageType::StatusEnquiry);
        }
        other => panic!("expected STATUS ENQUIRY transmit, got {:?}", other),
    }
}

#[test]
fn test_single_member_group_never_switches() {
    let mut tg = create_test_group(&[1], test_config());
    tg.group.start().unwrap();
    tg.group.on_engine_event(1, LapdEvent::Established);
    tg.drain_events();

    tg.group
        .on_engine_event(1, LapdEvent::Error(LapdErrorKind::LinkLost));
    // The lone span is retried until the attempt limit is hit.
    let mut now = Instant::now();
    for _ in 0..4 {
        now += Duration::from_millis(5100);
        tg.group.poll_timers(now);
    }
    assert_eq!(tg.group.state(), GroupState::Inactive);
    let events = tg.drain_events();
    assert!(events
        .iter()
        .all(|e| !matches!(e, NfasEvent::SwitchoverCompleted { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, NfasEvent::GroupInactive { .. })));
}

#[test]
fn test_candidate_timeout_moves_to_next_backup() {
    let mut tg = create_test_group(&[1, 2, 3], test_config());
    tg.group.start().unwrap();
    tg.group.on_engine_event(1, LapdEvent::Established);
    tg.drain_events();
    tg.commands(1);

    tg.group.on_engine_event(1, LapdEvent::Released);
    assert!(matches!(tg.commands(2)[..], [LapdCommand::Start]));

    // Span 2 never answers: the watchdog advances to span 3.
    tg.group.poll_timers(Instant::now() + Duration::from_millis(5100));
    assert!(matches!(tg.commands(3)[..], [LapdCommand::Start]));

    tg.group.on_engine_event(3, LapdEvent::Established);
    assert_eq!(tg.group.active_span(), Some(3));
    assert_eq!(
        tg.event(),
        Some(NfasEvent::SwitchoverCompleted {
            from: 1,
            to: 3,
            reason: SwitchReason::LinkReleased
        })
    );
}

#[test]
fn test_forced_switchover_to_target() {
    let mut tg = create_test_group(&[1, 2, 3], test_config());
    tg.group.start().unwrap();
    tg.group.on_engine_event(1, LapdEvent::Established);
    tg.drain_events();
    tg.commands(1);

    tg.group.force_switchover(Some(3));
    assert!(matches!(tg.commands(3)[..], [LapdCommand::Start]));
    assert!(matches!(tg.commands(1)[..], [LapdCommand::Stop]));

    tg.group.on_engine_event(3, LapdEvent::Established);
    assert_eq!(tg.group.active_span(), Some(3));
    assert_eq!(
        tg.event(),
        Some(NfasEvent::SwitchoverCompleted {
            from: 1,
            to: 3,
            reason: SwitchReason::Forced
        })
    );
}

#[test]
fn test_data_only_from_active_span() {
    let mut tg = create_test_group(&[1, 2], test_config());
    tg.group.start().unwrap();
    tg.group.on_engine_event(1, LapdEvent::Established);
    tg.drain_events();

    tg.group
        .on_engine_event(2, LapdEvent::Data(Bytes::from_static(b"stale")));
    assert!(tg.event().is_none());

    tg.group
        .on_engine_event(1, LapdEvent::Data(Bytes::from_static(b"live")));
    assert_eq!(
        tg.event(),
        Some(NfasEvent::Data(Bytes::from_static(b"live")))
    );
}

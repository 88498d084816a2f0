//! ISUP ⇄ SIP-T translation tests.

use super::{create_test_context, header_value};
use crate::config::Variant;
use crate::isup::IsupMessage;
use crate::q850;
use crate::translate::isup_sip::IsupSipTranslator;
use crate::translate::rules::RuleSet;
use bytes::Bytes;

fn translator() -> IsupSipTranslator {
    IsupSipTranslator::new(RuleSet::for_variant(Variant::Itu))
}

fn raw_iam() -> Bytes {
    IsupMessage::Iam {
        cic: 42,
        called: "5551002".to_string(),
        calling: Some("5551001".to_string()),
        optional: Vec::new(),
    }
    .encode()
}

#[test]
fn test_iam_to_invite_is_multipart_sip_t() {
    let ctx = create_test_context(Variant::Itu);
    let invite = translator()
        .iam_to_invite(&ctx, Some("5551001"), "5551002", &raw_iam())
        .unwrap();

    let content_type = header_value(&invite.headers, "content-type").unwrap();
    assert!(content_type.starts_with("multipart/mixed;boundary="));

    let body = &invite.body;
    let text = String::from_utf8_lossy(body);
    assert!(text.contains("Content-Type: application/sdp"));
    assert!(text.contains("Content-Type: application/ISUP;version=itu-t92+"));
    assert!(text.contains("Content-Disposition: signal;handling=required"));
}

#[test]
fn test_tunneled_iam_survives_round_trip() {
    let ctx = create_test_context(Variant::Itu);
    let tx = translator();
    let raw = raw_iam();
    let invite = tx
        .iam_to_invite(&ctx, Some("5551001"), "5551002", &raw)
        .unwrap();

    let intent = tx.invite_to_iam_intent(&invite).unwrap();
    assert_eq!(intent.called, "5551002");
    assert_eq!(intent.calling.as_deref(), Some("5551001"));
    assert!(intent.sdp.is_some());
    assert_eq!(intent.tunneled_iam, Some(raw.clone()));

    // The tunneled octets decode back to the original IAM.
    let decoded = IsupMessage::decode(intent.tunneled_iam.as_ref().unwrap()).unwrap();
    match decoded {
        IsupMessage::Iam { cic, called, .. } => {
            assert_eq!(cic, 42);
            assert_eq!(called, "5551002");
        }
        other => panic!("decoded {:?}", other),
    }
}

#[test]
fn test_international_user_strips_prefix_for_iam() {
    let ctx = create_test_context(Variant::Itu);
    let tx = translator();
    let invite = tx
        .iam_to_invite(&ctx, None, "+441632960960", &raw_iam())
        .unwrap();

    let intent = tx.invite_to_iam_intent(&invite).unwrap();
    // The address signals for the IAM never carry the SIP prefix.
    assert_eq!(intent.called, "441632960960");
}

#[test]
fn test_acm_and_anm_responses() {
    let ctx = create_test_context(Variant::Itu);
    let tx = translator();
    let invite = tx
        .iam_to_invite(&ctx, None, "5551002", &raw_iam())
        .unwrap();

    let progress = tx.acm_to_response(&ctx, &invite).unwrap();
    assert_eq!(
        progress.status_code,
        rsip::StatusCode::try_from(183).unwrap()
    );
    assert!(!progress.body.is_empty());

    let answer = tx.anm_to_response(&ctx, &invite).unwrap();
    assert_eq!(answer.status_code, rsip::StatusCode::try_from(200).unwrap());
    let sdp = String::from_utf8(answer.body.clone()).unwrap();
    assert!(sdp.contains("m=audio 10000"));
}

#[test]
fn test_rel_to_bye_carries_reason() {
    let ctx = create_test_context(Variant::Itu);
    let tx = translator();
    let invite = tx
        .iam_to_invite(&ctx, None, "5551002", &raw_iam())
        .unwrap();

    let bye = tx.rel_to_bye(&invite, q850::USER_BUSY).unwrap();
    assert_eq!(bye.method, rsip::Method::Bye);
    let reason = header_value(&bye.headers, "Reason").unwrap();
    assert_eq!(reason, "Q.850;cause=17;text=\"User busy\"");
}

#[test]
fn test_rel_before_answer_maps_to_486() {
    let ctx = create_test_context(Variant::Itu);
    let tx = translator();
    let invite = tx
        .iam_to_invite(&ctx, None, "5551002", &raw_iam())
        .unwrap();

    let response = tx.rel_to_response(&invite, q850::USER_BUSY).unwrap();
    assert_eq!(
        response.status_code,
        rsip::StatusCode::try_from(486).unwrap()
    );
    assert!(header_value(&response.headers, "Reason")
        .unwrap()
        .contains("cause=17"));
}

#[test]
fn test_bye_reason_parsed_back_to_cause() {
    let ctx = create_test_context(Variant::Itu);
    let tx = translator();
    let invite = tx
        .iam_to_invite(&ctx, None, "5551002", &raw_iam())
        .unwrap();
    let bye = tx.rel_to_bye(&invite, q850::USER_BUSY).unwrap();

    assert_eq!(tx.bye_to_cause(&bye), q850::USER_BUSY);
}

#[test]
fn test_bye_without_reason_defaults_to_normal() {
    let tx = translator();
    let bye = rsip::Request {
        method: rsip::Method::Bye,
        uri: rsip::Uri::try_from("sip:100@gw.example.com").unwrap(),
        headers: vec![].into(),
        version: rsip::Version::V2,
        body: vec![],
    };
    assert_eq!(tx.bye_to_cause(&bye), q850::NORMAL_CLEARING);
}

#[test]
fn test_status_maps_to_rel_cause() {
    let tx = translator();
    assert_eq!(tx.status_to_cause(486), q850::USER_BUSY);
    assert_eq!(tx.status_to_cause(503), q850::NO_CIRCUIT_AVAILABLE);
}

//! ISUP ⇄ SIP-T mapping (RFC 3372/3398 style).
//!
//! The IAM travels inside the INVITE as an `application/ISUP` body part so
//! a far-end gateway can regenerate it untouched; release causes ride in
//! `Reason` headers both ways.

use super::{
    make_tag,
    q931_sip::{format_reason, parse_reason},
    random_text,
    rules::RuleSet,
    sdp::MediaDescription,
    sip_uri, uri_user, TranslateEvent, TranslateEventSender, TranslationContext,
};
use crate::q850;
use crate::Result;
use bytes::Bytes;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use std::sync::Arc;
use tracing::warn;

const ISUP_CONTENT_TYPE: &str = "application/ISUP;version=itu-t92+";

pub struct IsupSipTranslator {
    rules: Arc<RuleSet>,
    events: Option<TranslateEventSender>,
}

impl IsupSipTranslator {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        IsupSipTranslator {
            rules,
            events: None,
        }
    }

    pub fn with_events(rules: Arc<RuleSet>, events: TranslateEventSender) -> Self {
        IsupSipTranslator {
            rules,
            events: Some(events),
        }
    }

    // -- ISUP → SIP -------------------------------------------------------

    /// IAM → INVITE whose body is multipart/mixed: the SDP offer plus the
    /// original IAM octets as an `application/ISUP` part. Address signals
    /// are rendered through the variant's numbering rules.
    pub fn iam_to_invite(
        &self,
        ctx: &TranslationContext,
        calling: Option<&str>,
        called: &str,
        raw_iam: &Bytes,
    ) -> Result<rsip::Request> {
        let called_user = self
            .rules
            .number_to_sip(&self.rules.number_from_sip(called));
        let calling_user = calling.map(|digits| {
            self.rules
                .number_to_sip(&self.rules.number_from_sip(digits))
        });
        let request_uri = sip_uri(Some(&called_user), &ctx.local_domain)?;
        let from = rsip::typed::From {
            display_name: None,
            uri: sip_uri(calling_user.as_deref(), &ctx.local_domain)?,
            params: vec![],
        }
        .with_tag(make_tag().into());
        let to = rsip::typed::To {
            display_name: None,
            uri: request_uri.clone(),
            params: vec![],
        };

        let offer = MediaDescription::offer(ctx.media_addr, ctx.rtp_port, None, ctx.variant);
        let boundary = random_text(16);
        let body = multipart_body(&boundary, &offer.render(1), raw_iam);

        let headers: Vec<rsip::Header> = vec![
            rsip::Header::From(from.into()),
            rsip::Header::To(to.into()),
            rsip::Header::CallId(ctx.sip_call_id.clone().into()),
            rsip::Header::CSeq(
                rsip::typed::CSeq {
                    seq: 1,
                    method: rsip::Method::Invite,
                }
                .into(),
            ),
            rsip::Header::MaxForwards(70.into()),
            rsip::Header::ContentType(
                format!("multipart/mixed;boundary={}", boundary).into(),
            ),
        ];

        Ok(rsip::Request {
            method: rsip::Method::Invite,
            uri: request_uri,
            headers: headers.into(),
            version: rsip::Version::V2,
            body,
        })
    }

    /// ACM → 183 Session Progress.
    pub fn acm_to_response(
        &self,
        ctx: &TranslationContext,
        invite: &rsip::Request,
    ) -> Result<rsip::Response> {
        let answer = self.answer_sdp(ctx, invite);
        make_response(invite, 183, Some(answer.into_bytes()))
    }

    /// ANM → 200 OK with the SDP answer.
    pub fn anm_to_response(
        &self,
        ctx: &TranslationContext,
        invite: &rsip::Request,
    ) -> Result<rsip::Response> {
        let answer = self.answer_sdp(ctx, invite);
        make_response(invite, 200, Some(answer.into_bytes()))
    }

    /// REL on an answered call → BYE with the Q.850 reason.
    pub fn rel_to_bye(&self, invite: &rsip::Request, cause: u8) -> Result<rsip::Request> {
        let mut headers: Vec<rsip::Header> = Vec::new();
        for header in invite.headers.iter() {
            match header {
                rsip::Header::CallId(_) | rsip::Header::From(_) | rsip::Header::To(_) => {
                    headers.push(header.clone())
                }
                _ => {}
            }
        }
        headers.push(rsip::Header::CSeq(
            rsip::typed::CSeq {
                seq: 2,
                method: rsip::Method::Bye,
            }
            .into(),
        ));
        headers.push(rsip::Header::MaxForwards(70.into()));
        headers.push(rsip::Header::Other("Reason".into(), format_reason(cause)));

        Ok(rsip::Request {
            method: rsip::Method::Bye,
            uri: invite.uri.clone(),
            headers: headers.into(),
            version: rsip::Version::V2,
            body: vec![],
        })
    }

    /// REL before answer → the mapped failure response on the INVITE.
    pub fn rel_to_response(
        &self,
        invite: &rsip::Request,
        cause: u8,
    ) -> Result<rsip::Response> {
        let status = match self.rules.status_for_cause(cause) {
            Some(status) => status,
            None => {
                warn!(cause, "no rule for cause, substituting 500");
                self.emit(TranslateEvent::NoRuleForCause { cause });
                500
            }
        };
        let mut response = make_response(invite, status, None)?;
        response
            .headers
            .push(rsip::Header::Other("Reason".into(), format_reason(cause)));
        Ok(response)
    }

    // -- SIP → ISUP -------------------------------------------------------

    /// Number and tunneled-IAM extraction from an inbound SIP-T INVITE.
    /// User parts are normalised to address signals per the variant's
    /// numbering rules (the international prefix never reaches the IAM).
    pub fn invite_to_iam_intent(&self, invite: &rsip::Request) -> Result<IamIntent> {
        let called = self
            .rules
            .number_from_sip(&uri_user(&invite.uri).unwrap_or_default())
            .digits;
        let calling = invite
            .from_header()
            .ok()
            .and_then(|h| h.typed().ok())
            .and_then(|from| uri_user(&from.uri))
            .map(|user| self.rules.number_from_sip(&user).digits);

        let content_type = invite
            .headers
            .iter()
            .find_map(|h| match h {
                rsip::Header::ContentType(ct) => Some(ct.to_string()),
                _ => None,
            })
            .unwrap_or_default();

        let (sdp, tunneled_iam) = if content_type.starts_with("multipart/") {
            split_multipart(&content_type, &invite.body)
        } else {
            (MediaDescription::parse(&invite.body), None)
        };

        Ok(IamIntent {
            calling,
            called,
            sdp,
            tunneled_iam,
        })
    }

    /// BYE → release cause: prefer the Reason header, default normal.
    pub fn bye_to_cause(&self, bye: &rsip::Request) -> u8 {
        parse_reason(&bye.headers).unwrap_or(q850::NORMAL_CLEARING)
    }

    /// Failure status on our INVITE → REL cause.
    pub fn status_to_cause(&self, status: u16) -> u8 {
        match self.rules.cause_for_status(status) {
            Some(cause) => cause,
            None => {
                warn!(status, "no rule for status, substituting cause 31");
                self.emit(TranslateEvent::NoRuleForStatus { status });
                q850::NORMAL_UNSPECIFIED
            }
        }
    }

    fn answer_sdp(&self, ctx: &TranslationContext, invite: &rsip::Request) -> String {
        let local = MediaDescription::offer(ctx.media_addr, ctx.rtp_port, None, ctx.variant);
        let content_type = invite
            .headers
            .iter()
            .find_map(|h| match h {
                rsip::Header::ContentType(ct) => Some(ct.to_string()),
                _ => None,
            })
            .unwrap_or_default();
        let offer = if content_type.starts_with("multipart/") {
            split_multipart(&content_type, &invite.body).0
        } else {
            MediaDescription::parse(&invite.body)
        };
        match offer {
            Some(offer) => local.answer(&offer).render(2),
            None => local.render(2),
        }
    }

    fn emit(&self, event: TranslateEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }
}

/// Extraction result for an inbound SIP-T INVITE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamIntent {
    pub calling: Option<String>,
    pub called: String,
    pub sdp: Option<MediaDescription>,
    pub tunneled_iam: Option<Bytes>,
}

fn make_response(
    request: &rsip::Request,
    status: u16,
    body: Option<Vec<u8>>,
) -> Result<rsip::Response> {
    let status_code =
        rsip::StatusCode::try_from(status).unwrap_or(rsip::StatusCode::ServerInternalError);
    let mut headers = request.headers.clone();
    headers.retain(|h| {
        matches!(
            h,
            rsip::Header::Via(_)
                | rsip::Header::CallId(_)
                | rsip::Header::From(_)
                | rsip::Header::To(_)
                | rsip::Header::CSeq(_)
        )
    });
    if status >= 180 {
        if let Ok(to) = request.to_header() {
            let has_tag = to.tag().ok().flatten().is_some();
            if !has_tag {
                if let Ok(typed) = to.typed() {
                    let tagged = typed.with_tag(make_tag().into());
                    headers.retain(|h| !matches!(h, rsip::Header::To(_)));
                    headers.push(rsip::Header::To(tagged.into()));
                }
            }
        }
    }
    if body.is_some() {
        headers.push(rsip::Header::ContentType("application/sdp".into()));
    }
    Ok(rsip::Response {
        status_code,
        version: rsip::Version::V2,
        headers,
        body: body.unwrap_or_default(),
    })
}

fn multipart_body(boundary: &str, sdp: &str, raw_iam: &Bytes) -> Vec<u8> {
    let mut body = Vec::with_capacity(sdp.len() + raw_iam.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/sdp\r\n\r\n");
    body.extend_from_slice(sdp.as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n", ISUP_CONTENT_TYPE).as_bytes());
    body.extend_from_slice(b"Content-Disposition: signal;handling=required\r\n\r\n");
    body.extend_from_slice(raw_iam);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

/// Split a multipart/mixed body into its SDP and ISUP parts. The ISUP part
/// is binary, so the split works on raw octets.
fn split_multipart(
    content_type: &str,
    body: &[u8],
) -> (Option<MediaDescription>, Option<Bytes>) {
    let boundary = match content_type
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))
    {
        Some(boundary) => boundary.trim_matches('"'),
        None => return (None, None),
    };

    let delimiter = format!("--{}", boundary).into_bytes();
    let mut sdp = None;
    let mut isup = None;

    for part in split_on(body, &delimiter) {
        let part = strip_crlf(part);
        if part.is_empty() || part.starts_with(b"--") {
            continue;
        }
        let header_end = match find_subslice(part, b"\r\n\r\n") {
            Some(at) => at,
            None => continue,
        };
        let part_headers = String::from_utf8_lossy(&part[..header_end]).to_ascii_lowercase();
        let part_body = strip_crlf(&part[header_end + 4..]);
        if part_headers.contains("application/sdp") {
            sdp = MediaDescription::parse(part_body);
        } else if part_headers.contains("application/isup") {
            isup = Some(Bytes::copy_from_slice(part_body));
        }
    }
    (sdp, isup)
}

fn split_on<'a>(haystack: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut rest = haystack;
    while let Some(at) = find_subslice(rest, delimiter) {
        parts.push(&rest[..at]);
        rest = &rest[at + delimiter.len()..];
    }
    parts.push(rest);
    parts
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn strip_crlf(mut part: &[u8]) -> &[u8] {
    while part.starts_with(b"\r\n") {
        part = &part[2..];
    }
    while part.ends_with(b"\r\n") {
        part = &part[..part.len() - 2];
    }
    part
}

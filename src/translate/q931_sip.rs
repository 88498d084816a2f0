//! Q.931 ⇄ SIP mapping.

use super::{
    make_call_id, make_tag, rules::RuleSet, sdp::MediaDescription, sip_uri, uri_user,
    TranslateEvent, TranslateEventSender, TranslationContext,
};
use crate::call::CallEvent;
use crate::q850;
use crate::q931::ie::{BearerCapability, PartyNumber};
use crate::Result;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a clearing Q.931 event becomes on the SIP side.
#[derive(Debug, Clone)]
pub enum ClearingAction {
    /// Established dialog: send BYE.
    Bye(rsip::Request),
    /// Unanswered inbound INVITE: send the mapped failure response.
    Response(rsip::Response),
}

/// A SIP INVITE reduced to what the TDM side needs to originate. Numbers
/// carry the address attributes the variant's rules recovered from the
/// user parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdmCallIntent {
    pub calling: Option<PartyNumber>,
    pub called: PartyNumber,
    pub offer: Option<MediaDescription>,
}

pub struct Q931SipTranslator {
    rules: Arc<RuleSet>,
    events: Option<TranslateEventSender>,
}

impl Q931SipTranslator {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Q931SipTranslator {
            rules,
            events: None,
        }
    }

    pub fn with_events(rules: Arc<RuleSet>, events: TranslateEventSender) -> Self {
        Q931SipTranslator {
            rules,
            events: Some(events),
        }
    }

    // -- TDM → SIP --------------------------------------------------------

    /// SETUP → INVITE with an SDP offer on the session's RTP port. The
    /// calling and called user parts are rendered through the variant's
    /// nature-of-address table.
    pub fn setup_to_invite(
        &self,
        ctx: &TranslationContext,
        calling: Option<&PartyNumber>,
        called: Option<&PartyNumber>,
        bearer: Option<&BearerCapability>,
    ) -> Result<rsip::Request> {
        let called_user = called
            .map(|n| self.rules.number_to_sip(n))
            .unwrap_or_default();
        let request_uri = sip_uri(Some(&called_user), &ctx.local_domain)?;

        let calling_user = calling.map(|n| self.rules.number_to_sip(n));
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

        let offer =
            MediaDescription::offer(ctx.media_addr, ctx.rtp_port, bearer, ctx.variant);
        let body = offer.render(1).into_bytes();

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
            rsip::Header::ContentType("application/sdp".into()),
        ];

        Ok(rsip::Request {
            method: rsip::Method::Invite,
            uri: request_uri,
            headers: headers.into(),
            version: rsip::Version::V2,
            body,
        })
    }

    /// Map a call-progress event onto the INVITE it answers.
    pub fn progress_to_response(
        &self,
        ctx: &TranslationContext,
        invite: &rsip::Request,
        event: &CallEvent,
    ) -> Result<Option<rsip::Response>> {
        let response = match event {
            CallEvent::Proceeding { progress, .. } => {
                let status = progress
                    .and_then(|p| self.rules.status_for_progress(p))
                    .unwrap_or(100);
                Some(self.make_response(invite, status, None)?)
            }
            CallEvent::Alerting { progress, .. } => {
                let status = match progress {
                    Some(p) => self.rules.status_for_progress(*p).unwrap_or(180),
                    None => 180,
                };
                Some(self.make_response(invite, status, None)?)
            }
            CallEvent::Connected { .. } => {
                let answer = self.answer_sdp(ctx, invite);
                Some(self.make_response(invite, 200, Some(answer.into_bytes()))?)
            }
            _ => None,
        };
        Ok(response)
    }

    /// DISCONNECT/RELEASE with cause → BYE on an answered call, otherwise
    /// the mapped 4xx/5xx/6xx.
    pub fn clearing_to_sip(
        &self,
        invite: &rsip::Request,
        cause: u8,
        answered: bool,
    ) -> Result<ClearingAction> {
        if answered || cause == q850::NORMAL_CLEARING {
            return Ok(ClearingAction::Bye(self.make_bye(invite, cause)?));
        }
        let status = match self.rules.status_for_cause(cause) {
            Some(status) => status,
            None => {
                warn!(cause, "no rule for cause, substituting 500");
                self.emit(TranslateEvent::NoRuleForCause { cause });
                500
            }
        };
        let mut response = self.make_response(invite, status, None)?;
        response.headers.push(rsip::Header::Other(
            "Reason".into(),
            format_reason(cause),
        ));
        Ok(ClearingAction::Response(response))
    }

    // -- SIP → TDM --------------------------------------------------------

    /// INVITE → the data a Q.931 origination needs. The user parts come
    /// back through the variant's nature-of-address table.
    pub fn invite_to_intent(&self, invite: &rsip::Request) -> Result<TdmCallIntent> {
        let called_user = uri_user(&invite.uri)
            .or_else(|| {
                invite
                    .to_header()
                    .ok()
                    .and_then(|h| h.typed().ok())
                    .and_then(|to| uri_user(&to.uri))
            })
            .unwrap_or_default();
        let called = self.rules.number_from_sip(&called_user);
        let calling = invite
            .from_header()
            .ok()
            .and_then(|h| h.typed().ok())
            .and_then(|from| uri_user(&from.uri))
            .map(|user| self.rules.number_from_sip(&user));

        let offer = if invite.body.is_empty() {
            None
        } else {
            match MediaDescription::parse(&invite.body) {
                Some(offer) => Some(offer),
                None => {
                    // Media negotiation is deferred to a later re-INVITE;
                    // the call itself still proceeds.
                    debug!("INVITE body is not parseable SDP");
                    self.emit(TranslateEvent::UnparseableSdp);
                    None
                }
            }
        };

        Ok(TdmCallIntent {
            calling,
            called,
            offer,
        })
    }

    /// SIP failure status → Q.850 cause for the TDM release.
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

    // -- helpers ----------------------------------------------------------

    pub fn make_response(
        &self,
        request: &rsip::Request,
        status: u16,
        body: Option<Vec<u8>>,
    ) -> Result<rsip::Response> {
        let status_code = rsip::StatusCode::try_from(status)
            .unwrap_or(rsip::StatusCode::ServerInternalError);
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

        // Final and ringing responses need a To tag for dialog formation.
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

    fn make_bye(&self, invite: &rsip::Request, cause: u8) -> Result<rsip::Request> {
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

    fn answer_sdp(&self, ctx: &TranslationContext, invite: &rsip::Request) -> String {
        let local = MediaDescription::offer(ctx.media_addr, ctx.rtp_port, None, ctx.variant);
        match MediaDescription::parse(&invite.body) {
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

/// CANCEL for an INVITE this side originated and the far end has not yet
/// answered.
pub fn make_cancel(invite: &rsip::Request) -> rsip::Request {
    let mut headers: Vec<rsip::Header> = Vec::new();
    for header in invite.headers.iter() {
        match header {
            rsip::Header::CallId(_)
            | rsip::Header::From(_)
            | rsip::Header::To(_)
            | rsip::Header::Via(_) => headers.push(header.clone()),
            _ => {}
        }
    }
    headers.push(rsip::Header::CSeq(
        rsip::typed::CSeq {
            seq: 1,
            method: rsip::Method::Cancel,
        }
        .into(),
    ));
    headers.push(rsip::Header::MaxForwards(70.into()));

    rsip::Request {
        method: rsip::Method::Cancel,
        uri: invite.uri.clone(),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

/// `Reason: Q.850;cause=N;text="..."` header value.
pub fn format_reason(cause: u8) -> String {
    format!("Q.850;cause={};text=\"{}\"", cause, q850::text(cause))
}

/// Q.850 cause carried in a `Reason` header, if any.
pub fn parse_reason(headers: &rsip::Headers) -> Option<u8> {
    for header in headers.iter() {
        if let rsip::Header::Other(name, value) = header {
            if name.eq_ignore_ascii_case("reason") && value.contains("Q.850") {
                for part in value.split(';') {
                    let part = part.trim();
                    if let Some(cause) = part.strip_prefix("cause=") {
                        return cause.parse().ok();
                    }
                }
            }
        }
    }
    None
}

/// A fresh Call-ID for a gateway-originated dialog.
pub fn new_call_id(domain: &str) -> String {
    make_call_id(domain)
}

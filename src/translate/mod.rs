//! Protocol translation between the TDM side (Q.931, ISUP) and SIP.
//!
//! Translation is per call and stateless: every function takes a
//! [`TranslationContext`] carrying the session's identity and the variant
//! fixed at the session's first translation. Rule sets are built once at
//! startup and shared read-only.

use crate::config::Variant;
use std::net::IpAddr;
use tokio::sync::mpsc::UnboundedSender;

pub mod isup_sip;
pub mod q931_sip;
pub mod rules;
pub mod sdp;

pub use rules::RuleSet;
pub use sdp::MediaDescription;

#[cfg(test)]
mod tests;

pub const CALL_ID_LEN: usize = 22;
pub const TAG_LEN: usize = 8;

/// Per-call translation inputs: identity, media, variant.
#[derive(Debug, Clone)]
pub struct TranslationContext {
    pub variant: Variant,
    /// D-channel endpoint or trunk group the TDM leg lives on.
    pub endpoint: String,
    pub local_domain: String,
    pub media_addr: IpAddr,
    /// Local RTP port allocated for the session.
    pub rtp_port: u16,
    pub sip_call_id: String,
}

/// Warnings the translator surfaces without failing the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateEvent {
    NoRuleForCause { cause: u8 },
    NoRuleForStatus { status: u16 },
    UnparseableSdp,
}

pub type TranslateEventSender = UnboundedSender<TranslateEvent>;

pub fn make_call_id(domain: &str) -> String {
    format!("{}@{}", random_text(CALL_ID_LEN), domain)
}

pub fn make_tag() -> String {
    random_text(TAG_LEN)
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect::<String>()
}

pub(crate) fn sip_uri(user: Option<&str>, domain: &str) -> crate::Result<rsip::Uri> {
    Ok(rsip::Uri {
        scheme: Some(rsip::Scheme::Sip),
        auth: user.map(|user| rsip::Auth {
            user: user.to_string(),
            password: None,
        }),
        host_with_port: rsip::HostWithPort::try_from(domain)?,
        ..Default::default()
    })
}

/// User part of a SIP URI, for number extraction on the inbound path.
pub(crate) fn uri_user(uri: &rsip::Uri) -> Option<String> {
    uri.auth.as_ref().map(|auth| auth.user.clone())
}

use super::TranslationContext;
use crate::config::Variant;
use std::net::{IpAddr, Ipv4Addr};

mod test_isup_sip;

pub(super) fn create_test_context(variant: Variant) -> TranslationContext {
    TranslationContext {
        variant,
        endpoint: "group-1".to_string(),
        local_domain: "gw.example.com".to_string(),
        media_addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
        rtp_port: 10000,
        sip_call_id: "test-call-id@gw.example.com".to_string(),
    }
}

pub(super) fn header_value(headers: &rsip::Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|h| match h {
        rsip::Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.clone()),
        rsip::Header::ContentType(ct) if name.eq_ignore_ascii_case("content-type") => {
            Some(ct.to_string())
        }
        _ => None,
    })
}

//! Variant rule sets: Q.850 cause ⇄ SIP status, progress mappings, and
//! nature-of-address/numbering-plan normalisation.
//!
//! The base tables follow RFC 3398; the ANSI and ETSI sets apply their
//! interworking deltas on top. Sets are immutable after construction;
//! `with_cause_override` clones into a new set.

use crate::config::Variant;
use crate::q850;
use crate::q931::ie::{NumberingPlan, PartyNumber, TypeOfNumber};
use std::collections::HashMap;
use std::sync::Arc;

/// Nature-of-address / numbering-plan codes for one variant: how TDM
/// address attributes render into a SIP user part, and what attributes a
/// bare SIP user gets on the way back.
#[derive(Clone)]
struct NumberCodes {
    /// (type of number, numbering plan) → user-part prefix.
    to_sip: HashMap<(TypeOfNumber, NumberingPlan), &'static str>,
    /// Attributes for SIP users without an international prefix.
    default_ton: TypeOfNumber,
    default_plan: NumberingPlan,
}

pub struct RuleSet {
    variant: Variant,
    cause_to_status: HashMap<u8, u16>,
    status_to_cause: HashMap<u16, u8>,
    progress_to_status: HashMap<u8, u16>,
    number_codes: NumberCodes,
}

impl RuleSet {
    pub fn for_variant(variant: Variant) -> Arc<RuleSet> {
        Arc::new(match variant {
            Variant::Itu => Self::itu(),
            Variant::Ansi => Self::ansi(),
            Variant::Etsi => Self::etsi(),
        })
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    fn itu() -> RuleSet {
        let cause_to_status: HashMap<u8, u16> = [
            (q850::UNALLOCATED_NUMBER, 404),
            (2, 404),
            (q850::NO_ROUTE_TO_DESTINATION, 404),
            (q850::USER_BUSY, 486),
            (q850::NO_USER_RESPONDING, 408),
            (q850::NO_ANSWER, 480),
            (q850::SUBSCRIBER_ABSENT, 480),
            (q850::CALL_REJECTED, 403),
            (q850::NUMBER_CHANGED, 410),
            (26, 404),
            (q850::DESTINATION_OUT_OF_ORDER, 502),
            (q850::INVALID_NUMBER_FORMAT, 484),
            (q850::FACILITY_REJECTED, 501),
            (q850::NORMAL_UNSPECIFIED, 480),
            (q850::NO_CIRCUIT_AVAILABLE, 503),
            (q850::NETWORK_OUT_OF_ORDER, 503),
            (q850::TEMPORARY_FAILURE, 503),
            (q850::SWITCHING_CONGESTION, 503),
            (q850::REQUESTED_CHANNEL_UNAVAILABLE, 503),
            (q850::RESOURCE_UNAVAILABLE, 503),
            (55, 403),
            (q850::BEARER_NOT_AUTHORIZED, 403),
            (q850::BEARER_NOT_AVAILABLE, 503),
            (q850::SERVICE_NOT_AVAILABLE, 503),
            (q850::BEARER_NOT_IMPLEMENTED, 488),
            (70, 488),
            (79, 501),
            (87, 403),
            (q850::INCOMPATIBLE_DESTINATION, 503),
            (q850::INVALID_MESSAGE_UNSPECIFIED, 400),
            (q850::MANDATORY_IE_MISSING, 400),
            (q850::MESSAGE_TYPE_NONEXISTENT, 400),
            (q850::MESSAGE_NOT_COMPATIBLE_WITH_STATE, 400),
            (q850::RECOVERY_ON_TIMER_EXPIRY, 504),
            (q850::PROTOCOL_ERROR_UNSPECIFIED, 400),
            (q850::INTERWORKING_UNSPECIFIED, 500),
        ]
        .into_iter()
        .collect();

        let status_to_cause: HashMap<u16, u8> = [
            (400, q850::TEMPORARY_FAILURE),
            (401, q850::CALL_REJECTED),
            (402, q850::CALL_REJECTED),
            (403, q850::CALL_REJECTED),
            (404, q850::UNALLOCATED_NUMBER),
            (405, q850::SERVICE_NOT_AVAILABLE),
            (406, 79),
            (408, q850::RECOVERY_ON_TIMER_EXPIRY),
            (410, q850::NUMBER_CHANGED),
            (415, 79),
            (416, q850::INTERWORKING_UNSPECIFIED),
            (420, q850::INTERWORKING_UNSPECIFIED),
            (421, q850::INTERWORKING_UNSPECIFIED),
            (423, q850::INTERWORKING_UNSPECIFIED),
            (480, q850::NO_ANSWER),
            (481, q850::TEMPORARY_FAILURE),
            (482, 25),
            (483, 25),
            (484, q850::INVALID_NUMBER_FORMAT),
            (485, q850::UNALLOCATED_NUMBER),
            (486, q850::USER_BUSY),
            (487, q850::NORMAL_CLEARING),
            (488, q850::BEARER_NOT_IMPLEMENTED),
            (500, q850::TEMPORARY_FAILURE),
            (501, 79),
            (502, q850::NETWORK_OUT_OF_ORDER),
            (503, q850::NO_CIRCUIT_AVAILABLE),
            (504, q850::RECOVERY_ON_TIMER_EXPIRY),
            (505, q850::INTERWORKING_UNSPECIFIED),
            (513, q850::INTERWORKING_UNSPECIFIED),
            (600, q850::USER_BUSY),
            (603, q850::CALL_REJECTED),
            (604, q850::UNALLOCATED_NUMBER),
            (606, q850::BEARER_NOT_IMPLEMENTED),
        ]
        .into_iter()
        .collect();

        let progress_to_status: HashMap<u8, u16> = [
            (1, 183), // call is not end-to-end ISDN
            (2, 183), // destination address is non-ISDN
            (3, 183), // origination address is non-ISDN
            (4, 180), // call has returned to the ISDN
            (8, 183), // in-band information available
        ]
        .into_iter()
        .collect();

        let number_codes = NumberCodes {
            to_sip: [
                ((TypeOfNumber::International, NumberingPlan::Isdn), "+"),
                ((TypeOfNumber::International, NumberingPlan::Unknown), "+"),
                ((TypeOfNumber::National, NumberingPlan::Isdn), ""),
                ((TypeOfNumber::Subscriber, NumberingPlan::Isdn), ""),
                ((TypeOfNumber::Unknown, NumberingPlan::Isdn), ""),
                ((TypeOfNumber::Unknown, NumberingPlan::Unknown), ""),
                ((TypeOfNumber::Unknown, NumberingPlan::Private), ""),
            ]
            .into_iter()
            .collect(),
            default_ton: TypeOfNumber::National,
            default_plan: NumberingPlan::Isdn,
        };

        RuleSet {
            variant: Variant::Itu,
            cause_to_status,
            status_to_cause,
            progress_to_status,
            number_codes,
        }
    }

    fn ansi() -> RuleSet {
        let mut rules = Self::itu();
        rules.variant = Variant::Ansi;
        // ANSI T1.113 treats a congested far end as a temporary failure
        // rather than a circuit shortage.
        rules.status_to_cause.insert(503, q850::TEMPORARY_FAILURE);
        rules
            .cause_to_status
            .insert(q850::NO_USER_RESPONDING, 480);
        rules
    }

    fn etsi() -> RuleSet {
        let mut rules = Self::itu();
        rules.variant = Variant::Etsi;
        // ETSI interworking prefers the global 603 for an explicit reject,
        // and leaves the type of number open on inbound SIP users.
        rules.cause_to_status.insert(q850::CALL_REJECTED, 603);
        rules.number_codes.default_ton = TypeOfNumber::Unknown;
        rules
    }

    /// New set with single entries replaced; the original is untouched.
    pub fn with_cause_override(&self, cause: u8, status: u16) -> RuleSet {
        let mut cause_to_status = self.cause_to_status.clone();
        cause_to_status.insert(cause, status);
        RuleSet {
            variant: self.variant,
            cause_to_status,
            status_to_cause: self.status_to_cause.clone(),
            progress_to_status: self.progress_to_status.clone(),
            number_codes: self.number_codes.clone(),
        }
    }

    pub fn status_for_cause(&self, cause: u8) -> Option<u16> {
        self.cause_to_status.get(&cause).copied()
    }

    pub fn cause_for_status(&self, status: u16) -> Option<u8> {
        self.status_to_cause.get(&status).copied()
    }

    pub fn status_for_progress(&self, description: u8) -> Option<u16> {
        self.progress_to_status.get(&description).copied()
    }

    /// Render a TDM party number as a SIP user part, applying the
    /// variant's nature-of-address prefix.
    pub fn number_to_sip(&self, number: &PartyNumber) -> String {
        let prefix = self
            .number_codes
            .to_sip
            .get(&(number.ton, number.plan))
            .copied()
            .unwrap_or("");
        format!("{}{}", prefix, number.digits)
    }

    /// Recover TDM address attributes from a SIP user part: an
    /// international prefix is consumed, anything else gets the variant's
    /// default type of number and numbering plan.
    pub fn number_from_sip(&self, user: &str) -> PartyNumber {
        match user.strip_prefix('+') {
            Some(digits) => {
                PartyNumber::new(TypeOfNumber::International, NumberingPlan::Isdn, digits)
            }
            None => PartyNumber::new(
                self.number_codes.default_ton,
                self.number_codes.default_plan,
                user,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_known_mappings() {
        let itu = RuleSet::for_variant(Variant::Itu);
        assert_eq!(itu.status_for_cause(q850::USER_BUSY), Some(486));
        assert_eq!(itu.cause_for_status(486), Some(q850::USER_BUSY));
        assert_eq!(itu.cause_for_status(480), Some(q850::NO_ANSWER));
        assert_eq!(itu.cause_for_status(404), Some(q850::UNALLOCATED_NUMBER));
        assert_eq!(itu.cause_for_status(503), Some(q850::NO_CIRCUIT_AVAILABLE));
    }

    #[test]
    fn test_variant_deltas() {
        let ansi = RuleSet::for_variant(Variant::Ansi);
        assert_eq!(ansi.cause_for_status(503), Some(q850::TEMPORARY_FAILURE));

        let etsi = RuleSet::for_variant(Variant::Etsi);
        assert_eq!(etsi.status_for_cause(q850::CALL_REJECTED), Some(603));
    }

    #[test]
    fn test_unknown_entries_are_none() {
        let itu = RuleSet::for_variant(Variant::Itu);
        assert_eq!(itu.status_for_cause(123), None);
        assert_eq!(itu.cause_for_status(299), None);
    }

    #[test]
    fn test_number_codes_to_sip() {
        let itu = RuleSet::for_variant(Variant::Itu);
        let international =
            PartyNumber::new(TypeOfNumber::International, NumberingPlan::Isdn, "441632960960");
        assert_eq!(itu.number_to_sip(&international), "+441632960960");
        assert_eq!(itu.number_to_sip(&PartyNumber::national("5551001")), "5551001");
    }

    #[test]
    fn test_number_codes_from_sip() {
        let itu = RuleSet::for_variant(Variant::Itu);
        let number = itu.number_from_sip("+441632960960");
        assert_eq!(number.ton, TypeOfNumber::International);
        assert_eq!(number.digits, "441632960960");

        let number = itu.number_from_sip("5551001");
        assert_eq!(number.ton, TypeOfNumber::National);
        assert_eq!(number.plan, NumberingPlan::Isdn);

        // ETSI leaves the type of number open.
        let etsi = RuleSet::for_variant(Variant::Etsi);
        assert_eq!(etsi.number_from_sip("5551001").ton, TypeOfNumber::Unknown);
    }

    #[test]
    fn test_number_round_trip_modulo_normalisation() {
        let itu = RuleSet::for_variant(Variant::Itu);
        for original in [
            PartyNumber::national("5551001"),
            PartyNumber::new(TypeOfNumber::International, NumberingPlan::Isdn, "4416329"),
        ] {
            let back = itu.number_from_sip(&itu.number_to_sip(&original));
            assert_eq!(back.digits, original.digits);
            assert_eq!(back.ton, original.ton);
        }
    }

    #[test]
    fn test_override_does_not_mutate_base() {
        let itu = RuleSet::for_variant(Variant::Itu);
        let custom = itu.with_cause_override(q850::USER_BUSY, 600);
        assert_eq!(custom.status_for_cause(q850::USER_BUSY), Some(600));
        assert_eq!(itu.status_for_cause(q850::USER_BUSY), Some(486));
    }
}

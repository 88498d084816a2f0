//! Q.850 cause values shared by Q.931 and ISUP release handling.

pub const UNALLOCATED_NUMBER: u8 = 1;
pub const NO_ROUTE_TO_DESTINATION: u8 = 3;
pub const NORMAL_CLEARING: u8 = 16;
pub const USER_BUSY: u8 = 17;
pub const NO_USER_RESPONDING: u8 = 18;
pub const NO_ANSWER: u8 = 19;
pub const SUBSCRIBER_ABSENT: u8 = 20;
pub const CALL_REJECTED: u8 = 21;
pub const NUMBER_CHANGED: u8 = 22;
pub const DESTINATION_OUT_OF_ORDER: u8 = 27;
pub const INVALID_NUMBER_FORMAT: u8 = 28;
pub const FACILITY_REJECTED: u8 = 29;
pub const RESPONSE_TO_STATUS_ENQUIRY: u8 = 30;
pub const NORMAL_UNSPECIFIED: u8 = 31;
pub const NO_CIRCUIT_AVAILABLE: u8 = 34;
pub const NETWORK_OUT_OF_ORDER: u8 = 38;
pub const TEMPORARY_FAILURE: u8 = 41;
pub const SWITCHING_CONGESTION: u8 = 42;
pub const REQUESTED_CHANNEL_UNAVAILABLE: u8 = 44;
pub const RESOURCE_UNAVAILABLE: u8 = 47;
pub const BEARER_NOT_AUTHORIZED: u8 = 57;
pub const BEARER_NOT_AVAILABLE: u8 = 58;
pub const SERVICE_NOT_AVAILABLE: u8 = 63;
pub const BEARER_NOT_IMPLEMENTED: u8 = 65;
pub const INVALID_CALL_REFERENCE: u8 = 81;
pub const INCOMPATIBLE_DESTINATION: u8 = 88;
pub const INVALID_MESSAGE_UNSPECIFIED: u8 = 95;
pub const MANDATORY_IE_MISSING: u8 = 96;
pub const MESSAGE_TYPE_NONEXISTENT: u8 = 97;
pub const MESSAGE_NOT_COMPATIBLE_WITH_STATE: u8 = 101;
pub const RECOVERY_ON_TIMER_EXPIRY: u8 = 102;
pub const PROTOCOL_ERROR_UNSPECIFIED: u8 = 111;
pub const INTERWORKING_UNSPECIFIED: u8 = 127;

/// Human-readable cause text, used in SIP `Reason` headers.
pub fn text(cause: u8) -> &'static str {
    match cause {
        UNALLOCATED_NUMBER => "Unallocated number",
        NO_ROUTE_TO_DESTINATION => "No route to destination",
        NORMAL_CLEARING => "Normal call clearing",
        USER_BUSY => "User busy",
        NO_USER_RESPONDING => "No user responding",
        NO_ANSWER => "No answer from user",
        SUBSCRIBER_ABSENT => "Subscriber absent",
        CALL_REJECTED => "Call rejected",
        NUMBER_CHANGED => "Number changed",
        DESTINATION_OUT_OF_ORDER => "Destination out of order",
        INVALID_NUMBER_FORMAT => "Invalid number format",
        RESPONSE_TO_STATUS_ENQUIRY => "Response to STATUS ENQUIRY",
        NORMAL_UNSPECIFIED => "Normal, unspecified",
        NO_CIRCUIT_AVAILABLE => "No circuit/channel available",
        NETWORK_OUT_OF_ORDER => "Network out of order",
        TEMPORARY_FAILURE => "Temporary failure",
        SWITCHING_CONGESTION => "Switching equipment congestion",
        REQUESTED_CHANNEL_UNAVAILABLE => "Requested circuit/channel not available",
        RESOURCE_UNAVAILABLE => "Resource unavailable, unspecified",
        SERVICE_NOT_AVAILABLE => "Service or option not available",
        INVALID_CALL_REFERENCE => "Invalid call reference value",
        MESSAGE_NOT_COMPATIBLE_WITH_STATE => "Message not compatible with call state",
        RECOVERY_ON_TIMER_EXPIRY => "Recovery on timer expiry",
        PROTOCOL_ERROR_UNSPECIFIED => "Protocol error, unspecified",
        INTERWORKING_UNSPECIFIED => "Interworking, unspecified",
        _ => "Unspecified",
    }
}

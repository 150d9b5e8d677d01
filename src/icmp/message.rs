//! ICMP message classification
//!
//! Request types that expect an answer are tracked until the matching
//! response arrives. Everything else is reported on its own.

use chrono::{DateTime, Utc};

/// One observed ICMP message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpMessage {
    pub ts: DateTime<Utc>,
    pub icmp_type: u8,
    pub code: u8,
    /// Whole ICMP message length
    pub length: usize,
}

// ICMPv4 request -> response pairs
const V4_PAIRS: [(u8, u8); 4] = [
    (8, 0),   // echo
    (13, 14), // timestamp
    (15, 16), // information
    (17, 18), // address mask
];

const V4_ERRORS: [u8; 5] = [3, 4, 5, 11, 12];

const V6_PAIRS: [(u8, u8); 1] = [(128, 129)];

const V6_ERRORS: [u8; 4] = [1, 2, 3, 4];

fn pairs(version: u8) -> &'static [(u8, u8)] {
    if version == 4 {
        &V4_PAIRS
    } else {
        &V6_PAIRS
    }
}

/// Request types that expect a response
pub fn is_request(version: u8, icmp_type: u8) -> bool {
    pairs(version).iter().any(|&(req, _)| req == icmp_type)
}

/// Response half of a request/response pair
pub fn is_response(version: u8, icmp_type: u8) -> bool {
    pairs(version).iter().any(|&(_, resp)| resp == icmp_type)
}

/// Types that carry an identifier and sequence number
pub fn has_id_and_seq(version: u8, icmp_type: u8) -> bool {
    is_request(version, icmp_type) || is_response(version, icmp_type)
}

pub fn is_error(version: u8, icmp_type: u8) -> bool {
    if version == 4 {
        V4_ERRORS.contains(&icmp_type)
    } else {
        V6_ERRORS.contains(&icmp_type)
    }
}

pub fn type_name(version: u8, icmp_type: u8) -> Option<&'static str> {
    let name = if version == 4 {
        match icmp_type {
            0 => "EchoReply",
            3 => "DestinationUnreachable",
            4 => "SourceQuench",
            5 => "Redirect",
            8 => "EchoRequest",
            9 => "RouterAdvertisement",
            10 => "RouterSolicitation",
            11 => "TimeExceeded",
            12 => "ParameterProblem",
            13 => "TimestampRequest",
            14 => "TimestampReply",
            15 => "InformationRequest",
            16 => "InformationReply",
            17 => "AddressMaskRequest",
            18 => "AddressMaskReply",
            _ => return None,
        }
    } else {
        match icmp_type {
            1 => "DestinationUnreachable",
            2 => "PacketTooBig",
            3 => "TimeExceeded",
            4 => "ParameterProblem",
            128 => "EchoRequest",
            129 => "EchoReply",
            133 => "RouterSolicitation",
            134 => "RouterAdvertisement",
            135 => "NeighborSolicitation",
            136 => "NeighborAdvertisement",
            137 => "Redirect",
            _ => return None,
        }
    };
    Some(name)
}

fn code_name(version: u8, icmp_type: u8, code: u8) -> Option<&'static str> {
    let name = match (version, icmp_type) {
        (4, 3) => match code {
            0 => "Net",
            1 => "Host",
            2 => "Protocol",
            3 => "Port",
            4 => "FragmentationNeeded",
            5 => "SourceRouteFailed",
            6 => "NetUnknown",
            7 => "HostUnknown",
            9 => "NetProhibited",
            10 => "HostProhibited",
            13 => "CommunicationProhibited",
            _ => return None,
        },
        (4, 11) | (6, 3) => match code {
            0 => "TTLExceeded",
            1 => "FragmentReassemblyTimeExceeded",
            _ => return None,
        },
        (6, 1) => match code {
            0 => "NoRoute",
            1 => "AdminProhibited",
            3 => "AddressUnreachable",
            4 => "PortUnreachable",
            _ => return None,
        },
        _ => return None,
    };
    Some(name)
}

/// Readable description, e.g. `DestinationUnreachable(Port)`
pub fn human_readable(version: u8, msg: &IcmpMessage) -> String {
    let name = match type_name(version, msg.icmp_type) {
        Some(name) => name.to_string(),
        None => format!("Type({})", msg.icmp_type),
    };
    match code_name(version, msg.icmp_type, msg.code) {
        Some(code) => format!("{}({})", name, code),
        None if msg.code != 0 => format!("{}(Code({}))", name, msg.code),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(icmp_type: u8, code: u8) -> IcmpMessage {
        IcmpMessage {
            ts: Utc::now(),
            icmp_type,
            code,
            length: 8,
        }
    }

    #[test]
    fn test_v4_classification() {
        for t in [8, 13, 15, 17] {
            assert!(is_request(4, t));
            assert!(has_id_and_seq(4, t));
        }
        for t in [0, 14, 16, 18] {
            assert!(is_response(4, t));
            assert!(!is_request(4, t));
        }
        assert!(is_error(4, 3));
        assert!(!has_id_and_seq(4, 3));
        assert!(!is_request(4, 128));
    }

    #[test]
    fn test_v6_classification() {
        assert!(is_request(6, 128));
        assert!(is_response(6, 129));
        assert!(is_error(6, 1));
        assert!(!is_error(6, 135));
        assert!(!has_id_and_seq(6, 135));
    }

    #[test]
    fn test_human_readable() {
        assert_eq!(human_readable(4, &msg(8, 0)), "EchoRequest");
        assert_eq!(human_readable(4, &msg(3, 3)), "DestinationUnreachable(Port)");
        assert_eq!(human_readable(6, &msg(1, 4)), "DestinationUnreachable(PortUnreachable)");
        assert_eq!(human_readable(4, &msg(42, 0)), "Type(42)");
        assert_eq!(human_readable(4, &msg(5, 1)), "Redirect(Code(1))");
    }
}

//! EDNS Client Subnet (ECS) support.
//!
//! Implements RFC 7871 - Client Subnet in DNS Queries.

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::RData;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::trace;

/// Canonical source prefix emitted for IPv4 clients
pub const SOURCE_PREFIX_V4: u8 = 24;
/// Canonical source prefix emitted for IPv6 clients
pub const SOURCE_PREFIX_V6: u8 = 56;

/// Canonical ECS source prefix for an address family
pub fn source_prefix_for(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => SOURCE_PREFIX_V4,
        IpAddr::V6(_) => SOURCE_PREFIX_V6,
    }
}

/// Truncate an address to its leading `prefix` bits.
pub fn mask_ip(ip: IpAddr, prefix: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let prefix = prefix.min(32);
            let masked = if prefix == 0 {
                0
            } else {
                u32::from(v4) & (u32::MAX << (32 - prefix))
            };
            IpAddr::V4(Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let prefix = prefix.min(128);
            let masked = if prefix == 0 {
                0
            } else {
                u128::from(v6) & (u128::MAX << (128 - prefix))
            };
            IpAddr::V6(Ipv6Addr::from(masked))
        }
    }
}

/// Add or replace the Client Subnet option on a DNS message.
///
/// The source prefix is always the canonical /24 (IPv4) or /56 (IPv6) and
/// the address is truncated to it; `scope` is carried verbatim. Returns the
/// emitted network and source prefix so the caller can key its cache.
pub fn set_ecs(message: &mut Message, ip: IpAddr, scope: u8) -> (IpAddr, u8) {
    let source_prefix_len = source_prefix_for(ip);
    let network = mask_ip(ip, source_prefix_len);

    let client_subnet = ClientSubnet::new(network, source_prefix_len, scope);
    let ecs_option = EdnsOption::Subnet(client_subnet);

    trace!(
        "Setting EDNS Client Subnet: {}/{} (scope: {})",
        network,
        source_prefix_len,
        scope
    );

    let edns = message.extensions_mut();

    if let Some(opt) = edns {
        // OPT record exists, add/update ECS option
        opt.options_mut().insert(ecs_option);
    } else {
        // Create new EDNS with ECS
        let mut new_edns = hickory_proto::op::Edns::new();
        new_edns.set_max_payload(4096);
        new_edns.set_version(0);
        new_edns.options_mut().insert(ecs_option);
        message.set_edns(new_edns);
    }

    (network, source_prefix_len)
}

/// Extract the Client Subnet option from a DNS message if present.
///
/// Returns `(address, source prefix, scope prefix)`.
pub fn parse_ecs(message: &Message) -> Option<(IpAddr, u8, u8)> {
    let edns = message.extensions().as_ref()?;

    for (_code, option) in edns.options().as_ref().iter() {
        if let EdnsOption::Subnet(subnet) = option {
            return Some((subnet.addr(), subnet.source_prefix(), subnet.scope_prefix()));
        }
    }

    None
}

/// Whether the message carries a Client Subnet option
pub fn has_ecs(message: &Message) -> bool {
    parse_ecs(message).is_some()
}

/// Remove the Client Subnet option, keeping the rest of the OPT record intact.
pub fn strip_ecs(message: &mut Message) {
    if let Some(opt) = message.extensions_mut() {
        opt.options_mut().remove(EdnsCode::Subnet);
    }
}

/// Whether an address may be forwarded as ECS.
///
/// Loopback, private-use, link-local and unspecified addresses identify the
/// local network, not a routable client subnet, and must never be emitted.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            let unique_local = (segments[0] & 0xfe00) == 0xfc00;
            let link_local = (segments[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || unique_local
                || link_local)
        }
    }
}

/// Extract A/AAAA record IPs from a DNS response.
pub fn response_ips(message: &Message) -> Vec<IpAddr> {
    let mut ips = Vec::new();

    for answer in message.answers() {
        match answer.data() {
            RData::A(a) => ips.push(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => ips.push(IpAddr::V6(aaaa.0)),
            _ => {}
        }
    }

    ips
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::{Name, RecordType};

    fn create_test_query() -> Message {
        let mut message = Message::new();
        message.set_id(1234);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);

        let name = Name::from_ascii("example.com").unwrap();
        let query = Query::query(name, RecordType::A);
        message.add_query(query);

        message
    }

    #[test]
    fn test_set_and_parse_ecs() {
        let mut message = create_test_query();

        // The requested scope is carried verbatim while the source prefix is
        // always the canonical one for the family.
        let (network, mask) = set_ecs(&mut message, "1.2.3.0".parse().unwrap(), 16);
        assert_eq!(network, "1.2.3.0".parse::<IpAddr>().unwrap());
        assert_eq!(mask, 24);

        let (ip, source, scope) = parse_ecs(&message).expect("ECS option should be present");
        assert_eq!(ip, "1.2.3.0".parse::<IpAddr>().unwrap());
        assert_eq!(source, 24);
        assert_eq!(scope, 16);
    }

    #[test]
    fn test_set_ecs_truncates_address() {
        let mut message = create_test_query();

        let (network, mask) = set_ecs(&mut message, "1.2.3.77".parse().unwrap(), 0);
        assert_eq!(network, "1.2.3.0".parse::<IpAddr>().unwrap());
        assert_eq!(mask, 24);
    }

    #[test]
    fn test_set_ecs_v6() {
        let mut message = create_test_query();

        let (network, mask) = set_ecs(&mut message, "2001:db8::1".parse().unwrap(), 0);
        assert_eq!(mask, 56);
        assert_eq!(network, "2001:db8::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_strip_ecs() {
        let mut message = create_test_query();
        set_ecs(&mut message, "1.2.3.0".parse().unwrap(), 0);
        assert!(has_ecs(&message));

        strip_ecs(&mut message);
        assert!(!has_ecs(&message));
        // The OPT record itself survives
        assert!(message.extensions().is_some());
    }

    #[test]
    fn test_mask_ip() {
        let ip: IpAddr = "1.2.3.77".parse().unwrap();
        assert_eq!(mask_ip(ip, 24), "1.2.3.0".parse::<IpAddr>().unwrap());
        assert_eq!(mask_ip(ip, 16), "1.2.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(mask_ip(ip, 0), "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(mask_ip(ip, 32), ip);

        let ip6: IpAddr = "2001:db8:1:2:3:4:5:6".parse().unwrap();
        assert_eq!(mask_ip(ip6, 56), "2001:db8:1:200::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_is_public_ip() {
        assert!(is_public_ip("8.8.8.8".parse().unwrap()));
        assert!(is_public_ip("2001:4860:4860::8888".parse().unwrap()));

        assert!(!is_public_ip("127.0.0.1".parse().unwrap()));
        assert!(!is_public_ip("10.1.2.3".parse().unwrap()));
        assert!(!is_public_ip("192.168.0.1".parse().unwrap()));
        assert!(!is_public_ip("169.254.0.1".parse().unwrap()));
        assert!(!is_public_ip("0.0.0.0".parse().unwrap()));
        assert!(!is_public_ip("::1".parse().unwrap()));
        assert!(!is_public_ip("fe80::1".parse().unwrap()));
        assert!(!is_public_ip("fd00::1".parse().unwrap()));
    }
}

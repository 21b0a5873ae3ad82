//! Cursor-driven address allocation.
//!
//! Addresses are a pure function of (subnet, cursor): the cursor is the host
//! offset from the subnet's network address. The cursor itself lives in the
//! settings record and only ever advances, so no collision scanning against
//! live peers or deleted records is needed here.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("subnet {subnet} exhausted at cursor {cursor}")]
    AddressSpaceExhausted { subnet: String, cursor: u32 },
}

/// Compute the IPv4 address at `cursor` host offsets into `subnet`.
///
/// The last address (broadcast) is never issued; reaching it is an
/// exhaustion error, not a wrap.
pub fn next_ipv4(subnet: Ipv4Network, cursor: u32) -> Result<Ipv4Addr, AllocError> {
    let hosts = 1u64 << (32 - subnet.prefix());
    if u64::from(cursor) >= hosts - 1 {
        return Err(AllocError::AddressSpaceExhausted {
            subnet: subnet.to_string(),
            cursor,
        });
    }
    Ok(Ipv4Addr::from(u32::from(subnet.network()) + cursor))
}

/// Compute the IPv6 address at `cursor` host offsets into `subnet`.
///
/// Callers only invoke this when IPv6 is enabled and a subnet is configured;
/// the same cursor drives both families so the v4 and v6 host offsets match.
pub fn next_ipv6(subnet: Ipv6Network, cursor: u32) -> Result<Ipv6Addr, AllocError> {
    let host_bits = 128 - subnet.prefix();
    if host_bits < 64 {
        let hosts = 1u128 << host_bits;
        if u128::from(cursor) >= hosts - 1 {
            return Err(AllocError::AddressSpaceExhausted {
                subnet: subnet.to_string(),
                cursor,
            });
        }
    }
    Ok(Ipv6Addr::from(u128::from(subnet.network()) + u128::from(cursor)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn v4(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn v6(s: &str) -> Ipv6Network {
        s.parse().unwrap()
    }

    #[test_case("10.0.0.0/24", 2, "10.0.0.2" ; "first client offset")]
    #[test_case("10.0.0.0/24", 254, "10.0.0.254" ; "last usable host")]
    #[test_case("10.0.0.0/16", 256, "10.0.1.0" ; "offset crosses octet boundary")]
    #[test_case("192.168.100.0/28", 14, "192.168.100.14" ; "small subnet last host")]
    fn ipv4_offsets(subnet: &str, cursor: u32, expected: &str) {
        let addr = next_ipv4(v4(subnet), cursor).unwrap();
        assert_eq!(addr, expected.parse::<Ipv4Addr>().unwrap());
    }

    #[test_case("10.0.0.0/24", 255 ; "broadcast offset")]
    #[test_case("10.0.0.0/24", 300 ; "past broadcast")]
    #[test_case("192.168.100.0/28", 15 ; "small subnet broadcast")]
    fn ipv4_exhaustion(subnet: &str, cursor: u32) {
        let err = next_ipv4(v4(subnet), cursor).unwrap_err();
        assert!(matches!(err, AllocError::AddressSpaceExhausted { .. }));
    }

    #[test]
    fn ipv4_sequence_is_distinct_and_monotonic() {
        let subnet = v4("10.0.0.0/24");
        let addrs: Vec<Ipv4Addr> = (2..10).map(|c| next_ipv4(subnet, c).unwrap()).collect();
        for window in addrs.windows(2) {
            assert!(window[1] > window[0]);
        }
    }

    #[test_case("fd00::/64", 2, "fd00::2" ; "first client offset")]
    #[test_case("fd00:1234::/64", 258, "fd00:1234::102" ; "larger offset")]
    fn ipv6_offsets(subnet: &str, cursor: u32, expected: &str) {
        let addr = next_ipv6(v6(subnet), cursor).unwrap();
        assert_eq!(addr, expected.parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn ipv6_exhaustion_on_tiny_subnet() {
        let err = next_ipv6(v6("fd00::/126"), 3).unwrap_err();
        assert!(matches!(err, AllocError::AddressSpaceExhausted { .. }));
        assert!(next_ipv6(v6("fd00::/126"), 2).is_ok());
    }
}

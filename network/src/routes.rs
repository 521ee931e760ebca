//! Classless static route encoding (RFC 3442, DHCP option 121).
//!
//! Each route is serialized as `[prefix length][significant destination
//! octets][gateway octets]`. For example `10.0.0.0/8 via 10.1.2.3` and
//! `192.168.1.0/24 via 192.168.2.3` encode as
//! `[8, 10, 10, 1, 2, 3, 24, 192, 168, 1, 192, 168, 2, 3]`.

use cvmm_core::RouteEntry;
use std::net::Ipv4Addr;

/// Encode routes for option 121.
///
/// Default routes go last; everything else keeps discovery order.
pub fn encode_classless_routes(routes: &[RouteEntry]) -> Vec<u8> {
    let specific = routes.iter().filter(|r| !r.is_default());
    let defaults = routes.iter().filter(|r| r.is_default());

    let mut encoded = Vec::new();
    for route in specific.chain(defaults) {
        let (destination, prefix) = match route.destination {
            Some(dst) if dst.prefix() > 0 => (dst.network(), dst.prefix()),
            _ => (Ipv4Addr::UNSPECIFIED, 0),
        };
        let significant = usize::from(prefix).div_ceil(8);

        encoded.push(prefix);
        encoded.extend_from_slice(&destination.octets()[..significant]);
        encoded.extend_from_slice(&route.gateway.unwrap_or(Ipv4Addr::UNSPECIFIED).octets());
    }
    encoded
}

/// Whether option 121 carries anything beyond the default gateway.
pub fn has_classless_routes(routes: &[RouteEntry]) -> bool {
    routes.iter().any(|r| !r.is_default())
}

//! Fixed IP range blocklist (§4.3). Hand-rolled range checks rather than a
//! CIDR-parsing dependency: the set is small, fixed at compile time, and
//! never needs to parse an arbitrary string.

use std::net::{Ipv4Addr, Ipv6Addr};

/// IPv4 ranges rejected for outbound fetches: unspecified, private, CGNAT,
/// loopback, link-local, multicast, reserved.
fn ipv4_blocked(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    matches!(o[0], 0) // 0.0.0.0/8
        || o[0] == 10 // 10.0.0.0/8
        || (o[0] == 100 && (o[1] & 0b1100_0000) == 64) // 100.64.0.0/10
        || o[0] == 127 // 127.0.0.0/8
        || (o[0] == 169 && o[1] == 254) // 169.254.0.0/16
        || (o[0] == 172 && (16..=31).contains(&o[1])) // 172.16.0.0/12
        || (o[0] == 192 && o[1] == 168) // 192.168.0.0/16
        || o[0] >= 224 // 224.0.0.0/4 and 240.0.0.0/4 cover the rest of the space
}

/// IPv6 ranges rejected: loopback, unique-local, link-local, and any
/// IPv4-mapped address whose embedded IPv4 is itself blocked.
fn ipv6_blocked(ip: Ipv6Addr) -> bool {
    if ip == Ipv6Addr::LOCALHOST {
        return true; // ::1/128
    }
    let seg = ip.segments();
    if (seg[0] & 0xfe00) == 0xfc00 {
        return true; // fc00::/7
    }
    if (seg[0] & 0xffc0) == 0xfe80 {
        return true; // fe80::/10
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return ipv4_blocked(v4); // ::ffff:0:0/96
    }
    false
}

pub fn is_blocked(ip: std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => ipv4_blocked(v4),
        std::net::IpAddr::V6(v6) => ipv6_blocked(v6),
    }
}

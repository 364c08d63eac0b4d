//! Well-known mesh address space.
//!
//! The overlay assigns every node an IPv4 address out of the CGNAT block and
//! an IPv6 address out of a fixed ULA /48. A reserved per-family service IP
//! exposes in-process services (principally the mesh DNS resolver), and a
//! dedicated /64 inside the ULA encodes IPv4 destinations for subnet routing
//! across IPv6-only paths ("4-in-6").

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

/// IPv4 service IP: in-process services (mesh DNS) listen here.
pub const SERVICE_IP: Ipv4Addr = Ipv4Addr::new(100, 100, 100, 100);

/// IPv6 service IP, the v6 twin of [`SERVICE_IP`].
pub const SERVICE_IP_V6: Ipv6Addr = Ipv6Addr::new(0xfd7a, 0x115c, 0xa1e0, 0, 0, 0, 0, 0x53);

/// The all-ones IPv4 broadcast address. The stack may expose it as a NIC
/// address; it is never ours to install or remove.
pub const BROADCAST_V4: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Reports whether `ip` is a service IP (either family).
#[inline]
pub fn is_service_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == SERVICE_IP,
        IpAddr::V6(v6) => v6 == SERVICE_IP_V6,
    }
}

/// Reports whether `ip` belongs to the mesh address space: the CGNAT block
/// 100.64.0.0/10 for IPv4 or the overlay ULA fd7a:115c:a1e0::/48 for IPv6.
///
/// This is about the address *space*, not about this node: a peer's mesh IP
/// matches even though it is not assigned here.
#[inline]
pub fn is_mesh_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => in_cgnat_range(v4),
        IpAddr::V6(v6) => in_mesh_ula(v6),
    }
}

/// 100.64.0.0/10 membership.
#[inline]
pub fn in_cgnat_range(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 100 && (o[1] & 0xc0) == 0x40
}

/// fd7a:115c:a1e0::/48 membership.
#[inline]
pub fn in_mesh_ula(ip: Ipv6Addr) -> bool {
    let s = ip.segments();
    s[0] == 0xfd7a && s[1] == 0x115c && s[2] == 0xa1e0
}

/// fd7a:115c:a1e0:b1a::/64 membership: the 4-in-6 translation range. The low
/// 32 bits of an address in this range carry an embedded IPv4 destination.
#[inline]
pub fn in_via_range(ip: Ipv6Addr) -> bool {
    let s = ip.segments();
    s[0] == 0xfd7a && s[1] == 0x115c && s[2] == 0xa1e0 && s[3] == 0x0b1a
}

/// Extracts the IPv4 destination embedded in a via-range address.
///
/// The caller is expected to have checked [`in_via_range`]; for any other
/// address this simply returns its low 32 bits.
#[inline]
pub fn unmap_via(ip: Ipv6Addr) -> Ipv4Addr {
    let o = ip.octets();
    Ipv4Addr::new(o[12], o[13], o[14], o[15])
}

/// An immutable set of prefixes answering "is this address assigned to this
/// node". Built once per network-map update and swapped in wholesale so
/// concurrent classifier lookups always see a consistent set.
#[derive(Debug, Default)]
pub struct LocalIpFilter {
    prefixes: Vec<IpNet>,
}

impl LocalIpFilter {
    pub fn new(prefixes: Vec<IpNet>) -> Self {
        Self { prefixes }
    }

    /// A filter matching nothing, used before the first network map arrives.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.prefixes.iter().any(|p| p.contains(&ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgnat_range_membership() {
        assert!(in_cgnat_range(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(in_cgnat_range(Ipv4Addr::new(100, 127, 255, 254)));
        assert!(in_cgnat_range(SERVICE_IP));
        assert!(!in_cgnat_range(Ipv4Addr::new(100, 63, 255, 255)));
        assert!(!in_cgnat_range(Ipv4Addr::new(100, 128, 0, 0)));
        assert!(!in_cgnat_range(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn mesh_ula_contains_service_and_via() {
        assert!(in_mesh_ula(SERVICE_IP_V6));
        let via: Ipv6Addr = "fd7a:115c:a1e0:b1a::501:102:304".parse().unwrap();
        assert!(in_mesh_ula(via));
        assert!(in_via_range(via));
        assert!(!in_via_range(SERVICE_IP_V6));
        assert!(!in_mesh_ula("fd00::1".parse().unwrap()));
    }

    #[test]
    fn via_unmap_extracts_low_bits() {
        let via: Ipv6Addr = "fd7a:115c:a1e0:b1a::5:0102:0304".parse().unwrap();
        assert_eq!(unmap_via(via), Ipv4Addr::new(1, 2, 3, 4));
        let via: Ipv6Addr = "fd7a:115c:a1e0:b1a::a00:5".parse().unwrap();
        assert_eq!(unmap_via(via), Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn filter_matches_host_and_prefix_entries() {
        let filter = LocalIpFilter::new(vec![
            "100.64.0.2/32".parse().unwrap(),
            "fd7a:115c:a1e0:ab12::1/128".parse().unwrap(),
        ]);
        assert!(filter.contains("100.64.0.2".parse().unwrap()));
        assert!(!filter.contains("100.64.0.3".parse().unwrap()));
        assert!(filter.contains("fd7a:115c:a1e0:ab12::1".parse().unwrap()));
        assert!(!filter.contains("fd7a:115c:a1e0:ab12::2".parse().unwrap()));
        assert!(!LocalIpFilter::empty().contains("100.64.0.2".parse().unwrap()));
    }
}

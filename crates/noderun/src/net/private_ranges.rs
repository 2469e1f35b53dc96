use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Whether `ip` must not be reachable from sandboxed code under the
/// public-only policy.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or_else(|| is_private_v6(v6), is_private_v4),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    ip.is_unique_local()
        || ip.is_loopback()
        || ip.is_unicast_link_local()
        || ip.is_multicast()
        || ip.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private(addr: &str) -> bool {
        is_private_ip(addr.parse().unwrap())
    }

    #[test]
    fn ipv4_ranges() {
        for addr in ["10.1.2.3", "127.0.0.1", "169.254.1.1", "192.168.0.10", "0.0.0.0", "100.64.0.1", "224.0.0.1"] {
            assert!(private(addr), "{addr}");
        }
        for addr in ["93.184.216.34", "8.8.8.8", "100.128.0.1"] {
            assert!(!private(addr), "{addr}");
        }
    }

    #[test]
    fn ipv4_mapped_ipv6_follows_ipv4_rules() {
        assert!(private("::ffff:127.0.0.1"));
        assert!(private("::ffff:10.0.0.1"));
        assert!(!private("::ffff:93.184.216.34"));
    }

    #[test]
    fn ipv6_ranges() {
        for addr in ["::1", "::", "fe80::1", "fd00::1", "ff02::1"] {
            assert!(private(addr), "{addr}");
        }
        assert!(!private("2606:4700::1"));
    }
}

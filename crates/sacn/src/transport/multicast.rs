// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast group derivation and interface discovery.
//!
//! Every universe owns one multicast group per IP family; discovery traffic
//! uses a reserved pair. Named interfaces are resolved to addresses (IPv4
//! joins) and indices (IPv6 joins) via the host's interface table.

use crate::error::{Error, Result};
use crate::protocol::constants::SACN_PORT;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// IP family of a socket or datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

/// Which IP families an instance binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpMode {
    #[default]
    Ipv4Only,
    Ipv6Only,
    Ipv4And6,
}

impl IpMode {
    pub fn includes_v4(self) -> bool {
        matches!(self, IpMode::Ipv4Only | IpMode::Ipv4And6)
    }

    pub fn includes_v6(self) -> bool {
        matches!(self, IpMode::Ipv6Only | IpMode::Ipv4And6)
    }

    pub(crate) fn families(self) -> &'static [IpFamily] {
        match self {
            IpMode::Ipv4Only => &[IpFamily::V4],
            IpMode::Ipv6Only => &[IpFamily::V6],
            IpMode::Ipv4And6 => &[IpFamily::V4, IpFamily::V6],
        }
    }
}

/// IPv4 data group for a universe: 239.255.hi.lo.
pub fn universe_group_v4(universe: u16) -> Ipv4Addr {
    Ipv4Addr::new(239, 255, (universe >> 8) as u8, (universe & 0xff) as u8)
}

/// IPv6 data group for a universe: ff18::83:0:hi:lo.
pub fn universe_group_v6(universe: u16) -> Ipv6Addr {
    Ipv6Addr::new(0xff18, 0, 0, 0, 0x83, 0, universe >> 8, universe & 0xff)
}

/// IPv4 universe discovery group (universe 64214).
pub fn discovery_group_v4() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 250, 214)
}

/// IPv6 universe discovery group.
pub fn discovery_group_v6() -> Ipv6Addr {
    Ipv6Addr::new(0xff18, 0, 0, 0, 0x83, 0, 0xfa, 0xd6)
}

/// Group + sACN port as a send destination.
pub fn group_addr(universe: u16, family: IpFamily) -> SocketAddr {
    let ip = match family {
        IpFamily::V4 => IpAddr::V4(universe_group_v4(universe)),
        IpFamily::V6 => IpAddr::V6(universe_group_v6(universe)),
    };
    SocketAddr::new(ip, SACN_PORT)
}

/// Discovery group + sACN port as a send destination.
pub fn discovery_addr(family: IpFamily) -> SocketAddr {
    let ip = match family {
        IpFamily::V4 => IpAddr::V4(discovery_group_v4()),
        IpFamily::V6 => IpAddr::V6(discovery_group_v6()),
    };
    SocketAddr::new(ip, SACN_PORT)
}

/// A named interface resolved against the host's interface table.
#[derive(Debug, Clone)]
pub struct ResolvedInterface {
    pub name: String,
    /// First IPv4 address, used for `IP_ADD_MEMBERSHIP` / `IP_MULTICAST_IF`.
    pub v4: Option<Ipv4Addr>,
    /// Interface index, used for IPv6 joins. 0 when the name does not resolve.
    pub index: u32,
}

/// Resolve an interface name to its IPv4 address and index.
///
/// Interface enumeration mimics the portable path: the `local-ip-address`
/// table for addresses, `if_nametoindex` for the v6 index.
pub fn resolve_interface(name: &str) -> Result<ResolvedInterface> {
    let table = local_ip_address::list_afinet_netifas()
        .map_err(|e| {
            log::debug!("[UDP] failed to list interfaces: {}", e);
            Error::UnknownInterface(name.to_string())
        })?;

    let mut v4 = None;
    let mut seen = false;
    for (if_name, ip) in &table {
        if if_name != name {
            continue;
        }
        seen = true;
        if let IpAddr::V4(addr) = ip {
            if v4.is_none() {
                v4 = Some(*addr);
            }
        }
    }
    if !seen {
        return Err(Error::UnknownInterface(name.to_string()));
    }

    Ok(ResolvedInterface {
        name: name.to_string(),
        v4,
        index: interface_index(name),
    })
}

/// OS interface index for `name`, 0 if unknown.
pub fn interface_index(name: &str) -> u32 {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return 0;
    };
    // SAFETY: if_nametoindex only reads the NUL-terminated name.
    unsafe { libc::if_nametoindex(cname.as_ptr()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_universe_group_v4() {
        assert_eq!(universe_group_v4(1), Ipv4Addr::new(239, 255, 0, 1));
        assert_eq!(universe_group_v4(256), Ipv4Addr::new(239, 255, 1, 0));
        assert_eq!(universe_group_v4(63999), Ipv4Addr::new(239, 255, 249, 255));
    }

    #[test]
    fn test_discovery_group_matches_reserved_universe() {
        // 64214 through the universe formula lands on the discovery group.
        assert_eq!(universe_group_v4(64214), discovery_group_v4());
        assert_eq!(universe_group_v6(64214), discovery_group_v6());
    }

    #[test]
    fn test_universe_group_v6() {
        let group = universe_group_v6(0x1234);
        assert_eq!(group.segments(), [0xff18, 0, 0, 0, 0x83, 0, 0x12, 0x34]);
    }

    #[test]
    fn test_group_addr_port() {
        assert_eq!(group_addr(7, IpFamily::V4).port(), 5568);
        assert_eq!(discovery_addr(IpFamily::V6).port(), 5568);
    }

    #[test]
    fn test_unknown_interface_rejected() {
        assert!(matches!(
            resolve_interface("definitely-not-an-interface-0"),
            Err(Error::UnknownInterface(_))
        ));
    }

    #[test]
    fn test_ip_mode_families() {
        assert_eq!(IpMode::Ipv4Only.families(), &[IpFamily::V4]);
        assert_eq!(IpMode::Ipv4And6.families().len(), 2);
        assert!(IpMode::Ipv6Only.includes_v6());
        assert!(!IpMode::Ipv6Only.includes_v4());
    }
}

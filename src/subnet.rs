//! Subnet reservation for DHCP-enabled test networks.

use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::{Result, bail};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// Hands out non-overlapping subnets from two monotonic ranges, one per
/// address family.
///
/// Freed blocks are reused in LIFO order before the cursor advances. The pool
/// is owned by the scheduler task and is not shared.
#[derive(Debug)]
pub struct SubnetPool {
    next_v4: Ipv4Net,
    next_v6: Ipv6Net,
    freed: Vec<IpNet>,
}

impl SubnetPool {
    pub fn new(first_v4: Ipv4Net, first_v6: Ipv6Net) -> Self {
        Self {
            next_v4: first_v4,
            next_v6: first_v6,
            freed: Vec::new(),
        }
    }

    /// Reserve the next free subnet of the requested family.
    ///
    /// Returns the most recently freed block if one exists, otherwise the
    /// current cursor value, advancing the cursor by one subnet of the same
    /// prefix length. Fails when the cursor would leave the address family.
    pub fn reserve_next(&mut self, ipv6: bool) -> Result<IpNet> {
        if let Some(pos) = self
            .freed
            .iter()
            .rposition(|net| matches!(net, IpNet::V6(_)) == ipv6)
        {
            return Ok(self.freed.remove(pos));
        }

        if ipv6 {
            let current = self.next_v6;
            self.next_v6 = next_v6_subnet(current)?;
            Ok(IpNet::V6(current))
        } else {
            let current = self.next_v4;
            self.next_v4 = next_v4_subnet(current)?;
            Ok(IpNet::V4(current))
        }
    }

    /// Return a previously reserved subnet for reuse.
    pub fn free(&mut self, net: IpNet) {
        self.freed.push(net);
    }
}

fn next_v4_subnet(net: Ipv4Net) -> Result<Ipv4Net> {
    let size = 1u64 << (32 - net.prefix_len());
    let base = u64::from(u32::from(net.network())) + size;
    if base + size - 1 > u64::from(u32::MAX) {
        bail!("IPv4 subnets after {net} exhausted");
    }
    Ok(Ipv4Net::new(Ipv4Addr::from(base as u32), net.prefix_len())?)
}

fn next_v6_subnet(net: Ipv6Net) -> Result<Ipv6Net> {
    let size = 1u128 << (128 - net.prefix_len());
    let Some(base) = u128::from(net.network()).checked_add(size) else {
        bail!("IPv6 subnets after {net} exhausted");
    };
    Ok(Ipv6Net::new(Ipv6Addr::from(base), net.prefix_len())?)
}

/// The gateway address of a subnet (first host) with the subnet's prefix
/// length, as passed to `--network-cidr`.
pub fn gateway_cidr(net: &IpNet) -> String {
    match net {
        IpNet::V4(v4) => {
            let gateway = Ipv4Addr::from(u32::from(v4.network()) + 1);
            format!("{}/{}", gateway, v4.prefix_len())
        }
        IpNet::V6(v6) => {
            let gateway = Ipv6Addr::from(u128::from(v6.network()) + 1);
            format!("{}/{}", gateway, v6.prefix_len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SubnetPool {
        SubnetPool::new(
            "10.224.0.0/24".parse().expect("v4 base"),
            "fd62:a80c:412::/64".parse().expect("v6 base"),
        )
    }

    #[test]
    fn reserves_monotonically_then_reuses_freed() {
        let mut pool = pool();
        let first = pool.reserve_next(false).expect("first");
        let second = pool.reserve_next(false).expect("second");
        let third = pool.reserve_next(false).expect("third");
        let fourth = pool.reserve_next(true).expect("fourth");
        let fifth = pool.reserve_next(true).expect("fifth");
        assert_eq!(first.to_string(), "10.224.0.0/24");
        assert_eq!(second.to_string(), "10.224.1.0/24");
        assert_eq!(third.to_string(), "10.224.2.0/24");
        assert_eq!(fourth.to_string(), "fd62:a80c:412::/64");
        assert_eq!(fifth.to_string(), "fd62:a80c:412:1::/64");

        pool.free(second);
        pool.free(fourth);
        assert_eq!(
            pool.reserve_next(false).expect("reuse v4").to_string(),
            "10.224.1.0/24"
        );
        assert_eq!(
            pool.reserve_next(false).expect("advance v4").to_string(),
            "10.224.3.0/24"
        );
        assert_eq!(
            pool.reserve_next(true).expect("reuse v6").to_string(),
            "fd62:a80c:412::/64"
        );
    }

    #[test]
    fn freed_blocks_are_reused_lifo() {
        let mut pool = pool();
        let first = pool.reserve_next(false).expect("first");
        let second = pool.reserve_next(false).expect("second");
        pool.free(first);
        pool.free(second);
        assert_eq!(
            pool.reserve_next(false).expect("reuse").to_string(),
            "10.224.1.0/24"
        );
        assert_eq!(
            pool.reserve_next(false).expect("reuse").to_string(),
            "10.224.0.0/24"
        );
    }

    #[test]
    fn v4_exhaustion_fails() {
        // reservation fails once the cursor cannot advance past the handed-out block
        let mut pool = SubnetPool::new(
            "255.255.254.0/24".parse().expect("v4 base"),
            "fd62::/64".parse().expect("v6 base"),
        );
        assert_eq!(
            pool.reserve_next(false).expect("penultimate subnet").to_string(),
            "255.255.254.0/24"
        );
        assert!(pool.reserve_next(false).is_err());
    }

    #[test]
    fn gateway_is_first_host() {
        let net: IpNet = "10.224.1.0/24".parse().expect("net");
        assert_eq!(gateway_cidr(&net), "10.224.1.1/24");
        let net: IpNet = "fd62:a80c:412::/64".parse().expect("net");
        assert_eq!(gateway_cidr(&net), "fd62:a80c:412::1/64");
    }
}

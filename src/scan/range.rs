use crate::error::{EngineError, EngineResult};
use ipnet::{IpAddrRange, IpNet, Ipv4AddrRange, Ipv6AddrRange};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Hard cap on how many addresses one scan expands to
pub const MAX_SCAN_ADDRESSES: u64 = 65_536;

/// A CIDR block or a single address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    net: IpNet,
}

impl AddressRange {
    /// Parse `10.0.0.0/24`, `fd00::/120` or a bare address.
    pub fn parse(input: &str) -> EngineResult<Self> {
        let input = input.trim();
        let invalid = |why: &dyn fmt::Display| {
            EngineError::Resource(format!("Invalid address range '{}': {}", input, why))
        };

        let net = match IpNet::from_str(input) {
            Ok(net) => net.trunc(),
            Err(e) => {
                let addr = IpAddr::from_str(input).map_err(|_| invalid(&e))?;
                let full = if addr.is_ipv4() { 32 } else { 128 };
                IpNet::new(addr, full).map_err(|e| invalid(&e))?
            }
        };
        Ok(Self { net })
    }

    pub fn network(&self) -> IpAddr {
        self.net.network()
    }

    pub fn prefix(&self) -> u8 {
        self.net.prefix_len()
    }

    /// Addresses in the block, including network and broadcast addresses.
    /// Saturates at `u128::MAX` for a `/0` IPv6 block.
    pub fn address_count(&self) -> u128 {
        let host_bits = u32::from(self.net.max_prefix_len() - self.net.prefix_len());
        1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
    }

    /// Addresses a scan visits: the block in order, cut at `MAX_SCAN_ADDRESSES`.
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> {
        let span = match self.net {
            IpNet::V4(net) => IpAddrRange::from(Ipv4AddrRange::new(net.network(), net.broadcast())),
            IpNet::V6(net) => IpAddrRange::from(Ipv6AddrRange::new(net.network(), net.broadcast())),
        };
        span.take(MAX_SCAN_ADDRESSES as usize)
    }

    /// Probes a scan of `port_count` ports would need, before the cap.
    pub fn probe_estimate(&self, port_count: usize) -> u128 {
        self.address_count().saturating_mul(port_count as u128)
    }
}

impl FromStr for AddressRange {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slash_30_has_four_addresses() {
        let range = AddressRange::parse("10.0.0.0/30").unwrap();
        assert_eq!(range.address_count(), 4);
        let addrs: Vec<_> = range.addresses().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_host_bits_are_masked() {
        let range = AddressRange::parse("192.168.1.77/24").unwrap();
        assert_eq!(range.to_string(), "192.168.1.0/24");
        assert_eq!(range.address_count(), 256);
    }

    #[test]
    fn test_single_address() {
        let range = AddressRange::parse("10.1.2.3").unwrap();
        assert_eq!(range.prefix(), 32);
        assert_eq!(range.addresses().count(), 1);

        let v6 = AddressRange::parse("fd00::1").unwrap();
        assert_eq!(v6.address_count(), 1);
    }

    #[test]
    fn test_expansion_is_capped() {
        let range = AddressRange::parse("10.0.0.0/8").unwrap();
        assert_eq!(range.address_count(), 1 << 24);
        assert_eq!(range.addresses().count() as u64, MAX_SCAN_ADDRESSES);
        assert_eq!(range.probe_estimate(2), 2 << 24);
    }

    #[test]
    fn test_ipv6_block() {
        let range = AddressRange::parse("fd00::/126").unwrap();
        let addrs: Vec<_> = range.addresses().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["fd00::", "fd00::1", "fd00::2", "fd00::3"]);
        assert_eq!(AddressRange::parse("::/0").unwrap().address_count(), u128::MAX);
    }

    #[test]
    fn test_malformed_ranges() {
        for bad in ["", "10.0.0.0/33", "10.0.0/24", "fd00::/129", "host.example", "10.0.0.0/x"] {
            let err = AddressRange::parse(bad).unwrap_err();
            assert_eq!(err.code(), "RESOURCE_ERROR", "{}", bad);
        }
    }
}

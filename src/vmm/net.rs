use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use rand::Rng;

use crate::error::{Error, Result};

const ALLOCATE_MAX_ATTEMPTS: usize = 128;

#[derive(Clone)]
pub struct IpRange {
    pub cidr: String,
    pub net: u32,
    pub mask: u32,
}

impl IpRange {
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        let cidr = cidr.to_string();

        let parts = cidr.split('/').collect::<Vec<&str>>();
        if parts.len() != 2 {
            return Err(Error::invalid_request(format!("invalid CIDR: {}", cidr)));
        }

        let net_parts = parts[0].split('.').collect::<Vec<&str>>();
        if net_parts.len() != 4 {
            return Err(Error::invalid_request(format!("invalid CIDR: {}", cidr)));
        }

        let mut net = 0u32;
        for part in net_parts {
            let part = part
                .parse::<u8>()
                .map_err(|_| Error::invalid_request(format!("invalid CIDR: {}", cidr)))?;
            net = (net << 8) | part as u32;
        }

        let mask = parts[1]
            .parse::<u32>()
            .map_err(|_| Error::invalid_request(format!("invalid CIDR: {}", cidr)))?;
        if mask == 0 || mask > 30 {
            return Err(Error::invalid_request(format!("invalid CIDR: {}", cidr)));
        }

        let mask = 0xffffffffu32 << (32 - mask);

        Ok(IpRange { cidr, net, mask })
    }

    pub fn random(&self) -> Ipv4Addr {
        let mut rng = rand::rng();
        let mut ip = self.net;
        ip = (ip & self.mask) | (rng.random_range(0..=u32::MAX) & !self.mask);
        Ipv4Addr::from(ip)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from((self.net & self.mask) + 1)
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask)
    }

    fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.net & self.mask)
    }

    fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from((self.net & self.mask) | !self.mask)
    }
}

/// Hands out guest addresses from one range, unique among live machines.
pub struct IpAllocator {
    range: IpRange,
    reserved: Mutex<HashSet<Ipv4Addr>>,
}

impl IpAllocator {
    pub fn new(range: IpRange) -> Self {
        Self {
            range,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn range(&self) -> &IpRange {
        &self.range
    }

    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let mut reserved = self.reserved.lock().expect("ip allocator lock poisoned");

        for _ in 0..ALLOCATE_MAX_ATTEMPTS {
            let ip = self.range.random();
            if ip == self.range.network()
                || ip == self.range.gateway()
                || ip == self.range.broadcast()
            {
                continue;
            }
            if reserved.insert(ip) {
                return Ok(ip);
            }
        }

        Err(Error::runtime_start(format!(
            "no free guest address in {}",
            self.range.cidr
        )))
    }

    pub fn release(&self, ip: Ipv4Addr) {
        let mut reserved = self.reserved.lock().expect("ip allocator lock poisoned");
        reserved.remove(&ip);
    }
}

/// Deterministic locally-administered MAC for a guest address.
pub fn mac_for_ip(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!(
        "06:00:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let cidr = "10.0.0.0/16";
        let range = IpRange::from_cidr(cidr).unwrap();
        assert_eq!(range.net, 0x0a000000);
        assert_eq!(range.mask, 0xffff0000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(IpRange::from_cidr("10.0.0.0").is_err());
        assert!(IpRange::from_cidr("10.0.0/24").is_err());
        assert!(IpRange::from_cidr("10.0.0.0/33").is_err());
        assert!(IpRange::from_cidr("300.0.0.0/24").is_err());
    }

    #[test]
    fn test_random_stays_in_range() {
        let range = IpRange::from_cidr("10.0.0.0/16").unwrap();
        for _ in 0..32 {
            let ip = range.random();
            assert!(ip.is_private());
            assert_eq!(u32::from(ip) & range.mask, range.net & range.mask);
        }
    }

    #[test]
    fn test_gateway_and_netmask() {
        let range = IpRange::from_cidr("10.0.0.0/16").unwrap();
        assert_eq!(range.gateway(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(range.netmask(), Ipv4Addr::new(255, 255, 0, 0));
    }

    #[test]
    fn test_allocator_unique_until_released() {
        let allocator = IpAllocator::new(IpRange::from_cidr("192.168.50.0/29").unwrap());

        // 5 usable addresses in a /29 after network, gateway, broadcast.
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let ip = allocator.allocate().expect("allocation failed");
            assert!(seen.insert(ip));
        }
        assert!(allocator.allocate().is_err());

        let ip = *seen.iter().next().unwrap();
        allocator.release(ip);
        assert_eq!(allocator.allocate().expect("allocation failed"), ip);
    }

    #[test]
    fn test_mac_for_ip() {
        let mac = mac_for_ip(Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(mac, "06:00:ac:10:00:02");
    }
}

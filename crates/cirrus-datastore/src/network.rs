//! Tenant address allocation.
//!
//! Tenants get addresses from `172.16.0.0 - 172.31.255.255`, carved into
//! `/24` subnets. A subnet is identified by the big-endian `u16` of the
//! second and third octets, so the range is `0x1000..=0x1FFF`. Each subnet
//! belongs to exactly one tenant for the life of the process; hosts 0, 1 and
//! 255 are never handed out.
//!
//! The types here are plain data. Callers serialize access by holding the
//! tenant map write lock for the whole allocation.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use crate::error::{DatastoreError, DatastoreResult};

pub const ADDRESS_PREFIX: u8 = 172;
pub const FIRST_SUBNET: u16 = 0x1000;
pub const LAST_SUBNET: u16 = 0x1FFF;
pub const FIRST_HOST: u8 = 2;
pub const LAST_HOST: u8 = 254;
pub const HOSTS_PER_SUBNET: u32 = (LAST_HOST - FIRST_HOST + 1) as u32;

/// Claimed hosts of one subnet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct HostMap {
    bits: [u64; 4],
    count: u32,
}

impl HostMap {
    fn contains(&self, host: u8) -> bool {
        self.bits[usize::from(host / 64)] & (1 << (host % 64)) != 0
    }

    fn insert(&mut self, host: u8) -> bool {
        if self.contains(host) {
            return false;
        }
        self.bits[usize::from(host / 64)] |= 1 << (host % 64);
        self.count += 1;
        true
    }

    fn remove(&mut self, host: u8) -> bool {
        if !self.contains(host) {
            return false;
        }
        self.bits[usize::from(host / 64)] &= !(1 << (host % 64));
        self.count -= 1;
        true
    }

    fn is_full(&self) -> bool {
        self.count >= HOSTS_PER_SUBNET
    }

    fn first_free(&self) -> Option<u8> {
        (FIRST_HOST..=LAST_HOST).find(|&host| !self.contains(host))
    }
}

/// Subnets owned by any tenant in this process.
#[derive(Debug, Default)]
pub struct SubnetPool {
    claimed: BTreeSet<u16>,
}

impl SubnetPool {
    /// Mark a subnet as owned, e.g. while loading claims from the store.
    pub fn reserve(&mut self, subnet: u16) {
        self.claimed.insert(subnet);
    }

    /// Claim the lowest free subnet.
    fn claim_next(&mut self) -> DatastoreResult<u16> {
        let subnet = (FIRST_SUBNET..=LAST_SUBNET)
            .find(|subnet| !self.claimed.contains(subnet))
            .ok_or(DatastoreError::OutOfSubnets)?;
        self.claimed.insert(subnet);
        Ok(subnet)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

/// Address table of one tenant: owned subnets and their claimed hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantNetwork {
    subnets: BTreeMap<u16, HostMap>,
}

impl TenantNetwork {
    /// Rebuild a table from persisted claims.
    pub fn from_claims(claims: &BTreeMap<u16, BTreeSet<u8>>) -> Self {
        let subnets = claims
            .iter()
            .map(|(&subnet, hosts)| {
                let mut map = HostMap::default();
                for &host in hosts {
                    map.insert(host);
                }
                (subnet, map)
            })
            .collect();
        Self { subnets }
    }

    /// Owned subnets in ascending order.
    pub fn subnets(&self) -> impl Iterator<Item = u16> + '_ {
        self.subnets.keys().copied()
    }

    pub fn is_claimed(&self, subnet: u16, host: u8) -> bool {
        self.subnets
            .get(&subnet)
            .is_some_and(|hosts| hosts.contains(host))
    }

    /// Number of claimed hosts across all owned subnets.
    pub fn claimed(&self) -> usize {
        self.subnets.values().map(|h| h.count as usize).sum()
    }

    /// Claim the first free host, reusing the lowest non-full owned subnet
    /// before taking a new one from `pool`.
    pub fn allocate(&mut self, pool: &mut SubnetPool) -> DatastoreResult<(u16, u8)> {
        let reusable = self
            .subnets
            .iter()
            .find(|(_, hosts)| !hosts.is_full())
            .map(|(&subnet, _)| subnet);
        let subnet = match reusable {
            Some(subnet) => subnet,
            None => pool.claim_next()?,
        };

        let hosts = self.subnets.entry(subnet).or_default();
        let host = hosts
            .first_free()
            .ok_or(DatastoreError::OutOfHosts(subnet))?;
        hosts.insert(host);
        Ok((subnet, host))
    }

    /// Clear a claim. Returns false if the host was not claimed. The subnet
    /// stays owned even when its last host goes.
    pub fn release(&mut self, subnet: u16, host: u8) -> bool {
        self.subnets
            .get_mut(&subnet)
            .is_some_and(|hosts| hosts.remove(host))
    }
}

/// `172.<hi>.<lo>.<host>`
pub fn format_address(subnet: u16, host: u8) -> Ipv4Addr {
    let [hi, lo] = subnet.to_be_bytes();
    Ipv4Addr::new(ADDRESS_PREFIX, hi, lo, host)
}

/// Recover `(subnet, host)` from a tenant address.
pub fn parse_address(address: &str) -> DatastoreResult<(u16, u8)> {
    let ip: Ipv4Addr = address
        .parse()
        .map_err(|_| DatastoreError::InvalidAddress(address.to_string()))?;
    let [prefix, hi, lo, host] = ip.octets();
    let subnet = u16::from_be_bytes([hi, lo]);
    if prefix != ADDRESS_PREFIX || !(FIRST_SUBNET..=LAST_SUBNET).contains(&subnet) {
        return Err(DatastoreError::InvalidAddress(address.to_string()));
    }
    Ok((subnet, host))
}

/// `172.<hi>.<lo>.0/24`
pub fn subnet_cidr(subnet: u16) -> String {
    format!("{}/24", format_address(subnet, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_is_host_two_of_first_subnet() {
        let mut pool = SubnetPool::default();
        let mut network = TenantNetwork::default();

        let (subnet, host) = network.allocate(&mut pool).unwrap();
        assert_eq!((subnet, host), (0x1000, 2));
        assert_eq!(format_address(subnet, host).to_string(), "172.16.0.2");
        assert_eq!(network.allocate(&mut pool).unwrap(), (0x1000, 3));
    }

    #[test]
    fn tenants_never_share_subnets() {
        let mut pool = SubnetPool::default();
        let mut a = TenantNetwork::default();
        let mut b = TenantNetwork::default();

        let (subnet_a, _) = a.allocate(&mut pool).unwrap();
        let (subnet_b, _) = b.allocate(&mut pool).unwrap();
        assert_ne!(subnet_a, subnet_b);
        assert_eq!(subnet_b, 0x1001);
    }

    #[test]
    fn full_subnet_rolls_over() {
        let mut pool = SubnetPool::default();
        let mut network = TenantNetwork::default();

        for expected in FIRST_HOST..=LAST_HOST {
            assert_eq!(network.allocate(&mut pool).unwrap(), (0x1000, expected));
        }
        assert_eq!(network.allocate(&mut pool).unwrap(), (0x1001, 2));
        assert_eq!(network.claimed(), 254);
        assert_eq!(network.subnets().collect::<Vec<_>>(), vec![0x1000, 0x1001]);
    }

    #[test]
    fn released_host_is_reused_first() {
        let mut pool = SubnetPool::default();
        let mut network = TenantNetwork::default();
        for _ in FIRST_HOST..=LAST_HOST {
            network.allocate(&mut pool).unwrap();
        }
        network.allocate(&mut pool).unwrap();

        assert!(network.release(0x1000, 77));
        assert_eq!(network.allocate(&mut pool).unwrap(), (0x1000, 77));
    }

    #[test]
    fn release_twice_is_noop() {
        let mut pool = SubnetPool::default();
        let mut network = TenantNetwork::default();
        let (subnet, host) = network.allocate(&mut pool).unwrap();

        assert!(network.release(subnet, host));
        assert!(!network.release(subnet, host));
        assert!(!network.release(0x1abc, 9));
        assert_eq!(network.claimed(), 0);
        // The emptied subnet is still owned.
        assert_eq!(network.subnets().collect::<Vec<_>>(), vec![subnet]);
    }

    #[test]
    fn subnet_range_exhaustion() {
        let mut pool = SubnetPool::default();
        let count = usize::from(LAST_SUBNET - FIRST_SUBNET) + 1;
        let mut networks: Vec<TenantNetwork> = (0..count).map(|_| TenantNetwork::default()).collect();

        for (i, network) in networks.iter_mut().enumerate() {
            let (subnet, _) = network.allocate(&mut pool).unwrap();
            assert_eq!(usize::from(subnet), usize::from(FIRST_SUBNET) + i);
        }
        assert_eq!(pool.len(), 4096);

        let mut late = TenantNetwork::default();
        assert!(matches!(
            late.allocate(&mut pool),
            Err(DatastoreError::OutOfSubnets)
        ));
        assert!(late.subnets().next().is_none());
    }

    #[test]
    fn restored_claims_are_respected() {
        let mut pool = SubnetPool::default();
        pool.reserve(0x1000);
        let claims = BTreeMap::from([(0x1000, BTreeSet::from([2, 3]))]);
        let mut network = TenantNetwork::from_claims(&claims);

        assert!(network.is_claimed(0x1000, 3));
        assert_eq!(network.allocate(&mut pool).unwrap(), (0x1000, 4));

        let mut other = TenantNetwork::default();
        assert_eq!(other.allocate(&mut pool).unwrap(), (0x1001, 2));
    }

    #[test]
    fn parse_address_round_trip_and_errors() {
        assert_eq!(parse_address("172.16.0.2").unwrap(), (0x1000, 2));
        assert_eq!(parse_address("172.31.255.254").unwrap(), (0x1fff, 254));
        assert!(matches!(
            parse_address("not-an-ip"),
            Err(DatastoreError::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_address("10.16.0.2"),
            Err(DatastoreError::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_address("172.15.0.2"),
            Err(DatastoreError::InvalidAddress(_))
        ));
    }

    #[test]
    fn cidr_rendering() {
        assert_eq!(subnet_cidr(0x1000), "172.16.0.0/24");
        assert_eq!(subnet_cidr(0x1f0a), "172.31.10.0/24");
    }
}

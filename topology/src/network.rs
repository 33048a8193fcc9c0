// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Subnet allocation.
//!
//! A [`Network`] is an IPv4 block partitioned into named tiers. Every tier is
//! replicated once per availability zone, so a network with `T` tiers and `Z`
//! zones carries `T * Z` subnets.
//!
//! # Layout
//!
//! Tiers are laid out in declaration order, zones in ascending index order.
//! Each subnet is aligned to its own size, which keeps the layout identical
//! across repeated builds of the same input:
//!
//! ```text
//! 11.192.0.0/16, zones [a, b], tiers [db /24 isolated, dmz /24 public]
//!
//! db-subnet-1   11.192.0.0/24  us-east-1a
//! db-subnet-2   11.192.1.0/24  us-east-1b
//! dmz-subnet-1  11.192.2.0/24  us-east-1a
//! dmz-subnet-2  11.192.3.0/24  us-east-1b
//! ```

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AllocationError;

/// One zone per letter suffix.
const MAX_ZONE_COUNT: usize = 26;

/// IPv4 network block in CIDR notation.
///
/// The address must not carry host bits, `11.192.0.1/16` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    address: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// `11.192.0.0/16`, the block used when none is configured.
    pub const DEFAULT: Ipv4Cidr = Ipv4Cidr {
        address: Ipv4Addr::new(11, 192, 0, 0),
        prefix: 16,
    };

    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, AllocationError> {
        if prefix > 32 {
            return Err(AllocationError::InvalidCidr(format!("{address}/{prefix}")));
        }
        let cidr = Self { address, prefix };
        if u32::from(address) & !cidr.mask() != 0 {
            return Err(AllocationError::InvalidCidr(format!(
                "{address}/{prefix} has host bits set"
            )));
        }
        Ok(cidr)
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            p => u32::MAX << (32 - u32::from(p)),
        }
    }

    fn first(&self) -> u64 {
        u64::from(u32::from(self.address))
    }

    /// One past the last address of the block.
    fn end(&self) -> u64 {
        self.first() + self.size()
    }

    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        self.prefix <= other.prefix && self.first() <= other.first() && other.end() <= self.end()
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.first() < other.end() && other.first() < self.end()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = AllocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, prefix_str) = s
            .split_once('/')
            .ok_or_else(|| AllocationError::InvalidCidr(s.to_string()))?;
        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| AllocationError::InvalidCidr(s.to_string()))?;
        let prefix = prefix_str
            .parse::<u8>()
            .map_err(|_| AllocationError::InvalidCidr(s.to_string()))?;
        Self::new(address, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = AllocationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.to_string()
    }
}

/// Whether a tier routes to networks outside the VPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reachability {
    /// No route to external networks.
    Isolated,
    /// Routed through an internet gateway.
    Public,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isolated => f.write_str("isolated"),
            Self::Public => f.write_str("public"),
        }
    }
}

/// Requested tier, sized relative to the network block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub name: String,
    /// Added to the block prefix: a /16 block with delta 8 yields /24 subnets.
    pub prefix_delta: u8,
    pub reachability: Reachability,
}

impl TierSpec {
    pub fn new(name: impl Into<String>, prefix_delta: u8, reachability: Reachability) -> Self {
        Self {
            name: name.into(),
            prefix_delta,
            reachability,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub zone: String,
    pub cidr: Ipv4Cidr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetTier {
    pub name: String,
    pub reachability: Reachability,
    pub subnets: Vec<Subnet>,
}

/// Allocated network. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub cidr: Ipv4Cidr,
    pub availability_zones: Vec<String>,
    pub tiers: Vec<SubnetTier>,
    pub enable_dns_hostnames: bool,
    pub enable_dns_support: bool,
}

impl Network {
    pub fn tier(&self, name: &str) -> Option<&SubnetTier> {
        self.tiers.iter().find(|tier| tier.name == name)
    }

    pub fn subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.tiers.iter().flat_map(|tier| tier.subnets.iter())
    }

    pub fn isolated_subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.tiers
            .iter()
            .filter(|tier| tier.reachability == Reachability::Isolated)
            .flat_map(|tier| tier.subnets.iter())
    }
}

/// Derives `count` zone names in a region: `us-east-1a`, `us-east-1b`, ...
pub fn availability_zones(region: &str, count: usize) -> Result<Vec<String>, AllocationError> {
    if count == 0 {
        return Err(AllocationError::InvalidZoneCount(count));
    }
    if count > MAX_ZONE_COUNT {
        return Err(AllocationError::TooManyZones {
            count,
            max: MAX_ZONE_COUNT,
        });
    }
    Ok((b'a'..=b'z')
        .take(count)
        .map(|suffix| format!("{region}{}", char::from(suffix)))
        .collect())
}

/// Partitions `block` into one subnet per (tier, zone).
#[tracing::instrument(skip(tiers))]
pub fn allocate(
    id: &str,
    block: Ipv4Cidr,
    zones: &[String],
    tiers: &[TierSpec],
) -> Result<Network, AllocationError> {
    if zones.is_empty() {
        return Err(AllocationError::InvalidZoneCount(0));
    }

    let mut seen = HashSet::new();
    let mut cursor = block.first();
    let mut allocated = Vec::with_capacity(tiers.len());

    for spec in tiers {
        if !seen.insert(spec.name.as_str()) {
            return Err(AllocationError::DuplicateTier(spec.name.clone()));
        }

        let prefix = u32::from(block.prefix()) + u32::from(spec.prefix_delta);
        if spec.prefix_delta == 0 || prefix > 32 {
            return Err(AllocationError::InvalidPrefix {
                tier: spec.name.clone(),
                delta: spec.prefix_delta,
                block_prefix: block.prefix(),
            });
        }
        let size = 1u64 << (32 - prefix);

        let mut subnets = Vec::with_capacity(zones.len());
        for (index, zone) in zones.iter().enumerate() {
            // align up to the subnet size
            let start = cursor.div_ceil(size) * size;
            if start + size > block.end() {
                return Err(AllocationError::DoesNotFit {
                    tier: spec.name.clone(),
                    zone: zone.clone(),
                    block: block.to_string(),
                });
            }
            let address = u32::try_from(start)
                .map_err(|_| AllocationError::InvalidCidr(format!("{start} out of range")))?;
            // prefix <= 32 was checked above
            let cidr = Ipv4Cidr::new(Ipv4Addr::from(address), prefix as u8)?;

            subnets.push(Subnet {
                id: format!("{}-subnet-{}", spec.name, index + 1),
                zone: zone.clone(),
                cidr,
            });
            cursor = start + size;
        }

        tracing::debug!(
            "[allocator] tier {} ({}) -> {} subnets",
            spec.name,
            spec.reachability,
            subnets.len()
        );

        allocated.push(SubnetTier {
            name: spec.name.clone(),
            reachability: spec.reachability,
            subnets,
        });
    }

    Ok(Network {
        id: id.to_string(),
        cidr: block,
        availability_zones: zones.to_vec(),
        tiers: allocated,
        enable_dns_hostnames: true,
        enable_dns_support: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(count: usize) -> Vec<String> {
        availability_zones("us-east-1", count).unwrap()
    }

    fn default_tiers() -> Vec<TierSpec> {
        vec![
            TierSpec::new("db", 8, Reachability::Isolated),
            TierSpec::new("dmz", 8, Reachability::Public),
        ]
    }

    #[test]
    fn test_parse_cidr() {
        let cidr: Ipv4Cidr = "11.192.0.0/16".parse().unwrap();
        assert_eq!(cidr.prefix(), 16);
        assert_eq!(cidr.size(), 65536);
        assert_eq!(cidr.to_string(), "11.192.0.0/16");
    }

    #[test]
    fn test_parse_cidr_rejects_host_bits() {
        assert!("11.192.0.1/16".parse::<Ipv4Cidr>().is_err());
        assert!("11.192.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("11.192.0.0".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_availability_zone_names() {
        assert_eq!(zones(3), vec!["us-east-1a", "us-east-1b", "us-east-1c"]);
        assert_eq!(
            availability_zones("us-east-1", 0),
            Err(AllocationError::InvalidZoneCount(0))
        );
    }

    #[test]
    fn test_allocate_two_tier_layout() {
        let block = "11.192.0.0/16".parse().unwrap();
        let network = allocate("app-vpc", block, &zones(2), &default_tiers()).unwrap();

        let cidrs: Vec<(String, String)> = network
            .subnets()
            .map(|s| (s.id.clone(), s.cidr.to_string()))
            .collect();
        assert_eq!(
            cidrs,
            vec![
                ("db-subnet-1".to_string(), "11.192.0.0/24".to_string()),
                ("db-subnet-2".to_string(), "11.192.1.0/24".to_string()),
                ("dmz-subnet-1".to_string(), "11.192.2.0/24".to_string()),
                ("dmz-subnet-2".to_string(), "11.192.3.0/24".to_string()),
            ]
        );
        assert_eq!(network.isolated_subnets().count(), 2);
        assert_eq!(network.tier("db").unwrap().subnets[1].zone, "us-east-1b");
    }

    #[test]
    fn test_allocate_aligns_mixed_sizes() {
        let block = "10.0.0.0/24".parse().unwrap();
        let tiers = vec![
            TierSpec::new("small", 2, Reachability::Isolated),
            TierSpec::new("large", 1, Reachability::Public),
        ];
        let network = allocate("vpc", block, &zones(1), &tiers).unwrap();
        let cidrs: Vec<String> = network.subnets().map(|s| s.cidr.to_string()).collect();
        assert_eq!(cidrs, vec!["10.0.0.0/26", "10.0.0.128/25"]);
    }

    #[test]
    fn test_allocate_rejects_overflow() {
        let block = "10.0.0.0/28".parse().unwrap();
        let tiers = vec![
            TierSpec::new("a", 2, Reachability::Isolated),
            TierSpec::new("b", 2, Reachability::Isolated),
            TierSpec::new("c", 2, Reachability::Public),
        ];
        let err = allocate("vpc", block, &zones(2), &tiers).unwrap_err();
        assert!(matches!(err, AllocationError::DoesNotFit { ref tier, .. } if tier == "c"));
    }

    #[test]
    fn test_availability_zones_upper_bound() {
        assert_eq!(availability_zones("eu-west-1", 26).unwrap()[25], "eu-west-1z");
        let err = availability_zones("eu-west-1", 27).unwrap_err();
        assert_eq!(err, AllocationError::TooManyZones { count: 27, max: 26 });
        assert!(!err.to_string().contains("at least"));
    }

    #[test]
    fn test_allocate_rejects_zero_zones() {
        let block = "10.0.0.0/16".parse().unwrap();
        let err = allocate("vpc", block, &[], &default_tiers()).unwrap_err();
        assert_eq!(err, AllocationError::InvalidZoneCount(0));
    }

    #[test]
    fn test_allocate_rejects_prefix_past_32() {
        let block = "10.0.0.0/30".parse().unwrap();
        let tiers = vec![TierSpec::new("tiny", 3, Reachability::Isolated)];
        let err = allocate("vpc", block, &zones(1), &tiers).unwrap_err();
        assert!(matches!(err, AllocationError::InvalidPrefix { delta: 3, .. }));
    }

    #[test]
    fn test_allocate_rejects_zero_delta() {
        let block = "10.0.0.0/16".parse().unwrap();
        let tiers = vec![TierSpec::new("whole", 0, Reachability::Isolated)];
        let err = allocate("vpc", block, &zones(1), &tiers).unwrap_err();
        assert!(matches!(err, AllocationError::InvalidPrefix { delta: 0, .. }));
    }

    #[test]
    fn test_allocate_rejects_duplicate_tier() {
        let block = "10.0.0.0/16".parse().unwrap();
        let tiers = vec![
            TierSpec::new("db", 8, Reachability::Isolated),
            TierSpec::new("db", 8, Reachability::Public),
        ];
        let err = allocate("vpc", block, &zones(2), &tiers).unwrap_err();
        assert_eq!(err, AllocationError::DuplicateTier("db".to_string()));
    }

    #[test]
    fn test_allocated_subnets_do_not_overlap() {
        let block = "10.0.0.0/16".parse().unwrap();
        let tiers = vec![
            TierSpec::new("a", 4, Reachability::Isolated),
            TierSpec::new("b", 8, Reachability::Public),
            TierSpec::new("c", 6, Reachability::Isolated),
        ];
        let network = allocate("vpc", block, &zones(3), &tiers).unwrap();
        let subnets: Vec<&Subnet> = network.subnets().collect();
        for (i, left) in subnets.iter().enumerate() {
            assert!(block.contains(&left.cidr));
            for right in &subnets[i + 1..] {
                assert!(!left.cidr.overlaps(&right.cidr), "{} overlaps {}", left.id, right.id);
            }
        }
    }
}

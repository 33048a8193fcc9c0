// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

/// Subnetting or placement that cannot be satisfied.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),
    #[error("zone count must be at least 1, got {0}")]
    InvalidZoneCount(usize),
    #[error("zone count {count} exceeds the {max} zone suffixes a region can name")]
    TooManyZones { count: usize, max: usize },
    #[error("tier {tier} has invalid prefix delta {delta} for a /{block_prefix} block")]
    InvalidPrefix {
        tier: String,
        delta: u8,
        block_prefix: u8,
    },
    #[error("tier {0} is declared more than once")]
    DuplicateTier(String),
    #[error("tier {tier} does not fit in {block} (zone {zone})")]
    DoesNotFit {
        tier: String,
        zone: String,
        block: String,
    },
    #[error("subnet group {group} references unknown tier {tier}")]
    UnknownTier { group: String, tier: String },
    #[error("subnet group {group} must only use isolated subnets, tier {tier} is {reachability}")]
    NonIsolatedTier {
        group: String,
        tier: String,
        reachability: String,
    },
    #[error("subnet group {0} selects no subnets")]
    EmptySubnetGroup(String),
    #[error("resource {resource} requires {required} zones but subnet group {group} resolves {available} zones")]
    InsufficientZones {
        resource: String,
        group: String,
        required: usize,
        available: usize,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),
    #[error("access policy violation: address source {source_block} is not allowed into data-tier group {group}")]
    AccessPolicyViolation { group: String, source_block: String },
    #[error("dependency cycle: {}", members.join(" -> "))]
    DependencyCycle { members: Vec<String> },
    #[error("target {target}:{port} is not reachable from bastion {bastion}")]
    UnreachableTarget {
        bastion: String,
        target: String,
        port: u16,
    },
    #[error("resource conflict: {0}")]
    ResourceConflict(String),
    #[error("descriptor error: {0}")]
    Descriptor(String),
    #[error("realization of {node} failed: {message}")]
    Realization { node: String, message: String },
    #[error("build timed out after {0:?}")]
    Timeout(Duration),
}

pub type TopologyResult<T> = Result<T, TopologyError>;

impl From<serde_json::Error> for TopologyError {
    fn from(source: serde_json::Error) -> Self {
        tracing::error!("{:?}", source);
        TopologyError::Descriptor(source.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_members() {
        let err = TopologyError::DependencyCycle {
            members: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_allocation_error_converts() {
        let err: TopologyError = AllocationError::InvalidZoneCount(0).into();
        assert!(matches!(
            err,
            TopologyError::Allocation(AllocationError::InvalidZoneCount(0))
        ));
    }
}

// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Resource nodes and their dependency edges.
//!
//! Every provisionable thing becomes a [`ResourceNode`]: the network itself,
//! one node per security group, one per subnet group, and the declared
//! resources. Edges come from two places:
//!
//! - **explicit**: `depends_on` in the descriptor
//! - **inferred**: any parameter that reads another node's output
//!   ([`ParamValue::Ref`]) and any security-group membership
//!
//! Inferred edges are computed by inspecting parameters, so a topology that
//! forgets to declare "the cluster needs its subnet group" still orders
//! correctly.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::access::AccessGraph;
use crate::errors::{AllocationError, TopologyError, TopologyResult};
use crate::models::{SubnetGroupSpec, SubnetSelection, TopologyDescriptor};
use crate::network::{Network, Reachability, Subnet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    SubnetGroup,
    SecurityGroup,
    DatabaseCluster,
    CacheCluster,
    BastionHost,
    VpcConnector,
    ComputeService,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::SubnetGroup => "subnet-group",
            Self::SecurityGroup => "security-group",
            Self::DatabaseCluster => "database-cluster",
            Self::CacheCluster => "cache-cluster",
            Self::BastionHost => "bastion-host",
            Self::VpcConnector => "vpc-connector",
            Self::ComputeService => "compute-service",
        };
        f.write_str(name)
    }
}

/// Reference to an output another node produces once realized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub node: String,
    pub output: String,
}

/// Construction parameter of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Literal(String),
    Ref(OutputRef),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn reference(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Ref(OutputRef {
            node: node.into(),
            output: output.into(),
        })
    }

    /// All output references, depth first.
    pub fn references(&self) -> Vec<&OutputRef> {
        match self {
            Self::Literal(_) => Vec::new(),
            Self::Ref(reference) => vec![reference],
            Self::List(items) => items.iter().flat_map(|item| item.references()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: String,
    pub kind: ResourceKind,
    pub params: BTreeMap<String, ParamValue>,
    pub security_groups: Vec<String>,
    pub zones: Option<usize>,
    pub explicit: BTreeSet<String>,
    pub inferred: BTreeSet<String>,
    /// `None` until the node is realized.
    #[serde(skip_serializing_if = "Option::is_none")]
    outputs: Option<BTreeMap<String, String>>,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            params: BTreeMap::new(),
            security_groups: Vec::new(),
            zones: None,
            explicit: BTreeSet::new(),
            inferred: BTreeSet::new(),
            outputs: None,
        }
    }

    pub fn param(mut self, key: &str, value: ParamValue) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.explicit.insert(id.to_string());
        self
    }

    /// Recomputes inferred edges from parameters and group memberships.
    pub fn infer_dependencies(&mut self) {
        let mut inferred: BTreeSet<String> = self
            .params
            .values()
            .flat_map(|value| value.references())
            .map(|reference| reference.node.clone())
            .collect();
        inferred.extend(self.security_groups.iter().cloned());
        self.inferred = inferred;
    }

    /// Explicit and inferred dependencies together.
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.explicit
            .iter()
            .chain(self.inferred.iter())
            .map(String::as_str)
            .collect()
    }

    pub fn is_realized(&self) -> bool {
        self.outputs.is_some()
    }

    pub fn outputs(&self) -> Option<&BTreeMap<String, String>> {
        self.outputs.as_ref()
    }

    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs
            .as_ref()
            .and_then(|outputs| outputs.get(key))
            .map(String::as_str)
    }

    /// Realized copy of this node. Outputs of an already realized node never change.
    pub fn realized(&self, outputs: BTreeMap<String, String>) -> TopologyResult<Self> {
        if self.is_realized() {
            return Err(TopologyError::Realization {
                node: self.id.clone(),
                message: "node is already realized".to_string(),
            });
        }
        let mut node = self.clone();
        node.outputs = Some(outputs);
        Ok(node)
    }
}

/// Output key under which the network publishes the provider id of a subnet.
pub fn subnet_output_key(subnet_id: &str) -> String {
    format!("subnet.{subnet_id}")
}

fn select_subnets<'a>(
    spec: &SubnetGroupSpec,
    network: &'a Network,
) -> Result<Vec<&'a Subnet>, AllocationError> {
    let candidates: Vec<&Subnet> = match &spec.tier {
        Some(tier_name) => {
            let tier = network
                .tier(tier_name)
                .ok_or_else(|| AllocationError::UnknownTier {
                    group: spec.name.clone(),
                    tier: tier_name.clone(),
                })?;
            if tier.reachability != Reachability::Isolated {
                return Err(AllocationError::NonIsolatedTier {
                    group: spec.name.clone(),
                    tier: tier_name.clone(),
                    reachability: tier.reachability.to_string(),
                });
            }
            tier.subnets.iter().collect()
        }
        None => network.isolated_subnets().collect(),
    };

    let selected: Vec<&Subnet> = match spec.policy {
        SubnetSelection::AllIsolated => candidates,
        SubnetSelection::OnePerZone => {
            let mut zones = HashSet::new();
            candidates
                .into_iter()
                .filter(|subnet| zones.insert(subnet.zone.as_str()))
                .collect()
        }
    };

    if selected.is_empty() {
        return Err(AllocationError::EmptySubnetGroup(spec.name.clone()));
    }
    Ok(selected)
}

/// Builds every node of the topology in declaration order: network, security
/// groups, subnet groups, then declared resources.
///
/// Fails on duplicate ids, references to unknown nodes or groups, and
/// resources that request more zones than their subnet group covers.
#[tracing::instrument(skip_all, fields(stack = %descriptor.stack_id))]
pub fn build_nodes(
    descriptor: &TopologyDescriptor,
    network: &Network,
    access: &AccessGraph,
) -> TopologyResult<Vec<ResourceNode>> {
    let mut nodes = Vec::new();
    let mut subnet_group_zones: HashMap<String, usize> = HashMap::new();

    let mut vpc = ResourceNode::new(&network.id, ResourceKind::Network)
        .param("cidr", ParamValue::literal(network.cidr.to_string()))
        .param(
            "enable_dns_hostnames",
            ParamValue::literal(network.enable_dns_hostnames.to_string()),
        )
        .param(
            "enable_dns_support",
            ParamValue::literal(network.enable_dns_support.to_string()),
        )
        .param(
            "subnets",
            ParamValue::List(
                network
                    .subnets()
                    .map(|subnet| ParamValue::literal(format!("{}={}", subnet.id, subnet.cidr)))
                    .collect(),
            ),
        );
    vpc.infer_dependencies();
    nodes.push(vpc);

    for group in access.groups() {
        let mut node = ResourceNode::new(&group.name, ResourceKind::SecurityGroup)
            .param("vpc_id", ParamValue::reference(&network.id, "vpc_id"))
            .param("description", ParamValue::literal(&group.description));
        node.infer_dependencies();
        nodes.push(node);
    }

    for spec in &descriptor.subnet_groups {
        let subnets = select_subnets(spec, network)?;
        let zones: HashSet<&str> = subnets.iter().map(|subnet| subnet.zone.as_str()).collect();
        subnet_group_zones.insert(spec.name.clone(), zones.len());

        let mut node = ResourceNode::new(&spec.name, ResourceKind::SubnetGroup)
            .param("name", ParamValue::literal(&spec.name))
            .param("description", ParamValue::literal(&spec.description))
            .param(
                "subnet_ids",
                ParamValue::List(
                    subnets
                        .iter()
                        .map(|subnet| {
                            ParamValue::reference(&network.id, subnet_output_key(&subnet.id))
                        })
                        .collect(),
                ),
            );
        node.infer_dependencies();
        nodes.push(node);
    }

    for spec in &descriptor.resources {
        for group in &spec.security_groups {
            if access.group(group).is_none() {
                return Err(TopologyError::Descriptor(format!(
                    "resource {} is a member of unknown security group {group}",
                    spec.id
                )));
            }
        }
        let mut node = ResourceNode::new(&spec.id, spec.kind);
        node.params = spec.params.clone();
        node.security_groups = spec.security_groups.clone();
        node.zones = spec.zones;
        node.explicit = spec.depends_on.iter().cloned().collect();
        node.infer_dependencies();
        nodes.push(node);
    }

    let mut ids = HashSet::new();
    for node in &nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(TopologyError::ResourceConflict(format!(
                "resource id {} is declared more than once",
                node.id
            )));
        }
    }

    for node in &nodes {
        if let Some(missing) = node.dependencies().into_iter().find(|dep| !ids.contains(dep)) {
            return Err(TopologyError::Descriptor(format!(
                "resource {} depends on unknown resource {missing}",
                node.id
            )));
        }

        let Some(required) = node.zones else {
            continue;
        };
        // referenced or declared in depends_on
        let placements: Vec<(&str, usize)> = node
            .dependencies()
            .into_iter()
            .filter_map(|dep| subnet_group_zones.get(dep).map(|zones| (dep, *zones)))
            .collect();
        if placements.is_empty() {
            return Err(TopologyError::Descriptor(format!(
                "resource {} requests {required} zones but is not placed in a subnet group",
                node.id
            )));
        }
        for (group, available) in placements {
            if available < required {
                return Err(AllocationError::InsufficientZones {
                    resource: node.id.clone(),
                    group: group.to_string(),
                    required,
                    available,
                }
                .into());
            }
        }
    }

    tracing::debug!("[resources] built {} nodes", nodes.len());

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{IngressRule, IngressSource};
    use crate::models::{NetworkSpec, ResourceSpec, SecurityGroupSpec};
    use crate::network::{TierSpec, allocate, availability_zones};

    fn descriptor() -> TopologyDescriptor {
        TopologyDescriptor {
            stack_id: "test".to_string(),
            region: "us-east-1".to_string(),
            network: NetworkSpec {
                id: "app-vpc".to_string(),
                cidr: "11.192.0.0/16".parse().unwrap(),
                availability_zones: Vec::new(),
                zone_count: Some(2),
                tiers: vec![
                    TierSpec::new("db", 8, Reachability::Isolated),
                    TierSpec::new("dmz", 8, Reachability::Public),
                ],
            },
            security_groups: vec![SecurityGroupSpec {
                name: "cache-sg".to_string(),
                description: "cache".to_string(),
                data_tier: true,
                rules: vec![IngressRule::tcp(6379, IngressSource::group("cache-sg"))],
            }],
            subnet_groups: vec![SubnetGroupSpec {
                name: "cache-subnets".to_string(),
                tier: None,
                policy: SubnetSelection::AllIsolated,
                description: String::new(),
            }],
            resources: vec![
                ResourceSpec::new("cache", ResourceKind::CacheCluster)
                    .param(
                        "subnet_group",
                        ParamValue::reference("cache-subnets", "name"),
                    )
                    .security_group("cache-sg")
                    .zones(2),
            ],
            tunnels: Vec::new(),
        }
    }

    fn build(descriptor: &TopologyDescriptor) -> TopologyResult<Vec<ResourceNode>> {
        let zones = availability_zones("us-east-1", 2).unwrap();
        let network = allocate(
            &descriptor.network.id,
            descriptor.network.cidr,
            &zones,
            &descriptor.network.tiers,
        )?;
        let access = AccessGraph::from_specs(&descriptor.security_groups)?;
        build_nodes(descriptor, &network, &access)
    }

    #[test]
    fn test_param_references_nested() {
        let value = ParamValue::List(vec![
            ParamValue::literal("a"),
            ParamValue::reference("x", "id"),
            ParamValue::List(vec![ParamValue::reference("y", "name")]),
        ]);
        let nodes: Vec<&str> = value.references().iter().map(|r| r.node.as_str()).collect();
        assert_eq!(nodes, vec!["x", "y"]);
    }

    #[test]
    fn test_inferred_dependencies_from_params_and_groups() {
        let nodes = build(&descriptor()).unwrap();
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["app-vpc", "cache-sg", "cache-subnets", "cache"]);

        let cache = nodes.iter().find(|n| n.id == "cache").unwrap();
        assert!(cache.explicit.is_empty());
        assert_eq!(
            cache.inferred,
            BTreeSet::from(["cache-subnets".to_string(), "cache-sg".to_string()])
        );

        let subnets = nodes.iter().find(|n| n.id == "cache-subnets").unwrap();
        assert_eq!(subnets.inferred, BTreeSet::from(["app-vpc".to_string()]));
    }

    #[test]
    fn test_subnet_group_zone_shortfall() {
        let mut descriptor = descriptor();
        descriptor.resources[0].zones = Some(3);
        let err = build(&descriptor).unwrap_err();
        assert_eq!(
            err,
            TopologyError::Allocation(AllocationError::InsufficientZones {
                resource: "cache".to_string(),
                group: "cache-subnets".to_string(),
                required: 3,
                available: 2,
            })
        );
    }

    #[test]
    fn test_zone_check_follows_depends_on() {
        let mut descriptor = descriptor();
        descriptor.resources[0] = ResourceSpec::new("cache", ResourceKind::CacheCluster)
            .security_group("cache-sg")
            .depends_on("cache-subnets")
            .zones(3);
        let err = build(&descriptor).unwrap_err();
        assert!(matches!(
            err,
            TopologyError::Allocation(AllocationError::InsufficientZones { required: 3, .. })
        ));
    }

    #[test]
    fn test_zones_without_subnet_group_are_rejected() {
        let mut descriptor = descriptor();
        descriptor.resources[0] = ResourceSpec::new("cache", ResourceKind::CacheCluster)
            .security_group("cache-sg")
            .zones(2);
        let err = build(&descriptor).unwrap_err();
        assert!(matches!(err, TopologyError::Descriptor(message) if message.contains("cache")));
    }

    #[test]
    fn test_subnet_group_rejects_public_tier() {
        let mut descriptor = descriptor();
        descriptor.subnet_groups[0].tier = Some("dmz".to_string());
        let err = build(&descriptor).unwrap_err();
        assert!(matches!(
            err,
            TopologyError::Allocation(AllocationError::NonIsolatedTier { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_conflict() {
        let mut descriptor = descriptor();
        descriptor
            .resources
            .push(ResourceSpec::new("cache-sg", ResourceKind::BastionHost));
        let err = build(&descriptor).unwrap_err();
        assert!(matches!(err, TopologyError::ResourceConflict(_)));
    }

    #[test]
    fn test_unknown_dependency() {
        let mut descriptor = descriptor();
        descriptor.resources[0].depends_on.push("ghost".to_string());
        let err = build(&descriptor).unwrap_err();
        assert!(matches!(err, TopologyError::Descriptor(_)));
    }

    #[test]
    fn test_unknown_security_group_membership() {
        let mut descriptor = descriptor();
        descriptor.resources[0].security_groups.push("nope".to_string());
        let err = build(&descriptor).unwrap_err();
        assert!(matches!(err, TopologyError::Descriptor(_)));
    }

    #[test]
    fn test_realized_outputs_are_immutable() {
        let node = ResourceNode::new("vpc", ResourceKind::Network);
        let realized = node
            .realized(BTreeMap::from([("vpc_id".to_string(), "vpc-1".to_string())]))
            .unwrap();
        assert_eq!(realized.output("vpc_id"), Some("vpc-1"));
        assert!(!node.is_realized());
        assert!(realized.realized(BTreeMap::new()).is_err());
    }
}

// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Preset topologies.
//!
//! Every variant shares the same network: an isolated `db` tier and a public
//! `dmz` tier, one subnet of each per zone and no NAT gateways. Data-tier
//! groups admit their own members on the service port, and the bastion joins
//! those groups to reach them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::access::{IngressRule, IngressSource};
use crate::constants::{
    BASTION_INSTANCE_TYPE, CACHE_ENGINE, CACHE_ENGINE_VERSION, CACHE_NODE_TYPE, DATA_TIER,
    DATABASE_ENGINE, DEFAULT_PG_DATABASE, DEFAULT_REGION, DEFAULT_TIER_MASK,
    DEFAULT_ZONE_COUNT, OFFLINE_ACCOUNT_ID, POSTGRES_PORT, PUBLIC_TIER, REDIS_PORT,
};
use crate::errors::{AllocationError, TopologyResult};
use crate::models::{
    NetworkSpec, ResourceSpec, SecurityGroupSpec, SubnetGroupSpec, SubnetSelection,
    TopologyDescriptor, TunnelSpec,
};
use crate::network::{Ipv4Cidr, Reachability, TierSpec};
use crate::resources::{ParamValue, ResourceKind, subnet_output_key};

const VPC: &str = "app-vpc";
const CACHE_SG: &str = "cache-sg";
const DB_SG: &str = "db-sg";
const BASTION_SG: &str = "bastion-sg";
const CONNECTOR_SG: &str = "app-sg";
const CACHE: &str = "cache";
const DATABASE: &str = "database";
const BASTION: &str = "bastion";
const CONNECTOR: &str = "connector";
const SERVICE: &str = "service";
const DB_LOCAL_PORT: u16 = 5433;
const CACHE_LOCAL_PORT: u16 = 6380;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Replicated cache cluster only
    Cache,
    /// Cache and database behind a compute service
    CacheDb,
    /// Database behind a compute service
    Db,
    /// Database behind a compute service with an access role and automatic deployments
    DbIamAutodeploy,
}

impl Variant {
    pub fn has_cache(self) -> bool {
        matches!(self, Self::Cache | Self::CacheDb)
    }

    pub fn has_database(self) -> bool {
        !matches!(self, Self::Cache)
    }

    pub fn has_service(self) -> bool {
        self.has_database()
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cache => "cache",
            Self::CacheDb => "cache-db",
            Self::Db => "db",
            Self::DbIamAutodeploy => "db-iam-autodeploy",
        };
        f.write_str(name)
    }
}

/// Assembles the descriptor of a [`Variant`].
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    stack_id: String,
    variant: Variant,
    region: String,
    cidr: Option<Ipv4Cidr>,
    zone_count: usize,
    tier_mask: u8,
    bastion: bool,
}

impl TopologyBuilder {
    pub fn new(stack_id: impl Into<String>, variant: Variant) -> Self {
        Self {
            stack_id: stack_id.into(),
            variant,
            region: DEFAULT_REGION.to_string(),
            cidr: None,
            zone_count: DEFAULT_ZONE_COUNT,
            tier_mask: DEFAULT_TIER_MASK,
            bastion: true,
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn cidr(mut self, cidr: Ipv4Cidr) -> Self {
        self.cidr = Some(cidr);
        self
    }

    pub fn zones(mut self, zone_count: usize) -> Self {
        self.zone_count = zone_count;
        self
    }

    /// Prefix length of every subnet.
    pub fn tier_mask(mut self, tier_mask: u8) -> Self {
        self.tier_mask = tier_mask;
        self
    }

    pub fn bastion(mut self, enabled: bool) -> Self {
        self.bastion = enabled;
        self
    }

    fn subnet_group_name(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.stack_id)
    }

    fn network(&self) -> TopologyResult<NetworkSpec> {
        let cidr = self.cidr.unwrap_or(Ipv4Cidr::DEFAULT);
        let delta = self.tier_mask.checked_sub(cidr.prefix()).filter(|d| *d > 0);
        let Some(delta) = delta else {
            return Err(AllocationError::InvalidPrefix {
                tier: DATA_TIER.to_string(),
                delta: 0,
                block_prefix: cidr.prefix(),
            }
            .into());
        };
        Ok(NetworkSpec {
            id: VPC.to_string(),
            cidr,
            availability_zones: Vec::new(),
            zone_count: Some(self.zone_count),
            tiers: vec![
                TierSpec::new(DATA_TIER, delta, Reachability::Isolated),
                TierSpec::new(PUBLIC_TIER, delta, Reachability::Public),
            ],
        })
    }

    /// Zones a multi-AZ cluster spans; single-zone networks get a single-AZ cluster.
    fn cluster_zones(&self) -> usize {
        self.zone_count.clamp(1, 2)
    }

    fn security_groups(&self) -> Vec<SecurityGroupSpec> {
        let service = self.variant.has_service();
        let mut groups = Vec::new();

        if self.variant.has_cache() {
            let mut rules = vec![
                IngressRule::tcp(REDIS_PORT, IngressSource::group(CACHE_SG))
                    .with_description("Redis from group members"),
            ];
            if service {
                rules.push(
                    IngressRule::tcp(REDIS_PORT, IngressSource::group(CONNECTOR_SG))
                        .with_description("Redis from the compute service"),
                );
            }
            groups.push(SecurityGroupSpec {
                name: CACHE_SG.to_string(),
                description: "SecurityGroup associated with the ElastiCache Redis Cluster"
                    .to_string(),
                data_tier: true,
                rules,
            });
        }

        if self.variant.has_database() {
            let mut rules = vec![
                IngressRule::tcp(POSTGRES_PORT, IngressSource::group(DB_SG))
                    .with_description("PostgreSQL from group members"),
            ];
            if service {
                rules.push(
                    IngressRule::tcp(POSTGRES_PORT, IngressSource::group(CONNECTOR_SG))
                        .with_description("PostgreSQL from the compute service"),
                );
            }
            groups.push(SecurityGroupSpec {
                name: DB_SG.to_string(),
                description: "SecurityGroup associated with the Aurora PostgreSQL cluster"
                    .to_string(),
                data_tier: true,
                rules,
            });
        }

        if self.bastion {
            groups.push(SecurityGroupSpec {
                name: BASTION_SG.to_string(),
                description: "SecurityGroup associated with the bastion host".to_string(),
                data_tier: false,
                rules: Vec::new(),
            });
        }

        if service {
            groups.push(SecurityGroupSpec {
                name: CONNECTOR_SG.to_string(),
                description: "SecurityGroup associated with the VPC connector".to_string(),
                data_tier: false,
                rules: Vec::new(),
            });
        }

        groups
    }

    fn subnet_groups(&self) -> Vec<SubnetGroupSpec> {
        let mut groups = Vec::new();
        if self.variant.has_cache() {
            groups.push(SubnetGroupSpec {
                name: self.subnet_group_name("RedisSubnetGroup"),
                tier: None,
                policy: SubnetSelection::AllIsolated,
                description: "Elasticache Subnet Group".to_string(),
            });
        }
        if self.variant.has_database() {
            groups.push(SubnetGroupSpec {
                name: self.subnet_group_name("DbSubnetGroup"),
                tier: Some(DATA_TIER.to_string()),
                policy: SubnetSelection::OnePerZone,
                description: "Aurora Subnet Group".to_string(),
            });
        }
        groups
    }

    fn group_ids(groups: &[&str]) -> ParamValue {
        ParamValue::List(
            groups
                .iter()
                .map(|group| ParamValue::reference(*group, "group_id"))
                .collect(),
        )
    }

    fn cache(&self) -> ResourceSpec {
        let subnet_group = self.subnet_group_name("RedisSubnetGroup");
        let zones = self.cluster_zones();
        let multi_az = zones > 1;
        ResourceSpec::new(CACHE, ResourceKind::CacheCluster)
            .param(
                "description",
                ParamValue::literal(format!("Redis Cluster - {}", self.stack_id)),
            )
            .param("cache_node_type", ParamValue::literal(CACHE_NODE_TYPE))
            .param("engine", ParamValue::literal(CACHE_ENGINE))
            .param("engine_version", ParamValue::literal(CACHE_ENGINE_VERSION))
            .param("multi_az_enabled", ParamValue::literal(multi_az.to_string()))
            .param("num_node_groups", ParamValue::literal("1"))
            .param(
                "replicas_per_node_group",
                ParamValue::literal(if multi_az { "1" } else { "0" }),
            )
            .param("at_rest_encryption_enabled", ParamValue::literal("true"))
            .param("transit_encryption_enabled", ParamValue::literal("true"))
            .param("subnet_group", ParamValue::reference(&subnet_group, "name"))
            .param("security_group_ids", Self::group_ids(&[CACHE_SG]))
            .security_group(CACHE_SG)
            .zones(zones)
            // the replication group must wait for its subnet group
            .depends_on(&subnet_group)
    }

    fn database(&self) -> ResourceSpec {
        let subnet_group = self.subnet_group_name("DbSubnetGroup");
        ResourceSpec::new(DATABASE, ResourceKind::DatabaseCluster)
            .param("engine", ParamValue::literal(DATABASE_ENGINE))
            .param("database_name", ParamValue::literal(DEFAULT_PG_DATABASE))
            .param("port", ParamValue::literal(POSTGRES_PORT.to_string()))
            .param("credentials", ParamValue::literal("managed"))
            .param("storage_encrypted", ParamValue::literal("true"))
            .param("subnet_group", ParamValue::reference(&subnet_group, "name"))
            .param("security_group_ids", Self::group_ids(&[DB_SG]))
            .security_group(DB_SG)
            .zones(self.cluster_zones())
    }

    fn bastion_host(&self) -> ResourceSpec {
        let mut groups = vec![BASTION_SG];
        if self.variant.has_cache() {
            groups.push(CACHE_SG);
        }
        if self.variant.has_database() {
            groups.push(DB_SG);
        }
        let mut spec = ResourceSpec::new(BASTION, ResourceKind::BastionHost)
            .param("instance_type", ParamValue::literal(BASTION_INSTANCE_TYPE))
            .param(
                "subnet_id",
                ParamValue::reference(VPC, subnet_output_key(&format!("{PUBLIC_TIER}-subnet-1"))),
            )
            .param("security_group_ids", Self::group_ids(&groups));
        for group in groups {
            spec = spec.security_group(group);
        }
        spec
    }

    fn connector(&self) -> ResourceSpec {
        let subnets = (1..=self.zone_count)
            .map(|n| ParamValue::reference(VPC, subnet_output_key(&format!("{DATA_TIER}-subnet-{n}"))))
            .collect();
        ResourceSpec::new(CONNECTOR, ResourceKind::VpcConnector)
            .param(
                "name",
                ParamValue::literal(format!("vpc-connector-{}", self.stack_id)),
            )
            .param("subnets", ParamValue::List(subnets))
            .param("security_group_ids", Self::group_ids(&[CONNECTOR_SG]))
            .security_group(CONNECTOR_SG)
    }

    fn service(&self) -> ResourceSpec {
        let autodeploy = self.variant == Variant::DbIamAutodeploy;
        let mut spec = ResourceSpec::new(SERVICE, ResourceKind::ComputeService)
            .param(
                "service_name",
                ParamValue::literal(format!("demo-api-{}", self.stack_id)),
            )
            .param("image_port", ParamValue::literal("8080"))
            .param(
                "vpc_connector_arn",
                ParamValue::reference(CONNECTOR, "connector_arn"),
            )
            .param(
                "auto_deployments_enabled",
                ParamValue::literal(autodeploy.to_string()),
            )
            .depends_on(DATABASE);
        if autodeploy {
            spec = spec.param(
                "access_role_arn",
                ParamValue::literal(format!(
                    "arn:aws:iam::{OFFLINE_ACCOUNT_ID}:role/AppRunnerECRAccessRole-{}",
                    self.stack_id
                )),
            );
        }
        if self.variant.has_cache() {
            spec = spec.depends_on(CACHE);
        }
        spec
    }

    pub fn build(&self) -> TopologyResult<TopologyDescriptor> {
        let network = self.network()?;

        let mut resources = Vec::new();
        let mut tunnels = Vec::new();
        if self.variant.has_cache() {
            resources.push(self.cache());
        }
        if self.variant.has_database() {
            resources.push(self.database());
        }
        if self.bastion {
            resources.push(self.bastion_host());
            if self.variant.has_database() {
                tunnels.push(TunnelSpec {
                    bastion: BASTION.to_string(),
                    target: DATABASE.to_string(),
                    local_port: DB_LOCAL_PORT,
                });
            }
            if self.variant.has_cache() {
                tunnels.push(TunnelSpec {
                    bastion: BASTION.to_string(),
                    target: CACHE.to_string(),
                    local_port: CACHE_LOCAL_PORT,
                });
            }
        }
        if self.variant.has_service() {
            resources.push(self.connector());
            resources.push(self.service());
        }

        tracing::info!(
            "[variant] {} topology for stack {} with {} resources",
            self.variant,
            self.stack_id,
            resources.len()
        );

        Ok(TopologyDescriptor {
            stack_id: self.stack_id.clone(),
            region: self.region.clone(),
            network,
            security_groups: self.security_groups(),
            subnet_groups: self.subnet_groups(),
            resources,
            tunnels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(descriptor: &TopologyDescriptor) -> Vec<&str> {
        descriptor.resources.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_cache_variant() {
        let descriptor = TopologyBuilder::new("dev", Variant::Cache)
            .bastion(false)
            .build()
            .unwrap();
        assert_eq!(descriptor.network.cidr.to_string(), "11.192.0.0/16");
        assert_eq!(descriptor.network.tiers[0].prefix_delta, 8);
        assert_eq!(ids(&descriptor), vec!["cache"]);
        assert_eq!(descriptor.subnet_groups[0].name, "RedisSubnetGroup-dev");
        assert!(descriptor.tunnels.is_empty());

        let cache = &descriptor.resources[0];
        assert_eq!(cache.depends_on, vec!["RedisSubnetGroup-dev".to_string()]);
        assert_eq!(
            cache.params["replicas_per_node_group"],
            ParamValue::literal("1")
        );

        let group = &descriptor.security_groups[0];
        assert!(group.data_tier);
        assert_eq!(group.rules.len(), 1);
        assert_eq!(group.rules[0].source, IngressSource::group(CACHE_SG));
    }

    #[test]
    fn test_cache_db_variant() {
        let descriptor = TopologyBuilder::new("dev", Variant::CacheDb).build().unwrap();
        assert_eq!(
            ids(&descriptor),
            vec!["cache", "database", "bastion", "connector", "service"]
        );
        assert_eq!(descriptor.tunnels.len(), 2);
        let bastion = &descriptor.resources[2];
        assert_eq!(bastion.security_groups, vec!["bastion-sg", "cache-sg", "db-sg"]);
    }

    #[test]
    fn test_db_variants() {
        let db = TopologyBuilder::new("dev", Variant::Db).build().unwrap();
        assert_eq!(ids(&db), vec!["database", "bastion", "connector", "service"]);
        let service = &db.resources[3];
        assert_eq!(
            service.params["auto_deployments_enabled"],
            ParamValue::literal("false")
        );
        assert!(!service.params.contains_key("access_role_arn"));

        let iam = TopologyBuilder::new("dev", Variant::DbIamAutodeploy)
            .bastion(false)
            .build()
            .unwrap();
        assert_eq!(ids(&iam), vec!["database", "connector", "service"]);
        let service = &iam.resources[2];
        assert_eq!(
            service.params["auto_deployments_enabled"],
            ParamValue::literal("true")
        );
        assert!(service.params.contains_key("access_role_arn"));
    }

    #[test]
    fn test_single_zone_disables_multi_az() {
        let descriptor = TopologyBuilder::new("dev", Variant::Cache)
            .zones(1)
            .build()
            .unwrap();
        let cache = &descriptor.resources[0];
        assert_eq!(cache.zones, Some(1));
        assert_eq!(cache.params["multi_az_enabled"], ParamValue::literal("false"));
    }

    #[test]
    fn test_tier_mask_must_be_longer_than_block() {
        let err = TopologyBuilder::new("dev", Variant::Cache)
            .tier_mask(16)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::errors::TopologyError::Allocation(AllocationError::InvalidPrefix { .. })
        ));
    }
}

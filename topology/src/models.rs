// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::access::{IngressRule, RenderedRule};
use crate::constants::DEFAULT_REGION;
use crate::errors::{TopologyError, TopologyResult};
use crate::network::{self, Ipv4Cidr, TierSpec};
use crate::realize::RealizationRecord;
use crate::resolver::DependencyEdge;
use crate::resources::{ParamValue, ResourceKind};

/// Everything needed to build a topology. This is the JSON accepted by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    pub stack_id: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub network: NetworkSpec,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupSpec>,
    #[serde(default)]
    pub subnet_groups: Vec<SubnetGroupSpec>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl TopologyDescriptor {
    pub fn from_json(json: &str) -> TopologyResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Zone names, either listed explicitly or derived from the region.
    pub fn availability_zones(&self) -> TopologyResult<Vec<String>> {
        if !self.network.availability_zones.is_empty() {
            return Ok(self.network.availability_zones.clone());
        }
        let count = self.network.zone_count.ok_or_else(|| {
            TopologyError::Descriptor(
                "network needs either availability_zones or zone_count".to_string(),
            )
        })?;
        Ok(network::availability_zones(&self.region, count)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub id: String,
    pub cidr: Ipv4Cidr,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub availability_zones: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_count: Option<usize>,
    pub tiers: Vec<TierSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub data_tier: bool,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubnetSelection {
    /// First isolated subnet of every zone.
    OnePerZone,
    /// Every isolated subnet.
    AllIsolated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetGroupSpec {
    pub name: String,
    /// Restricts selection to one tier; must be isolated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    pub policy: SubnetSelection,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub id: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Zones the resource must span, checked against its subnet group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<usize>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            params: BTreeMap::new(),
            security_groups: Vec::new(),
            zones: None,
            depends_on: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: ParamValue) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn security_group(mut self, name: &str) -> Self {
        self.security_groups.push(name.to_string());
        self
    }

    pub fn zones(mut self, zones: usize) -> Self {
        self.zones = Some(zones);
        self
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.depends_on.push(id.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub bastion: String,
    pub target: String,
    pub local_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCommand {
    pub bastion: String,
    pub target: String,
    pub host: String,
    pub port: u16,
    pub local_port: u16,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_name: Option<String>,
}

/// Offline result: what would be created, and in which order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub stack_id: String,
    pub order: Vec<String>,
    pub waves: Vec<Vec<String>>,
    pub edges: Vec<DependencyEdge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub stack_id: String,
    pub realization_log: Vec<RealizationRecord>,
    pub outputs: BTreeMap<String, BTreeMap<String, String>>,
    pub ingress_rules: Vec<RenderedRule>,
    pub environment: BTreeMap<String, String>,
    pub local_environment: BTreeMap<String, String>,
    pub tunnels: Vec<TunnelCommand>,
    pub stack_outputs: Vec<StackOutput>,
}

// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Security groups and the ingress allow-list between them.
//!
//! Access is default-deny: two groups can talk only if the target group holds
//! an [`IngressRule`] whose source is the caller's group. Rules may name a
//! source group that does not exist yet; the reference is resolved when the
//! rules are rendered against realized group ids (see [`AccessGraph::render`]).
//!
//! Groups flagged as data-tier only accept group sources. Allowing an address
//! literal into one fails with [`TopologyError::AccessPolicyViolation`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{TopologyError, TopologyResult};
use crate::models::SecurityGroupSpec;
use crate::network::Ipv4Cidr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    fn admits(&self, other: Protocol) -> bool {
        *self == Protocol::All || *self == other
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Icmp => f.write_str("icmp"),
            Self::All => f.write_str("-1"),
        }
    }
}

/// Inclusive port range; a single port has `from == to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            from: port,
            to: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.from <= port && port <= self.to
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngressSource {
    /// Members of another (or the same) security group.
    Group(String),
    /// Literal address block.
    Cidr(Ipv4Cidr),
}

impl IngressSource {
    pub fn group(name: impl Into<String>) -> Self {
        Self::Group(name.into())
    }
}

impl fmt::Display for IngressSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(name) => write!(f, "sg:{name}"),
            Self::Cidr(cidr) => write!(f, "{cidr}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: Protocol,
    pub ports: PortRange,
    pub source: IngressSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl IngressRule {
    pub fn tcp(port: u16, source: IngressSource) -> Self {
        Self {
            protocol: Protocol::Tcp,
            ports: PortRange::single(port),
            source,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn same_edge(&self, other: &IngressRule) -> bool {
        self.protocol == other.protocol && self.ports == other.ports && self.source == other.source
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub name: String,
    pub description: String,
    pub data_tier: bool,
    pub rules: Vec<IngressRule>,
}

/// Handle returned by group creation, usable before the group is realized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupHandle(String);

impl GroupHandle {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for GroupHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Ingress rule with group references replaced by realized group ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedRule {
    pub group: String,
    pub group_id: String,
    pub protocol: Protocol,
    pub from_port: u16,
    pub to_port: u16,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGraph {
    groups: Vec<SecurityGroup>,
}

impl AccessGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph from descriptor entries, in declaration order.
    pub fn from_specs(specs: &[SecurityGroupSpec]) -> TopologyResult<Self> {
        let mut graph = Self::new();
        for spec in specs {
            let handle = graph.insert_group(&spec.name, &spec.description, spec.data_tier)?;
            for rule in &spec.rules {
                graph.allow(&handle, rule.clone())?;
            }
        }
        Ok(graph)
    }

    pub fn create_group(&mut self, name: &str, description: &str) -> TopologyResult<GroupHandle> {
        self.insert_group(name, description, false)
    }

    pub fn create_data_tier_group(
        &mut self,
        name: &str,
        description: &str,
    ) -> TopologyResult<GroupHandle> {
        self.insert_group(name, description, true)
    }

    fn insert_group(
        &mut self,
        name: &str,
        description: &str,
        data_tier: bool,
    ) -> TopologyResult<GroupHandle> {
        if self.group(name).is_some() {
            return Err(TopologyError::ResourceConflict(format!(
                "security group {name} already exists"
            )));
        }
        self.groups.push(SecurityGroup {
            name: name.to_string(),
            description: description.to_string(),
            data_tier,
            rules: Vec::new(),
        });
        Ok(GroupHandle(name.to_string()))
    }

    /// Adds an ingress rule to `group`.
    ///
    /// Re-adding an identical rule is a no-op. A rule on the same
    /// (protocol, port, source) edge with a different description is a conflict.
    #[tracing::instrument(skip(self, group), fields(group = group.as_ref()))]
    pub fn allow(&mut self, group: impl AsRef<str>, rule: IngressRule) -> TopologyResult<()> {
        let name = group.as_ref();
        if rule.ports.from > rule.ports.to {
            return Err(TopologyError::Descriptor(format!(
                "security group {name}: port range {}-{} is reversed",
                rule.ports.from, rule.ports.to
            )));
        }

        let target = self
            .groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| TopologyError::Descriptor(format!("unknown security group {name}")))?;

        if let IngressSource::Cidr(cidr) = &rule.source {
            if target.data_tier {
                return Err(TopologyError::AccessPolicyViolation {
                    group: name.to_string(),
                    source_block: cidr.to_string(),
                });
            }
        }

        if let Some(existing) = target.rules.iter().find(|r| r.same_edge(&rule)) {
            if existing.description == rule.description {
                tracing::debug!("[access] {} already allows {}", name, rule.source);
                return Ok(());
            }
            return Err(TopologyError::ResourceConflict(format!(
                "security group {name} already allows {} {} from {} with a different description",
                rule.protocol, rule.ports, rule.source
            )));
        }

        tracing::debug!(
            "[access] {} allows {} {} from {}",
            name,
            rule.protocol,
            rule.ports,
            rule.source
        );
        target.rules.push(rule);
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&SecurityGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn groups(&self) -> &[SecurityGroup] {
        &self.groups
    }

    /// Whether any member of `from` may open `protocol`/`port` to any of `to`.
    ///
    /// Only group sources grant reachability; address literals never count
    /// because a caller cannot prove membership in a literal block.
    pub fn can_reach(&self, from: &[String], to: &[String], protocol: Protocol, port: u16) -> bool {
        to.iter()
            .filter_map(|name| self.group(name))
            .flat_map(|group| group.rules.iter())
            .any(|rule| {
                rule.protocol.admits(protocol)
                    && rule.ports.contains(port)
                    && matches!(&rule.source, IngressSource::Group(source) if from.contains(source))
            })
    }

    /// Fails on the first rule whose source names a group that is not declared.
    ///
    /// `allow` accepts forward references, so this runs once every group exists.
    pub fn check_sources(&self) -> TopologyResult<()> {
        for group in &self.groups {
            let missing = group.rules.iter().find_map(|rule| match &rule.source {
                IngressSource::Group(source) if self.group(source).is_none() => Some(source),
                _ => None,
            });
            if let Some(source) = missing {
                return Err(TopologyError::Descriptor(format!(
                    "security group {} admits undeclared group {source}",
                    group.name
                )));
            }
        }
        Ok(())
    }

    /// Resolves group references against realized group ids.
    pub fn render(&self, group_ids: &BTreeMap<String, String>) -> TopologyResult<Vec<RenderedRule>> {
        let lookup = |name: &str| {
            group_ids.get(name).cloned().ok_or_else(|| {
                TopologyError::Descriptor(format!("security group {name} was never realized"))
            })
        };

        let mut rendered = Vec::new();
        for group in &self.groups {
            let group_id = lookup(&group.name)?;
            for rule in &group.rules {
                let source = match &rule.source {
                    IngressSource::Group(name) => lookup(name)?,
                    IngressSource::Cidr(cidr) => cidr.to_string(),
                };
                rendered.push(RenderedRule {
                    group: group.name.clone(),
                    group_id: group_id.clone(),
                    protocol: rule.protocol,
                    from_port: rule.ports.from,
                    to_port: rule.ports.to,
                    source,
                    description: rule.description.clone(),
                });
            }
        }
        Ok(rendered)
    }
}

// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Build stages.
//!
//! ```text
//! Declared -> Allocated -> AccessGraphBuilt -> Resolved -> Realized -> Exported
//! ```
//!
//! Each stage consumes the previous one, so a stage cannot be skipped or run
//! twice. Everything up to [`Resolved`] is computed offline; only
//! [`Resolved::realize`] talks to a [`Provisioner`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessGraph;
use crate::configuration::DatabaseCredentials;
use crate::constants::{DEFAULT_REALIZE_CONCURRENCY, DEFAULT_REALIZE_TIMEOUT};
use crate::errors::{TopologyError, TopologyResult};
use crate::exporter::{Exporter, check_tunnel};
use crate::models::{BuildOutput, BuildPlan, TopologyDescriptor};
use crate::network::{Network, allocate};
use crate::realize::{Provisioner, RealizationRecord, realize_all};
use crate::resolver::{edges, resolve, waves};
use crate::resources::{ResourceKind, ResourceNode, build_nodes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealizeSettings {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for RealizeSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REALIZE_TIMEOUT,
            concurrency: DEFAULT_REALIZE_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Declared {
    pub descriptor: TopologyDescriptor,
}

#[derive(Debug, Clone)]
pub struct Allocated {
    pub descriptor: TopologyDescriptor,
    pub network: Network,
}

#[derive(Debug, Clone)]
pub struct AccessGraphBuilt {
    pub descriptor: TopologyDescriptor,
    pub network: Network,
    pub access: AccessGraph,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub descriptor: TopologyDescriptor,
    pub network: Network,
    pub access: AccessGraph,
    pub nodes: Vec<ResourceNode>,
    pub order: Vec<String>,
    pub waves: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Realized {
    pub descriptor: TopologyDescriptor,
    pub network: Network,
    pub access: AccessGraph,
    pub nodes: Vec<ResourceNode>,
    pub log: Vec<RealizationRecord>,
}

#[derive(Debug, Clone)]
pub struct Exported {
    pub output: BuildOutput,
}

impl Declared {
    pub fn new(descriptor: TopologyDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn allocate(self) -> TopologyResult<Allocated> {
        let zones = self.descriptor.availability_zones()?;
        let spec = &self.descriptor.network;
        let network = allocate(&spec.id, spec.cidr, &zones, &spec.tiers)?;
        tracing::info!(
            "[pipeline] allocated {} subnets in {} across {} zones",
            network.subnets().count(),
            network.cidr,
            zones.len()
        );
        Ok(Allocated {
            descriptor: self.descriptor,
            network,
        })
    }
}

impl Allocated {
    pub fn build_access_graph(self) -> TopologyResult<AccessGraphBuilt> {
        let access = AccessGraph::from_specs(&self.descriptor.security_groups)?;
        tracing::info!(
            "[pipeline] access graph has {} security groups",
            access.groups().len()
        );
        Ok(AccessGraphBuilt {
            descriptor: self.descriptor,
            network: self.network,
            access,
        })
    }
}

impl AccessGraphBuilt {
    pub fn resolve(self) -> TopologyResult<Resolved> {
        let nodes = build_nodes(&self.descriptor, &self.network, &self.access)?;
        self.access.check_sources()?;
        let order = resolve(&nodes)?;
        let waves = waves(&nodes, &order);
        for tunnel in &self.descriptor.tunnels {
            check_tunnel(tunnel, &nodes, &self.access)?;
        }
        tracing::info!(
            "[pipeline] resolved {} nodes into {} waves",
            order.len(),
            waves.len()
        );
        Ok(Resolved {
            descriptor: self.descriptor,
            network: self.network,
            access: self.access,
            nodes,
            order,
            waves,
        })
    }
}

impl Resolved {
    pub fn plan(&self) -> BuildPlan {
        BuildPlan {
            stack_id: self.descriptor.stack_id.clone(),
            order: self.order.clone(),
            waves: self.waves.clone(),
            edges: edges(&self.nodes),
        }
    }

    /// Realizes every node. Hitting `settings.timeout` aborts the build;
    /// whatever was already created is left in place.
    pub async fn realize<P: Provisioner>(
        self,
        provisioner: Arc<P>,
        settings: RealizeSettings,
    ) -> TopologyResult<Realized> {
        tracing::info!(
            "[pipeline] realizing {} nodes with concurrency {}",
            self.nodes.len(),
            settings.concurrency
        );
        let realization = realize_all(
            &self.nodes,
            &self.order,
            &self.waves,
            provisioner,
            settings.concurrency,
        );
        let (nodes, log) = match tokio::time::timeout(settings.timeout, realization).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::error!("[pipeline] realization timed out after {:?}", settings.timeout);
                return Err(TopologyError::Timeout(settings.timeout));
            }
        };
        Ok(Realized {
            descriptor: self.descriptor,
            network: self.network,
            access: self.access,
            nodes,
            log,
        })
    }
}

impl Realized {
    pub fn export(self, credentials: &DatabaseCredentials) -> TopologyResult<Exported> {
        let group_ids: BTreeMap<String, String> = self
            .nodes
            .iter()
            .filter(|node| node.kind == ResourceKind::SecurityGroup)
            .filter_map(|node| {
                node.output("group_id")
                    .map(|id| (node.id.clone(), id.to_string()))
            })
            .collect();
        let ingress_rules = self.access.render(&group_ids)?;

        let stack_id = self.descriptor.stack_id.as_str();
        let exporter = Exporter::new(stack_id, &self.nodes, &self.access);
        let environment = exporter.environment(credentials);
        let tunnels = exporter.tunnels(&self.descriptor.tunnels)?;
        let local_environment = exporter.local_environment(&environment, &tunnels);
        let stack_outputs = exporter.stack_outputs();

        let outputs = self
            .nodes
            .iter()
            .map(|node| (node.id.clone(), node.outputs().cloned().unwrap_or_default()))
            .collect();

        tracing::info!(
            "[pipeline] exported {} stack outputs and {} tunnels",
            stack_outputs.len(),
            tunnels.len()
        );

        Ok(Exported {
            output: BuildOutput {
                stack_id: stack_id.to_string(),
                realization_log: self.log,
                outputs,
                ingress_rules,
                environment,
                local_environment,
                tunnels,
                stack_outputs,
            },
        })
    }
}

/// Runs the offline stages and returns the plan.
pub fn plan(descriptor: TopologyDescriptor) -> TopologyResult<BuildPlan> {
    let resolved = Declared::new(descriptor)
        .allocate()?
        .build_access_graph()?
        .resolve()?;
    Ok(resolved.plan())
}

/// Runs every stage.
#[tracing::instrument(skip_all, fields(stack = %descriptor.stack_id))]
pub async fn build<P: Provisioner>(
    descriptor: TopologyDescriptor,
    provisioner: Arc<P>,
    settings: RealizeSettings,
    credentials: &DatabaseCredentials,
) -> TopologyResult<BuildOutput> {
    let exported = Declared::new(descriptor)
        .allocate()?
        .build_access_graph()?
        .resolve()?
        .realize(provisioner, settings)
        .await?
        .export(credentials)?;
    Ok(exported.output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realize::{OfflineProvisioner, Outputs, ResolvedParams};
    use crate::variant::{TopologyBuilder, Variant};

    struct StalledProvisioner;

    impl Provisioner for StalledProvisioner {
        async fn realize(
            &self,
            _node: &ResourceNode,
            _params: &ResolvedParams,
        ) -> TopologyResult<Outputs> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Outputs::new())
        }
    }

    fn descriptor(variant: Variant) -> TopologyDescriptor {
        TopologyBuilder::new("dev", variant).build().unwrap()
    }

    #[test]
    fn test_plan_orders_network_first() {
        let plan = plan(descriptor(Variant::Cache)).unwrap();
        assert_eq!(plan.order[0], "app-vpc");
        assert_eq!(plan.waves[0], vec!["app-vpc".to_string()]);
        let cache = plan.order.iter().position(|id| id == "cache").unwrap();
        let subnets = plan
            .order
            .iter()
            .position(|id| id == "RedisSubnetGroup-dev")
            .unwrap();
        assert!(subnets < cache);
    }

    #[tokio::test]
    async fn test_build_cache_db() {
        let provisioner = Arc::new(OfflineProvisioner::new("dev", "us-east-1"));
        let output = build(
            descriptor(Variant::CacheDb),
            provisioner,
            RealizeSettings::default(),
            &DatabaseCredentials::default(),
        )
        .await
        .unwrap();

        assert_eq!(output.realization_log.len(), output.outputs.len());
        assert_eq!(output.tunnels.len(), 2);
        assert!(output.environment["PG_USER"].starts_with("{{resolve:secretsmanager:"));
        assert_eq!(output.local_environment["PG_HOST"], "localhost");
        assert_eq!(output.local_environment["PG_PORT"], "5433");
        assert_eq!(output.local_environment["NODE_TLS_REJECT_UNAUTHORIZED"], "0");
        assert!(output.ingress_rules.iter().all(|rule| rule.source.starts_with("sg-")));
    }

    #[tokio::test]
    async fn test_realize_times_out() {
        let resolved = Declared::new(descriptor(Variant::Cache))
            .allocate()
            .unwrap()
            .build_access_graph()
            .unwrap()
            .resolve()
            .unwrap();
        let settings = RealizeSettings {
            timeout: Duration::from_millis(20),
            concurrency: 1,
        };
        let err = resolved
            .realize(Arc::new(StalledProvisioner), settings)
            .await
            .unwrap_err();
        assert_eq!(err, TopologyError::Timeout(Duration::from_millis(20)));
    }
}

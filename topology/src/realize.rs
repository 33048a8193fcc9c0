// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Node realization.
//!
//! Realization turns a node's declared parameters into concrete outputs. It is
//! the only stage with side effects, so it sits behind the [`Provisioner`]
//! trait. [`OfflineProvisioner`] synthesizes deterministic outputs and is what
//! the CLI and the tests use.
//!
//! # Scheduling
//!
//! With a concurrency of 1, nodes are realized one at a time in resolver order.
//! Above that, each wave from [`crate::resolver::waves`] is split into batches
//! of at most `concurrency` nodes that run on a [`JoinSet`]. A batch is
//! published only after every node in it succeeded; the first failure aborts
//! the build and nothing from the failing batch becomes visible.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::constants::{OFFLINE_ACCOUNT_ID, POSTGRES_PORT, REDIS_PORT};
use crate::errors::{TopologyError, TopologyResult};
use crate::resources::{ParamValue, ResourceKind, ResourceNode, subnet_output_key};

/// Parameter value after output references were substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedValue {
    Scalar(String),
    List(Vec<ResolvedValue>),
}

impl ResolvedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::List(_) => None,
        }
    }

    /// Scalars in order, lists flattened.
    pub fn flatten(&self) -> Vec<&str> {
        match self {
            Self::Scalar(value) => vec![value.as_str()],
            Self::List(items) => items.iter().flat_map(|item| item.flatten()).collect(),
        }
    }
}

pub type ResolvedParams = BTreeMap<String, ResolvedValue>;
pub type Outputs = BTreeMap<String, String>;

/// Creates the real thing behind a node.
pub trait Provisioner: Send + Sync + 'static {
    fn realize(
        &self,
        node: &ResourceNode,
        params: &ResolvedParams,
    ) -> impl Future<Output = TopologyResult<Outputs>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealizationRecord {
    pub sequence: usize,
    pub id: String,
    pub kind: ResourceKind,
    pub batch: usize,
}

fn resolve_value(
    owner: &str,
    value: &ParamValue,
    realized: &HashMap<String, ResourceNode>,
) -> TopologyResult<ResolvedValue> {
    match value {
        ParamValue::Literal(literal) => Ok(ResolvedValue::Scalar(literal.clone())),
        ParamValue::Ref(reference) => realized
            .get(&reference.node)
            .and_then(|node| node.output(&reference.output))
            .map(|output| ResolvedValue::Scalar(output.to_string()))
            .ok_or_else(|| TopologyError::Realization {
                node: owner.to_string(),
                message: format!(
                    "output {} of {} is not available",
                    reference.output, reference.node
                ),
            }),
        ParamValue::List(items) => items
            .iter()
            .map(|item| resolve_value(owner, item, realized))
            .collect::<TopologyResult<Vec<_>>>()
            .map(ResolvedValue::List),
    }
}

/// Substitutes every output reference of `node` with the realized value.
pub fn resolve_params(
    node: &ResourceNode,
    realized: &HashMap<String, ResourceNode>,
) -> TopologyResult<ResolvedParams> {
    node.params
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(&node.id, value, realized)?)))
        .collect()
}

/// Realizes `nodes` following `order`.
///
/// Returns the realized nodes in resolver order together with the log.
#[tracing::instrument(skip_all, fields(nodes = nodes.len(), concurrency = concurrency))]
pub async fn realize_all<P: Provisioner>(
    nodes: &[ResourceNode],
    order: &[String],
    waves: &[Vec<String>],
    provisioner: Arc<P>,
    concurrency: usize,
) -> TopologyResult<(Vec<ResourceNode>, Vec<RealizationRecord>)> {
    let declared: HashMap<&str, &ResourceNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    let batches: Vec<Vec<String>> = if concurrency <= 1 {
        order.iter().map(|id| vec![id.clone()]).collect()
    } else {
        waves
            .iter()
            .flat_map(|wave| wave.chunks(concurrency).map(<[String]>::to_vec))
            .collect()
    };

    let mut realized: HashMap<String, ResourceNode> = HashMap::with_capacity(nodes.len());
    let mut log = Vec::with_capacity(nodes.len());

    for (batch_index, batch) in batches.iter().enumerate() {
        let mut set = JoinSet::new();
        for id in batch {
            let node = declared
                .get(id.as_str())
                .copied()
                .cloned()
                .ok_or_else(|| TopologyError::Descriptor(format!("unknown resource {id}")))?;
            for dep in node.dependencies() {
                if !realized.contains_key(dep) {
                    return Err(TopologyError::Realization {
                        node: node.id.clone(),
                        message: format!("dependency {dep} is not realized"),
                    });
                }
            }
            let params = resolve_params(&node, &realized)?;
            let provisioner = provisioner.clone();
            set.spawn(async move {
                let outputs = provisioner.realize(&node, &params).await;
                (node, outputs)
            });
        }

        let mut completed: HashMap<String, (ResourceNode, Outputs)> = HashMap::new();
        let mut failures: HashMap<String, TopologyError> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((node, Ok(outputs))) => {
                    completed.insert(node.id.clone(), (node, outputs));
                }
                Ok((node, Err(err))) => {
                    failures.insert(node.id.clone(), err);
                }
                Err(err) => {
                    return Err(TopologyError::Realization {
                        node: batch.join(","),
                        message: err.to_string(),
                    });
                }
            }
        }

        // report the failure of the earliest node in resolver order
        if let Some(err) = batch.iter().find_map(|id| failures.remove(id)) {
            tracing::error!("[realize] batch {} failed: {}", batch_index, err);
            return Err(err);
        }

        for id in batch {
            let (node, outputs) = completed.remove(id).ok_or_else(|| TopologyError::Realization {
                node: id.clone(),
                message: "realization did not complete".to_string(),
            })?;
            let node = node.realized(outputs)?;
            tracing::debug!("[realize] {} ({}) realized", node.id, node.kind);
            log.push(RealizationRecord {
                sequence: log.len(),
                id: node.id.clone(),
                kind: node.kind,
                batch: batch_index,
            });
            realized.insert(node.id.clone(), node);
        }
    }

    let nodes = order
        .iter()
        .filter_map(|id| realized.remove(id))
        .collect::<Vec<_>>();
    Ok((nodes, log))
}

/// FNV-1a, used to derive stable fake provider ids.
fn fingerprint(seed: &str) -> u64 {
    seed.bytes().fold(0xcbf29ce484222325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x100000001b3)
    })
}

/// Provisioner that computes outputs without talking to a cloud.
///
/// Ids are derived from the stack id and node id, so repeated builds of the
/// same descriptor produce the same outputs.
#[derive(Debug, Clone)]
pub struct OfflineProvisioner {
    stack_id: String,
    region: String,
}

impl OfflineProvisioner {
    pub fn new(stack_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            stack_id: stack_id.into(),
            region: region.into(),
        }
    }

    fn hex(&self, seed: &str) -> String {
        format!("{:016x}", fingerprint(&format!("{}/{}", self.stack_id, seed)))
    }

    fn scalar<'a>(params: &'a ResolvedParams, key: &str) -> Option<&'a str> {
        params.get(key).and_then(ResolvedValue::as_str)
    }

    fn outputs(&self, node: &ResourceNode, params: &ResolvedParams) -> TopologyResult<Outputs> {
        let id = node.id.as_str();
        let hash = self.hex(id);
        let short = &hash[..6];
        let region = self.region.as_str();
        let mut outputs = Outputs::new();

        match node.kind {
            ResourceKind::Network => {
                outputs.insert("vpc_id".into(), format!("vpc-0{hash}"));
                if let Some(cidr) = Self::scalar(params, "cidr") {
                    outputs.insert("vpc_cidr".into(), cidr.to_string());
                }
                for entry in params.get("subnets").map(|v| v.flatten()).unwrap_or_default() {
                    let subnet = entry.split_once('=').map(|(s, _)| s).unwrap_or(entry);
                    outputs.insert(
                        subnet_output_key(subnet),
                        format!("subnet-0{}", self.hex(subnet)),
                    );
                }
            }
            ResourceKind::SecurityGroup => {
                outputs.insert("group_id".into(), format!("sg-0{hash}"));
                if let Some(vpc_id) = Self::scalar(params, "vpc_id") {
                    outputs.insert("vpc_id".into(), vpc_id.to_string());
                }
            }
            ResourceKind::SubnetGroup => {
                let name = Self::scalar(params, "name").unwrap_or(id);
                outputs.insert("name".into(), name.to_string());
                let subnet_ids = params
                    .get("subnet_ids")
                    .map(|v| v.flatten().join(","))
                    .unwrap_or_default();
                outputs.insert("subnet_ids".into(), subnet_ids);
            }
            ResourceKind::DatabaseCluster => {
                let port = Self::scalar(params, "port")
                    .map(str::to_string)
                    .unwrap_or_else(|| POSTGRES_PORT.to_string());
                outputs.insert(
                    "endpoint_address".into(),
                    format!("{id}.cluster-{short}.{region}.rds.amazonaws.com"),
                );
                outputs.insert(
                    "read_endpoint_address".into(),
                    format!("{id}.cluster-ro-{short}.{region}.rds.amazonaws.com"),
                );
                outputs.insert("port".into(), port);
                if let Some(database) = Self::scalar(params, "database_name") {
                    outputs.insert("database_name".into(), database.to_string());
                }
                if Self::scalar(params, "credentials") == Some("managed") {
                    outputs.insert(
                        "secret_arn".into(),
                        format!(
                            "arn:aws:secretsmanager:{region}:{OFFLINE_ACCOUNT_ID}:secret:{id}-credentials-{short}"
                        ),
                    );
                }
            }
            ResourceKind::CacheCluster => {
                let multi_az = Self::scalar(params, "multi_az_enabled") == Some("true");
                let replicas = Self::scalar(params, "replicas_per_node_group").unwrap_or("0");
                if multi_az && replicas == "0" {
                    return Err(TopologyError::Realization {
                        node: id.to_string(),
                        message: "multi-AZ replication needs at least one replica".to_string(),
                    });
                }
                let port = Self::scalar(params, "port")
                    .map(str::to_string)
                    .unwrap_or_else(|| REDIS_PORT.to_string());
                outputs.insert(
                    "primary_endpoint_address".into(),
                    format!("master.{id}.{short}.{region}.cache.amazonaws.com"),
                );
                outputs.insert("primary_endpoint_port".into(), port.clone());
                outputs.insert(
                    "read_endpoint_addresses".into(),
                    format!("replica.{id}.{short}.{region}.cache.amazonaws.com"),
                );
                outputs.insert("read_endpoint_ports".into(), port);
            }
            ResourceKind::BastionHost => {
                outputs.insert("instance_id".into(), format!("i-0{hash}"));
            }
            ResourceKind::VpcConnector => {
                outputs.insert(
                    "connector_arn".into(),
                    format!("arn:aws:apprunner:{region}:{OFFLINE_ACCOUNT_ID}:vpcconnector/{id}/1/{hash}"),
                );
            }
            ResourceKind::ComputeService => {
                outputs.insert(
                    "service_arn".into(),
                    format!("arn:aws:apprunner:{region}:{OFFLINE_ACCOUNT_ID}:service/{id}/{hash}"),
                );
                outputs.insert(
                    "service_url".into(),
                    format!("https://{short}{}.{region}.awsapprunner.com", &hash[6..10]),
                );
            }
        }

        Ok(outputs)
    }
}

impl Provisioner for OfflineProvisioner {
    async fn realize(
        &self,
        node: &ResourceNode,
        params: &ResolvedParams,
    ) -> TopologyResult<Outputs> {
        self.outputs(node, params)
    }
}

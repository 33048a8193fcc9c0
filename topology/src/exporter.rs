// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Externally consumable outputs of a realized topology: the compute
//! environment, the local development environment, port-forwarding tunnels
//! and stack outputs.

use std::collections::BTreeMap;

use crate::access::{AccessGraph, Protocol};
use crate::configuration::DatabaseCredentials;
use crate::constants::{
    DEFAULT_PG_DATABASE, DEFAULT_PG_HOST, DEFAULT_PG_PASSWORD, DEFAULT_PG_PORT, DEFAULT_PG_USER,
    DEFAULT_REDIS_HOST, DEFAULT_REDIS_PORT, ENV_NODE_TLS_REJECT_UNAUTHORIZED, ENV_PG_DATABASE,
    ENV_PG_HOST, ENV_PG_PASSWORD, ENV_PG_PORT, ENV_PG_USER, ENV_REDIS_HOST, ENV_REDIS_PORT,
    LOCALHOST, POSTGRES_PORT, REDIS_PORT, TUNNEL_DOCUMENT_NAME,
};
use crate::errors::{TopologyError, TopologyResult};
use crate::models::{StackOutput, TunnelCommand, TunnelSpec};
use crate::resources::{ParamValue, ResourceKind, ResourceNode};

/// Port-forwarding command through a bastion host.
pub fn tunnel_command(bastion_instance_id: &str, host: &str, port: u16, local_port: u16) -> String {
    let quote = |value: &str| serde_json::Value::from(value).to_string();
    format!(
        "aws ssm start-session --target {} --document-name {} --parameters '{{\"host\":[{}],\"portNumber\":[{}], \"localPortNumber\":[{}]}}'",
        bastion_instance_id,
        TUNNEL_DOCUMENT_NAME,
        quote(host),
        quote(&port.to_string()),
        quote(&local_port.to_string()),
    )
}

/// Secret manager dynamic reference for one key of a JSON secret.
pub fn secret_reference(secret_arn: &str, key: &str) -> String {
    format!("{{{{resolve:secretsmanager:{secret_arn}:SecretString:{key}}}}}")
}

/// Port a tunnel target listens on. Realized outputs win over declared params.
fn target_port(node: &ResourceNode) -> TopologyResult<u16> {
    let (output_key, default) = match node.kind {
        ResourceKind::DatabaseCluster => ("port", POSTGRES_PORT),
        ResourceKind::CacheCluster => ("primary_endpoint_port", REDIS_PORT),
        kind => {
            return Err(TopologyError::Descriptor(format!(
                "{} ({kind}) cannot be a tunnel target",
                node.id
            )));
        }
    };
    let declared = match node.params.get("port") {
        Some(ParamValue::Literal(port)) => Some(port.as_str()),
        _ => None,
    };
    let Some(port) = node.output(output_key).or(declared) else {
        return Ok(default);
    };
    port.parse().map_err(|_| {
        TopologyError::Descriptor(format!("{} has an invalid port {port}", node.id))
    })
}

fn target_host(node: &ResourceNode) -> Option<&str> {
    match node.kind {
        ResourceKind::DatabaseCluster => node.output("endpoint_address"),
        ResourceKind::CacheCluster => node.output("primary_endpoint_address"),
        _ => None,
    }
}

fn find<'a>(nodes: &'a [ResourceNode], id: &str) -> TopologyResult<&'a ResourceNode> {
    nodes
        .iter()
        .find(|node| node.id == id)
        .ok_or_else(|| TopologyError::Descriptor(format!("unknown resource {id}")))
}

/// Checks that the bastion of `spec` may open the target port.
///
/// Works on unrealized nodes too, using the declared port.
pub fn check_tunnel(
    spec: &TunnelSpec,
    nodes: &[ResourceNode],
    access: &AccessGraph,
) -> TopologyResult<u16> {
    let bastion = find(nodes, &spec.bastion)?;
    if bastion.kind != ResourceKind::BastionHost {
        return Err(TopologyError::Descriptor(format!(
            "tunnel bastion {} is a {}",
            bastion.id, bastion.kind
        )));
    }
    let target = find(nodes, &spec.target)?;
    let port = target_port(target)?;
    if !access.can_reach(&bastion.security_groups, &target.security_groups, Protocol::Tcp, port) {
        return Err(TopologyError::UnreachableTarget {
            bastion: bastion.id.clone(),
            target: target.id.clone(),
            port,
        });
    }
    Ok(port)
}

/// Reads exported values from realized nodes.
pub struct Exporter<'a> {
    stack_id: &'a str,
    nodes: &'a [ResourceNode],
    access: &'a AccessGraph,
}

impl<'a> Exporter<'a> {
    pub fn new(stack_id: &'a str, nodes: &'a [ResourceNode], access: &'a AccessGraph) -> Self {
        Self {
            stack_id,
            nodes,
            access,
        }
    }

    fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &'a ResourceNode> + 'a {
        self.nodes.iter().filter(move |node| node.kind == kind)
    }

    /// The node of `kind` the compute service depends on, else the first one declared.
    fn source(&self, kind: ResourceKind) -> Option<&'a ResourceNode> {
        let service = self.of_kind(ResourceKind::ComputeService).next();
        service
            .and_then(|service| {
                let deps = service.dependencies();
                self.of_kind(kind).find(|node| deps.contains(node.id.as_str()))
            })
            .or_else(|| self.of_kind(kind).next())
    }

    /// `PG_*` and `REDIS_*` variables for the compute service. Every key is present.
    #[tracing::instrument(skip_all, fields(stack = self.stack_id))]
    pub fn environment(&self, credentials: &DatabaseCredentials) -> BTreeMap<String, String> {
        let database = self.source(ResourceKind::DatabaseCluster);
        let cache = self.source(ResourceKind::CacheCluster);
        let db_output = |key: &str| database.and_then(|node| node.output(key)).map(str::to_string);
        let cache_output = |key: &str| cache.and_then(|node| node.output(key)).map(str::to_string);
        let secret = database.and_then(|node| node.output("secret_arn"));

        let mut env = BTreeMap::new();
        env.insert(
            ENV_PG_HOST.to_string(),
            choose(ENV_PG_HOST, db_output("endpoint_address"), None, DEFAULT_PG_HOST),
        );
        env.insert(
            ENV_PG_PORT.to_string(),
            choose(ENV_PG_PORT, db_output("port"), None, DEFAULT_PG_PORT),
        );
        env.insert(
            ENV_PG_DATABASE.to_string(),
            choose(
                ENV_PG_DATABASE,
                db_output("database_name"),
                credentials.database.as_deref(),
                DEFAULT_PG_DATABASE,
            ),
        );
        env.insert(
            ENV_PG_USER.to_string(),
            choose(
                ENV_PG_USER,
                secret.map(|arn| secret_reference(arn, "username")),
                credentials.user.as_deref(),
                DEFAULT_PG_USER,
            ),
        );
        env.insert(
            ENV_PG_PASSWORD.to_string(),
            choose(
                ENV_PG_PASSWORD,
                secret.map(|arn| secret_reference(arn, "password")),
                credentials.password.as_deref(),
                DEFAULT_PG_PASSWORD,
            ),
        );
        env.insert(
            ENV_REDIS_HOST.to_string(),
            choose(
                ENV_REDIS_HOST,
                cache_output("primary_endpoint_address"),
                None,
                DEFAULT_REDIS_HOST,
            ),
        );
        env.insert(
            ENV_REDIS_PORT.to_string(),
            choose(
                ENV_REDIS_PORT,
                cache_output("primary_endpoint_port"),
                None,
                DEFAULT_REDIS_PORT,
            ),
        );
        env
    }

    /// Tunnel commands in declaration order.
    pub fn tunnels(&self, specs: &[TunnelSpec]) -> TopologyResult<Vec<TunnelCommand>> {
        specs
            .iter()
            .map(|spec| {
                let port = check_tunnel(spec, self.nodes, self.access)?;
                let bastion = find(self.nodes, &spec.bastion)?;
                let target = find(self.nodes, &spec.target)?;
                let instance_id =
                    bastion
                        .output("instance_id")
                        .ok_or_else(|| TopologyError::Realization {
                            node: bastion.id.clone(),
                            message: "bastion has no instance id".to_string(),
                        })?;
                let host = target_host(target).ok_or_else(|| TopologyError::Realization {
                    node: target.id.clone(),
                    message: "target has no endpoint address".to_string(),
                })?;
                tracing::debug!(
                    "[exporter] tunnel {} -> {}:{} on local port {}",
                    bastion.id,
                    host,
                    port,
                    spec.local_port
                );
                Ok(TunnelCommand {
                    bastion: bastion.id.clone(),
                    target: target.id.clone(),
                    host: host.to_string(),
                    port,
                    local_port: spec.local_port,
                    command: tunnel_command(instance_id, host, port, spec.local_port),
                })
            })
            .collect()
    }

    /// `environment` rewritten to reach the data tier through local tunnels.
    pub fn local_environment(
        &self,
        environment: &BTreeMap<String, String>,
        tunnels: &[TunnelCommand],
    ) -> BTreeMap<String, String> {
        let mut local = environment.clone();
        for tunnel in tunnels {
            let Some(target) = self.nodes.iter().find(|node| node.id == tunnel.target) else {
                continue;
            };
            let (host_key, port_key) = match target.kind {
                ResourceKind::DatabaseCluster => (ENV_PG_HOST, ENV_PG_PORT),
                ResourceKind::CacheCluster => (ENV_REDIS_HOST, ENV_REDIS_PORT),
                _ => continue,
            };
            local.insert(host_key.to_string(), LOCALHOST.to_string());
            local.insert(port_key.to_string(), tunnel.local_port.to_string());
        }
        if local.get(ENV_REDIS_HOST).map(String::as_str) == Some(LOCALHOST) {
            // the cache certificate is issued for the cluster endpoint, not localhost
            local.insert(ENV_NODE_TLS_REJECT_UNAUTHORIZED.to_string(), "0".to_string());
        }
        local
    }

    fn output_name(&self, base: &str, node: &ResourceNode, kind: ResourceKind) -> String {
        if self.of_kind(kind).count() > 1 {
            format!("{base}-{}-{}", node.id, self.stack_id)
        } else {
            format!("{base}-{}", self.stack_id)
        }
    }

    fn push(
        &self,
        outputs: &mut Vec<StackOutput>,
        name: String,
        value: Option<&str>,
        description: &str,
    ) {
        if let Some(value) = value {
            outputs.push(StackOutput {
                name,
                value: value.to_string(),
                description: Some(description.to_string()),
                export_name: None,
            });
        }
    }

    /// Named stack outputs. Only the VPC id is exported for other stacks.
    pub fn stack_outputs(&self) -> Vec<StackOutput> {
        let mut outputs = Vec::new();

        for network in self.of_kind(ResourceKind::Network) {
            if let Some(vpc_id) = network.output("vpc_id") {
                let name = self.output_name("AppVpcId", network, ResourceKind::Network);
                outputs.push(StackOutput {
                    name: name.clone(),
                    value: vpc_id.to_string(),
                    description: Some("VPC ID".to_string()),
                    export_name: Some(name),
                });
            }
        }

        for cache in self.of_kind(ResourceKind::CacheCluster) {
            let kind = ResourceKind::CacheCluster;
            self.push(
                &mut outputs,
                self.output_name("RedisPrimaryEndPointAddress", cache, kind),
                cache.output("primary_endpoint_address"),
                "Redis primary endpoint address",
            );
            self.push(
                &mut outputs,
                self.output_name("RedisPrimaryEndPointPort", cache, kind),
                cache.output("primary_endpoint_port"),
                "Redis primary endpoint port",
            );
            self.push(
                &mut outputs,
                self.output_name("RedisReadEndPointAddresses", cache, kind),
                cache.output("read_endpoint_addresses"),
                "Redis read endpoint addresses",
            );
            self.push(
                &mut outputs,
                self.output_name("RedisReadEndPointPortsList", cache, kind),
                cache.output("read_endpoint_ports"),
                "Redis read endpoint ports",
            );
        }

        for database in self.of_kind(ResourceKind::DatabaseCluster) {
            let kind = ResourceKind::DatabaseCluster;
            self.push(
                &mut outputs,
                self.output_name("PgEndPointAddress", database, kind),
                database.output("endpoint_address"),
                "PostgreSQL cluster endpoint address",
            );
            self.push(
                &mut outputs,
                self.output_name("PgEndPointPort", database, kind),
                database.output("port"),
                "PostgreSQL cluster endpoint port",
            );
            self.push(
                &mut outputs,
                self.output_name("PgSecretArn", database, kind),
                database.output("secret_arn"),
                "PostgreSQL credentials secret",
            );
        }

        for bastion in self.of_kind(ResourceKind::BastionHost) {
            self.push(
                &mut outputs,
                self.output_name("BastionInstanceId", bastion, ResourceKind::BastionHost),
                bastion.output("instance_id"),
                "Bastion host instance id",
            );
        }

        for service in self.of_kind(ResourceKind::ComputeService) {
            self.push(
                &mut outputs,
                self.output_name("ServiceUrl", service, ResourceKind::ComputeService),
                service.output("service_url"),
                "Compute service URL",
            );
        }

        outputs
    }
}

/// Managed value, else configured value, else the documented default.
fn choose(name: &str, managed: Option<String>, configured: Option<&str>, default: &str) -> String {
    if let Some(value) = managed {
        return value;
    }
    if let Some(value) = configured {
        tracing::warn!("[exporter] no managed value for {}, using configured value", name);
        return value.to_string();
    }
    tracing::warn!("[exporter] no managed value for {}, falling back to default", name);
    default.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{IngressRule, IngressSource};

    fn realized(node: ResourceNode, outputs: &[(&str, &str)]) -> ResourceNode {
        node.realized(
            outputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
        .unwrap()
    }

    fn fixture() -> (Vec<ResourceNode>, AccessGraph) {
        let mut access = AccessGraph::new();
        access.create_group("bastion-sg", "bastion").unwrap();
        let db_sg = access.create_data_tier_group("db-sg", "db").unwrap();
        access
            .allow(&db_sg, IngressRule::tcp(5432, IngressSource::group("bastion-sg")))
            .unwrap();
        let cache_sg = access.create_data_tier_group("cache-sg", "cache").unwrap();
        access
            .allow(&cache_sg, IngressRule::tcp(6379, IngressSource::group("cache-sg")))
            .unwrap();

        let mut bastion = ResourceNode::new("bastion", ResourceKind::BastionHost);
        bastion.security_groups = vec!["bastion-sg".to_string()];
        let mut database = ResourceNode::new("database", ResourceKind::DatabaseCluster);
        database.security_groups = vec!["db-sg".to_string()];
        let mut cache = ResourceNode::new("cache", ResourceKind::CacheCluster);
        cache.security_groups = vec!["cache-sg".to_string()];
        let service = ResourceNode::new("service", ResourceKind::ComputeService)
            .depends_on("database")
            .depends_on("cache");

        let nodes = vec![
            realized(
                ResourceNode::new("app-vpc", ResourceKind::Network),
                &[("vpc_id", "vpc-0123")],
            ),
            realized(bastion, &[("instance_id", "i-0abc123")]),
            realized(
                database,
                &[
                    ("endpoint_address", "db.internal"),
                    ("port", "5432"),
                    ("database_name", "orders"),
                    ("secret_arn", "arn:aws:secretsmanager:us-east-1:1:secret:db"),
                ],
            ),
            realized(
                cache,
                &[
                    ("primary_endpoint_address", "cache.internal"),
                    ("primary_endpoint_port", "6379"),
                    ("read_endpoint_addresses", "replica.internal"),
                    ("read_endpoint_ports", "6379"),
                ],
            ),
            realized(service, &[("service_url", "https://abc.awsapprunner.com")]),
        ];
        (nodes, access)
    }

    #[test]
    fn test_tunnel_command_is_exact() {
        assert_eq!(
            tunnel_command("i-0abc123", "db.internal", 5432, 5433),
            r#"aws ssm start-session --target i-0abc123 --document-name AWS-StartPortForwardingSessionToRemoteHost --parameters '{"host":["db.internal"],"portNumber":["5432"], "localPortNumber":["5433"]}'"#
        );
    }

    #[test]
    fn test_environment_prefers_secret_reference() {
        let (nodes, access) = fixture();
        let env = Exporter::new("dev", &nodes, &access).environment(&DatabaseCredentials {
            user: Some("ignored".to_string()),
            password: None,
            database: None,
        });
        assert_eq!(env[ENV_PG_HOST], "db.internal");
        assert_eq!(env[ENV_PG_PORT], "5432");
        assert_eq!(env[ENV_PG_DATABASE], "orders");
        assert_eq!(
            env[ENV_PG_USER],
            "{{resolve:secretsmanager:arn:aws:secretsmanager:us-east-1:1:secret:db:SecretString:username}}"
        );
        assert!(env[ENV_PG_PASSWORD].ends_with(":SecretString:password}}"));
        assert_eq!(env[ENV_REDIS_HOST], "cache.internal");
        assert_eq!(env[ENV_REDIS_PORT], "6379");
    }

    #[test]
    fn test_environment_falls_back_to_configuration_then_defaults() {
        let (nodes, access) = fixture();
        let nodes: Vec<ResourceNode> = nodes
            .into_iter()
            .filter(|node| node.kind != ResourceKind::DatabaseCluster)
            .collect();
        let credentials = DatabaseCredentials {
            user: Some("app".to_string()),
            password: None,
            database: None,
        };
        let env = Exporter::new("dev", &nodes, &access).environment(&credentials);
        assert_eq!(env.len(), 7);
        assert_eq!(env[ENV_PG_USER], "app");
        assert_eq!(env[ENV_PG_PASSWORD], DEFAULT_PG_PASSWORD);
        assert_eq!(env[ENV_PG_DATABASE], DEFAULT_PG_DATABASE);
        assert_eq!(env[ENV_PG_HOST], DEFAULT_PG_HOST);
        assert_eq!(env[ENV_PG_PORT], DEFAULT_PG_PORT);
        assert_eq!(env[ENV_REDIS_HOST], "cache.internal");
    }

    #[test]
    fn test_tunnels_require_reachability() {
        let (nodes, access) = fixture();
        let exporter = Exporter::new("dev", &nodes, &access);

        let tunnels = exporter
            .tunnels(&[TunnelSpec {
                bastion: "bastion".to_string(),
                target: "database".to_string(),
                local_port: 5433,
            }])
            .unwrap();
        assert_eq!(tunnels[0].host, "db.internal");
        assert_eq!(
            tunnels[0].command,
            tunnel_command("i-0abc123", "db.internal", 5432, 5433)
        );

        // the cache group only admits its own members
        let err = exporter
            .tunnels(&[TunnelSpec {
                bastion: "bastion".to_string(),
                target: "cache".to_string(),
                local_port: 6380,
            }])
            .unwrap_err();
        assert_eq!(
            err,
            TopologyError::UnreachableTarget {
                bastion: "bastion".to_string(),
                target: "cache".to_string(),
                port: 6379,
            }
        );
    }

    #[test]
    fn test_tunnel_rejects_non_bastion() {
        let (nodes, access) = fixture();
        let err = check_tunnel(
            &TunnelSpec {
                bastion: "service".to_string(),
                target: "database".to_string(),
                local_port: 5433,
            },
            &nodes,
            &access,
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::Descriptor(_)));
    }

    #[test]
    fn test_local_environment_uses_tunnels() {
        let (nodes, access) = fixture();
        let exporter = Exporter::new("dev", &nodes, &access);
        let env = exporter.environment(&DatabaseCredentials::default());
        let tunnels = vec![TunnelCommand {
            bastion: "bastion".to_string(),
            target: "cache".to_string(),
            host: "cache.internal".to_string(),
            port: 6379,
            local_port: 6380,
            command: String::new(),
        }];
        let local = exporter.local_environment(&env, &tunnels);
        assert_eq!(local[ENV_REDIS_HOST], LOCALHOST);
        assert_eq!(local[ENV_REDIS_PORT], "6380");
        assert_eq!(local[ENV_NODE_TLS_REJECT_UNAUTHORIZED], "0");
        assert_eq!(local[ENV_PG_HOST], "db.internal");

        let untouched = exporter.local_environment(&env, &[]);
        assert!(!untouched.contains_key(ENV_NODE_TLS_REJECT_UNAUTHORIZED));
    }

    #[test]
    fn test_stack_outputs() {
        let (nodes, access) = fixture();
        let outputs = Exporter::new("dev", &nodes, &access).stack_outputs();
        let names: Vec<&str> = outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "AppVpcId-dev",
                "RedisPrimaryEndPointAddress-dev",
                "RedisPrimaryEndPointPort-dev",
                "RedisReadEndPointAddresses-dev",
                "RedisReadEndPointPortsList-dev",
                "PgEndPointAddress-dev",
                "PgEndPointPort-dev",
                "PgSecretArn-dev",
                "BastionInstanceId-dev",
                "ServiceUrl-dev",
            ]
        );
        assert_eq!(outputs[0].export_name.as_deref(), Some("AppVpcId-dev"));
        assert!(outputs[1..].iter().all(|o| o.export_name.is_none()));
    }
}

// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use zeroize::ZeroizeOnDrop;

use crate::constants::{
    DEFAULT_CIDR, DEFAULT_REALIZE_CONCURRENCY, DEFAULT_REALIZE_TIMEOUT, DEFAULT_REGION,
    DEFAULT_STACK_ID, DEFAULT_ZONE_COUNT,
};
use crate::network::Ipv4Cidr;
use crate::variant::Variant;

#[derive(Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct TopologyOptions {
    /// JSON topology descriptor; when absent the variant preset is used
    #[arg(long, env("TOPOLOGY_DESCRIPTOR"))]
    pub descriptor: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "cache-db", env("TOPOLOGY_VARIANT"))]
    pub variant: Variant,
    #[arg(long, default_value = DEFAULT_STACK_ID, env("TOPOLOGY_STACK_ID"))]
    pub stack_id: String,
    #[arg(long, default_value = DEFAULT_CIDR, env("TOPOLOGY_CIDR"))]
    pub cidr: Ipv4Cidr,
    #[arg(long, default_value_t = DEFAULT_ZONE_COUNT, env("TOPOLOGY_ZONES"))]
    pub zones: usize,
    #[arg(long, default_value = DEFAULT_REGION, env("TOPOLOGY_REGION"))]
    pub region: String,
    #[arg(long, default_value = "false", env("TOPOLOGY_NO_BASTION"), action = ArgAction::SetTrue)]
    pub no_bastion: bool,
    #[arg(long, default_value_t = DEFAULT_REALIZE_TIMEOUT.as_secs(), env("TOPOLOGY_TIMEOUT_SECS"))]
    pub timeout_secs: u64,
    #[arg(long, default_value_t = DEFAULT_REALIZE_CONCURRENCY, env("TOPOLOGY_CONCURRENCY"))]
    pub concurrency: usize,
    #[arg(long, default_value = "false", env("TOPOLOGY_PLAN_ONLY"), action = ArgAction::SetTrue)]
    pub plan_only: bool,
    #[arg(long, env("TOPOLOGY_PG_USER"))]
    pub pg_user: Option<String>,
    #[arg(long, env("TOPOLOGY_PG_PASSWORD"), hide_env_values = true)]
    pub pg_password: Option<String>,
    #[arg(long, env("TOPOLOGY_PG_DATABASE"))]
    pub pg_database: Option<String>,
}

impl TopologyOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn credentials(&self) -> DatabaseCredentials {
        DatabaseCredentials {
            user: self.pg_user.clone(),
            password: self.pg_password.clone(),
            database: self.pg_database.clone(),
        }
    }
}

impl Default for TopologyOptions {
    fn default() -> Self {
        TopologyOptions {
            descriptor: None,
            variant: Variant::CacheDb,
            stack_id: DEFAULT_STACK_ID.to_string(),
            cidr: Ipv4Cidr::DEFAULT,
            zones: DEFAULT_ZONE_COUNT,
            region: DEFAULT_REGION.to_string(),
            no_bastion: false,
            timeout_secs: DEFAULT_REALIZE_TIMEOUT.as_secs(),
            concurrency: DEFAULT_REALIZE_CONCURRENCY,
            plan_only: true,
            pg_user: None,
            pg_password: None,
            pg_database: None,
        }
    }
}

// Custom Debug implementation to prevent accidental logging of the password
impl fmt::Debug for TopologyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyOptions")
            .field("descriptor", &self.descriptor)
            .field("variant", &self.variant)
            .field("stack_id", &self.stack_id)
            .field("cidr", &self.cidr.to_string())
            .field("zones", &self.zones)
            .field("region", &self.region)
            .field("no_bastion", &self.no_bastion)
            .field("timeout_secs", &self.timeout_secs)
            .field("concurrency", &self.concurrency)
            .field("plan_only", &self.plan_only)
            .field("pg_user", &self.pg_user)
            .field("pg_password", &self.pg_password.as_ref().map(|_| "[REDACTED]"))
            .field("pg_database", &self.pg_database)
            .finish()
    }
}

/// Explicit database credentials handed to the exporter.
///
/// Used only when a cluster does not expose a managed secret.
#[derive(Clone, Default, ZeroizeOnDrop)]
pub struct DatabaseCredentials {
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .finish()
    }
}

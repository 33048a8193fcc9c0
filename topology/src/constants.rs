// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

pub const DEFAULT_STACK_ID: &str = "dev";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_CIDR: &str = "11.192.0.0/16";
pub const DEFAULT_ZONE_COUNT: usize = 2;
pub const DEFAULT_TIER_MASK: u8 = 24;
pub const DEFAULT_REALIZE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_REALIZE_CONCURRENCY: usize = 4;

pub const POSTGRES_PORT: u16 = 5432;
pub const REDIS_PORT: u16 = 6379;

// Tiers created by every variant
pub const DATA_TIER: &str = "db";
pub const PUBLIC_TIER: &str = "dmz";

/// AWS Systems Manager document used for port forwarding through the bastion.
pub const TUNNEL_DOCUMENT_NAME: &str = "AWS-StartPortForwardingSessionToRemoteHost";

// Compute service environment contract
pub const ENV_PG_HOST: &str = "PG_HOST";
pub const ENV_PG_PORT: &str = "PG_PORT";
pub const ENV_PG_DATABASE: &str = "PG_DATABASE";
pub const ENV_PG_USER: &str = "PG_USER";
pub const ENV_PG_PASSWORD: &str = "PG_PASSWORD";
pub const ENV_REDIS_HOST: &str = "REDIS_HOST";
pub const ENV_REDIS_PORT: &str = "REDIS_PORT";
/// Only emitted for the local environment; the cache certificate does not match `localhost`.
pub const ENV_NODE_TLS_REJECT_UNAUTHORIZED: &str = "NODE_TLS_REJECT_UNAUTHORIZED";

// Documented defaults used when no managed value is available
pub const DEFAULT_PG_HOST: &str = "localhost";
pub const DEFAULT_PG_PORT: &str = "5432";
pub const DEFAULT_PG_DATABASE: &str = "nodedemo";
pub const DEFAULT_PG_USER: &str = "postgres";
pub const DEFAULT_PG_PASSWORD: &str = "yourpassword";
pub const DEFAULT_REDIS_HOST: &str = "localhost";
pub const DEFAULT_REDIS_PORT: &str = "6379";
pub const LOCALHOST: &str = "localhost";

// Cache cluster defaults
pub const CACHE_NODE_TYPE: &str = "cache.t4g.small";
pub const CACHE_ENGINE: &str = "redis";
pub const CACHE_ENGINE_VERSION: &str = "6.x";

// Database cluster defaults
pub const DATABASE_ENGINE: &str = "aurora-postgresql";
pub const BASTION_INSTANCE_TYPE: &str = "t3.nano";

/// Account id placed in synthesized ARNs by the offline provisioner.
pub const OFFLINE_ACCOUNT_ID: &str = "000000000000";

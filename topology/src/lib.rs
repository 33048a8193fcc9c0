// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! # VPC Topology
//!
//! Builds an isolated VPC topology for a data tier (a replicated cache cluster,
//! a relational database cluster, or both), decides the order in which its
//! resources must be created, and exports what clients need to reach it.
//!
//! ## Architecture
//!
//! ```text
//! Descriptor -> Allocator -> Access Graph -> Resolver -> Realizer -> Exporter
//!    |                                                      |
//!    +-- variant presets                                    +-> Provisioner
//! ```
//!
//! - **Subnet Allocation**: carves the VPC block into isolated and public tiers,
//!   one subnet per availability zone
//! - **Access Graph**: security groups and ingress rules; data-tier groups only
//!   accept other groups as sources
//! - **Dependency Resolution**: explicit and inferred edges, topological order,
//!   cycle detection and fan-out waves
//! - **Realization**: wave-by-wave creation through a [`realize::Provisioner`]
//! - **Export**: compute environment, local tunnels and stack outputs
//!
//! ## Modules
//!
//! - [`access`]: security groups, ingress rules and reachability queries
//! - [`configuration`]: CLI argument parsing with clap
//! - [`constants`]: defaults shared across the crate
//! - [`errors`]: error types
//! - [`exporter`]: environment maps, tunnel commands and stack outputs
//! - [`models`]: descriptor and build output types
//! - [`network`]: CIDR arithmetic and the subnet allocator
//! - [`pipeline`]: the typed build stages
//! - [`realize`]: provisioner trait, offline provisioner and the scheduler
//! - [`resolver`]: topological sort and waves
//! - [`resources`]: resource nodes and dependency inference
//! - [`variant`]: preset topologies
//!
//! ## Usage
//!
//! ```bash
//! vpc-topology --variant cache-db --stack-id dev --zones 2
//! vpc-topology --descriptor topology.json --plan-only
//! ```
//!
//! ## Security Considerations
//!
//! - Data-tier subnets have no route out of the VPC and no NAT gateway
//! - Address literals are never accepted as sources into a data-tier group
//! - Database credentials are referenced through the secret manager when
//!   available and zeroized on drop otherwise

pub mod access;
pub mod configuration;
pub mod constants;
pub mod errors;
pub mod exporter;
pub mod models;
pub mod network;
pub mod pipeline;
pub mod realize;
pub mod resolver;
pub mod resources;
pub mod variant;

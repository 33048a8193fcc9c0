// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vpc_topology::configuration::TopologyOptions;
use vpc_topology::models::TopologyDescriptor;
use vpc_topology::pipeline::{self, RealizeSettings};
use vpc_topology::realize::OfflineProvisioner;
use vpc_topology::variant::TopologyBuilder;

fn load_descriptor(options: &TopologyOptions) -> anyhow::Result<TopologyDescriptor> {
    match &options.descriptor {
        Some(path) => {
            tracing::info!("[topology] loading descriptor from {}", path.display());
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("unable to read {}", path.display()))?;
            TopologyDescriptor::from_json(&json)
                .with_context(|| format!("invalid descriptor {}", path.display()))
        }
        None => TopologyBuilder::new(&options.stack_id, options.variant)
            .region(&options.region)
            .cidr(options.cidr)
            .zones(options.zones)
            .bastion(!options.no_bastion)
            .build()
            .with_context(|| format!("unable to build the {} variant", options.variant)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        // this needs to be set to remove duplicated information in the log.
        .with_current_span(false)
        // this needs to be set to false, otherwise ANSI color codes will
        // show up in a confusing manner in CloudWatch logs.
        .with_ansi(false)
        // disabling time is handy because CloudWatch will add the ingestion time.
        .without_time()
        // remove the name of the function from every log entry
        .with_target(false)
        // stdout carries the build output
        .with_writer(std::io::stderr)
        .init();

    // get configuration options from arguments and environment variables
    let options = TopologyOptions::parse();

    tracing::info!("[topology] {:?}", &options);

    let descriptor = load_descriptor(&options)?;

    let json = if options.plan_only {
        let plan = pipeline::plan(descriptor).context("planning failed")?;
        serde_json::to_string_pretty(&plan)?
    } else {
        let provisioner = Arc::new(OfflineProvisioner::new(
            &descriptor.stack_id,
            &descriptor.region,
        ));
        let settings = RealizeSettings {
            timeout: options.timeout(),
            concurrency: options.concurrency,
        };
        let output = pipeline::build(descriptor, provisioner, settings, &options.credentials())
            .await
            .context("build failed")?;
        serde_json::to_string_pretty(&output)?
    };

    println!("{json}");
    Ok(())
}

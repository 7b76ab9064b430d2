// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Start the publisher.
//!
//! Startup is strictly sequential and every step is fatal on failure: read the configuration,
//! apply the process-wide settings, set up logging and metrics, build the bundle registry,
//! set up TLS, and finally bind and start the RPC server. The registry is complete before the
//! listener is bound, so no request is ever served with a partial set of bundles.

use std::{path::Path, sync::Arc};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    bundle::BundleRegistry,
    clock::{Clock, SystemClock},
    config::{load_config, PublisherConfig},
    debug, features,
    observability::{self, Metrics},
    profiling,
    publisher::{LogClient, Publisher, UnconfiguredLogClient},
    server::{self, Server, ServerBuilder},
};

/// Settings given on the command line, which take precedence over the configuration file.
///
/// Empty values leave the configuration untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub addr: String,
    pub debug_addr: String,
}

/// Apply the command-line overrides and fill in defaults the file left empty.
pub fn apply_overrides(config: &mut PublisherConfig, overrides: &Overrides) {
    if !overrides.addr.is_empty() {
        config.grpc.address = overrides.addr.clone();
    }
    if !overrides.debug_addr.is_empty() {
        config.debug_addr = overrides.debug_addr.clone();
    }
    if config.user_agent.is_empty() {
        config.user_agent = crate::DEFAULT_USER_AGENT.to_string();
    }
}

/// Run the publisher with the configuration at `config_path` until it is shut down.
///
/// The Tokio runtime is created here, rather than with `#[tokio::main]`, because blocking event
/// sampling has to be configured before the runtime's threads start.
pub fn run(config_path: &Path, overrides: &Overrides) -> anyhow::Result<()> {
    let mut config = load_config(config_path)
        .with_context(|| format!("Reading config file {}", config_path.display()))?;

    features::set(config.publisher.features.clone())?;
    profiling::set_block_profile_rate(config.publisher.block_profile_rate);
    let runtime = profiling::install(&mut tokio::runtime::Builder::new_multi_thread())
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    apply_overrides(&mut config.publisher, overrides);

    // Span export runs on the runtime, so the guard must be dropped before the runtime is.
    let (metrics, telemetry_guard) = {
        let _entered = runtime.enter();
        observability::stats_and_logging(&config)?
    };
    tracing::info!(version = %crate::version_string(), "Versions");
    log_settings(features::get(), profiling::block_profile_rate());

    let result = runtime.block_on(
        serve(config.publisher, metrics).instrument(tracing::info_span!("publisher")),
    );
    drop(telemetry_guard);
    result
}

/// Log the process-wide settings applied before logging was set up.
fn log_settings(features: &features::Features, block_profile_rate: u64) {
    for (name, value) in features.iter() {
        tracing::debug!(feature = name, enabled = value, "Feature flag configured");
    }
    if block_profile_rate != 0 {
        tracing::info!(rate = block_profile_rate, "Blocking event sampling enabled");
    }
}

/// Serve the publisher RPC service and, if configured, the debug server.
///
/// Returns once SIGTERM or SIGINT has been received and open connections have finished.
pub async fn serve(mut config: PublisherConfig, metrics: Metrics) -> anyhow::Result<()> {
    if let Some(credentials_directory) = std::env::var_os("CREDENTIALS_DIRECTORY") {
        config
            .tls
            .with_credentials_dir(Path::new(&credentials_directory))
            .context("TLS config")?;
    }

    let debug_halt_token = CancellationToken::new();
    let debug_server = if config.debug_addr.is_empty() {
        None
    } else {
        Some(debug::listen(&config.debug_addr, metrics.clone(), debug_halt_token.clone()).await?)
    };

    let server = build_server(
        &config,
        metrics,
        Arc::new(SystemClock),
        Arc::new(UnconfiguredLogClient),
    )
    .await?;
    tokio::spawn(server::signal_handler(server.halt_token()));
    let result = server.start().await.context("Publisher gRPC service failed");

    debug_halt_token.cancel();
    if let Some(debug_server) = debug_server {
        debug_server.wait_to_finish().await?;
    }
    result
}

/// Load the bundle registry, set up TLS, and bind the publisher's RPC server.
///
/// The returned server has not started accepting connections; call [`Server::start`].
pub async fn build_server(
    config: &PublisherConfig,
    metrics: Metrics,
    clock: Arc<dyn Clock>,
    log_client: Arc<dyn LogClient>,
) -> anyhow::Result<Server> {
    let bundles = BundleRegistry::from_chains(config.chains.as_deref())?;
    tracing::info!(issuers = bundles.len(), "Loaded CT bundles");

    let tls = config.tls.ssl_acceptor().context("TLS config")?;
    let publisher = Publisher::new(
        Arc::new(bundles),
        config.user_agent.clone(),
        log_client,
        metrics.clone(),
        clock.clone(),
    );

    ServerBuilder::new(config.grpc.clone())
        .add(Arc::new(publisher))
        .build(tls, metrics, clock)
        .await
        .context("Unable to setup Publisher gRPC server")
}

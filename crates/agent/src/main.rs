//! Fleet Agent - validator host monitoring agent
//!
//! Runs next to the chain node containers on one host, streams their
//! resource usage and sync health to the relay, and serves local health,
//! metrics and status endpoints.

use agent_lib::{
    collector::{CommandRunner, DockerCli, StatsCollector},
    command::DockerCommandHandler,
    health::{components, HealthRegistry},
    host::HostSampler,
    monitor::{EntitySource, MonitoringLoop, PayloadSink},
    observability::{AgentMetrics, StructuredLogger},
    sync::{ChannelError, TransportChannel},
};
use anyhow::Result;
use fleet_agent::{api, config::AgentConfig, AGENT_VERSION};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleet-agent");

    let config = AgentConfig::load()?;
    let channel_config = config.channel_config()?;
    let patterns = config.node_patterns();

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&channel_config.server_id);
    logger.log_startup(AGENT_VERSION, &channel_config.describe_target(), &patterns);

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let runner: Arc<dyn CommandRunner> = Arc::new(DockerCli::new());

    let collector = if config.no_docker {
        info!("Container stats disabled, reporting host metrics only");
        None
    } else {
        let collector = Arc::new(StatsCollector::docker(config.stats_config()));
        match collector.start(&patterns).await {
            Ok(true) => info!(entities = collector.entity_count().await, "Stats collection started"),
            Ok(false) => {
                health_registry
                    .set_degraded(components::STATS_COLLECTOR, "no entities observed yet")
                    .await
            }
            Err(e) => {
                error!(error = %e, "Failed to start stats collection");
                health_registry
                    .set_unhealthy(components::STATS_COLLECTOR, e.to_string())
                    .await;
            }
        }
        Some(collector)
    };

    let channel = TransportChannel::builder()
        .config(channel_config)
        .command_handler(Arc::new(DockerCommandHandler::new(runner.clone())))
        .build()?;

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics.clone(),
        channel.clone(),
        collector.clone(),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown.clone()));

    let established = tokio::select! {
        result = channel.establish(config.max_retries) => result,
        _ = shutdown.cancelled() => Err(ChannelError::ShuttingDown),
    };

    let mut report = None;
    match established {
        Ok(()) => {
            health_registry.set_healthy(components::TRANSPORT).await;
            health_registry.set_ready(true).await;

            let host = HostSampler::new(
                config.host_overrides(),
                collector.is_some().then(|| runner.clone()),
            );
            let entities = collector
                .clone()
                .map(|collector| collector as Arc<dyn EntitySource>);
            let sink: Arc<dyn PayloadSink> = Arc::new(channel.clone());
            let monitor = MonitoringLoop::new(
                config.monitor_config(),
                Box::new(host),
                entities,
                sink,
                health_registry.clone(),
            );
            report = Some(monitor.run(shutdown.clone()).await);
            logger.log_shutdown("signal received");
        }
        Err(ChannelError::ShuttingDown) => logger.log_shutdown("signal received before registration"),
        Err(e) => {
            error!(error = %e, "Could not reach the relay");
            logger.log_shutdown("initial connection failed");
            shutdown.cancel();
            stop_components(collector.as_deref(), &channel).await;
            return Err(e.into());
        }
    }

    shutdown.cancel();
    stop_components(collector.as_deref(), &channel).await;

    let ticks = report.map(|r| r.ticks).unwrap_or_default();
    logger.log_final_summary(&channel.totals(), ticks);

    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }
    signals.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Stop collection before the transport so the last payloads are not cut off
async fn stop_components(collector: Option<&StatsCollector>, channel: &TransportChannel) {
    if let Some(collector) = collector {
        collector.stop().await;
    }
    channel.shutdown().await;
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = terminate.recv() => info!("SIGTERM received"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::export::metrics::RelayMetrics;
use crate::export::MetricsServer;
use crate::source::redis::RedisSource;
use crate::source::EventSource;

/// Agent wires the event source, dispatcher and metrics server together.
pub struct Agent {
    cfg: Config,
    metrics: Arc<RelayMetrics>,
    server: MetricsServer,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, building every metric series.
    pub fn new(cfg: Config) -> Result<Self> {
        let byte_rate = cfg
            .buckets
            .byte_rate
            .thresholds()
            .context("building byte rate buckets")?;
        let packet_rate = cfg
            .buckets
            .packet_rate
            .thresholds()
            .context("building packet rate buckets")?;

        let metrics =
            Arc::new(RelayMetrics::new(byte_rate, packet_rate).context("creating relay metrics")?);
        let server = MetricsServer::new(metrics.registry().clone(), &cfg.metrics.addr);

        Ok(Self {
            cfg,
            metrics,
            server,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start serving metrics and consuming events from Redis.
    pub async fn start(&mut self) -> Result<()> {
        let source = RedisSource::new(self.cfg.redis.clone(), Arc::clone(&self.metrics))
            .context("creating redis source")?;
        self.start_with(source).await
    }

    /// Start serving metrics and consuming events from `source`.
    pub async fn start_with<S>(&mut self, mut source: S) -> Result<()>
    where
        S: EventSource + 'static,
    {
        // 1. Metrics server first so probes respond during reconciliation.
        self.server
            .start()
            .await
            .context("starting metrics server")?;

        let mut dispatcher = Dispatcher::new(Arc::clone(&self.metrics));

        // 2. Count allocations that exist before we subscribe.
        if self.cfg.redis.reconcile_on_start {
            info!(source = source.name(), "initializing allocation count");
            let keys = source
                .existing_allocations()
                .await
                .context("listing existing allocations")?;
            let counted = dispatcher.reconcile(&keys);
            info!(existing = keys.len(), counted, "allocation count initialized");
        }

        // 3. Dispatcher consumes what the source forwards.
        let (tx, rx) = mpsc::channel(self.cfg.event_queue_size);

        let dispatcher_cancel = self.cancel.child_token();
        self.tasks.push(tokio::spawn(async move {
            dispatcher.run(rx, dispatcher_cancel).await;
        }));

        let source_cancel = self.cancel.child_token();
        let source_name = source.name().to_string();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = source.run(tx, source_cancel).await {
                error!(source = %source_name, error = %e, "event source stopped");
            }
        }));

        info!(
            metrics_addr = %self.cfg.metrics.addr,
            queue_size = self.cfg.event_queue_size,
            "agent fully started",
        );

        Ok(())
    }

    /// Relay metrics served by this agent.
    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Address the metrics server is bound to, once started.
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.local_addr()
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "background task panicked");
            }
        }

        self.server.stop().await?;

        Ok(())
    }
}

//! coturn statsdb over Redis publish/subscribe.
//!
//! coturn publishes allocation events on channels below `turn/realm/...`
//! and keeps a `.../status` key for every live allocation. The source
//! pattern-subscribes to the former and lists the latter for startup
//! reconciliation.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::EventSource;
use crate::config::RedisConfig;
use crate::event::RawMessage;
use crate::export::metrics::RelayMetrics;

/// Why a subscription session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    Disconnected,
    ReceiverClosed,
}

/// Redis-backed [`EventSource`].
pub struct RedisSource {
    client: redis::Client,
    cfg: RedisConfig,
    metrics: Arc<RelayMetrics>,
}

impl RedisSource {
    /// Creates a source for the configured server. Does not connect yet.
    pub fn new(cfg: RedisConfig, metrics: Arc<RelayMetrics>) -> Result<Self> {
        let client = redis::Client::open(cfg.url.as_str()).context("parsing redis url")?;

        Ok(Self {
            client,
            cfg,
            metrics,
        })
    }

    /// Runs one subscription session until it ends.
    async fn subscribe(
        &self,
        tx: &mpsc::Sender<RawMessage>,
        ctx: &CancellationToken,
    ) -> Result<SessionEnd> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("connecting to redis")?;
        pubsub
            .psubscribe(self.cfg.channel_pattern.as_str())
            .await
            .with_context(|| format!("subscribing to {}", self.cfg.channel_pattern))?;

        info!(pattern = %self.cfg.channel_pattern, "watching allocation events");

        let mut messages = pubsub.on_message();

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(SessionEnd::Cancelled),
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        return Ok(SessionEnd::Disconnected);
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(channel = msg.get_channel_name(), error = %e, "unreadable payload");
                            continue;
                        }
                    };

                    let message = RawMessage::new(msg.get_channel_name(), payload);
                    if tx.send(message).await.is_err() {
                        return Ok(SessionEnd::ReceiverClosed);
                    }
                }
            }
        }
    }
}

impl EventSource for RedisSource {
    fn name(&self) -> &str {
        "redis"
    }

    async fn existing_allocations(&mut self) -> Result<Vec<String>> {
        let mut con = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("connecting to redis")?;

        let keys: Vec<String> = con
            .keys(self.cfg.status_key_pattern.as_str())
            .await
            .with_context(|| format!("listing {}", self.cfg.status_key_pattern))?;

        Ok(keys)
    }

    async fn run(self, tx: mpsc::Sender<RawMessage>, ctx: CancellationToken) -> Result<()> {
        loop {
            match self.subscribe(&tx, &ctx).await {
                Ok(SessionEnd::Cancelled) | Ok(SessionEnd::ReceiverClosed) => return Ok(()),
                Ok(SessionEnd::Disconnected) => {
                    warn!(source = self.name(), "subscription closed by server");
                }
                Err(e) => {
                    warn!(source = self.name(), error = %e, "subscription failed");
                }
            }

            self.metrics.source_reconnects.inc();

            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.cfg.reconnect_backoff) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauge::Thresholds;

    fn metrics() -> Arc<RelayMetrics> {
        Arc::new(
            RelayMetrics::new(
                Thresholds::new(vec![16384.0]).expect("thresholds"),
                Thresholds::new(vec![50.0]).expect("thresholds"),
            )
            .expect("metrics"),
        )
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        let cfg = RedisConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(RedisSource::new(cfg, metrics()).is_err());
    }

    #[test]
    fn test_new_accepts_default_url() {
        let source = RedisSource::new(RedisConfig::default(), metrics()).expect("valid url");
        assert_eq!(source.name(), "redis");
    }
}

//! Prometheus metrics for the RBAC server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use chrono::Utc;
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

use crate::cache::Store;

const METRIC_NAMESPACE: &str = "llmo";

#[derive(Clone)]
pub struct RbacMetrics {
    registry: Registry,
    since_last_cache_sync_sec: Gauge,
}

impl RbacMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let since_last_cache_sync_sec = Gauge::with_opts(
            Opts::new(
                "rbac_server_since_last_cache_sync_sec",
                "Seconds since the last successful cache sync",
            )
            .namespace(METRIC_NAMESPACE),
        )?;
        registry.register(Box::new(since_last_cache_sync_sec.clone()))?;

        Ok(Self {
            registry,
            since_last_cache_sync_sec,
        })
    }

    /// Samples the cache sync age until `shutdown` fires.
    ///
    /// Before the first successful sync the gauge reports the time since the
    /// sampler started, so it keeps drifting upward when upstreams are down.
    pub async fn run(
        &self,
        store: Arc<Store>,
        sample_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(?sample_interval, "Starting metrics monitor");
        let started_at = Utc::now();
        let mut ticker = interval(sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let last = store.last_successful_sync_time().unwrap_or(started_at);
                    let age_ms = (Utc::now() - last).num_milliseconds().max(0);
                    self.since_last_cache_sync_sec.set(age_ms as f64 / 1000.0);
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}

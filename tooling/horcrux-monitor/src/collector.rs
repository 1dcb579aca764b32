use crate::{
    checks::{METRICS_TARGET, cosigner_target, sentry_target},
    config::AppConfig,
    models::{CycleInput, MetricsSnapshot, ProbeKind, ProbeResult},
    prometheus,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::{net::TcpStream, time};
use tracing::debug;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no metrics url configured")]
    MissingMetricsUrl,
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid block height: {0}")]
    InvalidHeight(String),
}

/// Produces one cycle's observations. Never fails: every problem is
/// reported as a failed probe or a missing snapshot.
#[async_trait::async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn collect(&self) -> CycleInput;
}

#[derive(Debug, Clone)]
struct Endpoint {
    target: String,
    address: String,
}

#[derive(Debug, Clone)]
pub struct Collector {
    client: Client,
    metrics_url: Option<String>,
    tcp_timeout: Duration,
    rpc_port: u16,
    cosigners: Vec<Endpoint>,
    sentries: Vec<Endpoint>,
}

impl Collector {
    pub fn new(config: &AppConfig) -> Result<Self, CollectorError> {
        let client = Client::builder().timeout(config.metrics_timeout).build()?;

        let cosigners = config
            .cluster
            .cosigners
            .iter()
            .filter(|cosigner| !cosigner.is_self)
            .map(|cosigner| Endpoint {
                target: cosigner_target(cosigner.shard_id),
                address: strip_scheme(&cosigner.address).to_owned(),
            })
            .collect();
        let sentries = config
            .cluster
            .sentries
            .iter()
            .map(|sentry| Endpoint {
                target: sentry_target(sentry.index),
                address: strip_scheme(&sentry.address).to_owned(),
            })
            .collect();

        Ok(Self {
            client,
            metrics_url: config.cluster.metrics_url.clone(),
            tcp_timeout: Duration::from_secs(config.thresholds.tcp_timeout),
            rpc_port: config.thresholds.rpc_port,
            cosigners,
            sentries,
        })
    }

    async fn scrape_metrics(&self, captured_at: DateTime<Utc>) -> Result<MetricsSnapshot, CollectorError> {
        let url = self.metrics_url.as_ref().ok_or(CollectorError::MissingMetricsUrl)?;
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(prometheus::parse_exposition(&body, captured_at))
    }

    async fn connect(&self, address: &str) -> Result<Option<f64>, CollectorError> {
        time::timeout(self.tcp_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| CollectorError::Timeout(self.tcp_timeout))??;
        Ok(None)
    }

    async fn block_height(&self, address: &str) -> Result<Option<f64>, CollectorError> {
        let (host, _) = address
            .rsplit_once(':')
            .ok_or_else(|| CollectorError::InvalidAddress(address.to_owned()))?;
        let url = format!("http://{host}:{}/status", self.rpc_port);

        let status = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<StatusResponse>()
            .await?;

        let raw = status.result.sync_info.latest_block_height;
        let height = raw
            .parse::<f64>()
            .ok()
            .filter(|height| height.is_finite() && *height >= 0.0)
            .ok_or(CollectorError::InvalidHeight(raw))?;
        Ok(Some(height))
    }

    /// Sentries are probed over RPC only. Their `privValAddr` is the
    /// validator's privval listener, which is left alone.
    async fn probe_sentry(&self, sentry: &Endpoint) -> ProbeResult {
        to_probe(&sentry.target, ProbeKind::RpcHeight, self.block_height(&sentry.address).await)
    }
}

#[async_trait::async_trait]
impl SnapshotSource for Collector {
    async fn collect(&self) -> CycleInput {
        let captured_at = Utc::now();

        let cosigner_probes = join_all(self.cosigners.iter().map(|cosigner| async move {
            to_probe(&cosigner.target, ProbeKind::Tcp, self.connect(&cosigner.address).await)
        }));
        let sentry_probes = join_all(self.sentries.iter().map(|sentry| self.probe_sentry(sentry)));

        let (scrape, cosigners, sentries) = tokio::join!(
            self.scrape_metrics(captured_at),
            cosigner_probes,
            sentry_probes
        );

        let mut input = CycleInput::new(captured_at);
        match scrape {
            Ok(snapshot) => {
                debug!(samples = snapshot.len(), "metrics scraped");
                input.probes.push(ProbeResult::ok(METRICS_TARGET, ProbeKind::MetricsScrape, None));
                input.snapshot = Some(snapshot);
            }
            Err(error) => {
                debug!(%error, "metrics scrape failed");
                input.probes.push(ProbeResult::failed(
                    METRICS_TARGET,
                    ProbeKind::MetricsScrape,
                    error.to_string(),
                ));
            }
        }
        input.probes.extend(cosigners);
        input.probes.extend(sentries);
        input
    }
}

fn to_probe(target: &str, kind: ProbeKind, outcome: Result<Option<f64>, CollectorError>) -> ProbeResult {
    match outcome {
        Ok(value) => ProbeResult::ok(target, kind, value),
        Err(error) => {
            debug!(target, %kind, %error, "probe failed");
            ProbeResult::failed(target, kind, error.to_string())
        }
    }
}

fn strip_scheme(address: &str) -> &str {
    address
        .split_once("://")
        .map_or(address, |(_, rest)| rest)
        .trim_end_matches('/')
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    result: StatusResult,
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    latest_block_height: String,
}

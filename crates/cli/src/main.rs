use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use altc_client::{AuthConfig, ClientCredentials, HttpSender, DEFAULT_ENDPOINT};
use altc_controller::{Controller, ControllerConfig};
use altc_kubehub::{tracked_resources, KubeWatchCache};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "altc-agent", version, about = "Ships periodic snapshots of cluster objects to the Altc collector")]
struct Config {
    /// Maximum resource items per snapshot (0 sends one item at a time)
    #[arg(long, env = "BATCH_LIMIT", default_value_t = 0, value_parser = parse_batch_limit)]
    batch_limit: usize,

    /// Seconds between collection cycles
    #[arg(long = "snapshot-interval-seconds", env = "SNAPSHOT_INTERVAL_SECONDS", default_value_t = 30)]
    interval_secs: u64,

    /// Cluster display name attached to every snapshot
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: String,

    #[arg(long, env = "COLLECTOR_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    collector_endpoint: String,

    /// Gzip request bodies
    #[arg(long, env = "SEND_GZIP", default_value_t = true, action = ArgAction::Set)]
    send_gzip: bool,

    /// Token endpoint for the client-credentials grant
    #[arg(long, env = "AUTH_URI")]
    auth_uri: String,

    #[arg(long, env = "AUTH_CLIENT_ID")]
    auth_client_id: String,

    #[arg(long, env = "AUTH_SECRET", hide_env_values = true)]
    auth_secret: String,

    /// Base64-encoded JWKS document
    #[arg(long, env = "AUTH_PUBLIC_KEY_SET", hide_env_values = true)]
    auth_public_key_set: String,

    /// Base64-encoded expected token issuer
    #[arg(long, env = "AUTH_ISSUER")]
    auth_issuer: String,

    /// Base64-encoded expected token audience
    #[arg(long, env = "AUTH_AUDIENCE")]
    auth_audience: String,

    /// Tracing filter
    #[arg(long, env = "ALTC_LOG", default_value = "info")]
    log: String,

    /// host:port for the Prometheus exporter
    #[arg(long, env = "ALTC_METRICS_ADDR")]
    metrics_addr: Option<String>,
}

/// An empty value counts as unset.
fn parse_batch_limit(raw: &str) -> Result<usize, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse::<usize>().map_err(|e| format!("invalid batch limit {:?}: {}", raw, e))
}

impl Config {
    fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            cluster_name: self.cluster_name.clone(),
            batch_limit: self.batch_limit,
            interval: Duration::from_secs(self.interval_secs),
        }
    }

    fn auth(&self) -> Result<AuthConfig> {
        AuthConfig::from_encoded(
            &self.auth_uri,
            &self.auth_client_id,
            &self.auth_secret,
            &self.auth_public_key_set,
            &self.auth_issuer,
            &self.auth_audience,
        )
        .context("invalid auth configuration")
    }
}

fn init_tracing(env: &str) {
    let filter = tracing_subscriber::EnvFilter::from_str(env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid ALTC_METRICS_ADDR; expected host:port");
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("termination signal received; shutting down");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler; waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config.log);
    init_metrics(config.metrics_addr.as_deref());
    info!(
        cluster = %config.cluster_name,
        batch_limit = config.batch_limit,
        interval_secs = config.interval_secs,
        endpoint = %config.collector_endpoint,
        gzip = config.send_gzip,
        auth_uri = %config.auth_uri,
        "configuration loaded"
    );
    if config.batch_limit == 0 {
        warn!("BATCH_LIMIT is 0; snapshots will carry a single resource item each");
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let credentials = Arc::new(ClientCredentials::new(config.auth()?)?);
    let sender = HttpSender::new(config.collector_endpoint.clone(), credentials)?.with_gzip(config.send_gzip);

    let client = kube::Client::try_default().await.context("building kube client")?;
    let (cache, watchers) = KubeWatchCache::start(client, tracked_resources(), cancel.clone());
    info!(kinds = cache.kinds().count(), "watchers started");

    let controller = Controller::new(config.controller(), Arc::new(cache), Arc::new(sender));
    let res = controller.run(cancel.clone()).await;

    cancel.cancel();
    for watcher in watchers {
        let _ = watcher.await;
    }
    if let Err(e) = &res {
        error!(error = ?e, "agent stopped with error");
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 15] = [
        "altc-agent",
        "--cluster-name",
        "prod-eu",
        "--auth-uri",
        "https://auth.example/oauth/token",
        "--auth-client-id",
        "agent",
        "--auth-secret",
        "s3cret",
        "--auth-public-key-set",
        "eyJrZXlzIjpbXX0=",
        "--auth-issuer",
        "aXNz",
        "--auth-audience",
        "YXVk",
    ];

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let cfg = Config::try_parse_from(REQUIRED).unwrap();
        assert_eq!(cfg.batch_limit, 0);
        assert_eq!(cfg.interval_secs, 30);
        assert_eq!(cfg.collector_endpoint, DEFAULT_ENDPOINT);
        assert!(cfg.send_gzip);
        let ctl = cfg.controller();
        assert_eq!(ctl.interval, Duration::from_secs(30));
        assert_eq!(ctl.cluster_name, "prod-eu");
    }

    #[test]
    fn gzip_can_be_disabled() {
        let args: Vec<&str> = REQUIRED.iter().copied().chain(["--send-gzip", "false", "--batch-limit", "25"]).collect();
        let cfg = Config::try_parse_from(args).unwrap();
        assert!(!cfg.send_gzip);
        assert_eq!(cfg.controller().batch_limit, 25);
    }

    #[test]
    fn empty_batch_limit_counts_as_unset() {
        let args: Vec<&str> = REQUIRED.iter().copied().chain(["--batch-limit", ""]).collect();
        let cfg = Config::try_parse_from(args).unwrap();
        assert_eq!(cfg.batch_limit, 0);

        let args: Vec<&str> = REQUIRED.iter().copied().chain(["--batch-limit", "many"]).collect();
        assert!(Config::try_parse_from(args).is_err());
    }

    #[test]
    fn empty_key_set_is_rejected() {
        let cfg = Config::try_parse_from(REQUIRED).unwrap();
        assert!(cfg.auth().is_err());
    }

    #[test]
    fn cluster_name_is_required() {
        let args: Vec<&str> = REQUIRED.iter().copied().filter(|a| *a != "--cluster-name" && *a != "prod-eu").collect();
        assert!(Config::try_parse_from(args).is_err());
    }
}

//! Node status polling
//!
//! Reads a running node's own view of the chain: the CometBFT RPC `/status`
//! and `/net_info` endpoints, and the Prometheus text on the metrics port.
//! Only `/status` is required; the other two fill in peers and signing
//! statistics when they answer.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::debug;

use crate::compiler::ObjectNames;
use crate::crd::ManagedNodeSpec;
use crate::Error;

/// Prometheus gauge with the connected peer count
pub const PEERS_METRIC: &str = "tendermint_p2p_peers";
/// Prometheus gauge with the validator's missed blocks
pub const MISSED_BLOCKS_METRIC: &str = "tendermint_consensus_validator_missed_blocks";
/// Prometheus gauge with the validator's last signed height
pub const LAST_SIGNED_METRIC: &str = "tendermint_consensus_validator_last_signed_height";

/// Endpoints of one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollTarget {
    /// Base URL of the CometBFT RPC server; `None` when RPC is disabled
    pub rpc_url: Option<String>,
    /// Full URL of the Prometheus endpoint; `None` when monitoring is disabled
    pub metrics_url: Option<String>,
}

impl PollTarget {
    /// Endpoints reachable through the node's Service
    pub fn for_node(spec: &ManagedNodeSpec, names: &ObjectNames, namespace: &str) -> Self {
        let host = format!("{}.{namespace}.svc", names.service);
        let rpc = &spec.networking.rpc;
        let metrics = &spec.monitoring;
        Self {
            rpc_url: rpc
                .enabled
                .then(|| format!("http://{host}:{}", rpc.port)),
            metrics_url: metrics.enabled.then(|| {
                format!(
                    "http://{host}:{}{}",
                    metrics.metrics_endpoint.port, metrics.metrics_endpoint.path
                )
            }),
        }
    }

    /// True when no poll can succeed
    pub fn is_empty(&self) -> bool {
        self.rpc_url.is_none()
    }
}

/// Signing details of a validator as the node reports them
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatorObservation {
    /// Consensus address
    pub address: String,
    /// Voting power
    pub voting_power: u64,
    /// Blocks missed in the signing window, if exported
    pub missed_blocks: Option<u64>,
    /// Last height signed, if exported
    pub last_signed_height: Option<u64>,
}

/// One successful poll of a node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeObservation {
    /// Node ID
    pub node_id: String,
    /// Chain ID the node is running
    pub network: Option<String>,
    /// Latest committed height
    pub height: u64,
    /// Node still catching up
    pub catching_up: bool,
    /// Connected peers, if either source answered
    pub peers: Option<u32>,
    /// Validator details
    pub validator: Option<ValidatorObservation>,
}

/// Polls a node for its sync, peer and signing state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusPoller: Send + Sync {
    /// Poll `target`; fails when `/status` cannot be read
    async fn poll(&self, target: &PollTarget) -> Result<NodeObservation, Error>;
}

// CometBFT wire format. Numbers arrive as strings.

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct StatusResult {
    node_info: NodeInfoWire,
    sync_info: SyncInfoWire,
    #[serde(default)]
    validator_info: Option<ValidatorInfoWire>,
}

#[derive(Deserialize)]
struct NodeInfoWire {
    id: String,
    #[serde(default)]
    network: Option<String>,
}

#[derive(Deserialize)]
struct SyncInfoWire {
    latest_block_height: String,
    #[serde(default)]
    catching_up: bool,
}

#[derive(Deserialize)]
struct ValidatorInfoWire {
    address: String,
    #[serde(default)]
    voting_power: String,
}

#[derive(Deserialize)]
struct NetInfoResult {
    n_peers: String,
}

fn parse_number(endpoint: &str, field: &str, value: &str) -> Result<u64, Error> {
    value
        .parse()
        .map_err(|_| Error::poll(endpoint, format!("{field} is not a number: {value:?}")))
}

/// Parse a `/status` response body
pub fn parse_status(endpoint: &str, body: &str) -> Result<NodeObservation, Error> {
    let response: RpcResponse<StatusResult> = serde_json::from_str(body)
        .map_err(|e| Error::poll(endpoint, format!("malformed status response: {e}")))?;
    let status = response.result;

    let validator = match status.validator_info {
        Some(v) if !v.address.is_empty() => Some(ValidatorObservation {
            voting_power: if v.voting_power.is_empty() {
                0
            } else {
                parse_number(endpoint, "voting_power", &v.voting_power)?
            },
            address: v.address,
            missed_blocks: None,
            last_signed_height: None,
        }),
        _ => None,
    };

    Ok(NodeObservation {
        node_id: status.node_info.id,
        network: status.node_info.network,
        height: parse_number(
            endpoint,
            "latest_block_height",
            &status.sync_info.latest_block_height,
        )?,
        catching_up: status.sync_info.catching_up,
        peers: None,
        validator,
    })
}

/// Parse a `/net_info` response body into a peer count
pub fn parse_net_info(endpoint: &str, body: &str) -> Result<u32, Error> {
    let response: RpcResponse<NetInfoResult> = serde_json::from_str(body)
        .map_err(|e| Error::poll(endpoint, format!("malformed net_info response: {e}")))?;
    response
        .result
        .n_peers
        .parse()
        .map_err(|_| Error::poll(endpoint, "n_peers is not a number"))
}

/// First sample of `metric` in Prometheus text exposition format
///
/// Labels are ignored. Values are truncated to integers.
pub fn metric_value(text: &str, metric: &str) -> Option<u64> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let (series, rest) = line.split_once(char::is_whitespace)?;
            let name = series.split('{').next()?;
            if name != metric {
                return None;
            }
            let value: f64 = rest.split_whitespace().next()?.parse().ok()?;
            (value.is_finite() && value >= 0.0).then_some(value as u64)
        })
}

/// Requests one poll makes in sequence: `/status`, `/net_info`, metrics
const REQUESTS_PER_POLL: u32 = 3;

/// Poller that talks HTTP to the node's Service
pub struct HttpStatusPoller {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpStatusPoller {
    /// Create a poller that finishes one poll within `budget`
    ///
    /// Each request gets an equal share of the budget, so a hung optional
    /// endpoint costs its share and the height from `/status` is still kept.
    pub fn new(budget: Duration) -> Result<Self, Error> {
        let request_timeout = budget / REQUESTS_PER_POLL;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::internal("probe", format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            request_timeout,
        })
    }

    /// Deadline for a single HTTP request
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    async fn fetch(&self, url: &str) -> Result<String, Error> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::poll(url, e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::poll(url, format!("HTTP {}", response.status())));
        }

        response.text().await.map_err(|e| Error::poll(url, e.to_string()))
    }
}

#[async_trait]
impl StatusPoller for HttpStatusPoller {
    async fn poll(&self, target: &PollTarget) -> Result<NodeObservation, Error> {
        let Some(rpc) = target.rpc_url.as_deref() else {
            return Err(Error::poll("<none>", "RPC is disabled"));
        };

        let status_url = format!("{rpc}/status");
        let body = self.fetch(&status_url).await?;
        let mut observation = parse_status(&status_url, &body)?;

        let net_info_url = format!("{rpc}/net_info");
        let peers = match self.fetch(&net_info_url).await {
            Ok(body) => parse_net_info(&net_info_url, &body),
            Err(e) => Err(e),
        };
        match peers {
            Ok(peers) => observation.peers = Some(peers),
            Err(e) => debug!(error = %e, "net_info unavailable"),
        }

        if let Some(metrics_url) = target.metrics_url.as_deref() {
            match self.fetch(metrics_url).await {
                Ok(text) => {
                    if observation.peers.is_none() {
                        observation.peers = metric_value(&text, PEERS_METRIC)
                            .and_then(|p| u32::try_from(p).ok());
                    }
                    if let Some(validator) = observation.validator.as_mut() {
                        validator.missed_blocks = metric_value(&text, MISSED_BLOCKS_METRIC);
                        validator.last_signed_height = metric_value(&text, LAST_SIGNED_METRIC);
                    }
                }
                Err(e) => debug!(error = %e, "metrics unavailable"),
            }
        }

        Ok(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ManagedNodeSpec;
    use axum::routing::get;
    use axum::Router;

    const STATUS: &str = r#"{
        "jsonrpc": "2.0",
        "id": -1,
        "result": {
            "node_info": {"id": "4f1e2c", "network": "axelar-dojo-1", "moniker": "val-0"},
            "sync_info": {"latest_block_height": "1200345", "catching_up": false},
            "validator_info": {"address": "A1B2C3", "voting_power": "42000"}
        }
    }"#;

    const NET_INFO: &str = r#"{"jsonrpc": "2.0", "id": -1, "result": {"listening": true, "n_peers": "17"}}"#;

    const METRICS: &str = "\
# HELP tendermint_p2p_peers Number of peers.
# TYPE tendermint_p2p_peers gauge
tendermint_p2p_peers{chain_id=\"axelar-dojo-1\"} 12
tendermint_consensus_validator_missed_blocks{chain_id=\"axelar-dojo-1\",validator_address=\"A1B2C3\"} 3
tendermint_consensus_validator_last_signed_height{chain_id=\"axelar-dojo-1\"} 1.200344e+06
";

    #[test]
    fn status_is_parsed() {
        let obs = parse_status("http://node/status", STATUS).unwrap();
        assert_eq!(obs.node_id, "4f1e2c");
        assert_eq!(obs.network.as_deref(), Some("axelar-dojo-1"));
        assert_eq!(obs.height, 1_200_345);
        assert!(!obs.catching_up);
        let validator = obs.validator.unwrap();
        assert_eq!(validator.address, "A1B2C3");
        assert_eq!(validator.voting_power, 42_000);
    }

    #[test]
    fn non_numeric_height_is_a_poll_error() {
        let body = STATUS.replace("1200345", "tall");
        let err = parse_status("http://node/status", &body).unwrap_err();
        assert_eq!(err.reason(), "PollFailed");
    }

    #[test]
    fn empty_validator_address_means_no_validator() {
        let body = STATUS.replace("A1B2C3", "");
        assert!(parse_status("http://node/status", &body).unwrap().validator.is_none());
    }

    #[test]
    fn net_info_peer_count() {
        assert_eq!(parse_net_info("http://node/net_info", NET_INFO).unwrap(), 17);
    }

    #[test]
    fn metric_values_ignore_labels_and_comments() {
        assert_eq!(metric_value(METRICS, PEERS_METRIC), Some(12));
        assert_eq!(metric_value(METRICS, MISSED_BLOCKS_METRIC), Some(3));
        assert_eq!(metric_value(METRICS, LAST_SIGNED_METRIC), Some(1_200_344));
        assert_eq!(metric_value(METRICS, "tendermint_p2p"), None);
    }

    #[test]
    fn target_points_at_service() {
        let spec = ManagedNodeSpec::default();
        let target = PollTarget::for_node(&spec, &ObjectNames::for_node("val-0"), "chain");
        assert_eq!(
            target.rpc_url.as_deref(),
            Some("http://val-0-service.chain.svc:26657")
        );
        assert_eq!(
            target.metrics_url.as_deref(),
            Some("http://val-0-service.chain.svc:26660/metrics")
        );
    }

    #[test]
    fn disabled_rpc_leaves_nothing_to_poll() {
        let mut spec = ManagedNodeSpec::default();
        spec.networking.rpc.enabled = false;
        let target = PollTarget::for_node(&spec, &ObjectNames::for_node("val-0"), "chain");
        assert!(target.is_empty());
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn story_poll_combines_all_three_sources() {
        let base = serve(
            Router::new()
                .route("/status", get(|| async { STATUS }))
                .route("/net_info", get(|| async { NET_INFO }))
                .route("/metrics", get(|| async { METRICS })),
        )
        .await;
        let target = PollTarget {
            rpc_url: Some(base.clone()),
            metrics_url: Some(format!("{base}/metrics")),
        };

        let poller = HttpStatusPoller::new(Duration::from_secs(2)).unwrap();
        let obs = poller.poll(&target).await.unwrap();

        assert_eq!(obs.height, 1_200_345);
        // net_info wins over the metrics gauge
        assert_eq!(obs.peers, Some(17));
        let validator = obs.validator.unwrap();
        assert_eq!(validator.missed_blocks, Some(3));
        assert_eq!(validator.last_signed_height, Some(1_200_344));
    }

    #[tokio::test]
    async fn story_poll_tolerates_missing_optional_endpoints() {
        let base = serve(Router::new().route("/status", get(|| async { STATUS }))).await;
        let target = PollTarget {
            rpc_url: Some(base),
            metrics_url: None,
        };

        let poller = HttpStatusPoller::new(Duration::from_secs(2)).unwrap();
        let obs = poller.poll(&target).await.unwrap();
        assert_eq!(obs.peers, None);
        assert_eq!(obs.validator.unwrap().missed_blocks, None);
    }

    #[test]
    fn requests_share_the_poll_budget() {
        let poller = HttpStatusPoller::new(Duration::from_secs(6)).unwrap();
        assert_eq!(poller.request_timeout(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn story_hung_net_info_still_reports_height_within_budget() {
        let base = serve(
            Router::new()
                .route("/status", get(|| async { STATUS }))
                .route(
                    "/net_info",
                    get(|| async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        NET_INFO
                    }),
                ),
        )
        .await;
        let target = PollTarget {
            rpc_url: Some(base),
            metrics_url: None,
        };

        let budget = Duration::from_millis(900);
        let poller = HttpStatusPoller::new(budget).unwrap();
        let obs = tokio::time::timeout(budget, poller.poll(&target))
            .await
            .expect("poll must finish inside its budget")
            .unwrap();

        assert_eq!(obs.height, 1_200_345);
        assert_eq!(obs.peers, None);
    }

    #[tokio::test]
    async fn story_unreachable_node_is_a_poll_error() {
        let target = PollTarget {
            rpc_url: Some("http://127.0.0.1:1".to_string()),
            metrics_url: None,
        };
        let poller = HttpStatusPoller::new(Duration::from_millis(500)).unwrap();
        let err = poller.poll(&target).await.unwrap_err();
        assert!(matches!(err, Error::Poll { .. }));
    }
}

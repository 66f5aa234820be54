/// Galera node state tracking
///
/// The [`HealthMonitor`] owns the node map and is its only writer. Each round
/// probes every node concurrently through a [`StatusProbe`], folds the
/// reported `wsrep_*` status into [`NodeInfo`], and forces a node into
/// `Error` once its consecutive failures reach the threshold. Selectors read
/// the map concurrently and may see data up to one interval old.
use super::probe_with_timeout;
use crate::core::Backend;
use crate::error::{UmbralError, UmbralResult};
use crate::modes::galera::backend::{login, query_status, quit, WSREP_STATUS_QUERY};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A node whose last successful probe is older than this is not healthy
pub const HEALTH_STALENESS: Duration = Duration::from_secs(30);

/// `wsrep_local_state` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Undefined,
    Joining,
    Donor,
    Joined,
    Synced,
    Error,
    Disconnected,
}

impl NodeState {
    pub fn from_wsrep(code: i64) -> Option<Self> {
        match code {
            0 => Some(NodeState::Undefined),
            1 => Some(NodeState::Joining),
            2 => Some(NodeState::Donor),
            3 => Some(NodeState::Joined),
            4 => Some(NodeState::Synced),
            5 => Some(NodeState::Error),
            6 => Some(NodeState::Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Undefined => "Undefined",
            NodeState::Joining => "Joining",
            NodeState::Donor => "Donor/Desynced",
            NodeState::Joined => "Joined",
            NodeState::Synced => "Synced",
            NodeState::Error => "Error",
            NodeState::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// Last known state of one Galera node
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub backend: Backend,
    pub state: NodeState,
    pub ready: bool,
    pub local_index: i64,
    pub cluster_size: i64,
    pub cluster_status: String,
    pub flow_control_paused: bool,
    pub flow_control_sent: i64,
    pub flow_control_received: i64,
    pub cert_deps_distance: f64,
    pub cert_failures: i64,
    pub local_commits: i64,
    pub local_replays: i64,
    pub connect_errors: u64,
    pub consecutive_errors: u32,
    pub weight: f64,
    pub error_threshold: u32,
    pub last_updated: Instant,
    pub last_health_check: Option<Instant>,
}

fn parse_into<T: std::str::FromStr>(status: &HashMap<String, String>, key: &str, slot: &mut T) {
    if let Some(value) = status.get(key) {
        match value.trim().parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => debug!("Ignoring unparsable {} value {:?}", key, value),
        }
    }
}

impl NodeInfo {
    pub fn new(backend: Backend, error_threshold: u32) -> Self {
        let weight = backend.weight;
        Self {
            backend,
            state: NodeState::Undefined,
            ready: false,
            local_index: 0,
            cluster_size: 0,
            cluster_status: String::new(),
            flow_control_paused: false,
            flow_control_sent: 0,
            flow_control_received: 0,
            cert_deps_distance: 0.0,
            cert_failures: 0,
            local_commits: 0,
            local_replays: 0,
            connect_errors: 0,
            consecutive_errors: 0,
            weight,
            error_threshold,
            last_updated: Instant::now(),
            last_health_check: None,
        }
    }

    pub fn key(&self) -> String {
        self.backend.key()
    }

    pub fn is_healthy_at(&self, now: Instant) -> bool {
        let fresh = self
            .last_health_check
            .map(|checked| now.saturating_duration_since(checked) < HEALTH_STALENESS)
            .unwrap_or(false);

        self.ready
            && self.state == NodeState::Synced
            && !self.flow_control_paused
            && self.consecutive_errors < self.error_threshold
            && fresh
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Instant::now())
    }

    pub fn can_serve_reads_at(&self, now: Instant) -> bool {
        self.is_healthy_at(now) || (self.state == NodeState::Joined && !self.flow_control_paused)
    }

    pub fn can_serve_reads(&self) -> bool {
        self.can_serve_reads_at(Instant::now())
    }

    pub fn can_serve_writes_at(&self, now: Instant) -> bool {
        self.is_healthy_at(now)
    }

    pub fn can_serve_writes(&self) -> bool {
        self.can_serve_writes_at(Instant::now())
    }

    /// Fold a successful status probe into the node
    pub fn apply_status(&mut self, status: &HashMap<String, String>, now: Instant) {
        self.consecutive_errors = 0;

        if let Some(code) = status.get("wsrep_local_state") {
            match code.trim().parse::<i64>().ok().and_then(NodeState::from_wsrep) {
                Some(state) => self.state = state,
                None => debug!("Ignoring unknown wsrep_local_state {:?}", code),
            }
        }
        if let Some(ready) = status.get("wsrep_ready") {
            self.ready = ready.trim().eq_ignore_ascii_case("ON");
        }
        if let Some(paused) = status.get("wsrep_flow_control_paused") {
            match paused.trim().parse::<f64>() {
                Ok(fraction) => self.flow_control_paused = fraction > 0.0,
                Err(_) => debug!("Ignoring unparsable flow control value {:?}", paused),
            }
        }
        if let Some(cluster_status) = status.get("wsrep_cluster_status") {
            self.cluster_status = cluster_status.trim().to_string();
        }

        parse_into(status, "wsrep_local_index", &mut self.local_index);
        parse_into(status, "wsrep_cluster_size", &mut self.cluster_size);
        parse_into(status, "wsrep_flow_control_sent", &mut self.flow_control_sent);
        parse_into(status, "wsrep_flow_control_recv", &mut self.flow_control_received);
        parse_into(status, "wsrep_cert_deps_distance", &mut self.cert_deps_distance);
        parse_into(status, "wsrep_local_cert_failures", &mut self.cert_failures);
        parse_into(status, "wsrep_local_commits", &mut self.local_commits);
        parse_into(status, "wsrep_local_replays", &mut self.local_replays);

        self.last_health_check = Some(now);
        self.last_updated = now;
    }

    /// Record a failed probe. Returns true when this failure tripped the node
    /// into the error state.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_errors += 1;
        self.connect_errors += 1;
        self.last_updated = now;

        if self.consecutive_errors >= self.error_threshold {
            let tripped = self.state != NodeState::Error || self.ready;
            self.state = NodeState::Error;
            self.ready = false;
            return tripped;
        }
        false
    }
}

/// Source of `wsrep_*` status for a node
#[async_trait]
pub trait StatusProbe: Send + Sync + 'static {
    async fn fetch_status(&self, backend: &Backend) -> UmbralResult<HashMap<String, String>>;
}

/// Logs in to the node with its configured credentials and reads
/// `SHOW STATUS LIKE 'wsrep_%'`. Refused logins, timeouts and resets count
/// as failures.
#[derive(Debug, Clone)]
pub struct WsrepStatusQuery {
    timeout: Duration,
}

impl WsrepStatusQuery {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl StatusProbe for WsrepStatusQuery {
    async fn fetch_status(&self, backend: &Backend) -> UmbralResult<HashMap<String, String>> {
        let key = backend.key();
        probe_with_timeout(self.timeout, &format!("wsrep status from {}", key), async {
            let mut stream = TcpStream::connect(&key).await?;
            login(&mut stream, backend).await?;
            let status = query_status(&mut stream, WSREP_STATUS_QUERY).await?;
            quit(&mut stream).await;
            if status.is_empty() {
                return Err(UmbralError::health_check(format!(
                    "{} reported no wsrep status",
                    key
                )));
            }
            Ok(status)
        })
        .await
    }
}

/// Monitor settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub error_threshold: u32,
    pub probe_timeout: Duration,
    /// Warn when a node has sent more flow-control pauses than this
    pub flow_control_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            error_threshold: 3,
            probe_timeout: Duration::from_secs(5),
            flow_control_threshold: 100,
        }
    }
}

/// Shared node map, ordered by backend key
pub type NodeMap = Arc<RwLock<BTreeMap<String, NodeInfo>>>;

pub struct HealthMonitor {
    nodes: NodeMap,
    probe: Arc<dyn StatusProbe>,
    config: MonitorConfig,
}

impl HealthMonitor {
    pub fn new(backends: &[Backend], probe: Arc<dyn StatusProbe>, config: MonitorConfig) -> Self {
        let nodes = backends
            .iter()
            .map(|backend| {
                (
                    backend.key(),
                    NodeInfo::new(backend.clone(), config.error_threshold),
                )
            })
            .collect();

        Self {
            nodes: Arc::new(RwLock::new(nodes)),
            probe,
            config,
        }
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    /// Probe every node concurrently and apply the results
    pub async fn probe_all(&self) {
        let backends: Vec<Backend> = self
            .nodes
            .read()
            .values()
            .map(|node| node.backend.clone())
            .collect();

        let mut probes = JoinSet::new();
        for backend in backends {
            let probe = self.probe.clone();
            let limit = self.config.probe_timeout;
            probes.spawn(async move {
                let key = backend.key();
                let result = probe_with_timeout(limit, &format!("status probe of {}", key), probe.fetch_status(&backend)).await;
                (key, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((key, Ok(status))) => self.record_success(&key, &status),
                Ok((key, Err(e))) => self.record_failure(&key, &e),
                Err(e) => warn!("Galera probe task failed: {}", e),
            }
        }
    }

    fn record_success(&self, key: &str, status: &HashMap<String, String>) {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(key) else {
            return;
        };

        let was_healthy = node.is_healthy();
        node.apply_status(status, Instant::now());

        if node.flow_control_sent > self.config.flow_control_threshold as i64 {
            warn!(
                "Galera node {} has sent {} flow control pauses",
                key, node.flow_control_sent
            );
        }
        if !was_healthy && node.is_healthy() {
            info!("Galera node {} is healthy ({})", key, node.state);
        }
        debug!(
            "Galera node {} state={} ready={} paused={}",
            key, node.state, node.ready, node.flow_control_paused
        );
    }

    fn record_failure(&self, key: &str, error: &UmbralError) {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(key) else {
            return;
        };

        if node.record_failure(Instant::now()) {
            warn!(
                "Galera node {} marked as error after {} consecutive failures: {}",
                key, node.consecutive_errors, error
            );
        } else {
            debug!(
                "Galera probe of {} failed ({} consecutive): {}",
                key, node.consecutive_errors, error
            );
        }
    }

    /// Probe immediately, then once per interval until cancelled
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => monitor.probe_all().await,
                }
            }
            debug!("Galera health monitor stopped");
        })
    }

    /// Copy of every node
    pub fn cluster_status(&self) -> Vec<NodeInfo> {
        self.nodes.read().values().cloned().collect()
    }

    /// Nodes currently able to take reads, or writes when `for_writes`
    pub fn healthy_nodes(&self, for_writes: bool) -> Vec<NodeInfo> {
        let now = Instant::now();
        self.nodes
            .read()
            .values()
            .filter(|node| {
                if for_writes {
                    node.can_serve_writes_at(now)
                } else {
                    node.can_serve_reads_at(now)
                }
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modes::galera::backend::tests::{fake_mysql_node, status_rows};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    pub(crate) fn synced_status() -> HashMap<String, String> {
        HashMap::from([
            ("wsrep_local_state".to_string(), "4".to_string()),
            ("wsrep_ready".to_string(), "ON".to_string()),
            ("wsrep_flow_control_paused".to_string(), "0.000000".to_string()),
            ("wsrep_cluster_size".to_string(), "3".to_string()),
            ("wsrep_cluster_status".to_string(), "Primary".to_string()),
        ])
    }

    pub(crate) fn synced_node(host: &str, weight: f64) -> NodeInfo {
        let mut node = NodeInfo::new(Backend::new(host, 3306).with_weight(weight), 3);
        node.apply_status(&synced_status(), Instant::now());
        node
    }

    /// Replays scripted outcomes in order, then keeps failing
    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<bool>>,
    }

    impl ScriptedProbe {
        fn new(outcomes: &[bool]) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
            }
        }
    }

    #[async_trait]
    impl StatusProbe for ScriptedProbe {
        async fn fetch_status(&self, backend: &Backend) -> UmbralResult<HashMap<String, String>> {
            match self.outcomes.lock().pop_front() {
                Some(true) => Ok(synced_status()),
                _ => Err(UmbralError::health_check(format!(
                    "{} unreachable",
                    backend.key()
                ))),
            }
        }
    }

    #[test]
    fn test_new_node_is_not_healthy() {
        let node = NodeInfo::new(Backend::new("10.0.0.1", 3306), 3);
        assert_eq!(node.state, NodeState::Undefined);
        assert!(!node.ready);
        assert!(!node.is_healthy());
        assert!(!node.can_serve_reads());
        assert!(!node.can_serve_writes());
    }

    #[test]
    fn test_healthy_node_serves_reads_and_writes() {
        let node = synced_node("10.0.0.1", 1.0);
        assert!(node.is_healthy());
        assert!(node.can_serve_reads());
        assert!(node.can_serve_writes());
        assert_eq!(node.cluster_size, 3);
        assert_eq!(node.cluster_status, "Primary");
    }

    #[test]
    fn test_not_ready_is_never_healthy() {
        let mut node = synced_node("10.0.0.1", 1.0);
        node.apply_status(
            &HashMap::from([("wsrep_ready".to_string(), "OFF".to_string())]),
            Instant::now(),
        );
        assert_eq!(node.state, NodeState::Synced);
        assert!(!node.is_healthy());
        assert!(!node.can_serve_writes());
    }

    #[test]
    fn test_stale_health_check_is_unhealthy() {
        let node = synced_node("10.0.0.1", 1.0);
        let later = Instant::now() + HEALTH_STALENESS + Duration::from_secs(1);
        assert!(!node.is_healthy_at(later));
        assert!(!node.can_serve_writes_at(later));
    }

    #[test]
    fn test_joined_node_serves_reads_only() {
        let mut node = synced_node("10.0.0.1", 1.0);
        node.apply_status(
            &HashMap::from([("wsrep_local_state".to_string(), "3".to_string())]),
            Instant::now(),
        );
        assert_eq!(node.state, NodeState::Joined);
        assert!(node.can_serve_reads());
        assert!(!node.can_serve_writes());

        node.apply_status(
            &HashMap::from([("wsrep_flow_control_paused".to_string(), "0.25".to_string())]),
            Instant::now(),
        );
        assert!(node.flow_control_paused);
        assert!(!node.can_serve_reads());
    }

    #[test]
    fn test_unparsable_fields_keep_previous_values() {
        let mut node = synced_node("10.0.0.1", 1.0);
        node.apply_status(
            &HashMap::from([
                ("wsrep_local_state".to_string(), "banana".to_string()),
                ("wsrep_local_index".to_string(), "".to_string()),
                ("wsrep_cluster_size".to_string(), "5".to_string()),
            ]),
            Instant::now(),
        );
        assert_eq!(node.state, NodeState::Synced);
        assert_eq!(node.local_index, 0);
        assert_eq!(node.cluster_size, 5);

        node.apply_status(
            &HashMap::from([
                ("wsrep_local_state".to_string(), "17".to_string()),
            ]),
            Instant::now(),
        );
        assert_eq!(node.state, NodeState::Synced);
    }

    #[test]
    fn test_threshold_failure_forces_error() {
        let mut node = synced_node("10.0.0.1", 1.0);

        assert!(!node.record_failure(Instant::now()));
        assert!(!node.record_failure(Instant::now()));
        assert_eq!(node.state, NodeState::Synced);

        assert!(node.record_failure(Instant::now()));
        assert_eq!(node.state, NodeState::Error);
        assert!(!node.ready);
        assert!(!node.can_serve_reads());
        assert!(!node.can_serve_writes());

        // Further failures do not re-trip
        assert!(!node.record_failure(Instant::now()));
        assert_eq!(node.connect_errors, 4);
    }

    #[test]
    fn test_success_resets_consecutive_errors() {
        let mut node = synced_node("10.0.0.1", 1.0);
        node.record_failure(Instant::now());
        node.record_failure(Instant::now());
        node.apply_status(&synced_status(), Instant::now());
        assert_eq!(node.consecutive_errors, 0);
        assert_eq!(node.connect_errors, 2);
        assert!(node.is_healthy());
    }

    #[tokio::test]
    async fn test_monitor_trips_node_on_third_failure() {
        let backend = Backend::new("10.0.0.1", 3306);
        let probe = Arc::new(ScriptedProbe::new(&[true, false, false, false]));
        let monitor = HealthMonitor::new(&[backend], probe, MonitorConfig::default());

        monitor.probe_all().await;
        assert_eq!(monitor.healthy_nodes(true).len(), 1);

        monitor.probe_all().await;
        monitor.probe_all().await;
        let node = &monitor.cluster_status()[0];
        assert_eq!(node.consecutive_errors, 2);
        assert_eq!(node.state, NodeState::Synced);
        assert!(node.ready);

        monitor.probe_all().await;
        let node = &monitor.cluster_status()[0];
        assert_eq!(node.consecutive_errors, 3);
        assert_eq!(node.state, NodeState::Error);
        assert!(!node.ready);
        assert!(monitor.healthy_nodes(true).is_empty());
        assert!(monitor.healthy_nodes(false).is_empty());
    }

    #[tokio::test]
    async fn test_monitor_probes_every_node() {
        let backends = vec![
            Backend::new("10.0.0.1", 3306),
            Backend::new("10.0.0.2", 3306),
            Backend::new("10.0.0.3", 3306),
        ];
        let probe = Arc::new(ScriptedProbe::new(&[true, true, true]));
        let monitor = HealthMonitor::new(&backends, probe, MonitorConfig::default());

        monitor.probe_all().await;
        assert_eq!(monitor.healthy_nodes(true).len(), 3);
    }

    #[tokio::test]
    async fn test_spawned_monitor_probes_immediately_and_stops() {
        let backend = Backend::new("10.0.0.1", 3306);
        let probe = Arc::new(ScriptedProbe::new(&[true]));
        let monitor = Arc::new(HealthMonitor::new(
            &[backend],
            probe,
            MonitorConfig {
                interval: Duration::from_secs(3600),
                ..Default::default()
            },
        ));

        let cancel = CancellationToken::new();
        let task = monitor.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.healthy_nodes(true).len(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wsrep_status_reports_donor_node() {
        let port = fake_mysql_node(
            "s3cret",
            status_rows(&[
                ("wsrep_local_state", "2"),
                ("wsrep_ready", "ON"),
                ("wsrep_flow_control_paused", "0.5"),
                ("wsrep_cluster_size", "3"),
            ]),
        )
        .await;
        let backend = Backend::new("127.0.0.1", port).with_credentials("monitor", "s3cret");

        let probe = WsrepStatusQuery::new(Duration::from_secs(1));
        let status = probe.fetch_status(&backend).await.unwrap();

        let mut node = NodeInfo::new(backend, 3);
        node.apply_status(&status, Instant::now());
        assert_eq!(node.state, NodeState::Donor);
        assert!(node.flow_control_paused);
        assert_eq!(node.cluster_size, 3);
        assert!(!node.is_healthy());
    }

    #[tokio::test]
    async fn test_wsrep_status_fails_on_rejected_login() {
        let port = fake_mysql_node("s3cret", status_rows(&[("wsrep_local_state", "4")])).await;
        let backend = Backend::new("127.0.0.1", port).with_credentials("monitor", "");

        let probe = WsrepStatusQuery::new(Duration::from_secs(1));
        let err = probe.fetch_status(&backend).await.unwrap_err();
        assert!(err.to_string().contains("Access denied"), "{}", err);
    }

    #[tokio::test]
    async fn test_wsrep_status_rejects_error_greeting() {
        use crate::modes::galera::handshake::error_packet;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(&error_packet("Host is blocked")).await;
            }
        });

        let probe = WsrepStatusQuery::new(Duration::from_secs(1));
        let backend = Backend::new("127.0.0.1", addr.port());
        let err = probe.fetch_status(&backend).await.unwrap_err();
        assert!(err.to_string().contains("Host is blocked"));
    }
}

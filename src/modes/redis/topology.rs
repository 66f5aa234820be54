/// Redis cluster topology tracking
///
/// A [`Topology`] is an immutable snapshot: the node list plus the slot
/// table built from one `CLUSTER NODES` reply. The tracker swaps in a whole
/// new snapshot on every refresh, so readers never see a half-built table.
/// Only per-node health and counters change in place.
use super::slots::{key_slot, parse_cluster_nodes, SlotMap, SlotRange, HASH_SLOTS};
use crate::core::pool::{ConnectionPool, TcpConnector};
use crate::error::RedisError;
use crate::health::redis::RedisProbe;
use arc_swap::ArcSwap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct ClusterNode {
    pub id: String,
    pub address: String,
    pub master: bool,
    pub master_id: Option<String>,
    pub slots: Vec<SlotRange>,
    /// Indices of this master's replicas in the owning topology
    pub replicas: Vec<usize>,
    healthy: AtomicBool,
    latency_us: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl ClusterNode {
    pub fn new(id: &str, address: &str, master: bool, healthy: bool) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            master,
            master_id: None,
            slots: Vec::new(),
            replicas: Vec::new(),
            healthy: AtomicBool::new(healthy),
            latency_us: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Returns the previous flag
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct Topology {
    nodes: Vec<ClusterNode>,
    slots: SlotMap,
    single_node: bool,
}

impl Topology {
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            slots: SlotMap::new(),
            single_node: false,
        }
    }

    /// Build from a `CLUSTER NODES` reply. Fails when the table holds no
    /// usable node line.
    pub fn from_cluster_nodes(table: &str) -> Result<Self, RedisError> {
        let entries = parse_cluster_nodes(table);
        if entries.is_empty() {
            return Err(RedisError::slot_mapping("cluster nodes reply lists no nodes"));
        }

        let mut nodes: Vec<ClusterNode> = entries
            .iter()
            .map(|entry| {
                let mut node = ClusterNode::new(
                    &entry.id,
                    &entry.address,
                    entry.is_master(),
                    !entry.is_failing(),
                );
                node.master_id = entry.master_id.clone();
                node.slots = entry.slots.clone();
                node
            })
            .collect();

        // Replicas may be listed before their master
        let by_id: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.id.clone(), index))
            .collect();
        for index in 0..nodes.len() {
            if nodes[index].master {
                continue;
            }
            let master = nodes[index]
                .master_id
                .as_ref()
                .and_then(|id| by_id.get(id))
                .copied();
            if let Some(master) = master {
                nodes[master].replicas.push(index);
            }
        }

        let mut slots = SlotMap::new();
        for (index, node) in nodes.iter().enumerate() {
            for range in &node.slots {
                slots.assign(*range, index);
            }
        }

        Ok(Self {
            nodes,
            slots,
            single_node: false,
        })
    }

    /// `address` owns every slot and is assumed healthy
    pub fn single_node(address: &str) -> Self {
        let mut node = ClusterNode::new(address, address, true, true);
        node.slots = vec![SlotRange::new(0, (HASH_SLOTS - 1) as u16)];
        Self {
            nodes: vec![node],
            slots: SlotMap::single_owner(0),
            single_node: true,
        }
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn slot_map(&self) -> &SlotMap {
        &self.slots
    }

    pub fn is_single_node(&self) -> bool {
        self.single_node
    }

    pub fn owner(&self, slot: u16) -> Option<&ClusterNode> {
        self.slots.owner(slot).and_then(|index| self.nodes.get(index))
    }

    pub fn find_by_address(&self, address: &str) -> Option<&ClusterNode> {
        self.nodes.iter().find(|node| node.address == address)
    }

    /// Node that should run a command on `key`. Reads prefer a healthy
    /// replica of the owning master; an unhealthy or missing owner, or a
    /// keyless command, falls back to the first healthy master.
    pub fn select_for_command(
        &self,
        key: Option<&[u8]>,
        is_read: bool,
    ) -> Result<&ClusterNode, RedisError> {
        if let Some(key) = key {
            if let Some(owner) = self.owner(key_slot(key)).filter(|node| node.is_healthy()) {
                if is_read {
                    let replica = owner
                        .replicas
                        .iter()
                        .filter_map(|&index| self.nodes.get(index))
                        .find(|replica| replica.is_healthy());
                    if let Some(replica) = replica {
                        return Ok(replica);
                    }
                }
                return Ok(owner);
            }
        }

        self.nodes
            .iter()
            .find(|node| node.master && node.is_healthy())
            .ok_or(RedisError::NoNodeAvailable)
    }

    pub fn master_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.master).count()
    }

    pub fn healthy_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_healthy()).count()
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub refresh_interval: Duration,
    pub health_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(2),
        }
    }
}

/// Tracker counters and node totals
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ClusterStats {
    pub total_requests: u64,
    pub moved_redirects: u64,
    pub ask_redirects: u64,
    pub cluster_errors: u64,
    pub nodes: usize,
    pub masters: usize,
    pub replicas: usize,
    pub healthy_nodes: usize,
    pub assigned_slots: usize,
    pub single_node_mode: bool,
    pub secs_since_refresh: Option<u64>,
}

pub struct ClusterTopologyTracker {
    seeds: Vec<String>,
    settings: TrackerSettings,
    probe: RedisProbe,
    topology: ArcSwap<Topology>,
    refresh_requested: Notify,
    total_requests: AtomicU64,
    moved_redirects: AtomicU64,
    ask_redirects: AtomicU64,
    cluster_errors: AtomicU64,
    last_refresh: Mutex<Option<Instant>>,
    /// Node connections pruned to the current node set on every refresh
    pool: Mutex<Option<Arc<ConnectionPool<TcpConnector>>>>,
}

impl ClusterTopologyTracker {
    pub fn new(seeds: Vec<String>, settings: TrackerSettings) -> Self {
        let probe = RedisProbe::new(settings.ping_timeout);
        Self {
            seeds,
            settings,
            probe,
            topology: ArcSwap::from_pointee(Topology::empty()),
            refresh_requested: Notify::new(),
            total_requests: AtomicU64::new(0),
            moved_redirects: AtomicU64::new(0),
            ask_redirects: AtomicU64::new(0),
            cluster_errors: AtomicU64::new(0),
            last_refresh: Mutex::new(None),
            pool: Mutex::new(None),
        }
    }

    pub fn attach_pool(&self, pool: Arc<ConnectionPool<TcpConnector>>) {
        *self.pool.lock() = Some(pool);
    }

    /// Current snapshot
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load_full()
    }

    /// Initial discovery. If no node answers `CLUSTER NODES`, the first seed
    /// takes every slot so the route stays available.
    pub async fn discover(&self) {
        if self.refresh().await {
            return;
        }
        if let Some(seed) = self.seeds.first() {
            warn!(
                "Cluster discovery failed on every node, falling back to single node {}",
                seed
            );
            self.topology.store(Arc::new(Topology::single_node(seed)));
            *self.last_refresh.lock() = Some(Instant::now());
        }
    }

    /// Reload the topology from the first node that answers. On failure the
    /// current snapshot stays in place.
    pub async fn refresh(&self) -> bool {
        let current = self.topology();
        let mut candidates: Vec<&str> = self.seeds.iter().map(String::as_str).collect();
        for node in current.nodes() {
            if !candidates.contains(&node.address.as_str()) {
                candidates.push(&node.address);
            }
        }

        for address in candidates {
            let table = match self.probe.cluster_nodes(address).await {
                Ok(table) => table,
                Err(e) => {
                    debug!("Cluster nodes query failed on {}: {}", address, e);
                    continue;
                }
            };
            match Topology::from_cluster_nodes(&table) {
                Ok(topology) => {
                    info!(
                        "Cluster topology loaded from {}: {} nodes, {} masters, {} slots assigned",
                        address,
                        topology.nodes().len(),
                        topology.master_count(),
                        topology.slot_map().assigned()
                    );
                    if !topology.slot_map().is_complete() {
                        warn!(
                            "Cluster slot map is incomplete: {} slots unassigned",
                            topology.slot_map().missing_slots().len()
                        );
                    }
                    let topology = Arc::new(topology);
                    self.topology.store(topology.clone());
                    *self.last_refresh.lock() = Some(Instant::now());
                    self.prune_pool(&topology);
                    return true;
                }
                Err(e) => warn!("Unusable cluster nodes reply from {}: {}", address, e),
            }
        }
        false
    }

    fn prune_pool(&self, topology: &Topology) {
        let Some(pool) = self.pool.lock().clone() else {
            return;
        };
        let keep: Vec<String> = topology
            .nodes()
            .iter()
            .map(|node| node.address.clone())
            .collect();
        let dropped = pool.retain(&keep);
        if dropped > 0 {
            info!("Closed pooled connections to {} departed nodes", dropped);
        }
    }

    /// PING every node concurrently. One failure marks a node unhealthy.
    pub async fn check_health(&self) {
        let topology = self.topology();
        let mut probes = JoinSet::new();
        for (index, node) in topology.nodes().iter().enumerate() {
            let probe = self.probe.clone();
            let address = node.address.clone();
            probes.spawn(async move { (index, probe.ping(&address).await) });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((index, result)) = joined else {
                continue;
            };
            let Some(node) = topology.nodes().get(index) else {
                continue;
            };
            match result {
                Ok(latency) => {
                    node.record_latency(latency);
                    if !node.set_healthy(true) {
                        info!("Redis node {} is healthy again", node.address);
                    }
                }
                Err(e) => {
                    if node.set_healthy(false) {
                        warn!("Redis node {} marked unhealthy: {}", node.address, e);
                    }
                }
            }
        }
    }

    /// Ask the background task to refresh before its next tick
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Run periodic refresh and health probing until `cancel` fires
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut refresh = interval_at(
                start + tracker.settings.refresh_interval,
                tracker.settings.refresh_interval,
            );
            refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut health = interval_at(
                start + tracker.settings.health_interval,
                tracker.settings.health_interval,
            );
            health.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = refresh.tick() => {
                        tracker.refresh().await;
                    }
                    _ = tracker.refresh_requested.notified() => {
                        tracker.refresh().await;
                        refresh.reset();
                    }
                    _ = health.tick() => tracker.check_health().await,
                }
            }
            debug!("Redis cluster tracker stopped");
        })
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_moved(&self) {
        self.moved_redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ask(&self) {
        self.ask_redirects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cluster_error(&self) {
        self.cluster_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ClusterStats {
        let topology = self.topology();
        let masters = topology.master_count();
        ClusterStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            moved_redirects: self.moved_redirects.load(Ordering::Relaxed),
            ask_redirects: self.ask_redirects.load(Ordering::Relaxed),
            cluster_errors: self.cluster_errors.load(Ordering::Relaxed),
            nodes: topology.nodes().len(),
            masters,
            replicas: topology.nodes().len() - masters,
            healthy_nodes: topology.healthy_count(),
            assigned_slots: topology.slot_map().assigned(),
            single_node_mode: topology.is_single_node(),
            secs_since_refresh: self.last_refresh.lock().map(|at| at.elapsed().as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::redis::tests::{fake_node, pong_node};
    use crate::modes::redis::slots::tests::NODE_TABLE;

    fn sample() -> Topology {
        Topology::from_cluster_nodes(NODE_TABLE).unwrap()
    }

    fn node<'a>(topology: &'a Topology, address: &str) -> &'a ClusterNode {
        topology.find_by_address(address).unwrap()
    }

    #[test]
    fn test_replicas_link_to_masters() {
        let topology = sample();
        assert_eq!(topology.nodes().len(), 6);
        assert_eq!(topology.master_count(), 3);

        // 30004 is listed before its master 30001
        let master = node(&topology, "127.0.0.1:30001");
        let replicas: Vec<&str> = master
            .replicas
            .iter()
            .map(|&i| topology.nodes()[i].address.as_str())
            .collect();
        assert_eq!(replicas, vec!["127.0.0.1:30004"]);
        assert!(node(&topology, "127.0.0.1:30004").replicas.is_empty());
    }

    #[test]
    fn test_slot_ownership() {
        let topology = sample();
        assert!(topology.slot_map().is_complete());
        assert_eq!(topology.owner(0).unwrap().address, "127.0.0.1:30001");
        assert_eq!(topology.owner(5461).unwrap().address, "127.0.0.1:30002");
        assert_eq!(topology.owner(16383).unwrap().address, "127.0.0.1:30003");
    }

    #[test]
    fn test_same_table_same_slot_map() {
        let first = sample();
        let second = sample();
        assert_eq!(first.slot_map(), second.slot_map());
    }

    #[test]
    fn test_empty_table_is_rejected() {
        assert!(matches!(
            Topology::from_cluster_nodes("garbage\n"),
            Err(RedisError::SlotMappingError { .. })
        ));
    }

    #[test]
    fn test_failing_nodes_start_unhealthy() {
        let table = "a 10.0.0.1:6379@16379 master,fail - 0 0 1 disconnected 0-16383\n";
        let topology = Topology::from_cluster_nodes(table).unwrap();
        assert!(!topology.nodes()[0].is_healthy());
    }

    #[test]
    fn test_routing_by_slot() {
        let topology = sample();
        // "foo" hashes to 12182
        let picked = topology.select_for_command(Some(&b"foo"[..]), false).unwrap();
        assert_eq!(picked.address, "127.0.0.1:30003");
    }

    #[test]
    fn test_reads_prefer_healthy_replica() {
        let topology = sample();
        let picked = topology.select_for_command(Some(&b"foo"[..]), true).unwrap();
        assert_eq!(picked.address, "127.0.0.1:30006");

        node(&topology, "127.0.0.1:30006").set_healthy(false);
        let picked = topology.select_for_command(Some(&b"foo"[..]), true).unwrap();
        assert_eq!(picked.address, "127.0.0.1:30003");
    }

    #[test]
    fn test_unhealthy_owner_falls_back_to_first_healthy_master() {
        let topology = sample();
        node(&topology, "127.0.0.1:30003").set_healthy(false);

        let picked = topology.select_for_command(Some(&b"foo"[..]), true).unwrap();
        assert_eq!(picked.address, "127.0.0.1:30002");

        let picked = topology.select_for_command(None, false).unwrap();
        assert_eq!(picked.address, "127.0.0.1:30002");
    }

    #[test]
    fn test_no_healthy_master() {
        let topology = sample();
        for node in topology.nodes() {
            node.set_healthy(false);
        }
        let err = topology.select_for_command(Some(&b"foo"[..]), false).unwrap_err();
        assert_eq!(err.to_string(), "no available node for command");
    }

    #[tokio::test]
    async fn test_discovery_failure_falls_back_to_single_node() {
        let addr = pong_node().await.to_string();
        let tracker = ClusterTopologyTracker::new(vec![addr.clone()], TrackerSettings::default());

        tracker.discover().await;
        let topology = tracker.topology();
        assert!(topology.is_single_node());
        assert_eq!(topology.slot_map().assigned(), HASH_SLOTS);
        for slot in [0u16, 8000, 16383] {
            assert_eq!(topology.owner(slot).unwrap().address, addr);
        }

        tracker.check_health().await;
        let refreshed = tracker.topology();
        let node = &refreshed.nodes()[0];
        assert!(node.is_healthy());
        assert!(node.latency() < Duration::from_secs(2));
        assert!(tracker.stats().single_node_mode);
    }

    #[tokio::test]
    async fn test_single_failed_ping_marks_unhealthy() {
        let addr = fake_node(|parts| match parts.first().map(String::as_str) {
            Some("PING") => b"-ERR down\r\n".to_vec(),
            _ => b"-ERR cluster support disabled\r\n".to_vec(),
        })
        .await
        .to_string();
        let tracker = ClusterTopologyTracker::new(vec![addr], TrackerSettings::default());

        tracker.discover().await;
        assert!(tracker.topology().nodes()[0].is_healthy());
        tracker.check_health().await;
        assert!(!tracker.topology().nodes()[0].is_healthy());
    }

    #[tokio::test]
    async fn test_discovery_from_cluster_nodes() {
        let table = "\
m1 127.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-8191
m2 127.0.0.1:7001@17001 master - 0 0 2 connected 8192-16383
";
        let addr = fake_node(move |parts| match parts.first().map(String::as_str) {
            Some("CLUSTER") => format!("${}\r\n{}\r\n", table.len(), table).into_bytes(),
            _ => b"+PONG\r\n".to_vec(),
        })
        .await;

        let tracker =
            ClusterTopologyTracker::new(vec![addr.to_string()], TrackerSettings::default());
        tracker.discover().await;

        let stats = tracker.stats();
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.masters, 2);
        assert_eq!(stats.assigned_slots, HASH_SLOTS);
        assert!(!stats.single_node_mode);
        assert!(stats.secs_since_refresh.is_some());
    }

    #[tokio::test]
    async fn test_refresh_prunes_departed_nodes_from_pool() {
        let table = "m1 127.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-16383\n";
        let addr = fake_node(move |parts| match parts.first().map(String::as_str) {
            Some("CLUSTER") => format!("${}\r\n{}\r\n", table.len(), table).into_bytes(),
            _ => b"+PONG\r\n".to_vec(),
        })
        .await;

        let keys = vec!["127.0.0.1:7000".to_string(), "127.0.0.1:7001".to_string()];
        let pool = Arc::new(ConnectionPool::new(
            TcpConnector::new(Duration::from_secs(1)),
            &keys,
            100,
        ));
        let tracker =
            ClusterTopologyTracker::new(vec![addr.to_string()], TrackerSettings::default());
        tracker.attach_pool(pool.clone());

        assert!(tracker.refresh().await);
        let remaining: Vec<String> = pool.stats().into_iter().map(|stats| stats.key).collect();
        assert_eq!(remaining, vec!["127.0.0.1:7000"]);
    }

    #[test]
    fn test_pfail_nodes_start_unhealthy() {
        let table = "\
a 10.0.0.1:6379@16379 master,fail? - 0 0 1 connected 0-8191
b 10.0.0.2:6379@16379 master - 0 0 2 connected 8192-16383
";
        let topology = Topology::from_cluster_nodes(table).unwrap();
        assert!(!topology.nodes()[0].is_healthy());
        // "bar" hashes to 5061, owned by the suspected node
        let picked = topology.select_for_command(Some(&b"bar"[..]), false).unwrap();
        assert_eq!(picked.address, "10.0.0.2:6379");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_current_topology() {
        let addr = pong_node().await.to_string();
        let tracker = ClusterTopologyTracker::new(vec![addr], TrackerSettings::default());
        tracker.discover().await;

        assert!(!tracker.refresh().await);
        assert!(tracker.topology().is_single_node());
    }

    #[tokio::test]
    async fn test_requested_refresh_runs_early() {
        let table = "m1 127.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-16383\n";
        let queries = Arc::new(AtomicU64::new(0));
        let counter = queries.clone();
        let addr = fake_node(move |parts| match parts.first().map(String::as_str) {
            Some("CLUSTER") => {
                counter.fetch_add(1, Ordering::SeqCst);
                format!("${}\r\n{}\r\n", table.len(), table).into_bytes()
            }
            _ => b"+PONG\r\n".to_vec(),
        })
        .await;

        let settings = TrackerSettings {
            refresh_interval: Duration::from_secs(3600),
            health_interval: Duration::from_secs(3600),
            ping_timeout: Duration::from_secs(1),
        };
        let tracker = Arc::new(ClusterTopologyTracker::new(vec![addr.to_string()], settings));
        tracker.discover().await;
        assert_eq!(queries.load(Ordering::SeqCst), 1);

        let cancel = CancellationToken::new();
        let task = tracker.spawn(cancel.clone());
        tracker.request_refresh();

        for _ in 0..50 {
            if queries.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(queries.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_redirect_counters() {
        let tracker = ClusterTopologyTracker::new(Vec::new(), TrackerSettings::default());
        tracker.record_request();
        tracker.record_request();
        tracker.record_moved();
        tracker.record_ask();
        tracker.record_cluster_error();

        let stats = tracker.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.moved_redirects, 1);
        assert_eq!(stats.ask_redirects, 1);
        assert_eq!(stats.cluster_errors, 1);
        assert_eq!(stats.nodes, 0);
        assert_eq!(stats.secs_since_refresh, None);
    }
}

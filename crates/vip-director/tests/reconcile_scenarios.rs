//! End-to-end reconcile scenarios against a simulated kernel.
//!
//! The fakes here implement the system contracts over an in-memory kernel
//! model (interface addresses + IPVS table) and record every call, so the
//! scenarios can assert both convergence and the absence of writes once
//! converged. Time is paused; the tokio clock auto-advances through the
//! director's tickers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vip_director::config::ColocationMode;
use vip_director::director::{Director, DirectorSettings};
use vip_director::metrics::DirectorMetrics;
use vip_director::system::{
    IpManager, IptablesManager, IpvsManager, Rule, SystemError,
};
use vip_director::types::{AddrKind, ClusterConfig, Node, ServiceConfig, ServiceDef};
use vip_director::watcher::ClusterWatcher;

/// Simulated node-local kernel state plus a call journal.
#[derive(Default)]
struct FakeKernel {
    addresses: Mutex<Vec<String>>,
    ipvs_vips: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
    fail_arp: AtomicBool,
}

impl FakeKernel {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn addresses(&self) -> Vec<String> {
        self.addresses.lock().unwrap().clone()
    }
}

struct FakeIp(Arc<FakeKernel>);

#[async_trait]
impl IpManager for FakeIp {
    async fn set_arp(&self) -> Result<(), SystemError> {
        self.0.record("set_arp");
        Ok(())
    }

    async fn addresses(&self) -> Result<(Vec<String>, Vec<String>), SystemError> {
        Ok((self.0.addresses(), vec![]))
    }

    fn compare_v4(&self, observed: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
        let removals = observed
            .iter()
            .filter(|a| !desired.contains(a))
            .cloned()
            .collect();
        let additions = desired
            .iter()
            .filter(|a| !observed.contains(a))
            .cloned()
            .collect();
        (removals, additions)
    }

    async fn add(&self, vip: &str) -> Result<(), SystemError> {
        self.0.record(format!("add {vip}"));
        let mut addrs = self.0.addresses.lock().unwrap();
        if !addrs.contains(&vip.to_string()) {
            addrs.push(vip.to_string());
        }
        Ok(())
    }

    async fn del(&self, vip: &str) -> Result<(), SystemError> {
        self.0.record(format!("del {vip}"));
        self.0.addresses.lock().unwrap().retain(|a| a != vip);
        Ok(())
    }

    async fn advertise_mac_address(&self, vip: &str) -> Result<(), SystemError> {
        self.0.record(format!("arp {vip}"));
        if self.0.fail_arp.load(Ordering::SeqCst) {
            return Err(SystemError::Timeout {
                program: "arping".to_string(),
                timeout_secs: 20,
            });
        }
        Ok(())
    }

    async fn set_mtu(
        &self,
        _mtu_config: &BTreeMap<String, u32>,
        _v6: bool,
    ) -> Result<(), SystemError> {
        self.0.record("set_mtu");
        Ok(())
    }

    async fn teardown(
        &self,
        _deadline: Duration,
        config: &BTreeMap<String, ServiceConfig>,
        config6: &BTreeMap<String, ServiceConfig>,
    ) -> Result<(), SystemError> {
        self.0.record("ip_teardown");
        let mut addrs = self.0.addresses.lock().unwrap();
        for vip in config.keys().chain(config6.keys()) {
            addrs.retain(|a| a != vip);
        }
        Ok(())
    }
}

struct FakeIpvs(Arc<FakeKernel>);

#[async_trait]
impl IpvsManager for FakeIpvs {
    async fn check_config_parity(
        &self,
        _watcher: &ClusterWatcher,
        config: &ClusterConfig,
        observed_addrs: &[String],
    ) -> Result<bool, SystemError> {
        self.0.record("parity");
        let mut want = config.all_vips();
        want.sort();
        let mut got = observed_addrs.to_vec();
        got.sort();
        if want != got {
            return Ok(false);
        }
        let programmed = self.0.ipvs_vips.lock().unwrap();
        Ok(*programmed == want.into_iter().collect::<BTreeSet<_>>())
    }

    async fn set_ipvs(
        &self,
        _watcher: &ClusterWatcher,
        config: &ClusterConfig,
        _kind: AddrKind,
    ) -> Result<(), SystemError> {
        self.0.record("set_ipvs");
        *self.0.ipvs_vips.lock().unwrap() = config.v4_vips().into_iter().collect();
        Ok(())
    }

    async fn teardown(&self, _deadline: Duration) -> Result<(), SystemError> {
        self.0.record("ipvs_teardown");
        self.0.ipvs_vips.lock().unwrap().clear();
        Ok(())
    }
}

struct FakeIptables(Arc<FakeKernel>);

#[async_trait]
impl IptablesManager for FakeIptables {
    async fn flush(&self) -> Result<(), SystemError> {
        self.0.record("iptables_flush");
        Ok(())
    }

    async fn save(&self) -> Result<Vec<Rule>, SystemError> {
        self.0.record("iptables_save");
        Ok(vec![])
    }

    async fn restore(&self, _rules: &[Rule]) -> Result<(), SystemError> {
        self.0.record("iptables_restore");
        Ok(())
    }

    async fn generate_rules_for_node(
        &self,
        _watcher: &ClusterWatcher,
        node_name: &str,
        _config: &ClusterConfig,
        _weighted: bool,
    ) -> Result<Vec<Rule>, SystemError> {
        self.0.record(format!("iptables_generate {node_name}"));
        Ok(vec![])
    }

    fn merge(
        &self,
        generated: Vec<Rule>,
        mut existing: Vec<Rule>,
    ) -> Result<(Vec<Rule>, Vec<Rule>), SystemError> {
        existing.extend(generated);
        Ok((existing, vec![]))
    }
}

/// Captures reconfigure samples and gauge flips.
#[derive(Default)]
struct FakeMetrics {
    samples: Mutex<Vec<String>>,
    iptables_gauge: Mutex<Vec<bool>>,
    arping_failures: Mutex<usize>,
}

impl FakeMetrics {
    fn samples(&self) -> Vec<String> {
        self.samples.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.samples.lock().unwrap().clear();
    }
}

impl DirectorMetrics for FakeMetrics {
    fn reconfigure(&self, outcome: &str, _elapsed: Duration) {
        self.samples.lock().unwrap().push(outcome.to_string());
    }

    fn iptables_write_failure(&self, failed: bool) {
        self.iptables_gauge.lock().unwrap().push(failed);
    }

    fn arping_failure(&self, _error: &SystemError) {
        *self.arping_failures.lock().unwrap() += 1;
    }

    fn node_update(&self, _action: &str) {}

    fn queue_depth(&self, _depth: usize) {}
}

fn cluster_config(vips: &[&str]) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    for vip in vips {
        let mut services = ServiceConfig::default();
        services.ports.insert(
            "80".to_string(),
            ServiceDef {
                namespace: "web".to_string(),
                service: "frontend".to_string(),
                port_name: "http".to_string(),
                weight: None,
            },
        );
        config.config.insert(vip.to_string(), services);
    }
    config
}

fn named_node(name: &str) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    node
}

struct Scenario {
    kernel: Arc<FakeKernel>,
    metrics: Arc<FakeMetrics>,
    watcher: Arc<ClusterWatcher>,
    director: Director,
    parent: CancellationToken,
}

fn scenario(vips: &[&str], colocation: ColocationMode) -> Scenario {
    let kernel = Arc::new(FakeKernel::default());
    let metrics = Arc::new(FakeMetrics::default());
    let watcher = Arc::new(ClusterWatcher::new());
    watcher.set_cluster_config(cluster_config(vips));
    watcher.set_nodes(vec![named_node("node-a"), named_node("node-b")]);

    let mut settings = DirectorSettings::new("node-a");
    settings.colocation_mode = colocation;
    settings.cleanup_on_stop = true;

    let parent = CancellationToken::new();
    let director = Director::new(
        settings,
        parent.clone(),
        watcher.clone(),
        Arc::new(FakeIp(kernel.clone())),
        Arc::new(FakeIpvs(kernel.clone())),
        Arc::new(FakeIptables(kernel.clone())),
        metrics.clone(),
    );

    Scenario {
        kernel,
        metrics,
        watcher,
        director,
        parent,
    }
}

#[tokio::test(start_paused = true)]
async fn cold_start_converges_then_goes_quiet() {
    let s = scenario(&["10.0.0.1", "10.0.0.2"], ColocationMode::Disabled);
    s.director.start().await.unwrap();

    // First reconcile tick: both VIPs added and advertised, IPVS programmed.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(s.kernel.count("add 10.0.0.1"), 1);
    assert_eq!(s.kernel.count("add 10.0.0.2"), 1);
    assert_eq!(s.kernel.count("set_ipvs"), 1);
    assert_eq!(s.kernel.count("del"), 0);
    assert_eq!(s.metrics.samples(), vec!["complete"]);

    let mut addrs = s.kernel.addresses();
    addrs.sort();
    assert_eq!(addrs, vec!["10.0.0.1", "10.0.0.2"]);

    // Steady state: subsequent ticks are noops with zero mutations.
    s.kernel.clear_calls();
    s.metrics.clear();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(s.kernel.count("add"), 0);
    assert_eq!(s.kernel.count("del"), 0);
    assert_eq!(s.kernel.count("set_ipvs"), 0);
    assert!(s.metrics.samples().iter().all(|o| o == "noop"));
    assert!(!s.metrics.samples().is_empty());

    s.director.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shrinking_the_config_deletes_the_stray_vip() {
    let s = scenario(&["10.0.0.1", "10.0.0.2"], ColocationMode::Disabled);
    s.director.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    // Operator removes one VIP from the declared state.
    s.watcher.set_cluster_config(cluster_config(&["10.0.0.1"]));
    s.kernel.clear_calls();
    s.metrics.clear();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(s.kernel.count("del 10.0.0.2"), 1);
    assert_eq!(s.kernel.count("add"), 0);
    assert_eq!(s.kernel.count("set_ipvs"), 1);
    assert!(s.metrics.samples().contains(&"complete".to_string()));
    assert_eq!(s.kernel.addresses(), vec!["10.0.0.1"]);

    s.director.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn forced_cadence_reconciles_despite_parity() {
    let s = scenario(&["10.0.0.1"], ColocationMode::Disabled);
    s.director.start().await.unwrap();

    // Converge, then clear history just before the forced timer fires.
    tokio::time::sleep(Duration::from_secs(59)).await;
    s.kernel.clear_calls();
    s.metrics.clear();

    tokio::time::sleep(Duration::from_secs(2)).await;
    // The forced pass reprograms IPVS without touching addresses.
    assert!(s.kernel.count("set_ipvs") >= 1);
    assert_eq!(s.kernel.count("add"), 0);
    assert_eq!(s.kernel.count("del"), 0);
    assert!(s.metrics.samples().contains(&"complete".to_string()));

    s.director.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn arp_loop_keeps_advertising_in_steady_state() {
    let s = scenario(&["10.0.0.1", "10.0.0.2"], ColocationMode::Disabled);
    s.director.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    s.kernel.clear_calls();

    tokio::time::sleep(Duration::from_secs(4)).await;
    // Two ARP ticks, two VIPs each.
    assert!(s.kernel.count("arp 10.0.0.1") >= 2);
    assert!(s.kernel.count("arp 10.0.0.2") >= 2);

    s.director.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn arp_failures_are_counted_and_nonfatal() {
    let s = scenario(&["10.0.0.1"], ColocationMode::Disabled);
    s.kernel.fail_arp.store(true, Ordering::SeqCst);
    s.director.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(*s.metrics.arping_failures.lock().unwrap() >= 2);
    // The reconcile loop is unaffected by ARP failures.
    assert!(s.metrics.samples().iter().any(|o| o == "complete" || o == "noop"));

    s.director.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn colocated_mode_runs_the_iptables_cycle() {
    let s = scenario(&["10.0.0.1"], ColocationMode::Iptables);
    s.director.start().await.unwrap();

    // The watch loop needs one pump cycle to cache the local node before
    // the iptables step can run; the first reconcile tick may skip.
    tokio::time::sleep(Duration::from_secs(7)).await;

    assert!(s.kernel.count("iptables_save") >= 1);
    assert_eq!(s.kernel.count("iptables_generate node-a"), s.kernel.count("iptables_save"));
    assert!(s.kernel.count("iptables_restore") >= 1);
    // Start must not flush in iptables colocation; the realserver owns it.
    assert_eq!(s.kernel.count("iptables_flush"), 0);
    assert!(s
        .metrics
        .iptables_gauge
        .lock()
        .unwrap()
        .iter()
        .any(|failed| !failed));

    s.director.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_with_cleanup_tears_everything_down() {
    let s = scenario(&["10.0.0.1"], ColocationMode::Disabled);
    s.director.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(s.kernel.addresses(), vec!["10.0.0.1"]);

    s.director.stop().await.unwrap();
    assert_eq!(s.kernel.count("ip_teardown"), 1);
    assert_eq!(s.kernel.count("ipvs_teardown"), 1);
    // Startup flush plus the cleanup flush.
    assert_eq!(s.kernel.count("iptables_flush"), 2);
    assert!(s.kernel.addresses().is_empty());
    assert!(s.kernel.ipvs_vips.lock().unwrap().is_empty());

    // Loops are gone: no further calls as time passes.
    s.kernel.clear_calls();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(s.kernel.calls().is_empty());

    // The parent scope outlived the stop; nothing else to cancel.
    s.parent.cancel();
}

#[tokio::test(start_paused = true)]
async fn parent_cancellation_stops_all_loops() {
    let s = scenario(&["10.0.0.1"], ColocationMode::Disabled);
    s.director.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;

    s.parent.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    s.kernel.clear_calls();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(s.kernel.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unsynced_watcher_produces_no_writes() {
    let kernel = Arc::new(FakeKernel::default());
    let metrics = Arc::new(FakeMetrics::default());
    let watcher = Arc::new(ClusterWatcher::new());
    // Nodes observed, but no cluster config yet.
    watcher.set_nodes(vec![named_node("node-a")]);

    let parent = CancellationToken::new();
    let director = Director::new(
        DirectorSettings::new("node-a"),
        parent.clone(),
        watcher.clone(),
        Arc::new(FakeIp(kernel.clone())),
        Arc::new(FakeIpvs(kernel.clone())),
        Arc::new(FakeIptables(kernel.clone())),
        metrics.clone(),
    );
    director.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(kernel.count("add"), 0);
    assert_eq!(kernel.count("set_ipvs"), 0);
    assert_eq!(kernel.count("arp"), 0);
    assert!(metrics.samples().is_empty());

    // Config arrives: the next tick converges.
    watcher.set_cluster_config(cluster_config(&["10.0.0.1"]));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(kernel.count("add 10.0.0.1"), 1);
    assert!(metrics.samples().contains(&"complete".to_string()));

    director.stop().await.unwrap();
}

//! The director reconciliation engine.
//!
//! A director owns three pieces of node-local kernel state - VIP addresses
//! on the managed interface, the IPVS table, and (in colocated-iptables
//! mode) the iptables ruleset - and continuously converges them to the
//! declared state the watcher observes. Four loops run between `start` and
//! `stop`:
//!
//! - a node pump publishing watcher node snapshots onto a capacity-1 channel
//! - a watch loop caching the local node object off that channel
//! - a gratuitous ARP loop re-advertising every configured VIP
//! - a reconcile loop driving the apply pipeline on a parity cadence plus a
//!   slower unconditional forced cadence
//!
//! Apply errors are logged and retried on the next tick; only `start` and
//! `stop` surface errors to the caller.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ColocationMode, DirectorConfig};
use crate::metrics::{DirectorMetrics, OUTCOME_COMPLETE, OUTCOME_ERROR, OUTCOME_NOOP};
use crate::system::{bytes_from_rules, IpManager, IptablesManager, IpvsManager, SystemError};
use crate::types::{AddrKind, ClusterConfig, Node};
use crate::watcher::ClusterWatcher;

const PARITY_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const FORCED_RECONFIGURE_INTERVAL: Duration = Duration::from_secs(60);
const ARP_INTERVAL: Duration = Duration::from_secs(2);
const NODE_PUMP_INTERVAL: Duration = Duration::from_secs(3);

/// How long `stop` waits for the reconcile loop to finish its current tick.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Deadline handed to the teardown calls during cleanup.
const CLEANUP_DEADLINE: Duration = Duration::from_secs(5);

/// Where a failed iptables restore dumps the offending ruleset.
pub const RULESET_ERR_PATH: &str = "/tmp/director-ruleset-err";

#[derive(Debug, Error)]
pub enum DirectorError {
    #[error("director has already been started; a director instance can only be started once")]
    AlreadyStarted,

    #[error("reconfiguration already in progress")]
    ReconfigureInProgress,

    #[error("failed to apply ARP sysctls: {0}")]
    ArpSetup(#[source] SystemError),

    #[error("failed to flush iptables: {0}")]
    IptablesFlush(#[source] SystemError),

    #[error("unable to compare configurations: {0}")]
    Parity(#[source] SystemError),

    #[error("unable to configure VIP addresses: {0}")]
    Addresses(#[source] SystemError),

    #[error("local node not yet observed; cannot generate iptables rules")]
    NodeNotObserved,

    #[error("unable to configure iptables: {0}")]
    Iptables(#[source] SystemError),

    #[error("unable to configure ipvs: {0}")]
    Ipvs(#[source] SystemError),

    #[error("cleanup failed: {0:?}")]
    Cleanup(Vec<String>),
}

/// Construction-time settings, immutable for the director's lifetime.
#[derive(Debug, Clone)]
pub struct DirectorSettings {
    pub node_name: String,
    pub colocation_mode: ColocationMode,
    pub cleanup_on_stop: bool,
    /// Reserved; the forced cadence currently runs unconditionally.
    pub forced_reconfigure: bool,
    /// Dump target for failed iptables restores.
    pub ruleset_err_path: PathBuf,
}

impl DirectorSettings {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            colocation_mode: ColocationMode::Disabled,
            cleanup_on_stop: false,
            forced_reconfigure: false,
            ruleset_err_path: PathBuf::from(RULESET_ERR_PATH),
        }
    }
}

impl From<&DirectorConfig> for DirectorSettings {
    fn from(config: &DirectorConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            colocation_mode: config.colocation_mode,
            cleanup_on_stop: config.cleanup_on_stop,
            forced_reconfigure: config.forced_reconfigure,
            ruleset_err_path: PathBuf::from(RULESET_ERR_PATH),
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    /// True while loops are running.
    is_started: bool,
    /// Latched on the first successful start; a director instance can only
    /// be started once, even after a stop.
    was_started: bool,
    /// Serializes start, stop, and each apply against each other.
    reconfiguring: bool,
    watch_cancel: Option<CancellationToken>,
    done_rx: Option<oneshot::Receiver<()>>,
}

struct Inner {
    settings: DirectorSettings,
    watcher: Arc<ClusterWatcher>,
    ip: Arc<dyn IpManager>,
    ipvs: Arc<dyn IpvsManager>,
    iptables: Arc<dyn IptablesManager>,
    metrics: Arc<dyn DirectorMetrics>,
    /// Process-level scope; cancelling it tears everything down.
    parent: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
    /// Local node object, written only by the watch loop.
    node: Mutex<Option<Arc<Node>>>,
}

/// Handle to one director instance. Clones share state; loops hold clones.
#[derive(Clone)]
pub struct Director {
    inner: Arc<Inner>,
}

impl Director {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: DirectorSettings,
        parent: CancellationToken,
        watcher: Arc<ClusterWatcher>,
        ip: Arc<dyn IpManager>,
        ipvs: Arc<dyn IpvsManager>,
        iptables: Arc<dyn IptablesManager>,
        metrics: Arc<dyn DirectorMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                watcher,
                ip,
                ipvs,
                iptables,
                metrics,
                parent,
                lifecycle: Mutex::new(Lifecycle::default()),
                node: Mutex::new(None),
            }),
        }
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle().is_started
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .expect("director lifecycle lock poisoned")
    }

    /// Normalize kernel state and spawn the four loops.
    ///
    /// Refuses a second start (even after a stop) and refuses while a
    /// reconfiguration is in flight. On any normalization failure the
    /// director is left stopped and no loops run.
    pub async fn start(&self) -> Result<(), DirectorError> {
        {
            let mut lc = self.lifecycle();
            if lc.was_started {
                return Err(DirectorError::AlreadyStarted);
            }
            if lc.reconfiguring {
                return Err(DirectorError::ReconfigureInProgress);
            }
            lc.reconfiguring = true;
        }

        let result = self.start_inner().await;

        let mut lc = self.lifecycle();
        if result.is_ok() {
            lc.is_started = true;
            lc.was_started = true;
        }
        lc.reconfiguring = false;
        result
    }

    async fn start_inner(&self) -> Result<(), DirectorError> {
        debug!("director: start called");

        self.inner
            .ip
            .set_arp()
            .await
            .map_err(DirectorError::ArpSetup)?;

        // In iptables colocation the local real-server agent owns iptables
        // setup; flushing here would rip its rules out from under it.
        if self.inner.settings.colocation_mode != ColocationMode::Iptables {
            self.inner
                .iptables
                .flush()
                .await
                .map_err(DirectorError::IptablesFlush)?;
        }

        let watch_cancel = self.inner.parent.child_token();
        let (done_tx, done_rx) = oneshot::channel();
        let (node_tx, node_rx) = mpsc::channel(1);

        {
            let mut lc = self.lifecycle();
            lc.watch_cancel = Some(watch_cancel.clone());
            lc.done_rx = Some(done_rx);
        }

        tokio::spawn(self.clone().reconcile_loop(watch_cancel.clone(), done_tx));
        tokio::spawn(self.clone().watch_loop(watch_cancel.clone(), node_rx));
        tokio::spawn(self.clone().arp_loop(watch_cancel.clone()));
        tokio::spawn(self.clone().node_pump(watch_cancel, node_tx));

        info!(
            node = %self.inner.settings.node_name,
            colocation = %self.inner.settings.colocation_mode,
            "director: setup complete, director is running"
        );
        Ok(())
    }

    /// Cancel the loops, wait briefly for the reconcile loop to drain, and
    /// optionally tear kernel state down.
    pub async fn stop(&self) -> Result<(), DirectorError> {
        let (watch_cancel, done_rx) = {
            let mut lc = self.lifecycle();
            if lc.reconfiguring {
                return Err(DirectorError::ReconfigureInProgress);
            }
            lc.reconfiguring = true;
            (lc.watch_cancel.take(), lc.done_rx.take())
        };

        if let Some(cancel) = watch_cancel {
            cancel.cancel();
        }

        if let Some(done_rx) = done_rx {
            info!("director: blocking until periodic tasks complete");
            // A closed channel also counts as completion: the loop exited
            // on the parent scope without signalling.
            if timeout(STOP_WAIT, done_rx).await.is_err() {
                warn!(
                    wait_secs = STOP_WAIT.as_secs(),
                    "Reconcile loop did not confirm shutdown in time; proceeding"
                );
            }
        }

        let result = if self.inner.settings.cleanup_on_stop {
            self.cleanup(CLEANUP_DEADLINE).await
        } else {
            Ok(())
        };

        let mut lc = self.lifecycle();
        lc.is_started = false;
        lc.reconfiguring = false;
        result
    }

    /// Remove everything the director may have programmed: the owned
    /// iptables chain, configured VIPs of both families, and the IPVS
    /// table. Failures accumulate rather than short-circuit.
    async fn cleanup(&self, deadline: Duration) -> Result<(), DirectorError> {
        let mut errs = Vec::new();

        if let Err(e) = self.inner.iptables.flush().await {
            errs.push(format!("cleanup - failed to flush iptables - {e}"));
        }

        let (config, config6) = match self.inner.watcher.cluster_config() {
            Some(c) => (c.config.clone(), c.config6.clone()),
            None => Default::default(),
        };
        if let Err(e) = self.inner.ip.teardown(deadline, &config, &config6).await {
            errs.push(format!("cleanup - failed to remove ip addresses - {e}"));
        }

        if let Err(e) = self.inner.ipvs.teardown(deadline).await {
            errs.push(format!("cleanup - failed to remove existing ipvs config - {e}"));
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(DirectorError::Cleanup(errs))
        }
    }

    /// Publish the watcher's node list onto the coordination channel every
    /// few seconds. Capacity 1 keeps only the freshest snapshot relevant; a
    /// blocked send just means the watch loop has not drained yet, which
    /// the coarse tick tolerates.
    async fn node_pump(
        self,
        cancel: CancellationToken,
        tx: mpsc::Sender<Vec<Arc<Node>>>,
    ) {
        let mut tick = interval_at(
            Instant::now() + NODE_PUMP_INTERVAL,
            NODE_PUMP_INTERVAL,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let nodes: Vec<Arc<Node>> = self
                .inner
                .watcher
                .nodes()
                .map(|n| n.as_ref().clone())
                .unwrap_or_default();
            self.inner
                .metrics
                .queue_depth(tx.max_capacity() - tx.capacity());

            tokio::select! {
                sent = tx.send(nodes) => {
                    if sent.is_err() {
                        debug!("director: node channel closed, exiting pump");
                        return;
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("director: watch scope closed, exiting node pump");
                    return;
                }
            }

            tokio::select! {
                _ = tick.tick() => {}
                _ = cancel.cancelled() => {
                    debug!("director: watch scope closed, exiting node pump");
                    return;
                }
            }
        }
    }

    /// Track the local node object off the coordination channel.
    async fn watch_loop(
        self,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<Vec<Arc<Node>>>,
    ) {
        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(nodes) => self.cache_local_node(&nodes),
                        None => {
                            debug!("director: node channel closed, exiting watch loop");
                            return;
                        }
                    }
                }
                _ = self.inner.parent.cancelled() => {
                    debug!("director: parent context closed, exiting watch loop");
                    return;
                }
                _ = cancel.cancelled() => {
                    debug!("director: watch context closed, exiting watch loop");
                    return;
                }
            }
        }
    }

    fn cache_local_node(&self, nodes: &[Arc<Node>]) {
        for node in nodes {
            if node.metadata.name.as_deref() != Some(self.inner.settings.node_name.as_str()) {
                continue;
            }
            let changed = {
                let mut cached = self
                    .inner
                    .node
                    .lock()
                    .expect("director node lock poisoned");
                let changed = cached
                    .as_ref()
                    .map(|current| current.as_ref() != node.as_ref())
                    .unwrap_or(true);
                *cached = Some(node.clone());
                changed
            };
            self.inner
                .metrics
                .node_update(if changed { "updated" } else { "noop" });
        }
    }

    fn cached_node(&self) -> Option<Arc<Node>> {
        self.inner
            .node
            .lock()
            .expect("director node lock poisoned")
            .clone()
    }

    /// Re-advertise every configured VIP so upstream L2 equipment keeps the
    /// VIP-to-MAC binding fresh. The VIP set is snapshotted first; the
    /// advertising call can block on raw-socket IO and must not hold any
    /// lock meanwhile.
    async fn arp_loop(self, cancel: CancellationToken) {
        let mut tick = interval_at(Instant::now() + ARP_INTERVAL, ARP_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            interval_ms = ARP_INTERVAL.as_millis() as u64,
            "director: starting gratuitous ARP loop"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.inner.parent.cancelled() => {
                    debug!("director: parent context closed, exiting ARP loop");
                    return;
                }
                _ = cancel.cancelled() => {
                    debug!("director: watch context closed, exiting ARP loop");
                    return;
                }
            }

            let Some(config) = self.inner.watcher.cluster_config() else {
                debug!("director: configs are nil, skipping ARP advertisement");
                continue;
            };
            if self.inner.watcher.nodes().is_none() {
                debug!("director: nodes are nil, skipping ARP advertisement");
                continue;
            }

            for vip in config.v4_vips() {
                if let Err(e) = self.inner.ip.advertise_mac_address(&vip).await {
                    self.inner.metrics.arping_failure(&e);
                    error!(vip = %vip, error = %e, "Gratuitous ARP failed");
                }
            }
        }
    }

    /// Drive the apply pipeline: a fast parity-checked cadence plus a slow
    /// unconditional one that repairs anything the parity check cannot see.
    async fn reconcile_loop(
        self,
        cancel: CancellationToken,
        done_tx: oneshot::Sender<()>,
    ) {
        let mut parity = interval_at(
            Instant::now() + PARITY_CHECK_INTERVAL,
            PARITY_CHECK_INTERVAL,
        );
        parity.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut forced = interval_at(
            Instant::now() + FORCED_RECONFIGURE_INTERVAL,
            FORCED_RECONFIGURE_INTERVAL,
        );
        forced.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            check_secs = PARITY_CHECK_INTERVAL.as_secs(),
            forced_secs = FORCED_RECONFIGURE_INTERVAL.as_secs(),
            "director: starting reconcile loop"
        );

        loop {
            tokio::select! {
                _ = forced.tick() => {
                    if self.inner.watcher.cluster_config().is_none() {
                        warn!("director: forced reconfiguration skipped, config is nil");
                        continue;
                    }
                    if self.inner.watcher.nodes().is_none() {
                        warn!("director: forced reconfiguration skipped, nodes are nil");
                        continue;
                    }
                    info!("director: forced reconfiguration timer went off");
                    self.reconfigure(true).await;
                }
                _ = parity.tick() => {
                    if self.inner.watcher.cluster_config().is_none() {
                        debug!("director: configs are nil, skipping apply");
                        continue;
                    }
                    if self.inner.watcher.nodes().is_none() {
                        debug!("director: nodes are nil, skipping apply");
                        continue;
                    }
                    self.reconfigure(false).await;
                }
                _ = self.inner.parent.cancelled() => {
                    debug!("director: parent context closed, exiting reconcile loop");
                    return;
                }
                _ = cancel.cancelled() => {
                    debug!("director: watch context closed, exiting reconcile loop");
                    let _ = done_tx.send(());
                    return;
                }
            }
        }
    }

    /// Timed wrapper around the apply pipeline. Errors are logged and
    /// swallowed; the next tick retries. Skips the tick when a start or
    /// stop holds the reconfiguration flag.
    async fn reconfigure(&self, force: bool) {
        {
            let mut lc = self.lifecycle();
            if lc.reconfiguring {
                debug!("director: reconfiguration already in progress, skipping tick");
                return;
            }
            lc.reconfiguring = true;
        }

        let start = Instant::now();
        info!(force, "director: reconciling");
        match self.apply_conf(force).await {
            Ok(()) => info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                "director: reconciliation completed"
            ),
            Err(e) => error!(error = %e, "Error applying configuration in director"),
        }

        self.lifecycle().reconfiguring = false;
    }

    /// The apply pipeline: parity check (unless forced), then address
    /// reconciliation, then iptables when colocated, then IPVS. Ordering
    /// matters: VIPs must exist before IPVS can bind them, and iptables
    /// classification must be in place before IPVS sees steered traffic.
    pub(crate) async fn apply_conf(&self, force: bool) -> Result<(), DirectorError> {
        let started = Instant::now();
        let Some(config) = self.inner.watcher.cluster_config() else {
            debug!("director: configs are nil, skipping apply");
            return Ok(());
        };

        if force {
            info!("director: configuration parity ignored");
        } else {
            let observed = match self.inner.ip.addresses().await {
                Ok((v4, v6)) => {
                    let mut all = v4;
                    all.extend(v6);
                    all
                }
                Err(e) => {
                    // Parity decides conservatively on a read failure; the
                    // address step re-reads and surfaces a real error.
                    error!(error = %e, "Error reading interface addresses");
                    Vec::new()
                }
            };

            match self
                .inner
                .ipvs
                .check_config_parity(&self.inner.watcher, &config, &observed)
                .await
            {
                Ok(true) => {
                    self.inner
                        .metrics
                        .reconfigure(OUTCOME_NOOP, started.elapsed());
                    info!("director: configuration has parity");
                    return Ok(());
                }
                Ok(false) => {
                    info!("director: configuration parity mismatch");
                }
                Err(e) => {
                    self.inner
                        .metrics
                        .reconfigure(OUTCOME_ERROR, started.elapsed());
                    return Err(DirectorError::Parity(e));
                }
            }
        }

        if let Err(e) = self.set_addresses(&config).await {
            self.inner
                .metrics
                .reconfigure(OUTCOME_ERROR, started.elapsed());
            return Err(e);
        }
        debug!("director: addresses set");

        if self.inner.settings.colocation_mode == ColocationMode::Iptables {
            if let Err(e) = self.set_iptables(&config).await {
                self.inner
                    .metrics
                    .reconfigure(OUTCOME_ERROR, started.elapsed());
                return Err(e);
            }
            debug!("director: iptables configured");
        }

        if let Err(e) = self
            .inner
            .ipvs
            .set_ipvs(&self.inner.watcher, &config, AddrKind::V4)
            .await
        {
            self.inner
                .metrics
                .reconfigure(OUTCOME_ERROR, started.elapsed());
            return Err(DirectorError::Ipvs(e));
        }
        debug!("director: ipvs configured");

        self.inner
            .metrics
            .reconfigure(OUTCOME_COMPLETE, started.elapsed());
        Ok(())
    }

    /// Converge interface addresses to the configured V4 VIP set. Removal
    /// failures abort (a stale VIP keeps attracting traffic); add failures
    /// only skip that address so one bad VIP cannot strand the rest.
    async fn set_addresses(&self, config: &ClusterConfig) -> Result<(), DirectorError> {
        let (observed_v4, _) = self
            .inner
            .ip
            .addresses()
            .await
            .map_err(DirectorError::Addresses)?;
        let desired = config.v4_vips();

        let (removals, additions) = self.inner.ip.compare_v4(&observed_v4, &desired);

        for addr in &removals {
            info!(addr = %addr, action = "deleting", "director: address update");
            self.inner
                .ip
                .del(addr)
                .await
                .map_err(DirectorError::Addresses)?;
        }
        for addr in &additions {
            info!(addr = %addr, action = "adding", "director: address update");
            if let Err(e) = self.inner.ip.add(addr).await {
                error!(addr = %addr, error = %e, "Error adding address, continuing");
            }
            if let Err(e) = self.inner.ip.advertise_mac_address(addr).await {
                warn!(
                    addr = %addr,
                    error = %e,
                    "Gratuitous ARP failed, most likely the VIP is not yet on the interface"
                );
            }
        }

        if let Err(e) = self.inner.ip.set_mtu(&config.mtu_config, false).await {
            error!(error = %e, "Error setting MTU on adapters");
        }

        Ok(())
    }

    /// Capture-generate-merge-restore cycle for the owned iptables chain.
    async fn set_iptables(&self, config: &ClusterConfig) -> Result<(), DirectorError> {
        let Some(node) = self.cached_node() else {
            warn!("director: local node not yet observed, skipping iptables reconciliation");
            return Err(DirectorError::NodeNotObserved);
        };
        let node_name = node
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| self.inner.settings.node_name.clone());

        debug!("director: capturing iptables rules");
        let existing = self
            .inner
            .iptables
            .save()
            .await
            .map_err(DirectorError::Iptables)?;
        debug!(existing = existing.len(), "director: generating iptables rules");

        let generated = self
            .inner
            .iptables
            .generate_rules_for_node(&self.inner.watcher, &node_name, config, true)
            .await
            .map_err(DirectorError::Iptables)?;
        debug!(generated = generated.len(), "director: merging iptables rules");

        let (merged, _) = self
            .inner
            .iptables
            .merge(generated, existing)
            .map_err(DirectorError::Iptables)?;
        debug!(merged = merged.len(), "director: applying updated rules");

        if let Err(e) = self.inner.iptables.restore(&merged).await {
            self.inner.metrics.iptables_write_failure(true);
            error!(
                error = %e,
                path = %self.inner.settings.ruleset_err_path.display(),
                "Error applying rules, dumping erroneous rule change for debugging"
            );
            let dump = error_dump(&e, &bytes_from_rules(&merged));
            if let Err(write_err) =
                write_error_dump(&self.inner.settings.ruleset_err_path, &dump).await
            {
                error!(error = %write_err, "Error writing ruleset dump, logging rules instead");
                error!(rules = %String::from_utf8_lossy(&bytes_from_rules(&merged)), "Merged ruleset");
            }
            return Err(DirectorError::Iptables(e));
        }

        self.inner.metrics.iptables_write_failure(false);
        Ok(())
    }
}

fn error_dump(err: &SystemError, rules: &[u8]) -> Vec<u8> {
    let mut out = format!("ipvs restore error: {err}\n").into_bytes();
    out.extend_from_slice(rules);
    out
}

/// Write the dump world-readable (0644) regardless of the daemon's umask,
/// so operators and debug sidecars under another group can read it.
async fn write_error_dump(path: &std::path::Path, dump: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, dump).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await
}

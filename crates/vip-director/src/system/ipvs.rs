//! IPVS table management via `ipvsadm`.
//!
//! Desired state is rendered to the same canonical rule lines
//! `ipvsadm-save -n` prints, so parity is a set comparison and convergence
//! is a line-level diff executed as individual `ipvsadm` edits. Deletes run
//! before adds so weight changes (old line out, new line in) apply cleanly.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{cmd, IpvsManager, SystemError};
use crate::types::{node_internal_ip, node_is_ready, AddrKind, ClusterConfig};
use crate::watcher::ClusterWatcher;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_SCHEDULER: &str = "wrr";
const DEFAULT_WEIGHT: i32 = 1;

/// One line of the canonical `ipvsadm-save -n` format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum IpvsRule {
    /// `-A -t <addr> -s <sched>`
    Virtual { addr: String, sched: String },
    /// `-a -t <vaddr> -r <raddr> -g -w <weight>`
    Real {
        vaddr: String,
        raddr: String,
        weight: i32,
    },
}

impl IpvsRule {
    fn to_line(&self) -> String {
        match self {
            IpvsRule::Virtual { addr, sched } => format!("-A -t {addr} -s {sched}"),
            IpvsRule::Real {
                vaddr,
                raddr,
                weight,
            } => format!("-a -t {vaddr} -r {raddr} -g -w {weight}"),
        }
    }

    fn add_args(&self) -> Vec<String> {
        match self {
            IpvsRule::Virtual { addr, sched } => {
                vec!["-A", "-t", addr.as_str(), "-s", sched.as_str()]
                    .into_iter()
                    .map(String::from)
                    .collect()
            }
            IpvsRule::Real {
                vaddr,
                raddr,
                weight,
            } => vec![
                "-a".to_string(),
                "-t".to_string(),
                vaddr.clone(),
                "-r".to_string(),
                raddr.clone(),
                "-g".to_string(),
                "-w".to_string(),
                weight.to_string(),
            ],
        }
    }

    fn del_args(&self) -> Vec<String> {
        match self {
            IpvsRule::Virtual { addr, .. } => vec!["-D", "-t", addr.as_str()]
                .into_iter()
                .map(String::from)
                .collect(),
            IpvsRule::Real { vaddr, raddr, .. } => {
                vec!["-d", "-t", vaddr.as_str(), "-r", raddr.as_str()]
                    .into_iter()
                    .map(String::from)
                    .collect()
            }
        }
    }
}

/// Parse `ipvsadm-save -n` output. Unknown lines are skipped; `-m`/`-i`
/// forwarded entries are normalized into the same shape so a foreign entry
/// still shows up as a diff.
fn parse_save_output(output: &str) -> Vec<IpvsRule> {
    output.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<IpvsRule> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["-A", "-t", addr, rest @ ..] => {
            let sched = rest
                .windows(2)
                .find(|w| w[0] == "-s")
                .map(|w| w[1])
                .unwrap_or(DEFAULT_SCHEDULER);
            Some(IpvsRule::Virtual {
                addr: addr.to_string(),
                sched: sched.to_string(),
            })
        }
        ["-a", "-t", vaddr, "-r", raddr, rest @ ..] => {
            let weight = rest
                .windows(2)
                .find(|w| w[0] == "-w")
                .and_then(|w| w[1].parse().ok())
                .unwrap_or(DEFAULT_WEIGHT);
            Some(IpvsRule::Real {
                vaddr: vaddr.to_string(),
                raddr: raddr.to_string(),
                weight,
            })
        }
        _ => None,
    }
}

/// The `ipvsadm` invocations taking `current` to `desired`, deletes first.
/// Reals under a deleted virtual are dropped by the kernel with it, so they
/// are not deleted individually.
fn plan_changes(current: &[IpvsRule], desired: &[IpvsRule]) -> Vec<Vec<String>> {
    let current_set: BTreeSet<&IpvsRule> = current.iter().collect();
    let desired_set: BTreeSet<&IpvsRule> = desired.iter().collect();

    let deleted_virtuals: BTreeSet<&String> = current
        .iter()
        .filter_map(|r| match r {
            IpvsRule::Virtual { addr, .. } if !desired_set.contains(r) => Some(addr),
            _ => None,
        })
        .collect();

    let mut commands = Vec::new();
    for rule in current {
        if desired_set.contains(rule) {
            continue;
        }
        match rule {
            IpvsRule::Real { vaddr, .. } if deleted_virtuals.contains(vaddr) => continue,
            _ => commands.push(rule.del_args()),
        }
    }
    for rule in desired {
        if !current_set.contains(rule) {
            commands.push(rule.add_args());
        }
    }
    commands
}

pub struct LinuxIpvs {
    scheduler: String,
}

impl LinuxIpvs {
    pub fn new() -> Self {
        Self {
            scheduler: DEFAULT_SCHEDULER.to_string(),
        }
    }

    /// Render the declared state for one address family as canonical rules.
    /// Every ready node with an InternalIP becomes a real server, in node
    /// name order.
    fn generate_rules(
        &self,
        watcher: &ClusterWatcher,
        config: &ClusterConfig,
        kind: AddrKind,
    ) -> Vec<IpvsRule> {
        let mut backends: Vec<(String, String)> = watcher
            .nodes()
            .map(|nodes| {
                nodes
                    .iter()
                    .filter(|n| node_is_ready(n))
                    .filter_map(|n| {
                        let name = n.metadata.name.clone()?;
                        let ip = node_internal_ip(n)?;
                        Some((name, ip))
                    })
                    .collect()
            })
            .unwrap_or_default();
        backends.sort();

        let vip_map = match kind {
            AddrKind::V4 => &config.config,
            AddrKind::V6 => &config.config6,
        };

        let mut rules = Vec::new();
        for (vip, services) in vip_map {
            for (port, def) in services.iter() {
                let vaddr = format!("{vip}:{port}");
                rules.push(IpvsRule::Virtual {
                    addr: vaddr.clone(),
                    sched: self.scheduler.clone(),
                });
                for (_, backend_ip) in &backends {
                    rules.push(IpvsRule::Real {
                        vaddr: vaddr.clone(),
                        raddr: format!("{backend_ip}:{port}"),
                        weight: def.weight.unwrap_or(DEFAULT_WEIGHT),
                    });
                }
            }
        }
        rules
    }

    async fn current_rules(&self) -> Result<Vec<IpvsRule>, SystemError> {
        let out = cmd::run("ipvsadm-save", &["-n"], None, COMMAND_TIMEOUT).await?;
        Ok(parse_save_output(&out))
    }
}

impl Default for LinuxIpvs {
    fn default() -> Self {
        Self::new()
    }
}

/// Addresses that are never reconcilable state (IPv6 link-local is always
/// present on an up interface).
fn reconcilable(addr: &str) -> bool {
    !addr.starts_with("fe80")
}

#[async_trait]
impl IpvsManager for LinuxIpvs {
    async fn check_config_parity(
        &self,
        watcher: &ClusterWatcher,
        config: &ClusterConfig,
        observed_addrs: &[String],
    ) -> Result<bool, SystemError> {
        let mut want = config.all_vips();
        want.sort();

        let mut got: Vec<String> = observed_addrs
            .iter()
            .filter(|a| reconcilable(a))
            .cloned()
            .collect();
        got.sort();

        if want != got {
            debug!(?want, ?got, "Address parity mismatch");
            return Ok(false);
        }

        let mut desired: Vec<IpvsRule> = self.generate_rules(watcher, config, AddrKind::V4);
        desired.extend(self.generate_rules(watcher, config, AddrKind::V6));
        desired.sort();

        let mut current = self.current_rules().await?;
        current.sort();

        if desired != current {
            debug!(
                desired = desired.len(),
                current = current.len(),
                "IPVS rule parity mismatch"
            );
            return Ok(false);
        }

        Ok(true)
    }

    async fn set_ipvs(
        &self,
        watcher: &ClusterWatcher,
        config: &ClusterConfig,
        kind: AddrKind,
    ) -> Result<(), SystemError> {
        let desired = self.generate_rules(watcher, config, kind);
        let current = self.current_rules().await?;
        let commands = plan_changes(&current, &desired);

        if commands.is_empty() {
            debug!(family = %kind, "IPVS table already converged");
            return Ok(());
        }

        info!(
            family = %kind,
            edits = commands.len(),
            virtuals = desired
                .iter()
                .filter(|r| matches!(r, IpvsRule::Virtual { .. }))
                .count(),
            "Programming IPVS table"
        );
        for args in commands {
            let argv: Vec<&str> = args.iter().map(String::as_str).collect();
            cmd::run("ipvsadm", &argv, None, COMMAND_TIMEOUT).await?;
        }
        Ok(())
    }

    async fn teardown(&self, deadline: Duration) -> Result<(), SystemError> {
        info!("Clearing IPVS table");
        match timeout(deadline, cmd::run("ipvsadm", &["-C"], None, deadline)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(SystemError::DeadlineExceeded {
                operation: "ipvs teardown".to_string(),
            }),
        }
    }
}

//! iptables ruleset management for the colocated-iptables mode.
//!
//! The director owns exactly one chain in the nat table (`VIP-DIRECTOR`)
//! plus the PREROUTING jump into it. `save` captures the whole table,
//! `merge` swaps the owned chain inside that capture, and `restore` writes
//! the merged table back through `iptables-restore`. Everything outside the
//! owned chain passes through untouched.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{cmd, IptablesManager, SystemError};
use crate::types::{node_is_ready, ClusterConfig};
use crate::watcher::ClusterWatcher;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// The director-owned chain in the nat table.
pub const DIRECTOR_CHAIN: &str = "VIP-DIRECTOR";

const BUILTIN_CHAINS: &[&str] = &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

/// One entry of the nat table in `iptables-save` form. An empty `spec` is a
/// chain declaration with no rule attached, which keeps empty foreign
/// chains alive across a restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: String,
    pub spec: String,
}

impl Rule {
    fn declaration(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            spec: String::new(),
        }
    }

    fn is_declaration(&self) -> bool {
        self.spec.is_empty()
    }

    /// Whether this rule belongs to the director: lives in the owned chain
    /// or jumps into it.
    fn is_owned(&self) -> bool {
        self.chain == DIRECTOR_CHAIN || self.spec.contains(&format!("-j {DIRECTOR_CHAIN}"))
    }
}

/// Parse `iptables-save -t nat` output into rules, keeping declaration-only
/// chains.
fn parse_save(output: &str) -> Vec<Rule> {
    let mut rules = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(':') {
            if let Some(chain) = rest.split_whitespace().next() {
                rules.push(Rule::declaration(chain));
            }
        } else if let Some(rest) = line.strip_prefix("-A ") {
            let mut tokens = rest.splitn(2, ' ');
            if let Some(chain) = tokens.next() {
                rules.push(Rule {
                    chain: chain.to_string(),
                    spec: tokens.next().unwrap_or("").to_string(),
                });
            }
        }
    }
    rules
}

/// Render rules as an `iptables-restore` payload for the nat table. Every
/// referenced chain is declared; builtins keep their ACCEPT policy.
fn render_restore_payload(rules: &[Rule]) -> String {
    let mut chains: Vec<&str> = Vec::new();
    for name in BUILTIN_CHAINS
        .iter()
        .copied()
        .chain(rules.iter().map(|r| r.chain.as_str()))
    {
        if !chains.contains(&name) {
            chains.push(name);
        }
    }

    let mut payload = String::from("*nat\n");
    for chain in &chains {
        if BUILTIN_CHAINS.contains(chain) {
            payload.push_str(&format!(":{chain} ACCEPT [0:0]\n"));
        } else {
            payload.push_str(&format!(":{chain} - [0:0]\n"));
        }
    }
    for rule in rules {
        if !rule.is_declaration() {
            payload.push_str(&format!("-A {} {}\n", rule.chain, rule.spec));
        }
    }
    payload.push_str("COMMIT\n");
    payload
}

/// Serialize rules for diagnostics (the error-dump file).
pub fn bytes_from_rules(rules: &[Rule]) -> Vec<u8> {
    render_restore_payload(rules).into_bytes()
}

/// Flush-time stderr fragments that mean the chain or rule is already gone.
fn already_flushed(stderr: &str) -> bool {
    stderr.contains("No chain/target/match by that name")
        || stderr.contains("does a matching rule exist")
}

pub struct LinuxIptables;

impl LinuxIptables {
    pub fn new() -> Self {
        Self
    }

    async fn run_tolerant(&self, args: &[&str]) -> Result<(), SystemError> {
        match cmd::run("iptables", args, None, COMMAND_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(SystemError::Command { ref stderr, .. }) if already_flushed(stderr) => {
                debug!(?args, "iptables target already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for LinuxIptables {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IptablesManager for LinuxIptables {
    async fn flush(&self) -> Result<(), SystemError> {
        info!(chain = DIRECTOR_CHAIN, "Flushing director iptables chain");
        self.run_tolerant(&["-t", "nat", "-D", "PREROUTING", "-j", DIRECTOR_CHAIN])
            .await?;
        self.run_tolerant(&["-t", "nat", "-F", DIRECTOR_CHAIN]).await?;
        self.run_tolerant(&["-t", "nat", "-X", DIRECTOR_CHAIN]).await?;
        Ok(())
    }

    async fn save(&self) -> Result<Vec<Rule>, SystemError> {
        let out = cmd::run("iptables-save", &["-t", "nat"], None, COMMAND_TIMEOUT).await?;
        Ok(parse_save(&out))
    }

    async fn restore(&self, rules: &[Rule]) -> Result<(), SystemError> {
        let payload = render_restore_payload(rules);
        debug!(bytes = payload.len(), "Restoring nat table");
        cmd::run(
            "iptables-restore",
            &[],
            Some(payload.as_bytes()),
            COMMAND_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn generate_rules_for_node(
        &self,
        watcher: &ClusterWatcher,
        node_name: &str,
        config: &ClusterConfig,
        weighted: bool,
    ) -> Result<Vec<Rule>, SystemError> {
        let ready_nodes = watcher
            .nodes()
            .map(|nodes| nodes.iter().filter(|n| node_is_ready(n)).count())
            .unwrap_or(0);
        if ready_nodes > 0
            && !watcher
                .nodes()
                .map(|nodes| {
                    nodes
                        .iter()
                        .any(|n| n.metadata.name.as_deref() == Some(node_name))
                })
                .unwrap_or(false)
        {
            warn!(node_name, "Local node not in observed inventory");
        }

        let mut rules = vec![
            Rule::declaration(DIRECTOR_CHAIN),
            Rule {
                chain: "PREROUTING".to_string(),
                spec: format!("-m comment --comment \"vip-director\" -j {DIRECTOR_CHAIN}"),
            },
        ];

        // The local node keeps an even share of colocated traffic; the rest
        // falls through to IPVS forwarding.
        let statistic = if weighted && ready_nodes > 1 {
            format!(
                "-m statistic --mode random --probability {:.5} ",
                1.0 / ready_nodes as f64
            )
        } else {
            String::new()
        };

        for (vip, services) in &config.config {
            for (port, def) in services.iter() {
                rules.push(Rule {
                    chain: DIRECTOR_CHAIN.to_string(),
                    spec: format!(
                        "-d {vip}/32 -p tcp -m tcp --dport {port} -m comment --comment \"{}/{}:{}\" {statistic}-j ACCEPT",
                        def.namespace, def.service, def.port_name
                    ),
                });
            }
        }
        Ok(rules)
    }

    fn merge(
        &self,
        generated: Vec<Rule>,
        existing: Vec<Rule>,
    ) -> Result<(Vec<Rule>, Vec<Rule>), SystemError> {
        let (owned, mut merged): (Vec<Rule>, Vec<Rule>) =
            existing.into_iter().partition(|r| r.is_owned());
        merged.extend(generated);
        Ok((merged, owned))
    }
}

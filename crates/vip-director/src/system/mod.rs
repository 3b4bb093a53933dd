//! Contracts for the kernel-state collaborators.
//!
//! The director drives three pieces of mutable kernel state - interface
//! addresses, the IPVS table, and the iptables ruleset - through the traits
//! here. Default implementations backed by the standard Linux userland tools
//! live in the sibling modules; tests substitute mocks or call-capturing
//! fakes. All mutators are expected to be idempotent.

mod cmd;
pub mod ip;
pub mod iptables;
pub mod ipvs;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{AddrKind, ClusterConfig, ServiceConfig};
use crate::watcher::ClusterWatcher;

pub use ip::LinuxIp;
pub use iptables::{bytes_from_rules, LinuxIptables, Rule};
pub use ipvs::LinuxIpvs;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} failed with exit code {code}: {stderr}")]
    Command {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} timed out after {timeout_secs}s")]
    Timeout { program: String, timeout_secs: u64 },

    #[error("Failed to parse {program} output: {detail}")]
    Parse { program: String, detail: String },

    #[error("{operation} exceeded its deadline")]
    DeadlineExceeded { operation: String },

    #[error("{operation}: {failures:?}")]
    Partial {
        operation: String,
        failures: Vec<String>,
    },
}

/// Address and ARP management for the VIP-bearing interface.
///
/// `addresses` reports what is currently bound to the managed interface, so
/// the interface is expected to be dedicated to VIPs (or the caller must
/// account for its primary address in the desired set).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IpManager: Send + Sync {
    /// Apply the baseline ARP sysctls a director node needs.
    async fn set_arp(&self) -> Result<(), SystemError>;

    /// Observed (IPv4, IPv6) addresses on the managed interface.
    async fn addresses(&self) -> Result<(Vec<String>, Vec<String>), SystemError>;

    /// Pure set diff: returns (removals, additions) taking observed to
    /// desired.
    fn compare_v4(&self, observed: &[String], desired: &[String]) -> (Vec<String>, Vec<String>);

    async fn add(&self, vip: &str) -> Result<(), SystemError>;

    async fn del(&self, vip: &str) -> Result<(), SystemError>;

    /// Emit a gratuitous ARP announcement for a VIP.
    async fn advertise_mac_address(&self, vip: &str) -> Result<(), SystemError>;

    /// Apply non-default MTUs. `v6` selects the family-specific pass; the
    /// device map itself is family-agnostic.
    async fn set_mtu(&self, mtu_config: &BTreeMap<String, u32>, v6: bool)
        -> Result<(), SystemError>;

    /// Remove every configured VIP from the interface, both families,
    /// bounded by `deadline`. Accumulates per-address failures.
    async fn teardown(
        &self,
        deadline: Duration,
        config: &BTreeMap<String, ServiceConfig>,
        config6: &BTreeMap<String, ServiceConfig>,
    ) -> Result<(), SystemError>;
}

/// IPVS virtual-server table management.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IpvsManager: Send + Sync {
    /// Semantic comparison of declared state against the kernel: `true`
    /// means no write is needed. `observed_addrs` is the concatenated V4+V6
    /// interface address list; ordering is normalized internally.
    async fn check_config_parity(
        &self,
        watcher: &ClusterWatcher,
        config: &ClusterConfig,
        observed_addrs: &[String],
    ) -> Result<bool, SystemError>;

    /// Converge the IPVS table to the declared state for one address family.
    async fn set_ipvs(
        &self,
        watcher: &ClusterWatcher,
        config: &ClusterConfig,
        kind: AddrKind,
    ) -> Result<(), SystemError>;

    /// Clear the whole IPVS table, bounded by `deadline`.
    async fn teardown(&self, deadline: Duration) -> Result<(), SystemError>;
}

/// Packet-filter rule management for the colocated-iptables mode.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IptablesManager: Send + Sync {
    /// Remove the director-owned chain and its jump rule.
    async fn flush(&self) -> Result<(), SystemError>;

    /// Capture the current ruleset of the managed table.
    async fn save(&self) -> Result<Vec<Rule>, SystemError>;

    /// Replace the managed table with `rules`.
    async fn restore(&self, rules: &[Rule]) -> Result<(), SystemError>;

    /// Generate the director-owned classification rules for the local node.
    async fn generate_rules_for_node(
        &self,
        watcher: &ClusterWatcher,
        node_name: &str,
        config: &ClusterConfig,
        weighted: bool,
    ) -> Result<Vec<Rule>, SystemError>;

    /// Splice `generated` into `existing`, replacing the director-owned
    /// chain. Returns (merged, replaced-owned-subset).
    fn merge(
        &self,
        generated: Vec<Rule>,
        existing: Vec<Rule>,
    ) -> Result<(Vec<Rule>, Vec<Rule>), SystemError>;
}

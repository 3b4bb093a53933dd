//! Declared-state types shared by the director and the system managers.
//!
//! The cluster configuration arrives as JSON held in a ConfigMap key. Field
//! names follow the Kubernetes camelCase convention, so all JSON-facing types
//! here carry `rename_all = "camelCase"`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use k8s_openapi::api::core::v1::Node;

/// Address family selector for IPVS programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    V4,
    V6,
}

impl std::fmt::Display for AddrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddrKind::V4 => write!(f, "ipv4"),
            AddrKind::V6 => write!(f, "ipv6"),
        }
    }
}

/// A single backend service definition for one port of one VIP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDef {
    pub namespace: String,
    pub service: String,
    #[serde(default)]
    pub port_name: String,
    /// Relative real-server weight. `None` means equal weighting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

/// Per-VIP service definitions, keyed by port number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceConfig {
    pub ports: BTreeMap<String, ServiceDef>,
}

impl ServiceConfig {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ServiceDef)> {
        self.ports.iter()
    }
}

/// Declared desired state for the whole cluster.
///
/// `config` maps IPv4 VIPs to their service definitions; `config6` is the
/// IPv6 analogue and is only consulted during teardown. `mtu_config` maps
/// interface identifiers to non-default MTU values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub config: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub config6: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub mtu_config: BTreeMap<String, u32>,
}

impl ClusterConfig {
    /// IPv4 VIPs the managed interface should carry.
    pub fn v4_vips(&self) -> Vec<String> {
        self.config.keys().cloned().collect()
    }

    /// All configured VIPs across both families, V4 first.
    pub fn all_vips(&self) -> Vec<String> {
        self.config
            .keys()
            .chain(self.config6.keys())
            .cloned()
            .collect()
    }
}

/// First InternalIP of a node, if the node reports addresses.
pub fn node_internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

/// Whether a node's `Ready` condition is `True`.
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

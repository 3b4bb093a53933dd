//! vip-director: a node-local control plane that programs a Linux host as
//! an IPVS layer-4 load balancer.
//!
//! The [`director::Director`] continuously reconciles three pieces of
//! kernel state - VIP addresses on an interface, the IPVS virtual-server
//! table, and (when colocated with a backend) an iptables chain - against
//! the declared state a [`watcher::ClusterWatcher`] observes, and
//! periodically emits gratuitous ARP so upstream L2 equipment learns the
//! VIP-to-MAC bindings.
//!
//! Kernel access goes through the [`system`] traits; the default
//! implementations shell out to the standard Linux tooling and are
//! replaceable for tests or alternative backends.

pub mod config;
pub mod director;
pub mod health;
pub mod metrics;
pub mod system;
pub mod types;
pub mod watcher;

pub use config::{ColocationMode, DirectorConfig};
pub use director::{Director, DirectorError, DirectorSettings};
pub use watcher::ClusterWatcher;

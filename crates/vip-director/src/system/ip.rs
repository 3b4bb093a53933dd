//! Interface address and ARP management via `ip`, `arping`, and sysctls.
//!
//! The managed interface is expected to be the VIP-bearing one; everything
//! `addresses` reports is treated as reconcilable state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{cmd, IpManager, SystemError};
use crate::types::ServiceConfig;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// ARP tunables applied at start: only answer ARP for addresses on the
/// receiving interface, and source announcements from the best local
/// address. Standard settings for a host carrying VIPs.
const ARP_SYSCTLS: &[(&str, &str)] = &[("arp_ignore", "1"), ("arp_announce", "2")];

pub struct LinuxIp {
    interface: String,
    sysctl_root: PathBuf,
}

impl LinuxIp {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            sysctl_root: PathBuf::from("/proc/sys"),
        }
    }

    #[cfg(test)]
    fn with_sysctl_root(interface: &str, root: PathBuf) -> Self {
        Self {
            interface: interface.to_string(),
            sysctl_root: root,
        }
    }

    fn masked(vip: &str) -> String {
        if vip.contains(':') {
            format!("{vip}/128")
        } else {
            format!("{vip}/32")
        }
    }

    async fn addr_list(&self, family: &str) -> Result<Vec<String>, SystemError> {
        let out = cmd::run(
            "ip",
            &[family, "-o", "addr", "show", "dev", &self.interface],
            None,
            COMMAND_TIMEOUT,
        )
        .await?;
        Ok(parse_addr_lines(&out))
    }
}

/// Parse `ip -o addr show` output: the address token follows `inet`/`inet6`,
/// with the prefix length stripped.
fn parse_addr_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens
                .by_ref()
                .find(|t| *t == "inet" || *t == "inet6")
                .and_then(|_| tokens.next())
                .map(|addr| addr.split('/').next().unwrap_or(addr).to_string())
        })
        .collect()
}

/// `ip addr add`/`del` stderr fragments that mean the interface is already
/// in the requested state.
fn already_converged(stderr: &str) -> bool {
    stderr.contains("File exists") || stderr.contains("Cannot assign requested address")
}

#[async_trait]
impl IpManager for LinuxIp {
    async fn set_arp(&self) -> Result<(), SystemError> {
        for scope in ["all", self.interface.as_str()] {
            for (key, value) in ARP_SYSCTLS {
                let path = self
                    .sysctl_root
                    .join("net/ipv4/conf")
                    .join(scope)
                    .join(key);
                tokio::fs::write(&path, value).await?;
                debug!(path = %path.display(), value, "ARP sysctl applied");
            }
        }
        Ok(())
    }

    async fn addresses(&self) -> Result<(Vec<String>, Vec<String>), SystemError> {
        let v4 = self.addr_list("-4").await?;
        let v6 = self.addr_list("-6").await?;
        Ok((v4, v6))
    }

    fn compare_v4(&self, observed: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
        let removals = observed
            .iter()
            .filter(|addr| !desired.contains(addr))
            .cloned()
            .collect();
        let additions = desired
            .iter()
            .filter(|addr| !observed.contains(addr))
            .cloned()
            .collect();
        (removals, additions)
    }

    async fn add(&self, vip: &str) -> Result<(), SystemError> {
        let masked = Self::masked(vip);
        match cmd::run(
            "ip",
            &["addr", "add", &masked, "dev", &self.interface],
            None,
            COMMAND_TIMEOUT,
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(SystemError::Command { ref stderr, .. }) if already_converged(stderr) => {
                debug!(vip, "Address already present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn del(&self, vip: &str) -> Result<(), SystemError> {
        let masked = Self::masked(vip);
        match cmd::run(
            "ip",
            &["addr", "del", &masked, "dev", &self.interface],
            None,
            COMMAND_TIMEOUT,
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(SystemError::Command { ref stderr, .. }) if already_converged(stderr) => {
                debug!(vip, "Address already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn advertise_mac_address(&self, vip: &str) -> Result<(), SystemError> {
        if vip.contains(':') {
            // Neighbor discovery handles IPv6; nothing to announce here.
            debug!(vip, "Skipping gratuitous ARP for IPv6 address");
            return Ok(());
        }
        cmd::run(
            "arping",
            &["-c", "1", "-U", "-I", &self.interface, vip],
            None,
            COMMAND_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn set_mtu(
        &self,
        mtu_config: &BTreeMap<String, u32>,
        v6: bool,
    ) -> Result<(), SystemError> {
        let mut failures = Vec::new();
        for (device, mtu) in mtu_config {
            let mtu = mtu.to_string();
            if let Err(e) = cmd::run(
                "ip",
                &["link", "set", "dev", device, "mtu", &mtu],
                None,
                COMMAND_TIMEOUT,
            )
            .await
            {
                failures.push(format!("{device}: {e}"));
            } else {
                debug!(device, mtu, v6, "MTU applied");
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SystemError::Partial {
                operation: "set mtu".to_string(),
                failures,
            })
        }
    }

    async fn teardown(
        &self,
        deadline: Duration,
        config: &BTreeMap<String, ServiceConfig>,
        config6: &BTreeMap<String, ServiceConfig>,
    ) -> Result<(), SystemError> {
        let vips: Vec<&String> = config.keys().chain(config6.keys()).collect();
        info!(count = vips.len(), "Removing configured VIP addresses");

        let work = async {
            let mut failures = Vec::new();
            for vip in vips {
                if let Err(e) = self.del(vip).await {
                    failures.push(format!("{vip}: {e}"));
                }
            }
            failures
        };

        match timeout(deadline, work).await {
            Ok(failures) if failures.is_empty() => Ok(()),
            Ok(failures) => Err(SystemError::Partial {
                operation: "address teardown".to_string(),
                failures,
            }),
            Err(_) => Err(SystemError::DeadlineExceeded {
                operation: "address teardown".to_string(),
            }),
        }
    }
}

//! Outbound IP masquerade.
//!
//! Traffic leaving the allocated network for anything outside it is
//! source-NATed by a per-network chain in the `nat` table, hooked from
//! `POSTROUTING`.

use std::process::Command;

use ipnetwork::Ipv4Network;
use ipvl_common::{IpvlError, IpvlResult};

/// Prefix of every masquerade chain name.
pub const CHAIN_PREFIX: &str = "CNI-";

/// Multicast traffic is never masqueraded.
const MULTICAST: &str = "224.0.0.0/4";

const NAT_TABLE: &str = "nat";

/// Derive the masquerade chain for a logical network name.
#[must_use]
pub fn chain_name(network_name: &str) -> String {
    format!("{CHAIN_PREFIX}{network_name}")
}

/// One rule in the `nat` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    /// Chain the rule is appended to.
    pub chain: String,
    /// Match and target arguments.
    pub spec: Vec<String>,
}

impl NatRule {
    fn new(chain: &str, spec: &[&str]) -> Self {
        Self {
            chain: chain.to_string(),
            spec: spec.iter().map(ToString::to_string).collect(),
        }
    }

    fn args<'a>(&'a self, op: &'a str) -> Vec<&'a str> {
        let mut args = vec!["-t", NAT_TABLE, op, self.chain.as_str()];
        args.extend(self.spec.iter().map(String::as_str));
        args
    }
}

/// Masquerade for one allocated network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasqueradeRule {
    network: Ipv4Network,
    chain: String,
}

impl MasqueradeRule {
    /// Masquerade `network` through the chain derived from `network_name`.
    #[must_use]
    pub fn new(network: Ipv4Network, network_name: &str) -> Self {
        Self {
            network,
            chain: chain_name(network_name),
        }
    }

    /// The source network.
    #[must_use]
    pub const fn network(&self) -> Ipv4Network {
        self.network
    }

    /// The NAT chain name.
    #[must_use]
    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// The rules installed for this network, in order.
    #[must_use]
    pub fn rules(&self) -> Vec<NatRule> {
        let network = self.network.to_string();
        vec![
            NatRule::new(&self.chain, &["-d", &network, "-j", "ACCEPT"]),
            NatRule::new(&self.chain, &["!", "-d", MULTICAST, "-j", "MASQUERADE"]),
            NatRule::new("POSTROUTING", &["-s", &network, "-j", &self.chain]),
        ]
    }
}

/// Installs masquerade rules.
pub trait Masquerade {
    /// Install `rule`, leaving already present pieces untouched.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Masquerade`] if any rule cannot be installed.
    fn install(&self, rule: &MasqueradeRule) -> IpvlResult<()>;
}

/// [`Masquerade`] implemented with the `iptables` binary.
#[derive(Debug, Clone)]
pub struct Iptables {
    binary: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }
}

impl Iptables {
    /// Use a specific iptables binary.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run iptables; `Ok(false)` when it ran but exited non-zero.
    fn run(&self, args: &[&str]) -> Result<bool, String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| format!("Failed to execute {}: {e}", self.binary))?;

        if !output.status.success() {
            tracing::trace!(
                ?args,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "iptables exited non-zero"
            );
        }
        Ok(output.status.success())
    }

    fn run_checked(&self, args: &[&str]) -> Result<(), String> {
        if self.run(args)? {
            Ok(())
        } else {
            Err(format!("iptables command failed: {args:?}"))
        }
    }

    fn ensure_chain(&self, chain: &str) -> Result<(), String> {
        if self.run(&["-t", NAT_TABLE, "-n", "-L", chain])? {
            return Ok(());
        }
        self.run_checked(&["-t", NAT_TABLE, "-N", chain])
    }

    fn ensure_rule(&self, rule: &NatRule) -> Result<(), String> {
        if self.run(&rule.args("-C"))? {
            tracing::debug!(chain = %rule.chain, spec = ?rule.spec, "NAT rule already present");
            return Ok(());
        }
        self.run_checked(&rule.args("-A"))
    }
}

impl Masquerade for Iptables {
    fn install(&self, rule: &MasqueradeRule) -> IpvlResult<()> {
        let masq_err = |message: String| IpvlError::Masquerade {
            chain: rule.chain().to_string(),
            message,
        };

        self.ensure_chain(rule.chain()).map_err(masq_err)?;
        for nat in rule.rules() {
            self.ensure_rule(&nat).map_err(masq_err)?;
        }

        tracing::info!(
            chain = rule.chain(),
            network = %rule.network(),
            "IP masquerade configured"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> MasqueradeRule {
        MasqueradeRule::new("10.1.2.0/24".parse().unwrap(), "net1")
    }

    #[test]
    fn chain_is_prefix_plus_network_name() {
        assert_eq!(chain_name("net1"), "CNI-net1");
        assert_eq!(rule().chain(), "CNI-net1");
    }

    #[test]
    fn rules_scope_to_network() {
        let rules = rule().rules();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].args("-A"), [
            "-t", "nat", "-A", "CNI-net1", "-d", "10.1.2.0/24", "-j", "ACCEPT"
        ]);
        assert_eq!(rules[1].args("-A"), [
            "-t", "nat", "-A", "CNI-net1", "!", "-d", "224.0.0.0/4", "-j", "MASQUERADE"
        ]);
        assert_eq!(rules[2].args("-C"), [
            "-t", "nat", "-C", "POSTROUTING", "-s", "10.1.2.0/24", "-j", "CNI-net1"
        ]);
    }

    #[test]
    fn missing_binary_is_masquerade_error() {
        let iptables = Iptables::with_binary("/nonexistent/iptables-12345");
        let err = iptables.install(&rule()).unwrap_err();
        assert!(matches!(err, IpvlError::Masquerade { ref chain, .. } if chain == "CNI-net1"));
    }
}

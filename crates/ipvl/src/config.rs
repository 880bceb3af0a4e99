//! Network configuration payload.

use ipvl_common::{IpvlError, IpvlResult};
use ipvl_network::IpvlanMode;
use serde::{Deserialize, Serialize};

/// The `ipam` block: which delegate to run, plus its own options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamConf {
    /// Delegate plugin type, e.g. `host-local`.
    #[serde(rename = "type", default)]
    pub plugin: String,
    /// Delegate-specific options, passed through untouched.
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// The network configuration read from stdin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetConf {
    /// Protocol version of the payload.
    #[serde(rename = "cniVersion", default)]
    pub cni_version: Option<String>,
    /// Logical network name.
    #[serde(default)]
    pub name: String,
    /// Plugin type.
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    /// Host interface to virtualize.
    #[serde(default)]
    pub master: String,
    /// IPvlan mode: `l2` (default) or `l3`.
    #[serde(default)]
    pub mode: String,
    /// Masquerade outbound traffic from the allocated network.
    #[serde(rename = "ipMasq", default)]
    pub ip_masq: bool,
    /// Link MTU, 0 to inherit from the master.
    #[serde(default)]
    pub mtu: u32,
    /// Address delegate configuration.
    #[serde(default)]
    pub ipam: IpamConf,
}

impl NetConf {
    /// Parse and validate a configuration payload.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Config`] if the payload is malformed, `master` is
    /// missing, no IPAM type is named, or masquerade is requested for an
    /// unnamed network.
    pub fn load(bytes: &[u8]) -> IpvlResult<Self> {
        let conf: Self = serde_json::from_slice(bytes)
            .map_err(|e| IpvlError::config(format!("failed to load netconf: {e}")))?;

        if conf.master.is_empty() {
            return Err(IpvlError::config(
                r#""master" field is required. It specifies the host interface name to virtualize"#,
            ));
        }
        if conf.ipam.plugin.is_empty() {
            return Err(IpvlError::config(
                r#""ipam.type" field is required. It names the IPAM plugin to delegate to"#,
            ));
        }
        if conf.ip_masq && conf.name.is_empty() {
            return Err(IpvlError::config(
                r#""name" field is required when "ipMasq" is set. It names the masquerade chain"#,
            ));
        }

        tracing::debug!(
            name = %conf.name,
            master = %conf.master,
            mode = %conf.mode,
            ipam = %conf.ipam.plugin,
            "Loaded network configuration"
        );
        Ok(conf)
    }

    /// Resolve the configured ipvlan mode.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::Config`] for an unknown mode.
    pub fn ipvlan_mode(&self) -> IpvlResult<IpvlanMode> {
        IpvlanMode::from_config(&self.mode)
    }
}

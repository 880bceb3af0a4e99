//! Invocation parsing and command dispatch.
//!
//! The runtime passes its arguments through `CNI_*` environment variables
//! and the network configuration on stdin. Results and errors go to stdout
//! as JSON; logs go to stderr.

use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use ipvl_common::{IpvlError, IpvlResult};
use ipvl_network::{Iptables, NetlinkLinks, PinnedThread, ThreadSwitch, validate_link_name};

use crate::ipam::{AddressDelegate, ExecPlugin};
use crate::plugin::{Invocation, Plugin};

/// Protocol version reported in results by default.
pub const CNI_VERSION: &str = "0.2.0";

/// Protocol versions this plugin understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0"];

/// Command requested by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CniCommand {
    /// Attach the container to the network.
    #[value(name = "ADD")]
    Add,
    /// Detach the container from the network.
    #[value(name = "DEL")]
    Del,
    /// Report supported protocol versions.
    #[value(name = "VERSION")]
    Version,
}

/// ipvl - IPvlan interface plugin
#[derive(Parser, Debug)]
#[command(name = "ipvl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[arg(long, env = "CNI_COMMAND", value_enum)]
    pub command: CniCommand,

    /// Container ID
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path to the container's network namespace
    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<PathBuf>,

    /// Interface name to create inside the container
    #[arg(long, env = "CNI_IFNAME")]
    pub ifname: Option<String>,

    /// Extra runtime arguments, passed through to the IPAM plugin
    #[arg(long, env = "CNI_ARGS", default_value = "")]
    pub args: String,

    /// Directories searched for the IPAM plugin
    #[arg(long, env = "CNI_PATH", value_delimiter = ':')]
    pub path: Vec<PathBuf>,
}

impl Cli {
    /// Parse the invocation, reporting bad input as an environment error.
    ///
    /// Help and version requests print and exit as usual.
    ///
    /// # Errors
    ///
    /// Returns [`IpvlError::InvalidEnvironment`] if required variables are
    /// missing or invalid.
    pub fn from_env() -> IpvlResult<Self> {
        Self::try_parse().map_err(|e| match e.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => e.exit(),
            _ => IpvlError::InvalidEnvironment {
                message: e.to_string().trim().to_string(),
            },
        })
    }

    fn invocation(&self) -> IpvlResult<Invocation> {
        let netns = self
            .netns
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| IpvlError::InvalidEnvironment {
                message: "CNI_NETNS is required".to_string(),
            })?;
        let ifname = self
            .ifname
            .clone()
            .ok_or_else(|| IpvlError::InvalidEnvironment {
                message: "CNI_IFNAME is required".to_string(),
            })?;
        validate_link_name(&ifname)?;

        Ok(Invocation {
            container_id: self.container_id.clone(),
            netns,
            ifname,
        })
    }

    /// Execute the requested command on the pinned worker thread.
    ///
    /// # Errors
    ///
    /// Returns the command's error for the caller to report.
    pub fn execute(self, pin: PinnedThread) -> IpvlResult<()> {
        if self.command == CniCommand::Version {
            let version = serde_json::json!({
                "cniVersion": CNI_VERSION,
                "supportedVersions": SUPPORTED_VERSIONS,
            });
            println!("{version}");
            return Ok(());
        }

        let inv = self.invocation()?;
        let mut payload = Vec::new();
        std::io::stdin().read_to_end(&mut payload)?;

        tracing::debug!(
            command = ?self.command,
            container = %inv.container_id,
            netns = %inv.netns.display(),
            ifname = %inv.ifname,
            "Executing command"
        );

        // Current-thread runtime: every future is polled on the pinned thread.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let plugin = Plugin::new(
            NetlinkLinks,
            ThreadSwitch::new(pin),
            AddressDelegate::new(ExecPlugin::new(self.path)),
            Iptables::default(),
        );

        match self.command {
            CniCommand::Add => {
                let mut result = runtime.block_on(plugin.cmd_add(&inv, &payload))?;
                if result.cni_version.is_none() {
                    result.cni_version = Some(CNI_VERSION.to_string());
                }
                println!("{}", serde_json::to_string(&result)?);
            }
            CniCommand::Del => runtime.block_on(plugin.cmd_del(&inv, &payload))?,
            CniCommand::Version => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ipvl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn parses_add_invocation() {
        let cli = parse(&[
            "--command",
            "ADD",
            "--container-id",
            "c1",
            "--netns",
            "/var/run/netns/c1",
            "--ifname",
            "eth0v",
            "--path",
            "/opt/cni/bin:/usr/libexec/cni",
        ]);
        assert_eq!(cli.command, CniCommand::Add);
        assert_eq!(cli.path.len(), 2);

        let inv = cli.invocation().unwrap();
        assert_eq!(inv.netns, PathBuf::from("/var/run/netns/c1"));
        assert_eq!(inv.ifname, "eth0v");
        assert_eq!(inv.container_id, "c1");
    }

    #[test]
    fn missing_netns_is_environment_error() {
        let cli = parse(&["--command", "DEL", "--ifname", "eth0"]);
        assert!(matches!(
            cli.invocation(),
            Err(IpvlError::InvalidEnvironment { .. })
        ));
    }

    #[test]
    fn bad_ifname_is_environment_error() {
        let cli = parse(&[
            "--command",
            "ADD",
            "--netns",
            "/var/run/netns/c1",
            "--ifname",
            "much-too-long-ifname",
        ]);
        assert!(matches!(
            cli.invocation(),
            Err(IpvlError::InvalidEnvironment { .. })
        ));
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(Cli::try_parse_from(["ipvl", "--command", "CHECK"]).is_err());
    }
}

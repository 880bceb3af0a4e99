//! # ipvl
//!
//! An interface plugin that gives a container an ipvlan link on a host
//! interface.
//!
//! ## Commands
//!
//! - **ADD**: create the link inside the container's network namespace,
//!   obtain addresses from an IPAM plugin, rename and configure the link,
//!   and optionally masquerade the allocated network
//! - **DEL**: release the addresses and delete the link
//! - **VERSION**: report supported protocol versions
//!
//! ## Usage
//!
//! ```no_run
//! use ipvl::ipam::{AddressDelegate, ExecPlugin};
//! use ipvl::plugin::{Invocation, Plugin};
//! use ipvl_network::{Iptables, NetlinkLinks, ThreadSwitch, pin_current_thread};
//!
//! # fn example() -> ipvl_common::IpvlResult<()> {
//! let pin = pin_current_thread()?;
//! let plugin = Plugin::new(
//!     NetlinkLinks,
//!     ThreadSwitch::new(pin),
//!     AddressDelegate::new(ExecPlugin::new(vec!["/opt/cni/bin".into()])),
//!     Iptables::default(),
//! );
//!
//! let inv = Invocation {
//!     container_id: "c1".to_string(),
//!     netns: "/var/run/netns/c1".into(),
//!     ifname: "eth0v".to_string(),
//! };
//! let payload = br#"{"name":"net1","master":"eth0","ipam":{"type":"host-local"}}"#;
//!
//! let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
//! let result = runtime.block_on(plugin.cmd_add(&inv, payload))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod ipam;
pub mod plugin;

pub use plugin::{Invocation, Plugin};

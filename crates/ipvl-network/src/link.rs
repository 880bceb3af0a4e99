//! IPvlan link management over rtnetlink.
//!
//! Every operation opens its own netlink connection. A netlink socket is
//! bound to the namespace of the thread that created it, so operations run
//! while inside a target namespace see that namespace's links.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, RawFd};

use async_trait::async_trait;
use futures::TryStreamExt;
use ipvl_common::{IpamResult, IpvlError, IpvlResult};
use rtnetlink::packet_route::link::{InfoData, InfoIpVlan, InfoKind, LinkMessage};
use rtnetlink::{Handle, LinkMessageBuilder, LinkUnspec, RouteMessageBuilder};
use tokio::task::JoinHandle;

use crate::modes::IpvlanMode;
use crate::netns::NetNamespace;

/// Prefix of the names links carry between creation and rename.
pub const TEMP_NAME_PREFIX: &str = "ipvl";

/// Longest interface name the kernel accepts (`IFNAMSIZ - 1`).
pub const MAX_LINK_NAME: usize = 15;

/// Generate a name for a link that has not been renamed yet.
///
/// The name is the prefix followed by 8 hex characters from a UUID v4.
#[must_use]
pub fn temporary_link_name() -> String {
    let uuid = uuid::Uuid::new_v4();
    format!("{TEMP_NAME_PREFIX}{}", hex::encode(&uuid.as_bytes()[..4]))
}

/// Check that `name` is usable as a kernel interface name.
///
/// # Errors
///
/// Returns [`IpvlError::InvalidEnvironment`] for empty, overlong or
/// malformed names.
pub fn validate_link_name(name: &str) -> IpvlResult<()> {
    let invalid = |why: &str| IpvlError::InvalidEnvironment {
        message: format!("interface name {name:?} {why}"),
    };

    if name.is_empty() {
        return Err(invalid("is empty"));
    }
    if name.len() > MAX_LINK_NAME {
        return Err(invalid("is longer than 15 bytes"));
    }
    if name == "." || name == ".." {
        return Err(invalid("is reserved"));
    }
    if name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(invalid("contains '/', ':' or whitespace"));
    }
    Ok(())
}

/// Request for a new ipvlan link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpvlanLink {
    /// Host interface the link is multiplexed off.
    pub master: String,
    /// Name the link is created under.
    pub name: String,
    /// Virtualization mode.
    pub mode: IpvlanMode,
    /// MTU, 0 to inherit the master's.
    pub mtu: u32,
}

impl IpvlanLink {
    /// Create a new ipvlan request on `master`.
    pub fn new(name: impl Into<String>, master: impl Into<String>) -> Self {
        Self {
            master: master.into(),
            name: name.into(),
            mode: IpvlanMode::default(),
            mtu: 0,
        }
    }

    /// Set the ipvlan mode.
    #[must_use]
    pub fn mode(mut self, mode: IpvlanMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the MTU.
    #[must_use]
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }
}

/// A link created by [`LinkManager::create_ipvlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualInterface {
    /// Current name inside the target namespace.
    pub name: String,
    /// Index of the master interface in the host namespace.
    pub parent_index: u32,
    /// Virtualization mode.
    pub mode: IpvlanMode,
    /// Configured MTU, 0 when inherited.
    pub mtu: u32,
}

/// Kernel link operations used by the plugin.
///
/// Every method except [`LinkManager::create_ipvlan`] acts on the namespace
/// the calling thread is currently in.
#[async_trait(?Send)]
pub trait LinkManager {
    /// Create `link` on its master directly inside `target`.
    ///
    /// The master is looked up in the caller's namespace.
    async fn create_ipvlan(
        &self,
        link: &IpvlanLink,
        target: &NetNamespace,
    ) -> IpvlResult<VirtualInterface>;

    /// Rename the link `current` to `new`.
    async fn rename_link(&self, current: &str, new: &str) -> IpvlResult<()>;

    /// Bring `name` up and apply the allocation's addresses and routes.
    async fn configure_link(&self, name: &str, result: &IpamResult) -> IpvlResult<()>;

    /// Delete the link `name`.
    async fn delete_link(&self, name: &str) -> IpvlResult<()>;
}

/// Build the `RTM_NEWLINK` request for `link` on master `parent_index`,
/// placed straight into the namespace behind `netns_fd`.
fn ipvlan_message(link: &IpvlanLink, parent_index: u32, netns_fd: RawFd) -> LinkMessage {
    let mut request = LinkMessageBuilder::<LinkUnspec>::new_with_info_kind(InfoKind::IpVlan)
        .name(link.name.clone())
        .link(parent_index)
        .set_info_data(InfoData::IpVlan(vec![InfoIpVlan::Mode(link.mode.into())]))
        .setns_by_fd(netns_fd);
    if link.mtu > 0 {
        request = request.mtu(link.mtu);
    }
    request.build()
}

/// [`LinkManager`] backed by rtnetlink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkLinks;

/// A netlink connection opened in the calling thread's namespace.
struct Netlink {
    handle: Handle,
    task: JoinHandle<()>,
}

impl Netlink {
    fn connect() -> IpvlResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        let task = tokio::spawn(connection);
        Ok(Self { handle, task })
    }

    async fn link_index(&self, name: &str) -> Result<u32, String> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err("Link not found".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn add_address(&self, index: u32, ip: IpAddr, prefix: u8) -> Result<(), String> {
        self.handle
            .address()
            .add(index, ip, prefix)
            .execute()
            .await
            .map_err(|e| format!("add address {ip}/{prefix}: {e}"))
    }
}

impl Drop for Netlink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait(?Send)]
impl LinkManager for NetlinkLinks {
    async fn create_ipvlan(
        &self,
        link: &IpvlanLink,
        target: &NetNamespace,
    ) -> IpvlResult<VirtualInterface> {
        let nl = Netlink::connect()?;
        let parent_index = nl
            .link_index(&link.master)
            .await
            .map_err(|cause| IpvlError::Lookup {
                name: link.master.clone(),
                cause,
            })?;

        nl.handle
            .link()
            .add(ipvlan_message(link, parent_index, target.as_raw_fd()))
            .execute()
            .await
            .map_err(|e| IpvlError::Creation {
                name: link.name.clone(),
                cause: e.to_string(),
            })?;

        tracing::info!(
            master = %link.master,
            name = %link.name,
            mode = %link.mode,
            mtu = link.mtu,
            netns = %target.path().display(),
            "IPvlan interface created"
        );
        Ok(VirtualInterface {
            name: link.name.clone(),
            parent_index,
            mode: link.mode,
            mtu: link.mtu,
        })
    }

    async fn rename_link(&self, current: &str, new: &str) -> IpvlResult<()> {
        let rename_err = |cause: String| IpvlError::Rename {
            from: current.to_string(),
            to: new.to_string(),
            cause,
        };

        let nl = Netlink::connect()?;
        let index = nl.link_index(current).await.map_err(rename_err)?;
        nl.handle
            .link()
            .set(LinkUnspec::new_with_index(index).name(new.to_string()).build())
            .execute()
            .await
            .map_err(|e| rename_err(e.to_string()))?;

        tracing::debug!(from = current, to = new, "Renamed link");
        Ok(())
    }

    async fn configure_link(&self, name: &str, result: &IpamResult) -> IpvlResult<()> {
        let configure_err = |cause: String| IpvlError::Configure {
            name: name.to_string(),
            cause,
        };

        let nl = Netlink::connect()?;
        let index = nl.link_index(name).await.map_err(configure_err)?;

        nl.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| configure_err(format!("set link up: {e}")))?;

        if let Some(ip4) = &result.ip4 {
            nl.add_address(index, IpAddr::V4(ip4.ip.ip()), ip4.ip.prefix())
                .await
                .map_err(configure_err)?;

            for route in &ip4.routes {
                let mut request = RouteMessageBuilder::<Ipv4Addr>::new()
                    .destination_prefix(route.dst.network(), route.dst.prefix())
                    .output_interface(index);
                if let Some(gw) = ip4.next_hop(route) {
                    request = request.gateway(gw);
                }
                nl.handle
                    .route()
                    .add(request.build())
                    .execute()
                    .await
                    .map_err(|e| configure_err(format!("add route {}: {e}", route.dst)))?;
            }
        }

        if let Some(ip6) = &result.ip6 {
            nl.add_address(index, IpAddr::V6(ip6.ip.ip()), ip6.ip.prefix())
                .await
                .map_err(configure_err)?;

            for route in &ip6.routes {
                let mut request = RouteMessageBuilder::<Ipv6Addr>::new()
                    .destination_prefix(route.dst.network(), route.dst.prefix())
                    .output_interface(index);
                if let Some(gw) = ip6.next_hop(route) {
                    request = request.gateway(gw);
                }
                nl.handle
                    .route()
                    .add(request.build())
                    .execute()
                    .await
                    .map_err(|e| configure_err(format!("add route {}: {e}", route.dst)))?;
            }
        }

        tracing::debug!(name, index, "Configured link addresses and routes");
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> IpvlResult<()> {
        let delete_err = |cause: String| IpvlError::Deletion {
            name: name.to_string(),
            cause,
        };

        let nl = Netlink::connect()?;
        let index = nl.link_index(name).await.map_err(delete_err)?;
        nl.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| delete_err(e.to_string()))?;

        tracing::debug!(name, "Link deleted");
        Ok(())
    }
}

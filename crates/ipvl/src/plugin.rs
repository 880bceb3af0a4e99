//! ADD and DEL command sequencing.
//!
//! ADD creates the ipvlan directly inside the target namespace under a
//! temporary name, asks the IPAM delegate for addresses from the host
//! namespace, then enters the target namespace to rename the link to its
//! final name and apply the allocation. Masquerade is installed last.
//!
//! Each step that leaves state behind pushes its inverse on a cleanup stack.
//! If a later step fails the stack is unwound before the error is returned,
//! so a failed ADD leaves neither an orphaned link nor a leaked allocation.
//!
//! DEL releases the allocation first and only then deletes the link; a
//! release failure stops the command.

use std::path::PathBuf;

use ipvl_common::{IpamResult, IpvlError, IpvlResult};
use ipvl_network::{
    IpvlanLink, IpvlanMode, LinkManager, Masquerade, MasqueradeRule, NamespaceGuard,
    NamespaceSwitch, NetNamespace, temporary_link_name,
};

use crate::config::NetConf;
use crate::ipam::{AddressDelegate, PluginExec};

/// Per-invocation context supplied by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Container the interface belongs to.
    pub container_id: String,
    /// Path of the target network namespace.
    pub netns: PathBuf,
    /// Final interface name inside the target namespace.
    pub ifname: String,
}

/// An inverse action recorded during ADD.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    /// Delete the link, by its current name, inside the target namespace.
    DeleteLink(String),
    /// Release the IPAM allocation.
    ReleaseAddress,
}

#[derive(Debug, Default)]
struct Cleanup {
    undos: Vec<Undo>,
    /// Leaving the target namespace failed; the worker thread's namespace
    /// is unknown and namespace-scoped undos must not run.
    stranded: bool,
}

impl Cleanup {
    fn push(&mut self, undo: Undo) {
        self.undos.push(undo);
    }

    /// Follow a link rename so the undo targets the right name.
    fn renamed(&mut self, from: &str, to: &str) {
        for undo in &mut self.undos {
            if let Undo::DeleteLink(name) = undo {
                if name == from {
                    *name = to.to_string();
                }
            }
        }
    }
}

/// The ipvlan plugin.
pub struct Plugin<L, S, E, M> {
    links: L,
    switch: S,
    delegate: AddressDelegate<E>,
    masq: M,
}

impl<L, S, E, M> Plugin<L, S, E, M>
where
    L: LinkManager,
    S: NamespaceSwitch,
    E: PluginExec,
    M: Masquerade,
{
    /// Assemble the plugin from its collaborators.
    ///
    /// `switch` must only enter namespaces from the pinned worker thread;
    /// [`ipvl_network::ThreadSwitch`] enforces that.
    pub const fn new(links: L, switch: S, delegate: AddressDelegate<E>, masq: M) -> Self {
        Self {
            links,
            switch,
            delegate,
            masq,
        }
    }

    /// Run ADD and return the allocation to report.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing step, after undoing the steps
    /// that already succeeded.
    pub async fn cmd_add(&self, inv: &Invocation, payload: &[u8]) -> IpvlResult<IpamResult> {
        let conf = NetConf::load(payload)?;
        let mode = conf.ipvlan_mode()?;
        let netns = NetNamespace::open(&inv.netns)?;

        let mut cleanup = Cleanup::default();
        match self
            .add(&conf, mode, inv, &netns, payload, &mut cleanup)
            .await
        {
            Ok(result) => {
                tracing::info!(
                    container = %inv.container_id,
                    ifname = %inv.ifname,
                    netns = %inv.netns.display(),
                    "ADD complete"
                );
                Ok(result)
            }
            Err(err) => {
                tracing::debug!(error = %err, "ADD failed, undoing completed steps");
                self.unwind(cleanup, &conf, &netns, payload).await;
                Err(err)
            }
        }
    }

    async fn add(
        &self,
        conf: &NetConf,
        mode: IpvlanMode,
        inv: &Invocation,
        netns: &NetNamespace,
        payload: &[u8],
        cleanup: &mut Cleanup,
    ) -> IpvlResult<IpamResult> {
        let mut tmp_name = temporary_link_name();
        while tmp_name == inv.ifname {
            tmp_name = temporary_link_name();
        }

        let link = IpvlanLink::new(tmp_name, conf.master.as_str())
            .mode(mode)
            .mtu(conf.mtu);
        let iface = self.links.create_ipvlan(&link, netns).await?;
        cleanup.push(Undo::DeleteLink(iface.name.clone()));

        // A delegate that answered without IPv4 may still hold an allocation.
        let allocated = self.delegate.allocate(&conf.ipam.plugin, payload);
        if matches!(allocated, Ok(_) | Err(IpvlError::Validation { .. })) {
            cleanup.push(Undo::ReleaseAddress);
        }
        let mut result = allocated?;

        let guard = self.switch.enter(netns)?;
        let committed = self.commit(&iface.name, &inv.ifname, &result, cleanup).await;
        let exited = guard.exit();
        cleanup.stranded = exited.is_err();
        committed?;
        exited?;

        if conf.ip_masq {
            let network = result.ipv4_network().ok_or_else(|| IpvlError::Validation {
                message: "IPAM plugin returned missing IPv4 config".to_string(),
            })?;
            self.masq.install(&MasqueradeRule::new(network, &conf.name))?;
        }

        if result.cni_version.is_none() {
            result.cni_version.clone_from(&conf.cni_version);
        }
        Ok(result)
    }

    /// Rename and configure the link. Runs inside the target namespace.
    async fn commit(
        &self,
        tmp_name: &str,
        ifname: &str,
        result: &IpamResult,
        cleanup: &mut Cleanup,
    ) -> IpvlResult<()> {
        self.links.rename_link(tmp_name, ifname).await?;
        cleanup.renamed(tmp_name, ifname);
        self.links.configure_link(ifname, result).await
    }

    async fn unwind(&self, cleanup: Cleanup, conf: &NetConf, netns: &NetNamespace, payload: &[u8]) {
        let mut stranded = cleanup.stranded;
        for undo in cleanup.undos.into_iter().rev() {
            let undone = match &undo {
                Undo::DeleteLink(_) if stranded => {
                    tracing::warn!(?undo, "Skipping undo, worker thread namespace is unknown");
                    continue;
                }
                Undo::DeleteLink(name) => match self.switch.enter(netns) {
                    Ok(guard) => {
                        let deleted = self.links.delete_link(name).await;
                        let exited = guard.exit();
                        stranded = exited.is_err();
                        deleted.and(exited)
                    }
                    Err(e) => Err(e),
                },
                Undo::ReleaseAddress => self.delegate.release(&conf.ipam.plugin, payload),
            };
            match undone {
                Ok(()) => tracing::debug!(?undo, "Undid ADD step"),
                Err(e) => tracing::warn!(?undo, error = %e, "Failed to undo ADD step"),
            }
        }
    }

    async fn delete_in(&self, netns: &NetNamespace, name: &str) -> IpvlResult<()> {
        let guard = self.switch.enter(netns)?;
        let deleted = self.links.delete_link(name).await;
        let exited = guard.exit();
        deleted?;
        exited
    }

    /// Run DEL.
    ///
    /// # Errors
    ///
    /// Returns the first failure. A release failure is returned before the
    /// link is touched; a missing link is an error.
    pub async fn cmd_del(&self, inv: &Invocation, payload: &[u8]) -> IpvlResult<()> {
        let conf = NetConf::load(payload)?;
        self.delegate.release(&conf.ipam.plugin, payload)?;

        let netns = NetNamespace::open(&inv.netns)?;
        self.delete_in(&netns, &inv.ifname).await?;

        tracing::info!(
            container = %inv.container_id,
            ifname = %inv.ifname,
            netns = %inv.netns.display(),
            "DEL complete"
        );
        Ok(())
    }
}

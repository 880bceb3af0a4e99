//! # ipvl-network
//!
//! Kernel-facing primitives for the ipvl plugin.
//!
//! This crate provides ipvlan link management over rtnetlink, network
//! namespace handles with per-thread switching, and iptables masquerade.

#![warn(missing_docs)]

pub mod link;
pub mod masq;
pub mod modes;
pub mod netns;

pub use link::{
    IpvlanLink, LinkManager, NetlinkLinks, VirtualInterface, temporary_link_name,
    validate_link_name,
};
pub use masq::{Iptables, Masquerade, MasqueradeRule, chain_name};
pub use modes::IpvlanMode;
pub use netns::{
    NamespaceGuard, NamespaceSwitch, NetNamespace, NetnsGuard, PinnedThread, ThreadSwitch,
    pin_current_thread,
};

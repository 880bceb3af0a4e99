//! # ipvl-common
//!
//! Shared types for the ipvl plugin crates:
//! - The plugin error type and its protocol error codes
//! - Address allocation results returned by the address delegate
//! - The structured error report printed on failure

#![warn(missing_docs)]

pub mod error;
pub mod result;

pub use error::{IpvlError, IpvlResult};
pub use result::{Dns, ErrorReport, IpamResult, Ipv4Config, Ipv6Config, Route};

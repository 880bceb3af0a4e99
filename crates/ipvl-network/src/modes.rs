//! IPvlan virtualization modes.

use std::fmt;
use std::str::FromStr;

use ipvl_common::{IpvlError, IpvlResult};
use rtnetlink::packet_route::link::IpVlanMode;

/// IPvlan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpvlanMode {
    /// L2 mode: sub-interfaces are switched at the link layer.
    #[default]
    L2,
    /// L3 mode: traffic between sub-interfaces is routed.
    L3,
}

impl IpvlanMode {
    /// Resolve the `mode` configuration value.
    ///
    /// An empty string selects [`IpvlanMode::L2`].
    ///
    /// # Errors
    ///
    /// Returns a config error naming any other unrecognized value.
    pub fn from_config(s: &str) -> IpvlResult<Self> {
        match s {
            "" | "l2" => Ok(Self::L2),
            "l3" => Ok(Self::L3),
            other => Err(IpvlError::config(format!("unknown ipvlan mode: {other:?}"))),
        }
    }

    /// The configuration spelling of this mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::L2 => "l2",
            Self::L3 => "l3",
        }
    }
}

impl FromStr for IpvlanMode {
    type Err = IpvlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_config(s)
    }
}

impl fmt::Display for IpvlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<IpvlanMode> for IpVlanMode {
    fn from(mode: IpvlanMode) -> Self {
        match mode {
            IpvlanMode::L2 => Self::L2,
            IpvlanMode::L3 => Self::L3,
        }
    }
}

//! Error types for the ipvl plugin.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`IpvlError`].
pub type IpvlResult<T> = Result<T, IpvlError>;

/// Errors reported by an ADD or DEL invocation.
///
/// Every variant is terminal for the command that produced it. Kernel-facing
/// variants carry the underlying cause as text so the report printed to the
/// runtime names the step that failed and why.
#[derive(Error, Diagnostic, Debug)]
pub enum IpvlError {
    /// Malformed or incomplete configuration payload.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(ipvl::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Missing or invalid invocation environment.
    #[error("Invalid environment: {message}")]
    #[diagnostic(
        code(ipvl::environment),
        help("The runtime must set CNI_COMMAND, CNI_NETNS and CNI_IFNAME")
    )]
    InvalidEnvironment {
        /// The error message.
        message: String,
    },

    /// The target namespace path could not be opened.
    #[error("Failed to open netns {path:?}: {source}")]
    #[diagnostic(code(ipvl::netns::open))]
    Open {
        /// The namespace path supplied by the runtime.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Entering or leaving a namespace failed.
    #[error("Namespace switch failed: {message}")]
    #[diagnostic(code(ipvl::netns::switch))]
    Namespace {
        /// The error message.
        message: String,
    },

    /// The master interface does not exist in the host namespace.
    #[error("Failed to lookup master {name:?}: {cause}")]
    #[diagnostic(
        code(ipvl::link::lookup),
        help("\"master\" must name an existing host interface")
    )]
    Lookup {
        /// The master interface name.
        name: String,
        /// The underlying cause.
        cause: String,
    },

    /// The kernel rejected the ipvlan link.
    #[error("Failed to create ipvlan {name:?}: {cause}")]
    #[diagnostic(code(ipvl::link::create))]
    Creation {
        /// The (temporary) link name.
        name: String,
        /// The underlying cause.
        cause: String,
    },

    /// Renaming the link inside the target namespace failed.
    #[error("Failed to rename ipvlan {from:?} to {to:?}: {cause}")]
    #[diagnostic(code(ipvl::link::rename))]
    Rename {
        /// Current link name.
        from: String,
        /// Requested link name.
        to: String,
        /// The underlying cause.
        cause: String,
    },

    /// Deleting a link failed or the link does not exist.
    #[error("Failed to delete link {name:?}: {cause}")]
    #[diagnostic(code(ipvl::link::delete))]
    Deletion {
        /// The link name.
        name: String,
        /// The underlying cause.
        cause: String,
    },

    /// Applying addresses or routes to the link failed.
    #[error("Failed to configure {name:?}: {cause}")]
    #[diagnostic(code(ipvl::link::configure))]
    Configure {
        /// The link name.
        name: String,
        /// The underlying cause.
        cause: String,
    },

    /// The address delegate could not be run or returned garbage.
    #[error("IPAM plugin {plugin:?} failed: {message}")]
    #[diagnostic(code(ipvl::ipam::delegate))]
    Delegate {
        /// The delegate plugin type.
        plugin: String,
        /// The error message.
        message: String,
    },

    /// The address delegate answered without a usable allocation.
    #[error("{message}")]
    #[diagnostic(code(ipvl::ipam::validation))]
    Validation {
        /// The error message.
        message: String,
    },

    /// Installing the masquerade rules failed.
    #[error("Failed to set up IP masquerade on chain {chain:?}: {message}")]
    #[diagnostic(
        code(ipvl::masquerade),
        help("IP masquerade requires the iptables binary and CAP_NET_ADMIN")
    )]
    Masquerade {
        /// The NAT chain name.
        chain: String,
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(ipvl::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(ipvl::serialization))]
    Serialization(String),
}

impl IpvlError {
    /// Numeric code reported to the runtime in the error object.
    ///
    /// Codes below 100 are the well-known protocol codes; everything
    /// specific to this plugin lives above 100.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::InvalidEnvironment { .. } => 4,
            Self::Io(_) => 5,
            Self::Serialization(_) => 6,
            Self::Config { .. } => 7,
            Self::Open { .. } => 100,
            Self::Namespace { .. } => 101,
            Self::Lookup { .. } => 102,
            Self::Creation { .. } => 103,
            Self::Rename { .. } => 104,
            Self::Deletion { .. } => 105,
            Self::Configure { .. } => 106,
            Self::Delegate { .. } => 107,
            Self::Validation { .. } => 108,
            Self::Masquerade { .. } => 109,
        }
    }

    /// Shorthand for a [`IpvlError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a [`IpvlError::Namespace`].
    pub fn namespace(message: impl Into<String>) -> Self {
        Self::Namespace {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for IpvlError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

//! Address allocation results and error reports.
//!
//! These are the JSON documents exchanged with the address delegate and
//! printed back to the runtime.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

use crate::error::IpvlError;

/// A single route to install on the interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "N: Deserialize<'de>, A: Deserialize<'de>"))]
pub struct Route<N, A> {
    /// Destination network.
    pub dst: N,
    /// Next hop. Falls back to the config's gateway when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<A>,
}

/// Addressing for one IP family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "N: Deserialize<'de>, A: Deserialize<'de>"))]
pub struct IpConfig<N, A> {
    /// Interface address with its prefix length.
    pub ip: N,
    /// Default next hop for routes without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<A>,
    /// Routes to install.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route<N, A>>,
}

impl<N, A: Copy> IpConfig<N, A> {
    /// Next hop for `route`, falling back to the family gateway.
    pub fn next_hop(&self, route: &Route<N, A>) -> Option<A> {
        route.gw.or(self.gateway)
    }
}

/// IPv4 addressing.
pub type Ipv4Config = IpConfig<Ipv4Network, Ipv4Addr>;

/// IPv6 addressing.
pub type Ipv6Config = IpConfig<Ipv6Network, Ipv6Addr>;

/// Resolver settings handed back to the runtime untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    /// Name servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    /// Local domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Search domains.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    /// Resolver options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// The allocation returned by an address delegate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamResult {
    /// Protocol version of the document.
    #[serde(
        rename = "cniVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cni_version: Option<String>,
    /// IPv4 addressing. Required by this plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<Ipv4Config>,
    /// Optional IPv6 addressing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<Ipv6Config>,
    /// Optional resolver settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
}

impl IpamResult {
    /// The network the IPv4 address belongs to, e.g. `10.1.2.0/24` for
    /// `10.1.2.3/24`.
    #[must_use]
    pub fn ipv4_network(&self) -> Option<Ipv4Network> {
        let ip = self.ip4.as_ref()?.ip;
        Ipv4Network::new(ip.network(), ip.prefix()).ok()
    }
}

/// The structured error object printed on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Protocol version of the document.
    #[serde(
        rename = "cniVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cni_version: Option<String>,
    /// Numeric error code.
    #[serde(default)]
    pub code: u32,
    /// Short message.
    pub msg: String,
    /// Longer detail, usually the full diagnostic chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorReport {
    /// Build the report for `err`.
    #[must_use]
    pub fn from_error(err: &IpvlError, cni_version: Option<String>) -> Self {
        let details = std::error::Error::source(err).map(ToString::to_string);
        Self {
            cni_version,
            code: err.code(),
            msg: err.to_string(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_LOCAL_RESULT: &str = r#"{
        "ip4": {
            "ip": "10.1.2.3/24",
            "gateway": "10.1.2.1",
            "routes": [{"dst": "0.0.0.0/0"}, {"dst": "192.168.0.0/16", "gw": "10.1.2.254"}]
        },
        "dns": {"nameservers": ["10.1.2.1"]}
    }"#;

    #[test]
    fn parse_ipv4_result() {
        let result: IpamResult = serde_json::from_str(HOST_LOCAL_RESULT).unwrap();
        let ip4 = result.ip4.as_ref().unwrap();
        assert_eq!(ip4.ip.ip(), Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(ip4.ip.prefix(), 24);
        assert_eq!(ip4.routes.len(), 2);
        assert!(result.ip6.is_none());
        assert_eq!(
            result.dns.unwrap().nameservers,
            vec!["10.1.2.1".to_string()]
        );
    }

    #[test]
    fn route_next_hop_falls_back_to_gateway() {
        let result: IpamResult = serde_json::from_str(HOST_LOCAL_RESULT).unwrap();
        let ip4 = result.ip4.unwrap();
        assert_eq!(
            ip4.next_hop(&ip4.routes[0]),
            Some(Ipv4Addr::new(10, 1, 2, 1))
        );
        assert_eq!(
            ip4.next_hop(&ip4.routes[1]),
            Some(Ipv4Addr::new(10, 1, 2, 254))
        );
    }

    #[test]
    fn ipv6_config_without_optional_fields() {
        let ip6: Ipv6Config = serde_json::from_str(r#"{"ip": "fd00::3/64"}"#).unwrap();
        assert_eq!(ip6.ip.prefix(), 64);
        assert!(ip6.gateway.is_none());
        assert!(ip6.routes.is_empty());

        let route: Route<Ipv4Network, Ipv4Addr> =
            serde_json::from_str(r#"{"dst": "10.0.0.0/8"}"#).unwrap();
        assert!(route.gw.is_none());
    }

    #[test]
    fn ipv4_network_is_masked() {
        let result: IpamResult = serde_json::from_str(HOST_LOCAL_RESULT).unwrap();
        assert_eq!(
            result.ipv4_network().unwrap().to_string(),
            "10.1.2.0/24"
        );
    }

    #[test]
    fn missing_ipv4_has_no_network() {
        let result: IpamResult =
            serde_json::from_str(r#"{"ip6": {"ip": "fd00::5/64"}}"#).unwrap();
        assert!(result.ip4.is_none());
        assert!(result.ipv4_network().is_none());
    }

    #[test]
    fn result_omits_empty_fields() {
        let result: IpamResult = serde_json::from_str(r#"{"ip4": {"ip": "10.0.0.2/8"}}"#).unwrap();
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"ip4":{"ip":"10.0.0.2/8"}}"#);
    }

    #[test]
    fn error_report_carries_code_and_source() {
        let err = IpvlError::Open {
            path: "/var/run/netns/missing".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let report = ErrorReport::from_error(&err, Some("0.2.0".to_string()));
        assert_eq!(report.code, 100);
        assert!(report.msg.contains("/var/run/netns/missing"));
        assert_eq!(report.details.as_deref(), Some("no such file"));
    }
}

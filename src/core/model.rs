//! Policy and network data structures
//!
//! These types describe what the enforcement compilers consume:
//!
//! - [`SecurityGroup`] / [`SecurityGroupRule`]: the declarative policy
//! - [`Instance`] / [`NetworkInfo`]: what a VM is attached to
//! - [`GroupMember`]: a live member of a grantee group, as returned by the policy source
//! - [`ProviderRule`]: operator-injected global drops
//!
//! Rules never store resolved addresses. A grantee-group source stays a group id
//! and is expanded against the current membership on every compile pass
//! (see [`crate::core::rules`]).

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

pub type InstanceId = u64;
pub type GroupId = u64;

/// Address family of a table, rule or address
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum IpFamily {
    #[serde(rename = "ipv4")]
    #[strum(serialize = "ipv4")]
    V4,
    #[serde(rename = "ipv6")]
    #[strum(serialize = "ipv6")]
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        if addr.is_ipv4() { Self::V4 } else { Self::V6 }
    }

    pub fn of_network(net: &IpNetwork) -> Self {
        if net.is_ipv4() { Self::V4 } else { Self::V6 }
    }

    /// Host prefix length for a single address of this family
    pub const fn host_prefix(self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }
}

/// Protocol of a security-group or provider rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[default]
    #[strum(serialize = "any")]
    Any,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "icmp")]
    Icmp,
}

impl Protocol {
    /// Name passed to `-p`, or `None` when the rule matches every protocol.
    /// ICMP becomes `icmpv6` in the IPv6 table.
    pub const fn iptables_name(self, family: IpFamily) -> Option<&'static str> {
        match (self, family) {
            (Protocol::Any, _) => None,
            (Protocol::Tcp, _) => Some("tcp"),
            (Protocol::Udp, _) => Some("udp"),
            (Protocol::Icmp, IpFamily::V4) => Some("icmp"),
            (Protocol::Icmp, IpFamily::V6) => Some("icmpv6"),
        }
    }
}

/// Where traffic permitted by a rule may come from.
///
/// A CIDR and a grantee group are mutually exclusive by construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    /// Any source
    #[default]
    Any,
    /// A literal network
    Cidr(IpNetwork),
    /// Members of another security group, resolved at compile time
    Group(GroupId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityGroupRule {
    pub parent_group_id: GroupId,
    /// `None` behaves like [`Protocol::Any`]
    #[serde(default)]
    pub protocol: Option<Protocol>,
    /// First port, or ICMP type. -1 means "all".
    #[serde(default = "all_ports")]
    pub from_port: i32,
    /// Last port, or ICMP code. -1 means "all".
    #[serde(default = "all_ports")]
    pub to_port: i32,
    #[serde(default)]
    pub source: RuleSource,
}

impl SecurityGroupRule {
    pub fn protocol(&self) -> Protocol {
        self.protocol.unwrap_or_default()
    }
}

const fn all_ports() -> i32 {
    -1
}

/// An operator-injected rule dropping matching traffic for every instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderRule {
    pub protocol: Protocol,
    pub cidr: IpNetwork,
    #[serde(default = "all_ports")]
    pub from_port: i32,
    #[serde(default = "all_ports")]
    pub to_port: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    /// Numeric id; names the packet-filter chain (`inst-<id>`)
    pub id: InstanceId,
    pub uuid: Uuid,
    /// Hypervisor-visible name; names the interface filters
    pub name: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subnet {
    /// Network of the subnet; its family is the subnet's family
    pub cidr: IpNetwork,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub dhcp_server: Option<IpAddr>,
}

impl Subnet {
    pub fn family(&self) -> IpFamily {
        IpFamily::of_network(&self.cidr)
    }
}

/// A virtual interface and the subnets attached to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vif {
    /// MAC address, `aa:bb:cc:dd:ee:ff`
    pub address: String,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

impl Vif {
    pub fn subnets(&self, family: IpFamily) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(move |s| s.family() == family)
    }

    pub fn fixed_ips(&self, family: IpFamily) -> impl Iterator<Item = IpAddr> + '_ {
        self.subnets(family).flat_map(|s| s.ips.iter().copied())
    }

    pub fn has_dhcp_server(&self) -> bool {
        self.subnets.iter().any(|s| s.dhcp_server.is_some())
    }
}

/// Network attachments of one instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct NetworkInfo {
    pub vifs: Vec<Vif>,
}

impl NetworkInfo {
    pub fn new(vifs: Vec<Vif>) -> Self {
        Self { vifs }
    }

    pub fn subnets(&self, family: IpFamily) -> impl Iterator<Item = &Subnet> {
        self.vifs.iter().flat_map(move |v| v.subnets(family))
    }

    pub fn fixed_ips(&self, family: IpFamily) -> Vec<IpAddr> {
        self.vifs.iter().flat_map(|v| v.fixed_ips(family)).collect()
    }

    pub fn dhcp_servers(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.subnets(IpFamily::V4).filter_map(|s| s.dhcp_server)
    }
}

/// Current member of a security group, as seen by the policy source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    pub instance: Instance,
    #[serde(default)]
    pub network: NetworkInfo,
    /// Member whose network cache has been deleted; contributes no addresses
    #[serde(default)]
    pub deleted: bool,
}

//! Security-group rule expansion
//!
//! Turns the declarative rules attached to an instance into concrete,
//! per-family permit rules. Grantee groups are resolved against the live
//! membership returned by the [`PolicySource`] on every call; nothing here
//! caches addresses between compile passes.
//!
//! Expansion order is fixed: attached group, rule, vif, destination address,
//! then source address. The same inputs always produce the same sequence.

use crate::core::error::{Error, Result};
use crate::core::model::{
    GroupId, Instance, IpFamily, NetworkInfo, Protocol, ProviderRule, RuleSource,
    SecurityGroupRule,
};
use crate::core::policy::PolicySource;
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

/// Port, range or ICMP type/code restriction of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMatch {
    /// No restriction
    All,
    /// `--dport N`
    Port(u16),
    /// `-m multiport --dports A:B`
    Range(u16, u16),
    /// ICMP type with optional code
    Icmp { icmp_type: u8, code: Option<u8> },
}

impl PortMatch {
    /// Builds the restriction for a protocol from raw `from`/`to` values.
    ///
    /// For ICMP, `from` is the type and `to` the code. -1 means "all" in
    /// both positions.
    pub fn for_protocol(protocol: Protocol, from: i32, to: i32) -> Result<Self> {
        match protocol {
            Protocol::Any => Ok(Self::All),
            Protocol::Tcp | Protocol::Udp => {
                if from == -1 {
                    return Ok(Self::All);
                }
                let first = port(from, "from_port")?;
                let last = if to == -1 { first } else { port(to, "to_port")? };
                if last < first {
                    return Err(Error::validation(
                        "to_port",
                        format!("port range {first}:{last} is reversed"),
                    ));
                }
                if first == last {
                    Ok(Self::Port(first))
                } else {
                    Ok(Self::Range(first, last))
                }
            }
            Protocol::Icmp => {
                if from == -1 {
                    return Ok(Self::All);
                }
                let icmp_type = icmp_value(from, "icmp type")?;
                let code = if to == -1 {
                    None
                } else {
                    Some(icmp_value(to, "icmp code")?)
                };
                Ok(Self::Icmp { icmp_type, code })
            }
        }
    }

    /// Match arguments following `-p <proto>`, empty for [`PortMatch::All`]
    pub fn render(&self, protocol: Protocol, family: IpFamily) -> String {
        match (self, protocol) {
            (Self::All, _) | (_, Protocol::Any) => String::new(),
            (Self::Port(p), _) => format!("-m {protocol} --dport {p}"),
            (Self::Range(a, b), _) => format!("-m multiport --dports {a}:{b}"),
            (Self::Icmp { icmp_type, code }, _) => {
                let value = match code {
                    Some(c) => format!("{icmp_type}/{c}"),
                    None => icmp_type.to_string(),
                };
                match family {
                    IpFamily::V4 => format!("-m icmp --icmp-type {value}"),
                    IpFamily::V6 => format!("-m icmp6 --icmpv6-type {value}"),
                }
            }
        }
    }
}

fn port(value: i32, field: &str) -> Result<u16> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| Error::validation(field, format!("{value} is not a valid port")))
}

fn icmp_value(value: i32, field: &str) -> Result<u8> {
    u8::try_from(value)
        .map_err(|_| Error::validation(field, format!("{value} is outside 0-255")))
}

/// One concrete accept rule inside an instance chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermitRule {
    pub family: IpFamily,
    pub protocol: Protocol,
    pub ports: PortMatch,
    /// `None` when the rule has no source restriction
    pub source: Option<IpNetwork>,
    /// The instance address the rule protects
    pub destination: IpAddr,
}

impl fmt::Display for PermitRule {
    /// Rule body in the argument order `iptables-save` prints
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "-s {source} ")?;
        }
        write!(
            f,
            "-d {}/{}",
            self.destination,
            self.family.host_prefix()
        )?;
        if let Some(proto) = self.protocol.iptables_name(self.family) {
            write!(f, " -p {proto}")?;
            let ports = self.ports.render(self.protocol, self.family);
            if !ports.is_empty() {
                write!(f, " {ports}")?;
            }
        }
        write!(f, " -j ACCEPT")
    }
}

/// Expanded permit rules of one instance, split by table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandedRules {
    pub v4: Vec<PermitRule>,
    pub v6: Vec<PermitRule>,
}

impl ExpandedRules {
    pub fn get(&self, family: IpFamily) -> &[PermitRule] {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }

    fn push(&mut self, rule: PermitRule) {
        match rule.family {
            IpFamily::V4 => self.v4.push(rule),
            IpFamily::V6 => self.v6.push(rule),
        }
    }
}

/// Families the compilers emit rules for
pub fn enabled_families(use_ipv6: bool) -> &'static [IpFamily] {
    if use_ipv6 {
        &[IpFamily::V4, IpFamily::V6]
    } else {
        &[IpFamily::V4]
    }
}

/// Expands every rule of every group attached to `instance`.
///
/// With `use_ipv6` off the v6 sequence is empty. A grantee group with no
/// live members contributes no rules.
pub fn expand<P: PolicySource + ?Sized>(
    policy: &P,
    instance: &Instance,
    network: &NetworkInfo,
    use_ipv6: bool,
) -> Result<ExpandedRules> {
    let mut out = ExpandedRules::default();

    for group in policy.security_groups_for_instance(instance)? {
        for rule in policy.rules_for_group(group.id)? {
            expand_rule(policy, &rule, network, use_ipv6, &mut out)?;
        }
    }

    debug!(
        instance = instance.id,
        v4 = out.v4.len(),
        v6 = out.v6.len(),
        "Expanded security group rules"
    );
    Ok(out)
}

fn expand_rule<P: PolicySource + ?Sized>(
    policy: &P,
    rule: &SecurityGroupRule,
    network: &NetworkInfo,
    use_ipv6: bool,
    out: &mut ExpandedRules,
) -> Result<()> {
    let protocol = rule.protocol();
    let ports = PortMatch::for_protocol(protocol, rule.from_port, rule.to_port)?;
    let families = enabled_families(use_ipv6);

    // Grantee members are looked up once per rule, not per vif.
    let grantees = match &rule.source {
        RuleSource::Group(id) => Some(grantee_sources(policy, *id)?),
        _ => None,
    };

    for vif in &network.vifs {
        match &rule.source {
            RuleSource::Cidr(cidr) => {
                let family = IpFamily::of_network(cidr);
                if !families.contains(&family) {
                    continue;
                }
                for destination in vif.fixed_ips(family) {
                    out.push(PermitRule {
                        family,
                        protocol,
                        ports,
                        source: Some(*cidr),
                        destination,
                    });
                }
            }
            RuleSource::Group(_) => {
                let sources = grantees.as_deref().unwrap_or_default();
                for &family in families {
                    for destination in vif.fixed_ips(family) {
                        for source in sources.iter().filter(|s| IpFamily::of_network(s) == family)
                        {
                            out.push(PermitRule {
                                family,
                                protocol,
                                ports,
                                source: Some(*source),
                                destination,
                            });
                        }
                    }
                }
            }
            RuleSource::Any => {
                for &family in families {
                    for destination in vif.fixed_ips(family) {
                        out.push(PermitRule {
                            family,
                            protocol,
                            ports,
                            source: None,
                            destination,
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Host networks of every live member of a grantee group, both families
fn grantee_sources<P: PolicySource + ?Sized>(policy: &P, group: GroupId) -> Result<Vec<IpNetwork>> {
    let mut sources = Vec::new();
    for member in policy.members_of_group(group)? {
        if member.deleted {
            debug!(
                group,
                instance = member.instance.id,
                "Skipping deleted grantee member"
            );
            continue;
        }
        for vif in &member.network.vifs {
            for subnet in &vif.subnets {
                let prefix = subnet.family().host_prefix();
                for ip in &subnet.ips {
                    let net = IpNetwork::new(*ip, prefix)
                        .map_err(|e| Error::Internal(format!("host network for {ip}: {e}")))?;
                    sources.push(net);
                }
            }
        }
    }
    Ok(sources)
}

/// Provider-chain body of a provider rule, or `None` when the rule belongs
/// to the other table
pub fn provider_rule_text(rule: &ProviderRule, family: IpFamily) -> Result<Option<String>> {
    if IpFamily::of_network(&rule.cidr) != family {
        return Ok(None);
    }
    let ports = PortMatch::for_protocol(rule.protocol, rule.from_port, rule.to_port)?;
    let mut text = format!("-s {}", rule.cidr);
    if let Some(proto) = rule.protocol.iptables_name(family) {
        text.push_str(&format!(" -p {proto}"));
        let matched = ports.render(rule.protocol, family);
        if !matched.is_empty() {
            text.push(' ');
            text.push_str(&matched);
        }
    }
    text.push_str(" -j DROP");
    Ok(Some(text))
}

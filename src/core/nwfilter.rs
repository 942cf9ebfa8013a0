//! Hypervisor-filter compiler
//!
//! Builds libvirt nwfilter documents in three tiers and defines them in
//! dependency order:
//!
//! - **Base**: shipped with libvirt (`no-mac-spoofing`, `no-ip-spoofing`,
//!   `no-arp-spoofing`, `allow-dhcp-server`). Only verified, never defined.
//! - **Group**: `<p>-no-nd-reflection`, `<p>-nodhcp` and `<p>-base`, shared by
//!   every instance.
//! - **Interface**: `<p>-instance-<name>-<nic id>`, one per vif, carrying the
//!   per-vif parameters.
//!
//! A [`FilterGraph`] refuses any reference to a name that is unknown or sits
//! in a higher tier, so a document can never be defined before what it uses.

use crate::audit::{self, AuditLog};
use crate::config::FirewallConfig;
use crate::core::error::{Error, Result};
use crate::core::filter_backend::FilterBackend;
use crate::core::gate;
use crate::core::model::{Instance, IpFamily, NetworkInfo, Vif};
use crate::validators::{escape_xml, validate_filter_name};
use ipnetwork::IpNetwork;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Filters libvirt ships; they must exist before any group filter is defined
pub const BASE_FILTERS: [&str; 4] = [
    "no-mac-spoofing",
    "no-ip-spoofing",
    "no-arp-spoofing",
    "allow-dhcp-server",
];

const ANTI_SPOOFING: [&str; 3] = ["no-mac-spoofing", "no-ip-spoofing", "no-arp-spoofing"];

/// Parameters an interface filter may pass down
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
pub enum ParameterName {
    #[strum(serialize = "IP")]
    Ip,
    #[strum(serialize = "DHCPSERVER")]
    DhcpServer,
    #[strum(serialize = "RASERVER")]
    RaServer,
    #[strum(serialize = "PROJNET")]
    ProjNet,
    #[strum(serialize = "PROJMASK")]
    ProjMask,
    #[strum(serialize = "PROJNET6")]
    ProjNet6,
    #[strum(serialize = "PROJMASK6")]
    ProjMask6,
}

impl ParameterName {
    /// Parses a parameter name; anything outside the closed set is rejected.
    pub fn parse(name: &str) -> Result<Self> {
        Self::from_str(name).map_err(|_| Error::InvalidParameter(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterParameter {
    pub name: ParameterName,
    pub value: String,
}

impl FilterParameter {
    pub fn new(name: ParameterName, value: impl ToString) -> Self {
        Self {
            name,
            value: value.to_string(),
        }
    }
}

/// `<filterref filter='..'>` with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRef {
    pub filter: String,
    pub parameters: Vec<FilterParameter>,
}

impl FilterRef {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            parameters: Vec::new(),
        }
    }
}

/// Protocol element inside a rule, e.g. `<mac dstmacaddr='..'/>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMatch {
    pub protocol: String,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub action: String,
    pub direction: String,
    pub priority: Option<i32>,
    pub matches: Vec<ProtocolMatch>,
}

/// One nwfilter definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDocument {
    pub name: String,
    /// Assigned from the existing definition, or freshly, right before define
    pub uuid: Option<Uuid>,
    pub chain: Option<String>,
    pub priority: Option<i32>,
    pub references: Vec<FilterRef>,
    pub rules: Vec<FilterRule>,
}

impl FilterDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            chain: None,
            priority: None,
            references: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn with_chain(mut self, chain: &str) -> Self {
        self.chain = Some(chain.to_string());
        self
    }

    pub fn with_reference(mut self, reference: FilterRef) -> Self {
        self.references.push(reference);
        self
    }

    pub fn with_rule(mut self, rule: FilterRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Names this document references, in order
    pub fn referenced(&self) -> impl Iterator<Item = &str> {
        self.references.iter().map(|r| r.filter.as_str())
    }

    pub fn to_xml(&self) -> String {
        let mut out = format!("<filter name='{}'", escape_xml(&self.name));
        if let Some(chain) = &self.chain {
            let _ = write!(out, " chain='{}'", escape_xml(chain));
        }
        if let Some(priority) = self.priority {
            let _ = write!(out, " priority='{priority}'");
        }
        out.push_str(">\n");

        if let Some(uuid) = self.uuid {
            let _ = writeln!(out, "  <uuid>{uuid}</uuid>");
        }

        for reference in &self.references {
            let filter = escape_xml(&reference.filter);
            if reference.parameters.is_empty() {
                let _ = writeln!(out, "  <filterref filter='{filter}'/>");
                continue;
            }
            let _ = writeln!(out, "  <filterref filter='{filter}'>");
            for param in &reference.parameters {
                let _ = writeln!(
                    out,
                    "    <parameter name='{}' value='{}'/>",
                    param.name,
                    escape_xml(&param.value)
                );
            }
            out.push_str("  </filterref>\n");
        }

        for rule in &self.rules {
            let _ = write!(
                out,
                "  <rule action='{}' direction='{}'",
                escape_xml(&rule.action),
                escape_xml(&rule.direction)
            );
            if let Some(priority) = rule.priority {
                let _ = write!(out, " priority='{priority}'");
            }
            out.push_str(">\n");
            for m in &rule.matches {
                let _ = write!(out, "    <{}", m.protocol);
                for (key, value) in &m.attributes {
                    let _ = write!(out, " {key}='{}'", escape_xml(value));
                }
                out.push_str("/>\n");
            }
            out.push_str("  </rule>\n");
        }

        out.push_str("</filter>\n");
        out
    }

    /// Parses a document as printed by `virsh nwfilter-dumpxml`.
    ///
    /// Unknown elements are ignored; an unknown filterref parameter is
    /// [`Error::InvalidParameter`].
    pub fn from_xml(xml: &str) -> Result<Self> {
        let root = parse_element_tree(xml)?;
        if root.name != "filter" {
            return Err(xml_error(format!("root element is <{}>, not <filter>", root.name)));
        }

        let mut doc = Self::new(
            root.attr("name")
                .ok_or_else(|| xml_error("<filter> has no name"))?,
        );
        doc.chain = root.attr("chain").map(str::to_string);
        doc.priority = root.attr("priority").map(parse_priority).transpose()?;

        for child in &root.children {
            match child.name.as_str() {
                "uuid" => {
                    let text = child.text.trim();
                    doc.uuid = Some(
                        Uuid::parse_str(text)
                            .map_err(|e| xml_error(format!("bad uuid '{text}': {e}")))?,
                    );
                }
                "filterref" => {
                    let mut reference = FilterRef::new(
                        child
                            .attr("filter")
                            .ok_or_else(|| xml_error("<filterref> has no filter"))?,
                    );
                    for param in child.children.iter().filter(|c| c.name == "parameter") {
                        let name = param
                            .attr("name")
                            .ok_or_else(|| xml_error("<parameter> has no name"))?;
                        reference.parameters.push(FilterParameter {
                            name: ParameterName::parse(name)?,
                            value: param.attr("value").unwrap_or_default().to_string(),
                        });
                    }
                    doc.references.push(reference);
                }
                "rule" => {
                    doc.rules.push(FilterRule {
                        action: child.attr("action").unwrap_or_default().to_string(),
                        direction: child.attr("direction").unwrap_or_default().to_string(),
                        priority: child.attr("priority").map(parse_priority).transpose()?,
                        matches: child
                            .children
                            .iter()
                            .map(|m| ProtocolMatch {
                                protocol: m.name.clone(),
                                attributes: m.attrs.clone(),
                            })
                            .collect(),
                    });
                }
                other => debug!(element = other, "Ignoring unknown nwfilter element"),
            }
        }
        Ok(doc)
    }
}

fn xml_error(message: impl Into<String>) -> Error {
    Error::validation("xml", message)
}

fn parse_priority(value: &str) -> Result<i32> {
    value
        .parse()
        .map_err(|_| xml_error(format!("bad priority '{value}'")))
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn utf8_name(raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| xml_error(format!("non UTF-8 name: {e}")))
}

fn element_from(start: &BytesStart<'_>) -> Result<Element> {
    let name = utf8_name(start.name().as_ref())?;
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| xml_error(format!("in <{name}>: {e}")))?;
        let key = utf8_name(attr.key.as_ref())?;
        let value = attr
            .unescape_value()
            .map_err(|e| xml_error(format!("attribute '{key}' of <{name}>: {e}")))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        ..Element::default()
    })
}

fn attach(element: Element, stack: &mut Vec<Element>, root: &mut Option<Element>) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return Err(xml_error("more than one root element"));
    }
    Ok(())
}

/// Reads the document into an element tree; declarations and comments are
/// dropped.
fn parse_element_tree(xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(|e| xml_error(e.to_string()))? {
            Event::Start(start) => {
                if stack.is_empty() && root.is_some() {
                    return Err(xml_error("more than one root element"));
                }
                stack.push(element_from(&start)?);
            }
            Event::Empty(start) => attach(element_from(&start)?, &mut stack, &mut root)?,
            Event::End(end) => {
                let element = stack.pop().ok_or_else(|| {
                    xml_error(format!(
                        "unexpected </{}>",
                        String::from_utf8_lossy(end.name().as_ref())
                    ))
                })?;
                attach(element, &mut stack, &mut root)?;
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| xml_error(e.to_string()))?;
                match stack.last_mut() {
                    Some(top) => top.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err(xml_error("text outside the root element")),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(xml_error(format!("<{}> is never closed", open.name)));
    }
    root.ok_or_else(|| xml_error("empty document"))
}

/// Definition tier; a filter may only reference its own tier or below
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum Tier {
    Base,
    Group,
    Interface,
}

/// Registry that fixes a valid definition order
#[derive(Debug, Clone, Default)]
pub struct FilterGraph {
    nodes: BTreeMap<String, Tier>,
    order: Vec<String>,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter that already exists with the hypervisor
    pub fn register_base(&mut self, name: &str) {
        self.nodes.insert(name.to_string(), Tier::Base);
    }

    /// Registers a document, checking every reference is already known and
    /// sits in the same or a lower tier.
    pub fn register(&mut self, doc: &FilterDocument, tier: Tier) -> Result<()> {
        for reference in doc.referenced() {
            match self.nodes.get(reference) {
                Some(dep) if *dep <= tier => {}
                _ => {
                    return Err(Error::UndefinedDependency {
                        filter: doc.name.clone(),
                        reference: reference.to_string(),
                    });
                }
            }
        }
        if self.nodes.insert(doc.name.clone(), tier).is_none() {
            self.order.push(doc.name.clone());
        }
        Ok(())
    }

    pub fn tier(&self, name: &str) -> Option<Tier> {
        self.nodes.get(name).copied()
    }

    /// Non-base filters in the order they must be defined
    pub fn definition_order(&self) -> &[String] {
        &self.order
    }
}

fn rule_drop_nd_reflection() -> FilterRule {
    FilterRule {
        action: "drop".to_string(),
        direction: "in".to_string(),
        priority: None,
        matches: vec![ProtocolMatch {
            protocol: "mac".to_string(),
            attributes: vec![
                ("dstmacaddr".to_string(), "33:33:00:00:00:00".to_string()),
                ("dstmacmask".to_string(), "ff:ff:00:00:00:00".to_string()),
                ("srcmacaddr".to_string(), "$MAC".to_string()),
            ],
        }],
    }
}

/// Shared group-tier documents, in definition order
pub fn group_filters(prefix: &str) -> Vec<FilterDocument> {
    let no_nd = format!("{prefix}-no-nd-reflection");

    let mut nodhcp = FilterDocument::new(format!("{prefix}-nodhcp")).with_chain("root");
    let mut base = FilterDocument::new(format!("{prefix}-base")).with_chain("root");
    for name in ANTI_SPOOFING.iter().copied().chain([no_nd.as_str()]) {
        nodhcp = nodhcp.with_reference(FilterRef::new(name));
        base = base.with_reference(FilterRef::new(name));
    }
    base = base.with_reference(FilterRef::new("allow-dhcp-server"));

    vec![
        FilterDocument::new(no_nd.clone())
            .with_chain("ipv6")
            .with_rule(rule_drop_nd_reflection()),
        nodhcp,
        base,
    ]
}

/// Defines and removes the hypervisor filters of instances
pub struct NwFilter<F> {
    backend: F,
    config: FirewallConfig,
    audit: Option<AuditLog>,
    graph: FilterGraph,
    statics: Vec<FilterDocument>,
    static_ready: AtomicBool,
}

impl<F: FilterBackend> NwFilter<F> {
    pub fn new(backend: F, config: FirewallConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::validation("config", e))?;

        let mut graph = FilterGraph::new();
        for base in BASE_FILTERS {
            graph.register_base(base);
        }
        let statics = group_filters(&config.filter_prefix);
        for doc in &statics {
            graph.register(doc, Tier::Group)?;
        }

        Ok(Self {
            backend,
            config,
            audit: None,
            graph,
            statics,
            static_ready: AtomicBool::new(false),
        })
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn backend(&self) -> &F {
        &self.backend
    }

    fn filter_name(&self, suffix: &str) -> String {
        format!("{}-{suffix}", self.config.filter_prefix)
    }

    /// `<prefix>-instance-<instance name>-<mac without colons>`
    pub fn instance_filter_name(&self, instance: &Instance, vif: &Vif) -> Result<String> {
        let nic = crate::validators::nic_id(&vif.address)
            .map_err(|e| Error::validation("vif.address", e))?;
        let name = self.filter_name(&format!("instance-{}-{nic}", instance.name));
        validate_filter_name(&name).map_err(|e| Error::validation("filter", e))?;
        Ok(name)
    }

    /// Parameters of one vif, in IP, DHCP, RA, project network order
    pub fn vif_parameters(&self, vif: &Vif) -> Vec<FilterParameter> {
        let mut params: Vec<FilterParameter> = vif
            .fixed_ips(IpFamily::V4)
            .map(|ip| FilterParameter::new(ParameterName::Ip, ip))
            .collect();

        for subnet in vif.subnets(IpFamily::V4) {
            if let Some(dhcp) = subnet.dhcp_server {
                params.push(FilterParameter::new(ParameterName::DhcpServer, dhcp));
            }
        }

        if self.config.use_ipv6 {
            for gateway in vif.subnets(IpFamily::V6).filter_map(|s| s.gateway) {
                params.push(FilterParameter::new(
                    ParameterName::RaServer,
                    format!("{gateway}/128"),
                ));
            }
        }

        if self.config.allow_same_net_traffic {
            for subnet in vif.subnets(IpFamily::V4) {
                if let IpNetwork::V4(net) = subnet.cidr {
                    params.push(FilterParameter::new(ParameterName::ProjNet, net.network()));
                    params.push(FilterParameter::new(ParameterName::ProjMask, net.mask()));
                }
            }
            if self.config.use_ipv6 {
                for subnet in vif.subnets(IpFamily::V6) {
                    if let IpNetwork::V6(net) = subnet.cidr {
                        params.push(FilterParameter::new(ParameterName::ProjNet6, net.network()));
                        params.push(FilterParameter::new(ParameterName::ProjMask6, net.prefix()));
                    }
                }
            }
        }
        params
    }

    /// Interface-tier document of one vif
    pub fn interface_filter(&self, instance: &Instance, vif: &Vif) -> Result<FilterDocument> {
        let group = if vif.has_dhcp_server() {
            self.filter_name("base")
        } else {
            self.filter_name("nodhcp")
        };
        let mut reference = FilterRef::new(group);
        reference.parameters = self.vif_parameters(vif);

        Ok(FilterDocument::new(self.instance_filter_name(instance, vif)?)
            .with_chain("root")
            .with_reference(reference))
    }

    /// Defines `doc`, keeping the uuid of an existing definition.
    pub async fn define_filter(&self, mut doc: FilterDocument) -> Result<()> {
        validate_filter_name(&doc.name).map_err(|e| Error::validation("filter", e))?;

        let result = {
            let _gate = gate::acquire().await;
            match self.backend.lookup(&doc.name).await {
                Ok(existing) => {
                    if doc.uuid.is_none() {
                        doc.uuid = Some(existing.and_then(|e| e.uuid).unwrap_or_else(Uuid::new_v4));
                    }
                    self.backend.define(&doc).await
                }
                Err(e) => Err(e),
            }
        };

        if let Some(audit) = &self.audit {
            audit::log_define_filter(
                audit,
                &doc.name,
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
        }

        match &result {
            Ok(()) => debug!(filter = %doc.name, "Filter defined"),
            Err(e) => warn!(filter = %doc.name, "Failed to define filter: {e}"),
        }
        result
    }

    /// Verifies the base filters and defines the group tier once.
    pub async fn ensure_static_filters(&self) -> Result<()> {
        if self.static_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        for base in BASE_FILTERS {
            if self.backend.lookup(base).await?.is_none() {
                let dependent = self
                    .statics
                    .iter()
                    .find(|d| d.referenced().any(|r| r == base))
                    .map_or_else(|| self.filter_name("base"), |d| d.name.clone());
                return Err(Error::UndefinedDependency {
                    filter: dependent,
                    reference: base.to_string(),
                });
            }
        }

        for name in self.graph.definition_order() {
            if let Some(doc) = self.statics.iter().find(|d| &d.name == name) {
                self.define_filter(doc.clone()).await?;
            }
        }

        self.static_ready.store(true, Ordering::Release);
        info!("Static network filters in place");
        Ok(())
    }

    /// Defines one interface filter per vif.
    pub async fn setup_basic_filtering(&self, instance: &Instance, network: &NetworkInfo) -> Result<()> {
        self.ensure_static_filters().await?;

        let mut graph = self.graph.clone();
        let mut docs = Vec::with_capacity(network.vifs.len());
        for vif in &network.vifs {
            let doc = self.interface_filter(instance, vif)?;
            graph.register(&doc, Tier::Interface)?;
            docs.push(doc);
        }

        for doc in docs {
            self.define_filter(doc).await?;
        }
        info!(instance = instance.id, vifs = network.vifs.len(), "Basic filtering set up");
        Ok(())
    }

    /// Undefines the interface filters of an instance.
    ///
    /// A filter still in use is retried; one already gone is skipped.
    /// Returns how many filters were removed.
    pub async fn unfilter_instance(&self, instance: &Instance, network: &NetworkInfo) -> Result<usize> {
        let mut removed = 0;
        for vif in &network.vifs {
            let name = self.instance_filter_name(instance, vif)?;
            if self.undefine_with_retry(&name).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn undefine_with_retry(&self, name: &str) -> Result<bool> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let _gate = gate::acquire().await;
                self.backend.undefine(name).await
            };

            match result {
                Ok(()) => {
                    if let Some(audit) = &self.audit {
                        audit::log_undefine_filter(audit, name, true, None).await;
                    }
                    info!(filter = name, "Filter undefined");
                    return Ok(true);
                }
                Err(Error::FilterNotFound(_)) => {
                    debug!(filter = name, "Filter already gone");
                    return Ok(false);
                }
                Err(Error::FilterInUse(_)) if attempt < self.config.unfilter_retry_count => {
                    debug!(filter = name, attempt, "Filter still in use, retrying");
                    tokio::time::sleep(self.config.unfilter_retry_interval()).await;
                }
                Err(e) => {
                    if let Some(audit) = &self.audit {
                        audit::log_undefine_filter(audit, name, false, Some(e.to_string())).await;
                    }
                    warn!(filter = name, "Failed to undefine filter: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// True when every vif's interface filter is defined
    pub async fn instance_filter_exists(&self, instance: &Instance, network: &NetworkInfo) -> Result<bool> {
        for vif in &network.vifs {
            let name = self.instance_filter_name(instance, vif)?;
            if self.backend.lookup(&name).await?.is_none() {
                debug!(filter = %name, "Instance filter missing");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

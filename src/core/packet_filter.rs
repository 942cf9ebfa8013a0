//! Packet-filter compiler
//!
//! Keeps one staged [`FilterTable`] per address family and applies it with a
//! dump, merge and restore cycle. Chain layout, with `<p>` the chain prefix:
//!
//! ```text
//! INPUT/FORWARD/OUTPUT   -> <p>-INPUT/FORWARD/OUTPUT   (top of builtin)
//! <p>-FORWARD            -> <p>-local
//! <p>-local              -d <instance ip> -> <p>-inst-<id>
//! <p>-inst-<id>          -> <p>-provider, state, dhcp, project nets, RA,
//!                           security group rules, -> <p>-sg-fallback
//! <p>-sg-fallback        -j DROP
//! ```
//!
//! Policy is re-read on every compile; only the staged tables and the set of
//! filtered instances live here.

use crate::audit::{self, AuditLog};
use crate::config::FirewallConfig;
use crate::core::error::{Error, Result};
use crate::core::gate;
use crate::core::iptables::{FilterTable, SavedTables};
use crate::core::model::{GroupId, Instance, InstanceId, IpFamily, NetworkInfo};
use crate::core::policy::PolicySource;
use crate::core::rules::{self, enabled_families};
use crate::core::snapshot::SnapshotStore;
use crate::core::table_backend::TableBackend;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

pub const LOCAL_CHAIN: &str = "local";
pub const PROVIDER_CHAIN: &str = "provider";
pub const FALLBACK_CHAIN: &str = "sg-fallback";

const DHCP_REQUEST_RULE: &str =
    "-s 0.0.0.0/32 -d 255.255.255.255/32 -p udp -m udp --sport 68 --dport 67 -j ACCEPT";

/// Name of an instance's chain, without the prefix
pub fn instance_chain_name(id: InstanceId) -> String {
    format!("inst-{id}")
}

/// Rule bodies of one instance chain, per family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceRules {
    pub v4: Vec<String>,
    pub v6: Vec<String>,
}

impl InstanceRules {
    pub fn get(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }

    fn get_mut(&mut self, family: IpFamily) -> &mut Vec<String> {
        match family {
            IpFamily::V4 => &mut self.v4,
            IpFamily::V6 => &mut self.v6,
        }
    }
}

/// Result of refreshing one tracked instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Chain vanished from the staged table; left alone
    Skipped { reason: String },
    /// Rule computation failed; the previous rules stay staged
    Failed { error: String },
}

/// Per-instance outcomes of a batch refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub outcomes: Vec<(InstanceId, RefreshOutcome)>,
}

impl RefreshReport {
    pub fn refreshed(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RefreshOutcome::Refreshed))
            .map(|(id, _)| *id)
    }

    pub fn skipped(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RefreshOutcome::Skipped { .. }))
            .map(|(id, _)| *id)
    }

    pub fn failed(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RefreshOutcome::Failed { .. }))
            .map(|(id, _)| *id)
    }

    pub fn merge(&mut self, other: RefreshReport) {
        self.outcomes.extend(other.outcomes);
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    instance: Instance,
    network: NetworkInfo,
}

#[derive(Debug, Clone)]
struct Staged {
    v4: FilterTable,
    v6: FilterTable,
    instances: BTreeMap<InstanceId, Tracked>,
    dhcp_request_installed: bool,
}

impl Staged {
    fn table_mut(&mut self, family: IpFamily) -> &mut FilterTable {
        match family {
            IpFamily::V4 => &mut self.v4,
            IpFamily::V6 => &mut self.v6,
        }
    }

    fn table(&self, family: IpFamily) -> &FilterTable {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }
}

/// Compiles security groups into iptables chains and applies them
pub struct PacketFilter<P, B> {
    policy: P,
    backend: B,
    config: FirewallConfig,
    audit: Option<AuditLog>,
    snapshots: Option<SnapshotStore>,
    staged: Mutex<Staged>,
}

fn base_table(prefix: &str) -> Result<FilterTable> {
    let mut table = FilterTable::new(prefix);
    table.add_chain(LOCAL_CHAIN)?;
    table.add_chain(PROVIDER_CHAIN)?;
    table.add_chain(FALLBACK_CHAIN)?;
    table.add_rule("FORWARD", format!("-j ${LOCAL_CHAIN}"), false)?;
    table.add_rule(FALLBACK_CHAIN, "-j DROP", false)?;
    Ok(table)
}

impl<P: PolicySource + Send + Sync, B: TableBackend> PacketFilter<P, B> {
    pub fn new(policy: P, backend: B, config: FirewallConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::validation("config", e))?;
        let staged = Staged {
            v4: base_table(&config.chain_prefix)?,
            v6: base_table(&config.chain_prefix)?,
            instances: BTreeMap::new(),
            dhcp_request_installed: false,
        };
        Ok(Self {
            policy,
            backend,
            config,
            audit: None,
            snapshots: None,
            staged: Mutex::new(staged),
        })
    }

    /// Records every restore in `audit`
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Saves the live dump into `store` before every restore
    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    fn staged(&self) -> Result<MutexGuard<'_, Staged>> {
        self.staged
            .lock()
            .map_err(|_| Error::Internal("staged table lock poisoned".to_string()))
    }

    /// Runs `f` on a copy of the staged state and keeps the copy only when
    /// `f` succeeds, so a failed step never leaves a half-built table behind.
    fn update<R>(&self, f: impl FnOnce(&mut Staged) -> Result<R>) -> Result<R> {
        let mut staged = self.staged()?;
        let mut next = staged.clone();
        let out = f(&mut next)?;
        *staged = next;
        Ok(out)
    }

    /// Runs `f` against the staged table of one family
    pub fn with_staged_table<R>(&self, family: IpFamily, f: impl FnOnce(&mut FilterTable) -> R) -> Result<R> {
        Ok(f(self.staged()?.table_mut(family)))
    }

    pub fn is_tracked(&self, id: InstanceId) -> Result<bool> {
        Ok(self.staged()?.instances.contains_key(&id))
    }

    pub fn tracked_instances(&self) -> Result<Vec<InstanceId>> {
        Ok(self.staged()?.instances.keys().copied().collect())
    }

    /// Rule bodies of the instance chain, in evaluation order
    pub fn instance_rules(&self, instance: &Instance, network: &NetworkInfo) -> Result<InstanceRules> {
        let mut out = InstanceRules::default();
        let families = enabled_families(self.config.use_ipv6);

        for &family in families {
            let rules = out.get_mut(family);
            rules.push(format!("-j ${PROVIDER_CHAIN}"));
            rules.push("-m state --state INVALID -j DROP".to_string());
            rules.push("-m state --state ESTABLISHED,RELATED -j ACCEPT".to_string());
        }

        for dhcp in network.dhcp_servers() {
            out.v4.push(format!(
                "-s {dhcp}/32 -p udp -m udp --sport 67 --dport 68 -j ACCEPT"
            ));
        }

        if self.config.allow_same_net_traffic {
            for &family in families {
                for subnet in network.subnets(family) {
                    let net = ipnetwork::IpNetwork::new(subnet.cidr.network(), subnet.cidr.prefix())
                        .map_err(|e| Error::Internal(format!("subnet {}: {e}", subnet.cidr)))?;
                    out.get_mut(family).push(format!("-s {net} -j ACCEPT"));
                }
            }
        }

        if self.config.use_ipv6 {
            for gateway in network.subnets(IpFamily::V6).filter_map(|s| s.gateway) {
                out.v6
                    .push(format!("-s {gateway}/128 -p icmpv6 -j ACCEPT"));
            }
        }

        let expanded = rules::expand(&self.policy, instance, network, self.config.use_ipv6)?;
        for &family in families {
            let bodies = out.get_mut(family);
            bodies.extend(expanded.get(family).iter().map(ToString::to_string));
            bodies.push(format!("-j ${FALLBACK_CHAIN}"));
        }

        Ok(out)
    }

    fn remove_filters_for_instance(staged: &mut Staged, id: InstanceId) {
        let chain = instance_chain_name(id);
        for family in [IpFamily::V4, IpFamily::V6] {
            staged.table_mut(family).remove_chain(&chain);
        }
    }

    fn add_filters_for_instance(
        &self,
        staged: &mut Staged,
        id: InstanceId,
        network: &NetworkInfo,
        rules: &InstanceRules,
    ) -> Result<()> {
        let chain = instance_chain_name(id);
        for &family in enabled_families(self.config.use_ipv6) {
            let table = staged.table_mut(family);
            table.add_chain(&chain)?;
            for ip in network.fixed_ips(family) {
                table.add_rule(
                    LOCAL_CHAIN,
                    format!("-d {ip}/{} -j ${chain}", family.host_prefix()),
                    false,
                )?;
            }
            for body in rules.get(family) {
                table.add_rule(&chain, body.clone(), false)?;
            }
        }
        Ok(())
    }

    /// Provider chain bodies of every enabled family, fully rendered
    fn render_provider_rules(&self) -> Result<Vec<(IpFamily, Vec<String>)>> {
        let provider_rules = self.policy.provider_rules()?;
        let mut rendered = Vec::new();
        for &family in enabled_families(self.config.use_ipv6) {
            let mut bodies = Vec::with_capacity(provider_rules.len());
            for rule in &provider_rules {
                if let Some(text) = rules::provider_rule_text(rule, family)? {
                    bodies.push(text);
                }
            }
            rendered.push((family, bodies));
        }
        Ok(rendered)
    }

    fn install_provider_rules(staged: &mut Staged, rendered: &[(IpFamily, Vec<String>)]) -> Result<usize> {
        let mut count = 0;
        for (family, bodies) in rendered {
            let table = staged.table_mut(*family);
            table.empty_chain(PROVIDER_CHAIN);
            for body in bodies {
                table.add_rule(PROVIDER_CHAIN, body.clone(), false)?;
                count += 1;
            }
        }
        debug!(count, "Staged provider rules");
        Ok(count)
    }

    /// Stages the chain of a new or re-filtered instance.
    ///
    /// Nothing reaches the host until [`Self::apply_instance_filter`]. On
    /// error the staged state is left exactly as it was.
    pub fn prepare_instance_filter(&self, instance: &Instance, network: &NetworkInfo) -> Result<()> {
        let rules = self.instance_rules(instance, network)?;
        let provider = self.render_provider_rules()?;

        self.update(|staged| {
            Self::remove_filters_for_instance(staged, instance.id);
            self.add_filters_for_instance(staged, instance.id, network, &rules)?;
            Self::install_provider_rules(staged, &provider)?;

            if !staged.dhcp_request_installed && network.dhcp_servers().next().is_some() {
                for chain in ["INPUT", "FORWARD"] {
                    staged.v4.add_rule(chain, DHCP_REQUEST_RULE, false)?;
                }
                staged.dhcp_request_installed = true;
            }

            staged.instances.insert(
                instance.id,
                Tracked {
                    instance: instance.clone(),
                    network: network.clone(),
                },
            );
            Ok(())
        })?;

        info!(
            instance = instance.id,
            v4 = rules.v4.len(),
            v6 = rules.v6.len(),
            "Filters added to instance"
        );
        Ok(())
    }

    pub async fn apply_instance_filter(&self) -> Result<()> {
        self.apply().await
    }

    /// Merged restore text for one family against the current live dump
    pub async fn render(&self, family: IpFamily) -> Result<(String, String)> {
        let live = self.backend.save(family).await?;
        let merged = self.merge_into(&live, family)?;
        Ok((live, merged))
    }

    fn merge_into(&self, live: &str, family: IpFamily) -> Result<String> {
        let staged = self.staged()?;
        Ok(SavedTables::parse(live).merge(staged.table(family)).render())
    }

    fn owned_rule_count(&self, family: IpFamily) -> Result<usize> {
        let staged = self.staged()?;
        let (top, bottom) = staged.table(family).rule_lines();
        Ok(top.len() + bottom.len())
    }

    /// Dumps, merges and restores every enabled family.
    ///
    /// The replacement text is fully built before restore runs. A failure of
    /// either family ends the cycle with that error.
    pub async fn apply(&self) -> Result<()> {
        let _gate = gate::acquire().await;

        for &family in enabled_families(self.config.use_ipv6) {
            let live = self.backend.save(family).await?;

            if self.config.snapshot_before_apply
                && let Some(store) = &self.snapshots
                && !live.trim().is_empty()
                && let Err(e) = store.save(family, &live).await
            {
                warn!(%family, "Failed to save pre-apply snapshot: {e}");
            }

            let merged = self.merge_into(&live, family)?;
            let rule_count = self.owned_rule_count(family)?;
            let result = self.backend.restore(family, &merged).await;

            if let Some(audit) = &self.audit {
                audit::log_apply_table(
                    audit,
                    family,
                    rule_count,
                    result.is_ok(),
                    result.as_ref().err().map(ToString::to_string),
                )
                .await;
            }

            if let Err(e) = result {
                error!(%family, "Restore failed: {e}");
                return Err(e);
            }
            debug!(%family, rule_count, "Table applied");
        }
        Ok(())
    }

    /// Rebuilds the provider chain from the policy source and applies it.
    pub async fn refresh_provider_fw_rules(&self) -> Result<usize> {
        let rendered = self.render_provider_rules()?;
        let count = self.update(|staged| Self::install_provider_rules(staged, &rendered))?;
        let result = self.apply().await;

        if let Some(audit) = &self.audit {
            audit::log_refresh_provider(
                audit,
                count,
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
        }

        result.map(|()| count)
    }

    fn refresh_one(&self, tracked: &Tracked) -> RefreshOutcome {
        let id = tracked.instance.id;
        let rules = match self.instance_rules(&tracked.instance, &tracked.network) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(instance = id, "Failed to compute rules during refresh: {e}");
                return RefreshOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        let chain = instance_chain_name(id);
        let result = self.update(|staged| {
            if !staged.v4.has_chain(&chain) {
                info!(
                    instance = id,
                    chain = %staged.v4.wrapped_name(&chain),
                    "Instance chain disappeared during refresh, skipping"
                );
                return Ok(RefreshOutcome::Skipped {
                    reason: format!("chain {chain} no longer exists"),
                });
            }
            Self::remove_filters_for_instance(staged, id);
            self.add_filters_for_instance(staged, id, &tracked.network, &rules)?;
            Ok(RefreshOutcome::Refreshed)
        });

        result.unwrap_or_else(|e| {
            warn!(instance = id, "Failed to stage refreshed rules: {e}");
            RefreshOutcome::Failed {
                error: e.to_string(),
            }
        })
    }

    /// Recomputes the rules of every tracked instance without applying.
    ///
    /// Instances whose chain is gone are skipped; one instance's failure
    /// never stops the batch.
    pub fn do_refresh_security_group_rules(&self, group: Option<GroupId>) -> Result<RefreshReport> {
        let tracked: Vec<Tracked> = self.staged()?.instances.values().cloned().collect();
        debug!(?group, instances = tracked.len(), "Refreshing security group rules");

        let mut report = RefreshReport::default();
        for entry in &tracked {
            report
                .outcomes
                .push((entry.instance.id, self.refresh_one(entry)));
        }
        Ok(report)
    }

    /// Recomputes the rules of one tracked instance without applying.
    pub fn do_refresh_instance_rules(&self, id: InstanceId) -> Result<RefreshReport> {
        let tracked = self.staged()?.instances.get(&id).cloned();
        let mut report = RefreshReport::default();
        match tracked {
            Some(entry) => report.outcomes.push((id, self.refresh_one(&entry))),
            None => {
                debug!(instance = id, "Refresh requested for untracked instance");
                report.outcomes.push((
                    id,
                    RefreshOutcome::Skipped {
                        reason: "instance is not filtered".to_string(),
                    },
                ));
            }
        }
        Ok(report)
    }

    /// Removes the instance chain and every jump to it, then applies.
    pub async fn unfilter_instance(&self, id: InstanceId) -> Result<()> {
        let removed = {
            let mut staged = self.staged()?;
            let removed = staged.instances.remove(&id).is_some();
            if removed {
                Self::remove_filters_for_instance(&mut staged, id);
            }
            removed
        };

        if !removed {
            info!(instance = id, "Attempted to unfilter instance which is not filtered");
            return Ok(());
        }

        let result = self.apply().await;
        if let Some(audit) = &self.audit {
            audit::log_unfilter_instance(
                audit,
                id,
                result.is_ok(),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ProviderRule, Protocol, RuleSource};
    use crate::core::policy::StaticPolicy;
    use crate::core::table_backend::MemoryTables;
    use crate::core::test_helpers::{
        create_instance, create_rule, create_test_policy, fake_network_info,
    };
    use std::sync::Arc;

    fn test_config() -> FirewallConfig {
        FirewallConfig {
            audit_enabled: false,
            snapshot_before_apply: false,
            ..FirewallConfig::default()
        }
    }

    fn filter(policy: &Arc<StaticPolicy>) -> PacketFilter<Arc<StaticPolicy>, MemoryTables> {
        PacketFilter::new(Arc::clone(policy), MemoryTables::new(), test_config()).unwrap()
    }

    fn provider_rule(cidr: &str) -> ProviderRule {
        ProviderRule {
            protocol: Protocol::Tcp,
            cidr: cidr.parse().unwrap(),
            from_port: 1,
            to_port: 65535,
        }
    }

    #[test]
    fn test_instance_chain_order() {
        let policy = Arc::new(create_test_policy(vec![create_rule(
            1,
            Some(Protocol::Tcp),
            22,
            22,
            RuleSource::Cidr("192.168.0.0/16".parse().unwrap()),
        )]));
        let pf = filter(&policy);
        let rules = pf
            .instance_rules(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();

        assert_eq!(
            rules.v4,
            [
                "-j $provider",
                "-m state --state INVALID -j DROP",
                "-m state --state ESTABLISHED,RELATED -j ACCEPT",
                "-s 10.0.0.1/32 -p udp -m udp --sport 67 --dport 68 -j ACCEPT",
                "-s 10.0.0.0/24 -j ACCEPT",
                "-s 192.168.0.0/16 -d 10.0.0.2/32 -p tcp -m tcp --dport 22 -j ACCEPT",
                "-j $sg-fallback",
            ]
        );
        assert_eq!(
            rules.v6,
            [
                "-j $provider",
                "-m state --state INVALID -j DROP",
                "-m state --state ESTABLISHED,RELATED -j ACCEPT",
                "-s 2001:db8::/64 -j ACCEPT",
                "-s 2001:db8::1/128 -p icmpv6 -j ACCEPT",
                "-j $sg-fallback",
            ]
        );
    }

    #[test]
    fn test_same_net_traffic_disabled() {
        let policy = Arc::new(create_test_policy(vec![]));
        let pf = PacketFilter::new(
            Arc::clone(&policy),
            MemoryTables::new(),
            FirewallConfig {
                allow_same_net_traffic: false,
                ..test_config()
            },
        )
        .unwrap();
        let rules = pf
            .instance_rules(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();
        assert!(!rules.v4.iter().any(|r| r == "-s 10.0.0.0/24 -j ACCEPT"));
    }

    #[test]
    fn test_ipv6_disabled_stages_nothing_in_v6() {
        let policy = Arc::new(create_test_policy(vec![]));
        let pf = PacketFilter::new(
            Arc::clone(&policy),
            MemoryTables::new(),
            FirewallConfig {
                use_ipv6: false,
                ..test_config()
            },
        )
        .unwrap();
        let rules = pf
            .instance_rules(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();
        assert!(rules.v6.is_empty());

        pf.prepare_instance_filter(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();
        assert!(!pf
            .with_staged_table(IpFamily::V6, |t| t.has_chain("inst-1"))
            .unwrap());
    }

    #[test]
    fn test_multinic_dispatch_and_dhcp_request_rules() {
        let policy = Arc::new(create_test_policy(vec![]));
        let pf = filter(&policy);
        pf.prepare_instance_filter(&create_instance(1), &fake_network_info(2, 2))
            .unwrap();

        let local = pf
            .with_staged_table(IpFamily::V4, |t| {
                t.rules_in(LOCAL_CHAIN).iter().map(ToString::to_string).collect::<Vec<_>>()
            })
            .unwrap();
        assert_eq!(local.len(), 4);
        assert!(local.contains(&"-d 10.1.0.3/32 -j $inst-1".to_string()));

        let dhcp_rules = pf
            .with_staged_table(IpFamily::V4, |t| {
                t.rules_in("INPUT").len() + t.rules_in("FORWARD").iter().filter(|r| r.contains("--dport 67")).count()
            })
            .unwrap();
        assert_eq!(dhcp_rules, 2);

        // A second instance with DHCP does not add them again
        pf.prepare_instance_filter(&create_instance(2), &fake_network_info(1, 1))
            .unwrap();
        let input = pf
            .with_staged_table(IpFamily::V4, |t| t.rules_in("INPUT").len())
            .unwrap();
        assert_eq!(input, 1);
    }

    #[tokio::test]
    async fn test_provider_rule_counts_follow_policy() {
        let policy = Arc::new(create_test_policy(vec![]));
        let pf = filter(&policy);
        let count = |pf: &PacketFilter<_, _>| {
            pf.with_staged_table(IpFamily::V4, |t| t.rules_in(PROVIDER_CHAIN).len())
                .unwrap()
        };

        assert_eq!(count(&pf), 0);

        policy
            .set_provider_rules(vec![provider_rule("10.99.99.99/32")])
            .unwrap();
        assert_eq!(pf.refresh_provider_fw_rules().await.unwrap(), 1);
        assert_eq!(count(&pf), 1);

        policy
            .set_provider_rules(vec![
                provider_rule("10.99.99.99/32"),
                provider_rule("10.99.99.98/32"),
            ])
            .unwrap();
        pf.refresh_provider_fw_rules().await.unwrap();
        assert_eq!(count(&pf), 2);

        policy
            .set_provider_rules(vec![provider_rule("10.99.99.98/32")])
            .unwrap();
        pf.refresh_provider_fw_rules().await.unwrap();
        assert_eq!(count(&pf), 1);
        assert!(pf.backend().dump(IpFamily::V4).contains(
            "-A vmfw-provider -s 10.99.99.98/32 -p tcp -m multiport --dports 1:65535 -j DROP"
        ));
    }

    #[test]
    fn test_refresh_skips_instances_whose_chain_vanished() {
        let policy = Arc::new(create_test_policy(vec![]));
        let pf = filter(&policy);
        pf.prepare_instance_filter(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();
        pf.prepare_instance_filter(&create_instance(2), &fake_network_info(1, 1))
            .unwrap();

        pf.with_staged_table(IpFamily::V4, |t| t.remove_chain("inst-1"))
            .unwrap();
        pf.with_staged_table(IpFamily::V4, |t| t.remove_chain("inst-2"))
            .unwrap();

        let report = pf.do_refresh_security_group_rules(Some(1)).unwrap();
        assert_eq!(report.skipped().collect::<Vec<_>>(), [1, 2]);
        assert_eq!(report.refreshed().count(), 0);
        assert!(!pf
            .with_staged_table(IpFamily::V4, |t| t.has_chain("inst-1"))
            .unwrap());
    }

    #[test]
    fn test_refresh_failure_does_not_abort_batch() {
        let policy = Arc::new(create_test_policy(vec![]));
        let pf = filter(&policy);
        pf.prepare_instance_filter(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();

        // Instance 2 is tracked but attached to a group the policy no longer knows
        policy
            .update(|d| {
                let mut record = d.instances[0].clone();
                record.instance = create_instance(2);
                record.security_groups = vec![1];
                d.instances.push(record);
            })
            .unwrap();
        pf.prepare_instance_filter(&create_instance(2), &fake_network_info(1, 1))
            .unwrap();
        policy
            .update(|d| d.instances[1].security_groups = vec![77])
            .unwrap();

        let report = pf.do_refresh_security_group_rules(None).unwrap();
        assert_eq!(report.refreshed().collect::<Vec<_>>(), [1]);
        assert_eq!(report.failed().collect::<Vec<_>>(), [2]);
    }

    #[tokio::test]
    async fn test_unfilter_removes_chain_and_dispatch() {
        let policy = Arc::new(create_test_policy(vec![]));
        let pf = filter(&policy);
        pf.prepare_instance_filter(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();
        pf.apply_instance_filter().await.unwrap();
        assert!(pf.backend().dump(IpFamily::V4).contains(":vmfw-inst-1 - [0:0]"));

        pf.unfilter_instance(1).await.unwrap();
        let dump = pf.backend().dump(IpFamily::V4);
        assert!(!dump.contains("vmfw-inst-1"));
        assert!(!pf.is_tracked(1).unwrap());

        // Second call is a logged no-op
        let restores = pf.backend().restore_count();
        pf.unfilter_instance(1).await.unwrap();
        assert_eq!(pf.backend().restore_count(), restores);
    }

    #[tokio::test]
    async fn test_restore_failure_surfaces_tool_error() {
        let policy = Arc::new(create_test_policy(vec![]));
        let pf = filter(&policy);
        pf.prepare_instance_filter(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();
        pf.backend()
            .fail_restores_with(Some("iptables-restore: line 4 failed"));

        let err = pf.apply_instance_filter().await.unwrap_err();
        assert_eq!(err.tool_output(), Some("iptables-restore: line 4 failed"));
        assert!(pf.backend().dump(IpFamily::V4).is_empty());
    }

    fn reversed_provider_rule() -> ProviderRule {
        ProviderRule {
            from_port: 90,
            to_port: 80,
            ..provider_rule("10.99.99.97/32")
        }
    }

    fn host_provider_rules(pf: &PacketFilter<Arc<StaticPolicy>, MemoryTables>) -> usize {
        pf.backend()
            .dump(IpFamily::V4)
            .lines()
            .filter(|l| l.starts_with("-A vmfw-provider "))
            .count()
    }

    #[tokio::test]
    async fn test_bad_provider_rule_keeps_previous_chain() {
        let policy = Arc::new(create_test_policy(vec![]));
        policy
            .set_provider_rules(vec![provider_rule("10.99.99.99/32")])
            .unwrap();
        let pf = filter(&policy);
        pf.prepare_instance_filter(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();
        pf.prepare_instance_filter(&create_instance(2), &fake_network_info(1, 1))
            .unwrap();
        pf.apply().await.unwrap();
        assert_eq!(host_provider_rules(&pf), 1);

        // The malformed rule comes first, ahead of a valid one
        policy
            .set_provider_rules(vec![
                reversed_provider_rule(),
                provider_rule("10.99.99.98/32"),
            ])
            .unwrap();
        assert!(pf.refresh_provider_fw_rules().await.is_err());
        assert_eq!(
            pf.with_staged_table(IpFamily::V4, |t| t.rules_in(PROVIDER_CHAIN).len())
                .unwrap(),
            1
        );

        // An unrelated apply still pushes the old provider chain
        pf.unfilter_instance(2).await.unwrap();
        assert_eq!(host_provider_rules(&pf), 1);
        assert!(pf
            .backend()
            .dump(IpFamily::V4)
            .contains("-A vmfw-provider -s 10.99.99.99/32"));
    }

    #[tokio::test]
    async fn test_failed_prepare_leaves_instance_unfiltered() {
        let policy = Arc::new(create_test_policy(vec![]));
        let pf = filter(&policy);
        pf.prepare_instance_filter(&create_instance(1), &fake_network_info(1, 1))
            .unwrap();

        policy
            .set_provider_rules(vec![reversed_provider_rule()])
            .unwrap();
        assert!(pf
            .prepare_instance_filter(&create_instance(3), &fake_network_info(1, 1))
            .is_err());
        assert!(!pf.is_tracked(3).unwrap());
        assert_eq!(pf.tracked_instances().unwrap(), [1]);
        assert!(!pf
            .with_staged_table(IpFamily::V4, |t| t.has_chain("inst-3"))
            .unwrap());

        pf.apply().await.unwrap();
        let dump = pf.backend().dump(IpFamily::V4);
        assert!(dump.contains(":vmfw-inst-1 - [0:0]"));
        assert!(!dump.contains("vmfw-inst-3"));
    }
}

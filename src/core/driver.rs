//! Refresh orchestrator
//!
//! [`Firewall`] drives both compilers over one policy source: the packet
//! filter for L3/L4 rules and the hypervisor filters for anti-spoofing. Each
//! operation maps to one instance lifecycle step or one policy change.

use crate::config::FirewallConfig;
use crate::core::error::Result;
use crate::core::filter_backend::FilterBackend;
use crate::core::model::{GroupId, Instance, InstanceId, NetworkInfo};
use crate::core::nwfilter::NwFilter;
use crate::core::packet_filter::{PacketFilter, RefreshOutcome, RefreshReport};
use crate::core::policy::PolicySource;
use crate::core::table_backend::TableBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// A change the policy source reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    GroupRulesChanged(GroupId),
    GroupMembersChanged(GroupId),
    ProviderRulesChanged,
    InstanceSpawned {
        instance: Instance,
        network: NetworkInfo,
    },
    InstanceTerminated {
        instance: Instance,
        network: NetworkInfo,
    },
}

pub struct Firewall<P, B, F> {
    packet: PacketFilter<P, B>,
    hypervisor: NwFilter<F>,
    provider_ready: AtomicBool,
}

impl<P, B, F> Firewall<P, B, F>
where
    P: PolicySource + Send + Sync,
    B: TableBackend,
    F: FilterBackend,
{
    pub fn new(policy: P, tables: B, filters: F, config: FirewallConfig) -> Result<Self> {
        Ok(Self {
            hypervisor: NwFilter::new(filters, config.clone())?,
            packet: PacketFilter::new(policy, tables, config)?,
            provider_ready: AtomicBool::new(false),
        })
    }

    /// Wraps already configured compilers (audit log, snapshot store)
    pub fn from_parts(packet: PacketFilter<P, B>, hypervisor: NwFilter<F>) -> Self {
        Self {
            packet,
            hypervisor,
            provider_ready: AtomicBool::new(false),
        }
    }

    pub fn packet_filter(&self) -> &PacketFilter<P, B> {
        &self.packet
    }

    pub fn nwfilter(&self) -> &NwFilter<F> {
        &self.hypervisor
    }

    pub fn config(&self) -> &FirewallConfig {
        self.packet.config()
    }

    /// Hypervisor filters for every vif; the provider chain is populated on
    /// first use.
    pub async fn setup_basic_filtering(&self, instance: &Instance, network: &NetworkInfo) -> Result<()> {
        self.hypervisor
            .setup_basic_filtering(instance, network)
            .await?;

        if !self.provider_ready.load(Ordering::Acquire) {
            let count = self.packet.refresh_provider_fw_rules().await?;
            self.provider_ready.store(true, Ordering::Release);
            debug!(count, "Provider rules installed on first setup");
        }
        Ok(())
    }

    pub fn prepare_instance_filter(&self, instance: &Instance, network: &NetworkInfo) -> Result<()> {
        self.packet.prepare_instance_filter(instance, network)
    }

    pub async fn apply_instance_filter(&self) -> Result<()> {
        self.packet.apply_instance_filter().await
    }

    /// Drops the packet-filter chain, then the interface filters.
    ///
    /// Returns the number of hypervisor filters removed.
    pub async fn unfilter_instance(&self, instance: &Instance, network: &NetworkInfo) -> Result<usize> {
        self.packet.unfilter_instance(instance.id).await?;
        let removed = self.hypervisor.unfilter_instance(instance, network).await?;
        info!(instance = instance.id, removed, "Instance unfiltered");
        Ok(removed)
    }

    async fn apply_report(&self, report: RefreshReport) -> Result<RefreshReport> {
        if report.refreshed().next().is_some() {
            self.packet.apply().await?;
        } else {
            debug!("Nothing refreshed, table left as is");
        }
        for (id, outcome) in &report.outcomes {
            if let RefreshOutcome::Failed { error } = outcome {
                warn!(instance = id, "Refresh failed: {error}");
            }
        }
        Ok(report)
    }

    pub async fn refresh_security_group_rules(&self, group: GroupId) -> Result<RefreshReport> {
        let report = self.packet.do_refresh_security_group_rules(Some(group))?;
        self.apply_report(report).await
    }

    /// Membership changed: grantee expansions of every tracked instance may
    /// differ, so all of them are recomputed.
    pub async fn refresh_security_group_members(&self, group: GroupId) -> Result<RefreshReport> {
        let report = self.packet.do_refresh_security_group_rules(Some(group))?;
        self.apply_report(report).await
    }

    pub async fn refresh_instance_security_rules(&self, id: InstanceId) -> Result<RefreshReport> {
        let report = self.packet.do_refresh_instance_rules(id)?;
        self.apply_report(report).await
    }

    pub async fn refresh_provider_fw_rules(&self) -> Result<usize> {
        let count = self.packet.refresh_provider_fw_rules().await?;
        self.provider_ready.store(true, Ordering::Release);
        Ok(count)
    }

    /// Full enforcement for an instance: at host start and after migration.
    pub async fn ensure_filtering_rules_for_instance(
        &self,
        instance: &Instance,
        network: &NetworkInfo,
    ) -> Result<()> {
        self.setup_basic_filtering(instance, network).await?;
        self.prepare_instance_filter(instance, network)?;
        self.apply_instance_filter().await
    }

    pub async fn instance_filter_exists(&self, instance: &Instance, network: &NetworkInfo) -> Result<bool> {
        self.hypervisor
            .instance_filter_exists(instance, network)
            .await
    }

    /// Recomputes every other tracked instance; any of them may now be
    /// granted access to `instance` through a group source.
    fn refresh_peers(&self, instance: &Instance) -> Result<RefreshReport> {
        let mut peers = self.packet.do_refresh_security_group_rules(None)?;
        peers.outcomes.retain(|(id, _)| *id != instance.id);
        Ok(peers)
    }

    /// Maps one policy event onto the operations above.
    pub async fn handle(&self, event: PolicyEvent) -> Result<RefreshReport> {
        debug!(?event, "Handling policy event");
        match event {
            PolicyEvent::GroupRulesChanged(group) => self.refresh_security_group_rules(group).await,
            PolicyEvent::GroupMembersChanged(group) => {
                self.refresh_security_group_members(group).await
            }
            PolicyEvent::ProviderRulesChanged => {
                self.refresh_provider_fw_rules().await?;
                Ok(RefreshReport::default())
            }
            PolicyEvent::InstanceSpawned { instance, network } => {
                self.setup_basic_filtering(&instance, &network).await?;
                self.prepare_instance_filter(&instance, &network)?;
                let mut report = self.refresh_peers(&instance)?;
                report.outcomes.insert(0, (instance.id, RefreshOutcome::Refreshed));
                self.apply_report(report).await
            }
            PolicyEvent::InstanceTerminated { instance, network } => {
                self.unfilter_instance(&instance, &network).await?;
                let report = self.packet.do_refresh_security_group_rules(None)?;
                self.apply_report(report).await
            }
        }
    }
}

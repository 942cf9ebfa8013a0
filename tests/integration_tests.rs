//! Integration tests for vmfw
//!
//! These tests drive the public API end to end: a JSON policy file, both
//! compilers, and the in-memory table and filter backends. Nothing here needs
//! privileges or a running libvirt.
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;
use vmfw::audit::{AuditLog, EventType};
use vmfw::config::FirewallConfig;
use vmfw::core::error::ToolErrorPattern;
use vmfw::core::filter_backend::MemoryFilters;
use vmfw::core::nwfilter::{BASE_FILTERS, NwFilter, ParameterName};
use vmfw::core::packet_filter::PacketFilter;
use vmfw::core::policy::StaticPolicy;
use vmfw::core::snapshot::{SnapshotStore, restore_latest_snapshot};
use vmfw::core::table_backend::MemoryTables;
use vmfw::{Error, Firewall, IpFamily, PolicyEvent};

type MemoryFirewall = Firewall<Arc<StaticPolicy>, MemoryTables, MemoryFilters>;

/// web-1 (group 1) allows HTTP from anywhere, SSH from group 2 and ICMP from
/// 192.168.0.0/16; bastion is the only member of group 2. One provider rule
/// drops SMTP from a documentation network.
const POLICY: &str = r#"{
  "groups": [
    {"id": 1, "name": "web"},
    {"id": 2, "name": "admins"}
  ],
  "rules": [
    {"parent_group_id": 1, "protocol": "tcp", "from_port": 80, "to_port": 80, "source": "any"},
    {"parent_group_id": 1, "protocol": "tcp", "from_port": 22, "to_port": 22, "source": {"group": 2}},
    {"parent_group_id": 1, "protocol": "icmp", "source": {"cidr": "192.168.0.0/16"}}
  ],
  "instances": [
    {
      "instance": {"id": 1, "uuid": "00000000-0000-0000-0000-000000000001", "name": "web-1"},
      "network": [
        {"address": "fa:16:3e:00:00:01", "subnets": [
          {"cidr": "10.0.0.0/24", "ips": ["10.0.0.3"], "gateway": "10.0.0.1", "dhcp_server": "10.0.0.2"},
          {"cidr": "2001:db8::/64", "ips": ["2001:db8::3"], "gateway": "2001:db8::1"}
        ]}
      ],
      "security_groups": [1]
    },
    {
      "instance": {"id": 2, "uuid": "00000000-0000-0000-0000-000000000002", "name": "bastion"},
      "network": [
        {"address": "fa:16:3e:00:00:02", "subnets": [
          {"cidr": "10.0.0.0/24", "ips": ["10.0.0.4"], "gateway": "10.0.0.1"}
        ]}
      ],
      "security_groups": [2]
    }
  ],
  "provider_rules": [
    {"protocol": "tcp", "cidr": "203.0.113.0/24", "from_port": 25, "to_port": 25}
  ]
}"#;

/// Host tables before vmfw runs: libvirt's NAT and INPUT chain
const HOST_V4: &str = "\
*nat
:PREROUTING ACCEPT [0:0]
:POSTROUTING ACCEPT [0:0]
[5:300] -A POSTROUTING -s 192.168.122.0/24 -j MASQUERADE
COMMIT
*filter
:INPUT ACCEPT [0:0]
:FORWARD ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
:LIBVIRT_INP - [0:0]
[1:60] -A INPUT -j LIBVIRT_INP
[0:0] -A LIBVIRT_INP -i virbr0 -p udp -m udp --dport 53 -j ACCEPT
COMMIT
";

fn test_config() -> FirewallConfig {
    FirewallConfig {
        audit_enabled: false,
        snapshot_before_apply: false,
        unfilter_retry_count: 2,
        unfilter_retry_interval_ms: 1,
        ..FirewallConfig::default()
    }
}

async fn load_policy() -> Arc<StaticPolicy> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json");
    tokio::fs::write(&path, POLICY).await.unwrap();
    Arc::new(StaticPolicy::load(&path).await.unwrap())
}

fn firewall(policy: &Arc<StaticPolicy>, tables: MemoryTables, config: FirewallConfig) -> MemoryFirewall {
    Firewall::new(
        Arc::clone(policy),
        tables,
        MemoryFilters::with_base_filters(),
        config,
    )
    .unwrap()
}

async fn filter_all(fw: &MemoryFirewall, policy: &StaticPolicy) {
    for record in policy.snapshot().unwrap().instances {
        fw.ensure_filtering_rules_for_instance(&record.instance, &record.network)
            .await
            .unwrap();
    }
}

fn v4(fw: &MemoryFirewall) -> String {
    fw.packet_filter().backend().dump(IpFamily::V4)
}

#[tokio::test]
async fn test_full_policy_compiles_expected_rules() {
    let policy = load_policy().await;
    let fw = firewall(&policy, MemoryTables::with_tables(HOST_V4, ""), test_config());
    filter_all(&fw, &policy).await;

    let dump = v4(&fw);
    for expected in [
        "-A vmfw-inst-1 -d 10.0.0.3/32 -p tcp -m tcp --dport 80 -j ACCEPT",
        "-A vmfw-inst-1 -s 10.0.0.4/32 -d 10.0.0.3/32 -p tcp -m tcp --dport 22 -j ACCEPT",
        "-A vmfw-inst-1 -s 192.168.0.0/16 -d 10.0.0.3/32 -p icmp -j ACCEPT",
        "-A vmfw-inst-1 -s 10.0.0.2/32 -p udp -m udp --sport 67 --dport 68 -j ACCEPT",
        "-A vmfw-provider -s 203.0.113.0/24 -p tcp -m tcp --dport 25 -j DROP",
        "-A vmfw-local -d 10.0.0.4/32 -j vmfw-inst-2",
    ] {
        assert!(dump.contains(expected), "missing {expected:?} in:\n{dump}");
    }

    let v6 = fw.packet_filter().backend().dump(IpFamily::V6);
    assert!(v6.contains("-A vmfw-inst-1 -d 2001:db8::3/128 -p tcp -m tcp --dport 80 -j ACCEPT"));
    assert!(v6.contains("-A vmfw-inst-1 -s 2001:db8::1/128 -p icmpv6 -j ACCEPT"));
    // bastion has no v6 address, so SSH from it stays v4-only
    assert!(!v6.contains("--dport 22"));
}

#[tokio::test]
async fn test_foreign_rules_survive_and_apply_is_idempotent() {
    let policy = load_policy().await;
    let fw = firewall(&policy, MemoryTables::with_tables(HOST_V4, ""), test_config());
    filter_all(&fw, &policy).await;

    let first = v4(&fw);
    for line in HOST_V4.lines() {
        assert!(first.lines().any(|l| l == line), "lost host line {line:?}");
    }

    fw.apply_instance_filter().await.unwrap();
    assert_eq!(v4(&fw), first);
}

#[tokio::test]
async fn test_setup_twice_produces_no_duplicates() {
    let policy = load_policy().await;
    let fw = firewall(&policy, MemoryTables::new(), test_config());
    filter_all(&fw, &policy).await;
    let dump = v4(&fw);
    let filters = fw.nwfilter().backend().len();

    filter_all(&fw, &policy).await;

    assert_eq!(v4(&fw), dump);
    assert_eq!(fw.nwfilter().backend().len(), filters);
    assert_eq!(dump.matches("-j vmfw-inst-1").count(), 1);
}

#[tokio::test]
async fn test_provider_rule_counts_follow_policy() {
    let policy = load_policy().await;
    let fw = firewall(&policy, MemoryTables::new(), test_config());
    let provider_lines = |fw: &MemoryFirewall| v4(fw).matches("-A vmfw-provider ").count();

    fw.handle(PolicyEvent::ProviderRulesChanged).await.unwrap();
    assert_eq!(provider_lines(&fw), 1);

    let mut rules = policy.snapshot().unwrap().provider_rules;
    rules.push(serde_json::from_str(r#"{"protocol": "udp", "cidr": "198.51.100.7/32"}"#).unwrap());
    policy.set_provider_rules(rules.clone()).unwrap();
    fw.handle(PolicyEvent::ProviderRulesChanged).await.unwrap();
    assert_eq!(provider_lines(&fw), 2);
    fw.handle(PolicyEvent::ProviderRulesChanged).await.unwrap();
    assert_eq!(provider_lines(&fw), 2);

    rules.remove(0);
    policy.set_provider_rules(rules).unwrap();
    fw.handle(PolicyEvent::ProviderRulesChanged).await.unwrap();
    assert_eq!(provider_lines(&fw), 1);
    assert!(v4(&fw).contains("-A vmfw-provider -s 198.51.100.7/32 -p udp -j DROP"));
}

#[tokio::test]
async fn test_malformed_provider_rule_leaves_enforcement_untouched() {
    let policy = load_policy().await;
    let fw = firewall(&policy, MemoryTables::with_tables(HOST_V4, ""), test_config());
    filter_all(&fw, &policy).await;
    let smtp = "-A vmfw-provider -s 203.0.113.0/24 -p tcp -m tcp --dport 25 -j DROP";
    assert!(v4(&fw).contains(smtp));

    let mut rules = policy.snapshot().unwrap().provider_rules;
    rules.insert(
        0,
        serde_json::from_str(r#"{"protocol": "tcp", "cidr": "198.51.100.0/24", "from_port": 90, "to_port": 80}"#)
            .unwrap(),
    );
    policy.set_provider_rules(rules).unwrap();
    assert!(fw.handle(PolicyEvent::ProviderRulesChanged).await.is_err());

    let bastion = policy.instance(2).unwrap().unwrap();
    fw.handle(PolicyEvent::InstanceTerminated {
        instance: bastion.instance.clone(),
        network: bastion.network.clone(),
    })
    .await
    .unwrap();
    assert!(v4(&fw).contains(smtp));
    assert!(!v4(&fw).contains("198.51.100.0/24"));

    // Re-spawning fails at the packet filter and leaves nothing staged
    assert!(
        fw.handle(PolicyEvent::InstanceSpawned {
            instance: bastion.instance.clone(),
            network: bastion.network.clone(),
        })
        .await
        .is_err()
    );
    assert!(!fw.packet_filter().is_tracked(2).unwrap());
    fw.handle(PolicyEvent::GroupRulesChanged(1)).await.unwrap();
    assert!(!v4(&fw).contains("vmfw-inst-2"));
    assert!(v4(&fw).contains(smtp));
}

#[tokio::test]
async fn test_refresh_skips_instance_whose_chain_vanished() {
    let policy = load_policy().await;
    let fw = firewall(&policy, MemoryTables::new(), test_config());
    filter_all(&fw, &policy).await;

    fw.packet_filter()
        .with_staged_table(IpFamily::V4, |table| table.remove_chain("inst-1"))
        .unwrap();

    let report = fw.handle(PolicyEvent::GroupRulesChanged(1)).await.unwrap();
    assert_eq!(report.skipped().collect::<Vec<_>>(), [1]);
    assert_eq!(report.refreshed().collect::<Vec<_>>(), [2]);
    assert!(!v4(&fw).contains("vmfw-inst-1"));
}

#[tokio::test]
async fn test_filters_defined_after_their_dependencies() {
    let policy = load_policy().await;
    let fw = firewall(&policy, MemoryTables::new(), test_config());
    filter_all(&fw, &policy).await;

    let backend = fw.nwfilter().backend();
    let log = backend.define_log();
    assert!(!log.is_empty());
    for (i, name) in log.iter().enumerate() {
        let doc = backend.get(name).unwrap();
        for reference in doc.referenced() {
            assert!(
                BASE_FILTERS.contains(&reference) || log[..i].iter().any(|n| n == reference),
                "{name} defined before {reference}"
            );
        }
    }

    // web-1 has a DHCP server, bastion does not
    let web = backend.get("vmfw-instance-web-1-fa163e000001").unwrap();
    assert_eq!(web.references[0].filter, "vmfw-base");
    let bastion = backend.get("vmfw-instance-bastion-fa163e000002").unwrap();
    assert_eq!(bastion.references[0].filter, "vmfw-nodhcp");
}

#[tokio::test]
async fn test_terminate_removes_one_filter_per_vif() {
    let policy = load_policy().await;
    let fw = firewall(&policy, MemoryTables::new(), test_config());
    filter_all(&fw, &policy).await;
    let record = policy.instance(1).unwrap().unwrap();
    let before = fw.nwfilter().backend().len();

    fw.handle(PolicyEvent::InstanceTerminated {
        instance: record.instance.clone(),
        network: record.network.clone(),
    })
    .await
    .unwrap();

    assert_eq!(before - fw.nwfilter().backend().len(), record.network.vifs.len());
    assert!(
        !fw.instance_filter_exists(&record.instance, &record.network)
            .await
            .unwrap()
    );
    assert!(!v4(&fw).contains("vmfw-inst-1"));
    assert!(v4(&fw).contains("vmfw-inst-2"));
}

#[tokio::test]
async fn test_ipv6_disabled_leaves_v6_table_alone() {
    let policy = load_policy().await;
    let config = FirewallConfig {
        use_ipv6: false,
        ..test_config()
    };
    let fw = firewall(&policy, MemoryTables::new(), config);
    filter_all(&fw, &policy).await;

    assert!(fw.packet_filter().backend().dump(IpFamily::V6).is_empty());
    let web = fw
        .nwfilter()
        .backend()
        .get("vmfw-instance-web-1-fa163e000001")
        .unwrap();
    let params = &web.references[0].parameters;
    assert!(params.iter().all(|p| p.name != ParameterName::RaServer));
    assert!(params.iter().all(|p| p.name != ParameterName::ProjNet6));
}

#[tokio::test]
async fn test_restore_failure_surfaces_tool_output() {
    let policy = load_policy().await;
    let tables = MemoryTables::new();
    tables.fail_restores_with(Some("iptables-restore: line 9 failed"));
    let fw = firewall(&policy, tables, test_config());
    let record = policy.instance(1).unwrap().unwrap();

    let err = fw
        .ensure_filtering_rules_for_instance(&record.instance, &record.network)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Tool { exit_code: Some(1), .. }));
    let translation = ToolErrorPattern::match_error(err.tool_output().unwrap());
    assert!(translation.suggestions.iter().any(|s| s.contains("vmfw render")));
}

#[tokio::test]
async fn test_snapshot_and_audit_around_apply() {
    let dir = tempfile::tempdir().unwrap();
    let policy = load_policy().await;
    let config = FirewallConfig {
        audit_enabled: true,
        snapshot_before_apply: true,
        ..test_config()
    };
    let store = SnapshotStore::new(dir.path());
    let audit = AuditLog::at(dir.path().join("audit.log"));

    let packet = PacketFilter::new(
        Arc::clone(&policy),
        MemoryTables::with_tables(HOST_V4, ""),
        config.clone(),
    )
    .unwrap()
    .with_audit(audit.clone())
    .with_snapshots(store.clone());
    let hypervisor = NwFilter::new(MemoryFilters::with_base_filters(), config)
        .unwrap()
        .with_audit(audit.clone());
    let fw = Firewall::from_parts(packet, hypervisor);

    fw.refresh_provider_fw_rules().await.unwrap();
    assert_ne!(v4(&fw), HOST_V4);
    // The empty v6 table is not worth a snapshot
    assert_eq!(store.list(IpFamily::V4).await.unwrap().len(), 1);
    assert!(store.list(IpFamily::V6).await.unwrap().is_empty());

    let restored = restore_latest_snapshot(&store, fw.packet_filter().backend(), IpFamily::V4)
        .await
        .unwrap();
    assert_eq!(restored.dump, HOST_V4);
    assert_eq!(v4(&fw), HOST_V4);

    let events = audit.read_recent(10).await.unwrap();
    assert!(matches!(events[0].event_type, EventType::RefreshProvider));
    assert!(events.iter().any(|e| matches!(e.event_type, EventType::ApplyTable)));
    assert!(events.iter().all(|e| e.success));
}

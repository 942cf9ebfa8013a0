//! Shared test utilities for core module tests
//!
//! Provides common fixture builders to avoid duplication across test suites.
//! This module is only compiled in test mode.

use crate::core::model::{
    GroupId, Instance, InstanceId, NetworkInfo, Protocol, RuleSource, SecurityGroup,
    SecurityGroupRule, Subnet, Vif,
};
use crate::core::policy::{InstanceRecord, PolicyData, StaticPolicy};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Mutex;
use uuid::Uuid;

/// Mutex for tests that need exclusive access to environment variables.
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("VMFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("VMFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

pub fn create_instance(id: InstanceId) -> Instance {
    Instance {
        id,
        uuid: Uuid::from_u128(u128::from(id)),
        name: format!("instance-{id:08x}"),
        project_id: "fake".to_string(),
        user_id: "fake".to_string(),
    }
}

pub fn create_security_group(id: GroupId, name: &str) -> SecurityGroup {
    SecurityGroup {
        id,
        name: name.to_string(),
        project_id: "fake".to_string(),
        user_id: "fake".to_string(),
    }
}

pub fn create_rule(
    group: GroupId,
    protocol: Option<Protocol>,
    from_port: i32,
    to_port: i32,
    source: RuleSource,
) -> SecurityGroupRule {
    SecurityGroupRule {
        parent_group_id: group,
        protocol,
        from_port,
        to_port,
        source,
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Network info with `vifs` interfaces, each carrying one v4 and one v6
/// subnet with `ips` fixed addresses per subnet.
///
/// Interface `i` gets MAC `56:12:12:12:12:1i`, `10.i.0.0/24` and
/// `2001:db8:i::/64`, both with gateway `.1`. Only the first interface has a
/// DHCP server (`10.0.0.1`).
pub fn fake_network_info(vifs: usize, ips: usize) -> NetworkInfo {
    NetworkInfo::new(
        (0..vifs)
            .map(|i| Vif {
                address: format!("56:12:12:12:12:1{i}"),
                subnets: vec![
                    Subnet {
                        cidr: format!("10.{i}.0.0/24").parse().unwrap(),
                        ips: (0..ips).map(|n| ip(&format!("10.{i}.0.{}", n + 2))).collect(),
                        gateway: Some(ip(&format!("10.{i}.0.1"))),
                        dhcp_server: (i == 0).then(|| ip("10.0.0.1")),
                    },
                    Subnet {
                        cidr: format!("2001:db8:{i}::/64").parse().unwrap(),
                        ips: (0..ips)
                            .map(|n| ip(&format!("2001:db8:{i}::{:x}", n + 2)))
                            .collect(),
                        gateway: Some(ip(&format!("2001:db8:{i}::1"))),
                        dhcp_server: None,
                    },
                ],
            })
            .collect(),
    )
}

/// Single-interface network holding exactly the given v4 and v6 addresses
pub fn dual_stack_network(v4: &str, v6: &str) -> NetworkInfo {
    NetworkInfo::new(vec![Vif {
        address: "56:12:12:12:12:99".to_string(),
        subnets: vec![
            Subnet {
                cidr: IpNetwork::new(ip(v4), 24).unwrap(),
                ips: vec![ip(v4)],
                gateway: None,
                dhcp_server: None,
            },
            Subnet {
                cidr: IpNetwork::new(ip(v6), 64).unwrap(),
                ips: vec![ip(v6)],
                gateway: None,
                dhcp_server: None,
            },
        ],
    }])
}

/// Policy with instance 1 in group 1 ("testgroup") and an empty group 2
/// ("other") usable as a grantee.
pub fn create_test_policy(rules: Vec<SecurityGroupRule>) -> StaticPolicy {
    StaticPolicy::new(PolicyData {
        groups: vec![
            create_security_group(1, "testgroup"),
            create_security_group(2, "other"),
        ],
        rules,
        instances: vec![InstanceRecord {
            instance: create_instance(1),
            network: fake_network_info(1, 1),
            security_groups: vec![1],
            deleted: false,
        }],
        provider_rules: vec![],
    })
}

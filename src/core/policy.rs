//! Read-only policy queries
//!
//! The compilers never cache policy: every compile pass calls back into the
//! [`PolicySource`], so membership and rule changes take effect on the next
//! refresh. [`StaticPolicy`] is an in-memory source loaded from JSON, used by
//! the CLI and by tests.

use crate::core::error::{Error, Result};
use crate::core::model::{
    GroupId, GroupMember, Instance, InstanceId, NetworkInfo, ProviderRule, SecurityGroup,
    SecurityGroupRule,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Queryable store of security groups, rules, memberships and provider rules
pub trait PolicySource {
    /// Groups an instance is attached to, in attachment order
    fn security_groups_for_instance(&self, instance: &Instance) -> Result<Vec<SecurityGroup>>;

    /// Rules of a group, in definition order
    fn rules_for_group(&self, group: GroupId) -> Result<Vec<SecurityGroupRule>>;

    /// Current members of a group
    fn members_of_group(&self, group: GroupId) -> Result<Vec<GroupMember>>;

    /// All provider-level rules
    fn provider_rules(&self) -> Result<Vec<ProviderRule>>;
}

impl<P: PolicySource + ?Sized> PolicySource for Arc<P> {
    fn security_groups_for_instance(&self, instance: &Instance) -> Result<Vec<SecurityGroup>> {
        (**self).security_groups_for_instance(instance)
    }

    fn rules_for_group(&self, group: GroupId) -> Result<Vec<SecurityGroupRule>> {
        (**self).rules_for_group(group)
    }

    fn members_of_group(&self, group: GroupId) -> Result<Vec<GroupMember>> {
        (**self).members_of_group(group)
    }

    fn provider_rules(&self) -> Result<Vec<ProviderRule>> {
        (**self).provider_rules()
    }
}

/// An instance together with its attachments and group memberships
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub instance: Instance,
    #[serde(default)]
    pub network: NetworkInfo,
    #[serde(default)]
    pub security_groups: Vec<GroupId>,
    /// Network cache deleted; the instance is ignored as a grantee member
    #[serde(default)]
    pub deleted: bool,
}

/// Serializable policy snapshot
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PolicyData {
    #[serde(default)]
    pub groups: Vec<SecurityGroup>,
    #[serde(default)]
    pub rules: Vec<SecurityGroupRule>,
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub provider_rules: Vec<ProviderRule>,
}

/// In-memory [`PolicySource`]; mutations are visible to the next query
#[derive(Debug, Default)]
pub struct StaticPolicy {
    data: RwLock<PolicyData>,
}

impl StaticPolicy {
    pub fn new(data: PolicyData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Loads a policy snapshot from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        let data: PolicyData = serde_json::from_str(&json)?;
        Ok(Self::new(data))
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> Result<PolicyData> {
        Ok(self.read()?.clone())
    }

    /// Applies a mutation to the underlying data
    pub fn update(&self, f: impl FnOnce(&mut PolicyData)) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| Error::Policy("policy lock poisoned".to_string()))?;
        f(&mut data);
        Ok(())
    }

    pub fn set_provider_rules(&self, rules: Vec<ProviderRule>) -> Result<()> {
        self.update(|d| d.provider_rules = rules)
    }

    pub fn instance(&self, id: InstanceId) -> Result<Option<InstanceRecord>> {
        Ok(self
            .read()?
            .instances
            .iter()
            .find(|r| r.instance.id == id)
            .cloned())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, PolicyData>> {
        self.data
            .read()
            .map_err(|_| Error::Policy("policy lock poisoned".to_string()))
    }
}

impl PolicySource for StaticPolicy {
    fn security_groups_for_instance(&self, instance: &Instance) -> Result<Vec<SecurityGroup>> {
        let data = self.read()?;
        let Some(record) = data.instances.iter().find(|r| r.instance.id == instance.id) else {
            return Ok(Vec::new());
        };

        record
            .security_groups
            .iter()
            .map(|id| {
                data.groups
                    .iter()
                    .find(|g| g.id == *id)
                    .cloned()
                    .ok_or_else(|| Error::Policy(format!("unknown security group {id}")))
            })
            .collect()
    }

    fn rules_for_group(&self, group: GroupId) -> Result<Vec<SecurityGroupRule>> {
        Ok(self
            .read()?
            .rules
            .iter()
            .filter(|r| r.parent_group_id == group)
            .cloned()
            .collect())
    }

    fn members_of_group(&self, group: GroupId) -> Result<Vec<GroupMember>> {
        Ok(self
            .read()?
            .instances
            .iter()
            .filter(|r| r.security_groups.contains(&group))
            .map(|r| GroupMember {
                instance: r.instance.clone(),
                network: r.network.clone(),
                deleted: r.deleted,
            })
            .collect())
    }

    fn provider_rules(&self) -> Result<Vec<ProviderRule>> {
        Ok(self.read()?.provider_rules.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Protocol;
    use crate::core::test_helpers::{create_instance, create_security_group, fake_network_info};

    fn sample_policy() -> StaticPolicy {
        let a = create_instance(1);
        let b = create_instance(2);
        StaticPolicy::new(PolicyData {
            groups: vec![create_security_group(10, "web"), create_security_group(20, "db")],
            rules: vec![],
            instances: vec![
                InstanceRecord {
                    instance: a,
                    network: fake_network_info(1, 1),
                    security_groups: vec![10, 20],
                    deleted: false,
                },
                InstanceRecord {
                    instance: b,
                    network: fake_network_info(1, 1),
                    security_groups: vec![20],
                    deleted: true,
                },
            ],
            provider_rules: vec![],
        })
    }

    #[test]
    fn test_groups_for_instance_in_attachment_order() {
        let policy = sample_policy();
        let groups = policy
            .security_groups_for_instance(&create_instance(1))
            .unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["web", "db"]);
    }

    #[test]
    fn test_members_carry_deleted_flag() {
        let policy = sample_policy();
        let members = policy.members_of_group(20).unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|m| m.deleted));
    }

    #[test]
    fn test_unknown_group_is_policy_error() {
        let policy = sample_policy();
        policy
            .update(|d| d.instances[0].security_groups.push(99))
            .unwrap();
        let err = policy
            .security_groups_for_instance(&create_instance(1))
            .unwrap_err();
        assert!(matches!(err, Error::Policy(_)));
    }

    #[test]
    fn test_updates_visible_to_next_query() {
        let policy = Arc::new(sample_policy());
        assert!(policy.provider_rules().unwrap().is_empty());
        policy
            .set_provider_rules(vec![ProviderRule {
                protocol: Protocol::Tcp,
                cidr: "10.99.99.99/32".parse().unwrap(),
                from_port: 1,
                to_port: 65535,
            }])
            .unwrap();
        assert_eq!(policy.provider_rules().unwrap().len(), 1);
    }
}

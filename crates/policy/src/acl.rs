//! ACL-scoped policy views.
//!
//! Role grants come from `aclrule` objects evaluated in weight order against
//! the user's labels; the first rule granting a given role wins. Domain
//! admins bypass namespace scoping entirely.

use std::collections::{BTreeMap, BTreeSet};

use ballast_core::{BallastError, BallastResult};

use crate::lang::{Role, User};
use crate::{Policy, PolicyObject};

/// Read-only view of a policy through one user's ACL grants.
pub struct PolicyView<'a> {
    user: &'a User,
    grants: BTreeMap<Role, BTreeSet<String>>,
}

impl<'a> PolicyView<'a> {
    pub(crate) fn new(policy: &'a Policy, user: &'a User) -> PolicyView<'a> {
        let mut grants: BTreeMap<Role, BTreeSet<String>> = BTreeMap::new();
        for rule in policy.acl_rules_sorted() {
            let matches = match &rule.criteria {
                Some(criteria) => criteria.matches(&user.labels).unwrap_or(false),
                None => true,
            };
            if !matches {
                continue;
            }
            for (role, namespaces) in &rule.actions.add_role {
                // first matching rule per role wins
                grants
                    .entry(*role)
                    .or_insert_with(|| namespaces.iter().cloned().collect());
            }
        }
        PolicyView { user, grants }
    }

    pub fn user(&self) -> &User {
        self.user
    }

    fn role_covers(&self, role: Role, namespace: &str) -> bool {
        self.grants
            .get(&role)
            .map(|namespaces| namespaces.contains("*") || namespaces.contains(namespace))
            .unwrap_or(false)
    }

    /// Whether any grant (or domain adminship) reaches the namespace.
    pub fn covers_namespace(&self, namespace: &str) -> bool {
        self.user.domain_admin
            || self
                .grants
                .keys()
                .copied()
                .any(|role| self.role_covers(role, namespace))
    }

    /// Check-only: may this user manage the object? ACL rules themselves
    /// need domain adminship; claims need at least consumer scope; anything
    /// else needs operator scope.
    pub fn manage_object(&self, obj: &PolicyObject) -> BallastResult<()> {
        if self.user.domain_admin {
            return Ok(());
        }
        let ns = obj.namespace();
        let allowed = match obj {
            PolicyObject::AclRule(_) => false,
            PolicyObject::Claim(_) => {
                self.role_covers(Role::Consumer, ns) || self.role_covers(Role::Operator, ns)
            }
            _ => self.role_covers(Role::Operator, ns),
        };
        if allowed {
            Ok(())
        } else {
            Err(BallastError::AclDenied {
                user: self.user.metadata.name.clone(),
                key: obj.key(),
            })
        }
    }

    /// Whether an instance may be placed on a cluster living in `namespace`.
    pub fn can_use_cluster(&self, cluster_namespace: &str) -> bool {
        self.covers_namespace(cluster_namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::{AclActions, AclRule, Claim, LabelSet, Rule, RuleActions};
    use crate::Criteria;
    use ballast_core::Metadata;

    fn user(name: &str, labels: &[(&str, &str)], admin: bool) -> User {
        User {
            metadata: Metadata::new("user", "system", name),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            domain_admin: admin,
        }
    }

    fn acl_rule(name: &str, weight: i64, expr: Option<&str>, role: Role, ns: &[&str]) -> AclRule {
        AclRule {
            metadata: Metadata::new("aclrule", "system", name),
            weight,
            criteria: expr.map(|e| Criteria { require_all: vec![e.to_string()], ..Default::default() }),
            actions: AclActions {
                add_role: [(role, ns.iter().map(|s| s.to_string()).collect())].into(),
            },
        }
    }

    fn claim(ns: &str) -> PolicyObject {
        PolicyObject::Claim(Claim {
            metadata: Metadata::new("claim", ns, "web"),
            user: "alice".into(),
            contract: "analytics".into(),
            labels: LabelSet::new(),
        })
    }

    fn rule(ns: &str) -> PolicyObject {
        PolicyObject::Rule(Rule {
            metadata: Metadata::new("rule", ns, "r1"),
            weight: 10,
            criteria: None,
            actions: RuleActions::default(),
        })
    }

    #[test]
    fn unprivileged_user_is_denied() {
        let p = Policy::new();
        let alice = user("alice", &[], false);
        let err = p.view(&alice).manage_object(&rule("platform")).unwrap_err();
        assert!(matches!(err, BallastError::AclDenied { .. }));
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn domain_admin_bypasses_scoping() {
        let p = Policy::new();
        let root = user("root", &[], true);
        p.view(&root).manage_object(&rule("anywhere")).unwrap();
    }

    #[test]
    fn operator_scope_is_namespace_bound() {
        let mut p = Policy::new();
        p.add_object(PolicyObject::AclRule(acl_rule(
            "ops-main",
            10,
            Some("team == 'platform'"),
            Role::Operator,
            &["main"],
        )))
        .unwrap();

        let eve = user("eve", &[("team", "platform")], false);
        let view = p.view(&eve);
        view.manage_object(&rule("main")).unwrap();
        assert!(view.manage_object(&rule("other")).is_err());
        // operators may manage claims in their namespaces too
        view.manage_object(&claim("main")).unwrap();
        // but never acl rules
        let acl_obj = PolicyObject::AclRule(acl_rule("x", 99, None, Role::Consumer, &["main"]));
        assert!(view.manage_object(&acl_obj).is_err());
    }

    #[test]
    fn consumer_scope_only_reaches_claims() {
        let mut p = Policy::new();
        p.add_object(PolicyObject::AclRule(acl_rule("c", 10, None, Role::Consumer, &["main"])))
            .unwrap();
        let bob = user("bob", &[], false);
        let view = p.view(&bob);
        view.manage_object(&claim("main")).unwrap();
        assert!(view.manage_object(&rule("main")).is_err());
    }

    #[test]
    fn first_matching_rule_per_role_wins() {
        let mut p = Policy::new();
        p.add_object(PolicyObject::AclRule(acl_rule("narrow", 1, None, Role::Operator, &["main"])))
            .unwrap();
        p.add_object(PolicyObject::AclRule(acl_rule("wide", 2, None, Role::Operator, &["*"])))
            .unwrap();
        let eve = user("eve", &[], false);
        let view = p.view(&eve);
        // the weight-1 rule won, so only "main" is granted
        view.manage_object(&rule("main")).unwrap();
        assert!(view.manage_object(&rule("other")).is_err());
    }

    #[test]
    fn wildcard_namespace_grant() {
        let mut p = Policy::new();
        p.add_object(PolicyObject::AclRule(acl_rule("wide", 1, None, Role::Operator, &["*"])))
            .unwrap();
        let eve = user("eve", &[], false);
        let view = p.view(&eve);
        view.manage_object(&rule("anything")).unwrap();
        assert!(view.can_use_cluster("system"));
    }
}

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::domainlist::DomainList;
use crate::netlist::NetList;

/// Policy action as written in configuration. `DenyAll` is the catch-all
/// terminator and takes no list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Force,
    Accept,
    Deny,
    DenyAll,
}

/// Outcome of a policy lookup. `DenyAll` collapses to `Deny` here, and
/// `Missing` means no rule had an opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Force,
    Accept,
    Deny,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Domain,
    Ip,
}

/// One parsed rule of a policy string, list not yet loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPolicy {
    pub action: Action,
    pub args: Option<String>,
}

/// Parses the pipe-separated policy syntax, e.g.
/// `accept:cn.txt|deny:bogus.txt|deny_all`. `force` is only recognised for
/// domain policies.
pub fn parse_policies(s: &str, kind: PolicyKind) -> Result<Vec<RawPolicy>> {
    let mut policies = Vec::new();
    for rule in s.split('|') {
        let (action_str, args) = match rule.split_once(':') {
            Some((a, p)) => (a, Some(p.to_string())),
            None => (rule, None),
        };
        let action = match (action_str, kind) {
            ("force", PolicyKind::Domain) => Action::Force,
            ("accept", _) => Action::Accept,
            ("deny", _) => Action::Deny,
            ("deny_all", _) => Action::DenyAll,
            _ => bail!("unknown action [{action_str}]"),
        };
        if action != Action::DenyAll && args.is_none() {
            bail!("action [{action_str}] requires a list file");
        }
        policies.push(RawPolicy { action, args });
    }
    Ok(policies)
}

/// Ordered domain policy set. Frozen after construction.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicies {
    policies: Vec<(Action, Option<DomainList>)>,
}

impl DomainPolicies {
    pub fn load(raw: Vec<RawPolicy>) -> Result<Self> {
        let mut policies = Vec::with_capacity(raw.len());
        for p in raw {
            let list = match p.args {
                Some(file) => {
                    let list = DomainList::from_file(&file)
                        .with_context(|| format!("load domain list {file}"))?;
                    info!(file = %file, entries = list.len(), "domain list loaded");
                    Some(list)
                }
                None => None,
            };
            policies.push((p.action, list));
        }
        Ok(Self { policies })
    }

    pub(crate) fn from_rules(policies: Vec<(Action, Option<DomainList>)>) -> Self {
        Self { policies }
    }

    /// First-match walk in declaration order.
    pub fn check(&self, fqdn: &str) -> Verdict {
        for (action, list) in &self.policies {
            if *action == Action::DenyAll {
                return Verdict::Deny;
            }
            if let Some(list) = list {
                if list.has(fqdn) {
                    return match action {
                        Action::Force => Verdict::Force,
                        Action::Accept => Verdict::Accept,
                        Action::Deny => Verdict::Deny,
                        Action::DenyAll => unreachable!(),
                    };
                }
            }
        }
        Verdict::Missing
    }
}

/// Ordered IP policy set over IPv6-normalised addresses.
#[derive(Debug, Clone, Default)]
pub struct IpPolicies {
    policies: Vec<(Action, Option<NetList>)>,
}

impl IpPolicies {
    pub fn load(raw: Vec<RawPolicy>) -> Result<Self> {
        let mut policies = Vec::with_capacity(raw.len());
        for p in raw {
            let list = match p.args {
                Some(file) => {
                    let list = NetList::from_file(&file)
                        .with_context(|| format!("load ip list {file}"))?;
                    info!(file = %file, entries = list.len(), "ip list loaded");
                    Some(list)
                }
                None => None,
            };
            policies.push((p.action, list));
        }
        Ok(Self { policies })
    }

    pub(crate) fn from_rules(policies: Vec<(Action, Option<NetList>)>) -> Self {
        Self { policies }
    }

    pub fn check(&self, ip: u128) -> Verdict {
        for (action, list) in &self.policies {
            if *action == Action::DenyAll {
                return Verdict::Deny;
            }
            if let Some(list) = list {
                if list.contains(ip) {
                    return match action {
                        Action::Force => Verdict::Force,
                        Action::Accept => Verdict::Accept,
                        Action::Deny => Verdict::Deny,
                        Action::DenyAll => unreachable!(),
                    };
                }
            }
        }
        Verdict::Missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlist::{conv, NetList};

    #[test]
    fn parse_accepts_known_actions() {
        let rules = parse_policies("accept:cn.txt|deny:bogus.txt|deny_all", PolicyKind::Domain)
            .expect("parse");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].action, Action::Accept);
        assert_eq!(rules[0].args.as_deref(), Some("cn.txt"));
        assert_eq!(rules[2].action, Action::DenyAll);
        assert_eq!(rules[2].args, None);
    }

    #[test]
    fn parse_rejects_unknown_action() {
        let err = parse_policies("allow:cn.txt", PolicyKind::Domain).unwrap_err();
        assert!(err.to_string().contains("unknown action"));
    }

    #[test]
    fn force_is_invalid_for_ip_policies() {
        assert!(parse_policies("force:cn.txt", PolicyKind::Domain).is_ok());
        let err = parse_policies("force:cn.txt", PolicyKind::Ip).unwrap_err();
        assert!(err.to_string().contains("unknown action [force]"));
    }

    #[test]
    fn list_action_requires_a_path() {
        assert!(parse_policies("accept", PolicyKind::Domain).is_err());
        assert!(parse_policies("deny_all", PolicyKind::Domain).is_ok());
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let cn = crate::domainlist::DomainList::from_text("baidu.com");
        let bogus = crate::domainlist::DomainList::from_text("baidu.com\nevil.com");
        let policies = DomainPolicies::from_rules(vec![
            (Action::Accept, Some(cn)),
            (Action::Deny, Some(bogus)),
        ]);
        // baidu.com is in both lists, the first rule decides
        assert_eq!(policies.check("baidu.com"), Verdict::Accept);
        assert_eq!(policies.check("evil.com"), Verdict::Deny);
        assert_eq!(policies.check("example.org"), Verdict::Missing);
    }

    #[test]
    fn deny_all_short_circuits() {
        let cn = crate::domainlist::DomainList::from_text("baidu.com");
        let policies = DomainPolicies::from_rules(vec![
            (Action::DenyAll, None),
            (Action::Accept, Some(cn)),
        ]);
        assert_eq!(policies.check("baidu.com"), Verdict::Deny);
        assert_eq!(policies.check("anything.at.all"), Verdict::Deny);
    }

    #[test]
    fn rule_without_list_never_matches() {
        let policies = DomainPolicies::from_rules(vec![(Action::Deny, None)]);
        assert_eq!(policies.check("example.com"), Verdict::Missing);
    }

    #[test]
    fn ip_policies_check_normalised_addresses() {
        let cn = NetList::from_text("220.181.0.0/16").expect("list");
        let policies = IpPolicies::from_rules(vec![
            (Action::Accept, Some(cn)),
            (Action::DenyAll, None),
        ]);
        assert_eq!(
            policies.check(conv("220.181.38.148".parse().unwrap())),
            Verdict::Accept
        );
        assert_eq!(
            policies.check(conv("8.8.8.8".parse().unwrap())),
            Verdict::Deny
        );
    }
}

//! Ordered forwarding policies and their evaluation.
//!
//! A [`PolicyTable`] is an ordered list of policies, each keyed by the address
//! set its *source* must belong to. Evaluation walks the list in order and the
//! first policy that reaches a decision wins:
//!
//! | Step | Condition (policy applies to source)  | Result                      |
//! |------|----------------------------------------|-----------------------------|
//! | 1    | destination in any `deny` set          | `Deny`                      |
//! | 2    | destination in any `allow` set         | `Allow`                     |
//! | 3    | `default` is `allow` / `deny`          | `Allow` / `Deny`            |
//! | 4    | none of the above                      | try the next policy         |
//!
//! If no policy decides, the result is [`Decision::Unmatched`], which callers
//! treat exactly like a deny.

use crate::addrset::AddressSets;
use crate::error::{KangarooError, KangarooResult};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::debug;

/// Action taken when an applicable policy matches neither allow nor deny sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultAction {
    Allow,
    Deny,
    /// No default: fall through to the next policy.
    #[default]
    Unset,
}

impl FromStr for DefaultAction {
    type Err = KangarooError;

    /// Case-insensitive; the empty string means unset.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "" => Ok(Self::Unset),
            _ => Err(KangarooError::InvalidDefault(s.to_string())),
        }
    }
}

impl fmt::Display for DefaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Unset => "unset",
        })
    }
}

/// A policy as configured, referring to address sets by name.
#[derive(Debug, Clone, Default)]
pub struct PolicySpec {
    /// Address set the connection source must belong to.
    pub source: String,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub default: DefaultAction,
    /// Allow decisions additionally need proof of link-layer adjacency.
    pub require_same_link: bool,
}

/// Outcome of evaluating the table for one (source, destination) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow {
        policy: String,
        require_link_proof: bool,
    },
    Deny {
        policy: String,
        reason: String,
    },
    /// No policy applied or none reached a decision.
    Unmatched,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn requires_link_proof(&self) -> bool {
        matches!(
            self,
            Decision::Allow {
                require_link_proof: true,
                ..
            }
        )
    }
}

/// A policy with its set references resolved to positions in [`AddressSets`].
#[derive(Debug, Clone)]
struct CompiledPolicy {
    source_name: String,
    source: usize,
    allow: Vec<usize>,
    deny: Vec<usize>,
    default: DefaultAction,
    require_same_link: bool,
}

/// Immutable, ordered policy table plus the address sets it references.
///
/// Built once at startup and shared read-only (`Arc<PolicyTable>`) between
/// request tasks; nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    sets: AddressSets,
    policies: Vec<CompiledPolicy>,
}

impl PolicyTable {
    /// Resolve every set reference and build the table, preserving the order
    /// of `policies`.
    ///
    /// # Errors
    ///
    /// Fails if any policy names an undefined address set, or if two policies
    /// share the same source set.
    pub fn new(sets: AddressSets, policies: Vec<PolicySpec>) -> KangarooResult<Self> {
        let mut compiled: Vec<CompiledPolicy> = Vec::with_capacity(policies.len());
        for spec in policies {
            if compiled.iter().any(|p| p.source_name == spec.source) {
                return Err(KangarooError::DuplicatePolicy(spec.source));
            }
            let resolve = |name: &String| {
                sets.position(name).ok_or_else(|| KangarooError::UnknownSet {
                    policy: spec.source.clone(),
                    set: name.clone(),
                })
            };
            let source = resolve(&spec.source)?;
            let allow = spec.allow.iter().map(resolve).collect::<KangarooResult<Vec<_>>>()?;
            let deny = spec.deny.iter().map(resolve).collect::<KangarooResult<Vec<_>>>()?;
            compiled.push(CompiledPolicy {
                source_name: spec.source,
                source,
                allow,
                deny,
                default: spec.default,
                require_same_link: spec.require_same_link,
            });
        }
        Ok(Self {
            sets,
            policies: compiled,
        })
    }

    pub fn sets(&self) -> &AddressSets {
        &self.sets
    }

    /// Source set names in evaluation order.
    pub fn policy_names(&self) -> impl Iterator<Item = &str> {
        self.policies.iter().map(|p| p.source_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    fn in_any(&self, positions: &[usize], ip: IpAddr) -> bool {
        positions
            .iter()
            .any(|&pos| self.sets.by_position(pos).contains(ip))
    }

    /// Evaluate the table for `src` → `dst`. See the module docs for the rules.
    pub fn evaluate(&self, src: IpAddr, dst: IpAddr) -> Decision {
        for policy in &self.policies {
            if !self.sets.by_position(policy.source).contains(src) {
                continue;
            }
            debug!(policy = %policy.source_name, src = %src, dst = %dst, "checking policy");

            if self.in_any(&policy.deny, dst) {
                return Decision::Deny {
                    policy: policy.source_name.clone(),
                    reason: format!("{dst} is in a deny set"),
                };
            }

            if self.in_any(&policy.allow, dst) {
                return Decision::Allow {
                    policy: policy.source_name.clone(),
                    require_link_proof: policy.require_same_link,
                };
            }

            match policy.default {
                DefaultAction::Allow => {
                    return Decision::Allow {
                        policy: policy.source_name.clone(),
                        require_link_proof: policy.require_same_link,
                    }
                }
                DefaultAction::Deny => {
                    return Decision::Deny {
                        policy: policy.source_name.clone(),
                        reason: format!("{dst} denied by default"),
                    }
                }
                DefaultAction::Unset => {}
            }
        }
        Decision::Unmatched
    }
}

/// Free-function form of [`PolicyTable::evaluate`].
pub fn evaluate(table: &PolicyTable, src: IpAddr, dst: IpAddr) -> Decision {
    table.evaluate(src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn office_table() -> PolicyTable {
        let sets = AddressSets::compile(vec![
            ("office", vec!["10.0.0.0/24"]),
            ("blocked", vec!["1.2.3.0/24"]),
            ("intranet", vec!["10.0.1.0/24"]),
        ])
        .unwrap();
        PolicyTable::new(
            sets,
            vec![PolicySpec {
                source: "office".into(),
                allow: vec!["intranet".into()],
                deny: vec!["blocked".into()],
                default: DefaultAction::Deny,
                require_same_link: true,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_deny_set_wins() {
        let table = office_table();
        let decision = table.evaluate(ip("10.0.0.5"), ip("1.2.3.4"));
        assert!(matches!(decision, Decision::Deny { ref policy, .. } if policy == "office"));
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_allow_set_carries_link_requirement() {
        let table = office_table();
        assert_eq!(
            table.evaluate(ip("10.0.0.5"), ip("10.0.1.9")),
            Decision::Allow {
                policy: "office".into(),
                require_link_proof: true,
            }
        );
    }

    #[test]
    fn test_default_deny_applies() {
        let table = office_table();
        let decision = evaluate(&table, ip("10.0.0.5"), ip("8.8.8.8"));
        assert!(matches!(decision, Decision::Deny { ref reason, .. } if reason.contains("default")));
    }

    #[test]
    fn test_unmatched_source() {
        let table = office_table();
        let decision = table.evaluate(ip("192.168.1.1"), ip("10.0.1.9"));
        assert_eq!(decision, Decision::Unmatched);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_deny_checked_before_allow() {
        let sets = AddressSets::compile(vec![
            ("src", vec!["10.0.0.0/8"]),
            ("both", vec!["192.168.0.0/16"]),
        ])
        .unwrap();
        let table = PolicyTable::new(
            sets,
            vec![PolicySpec {
                source: "src".into(),
                allow: vec!["both".into()],
                deny: vec!["both".into()],
                ..Default::default()
            }],
        )
        .unwrap();
        assert!(matches!(
            table.evaluate(ip("10.1.1.1"), ip("192.168.1.1")),
            Decision::Deny { .. }
        ));
    }

    #[test]
    fn test_first_decisive_match_wins() {
        let sets = AddressSets::compile(vec![
            ("narrow", vec!["10.0.0.0/24"]),
            ("wide", vec!["10.0.0.0/8"]),
            ("lab", vec!["172.16.0.0/12"]),
            ("web", vec!["203.0.113.0/24"]),
        ])
        .unwrap();
        let table = PolicyTable::new(
            sets,
            vec![
                // Applies to the source but decides nothing for 203.0.113.7.
                PolicySpec {
                    source: "narrow".into(),
                    allow: vec!["lab".into()],
                    ..Default::default()
                },
                PolicySpec {
                    source: "wide".into(),
                    allow: vec!["web".into()],
                    default: DefaultAction::Deny,
                    ..Default::default()
                },
            ],
        )
        .unwrap();

        assert_eq!(
            table.evaluate(ip("10.0.0.1"), ip("203.0.113.7")),
            Decision::Allow {
                policy: "wide".into(),
                require_link_proof: false,
            }
        );
        // The first policy decides when it can.
        assert_eq!(
            table.evaluate(ip("10.0.0.1"), ip("172.16.4.4")),
            Decision::Allow {
                policy: "narrow".into(),
                require_link_proof: false,
            }
        );
    }

    #[test]
    fn test_earlier_decision_shadows_later_deny() {
        let sets = AddressSets::compile(vec![
            ("a", vec!["10.0.0.0/8"]),
            ("b", vec!["10.0.0.0/8"]),
            ("dst", vec!["8.8.8.8"]),
        ])
        .unwrap();
        let table = PolicyTable::new(
            sets,
            vec![
                PolicySpec {
                    source: "a".into(),
                    default: DefaultAction::Allow,
                    ..Default::default()
                },
                PolicySpec {
                    source: "b".into(),
                    deny: vec!["dst".into()],
                    ..Default::default()
                },
            ],
        )
        .unwrap();
        assert!(table.evaluate(ip("10.0.0.1"), ip("8.8.8.8")).is_allowed());
    }

    #[test]
    fn test_no_decision_falls_through_to_unmatched() {
        let sets = AddressSets::compile(vec![("src", vec!["10.0.0.0/8"]), ("dst", vec!["1.1.1.1"])])
            .unwrap();
        let table = PolicyTable::new(
            sets,
            vec![PolicySpec {
                source: "src".into(),
                allow: vec!["dst".into()],
                ..Default::default()
            }],
        )
        .unwrap();
        assert_eq!(table.evaluate(ip("10.0.0.1"), ip("2.2.2.2")), Decision::Unmatched);
    }

    #[test]
    fn test_default_allow_without_link_requirement() {
        let sets = AddressSets::compile(Vec::<(&str, Vec<&str>)>::new())
            .unwrap()
            .with_default_all()
            .unwrap();
        let table = PolicyTable::new(
            sets,
            vec![PolicySpec {
                source: "All".into(),
                default: DefaultAction::Allow,
                ..Default::default()
            }],
        )
        .unwrap();
        let decision = table.evaluate(ip("198.51.100.1"), ip("2001:db8::1"));
        assert!(decision.is_allowed());
        assert!(!decision.requires_link_proof());
    }

    #[test]
    fn test_unknown_set_rejected() {
        let sets = AddressSets::compile(vec![("office", vec!["10.0.0.0/24"])]).unwrap();
        let err = PolicyTable::new(
            sets,
            vec![PolicySpec {
                source: "office".into(),
                allow: vec!["missing".into()],
                ..Default::default()
            }],
        )
        .unwrap_err();
        assert!(matches!(err, KangarooError::UnknownSet { ref set, .. } if set == "missing"));
    }

    #[test]
    fn test_unknown_source_rejected() {
        let sets = AddressSets::compile(vec![("office", vec!["10.0.0.0/24"])]).unwrap();
        let err = PolicyTable::new(
            sets,
            vec![PolicySpec {
                source: "nowhere".into(),
                ..Default::default()
            }],
        )
        .unwrap_err();
        assert!(matches!(err, KangarooError::UnknownSet { .. }));
    }

    #[test]
    fn test_duplicate_policy_rejected() {
        let sets = AddressSets::compile(vec![("office", vec!["10.0.0.0/24"])]).unwrap();
        let spec = PolicySpec {
            source: "office".into(),
            ..Default::default()
        };
        let err = PolicyTable::new(sets, vec![spec.clone(), spec]).unwrap_err();
        assert!(matches!(err, KangarooError::DuplicatePolicy(_)));
    }

    #[test]
    fn test_default_action_parsing() {
        assert_eq!("Deny".parse::<DefaultAction>().unwrap(), DefaultAction::Deny);
        assert_eq!("ALLOW".parse::<DefaultAction>().unwrap(), DefaultAction::Allow);
        assert_eq!("".parse::<DefaultAction>().unwrap(), DefaultAction::Unset);
        assert!("maybe".parse::<DefaultAction>().is_err());
    }

    #[test]
    fn test_order_is_preserved() {
        let sets = AddressSets::compile(vec![("b", vec!["10.0.0.1"]), ("a", vec!["10.0.0.2"])])
            .unwrap();
        let table = PolicyTable::new(
            sets,
            vec![
                PolicySpec {
                    source: "b".into(),
                    ..Default::default()
                },
                PolicySpec {
                    source: "a".into(),
                    ..Default::default()
                },
            ],
        )
        .unwrap();
        assert_eq!(table.policy_names().collect::<Vec<_>>(), vec!["b", "a"]);
    }
}

//! Rule matcher: selects the forwarding rules that apply to a resolved own-number.
//!
//! Matching is exact string equality on `owner_phone`. No phone-format
//! normalization is attempted; the rule service and the local config are
//! expected to agree on the format.

use tracing::debug;

use crate::pipeline::types::ForwardRule;

/// How many of the matching rules a message is relayed under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Only the first matching rule in snapshot order.
    #[default]
    FirstMatch,
    /// Every matching rule. Overlapping rules share one fingerprint, so only
    /// the first dispatch can win the ledger claim anyway.
    AllMatches,
}

/// Rule matcher shared by the live path and the reconciliation scanner.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleMatcher {
    policy: MatchPolicy,
}

impl RuleMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Rules to dispatch for a message received on `resolved_phone`, per policy.
    pub fn select(&self, resolved_phone: &str, rules: &[ForwardRule]) -> Vec<ForwardRule> {
        let mut matched = match_rules(resolved_phone, rules);
        if self.policy == MatchPolicy::FirstMatch {
            matched.truncate(1);
        }

        debug!(
            resolved_phone,
            policy = ?self.policy,
            selected = matched.len(),
            "Rule selection complete"
        );
        matched
    }
}

/// Every rule whose `owner_phone` equals `resolved_phone`, in snapshot order.
///
/// An empty `resolved_phone` matches nothing, and neither does a rule with an
/// empty `owner_phone`.
pub fn match_rules(resolved_phone: &str, rules: &[ForwardRule]) -> Vec<ForwardRule> {
    if resolved_phone.is_empty() {
        return Vec::new();
    }

    rules
        .iter()
        .filter(|r| !r.owner_phone.is_empty() && r.owner_phone == resolved_phone)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, owner: &str) -> ForwardRule {
        ForwardRule {
            id: id.into(),
            owner_phone: owner.into(),
            operator_phone: "139yyyy".into(),
            email_address: "a@b.com".into(),
            remark: "r".into(),
        }
    }

    #[test]
    fn matches_exact_owner_phone() {
        let rules = vec![rule("1", "138xxxx"), rule("2", "186zzzz")];
        let matched = match_rules("138xxxx", &rules);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "1");
    }

    #[test]
    fn no_format_normalization() {
        let rules = vec![rule("1", "+86138xxxx")];
        assert!(match_rules("138xxxx", &rules).is_empty());
    }

    #[test]
    fn empty_resolved_phone_matches_nothing() {
        let rules = vec![rule("1", ""), rule("2", "138xxxx")];
        assert!(match_rules("", &rules).is_empty());
    }

    #[test]
    fn all_matches_keeps_order() {
        let rules = vec![rule("1", "138"), rule("2", "186"), rule("3", "138")];
        let ids: Vec<_> = match_rules("138", &rules).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn first_match_policy_selects_one() {
        let rules = vec![rule("1", "138"), rule("3", "138")];
        let selected = RuleMatcher::new(MatchPolicy::FirstMatch).select("138", &rules);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "1");
    }

    #[test]
    fn all_matches_policy_selects_every_rule() {
        let rules = vec![rule("1", "138"), rule("3", "138")];
        let selected = RuleMatcher::new(MatchPolicy::AllMatches).select("138", &rules);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn default_policy_is_first_match() {
        assert_eq!(RuleMatcher::default().policy(), MatchPolicy::FirstMatch);
    }
}

//! Timeout fallback policy
//!
//! When a charge point does not answer a CALL in time, the central system can
//! report a locally fabricated result instead of failing the operator
//! command. Whether that happens is decided per action by
//! `assume_success_on_timeout`; actions without a rule always surface
//! `CallTimeout`.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ocpp::Action;

/// Field refreshed with the substitution time when present in a fallback payload
const CURRENT_TIME_FIELD: &str = "currentTime";

/// Fabricated result for one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackRule {
    #[serde(default = "default_assume_success")]
    pub assume_success_on_timeout: bool,
    pub payload: Value,
}

fn default_assume_success() -> bool {
    true
}

impl FallbackRule {
    pub fn accept(payload: Value) -> Self {
        Self {
            assume_success_on_timeout: true,
            payload,
        }
    }
}

/// Per-action table of fallback results
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackPolicy {
    enabled: bool,
    rules: HashMap<String, FallbackRule>,
}

impl FallbackPolicy {
    /// Empty policy: every timeout surfaces as `CallTimeout`
    pub fn new() -> Self {
        Self {
            enabled: true,
            rules: HashMap::new(),
        }
    }

    /// Rules for the commands the control API issues
    pub fn ocpp16_defaults() -> Self {
        Self::new()
            .with_rule(
                Action::BootNotification.as_str(),
                json!({
                    "currentTime": Value::Null,
                    "interval": 10,
                    "status": "Accepted"
                }),
            )
            .with_rule(
                Action::RemoteStopTransaction.as_str(),
                json!({"status": "Accepted"}),
            )
            .with_rule(
                Action::Authorize.as_str(),
                json!({"idTagInfo": {"status": "Accepted"}}),
            )
    }

    /// Default rules, switched off as a whole
    pub fn disabled() -> Self {
        let mut policy = Self::ocpp16_defaults();
        policy.enabled = false;
        policy
    }

    pub fn with_rule(mut self, action: impl Into<String>, payload: Value) -> Self {
        self.rules.insert(action.into(), FallbackRule::accept(payload));
        self
    }

    pub fn set_rule(&mut self, action: impl Into<String>, rule: FallbackRule) {
        self.rules.insert(action.into(), rule);
    }

    /// Toggle `assume_success_on_timeout` for one action.
    ///
    /// Returns `false` if the action has no rule to toggle.
    pub fn set_assume_success(&mut self, action: &str, assume: bool) -> bool {
        match self.rules.get_mut(action) {
            Some(rule) => {
                rule.assume_success_on_timeout = assume;
                true
            }
            None => false,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn assumes_success(&self, action: &str) -> bool {
        self.enabled
            && self
                .rules
                .get(action)
                .map(|rule| rule.assume_success_on_timeout)
                .unwrap_or(false)
    }

    /// Fabricated result for a timed-out `action`, if the policy allows one
    pub fn fallback_for(&self, action: &str) -> Option<Value> {
        if !self.assumes_success(action) {
            return None;
        }

        let mut payload = self.rules.get(action)?.payload.clone();
        if let Some(fields) = payload.as_object_mut() {
            if let Some(current_time) = fields.get_mut(CURRENT_TIME_FIELD) {
                *current_time = Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
            }
        }
        Some(payload)
    }

    /// Actions that currently fabricate a result on timeout (sorted)
    pub fn actions(&self) -> Vec<&str> {
        let mut actions: Vec<&str> = self
            .rules
            .iter()
            .filter(|(action, _)| self.assumes_success(action))
            .map(|(action, _)| action.as_str())
            .collect();
        actions.sort_unstable();
        actions
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::ocpp16_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_control_commands() {
        let policy = FallbackPolicy::default();
        assert_eq!(
            policy.actions(),
            vec!["Authorize", "BootNotification", "RemoteStopTransaction"]
        );

        let boot = policy.fallback_for("BootNotification").unwrap();
        assert_eq!(boot["status"], "Accepted");
        assert_eq!(boot["interval"], 10);
        assert!(boot["currentTime"].is_string());
    }

    #[test]
    fn test_unknown_action_has_no_fallback() {
        let policy = FallbackPolicy::default();
        assert!(policy.fallback_for("Reset").is_none());
        assert!(!policy.assumes_success("Reset"));
    }

    #[test]
    fn test_per_action_toggle() {
        let mut policy = FallbackPolicy::default();
        assert!(policy.set_assume_success("Authorize", false));
        assert!(policy.fallback_for("Authorize").is_none());
        assert!(policy.fallback_for("RemoteStopTransaction").is_some());

        assert!(!policy.set_assume_success("Reset", true));
    }

    #[test]
    fn test_disabled_policy_never_fabricates() {
        let policy = FallbackPolicy::disabled();
        assert!(!policy.is_enabled());
        assert!(policy.fallback_for("BootNotification").is_none());
        assert!(policy.actions().is_empty());
    }

    #[test]
    fn test_rule_deserialization_defaults_to_assume_success() {
        let rule: FallbackRule =
            serde_json::from_value(json!({"payload": {"status": "Accepted"}})).unwrap();
        assert!(rule.assume_success_on_timeout);

        let mut policy = FallbackPolicy::new();
        policy.set_rule("Reset", rule);
        assert_eq!(policy.fallback_for("Reset"), Some(json!({"status": "Accepted"})));
    }
}

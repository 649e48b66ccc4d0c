//! Risk assessment for sensitive tool calls.
//!
//! A pure function over `(tool_name, tool_input, risk_profile)`. No I/O:
//! the same inputs always produce the same assessment, which keeps the
//! audit trail reproducible.

use courier_core::types::RiskProfile;
use serde_json::Value;

use crate::types::{RiskConfidence, RiskLevel};

/// Key-name hints for the numeric walk.
const VALUE_HINTS: &[&str] = &["amount", "value", "ton", "coins", "send"];
const GAS_HINTS: &[&str] = &["gas", "fee", "fwd_fee", "storage_fee"];

/// Arrays at least this long mark a batch operation.
const BATCH_CRITICAL_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub confidence: RiskConfidence,
    pub value_estimate: Option<f64>,
    pub gas_estimate: Option<f64>,
}

/// Assess one tool call.
pub fn assess_risk(tool_name: &str, tool_input: &Value, profile: RiskProfile) -> RiskAssessment {
    let mut level = base_level(tool_name);

    let mut walk = NumericWalk::default();
    walk.visit(tool_input, None);

    // Value thresholds only ever raise the level.
    if let Some(value) = walk.value {
        if value >= 100.0 {
            level = RiskLevel::Critical;
        } else if value >= 10.0 {
            level = level.max(RiskLevel::High);
        } else if value >= 1.0 {
            level = level.max(RiskLevel::Medium);
        }
    }

    if walk.max_batch_len >= BATCH_CRITICAL_LEN {
        level = RiskLevel::Critical;
    }

    // Profile shift is applied last: cautious users see one level more,
    // advanced users one level less, never below low.
    level = match profile {
        RiskProfile::Cautious => level.raise(),
        RiskProfile::Balanced => level,
        RiskProfile::Advanced => level.lower(),
    };

    let confidence = match (walk.value.is_some(), walk.gas.is_some()) {
        (true, true) => RiskConfidence::High,
        (true, false) | (false, true) => RiskConfidence::Medium,
        (false, false) => RiskConfidence::Low,
    };

    RiskAssessment {
        level,
        confidence,
        value_estimate: walk.value,
        gas_estimate: walk.gas,
    }
}

/// Base risk by tool class, inferred from the name.
fn base_level(tool_name: &str) -> RiskLevel {
    let name = tool_name.to_lowercase();
    if name.contains("batch") {
        return RiskLevel::Critical;
    }
    if ["send", "transfer", "swap", "burn", "mint", "write"]
        .iter()
        .any(|w| name.contains(w))
    {
        return RiskLevel::High;
    }
    if name.contains("proof") {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

#[derive(Default)]
struct NumericWalk {
    value: Option<f64>,
    gas: Option<f64>,
    max_batch_len: usize,
}

impl NumericWalk {
    /// Recursively walk `input`, classifying numeric leaves by the key
    /// they hang under. Keys containing `nano` carry base units and are
    /// scaled down by 10^9.
    fn visit(&mut self, input: &Value, key: Option<&str>) {
        match input {
            Value::Object(map) => {
                for (k, v) in map {
                    self.visit(v, Some(k));
                }
            }
            Value::Array(items) => {
                if items.len() > self.max_batch_len && items.iter().any(|i| i.is_object()) {
                    self.max_batch_len = items.len();
                }
                for item in items {
                    self.visit(item, key);
                }
            }
            other => {
                let Some(key) = key else { return };
                let Some(mut num) = as_number(other) else {
                    return;
                };
                let key_lower = key.to_lowercase();
                if key_lower.contains("nano") {
                    num /= 1e9;
                }
                if VALUE_HINTS.iter().any(|h| key_lower.contains(h)) {
                    *self.value.get_or_insert(0.0) += num;
                } else if GAS_HINTS.iter().any(|h| key_lower.contains(h)) {
                    *self.gas.get_or_insert(0.0) += num;
                }
            }
        }
    }
}

/// Numbers and numeric strings both count; tool inputs from LLMs mix them.
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn read_tool_is_low_risk() {
        let a = assess_risk("getBalance", &json!({"address": "EQabc"}), RiskProfile::Balanced);
        assert_eq!(a.level, RiskLevel::Low);
        assert_eq!(a.confidence, RiskConfidence::Low);
    }

    #[test]
    fn write_tool_is_high_risk() {
        let a = assess_risk("sendMessage", &json!({}), RiskProfile::Balanced);
        assert_eq!(a.level, RiskLevel::High);
    }

    #[test]
    fn batch_tool_is_critical() {
        let a = assess_risk("sendBatchMessages", &json!({}), RiskProfile::Balanced);
        assert_eq!(a.level, RiskLevel::Critical);
    }

    #[test]
    fn proof_tool_is_medium() {
        let a = assess_risk("buildProof", &json!({}), RiskProfile::Balanced);
        assert_eq!(a.level, RiskLevel::Medium);
    }

    #[test]
    fn value_over_100_forces_critical() {
        let a = assess_risk(
            "sendMessage",
            &json!({"amount": 150.0}),
            RiskProfile::Balanced,
        );
        assert_eq!(a.level, RiskLevel::Critical);
        assert_eq!(a.value_estimate, Some(150.0));
    }

    #[test]
    fn nano_keys_scale_down() {
        let a = assess_risk(
            "sendMessage",
            &json!({"amount_nano": 2_500_000_000u64}),
            RiskProfile::Balanced,
        );
        assert_eq!(a.value_estimate, Some(2.5));
        assert_eq!(a.level, RiskLevel::High);
    }

    #[test]
    fn numeric_strings_count() {
        let a = assess_risk(
            "sendMessage",
            &json!({"value": "12.5", "fwd_fee": "0.01"}),
            RiskProfile::Balanced,
        );
        assert_eq!(a.value_estimate, Some(12.5));
        assert_eq!(a.gas_estimate, Some(0.01));
        assert_eq!(a.confidence, RiskConfidence::High);
    }

    #[test]
    fn batch_of_five_items_is_critical() {
        let items: Vec<_> = (0..5).map(|i| json!({"to": i, "amount": 0.1})).collect();
        let a = assess_risk(
            "sendMessage",
            &json!({"messages": items}),
            RiskProfile::Balanced,
        );
        assert_eq!(a.level, RiskLevel::Critical);
    }

    #[test]
    fn cautious_raises_one_level() {
        let a = assess_risk("buildProof", &json!({}), RiskProfile::Cautious);
        assert_eq!(a.level, RiskLevel::High);
    }

    #[test]
    fn advanced_lowers_but_never_below_low() {
        let a = assess_risk("getBalance", &json!({}), RiskProfile::Advanced);
        assert_eq!(a.level, RiskLevel::Low);
        let b = assess_risk("sendMessage", &json!({}), RiskProfile::Advanced);
        assert_eq!(b.level, RiskLevel::Medium);
    }

    #[test]
    fn confidence_medium_with_only_gas() {
        let a = assess_risk("sendMessage", &json!({"gas": 0.05}), RiskProfile::Balanced);
        assert_eq!(a.confidence, RiskConfidence::Medium);
        assert_eq!(a.gas_estimate, Some(0.05));
    }
}

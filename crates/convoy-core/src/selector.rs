//! Label selectors and target device resolution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::inventory::DeviceRecord;

/// Picks target devices out of the inventory by label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<LabelExpression>,
}

impl Selector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelExpression {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Resolve a selector against the device inventory.
///
/// Every matchLabels entry must equal the device's label, and every
/// matchExpressions entry must hold. A device with absent or empty labels is
/// simply unmatched. The result is deduplicated and sorted by device id so
/// batching is deterministic.
pub fn select_devices(selector: &Selector, inventory: &[DeviceRecord]) -> Vec<String> {
    let mut matched: Vec<String> = inventory
        .iter()
        .filter(|device| matches(selector, &device.labels))
        .map(|device| device.id.clone())
        .collect();
    matched.sort();
    matched.dedup();
    matched
}

fn matches(selector: &Selector, labels: &BTreeMap<String, String>) -> bool {
    for (key, value) in &selector.match_labels {
        if labels.get(key) != Some(value) {
            return false;
        }
    }
    selector
        .match_expressions
        .iter()
        .all(|expr| expression_holds(expr, labels))
}

fn expression_holds(expr: &LabelExpression, labels: &BTreeMap<String, String>) -> bool {
    match expr.operator {
        Operator::In => labels
            .get(&expr.key)
            .is_some_and(|v| expr.values.contains(v)),
        Operator::NotIn => labels
            .get(&expr.key)
            .is_none_or(|v| !expr.values.contains(v)),
        Operator::Exists => labels.contains_key(&expr.key),
        Operator::DoesNotExist => !labels.contains_key(&expr.key),
    }
}

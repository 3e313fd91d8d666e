//! Label selectors with set-based expression matching.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Matches a set of labels by exact key/value pairs and by expressions.
///
/// An empty selector matches every label set. All match-labels and all
/// expressions must hold for the selector to match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<SelectorRequirement>,
}

/// One expression of a label selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl LabelSelector {
    /// Selector matching exactly the given label pairs.
    pub fn from_labels(pairs: &[(&str, &str)]) -> Self {
        Self {
            match_labels: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    /// Selector with a single expression.
    pub fn from_expression(key: &str, operator: SelectorOperator, values: &[&str]) -> Self {
        Self {
            match_labels: BTreeMap::new(),
            match_expressions: vec![SelectorRequirement {
                key: key.to_string(),
                operator,
                values: values.iter().map(|v| (*v).to_string()).collect(),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Whether the selector matches the given labels.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
        self.match_expressions.iter().all(|req| req.matches(labels))
    }
}

impl SelectorRequirement {
    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        match self.operator {
            SelectorOperator::In => labels
                .get(&self.key)
                .is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => labels
                .get(&self.key)
                .map_or(true, |v| !self.values.contains(v)),
            SelectorOperator::Exists => labels.contains_key(&self.key),
            SelectorOperator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

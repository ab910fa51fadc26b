//! Strategy rule tree data model
//!
//! The JSON shape matches what the strategy builder UI produces:
//!
//! ```json
//! {
//!   "id": "b1", "type": "signal",
//!   "conditionA": {"type": "indicator", "name": "RSI",
//!                  "value": {"indicatorKey": "RSI", "timeframe": "1h", "values": {"period": 14}}},
//!   "operator": "<",
//!   "conditionB": {"type": "value", "name": "30", "value": 30},
//!   "children": [],
//!   "logicOperator": "AND"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Stored strategy owned by one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub rules: StrategyRules,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Strategy fields supplied by the owner on create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStrategy {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rules: StrategyRules,
    #[serde(default)]
    pub is_public: bool,
}

/// Partial update; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rules: Option<StrategyRules>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

/// Entry and exit trees. Each side is an OR over its top-level blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyRules {
    #[serde(default)]
    pub buy: Vec<SignalBlock>,
    #[serde(default)]
    pub sell: Vec<SignalBlock>,
}

impl StrategyRules {
    /// Every indicator reference in the tree, buy side first, pre-order,
    /// conditionA before conditionB.
    pub fn indicator_refs(&self) -> Vec<(&SignalBlock, &IndicatorRef)> {
        let mut out = Vec::new();
        let mut stack: Vec<&SignalBlock> = Vec::new();
        for side in [&self.buy, &self.sell] {
            stack.extend(side.iter().rev());
            while let Some(block) = stack.pop() {
                for condition in [&block.condition_a, &block.condition_b].into_iter().flatten() {
                    if let Condition::Indicator { value, .. } = condition {
                        out.push((block, value));
                    }
                }
                stack.extend(block.children.iter().rev());
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.buy.is_empty() && self.sell.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    #[default]
    Signal,
}

/// One node of the rule tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalBlock {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: BlockKind,
    #[serde(default)]
    pub condition_a: Option<Condition>,
    pub operator: ComparisonOperator,
    #[serde(default)]
    pub condition_b: Option<Condition>,
    #[serde(default)]
    pub children: Vec<SignalBlock>,
    #[serde(default)]
    pub logic_operator: LogicOperator,
}

impl SignalBlock {
    pub fn new(
        id: impl Into<String>,
        condition_a: Condition,
        operator: ComparisonOperator,
        condition_b: Condition,
    ) -> Self {
        Self {
            id: id.into(),
            kind: BlockKind::Signal,
            condition_a: Some(condition_a),
            operator,
            condition_b: Some(condition_b),
            children: Vec::new(),
            logic_operator: LogicOperator::AND,
        }
    }

    pub fn with_logic(mut self, logic_operator: LogicOperator) -> Self {
        self.logic_operator = logic_operator;
        self
    }

    pub fn with_child(mut self, child: SignalBlock) -> Self {
        self.children.push(child);
        self
    }
}

/// Operand of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Condition {
    Indicator {
        #[serde(default)]
        name: String,
        value: IndicatorRef,
    },
    Value {
        #[serde(default)]
        name: String,
        value: f64,
    },
}

impl Condition {
    pub fn indicator(key: &str, timeframe: &str) -> Self {
        Condition::Indicator {
            name: key.to_string(),
            value: IndicatorRef::new(key, timeframe),
        }
    }

    pub fn indicator_with(indicator: IndicatorRef) -> Self {
        Condition::Indicator {
            name: indicator.indicator_key.clone(),
            value: indicator,
        }
    }

    pub fn value(value: f64) -> Self {
        Condition::Value {
            name: value.to_string(),
            value,
        }
    }
}

/// Indicator reference: key + timeframe + parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndicatorRef {
    pub indicator_key: String,
    pub timeframe: String,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl IndicatorRef {
    pub fn new(indicator_key: &str, timeframe: &str) -> Self {
        Self {
            indicator_key: indicator_key.to_string(),
            timeframe: timeframe.to_string(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    /// Numeric parameter, falling back to `default` when absent or non-numeric
    pub fn param_f64(&self, name: &str, default: f64) -> f64 {
        self.values.get(name).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn param_usize(&self, name: &str, default: usize) -> usize {
        self.values
            .get(name)
            .and_then(Value::as_f64)
            .filter(|v| *v >= 1.0)
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    /// Canonical lookup key: `KEY|timeframe|p1=v1,p2=v2`. Numeric params
    /// are normalised so `14` and `14.0` map to the same entry.
    pub fn cache_key(&self) -> String {
        let params: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| match v.as_f64() {
                Some(n) => format!("{}={}", k, n),
                None => format!("{}={}", k, v),
            })
            .collect();
        format!(
            "{}|{}|{}",
            self.indicator_key.to_ascii_uppercase(),
            self.timeframe,
            params.join(",")
        )
    }
}

impl fmt::Display for IndicatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.indicator_key, self.timeframe)
    }
}

/// Binary comparison joining conditionA and conditionB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = "=", alias = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "Crosses Above")]
    CrossesAbove,
    #[serde(rename = "Crosses Below")]
    CrossesBelow,
}

/// How a node's own comparison combines with its children
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicOperator {
    #[default]
    AND,
    OR,
}

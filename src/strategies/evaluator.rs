//! Rule tree evaluation against a market snapshot
//!
//! Evaluation is pure: it reads indicator samples from a [`MarketContext`]
//! and returns a boolean, nothing else. Nodes are walked with an explicit
//! stack so arbitrarily deep trees cannot exhaust the call stack.

use crate::common::math;
use crate::error::EvaluationError;
use crate::models::strategy::{
    ComparisonOperator, Condition, IndicatorRef, LogicOperator, SignalBlock, StrategyRules,
};
use serde::Serialize;
use std::collections::HashMap;

/// Relative tolerance for `=` and `!=`
pub const EQUALITY_TOLERANCE: f64 = 1e-9;

/// Current value of an operand plus the value one bar earlier, when known.
/// The previous value only matters for the crossing operators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatorSample {
    pub current: f64,
    pub previous: Option<f64>,
}

impl IndicatorSample {
    pub fn new(current: f64, previous: Option<f64>) -> Self {
        Self { current, previous }
    }

    /// A constant: its previous value is itself
    pub fn literal(value: f64) -> Self {
        Self {
            current: value,
            previous: Some(value),
        }
    }
}

/// Source of indicator samples for one evaluation
pub trait MarketContext {
    fn sample(&self, indicator: &IndicatorRef) -> Option<IndicatorSample>;
}

/// In-memory context keyed by the indicator's canonical lookup key
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    samples: HashMap<String, IndicatorSample>,
}

impl StaticContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, indicator: &IndicatorRef, sample: IndicatorSample) {
        self.samples.insert(indicator.cache_key(), sample);
    }

    pub fn with_value(mut self, indicator: &IndicatorRef, current: f64) -> Self {
        self.insert(indicator, IndicatorSample::new(current, None));
        self
    }

    pub fn with_history(mut self, indicator: &IndicatorRef, previous: f64, current: f64) -> Self {
        self.insert(indicator, IndicatorSample::new(current, Some(previous)));
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl MarketContext for StaticContext {
    fn sample(&self, indicator: &IndicatorRef) -> Option<IndicatorSample> {
        self.samples.get(&indicator.cache_key()).copied()
    }
}

/// Buy/sell outcome of one evaluation of both sides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SignalDecision {
    pub buy: bool,
    pub sell: bool,
}

fn resolve(
    condition: &Option<Condition>,
    block: &SignalBlock,
    ctx: &dyn MarketContext,
) -> Result<IndicatorSample, EvaluationError> {
    match condition {
        Some(Condition::Value { value, .. }) => Ok(IndicatorSample::literal(*value)),
        Some(Condition::Indicator { value, .. }) => {
            ctx.sample(value)
                .ok_or_else(|| EvaluationError::IndicatorUnavailable {
                    key: value.indicator_key.clone(),
                    timeframe: value.timeframe.clone(),
                    node: block.id.clone(),
                })
        }
        None => Err(EvaluationError::IncompleteNode {
            node: block.id.clone(),
        }),
    }
}

/// Apply `operator` to two samples
pub fn compare(operator: ComparisonOperator, a: IndicatorSample, b: IndicatorSample) -> bool {
    let (x, y) = (a.current, b.current);
    match operator {
        ComparisonOperator::GreaterThan => x > y,
        ComparisonOperator::LessThan => x < y,
        ComparisonOperator::GreaterEqual => x >= y,
        ComparisonOperator::LessEqual => x <= y,
        ComparisonOperator::Equal => math::approx_eq(x, y, EQUALITY_TOLERANCE),
        ComparisonOperator::NotEqual => !math::approx_eq(x, y, EQUALITY_TOLERANCE),
        ComparisonOperator::CrossesAbove => match (a.previous, b.previous) {
            (Some(pa), Some(pb)) => pa <= pb && x > y,
            _ => false,
        },
        ComparisonOperator::CrossesBelow => match (a.previous, b.previous) {
            (Some(pa), Some(pb)) => pa >= pb && x < y,
            _ => false,
        },
    }
}

/// The node's own comparison, conditionA resolved before conditionB
fn own_result(block: &SignalBlock, ctx: &dyn MarketContext) -> Result<bool, EvaluationError> {
    let a = resolve(&block.condition_a, block, ctx)?;
    let b = resolve(&block.condition_b, block, ctx)?;
    Ok(compare(block.operator, a, b))
}

struct Frame<'a> {
    block: &'a SignalBlock,
    own: bool,
    next_child: usize,
    decided: Option<bool>,
}

impl<'a> Frame<'a> {
    fn enter(block: &'a SignalBlock, ctx: &dyn MarketContext) -> Result<Self, EvaluationError> {
        Ok(Self {
            block,
            own: own_result(block, ctx)?,
            next_child: 0,
            decided: None,
        })
    }

    /// Fold one child result into the reduction; stops early once decided
    fn absorb(&mut self, child: bool) {
        self.next_child += 1;
        let decisive = match self.block.logic_operator {
            LogicOperator::AND => !child,
            LogicOperator::OR => child,
        };
        if decisive {
            self.decided = Some(child);
            self.next_child = self.block.children.len();
        }
    }

    fn finish(&self) -> bool {
        match self.block.logic_operator {
            LogicOperator::AND => self.own && self.decided.unwrap_or(true),
            LogicOperator::OR => self.own || self.decided.unwrap_or(false),
        }
    }
}

/// Evaluate one block and its subtree.
///
/// The node's own comparison is always computed first. Children are then
/// reduced in order with `all` (AND) or `any` (OR), short-circuiting only
/// inside that reduction.
pub fn evaluate(block: &SignalBlock, ctx: &dyn MarketContext) -> Result<bool, EvaluationError> {
    let mut stack = vec![Frame::enter(block, ctx)?];
    let mut child_result: Option<bool> = None;

    while let Some(frame) = stack.last_mut() {
        if let Some(result) = child_result.take() {
            frame.absorb(result);
        }

        let parent: &SignalBlock = frame.block;
        if let Some(child) = parent.children.get(frame.next_child) {
            stack.push(Frame::enter(child, ctx)?);
            continue;
        }

        let result = frame.finish();
        stack.pop();
        if stack.is_empty() {
            return Ok(result);
        }
        child_result = Some(result);
    }

    // unreachable for a non-empty start stack
    Ok(false)
}

/// One side of a strategy: OR over its top-level blocks, `false` when empty
pub fn evaluate_side(blocks: &[SignalBlock], ctx: &dyn MarketContext) -> Result<bool, EvaluationError> {
    for block in blocks {
        if evaluate(block, ctx)? {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn evaluate_rules(
    rules: &StrategyRules,
    ctx: &dyn MarketContext,
) -> Result<SignalDecision, EvaluationError> {
    Ok(SignalDecision {
        buy: evaluate_side(&rules.buy, ctx)?,
        sell: evaluate_side(&rules.sell, ctx)?,
    })
}

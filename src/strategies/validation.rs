//! Checks applied to rule trees before they are persisted

use crate::error::CoreError;
use crate::models::plan::PlanLimits;
use crate::models::strategy::{SignalBlock, StrategyRules};
use crate::models::user::User;
use crate::plans::PlanLimiter;
use std::collections::HashSet;

pub const MAX_RULE_DEPTH: usize = 32;
pub const MAX_RULE_NODES: usize = 1024;

/// Shape checks: bounded depth and size, complete nodes, unique ids
pub fn validate_structure(rules: &StrategyRules) -> Result<(), CoreError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut nodes = 0usize;
    let mut stack: Vec<(&SignalBlock, usize)> = Vec::new();

    for side in [&rules.buy, &rules.sell] {
        stack.extend(side.iter().rev().map(|block| (block, 1)));
        while let Some((block, depth)) = stack.pop() {
            nodes += 1;
            if nodes > MAX_RULE_NODES {
                return Err(CoreError::InvalidStrategy(format!(
                    "rule tree has more than {} nodes",
                    MAX_RULE_NODES
                )));
            }
            if depth > MAX_RULE_DEPTH {
                return Err(CoreError::InvalidStrategy(format!(
                    "node {} is nested deeper than {} levels",
                    block.id, MAX_RULE_DEPTH
                )));
            }
            if block.id.trim().is_empty() {
                return Err(CoreError::InvalidStrategy("node without an id".to_string()));
            }
            if !seen.insert(block.id.as_str()) {
                return Err(CoreError::InvalidStrategy(format!(
                    "duplicate node id {}",
                    block.id
                )));
            }
            if block.condition_a.is_none() || block.condition_b.is_none() {
                return Err(CoreError::InvalidStrategy(format!(
                    "node {} is missing a condition",
                    block.id
                )));
            }
            stack.extend(block.children.iter().rev().map(|child| (child, depth + 1)));
        }
    }
    Ok(())
}

/// First indicator timeframe outside the plan, buy side first, pre-order,
/// conditionA before conditionB.
pub fn check_timeframes(limits: &PlanLimits, rules: &StrategyRules) -> Result<(), CoreError> {
    match rules
        .indicator_refs()
        .into_iter()
        .find(|(_, indicator)| !limits.allows_timeframe(&indicator.timeframe))
    {
        Some((block, indicator)) => Err(CoreError::PlanViolation {
            timeframe: indicator.timeframe.clone(),
            node_id: block.id.clone(),
        }),
        None => Ok(()),
    }
}

pub async fn verify_strategy_rules_against_plan(
    limiter: &PlanLimiter,
    user: &User,
    rules: &StrategyRules,
) -> Result<(), CoreError> {
    let limits = limiter.resolve(user).await;
    check_timeframes(&limits, rules)
}

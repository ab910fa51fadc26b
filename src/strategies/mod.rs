//! Strategy rule evaluation and ingestion checks

pub mod evaluator;
pub mod validation;

pub use evaluator::{
    evaluate, evaluate_rules, evaluate_side, IndicatorSample, MarketContext, SignalDecision,
    StaticContext,
};
pub use validation::{
    check_timeframes, validate_structure, verify_strategy_rules_against_plan, MAX_RULE_DEPTH,
    MAX_RULE_NODES,
};

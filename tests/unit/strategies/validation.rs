//! Unit tests for rule tree ingestion checks

use cortex::error::CoreError;
use cortex::models::plan::{Plan, PlanFeatures, PlanLimits};
use cortex::models::strategy::{ComparisonOperator, Condition, SignalBlock, StrategyRules};
use cortex::strategies::{check_timeframes, validate_structure, MAX_RULE_DEPTH, MAX_RULE_NODES};

fn leaf(id: &str, timeframe: &str) -> SignalBlock {
    SignalBlock::new(
        id,
        Condition::indicator("RSI", timeframe),
        ComparisonOperator::LessThan,
        Condition::value(30.0),
    )
}

fn chain(depth: usize) -> SignalBlock {
    let mut block = leaf("n0", "1h");
    for i in 1..depth {
        block = leaf(&format!("n{}", i), "1h").with_child(block);
    }
    block
}

fn limits(timeframes: &[&str]) -> PlanLimits {
    PlanLimits::from_plan(&Plan {
        id: 1,
        name: "pro".to_string(),
        price: 29.0,
        features: PlanFeatures {
            max_backtests_per_day: Some(50),
            concurrent_bots: Some(3),
            allowed_timeframes: Some(timeframes.iter().map(|t| t.to_string()).collect()),
        },
    })
}

#[test]
fn test_depth_limit_is_inclusive() {
    let rules = StrategyRules {
        buy: vec![chain(MAX_RULE_DEPTH)],
        sell: vec![],
    };
    assert!(validate_structure(&rules).is_ok());

    let rules = StrategyRules {
        buy: vec![chain(MAX_RULE_DEPTH + 1)],
        sell: vec![],
    };
    assert!(matches!(
        validate_structure(&rules),
        Err(CoreError::InvalidStrategy(_))
    ));
}

#[test]
fn test_node_limit_counts_both_sides() {
    let half = MAX_RULE_NODES / 2;
    let rules = StrategyRules {
        buy: (0..half).map(|i| leaf(&format!("b{}", i), "1h")).collect(),
        sell: (0..half).map(|i| leaf(&format!("s{}", i), "1h")).collect(),
    };
    assert!(validate_structure(&rules).is_ok());

    let mut rules = rules;
    rules.sell.push(leaf("extra", "1h"));
    assert!(matches!(
        validate_structure(&rules),
        Err(CoreError::InvalidStrategy(msg)) if msg.contains("nodes")
    ));
}

#[test]
fn test_duplicate_ids_are_rejected() {
    let rules = StrategyRules {
        buy: vec![leaf("same", "1h")],
        sell: vec![leaf("same", "1h")],
    };
    assert!(validate_structure(&rules).is_err());
}

#[test]
fn test_missing_condition_is_rejected() {
    let mut block = leaf("b1", "1h");
    block.condition_a = None;
    let rules = StrategyRules {
        buy: vec![block],
        sell: vec![],
    };
    assert!(validate_structure(&rules).is_err());
}

#[test]
fn test_empty_rules_are_valid() {
    assert!(validate_structure(&StrategyRules::default()).is_ok());
}

#[test]
fn test_disallowed_timeframe_names_first_offending_node() {
    let rules = StrategyRules {
        buy: vec![leaf("b1", "1h").with_child(leaf("b2", "4h"))],
        sell: vec![leaf("s1", "15m")],
    };
    match check_timeframes(&limits(&["1h"]), &rules) {
        Err(CoreError::PlanViolation { timeframe, node_id }) => {
            assert_eq!(timeframe, "4h");
            assert_eq!(node_id, "b2");
        }
        other => panic!("expected PlanViolation, got {:?}", other),
    }

    assert!(check_timeframes(&limits(&["1h", "4h", "15m"]), &rules).is_ok());
}

#[test]
fn test_condition_b_timeframes_are_checked() {
    let block = SignalBlock::new(
        "b1",
        Condition::indicator("EMA", "1h"),
        ComparisonOperator::CrossesAbove,
        Condition::indicator("EMA", "1d"),
    );
    let rules = StrategyRules {
        buy: vec![block],
        sell: vec![],
    };
    assert!(matches!(
        check_timeframes(&limits(&["1h"]), &rules),
        Err(CoreError::PlanViolation { timeframe, .. }) if timeframe == "1d"
    ));
}

#[test]
fn test_fallback_limits_allow_only_hourly() {
    let fallback = PlanLimits::fallback();
    assert!(fallback.allows_timeframe("1h"));
    assert!(!fallback.allows_timeframe("4h"));
    assert_eq!(fallback.max_backtests_per_day, 5);
    assert_eq!(fallback.concurrent_bot_limit, 0);
}

#[test]
fn test_plan_without_feature_keys_uses_defaults() {
    let limits = PlanLimits::from_plan(&Plan {
        id: 7,
        name: "starter".to_string(),
        price: 0.0,
        features: PlanFeatures::default(),
    });
    assert_eq!(limits.plan_name, "starter");
    assert_eq!(limits, PlanLimits {
        plan_name: "starter".to_string(),
        ..PlanLimits::fallback()
    });
}

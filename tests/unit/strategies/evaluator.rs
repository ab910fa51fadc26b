//! Unit tests for rule tree evaluation

use cortex::error::EvaluationError;
use cortex::models::strategy::{
    ComparisonOperator, Condition, IndicatorRef, LogicOperator, SignalBlock, StrategyRules,
};
use cortex::strategies::{evaluate, evaluate_rules, evaluate_side, StaticContext};

fn rsi() -> IndicatorRef {
    IndicatorRef::new("RSI", "1h").with_param("period", 14)
}

/// Block whose own comparison is a constant `true` or `false`
fn constant(id: &str, result: bool) -> SignalBlock {
    let rhs = if result { 0.0 } else { 2.0 };
    SignalBlock::new(
        id,
        Condition::value(1.0),
        ComparisonOperator::GreaterThan,
        Condition::value(rhs),
    )
}

fn rsi_below(id: &str, level: f64) -> SignalBlock {
    SignalBlock::new(
        id,
        Condition::indicator_with(rsi()),
        ComparisonOperator::LessThan,
        Condition::value(level),
    )
}

#[test]
fn test_leaf_compares_indicator_with_value() {
    let block = rsi_below("b1", 30.0);
    let oversold = StaticContext::new().with_value(&rsi(), 25.0);
    let neutral = StaticContext::new().with_value(&rsi(), 55.0);

    assert!(evaluate(&block, &oversold).unwrap());
    assert!(!evaluate(&block, &neutral).unwrap());
}

#[test]
fn test_and_requires_own_result_and_all_children() {
    let ctx = StaticContext::new();
    let block = constant("root", true)
        .with_logic(LogicOperator::AND)
        .with_child(constant("c1", true))
        .with_child(constant("c2", false));
    assert!(!evaluate(&block, &ctx).unwrap());

    let block = constant("root", false)
        .with_logic(LogicOperator::AND)
        .with_child(constant("c1", true));
    assert!(!evaluate(&block, &ctx).unwrap());

    let block = constant("root", true)
        .with_logic(LogicOperator::AND)
        .with_child(constant("c1", true))
        .with_child(constant("c2", true));
    assert!(evaluate(&block, &ctx).unwrap());
}

#[test]
fn test_or_accepts_own_result_or_any_child() {
    let ctx = StaticContext::new();
    let block = constant("root", false)
        .with_logic(LogicOperator::OR)
        .with_child(constant("c1", false))
        .with_child(constant("c2", true));
    assert!(evaluate(&block, &ctx).unwrap());

    let block = constant("root", true)
        .with_logic(LogicOperator::OR)
        .with_child(constant("c1", false));
    assert!(evaluate(&block, &ctx).unwrap());

    let block = constant("root", false)
        .with_logic(LogicOperator::OR)
        .with_child(constant("c1", false));
    assert!(!evaluate(&block, &ctx).unwrap());
}

#[test]
fn test_leaf_result_ignores_logic_operator() {
    let ctx = StaticContext::new();
    for logic in [LogicOperator::AND, LogicOperator::OR] {
        assert!(evaluate(&constant("leaf", true).with_logic(logic), &ctx).unwrap());
        assert!(!evaluate(&constant("leaf", false).with_logic(logic), &ctx).unwrap());
    }
}

#[test]
fn test_own_comparison_is_evaluated_even_when_children_decide() {
    // the root's operand is missing; an OR child that is true must not hide it
    let block = rsi_below("root", 30.0)
        .with_logic(LogicOperator::OR)
        .with_child(constant("c1", true));
    let err = evaluate(&block, &StaticContext::new()).unwrap_err();
    assert_eq!(
        err,
        EvaluationError::IndicatorUnavailable {
            key: "RSI".to_string(),
            timeframe: "1h".to_string(),
            node: "root".to_string(),
        }
    );
}

#[test]
fn test_children_short_circuit_within_reduction() {
    // c2 references a missing indicator but is never reached after c1 fails
    let block = constant("root", true)
        .with_logic(LogicOperator::AND)
        .with_child(constant("c1", false))
        .with_child(rsi_below("c2", 30.0));
    assert!(!evaluate(&block, &StaticContext::new()).unwrap());

    let block = constant("root", false)
        .with_logic(LogicOperator::OR)
        .with_child(constant("c1", true))
        .with_child(rsi_below("c2", 30.0));
    assert!(evaluate(&block, &StaticContext::new()).unwrap());
}

#[test]
fn test_missing_indicator_reports_the_node() {
    let block = constant("root", true).with_child(rsi_below("deep", 30.0));
    match evaluate(&block, &StaticContext::new()) {
        Err(EvaluationError::IndicatorUnavailable { node, .. }) => assert_eq!(node, "deep"),
        other => panic!("expected IndicatorUnavailable, got {:?}", other),
    }
}

#[test]
fn test_incomplete_node_is_an_error() {
    let mut block = constant("broken", true);
    block.condition_b = None;
    assert_eq!(
        evaluate(&block, &StaticContext::new()),
        Err(EvaluationError::IncompleteNode {
            node: "broken".to_string()
        })
    );
}

#[test]
fn test_equality_uses_relative_tolerance() {
    let price = IndicatorRef::new("CLOSE", "1h");
    let block = SignalBlock::new(
        "eq",
        Condition::indicator_with(price.clone()),
        ComparisonOperator::Equal,
        Condition::value(100_000.0),
    );
    let close = StaticContext::new().with_value(&price, 100_000.0 + 1e-6);
    let far = StaticContext::new().with_value(&price, 100_000.5);
    assert!(evaluate(&block, &close).unwrap());
    assert!(!evaluate(&block, &far).unwrap());

    let block = SignalBlock::new(
        "ne",
        Condition::indicator_with(price.clone()),
        ComparisonOperator::NotEqual,
        Condition::value(100_000.0),
    );
    assert!(!evaluate(&block, &close).unwrap());
    assert!(evaluate(&block, &far).unwrap());
}

#[test]
fn test_crosses_above_needs_previous_bar() {
    let fast = IndicatorRef::new("EMA", "1h").with_param("period", 12);
    let slow = IndicatorRef::new("EMA", "1h").with_param("period", 26);
    let block = SignalBlock::new(
        "cross",
        Condition::indicator_with(fast.clone()),
        ComparisonOperator::CrossesAbove,
        Condition::indicator_with(slow.clone()),
    );

    let crossed = StaticContext::new()
        .with_history(&fast, 99.0, 101.0)
        .with_history(&slow, 100.0, 100.0);
    assert!(evaluate(&block, &crossed).unwrap());

    let touching_then_above = StaticContext::new()
        .with_history(&fast, 100.0, 101.0)
        .with_history(&slow, 100.0, 100.0);
    assert!(evaluate(&block, &touching_then_above).unwrap());

    let already_above = StaticContext::new()
        .with_history(&fast, 101.0, 102.0)
        .with_history(&slow, 100.0, 100.0);
    assert!(!evaluate(&block, &already_above).unwrap());

    let no_history = StaticContext::new()
        .with_value(&fast, 101.0)
        .with_history(&slow, 100.0, 100.0);
    assert!(!evaluate(&block, &no_history).unwrap());
}

#[test]
fn test_crosses_below_against_constant() {
    let price = IndicatorRef::new("CLOSE", "1h");
    let block = SignalBlock::new(
        "dip",
        Condition::indicator_with(price.clone()),
        ComparisonOperator::CrossesBelow,
        Condition::value(50.0),
    );
    let ctx = StaticContext::new().with_history(&price, 51.0, 49.0);
    assert!(evaluate(&block, &ctx).unwrap());

    let ctx = StaticContext::new().with_history(&price, 49.0, 48.0);
    assert!(!evaluate(&block, &ctx).unwrap());
}

#[test]
fn test_empty_side_is_false() {
    let rules = StrategyRules::default();
    let decision = evaluate_rules(&rules, &StaticContext::new()).unwrap();
    assert!(!decision.buy);
    assert!(!decision.sell);
    assert!(!evaluate_side(&[], &StaticContext::new()).unwrap());
}

#[test]
fn test_side_is_or_over_top_level_blocks() {
    let rules = StrategyRules {
        buy: vec![constant("b1", false), constant("b2", true)],
        sell: vec![constant("s1", false)],
    };
    let decision = evaluate_rules(&rules, &StaticContext::new()).unwrap();
    assert!(decision.buy);
    assert!(!decision.sell);
}

#[test]
fn test_evaluation_is_repeatable() {
    let block = rsi_below("b1", 30.0)
        .with_logic(LogicOperator::OR)
        .with_child(constant("c1", false));
    let ctx = StaticContext::new().with_value(&rsi(), 20.0);
    let first = evaluate(&block, &ctx).unwrap();
    for _ in 0..10 {
        assert_eq!(evaluate(&block, &ctx).unwrap(), first);
    }
    assert_eq!(ctx.len(), 1);
}

#[test]
fn test_deep_tree_does_not_overflow() {
    let mut block = constant("n0", true);
    for depth in 1..1_000 {
        block = constant(&format!("n{}", depth), true).with_child(block);
    }
    assert!(evaluate(&block, &StaticContext::new()).unwrap());
}

#[test]
fn test_parameters_distinguish_indicators() {
    let rsi14 = IndicatorRef::new("RSI", "1h").with_param("period", 14);
    let rsi14_float = IndicatorRef::new("rsi", "1h").with_param("period", 14.0);
    let rsi7 = IndicatorRef::new("RSI", "1h").with_param("period", 7);

    assert_eq!(rsi14.cache_key(), rsi14_float.cache_key());
    assert_ne!(rsi14.cache_key(), rsi7.cache_key());
}

#[test]
fn test_rule_tree_json_shape() {
    let json = serde_json::json!({
        "id": "b1",
        "type": "signal",
        "conditionA": {
            "type": "indicator",
            "name": "RSI",
            "value": {"indicatorKey": "RSI", "timeframe": "1h", "values": {"period": 14}}
        },
        "operator": "<",
        "conditionB": {"type": "value", "name": "30", "value": 30},
        "children": [{
            "id": "b2",
            "conditionA": {"type": "value", "value": 1},
            "operator": "Crosses Above",
            "conditionB": {"type": "value", "value": 0}
        }],
        "logicOperator": "OR"
    });
    let block: SignalBlock = serde_json::from_value(json).unwrap();
    assert_eq!(block.operator, ComparisonOperator::LessThan);
    assert_eq!(block.logic_operator, LogicOperator::OR);
    assert_eq!(block.children.len(), 1);
    assert_eq!(block.children[0].operator, ComparisonOperator::CrossesAbove);
    assert_eq!(block.children[0].logic_operator, LogicOperator::AND);

    let ctx = StaticContext::new().with_value(&rsi(), 20.0);
    assert!(evaluate(&block, &ctx).unwrap());
}

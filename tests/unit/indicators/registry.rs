//! Unit tests for indicator math and the registry

use chrono::{Duration, TimeZone, Utc};
use cortex::common::math;
use cortex::indicators::momentum::calculate_rsi;
use cortex::indicators::trend::{calculate_ema, calculate_sma};
use cortex::indicators::volatility::calculate_atr;
use cortex::indicators::{compute, IndicatorKind};
use cortex::models::indicators::Candle;
use cortex::models::strategy::IndicatorRef;

fn candles(closes: &[f64]) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| {
            Candle::new(
                *close,
                close + 1.0,
                close - 1.0,
                *close,
                1_000.0,
                start + Duration::hours(i as i64),
            )
        })
        .collect()
}

#[test]
fn test_sma_uses_trailing_window() {
    assert_eq!(math::sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
    assert_eq!(math::sma(&[1.0], 2), None);
    assert_eq!(math::sma(&[1.0, 2.0], 0), None);
}

#[test]
fn test_ema_of_constant_series_is_constant() {
    let values = vec![10.0; 30];
    let ema = math::ema(&values, 12).unwrap();
    assert!((ema - 10.0).abs() < 1e-12);
}

#[test]
fn test_ema_tracks_rising_series_below_last_value() {
    let values: Vec<f64> = (1..=50).map(f64::from).collect();
    let ema = math::ema(&values, 10).unwrap();
    assert!(ema < 50.0 && ema > 40.0);
}

#[test]
fn test_approx_eq_is_relative() {
    assert!(math::approx_eq(1e9, 1e9 + 0.5, 1e-9));
    assert!(!math::approx_eq(1.0, 1.001, 1e-9));
    assert!(math::approx_eq(0.0, 1e-10, 1e-9));
}

#[test]
fn test_rsi_bounds() {
    let rising = candles(&(0..20).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
    assert_eq!(calculate_rsi(&rising, 14).unwrap().value, 100.0);

    let falling = candles(&(0..20).map(|i| 100.0 - i as f64).collect::<Vec<_>>());
    assert_eq!(calculate_rsi(&falling, 14).unwrap().value, 0.0);

    let flat = candles(&[100.0; 20]);
    assert_eq!(calculate_rsi(&flat, 14).unwrap().value, 50.0);

    assert!(calculate_rsi(&flat[..14], 14).is_none());
}

#[test]
fn test_moving_averages_need_full_period() {
    let series = candles(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    assert!(calculate_sma(&series, 6).is_none());
    assert_eq!(calculate_sma(&series, 5).unwrap().value, 3.0);
    assert!(calculate_ema(&series, 5).is_some());
}

#[test]
fn test_atr_of_constant_range() {
    let series = candles(&[100.0; 20]);
    let atr = calculate_atr(&series, 14).unwrap();
    assert!((atr.value - 2.0).abs() < 1e-12);
}

#[test]
fn test_indicator_keys_parse_case_insensitively() {
    assert_eq!("rsi".parse::<IndicatorKind>(), Ok(IndicatorKind::Rsi));
    assert_eq!("Close".parse::<IndicatorKind>(), Ok(IndicatorKind::Close));
    assert_eq!("BOLLINGER".parse::<IndicatorKind>(), Ok(IndicatorKind::Bollinger));
    assert!("VWAP".parse::<IndicatorKind>().is_err());
}

#[test]
fn test_compute_reads_parameters() {
    let series = candles(&(0..40).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
    let sma5 = IndicatorRef::new("SMA", "1h").with_param("period", 5);
    assert_eq!(compute(IndicatorKind::Sma, &sma5, &series), Some(137.0));

    let close = IndicatorRef::new("CLOSE", "1h");
    assert_eq!(compute(IndicatorKind::Close, &close, &series), Some(139.0));

    let upper = IndicatorRef::new("BB", "1h")
        .with_param("period", 20)
        .with_param("band", "upper");
    let lower = IndicatorRef::new("BB", "1h")
        .with_param("period", 20)
        .with_param("band", "lower");
    let hi = compute(IndicatorKind::Bollinger, &upper, &series).unwrap();
    let lo = compute(IndicatorKind::Bollinger, &lower, &series).unwrap();
    assert!(hi > lo);

    assert_eq!(compute(IndicatorKind::Close, &close, &[]), None);
}

#[test]
fn test_warmup_follows_parameters() {
    let rsi = IndicatorRef::new("RSI", "1h").with_param("period", 7);
    assert_eq!(IndicatorKind::Rsi.warmup(&rsi), 8);
    let macd = IndicatorRef::new("MACD", "1h");
    assert_eq!(IndicatorKind::Macd.warmup(&macd), 35);
    assert_eq!(IndicatorKind::Close.warmup(&macd), 1);
}

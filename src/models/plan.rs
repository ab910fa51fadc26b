//! Subscription plans and the quota values derived from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const BASIC_PLAN_NAME: &str = "basic";
pub const DEFAULT_ALLOWED_TIMEFRAME: &str = "1h";
pub const DEFAULT_MAX_BACKTESTS_PER_DAY: u32 = 5;
pub const DEFAULT_CONCURRENT_BOTS: u32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub price: f64,
    pub features: PlanFeatures,
}

/// Feature map as persisted; any key may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanFeatures {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backtests_per_day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_bots: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_timeframes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SubscriptionStatus::Active),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "past_due" => Some(SubscriptionStatus::PastDue),
            _ => None,
        }
    }
}

/// A user's subscription; at most one per user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: i64,
    pub plan_id: i64,
    pub status: SubscriptionStatus,
    pub current_period_end: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.current_period_end > now
    }
}

/// Resolved quota values for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub plan_name: String,
    pub allowed_timeframes: BTreeSet<String>,
    pub max_backtests_per_day: u32,
    pub concurrent_bot_limit: u32,
}

impl PlanLimits {
    /// Most restrictive policy, used when nothing is persisted
    pub fn fallback() -> Self {
        Self {
            plan_name: BASIC_PLAN_NAME.to_string(),
            allowed_timeframes: BTreeSet::from([DEFAULT_ALLOWED_TIMEFRAME.to_string()]),
            max_backtests_per_day: DEFAULT_MAX_BACKTESTS_PER_DAY,
            concurrent_bot_limit: DEFAULT_CONCURRENT_BOTS,
        }
    }

    pub fn from_plan(plan: &Plan) -> Self {
        let fallback = Self::fallback();
        Self {
            plan_name: plan.name.clone(),
            allowed_timeframes: plan
                .features
                .allowed_timeframes
                .clone()
                .map(|tfs| tfs.into_iter().collect())
                .unwrap_or(fallback.allowed_timeframes),
            max_backtests_per_day: plan
                .features
                .max_backtests_per_day
                .unwrap_or(fallback.max_backtests_per_day),
            concurrent_bot_limit: plan
                .features
                .concurrent_bots
                .unwrap_or(fallback.concurrent_bot_limit),
        }
    }

    pub fn allows_timeframe(&self, timeframe: &str) -> bool {
        self.allowed_timeframes.contains(timeframe)
    }
}

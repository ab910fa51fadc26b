//! Resolves a user's subscription into quota values.
//!
//! Resolution never fails: each missing or unreadable link in the chain
//! (active subscription, its plan, the persisted basic plan) degrades to
//! the next one, ending at the hard-coded basic defaults.

use crate::db::{PlanRepository, Store};
use crate::models::plan::{Plan, PlanLimits, BASIC_PLAN_NAME};
use crate::models::user::User;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PlanLimiter {
    plans: Arc<dyn Store>,
}

impl PlanLimiter {
    pub fn new(plans: Arc<dyn Store>) -> Self {
        Self { plans }
    }

    pub async fn resolve(&self, user: &User) -> PlanLimits {
        if let Some(plan) = self.subscribed_plan(user).await {
            debug!(user_id = user.id, plan = %plan.name, "PlanLimiter: using subscribed plan");
            return PlanLimits::from_plan(&plan);
        }

        match self.plans.plan_by_name(BASIC_PLAN_NAME).await {
            Ok(Some(plan)) => PlanLimits::from_plan(&plan),
            Ok(None) => PlanLimits::fallback(),
            Err(e) => {
                warn!(user_id = user.id, error = %e, "PlanLimiter: basic plan lookup failed, using defaults");
                PlanLimits::fallback()
            }
        }
    }

    async fn subscribed_plan(&self, user: &User) -> Option<Plan> {
        let subscription = match self.plans.subscription_for_user(user.id).await {
            Ok(subscription) => subscription?,
            Err(e) => {
                warn!(user_id = user.id, error = %e, "PlanLimiter: subscription lookup failed");
                return None;
            }
        };

        if !subscription.is_active_at(Utc::now()) {
            return None;
        }

        match self.plans.plan_by_id(subscription.plan_id).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(
                    user_id = user.id,
                    plan_id = subscription.plan_id,
                    error = %e,
                    "PlanLimiter: plan lookup failed"
                );
                None
            }
        }
    }
}

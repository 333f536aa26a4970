use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use tracing::{debug, warn};

use stepwise_core::config::{BudgetConfig, BudgetPeriodKind};
use stepwise_core::error::Result;
use stepwise_core::traits::StateStore;
use stepwise_core::types::RunEvent;

/// Outcome of a pre-dispatch budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Allow,
    Deny { used: u64, limit: u64 },
}

/// Accounting period key for `now`.
pub fn period_key(kind: BudgetPeriodKind, now: DateTime<Local>) -> String {
    match kind {
        BudgetPeriodKind::Daily => now.format("%Y-%m-%d").to_string(),
        BudgetPeriodKind::Monthly => now.format("%Y-%m").to_string(),
        BudgetPeriodKind::Lifetime => "lifetime".to_string(),
    }
}

/// Enforces the per-period consumption ceiling.
///
/// Nothing is reserved up front: a dispatch is denied once recorded usage
/// has reached the limit, so the final call of a period may overshoot it.
pub struct BudgetGuard {
    store: Arc<dyn StateStore>,
    period_key: String,
    limit_units: u64,
    warn_pct: u8,
    warned: AtomicBool,
}

impl BudgetGuard {
    /// `limit_units == 0` means unlimited.
    pub fn new(
        store: Arc<dyn StateStore>,
        period_key: impl Into<String>,
        limit_units: u64,
        warn_pct: u8,
    ) -> Self {
        Self {
            store,
            period_key: period_key.into(),
            limit_units,
            warn_pct,
            warned: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        store: Arc<dyn StateStore>,
        config: &BudgetConfig,
        period_key: impl Into<String>,
    ) -> Self {
        Self::new(store, period_key, config.limit_units, config.warn_pct)
    }

    pub fn period_key(&self) -> &str {
        &self.period_key
    }

    pub fn limit_units(&self) -> u64 {
        self.limit_units
    }

    /// Units recorded so far in this period.
    pub async fn used(&self) -> Result<u64> {
        self.store.current_period_usage(&self.period_key).await
    }

    /// Decide whether a call estimated at `estimated_units` may start.
    pub async fn check_and_reserve(&self, estimated_units: u64) -> Result<BudgetDecision> {
        if self.limit_units == 0 {
            return Ok(BudgetDecision::Allow);
        }
        let used = self.used().await?;
        if used >= self.limit_units {
            warn!(
                used,
                limit = self.limit_units,
                period = %self.period_key,
                "Budget exhausted, denying dispatch"
            );
            return Ok(BudgetDecision::Deny {
                used,
                limit: self.limit_units,
            });
        }
        debug!(used, estimated_units, limit = self.limit_units, "Budget check passed");
        Ok(BudgetDecision::Allow)
    }

    /// Add actual consumption to the period. Returns the new total.
    pub async fn record(&self, units: u64) -> Result<u64> {
        self.store.add_period_usage(&self.period_key, units).await
    }

    /// A `BudgetWarning` the first time `used` crosses the warning threshold.
    pub fn take_warning(&self, used: u64) -> Option<RunEvent> {
        if self.limit_units == 0 || self.warn_pct == 0 {
            return None;
        }
        let threshold = self.limit_units.saturating_mul(self.warn_pct as u64) / 100;
        if used < threshold || self.warned.swap(true, Ordering::SeqCst) {
            return None;
        }
        warn!(
            used,
            limit = self.limit_units,
            period = %self.period_key,
            "Budget warning threshold crossed"
        );
        Some(RunEvent::BudgetWarning {
            used_units: used,
            limit_units: self.limit_units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stepwise_store::SqliteStore;

    fn guard(limit: u64) -> BudgetGuard {
        BudgetGuard::new(Arc::new(SqliteStore::in_memory().unwrap()), "p", limit, 80)
    }

    #[test]
    fn period_keys() {
        let now = Local.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(period_key(BudgetPeriodKind::Daily, now), "2026-03-07");
        assert_eq!(period_key(BudgetPeriodKind::Monthly, now), "2026-03");
        assert_eq!(period_key(BudgetPeriodKind::Lifetime, now), "lifetime");
    }

    #[tokio::test]
    async fn zero_limit_is_unlimited() {
        let g = guard(0);
        g.record(1_000_000).await.unwrap();
        assert_eq!(g.check_and_reserve(10).await.unwrap(), BudgetDecision::Allow);
        assert!(g.take_warning(1_000_000).is_none());
    }

    #[tokio::test]
    async fn denies_once_limit_reached() {
        let g = guard(10);
        assert_eq!(g.check_and_reserve(5).await.unwrap(), BudgetDecision::Allow);
        g.record(9).await.unwrap();
        assert_eq!(g.check_and_reserve(5).await.unwrap(), BudgetDecision::Allow);
        assert_eq!(g.record(3).await.unwrap(), 12);
        assert_eq!(
            g.check_and_reserve(1).await.unwrap(),
            BudgetDecision::Deny { used: 12, limit: 10 }
        );
    }

    #[tokio::test]
    async fn usage_never_decreases() {
        let g = guard(100);
        let mut last = 0;
        for units in [0, 3, 0, 7, 1] {
            let total = g.record(units).await.unwrap();
            assert!(total >= last);
            last = total;
        }
        assert_eq!(g.used().await.unwrap(), 11);
    }

    #[test]
    fn warning_fires_once() {
        let g = guard(100);
        assert!(g.take_warning(79).is_none());
        assert!(matches!(
            g.take_warning(80),
            Some(RunEvent::BudgetWarning { used_units: 80, limit_units: 100 })
        ));
        assert!(g.take_warning(95).is_none());
    }
}

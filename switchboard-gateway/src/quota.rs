//! Usage quota tracking and fallback policy.
//!
//! One counter per `(provider, tier)`. [`QuotaTracker::check`] is the only
//! thing that increments a counter, and it never lets a limited counter go
//! past its limit: at the limit the request is either redirected to the
//! tier's fallback model (count unchanged) or denied.
//!
//! Token totals arrive separately as [`UsageEvent`]s from the adapter and
//! never affect the request count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::UsageEvent;
use crate::error::QuotaSource;
use crate::registry::{FallbackPolicy, ProviderConfig, ProviderRemovalHook, ResetPolicy, TierLimit};
use crate::types::Tier;
use crate::{Error, Result};

/// Consumption for one provider tier within the current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub provider_id: String,
    pub tier: Tier,
    pub window_start: DateTime<Utc>,
    pub count: u32,
    /// `None` when the tier has no configured limit.
    pub limit: Option<u32>,
    pub reset_policy: ResetPolicy,
    #[serde(default)]
    pub tokens_used: u64,
}

impl QuotaCounter {
    fn new(provider_id: &str, tier: Tier, now: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            tier,
            window_start: now,
            count: 0,
            limit: None,
            reset_policy: ResetPolicy::None,
            tokens_used: 0,
        }
    }

    /// When the current window ends, if it ever does.
    pub fn window_end(&self) -> Option<DateTime<Utc>> {
        match self.reset_policy {
            ResetPolicy::Rolling24h => Some(self.window_start + Duration::hours(24)),
            ResetPolicy::CalendarDay => next_local_midnight(self.window_start),
            ResetPolicy::None => None,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if self.window_end().is_some_and(|end| now >= end) {
            debug!(
                provider_id = %self.provider_id,
                tier = %self.tier,
                previous = self.count,
                "quota window reset"
            );
            self.window_start = now;
            self.count = 0;
            self.tokens_used = 0;
        }
    }
}

fn next_local_midnight(from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tomorrow = from.with_timezone(&Local).date_naive().succ_opt()?;
    let midnight = tomorrow.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Outcome of a quota check.
#[derive(Debug)]
pub enum QuotaDecision {
    /// Go ahead with `model_id`. If it differs from the requested model,
    /// `substituted_from` names the original.
    Allowed {
        model_id: String,
        substituted_from: Option<String>,
    },
    /// The limit is reached and no fallback applies.
    Denied(Error),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
struct ProviderLimits {
    tiers: Vec<TierLimit>,
    fallback_policy: FallbackPolicy,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Per-provider, per-tier quota state machine.
pub struct QuotaTracker {
    limits: RwLock<HashMap<String, ProviderLimits>>,
    counters: Mutex<HashMap<(String, Tier), QuotaCounter>>,
    clock: Clock,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self {
            limits: RwLock::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Load or replace the limits of a provider.
    pub fn configure(&self, config: &ProviderConfig) {
        self.limits.write().unwrap_or_else(|e| e.into_inner()).insert(
            config.id.clone(),
            ProviderLimits {
                tiers: config.tier_limits.clone(),
                fallback_policy: config.fallback_policy,
            },
        );
    }

    /// Count one request against the tier and decide which model serves it.
    pub fn check(&self, provider_id: &str, tier: Tier, model_id: &str) -> QuotaDecision {
        let now = (self.clock)();
        let (limit, fallback_policy) = {
            let limits = self.limits.read().unwrap_or_else(|e| e.into_inner());
            match limits.get(provider_id) {
                Some(p) => (
                    p.tiers.iter().find(|l| l.tier == tier).cloned(),
                    p.fallback_policy,
                ),
                None => (None, FallbackPolicy::Disabled),
            }
        };

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters
            .entry((provider_id.to_string(), tier))
            .or_insert_with(|| QuotaCounter::new(provider_id, tier, now));
        counter.limit = limit.as_ref().map(|l| l.limit);
        counter.reset_policy = limit
            .as_ref()
            .map(|l| l.window_policy)
            .unwrap_or(ResetPolicy::None);
        counter.roll(now);

        let Some(limit) = limit else {
            counter.count = counter.count.saturating_add(1);
            return allowed(model_id);
        };

        if counter.count < limit.limit {
            counter.count += 1;
            return allowed(model_id);
        }

        match (fallback_policy, limit.fallback_model_id) {
            (FallbackPolicy::Automatic, Some(fallback)) if fallback == model_id => {
                allowed(model_id)
            }
            (FallbackPolicy::Automatic, Some(fallback)) => {
                info!(
                    provider_id,
                    tier = %tier,
                    model = model_id,
                    fallback = %fallback,
                    "quota limit reached, substituting fallback model"
                );
                QuotaDecision::Allowed {
                    model_id: fallback,
                    substituted_from: Some(model_id.to_string()),
                }
            }
            _ => {
                let retry_after_secs = counter
                    .window_end()
                    .map(|end| (end - now).num_seconds().max(0) as u64);
                warn!(provider_id, tier = %tier, limit = limit.limit, "quota exceeded");
                QuotaDecision::Denied(Error::QuotaExceeded {
                    provider_id: provider_id.to_string(),
                    tier: Some(tier),
                    origin: QuotaSource::Local,
                    retry_after_secs,
                })
            }
        }
    }

    /// Add reported tokens to the tier's counter.
    pub fn record_usage(&self, event: &UsageEvent) {
        let now = (self.clock)();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let counter = counters
            .entry((event.provider_id.clone(), event.tier))
            .or_insert_with(|| QuotaCounter::new(&event.provider_id, event.tier, now));
        counter.tokens_used = counter.tokens_used.saturating_add(event.usage.total());
    }

    /// Counters for one provider.
    pub fn usage(&self, provider_id: &str) -> Vec<QuotaCounter> {
        self.counters()
            .into_iter()
            .filter(|c| c.provider_id == provider_id)
            .collect()
    }

    /// Every counter, ordered by provider then tier.
    pub fn counters(&self) -> Vec<QuotaCounter> {
        let mut all: Vec<_> = self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| (&a.provider_id, a.tier).cmp(&(&b.provider_id, b.tier)));
        all
    }

    /// Restore counters loaded from disk. Expired windows roll on next check.
    pub fn restore(&self, counters: Vec<QuotaCounter>) {
        let mut map = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        for counter in counters {
            map.insert((counter.provider_id.clone(), counter.tier), counter);
        }
    }

    /// Forget limits and counters of a provider.
    pub fn remove_provider(&self, provider_id: &str) {
        self.limits
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(provider_id);
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(p, _), _| p != provider_id);
    }
}

fn allowed(model_id: &str) -> QuotaDecision {
    QuotaDecision::Allowed {
        model_id: model_id.to_string(),
        substituted_from: None,
    }
}

#[async_trait]
impl ProviderRemovalHook for QuotaTracker {
    fn name(&self) -> &str {
        "quota"
    }

    async fn on_provider_removed(&self, provider_id: &str) -> Result<()> {
        self.remove_provider(provider_id);
        Ok(())
    }
}

/// Feed adapter usage events into the tracker until cancelled.
pub fn spawn_usage_listener(
    tracker: Arc<QuotaTracker>,
    mut events: broadcast::Receiver<UsageEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Drain queued events before honoring cancellation.
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => tracker.record_usage(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "usage listener lagged, token totals undercounted");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        debug!("usage listener stopped");
    })
}
